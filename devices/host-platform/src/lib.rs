//! 主机平台后端
//!
//! 目前只有 Linux 实现：物理内存走 `/dev/mem`，MSR 走 `/dev/cpu/N/msr`，
//! PCI 配置空间走 `/sys/bus/pci/devices/*/config`。需要 root 权限，
//! MSR 读取还需要加载 `msr` 内核模块。

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::HostPlatform;

/// sysfs 中 PCI 设备目录，作为主机后端的“兄弟设备”名
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// 检查主机后端在当前系统上是否可用
pub fn is_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/dev/mem").exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// 解析 `/sys/devices/system/cpu/online` 形式的 CPU 列表，如 `0-3,6,8-9`
pub fn parse_cpu_list(list: &str) -> Option<u32> {
    let mut count = 0u32;
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().ok()?;
                let hi: u32 = hi.trim().parse().ok()?;
                if hi < lo {
                    return None;
                }
                count = count.checked_add((hi - lo).checked_add(1)?)?;
            }
            None => {
                part.trim().parse::<u32>().ok()?;
                count = count.checked_add(1)?;
            }
        }
    }
    Some(count)
}

/// sysfs 中某个 PCI 功能的目录名
pub fn sysfs_function_name(bus: u8, slot: u32) -> String {
    let device = slot & 0x1f;
    let function = (slot >> 5) & 0x7;
    format!("0000:{:02x}:{:02x}.{:x}", bus, device, function)
}
