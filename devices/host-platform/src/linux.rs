//! Linux 主机平台实现

use std::cell::Cell;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use platform_trait::{
    Affinity, CpuControl, CpuidResult, InterfaceId, MappingHandle, PciBus, PciConfigAccess,
    PhysicalMemory, Platform, PlatformError, Priority, SiblingHandle, PCI_BUS_INTERFACE_STANDARD,
};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::{parse_cpu_list, sysfs_function_name};

const DEV_MEM: &str = "/dev/mem";
const CPU_ONLINE: &str = "/sys/devices/system/cpu/online";

/// 未固定时的亲和性标记
const UNPINNED: u64 = u64::MAX;

thread_local! {
    /// 当前线程选定的 CPU，MSR 读取走该 CPU 的设备节点
    static PINNED_CPU: Cell<u64> = const { Cell::new(UNPINNED) };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 通过 sysfs 读取配置空间的总线接口
struct SysfsPciAccess {
    root: PathBuf,
}

impl PciConfigAccess for SysfsPciAccess {
    fn read_config(&self, bus: u8, slot: u32, buffer: &mut [u8], offset: u32) -> usize {
        let path = self.root.join(sysfs_function_name(bus, slot)).join("config");
        let Ok(file) = File::open(&path) else {
            return 0;
        };
        // 非 root 用户只能读到前 64 字节，返回实际读到的长度
        let mut done = 0;
        while done < buffer.len() {
            match file.read_at(&mut buffer[done..], offset as u64 + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "读取配置空间失败");
                    break;
                }
            }
        }
        done
    }

    fn dereference(&self) {}
}

/// Linux 主机平台
pub struct HostPlatform {
    mappings: Mutex<FxHashMap<u64, (MappingHandle, File)>>,
    next_token: AtomicU64,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self {
            mappings: Mutex::new(FxHashMap::default()),
            next_token: AtomicU64::new(1),
        }
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalMemory for HostPlatform {
    fn map_physical(&self, phys: u64, len: usize) -> Option<MappingHandle> {
        if len == 0 || phys.checked_add(len as u64).is_none() {
            return None;
        }
        let file = match File::open(DEV_MEM) {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "无法打开 {}", DEV_MEM);
                return None;
            }
        };
        let handle = MappingHandle {
            token: self.next_token.fetch_add(1, Ordering::SeqCst),
            phys,
            len,
        };
        lock(&self.mappings).insert(handle.token, (handle, file));
        Some(handle)
    }

    fn copy_from_mapping(
        &self,
        mapping: &MappingHandle,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), PlatformError> {
        if offset + dst.len() > mapping.len {
            return Err(PlatformError::Fault(format!(
                "复制越过映射末尾: 偏移 {:#x}, 长度 {:#x}",
                offset,
                dst.len()
            )));
        }
        let mappings = lock(&self.mappings);
        let (_, file) = mappings
            .get(&mapping.token)
            .ok_or_else(|| PlatformError::Fault(format!("映射 {} 已失效", mapping.token)))?;
        let phys = mapping.phys + offset as u64;
        file.read_exact_at(dst, phys)
            .map_err(|e| PlatformError::Fault(format!("读取物理地址 {:#x} 失败: {}", phys, e)))
    }

    fn unmap(&self, mapping: MappingHandle) {
        lock(&self.mappings).remove(&mapping.token);
    }
}

impl CpuControl for HostPlatform {
    fn active_cpu_count(&self) -> u32 {
        std::fs::read_to_string(CPU_ONLINE)
            .ok()
            .and_then(|list| parse_cpu_list(&list))
            .or_else(|| {
                std::thread::available_parallelism()
                    .ok()
                    .map(|n| n.get() as u32)
            })
            .unwrap_or(1)
    }

    fn current_cpu(&self) -> u32 {
        match PINNED_CPU.with(Cell::get) {
            UNPINNED => 0,
            cpu => cpu as u32,
        }
    }

    fn pin_to_cpu(&self, index: u32) -> Result<Affinity, PlatformError> {
        let node = format!("/dev/cpu/{}/msr", index);
        if !Path::new(&node).exists() {
            return Err(PlatformError::Unavailable(format!("{} 不存在", node)));
        }
        let previous = PINNED_CPU.with(|c| c.replace(u64::from(index)));
        Ok(Affinity(previous))
    }

    fn restore_affinity(&self, previous: Affinity) {
        PINNED_CPU.with(|c| c.set(previous.0));
    }

    #[allow(unused_unsafe)]
    fn identify_cpu(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: x86_64 上 CPUID 总是可用
            let r = unsafe { std::arch::x86_64::__cpuid_count(leaf, subleaf) };
            CpuidResult {
                eax: r.eax,
                ebx: r.ebx,
                ecx: r.ecx,
                edx: r.edx,
            }
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = (leaf, subleaf);
            CpuidResult::default()
        }
    }

    fn read_register(&self, index: u32) -> Result<(u32, u32), PlatformError> {
        let node = format!("/dev/cpu/{}/msr", self.current_cpu());
        let file = File::open(&node)
            .map_err(|e| PlatformError::Unavailable(format!("无法打开 {}: {}", node, e)))?;
        let mut raw = [0u8; 8];
        // 读取无效 MSR 时内核返回 EIO
        file.read_exact_at(&mut raw, u64::from(index))
            .map_err(|e| PlatformError::Fault(format!("rdmsr {:#x} 失败: {}", index, e)))?;
        let value = u64::from_le_bytes(raw);
        Ok((value as u32, (value >> 32) as u32))
    }
}

impl PciBus for HostPlatform {
    fn open_sibling_device(&self, name: &str) -> Result<SiblingHandle, PlatformError> {
        if !Path::new(name).is_dir() {
            return Err(PlatformError::Unavailable(format!("{} 不是目录", name)));
        }
        Ok(SiblingHandle {
            name: name.to_string(),
            token: 0,
        })
    }

    fn query_interface(
        &self,
        handle: &SiblingHandle,
        interface: InterfaceId,
    ) -> Result<Arc<dyn PciConfigAccess>, PlatformError> {
        if interface != PCI_BUS_INTERFACE_STANDARD {
            return Err(PlatformError::Unsupported(format!(
                "sysfs 不提供接口 {}",
                interface.guid
            )));
        }
        Ok(Arc::new(SysfsPciAccess {
            root: PathBuf::from(&handle.name),
        }))
    }

    // 用户态没有可提升的执行优先级
    fn raise_priority_ceiling(&self) -> Option<Priority> {
        None
    }

    fn restore_priority(&self, _previous: Priority) {}
}

impl Platform for HostPlatform {
    fn name(&self) -> &str {
        "host"
    }
}
