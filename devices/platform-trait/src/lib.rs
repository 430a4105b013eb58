//! 平台原语 trait 定义
//!
//! 中介层只通过这里的 trait 访问硬件：物理地址映射、CPU 识别与 MSR 读取、
//! CPU 亲和性、PCI 总线接口以及执行优先级。具体实现见 `sim-platform`
//! （模拟平台）与 `host-platform`（Linux 主机）。

use std::sync::Arc;

use thiserror::Error;

/// 页大小
pub const PAGE_SIZE: u64 = 0x1000;
/// 页掩码，`addr & PAGE_MASK` 向下对齐到页
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// 平台错误类型
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("硬件访问异常: {0}")]
    Fault(String),
    #[error("平台不支持的操作: {0}")]
    Unsupported(String),
    #[error("平台资源不可用: {0}")]
    Unavailable(String),
}

/// 一次物理地址映射的句柄
///
/// `token` 由平台分配，只在 `map_physical` 与 `unmap` 之间有效。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingHandle {
    pub token: u64,
    pub phys: u64,
    pub len: usize,
}

/// 物理内存映射原语
pub trait PhysicalMemory: Send + Sync {
    /// 映射 `[phys, phys + len)`，没有可用的映射空间时返回 `None`
    fn map_physical(&self, phys: u64, len: usize) -> Option<MappingHandle>;

    /// 从映射内 `offset` 处复制 `dst.len()` 字节
    ///
    /// 访问到没有后备的物理内存时返回 `PlatformError::Fault`。
    fn copy_from_mapping(
        &self,
        mapping: &MappingHandle,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), PlatformError>;

    /// 释放映射
    fn unmap(&self, mapping: MappingHandle);
}

/// CPUID 结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// 被替换前的亲和性，由 `pin_to_cpu` 返回、交给 `restore_affinity`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affinity(pub u64);

/// CPU 相关原语
pub trait CpuControl: Send + Sync {
    /// 当前活动的逻辑 CPU 数
    fn active_cpu_count(&self) -> u32;

    /// 当前线程所在的逻辑 CPU
    fn current_cpu(&self) -> u32;

    /// 把当前线程固定到 `index`，返回之前的亲和性
    fn pin_to_cpu(&self, index: u32) -> Result<Affinity, PlatformError>;

    /// 恢复 `pin_to_cpu` 之前的亲和性
    fn restore_affinity(&self, previous: Affinity);

    /// 执行 CPUID
    fn identify_cpu(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    /// 在当前 CPU 上读取 MSR，返回 (低 32 位, 高 32 位)
    ///
    /// 无效或不支持的寄存器返回 `PlatformError::Fault`。
    fn read_register(&self, index: u32) -> Result<(u32, u32), PlatformError>;
}

/// 执行优先级（IRQL）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub u8);

impl Priority {
    pub const PASSIVE: Priority = Priority(0);
    pub const APC: Priority = Priority(1);
    pub const DISPATCH: Priority = Priority(2);
}

/// 接口标识：GUID 加版本号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceId {
    pub guid: &'static str,
    pub version: u16,
}

/// PCI 总线标准接口
pub const PCI_BUS_INTERFACE_STANDARD: InterfaceId = InterfaceId {
    guid: "496b8281-6f25-11d0-beaf-08002be2092f",
    version: 1,
};

/// 已打开的兄弟设备
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingHandle {
    pub name: String,
    pub token: u64,
}

/// PCI 配置空间访问回调表
pub trait PciConfigAccess: Send + Sync {
    /// 读取配置空间，返回实际传输的字节数
    ///
    /// `slot` 为设备号与功能号的打包值，读取长度为 `buffer.len()`。
    fn read_config(&self, bus: u8, slot: u32, buffer: &mut [u8], offset: u32) -> usize;

    /// 释放对接口的引用
    fn dereference(&self);
}

/// PCI 总线驱动相关原语
pub trait PciBus: Send + Sync {
    /// 按名称打开兄弟过滤设备
    fn open_sibling_device(&self, name: &str) -> Result<SiblingHandle, PlatformError>;

    /// 向已打开的设备查询接口
    fn query_interface(
        &self,
        handle: &SiblingHandle,
        interface: InterfaceId,
    ) -> Result<Arc<dyn PciConfigAccess>, PlatformError>;

    /// 把执行优先级提升到 `Priority::DISPATCH`
    ///
    /// 确实提升时返回原优先级，已处于该级别或更高时返回 `None`。
    fn raise_priority_ceiling(&self) -> Option<Priority>;

    /// 降回 `raise_priority_ceiling` 返回的优先级
    fn restore_priority(&self, previous: Priority);
}

/// 平台：全部原语的组合
pub trait Platform: PhysicalMemory + CpuControl + PciBus {
    /// 获取平台名称（用于日志）
    fn name(&self) -> &str {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_mask_rounds_down() {
        assert_eq!(0xFED3_0FFF & PAGE_MASK, 0xFED3_0000);
        assert_eq!(0xFED3_1000 & PAGE_MASK, 0xFED3_1000);
        assert_eq!(0x1234 & !PAGE_MASK, 0x234);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::PASSIVE < Priority::DISPATCH);
        assert!(Priority::APC < Priority::DISPATCH);
    }

    #[test]
    fn test_platform_error_display() {
        let err = PlatformError::Fault("rdmsr 0xdead".to_string());
        assert_eq!(format!("{err}"), "硬件访问异常: rdmsr 0xdead");
    }
}
