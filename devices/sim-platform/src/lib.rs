//! 模拟平台：用内存中的数据扮演物理内存、MSR、CPUID 与 PCI 配置空间
//!
//! 除了实现 `Platform` 的全部原语，还提供故障注入与观测计数，
//! 便于检查映射、亲和性、优先级是否在每条路径上都被释放或恢复。

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use platform_trait::{
    Affinity, CpuControl, CpuidResult, InterfaceId, MappingHandle, PciBus, PciConfigAccess,
    PhysicalMemory, Platform, PlatformError, Priority, SiblingHandle, PCI_BUS_INTERFACE_STANDARD,
};
use rustc_hash::FxHashMap;
use tracing::trace;

/// PCI 配置空间大小
pub const PCI_CONFIG_SPACE_SIZE: usize = 4096;

/// 默认的单次映射上限
const DEFAULT_MAX_MAPPING: usize = 32 * 1024 * 1024;

/// 默认的兄弟过滤设备名
pub const DEFAULT_FILTER_DEVICE: &str = r"\Device\hwgate_pci_flt";

thread_local! {
    /// 当前线程的亲和性掩码，全 1 表示未固定
    static THREAD_AFFINITY: Cell<u64> = const { Cell::new(u64::MAX) };
}

/// 模式填充区域使用的字节值
pub fn pattern_byte(phys: u64) -> u8 {
    (phys ^ (phys >> 8) ^ (phys >> 16) ^ (phys >> 24)) as u8
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 一段有后备数据的物理内存
#[derive(Debug, Clone)]
struct SimRegion {
    base: u64,
    data: Vec<u8>,
}

impl SimRegion {
    fn contains(&self, phys: u64, len: usize) -> bool {
        let end = self.base + self.data.len() as u64;
        phys >= self.base && phys.checked_add(len as u64).is_some_and(|e| e <= end)
    }
}

/// PCI 总线状态，由平台与已发放的接口共享
#[derive(Debug, Default)]
struct SimPciState {
    functions: FxHashMap<(u8, u8, u8), Vec<u8>>,
    priority: AtomicU8,
    observed: Mutex<Vec<Priority>>,
    config_reads: AtomicUsize,
    dereferences: AtomicUsize,
}

/// 模拟的 PCI 总线标准接口
struct SimPciAccess {
    state: Arc<SimPciState>,
}

impl PciConfigAccess for SimPciAccess {
    fn read_config(&self, bus: u8, slot: u32, buffer: &mut [u8], offset: u32) -> usize {
        let device = (slot & 0x1f) as u8;
        let function = ((slot >> 5) & 0x7) as u8;
        let current = Priority(self.state.priority.load(Ordering::SeqCst));
        lock(&self.state.observed).push(current);
        self.state.config_reads.fetch_add(1, Ordering::SeqCst);

        // 不存在的功能不传输任何数据
        let Some(config) = self.state.functions.get(&(bus, device, function)) else {
            return 0;
        };
        let start = offset as usize;
        if start >= config.len() {
            return 0;
        }
        let n = buffer.len().min(config.len() - start);
        buffer[..n].copy_from_slice(&config[start..start + n]);
        n
    }

    fn dereference(&self) {
        self.state.dereferences.fetch_add(1, Ordering::SeqCst);
    }
}

/// 模拟平台
#[derive(Debug)]
pub struct SimPlatform {
    name: String,
    regions: Vec<SimRegion>,
    max_mapping: usize,
    mappings: Mutex<FxHashMap<u64, MappingHandle>>,
    next_token: AtomicU64,
    total_mappings: AtomicUsize,
    cpu_count: u32,
    vendor: [u8; 12],
    smx: bool,
    msrs: FxHashMap<u32, u64>,
    cpu_msrs: FxHashMap<(u32, u32), u64>,
    msr_reads: AtomicUsize,
    filter_device: String,
    pci: Arc<SimPciState>,
    failing_acquisitions: AtomicUsize,
    acquire_attempts: AtomicUsize,
    acquire_delay: Option<Duration>,
}

impl SimPlatform {
    pub fn builder() -> SimPlatformBuilder {
        SimPlatformBuilder::default()
    }

    /// 让接下来 `n` 次接口获取失败
    pub fn fail_next_acquisitions(&self, n: usize) {
        self.failing_acquisitions.store(n, Ordering::SeqCst);
    }

    /// 尚未释放的映射数
    pub fn live_mappings(&self) -> usize {
        lock(&self.mappings).len()
    }

    /// 成功建立过的映射总数
    pub fn total_mappings(&self) -> usize {
        self.total_mappings.load(Ordering::SeqCst)
    }

    /// 执行过的 MSR 读取次数（含失败）
    pub fn msr_reads(&self) -> usize {
        self.msr_reads.load(Ordering::SeqCst)
    }

    /// 打开兄弟设备的尝试次数
    pub fn acquire_attempts(&self) -> usize {
        self.acquire_attempts.load(Ordering::SeqCst)
    }

    /// 接口被释放的次数
    pub fn dereferences(&self) -> usize {
        self.pci.dereferences.load(Ordering::SeqCst)
    }

    /// 配置空间回调被调用的次数
    pub fn config_reads(&self) -> usize {
        self.pci.config_reads.load(Ordering::SeqCst)
    }

    /// 当前执行优先级
    pub fn current_priority(&self) -> Priority {
        Priority(self.pci.priority.load(Ordering::SeqCst))
    }

    /// 设置当前执行优先级
    pub fn set_priority(&self, priority: Priority) {
        self.pci.priority.store(priority.0, Ordering::SeqCst);
    }

    /// 每次配置空间回调执行时观察到的优先级
    pub fn observed_priorities(&self) -> Vec<Priority> {
        lock(&self.pci.observed).clone()
    }

    /// 当前线程的亲和性掩码
    pub fn thread_affinity(&self) -> u64 {
        THREAD_AFFINITY.with(Cell::get)
    }

    /// 不经映射直接读取后备数据（测试比对用）
    pub fn peek(&self, phys: u64, len: usize) -> Option<Vec<u8>> {
        let region = self.regions.iter().find(|r| r.contains(phys, len))?;
        let start = (phys - region.base) as usize;
        Some(region.data[start..start + len].to_vec())
    }
}

impl PhysicalMemory for SimPlatform {
    fn map_physical(&self, phys: u64, len: usize) -> Option<MappingHandle> {
        if len == 0 || len > self.max_mapping || phys.checked_add(len as u64).is_none() {
            trace!(phys, len, "拒绝映射");
            return None;
        }
        let handle = MappingHandle {
            token: self.next_token.fetch_add(1, Ordering::SeqCst),
            phys,
            len,
        };
        lock(&self.mappings).insert(handle.token, handle);
        self.total_mappings.fetch_add(1, Ordering::SeqCst);
        Some(handle)
    }

    fn copy_from_mapping(
        &self,
        mapping: &MappingHandle,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), PlatformError> {
        if !lock(&self.mappings).contains_key(&mapping.token) {
            return Err(PlatformError::Fault(format!(
                "映射 {} 已失效",
                mapping.token
            )));
        }
        if offset + dst.len() > mapping.len {
            return Err(PlatformError::Fault(format!(
                "复制越过映射末尾: 偏移 {:#x}, 长度 {:#x}, 映射长度 {:#x}",
                offset,
                dst.len(),
                mapping.len
            )));
        }
        let phys = mapping.phys + offset as u64;
        let region = self
            .regions
            .iter()
            .find(|r| r.contains(phys, dst.len()))
            .ok_or_else(|| PlatformError::Fault(format!("无后备的物理地址: {:#x}", phys)))?;
        let start = (phys - region.base) as usize;
        dst.copy_from_slice(&region.data[start..start + dst.len()]);
        Ok(())
    }

    fn unmap(&self, mapping: MappingHandle) {
        lock(&self.mappings).remove(&mapping.token);
    }
}

impl CpuControl for SimPlatform {
    fn active_cpu_count(&self) -> u32 {
        self.cpu_count
    }

    fn current_cpu(&self) -> u32 {
        let mask = THREAD_AFFINITY.with(Cell::get);
        if mask.count_ones() == 1 {
            mask.trailing_zeros()
        } else {
            0
        }
    }

    fn pin_to_cpu(&self, index: u32) -> Result<Affinity, PlatformError> {
        if index >= 64 || index >= self.cpu_count {
            return Err(PlatformError::Unsupported(format!(
                "无法固定到 CPU {}",
                index
            )));
        }
        let previous = THREAD_AFFINITY.with(|a| a.replace(1 << index));
        Ok(Affinity(previous))
    }

    fn restore_affinity(&self, previous: Affinity) {
        THREAD_AFFINITY.with(|a| a.set(previous.0));
    }

    fn identify_cpu(&self, leaf: u32, _subleaf: u32) -> CpuidResult {
        let word = |i: usize| {
            u32::from_le_bytes([
                self.vendor[i],
                self.vendor[i + 1],
                self.vendor[i + 2],
                self.vendor[i + 3],
            ])
        };
        match leaf {
            // 厂商字符串按 EBX, EDX, ECX 排列
            0 => CpuidResult {
                eax: 1,
                ebx: word(0),
                edx: word(4),
                ecx: word(8),
            },
            1 => CpuidResult {
                ecx: if self.smx { 1 << 6 } else { 0 },
                ..CpuidResult::default()
            },
            _ => CpuidResult::default(),
        }
    }

    fn read_register(&self, index: u32) -> Result<(u32, u32), PlatformError> {
        self.msr_reads.fetch_add(1, Ordering::SeqCst);
        let cpu = self.current_cpu();
        let value = self
            .cpu_msrs
            .get(&(cpu, index))
            .or_else(|| self.msrs.get(&index))
            .copied()
            .ok_or_else(|| {
                PlatformError::Fault(format!("CPU {} 上不存在 MSR {:#x}", cpu, index))
            })?;
        Ok((value as u32, (value >> 32) as u32))
    }
}

impl PciBus for SimPlatform {
    fn open_sibling_device(&self, name: &str) -> Result<SiblingHandle, PlatformError> {
        let attempt = self.acquire_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.acquire_delay {
            std::thread::sleep(delay);
        }
        let failing = self
            .failing_acquisitions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PlatformError::Unavailable(format!("注入的打开失败: {}", name)));
        }
        if name != self.filter_device {
            return Err(PlatformError::Unavailable(format!("设备不存在: {}", name)));
        }
        Ok(SiblingHandle {
            name: name.to_string(),
            token: attempt as u64,
        })
    }

    fn query_interface(
        &self,
        handle: &SiblingHandle,
        interface: InterfaceId,
    ) -> Result<Arc<dyn PciConfigAccess>, PlatformError> {
        if interface != PCI_BUS_INTERFACE_STANDARD {
            return Err(PlatformError::Unsupported(format!(
                "{} 不提供接口 {}",
                handle.name, interface.guid
            )));
        }
        Ok(Arc::new(SimPciAccess {
            state: self.pci.clone(),
        }))
    }

    fn raise_priority_ceiling(&self) -> Option<Priority> {
        let previous = Priority(self.pci.priority.load(Ordering::SeqCst));
        if previous >= Priority::DISPATCH {
            return None;
        }
        self.pci.priority.store(Priority::DISPATCH.0, Ordering::SeqCst);
        Some(previous)
    }

    fn restore_priority(&self, previous: Priority) {
        self.pci.priority.store(previous.0, Ordering::SeqCst);
    }
}

impl Platform for SimPlatform {
    fn name(&self) -> &str {
        &self.name
    }
}

/// 模拟平台构造器
pub struct SimPlatformBuilder {
    name: String,
    regions: Vec<SimRegion>,
    max_mapping: usize,
    cpu_count: u32,
    vendor: [u8; 12],
    smx: bool,
    msrs: FxHashMap<u32, u64>,
    cpu_msrs: FxHashMap<(u32, u32), u64>,
    filter_device: String,
    functions: FxHashMap<(u8, u8, u8), Vec<u8>>,
    acquire_delay: Option<Duration>,
}

impl Default for SimPlatformBuilder {
    fn default() -> Self {
        Self {
            name: "sim".to_string(),
            regions: Vec::new(),
            max_mapping: DEFAULT_MAX_MAPPING,
            cpu_count: 1,
            vendor: *b"GenuineIntel",
            smx: false,
            msrs: FxHashMap::default(),
            cpu_msrs: FxHashMap::default(),
            filter_device: DEFAULT_FILTER_DEVICE.to_string(),
            functions: FxHashMap::default(),
            acquire_delay: None,
        }
    }
}

impl SimPlatformBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn cpus(mut self, count: u32) -> Self {
        self.cpu_count = count;
        self
    }

    /// 设置厂商字符串，不足 12 字节时以空格补齐
    pub fn vendor(mut self, vendor: &str) -> Self {
        let mut bytes = [b' '; 12];
        for (dst, src) in bytes.iter_mut().zip(vendor.bytes()) {
            *dst = src;
        }
        self.vendor = bytes;
        self
    }

    pub fn smx(mut self, supported: bool) -> Self {
        self.smx = supported;
        self
    }

    /// 所有 CPU 共享的 MSR 值
    pub fn msr(mut self, index: u32, value: u64) -> Self {
        self.msrs.insert(index, value);
        self
    }

    /// 仅在某个 CPU 上生效的 MSR 值
    pub fn cpu_msr(mut self, cpu: u32, index: u32, value: u64) -> Self {
        self.cpu_msrs.insert((cpu, index), value);
        self
    }

    /// 以给定数据作为 `[base, base + data.len())` 的内容
    pub fn region(mut self, base: u64, data: Vec<u8>) -> Self {
        self.regions.push(SimRegion { base, data });
        self
    }

    /// 以 `pattern_byte` 填充 `[base, base + size)`
    pub fn pattern_region(self, base: u64, size: usize) -> Self {
        let data = (0..size as u64).map(|i| pattern_byte(base + i)).collect();
        self.region(base, data)
    }

    pub fn max_mapping(mut self, len: usize) -> Self {
        self.max_mapping = len;
        self
    }

    pub fn filter_device(mut self, name: impl Into<String>) -> Self {
        self.filter_device = name.into();
        self
    }

    /// 添加一个 PCI 功能，`config` 不足 4 KiB 时补零
    pub fn pci_function(mut self, bus: u8, device: u8, function: u8, mut config: Vec<u8>) -> Self {
        config.resize(PCI_CONFIG_SPACE_SIZE, 0);
        self.functions.insert((bus, device, function), config);
        self
    }

    /// 打开兄弟设备时额外等待，用于制造并发竞争
    pub fn acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = Some(delay);
        self
    }

    pub fn build(self) -> SimPlatform {
        SimPlatform {
            name: self.name,
            regions: self.regions,
            max_mapping: self.max_mapping,
            mappings: Mutex::new(FxHashMap::default()),
            next_token: AtomicU64::new(1),
            total_mappings: AtomicUsize::new(0),
            cpu_count: self.cpu_count,
            vendor: self.vendor,
            smx: self.smx,
            msrs: self.msrs,
            cpu_msrs: self.cpu_msrs,
            msr_reads: AtomicUsize::new(0),
            filter_device: self.filter_device,
            pci: Arc::new(SimPciState {
                functions: self.functions,
                ..SimPciState::default()
            }),
            failing_acquisitions: AtomicUsize::new(0),
            acquire_attempts: AtomicUsize::new(0),
            acquire_delay: self.acquire_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_map_copy_unmap() {
        let sim = SimPlatform::builder().pattern_region(0x1000, 0x2000).build();
        let handle = sim.map_physical(0x1800, 0x100).unwrap();
        assert_eq!(sim.live_mappings(), 1);

        let mut buf = vec![0u8; 0x10];
        sim.copy_from_mapping(&handle, 8, &mut buf).unwrap();
        assert_eq!(buf, sim.peek(0x1808, 0x10).unwrap());

        sim.unmap(handle);
        assert_eq!(sim.live_mappings(), 0);
        assert!(sim.copy_from_mapping(&handle, 0, &mut buf).is_err());
    }

    #[test]
    fn test_sim_unbacked_memory_faults() {
        let sim = SimPlatform::builder().pattern_region(0x1000, 0x1000).build();
        let handle = sim.map_physical(0x1F00, 0x200).unwrap();
        let mut buf = vec![0u8; 0x200];
        let result = sim.copy_from_mapping(&handle, 0, &mut buf);
        assert!(matches!(result, Err(PlatformError::Fault(_))));
        sim.unmap(handle);
    }

    #[test]
    fn test_sim_vendor_layout() {
        let sim = SimPlatform::builder().vendor("GenuineIntel").build();
        let r = sim.identify_cpu(0, 0);
        let mut vendor = Vec::new();
        vendor.extend_from_slice(&r.ebx.to_le_bytes());
        vendor.extend_from_slice(&r.edx.to_le_bytes());
        vendor.extend_from_slice(&r.ecx.to_le_bytes());
        assert_eq!(vendor, b"GenuineIntel");
    }

    #[test]
    fn test_sim_per_cpu_msr() {
        let sim = SimPlatform::builder()
            .cpus(2)
            .msr(0x10, 1)
            .cpu_msr(1, 0x10, 0x1_0000_0002)
            .build();
        assert_eq!(sim.read_register(0x10).unwrap(), (1, 0));
        let previous = sim.pin_to_cpu(1).unwrap();
        assert_eq!(sim.read_register(0x10).unwrap(), (2, 1));
        sim.restore_affinity(previous);
        assert_eq!(sim.thread_affinity(), u64::MAX);
        assert!(sim.read_register(0x11).is_err());
    }

    #[test]
    fn test_sim_failed_acquisition_injection() {
        let sim = SimPlatform::builder().build();
        sim.fail_next_acquisitions(1);
        assert!(sim.open_sibling_device(DEFAULT_FILTER_DEVICE).is_err());
        assert!(sim.open_sibling_device(DEFAULT_FILTER_DEVICE).is_ok());
        assert_eq!(sim.acquire_attempts(), 2);
    }

    #[test]
    fn test_sim_absent_function_transfers_nothing() {
        let sim = SimPlatform::builder().pci_function(0, 2, 0, vec![0x86, 0x80]).build();
        let handle = sim.open_sibling_device(DEFAULT_FILTER_DEVICE).unwrap();
        let access = sim.query_interface(&handle, PCI_BUS_INTERFACE_STANDARD).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(access.read_config(0, 2, &mut buf, 0), 2);
        assert_eq!(buf, [0x86, 0x80]);
        assert_eq!(access.read_config(0, 3, &mut buf, 0), 0);
    }
}
