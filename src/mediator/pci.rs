//! PCI 配置空间读取
//!
//! 总线接口在第一次请求时通过兄弟过滤设备获取并缓存，之后的请求共享同一个接口。
//! 获取失败不会被记住为永久失败，下一次请求重新获取。

use std::sync::{Arc, Mutex, MutexGuard};

use platform_trait::{PciBus, PciConfigAccess, Priority, SiblingHandle, PCI_BUS_INTERFACE_STANDARD};
use tracing::{debug, info, warn};

use super::AccessError;

/// 配置空间上限，偏移加长度不得超过该值
pub const PCI_CONFIG_SPACE_LIMIT: u32 = 4096;

const MAX_DEVICE: u8 = 31;
const MAX_FUNCTION: u8 = 7;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 一次配置空间读取的位置与长度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciLocation {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub offset: u32,
    pub length: u32,
}

impl PciLocation {
    pub fn validate(&self) -> Result<(), AccessError> {
        let end = u64::from(self.offset) + u64::from(self.length);
        if end > u64::from(PCI_CONFIG_SPACE_LIMIT) {
            return Err(AccessError::OutOfRange {
                offset: u64::from(self.offset),
                length: u64::from(self.length),
                limit: u64::from(PCI_CONFIG_SPACE_LIMIT),
            });
        }
        if self.device > MAX_DEVICE || self.function > MAX_FUNCTION {
            return Err(AccessError::InvalidParameter(format!(
                "设备号 {} 或功能号 {} 超出范围",
                self.device, self.function
            )));
        }
        if self.length == 0 {
            return Err(AccessError::InvalidParameter("读取长度为 0".to_string()));
        }
        Ok(())
    }

    /// PCI_SLOT_NUMBER：低 5 位设备号，其上 3 位功能号
    #[inline(always)]
    pub fn slot(&self) -> u32 {
        u32::from(self.device & 0x1f) | (u32::from(self.function & 0x7) << 5)
    }
}

/// 已获取的总线接口
pub struct BusInterface {
    sibling: SiblingHandle,
    access: Arc<dyn PciConfigAccess>,
}

impl BusInterface {
    pub fn sibling(&self) -> &SiblingHandle {
        &self.sibling
    }
}

/// 总线接口缓存的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusInterfaceState {
    Uninitialized,
    Acquired,
    AcquisitionFailed,
}

enum CacheSlot {
    Uninitialized,
    Acquired(Arc<BusInterface>),
    AcquisitionFailed,
}

/// 惰性获取、进程内共享的总线接口
///
/// 获取过程在锁内完成，并发的首次请求只会获取一次。
pub struct BusInterfaceCache {
    filter_device: String,
    slot: Mutex<CacheSlot>,
}

impl BusInterfaceCache {
    pub fn new(filter_device: impl Into<String>) -> Self {
        Self {
            filter_device: filter_device.into(),
            slot: Mutex::new(CacheSlot::Uninitialized),
        }
    }

    pub fn state(&self) -> BusInterfaceState {
        match *lock(&self.slot) {
            CacheSlot::Uninitialized => BusInterfaceState::Uninitialized,
            CacheSlot::Acquired(_) => BusInterfaceState::Acquired,
            CacheSlot::AcquisitionFailed => BusInterfaceState::AcquisitionFailed,
        }
    }

    /// 返回已缓存的接口，没有时获取
    pub fn acquire_or_get<P: PciBus + ?Sized>(
        &self,
        platform: &P,
    ) -> Result<Arc<BusInterface>, AccessError> {
        let mut slot = lock(&self.slot);
        if let CacheSlot::Acquired(iface) = &*slot {
            return Ok(iface.clone());
        }

        match self.acquire(platform) {
            Ok(iface) => {
                info!(device = %self.filter_device, "已获取 PCI 总线接口");
                let iface = Arc::new(iface);
                *slot = CacheSlot::Acquired(iface.clone());
                Ok(iface)
            }
            Err(e) => {
                warn!(device = %self.filter_device, error = %e, "获取 PCI 总线接口失败");
                *slot = CacheSlot::AcquisitionFailed;
                Err(e)
            }
        }
    }

    fn acquire<P: PciBus + ?Sized>(&self, platform: &P) -> Result<BusInterface, AccessError> {
        let sibling = platform
            .open_sibling_device(&self.filter_device)
            .map_err(|e| AccessError::NoBusInterface(e.to_string()))?;
        let access = platform
            .query_interface(&sibling, PCI_BUS_INTERFACE_STANDARD)
            .map_err(|e| AccessError::NoBusInterface(e.to_string()))?;
        Ok(BusInterface { sibling, access })
    }

    /// 释放接口并回到未初始化状态，返回之前是否持有接口
    pub fn release(&self) -> bool {
        let previous = std::mem::replace(&mut *lock(&self.slot), CacheSlot::Uninitialized);
        match previous {
            CacheSlot::Acquired(iface) => {
                iface.access.dereference();
                info!(device = %self.filter_device, "已释放 PCI 总线接口");
                true
            }
            _ => false,
        }
    }
}

/// 调用总线回调期间把执行优先级提升到 DISPATCH，离开作用域时恢复
struct PriorityGuard<'a, P: PciBus + ?Sized> {
    platform: &'a P,
    previous: Option<Priority>,
}

impl<'a, P: PciBus + ?Sized> PriorityGuard<'a, P> {
    fn raise(platform: &'a P) -> Self {
        let previous = platform.raise_priority_ceiling();
        Self { platform, previous }
    }
}

impl<P: PciBus + ?Sized> Drop for PriorityGuard<'_, P> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous {
            self.platform.restore_priority(previous);
        }
    }
}

/// PCI 配置空间读取器
pub struct PciReader {
    cache: BusInterfaceCache,
}

impl PciReader {
    pub fn new(filter_device: impl Into<String>) -> Self {
        Self {
            cache: BusInterfaceCache::new(filter_device),
        }
    }

    pub fn cache(&self) -> &BusInterfaceCache {
        &self.cache
    }

    /// 读取 `location.length` 字节到 `buf` 开头
    pub fn read<P: PciBus + ?Sized>(
        &self,
        platform: &P,
        location: &PciLocation,
        buf: &mut [u8],
    ) -> Result<usize, AccessError> {
        location.validate()?;
        let requested = location.length as usize;
        if buf.len() < requested {
            return Err(AccessError::BufferTooSmall {
                needed: requested,
                actual: buf.len(),
            });
        }

        let iface = self.cache.acquire_or_get(platform)?;
        let transferred = {
            let _ceiling = PriorityGuard::raise(platform);
            iface.access.read_config(
                location.bus,
                location.slot(),
                &mut buf[..requested],
                location.offset,
            )
        };
        debug!(
            bus = location.bus,
            device = location.device,
            function = location.function,
            offset = location.offset,
            requested,
            transferred,
            "PCI 配置空间读取"
        );

        if transferred != requested {
            return Err(AccessError::PartialTransfer {
                requested,
                transferred,
            });
        }
        Ok(transferred)
    }
}
