//! 临时物理映射

use platform_trait::{MappingHandle, PhysicalMemory};

use super::AccessError;

/// 一次调用内有效的物理映射，离开作用域时解除映射
pub(crate) struct MappedWindow<'a, P: PhysicalMemory + ?Sized> {
    platform: &'a P,
    handle: MappingHandle,
}

impl<'a, P: PhysicalMemory + ?Sized> MappedWindow<'a, P> {
    /// 映射 `[phys, phys + len)`
    pub(crate) fn map(platform: &'a P, phys: u64, len: usize) -> Result<Self, AccessError> {
        let handle = platform
            .map_physical(phys, len)
            .ok_or(AccessError::NoMappingSpace { addr: phys, len })?;
        Ok(Self { platform, handle })
    }

    /// 从窗口内 `offset` 处复制 `dst.len()` 字节
    pub(crate) fn copy_to(&self, offset: usize, dst: &mut [u8]) -> Result<(), AccessError> {
        self.platform
            .copy_from_mapping(&self.handle, offset, dst)
            .map_err(|e| AccessError::CopyFault(e.to_string()))
    }
}

impl<P: PhysicalMemory + ?Sized> Drop for MappedWindow<'_, P> {
    fn drop(&mut self) {
        self.platform.unmap(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_platform::SimPlatform;

    #[test]
    fn test_window_unmaps_on_drop() {
        let sim = SimPlatform::builder().pattern_region(0x1000, 0x1000).build();
        {
            let window = MappedWindow::map(&sim, 0x1000, 0x1000).unwrap();
            let mut buf = [0u8; 4];
            window.copy_to(0x10, &mut buf).unwrap();
            assert_eq!(sim.live_mappings(), 1);
        }
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn test_window_unmaps_after_fault() {
        let sim = SimPlatform::builder().pattern_region(0x1000, 0x1000).build();
        let result = (|| {
            let window = MappedWindow::map(&sim, 0x1800, 0x1000)?;
            let mut buf = vec![0u8; 0x1000];
            window.copy_to(0, &mut buf)
        })();
        assert!(matches!(result, Err(AccessError::CopyFault(_))));
        assert_eq!(sim.live_mappings(), 0);
        assert_eq!(sim.total_mappings(), 1);
    }

    #[test]
    fn test_no_mapping_space() {
        let sim = SimPlatform::builder().max_mapping(0x1000).build();
        let result = MappedWindow::map(&sim, 0x1000, 0x2000);
        assert!(matches!(
            result,
            Err(AccessError::NoMappingSpace { addr: 0x1000, len: 0x2000 })
        ));
    }
}
