//! 任意物理地址读取

use platform_trait::PhysicalMemory;
use tracing::debug;

use super::mapping::MappedWindow;
use super::AccessError;

/// 物理内存读取器
///
/// 调用方给出精确的物理地址与长度，一次性映射整段后复制，
/// 分页与对齐全部交给平台的映射原语。
#[derive(Debug, Clone, Copy, Default)]
pub struct PhysReader;

impl PhysReader {
    /// 从 `address` 读取 `buf.len()` 字节
    pub fn read<P: PhysicalMemory + ?Sized>(
        &self,
        platform: &P,
        address: u64,
        buf: &mut [u8],
    ) -> Result<usize, AccessError> {
        if buf.is_empty() {
            return Err(AccessError::InvalidParameter("读取长度为 0".to_string()));
        }
        if address.checked_add(buf.len() as u64).is_none() {
            return Err(AccessError::OutOfRange {
                offset: address,
                length: buf.len() as u64,
                limit: u64::MAX,
            });
        }
        debug!(
            address = format_args!("{:#x}", address),
            len = buf.len(),
            "物理内存读取"
        );

        let mapped = MappedWindow::map(platform, address, buf.len())?;
        mapped.copy_to(0, buf)?;
        Ok(buf.len())
    }
}
