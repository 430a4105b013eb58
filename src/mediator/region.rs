//! 固定物理区域读取（平台闪存 / TXT 公共空间）
//!
//! 每次调用最多服务一页：偏移按区域大小回绕，复制长度截断到区域末尾和一页，
//! 映射窗口按页对齐，跨页时映射两页。

use platform_trait::{PhysicalMemory, PAGE_MASK, PAGE_SIZE};
use tracing::debug;

use super::mapping::MappedWindow;
use super::AccessError;

/// 编译期固定的物理区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub name: &'static str,
    pub base: u64,
    /// 必须是 2 的幂
    pub size: u64,
}

impl RegionDescriptor {
    #[inline(always)]
    pub const fn mask(&self) -> u64 {
        self.size - 1
    }

    /// 检查物理地址是否位于区域内
    #[inline(always)]
    pub fn contains(&self, phys: u64) -> bool {
        phys >= self.base && phys - self.base < self.size
    }
}

/// 平台 SPI 闪存的 BIOS 区域，映射在 4 GiB 以下 16 MiB
pub const FLASH_REGION: RegionDescriptor = RegionDescriptor {
    name: "bios_region",
    base: 0xFF00_0000,
    size: 0x100_0000,
};

/// TXT 公共空间
pub const TXT_PUBLIC_REGION: RegionDescriptor = RegionDescriptor {
    name: "public_space",
    base: 0xFED3_0000,
    size: 0x1_0000,
};

/// 一次区域读取需要的映射窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionWindow {
    /// 回绕后的区域内偏移
    pub offset: u64,
    /// 页对齐的物理基址
    pub page_base: u64,
    /// 数据在窗口内的起始偏移
    pub in_page: u64,
    pub copy_size: usize,
    /// 一页或两页
    pub map_size: usize,
}

impl RegionWindow {
    /// 窗口是否完整覆盖 `[page_base + in_page, page_base + in_page + copy_size)`
    pub fn covers_copy(&self) -> bool {
        self.in_page + self.copy_size as u64 <= self.map_size as u64
    }
}

/// 计算一次区域读取的窗口
///
/// 越界偏移不会被拒绝，而是按区域大小回绕。
pub fn compute_window(region: &RegionDescriptor, offset: u64, count: usize) -> RegionWindow {
    let offset = offset & region.mask();
    let phys = region.base + offset;
    let page_base = phys & PAGE_MASK;
    let in_page = phys & !PAGE_MASK;

    let copy_size = (count as u64).min(PAGE_SIZE).min(region.size - offset) as usize;

    let map_size = if in_page + copy_size as u64 > PAGE_SIZE {
        2 * PAGE_SIZE
    } else {
        PAGE_SIZE
    } as usize;

    RegionWindow {
        offset,
        page_base,
        in_page,
        copy_size,
        map_size,
    }
}

/// 区域读取器
#[derive(Debug, Clone, Copy)]
pub struct RegionReader {
    region: RegionDescriptor,
}

impl RegionReader {
    pub const fn new(region: RegionDescriptor) -> Self {
        Self { region }
    }

    pub fn region(&self) -> &RegionDescriptor {
        &self.region
    }

    /// 从区域偏移 `offset` 处读取至多 `buf.len()` 字节，返回实际复制的字节数
    pub fn read<P: PhysicalMemory + ?Sized>(
        &self,
        platform: &P,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, AccessError> {
        let window = compute_window(&self.region, offset, buf.len());
        debug!(
            region = self.region.name,
            offset = format_args!("{:#x}", window.offset),
            page_base = format_args!("{:#x}", window.page_base),
            copy_size = window.copy_size,
            map_size = window.map_size,
            "区域读取"
        );
        if window.copy_size == 0 {
            return Ok(0);
        }

        let mapped = MappedWindow::map(platform, window.page_base, window.map_size)?;
        mapped.copy_to(window.in_page as usize, &mut buf[..window.copy_size])?;
        Ok(window.copy_size)
    }
}
