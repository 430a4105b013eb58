//! 工具模块

pub mod bits;
pub mod hexdump;

pub use bits::BitSlice;
pub use hexdump::hexdump;
