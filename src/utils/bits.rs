//! 寄存器位域读取

/// 整数的位读取操作
pub trait BitSlice {
    /// 读取第 `pos` 位（LSB 为 0），越界时 panic
    fn bit(&self, pos: usize) -> bool;

    /// 读取 `[start..end)` 位，越界或 start > end 时 panic
    fn bit_range(&self, range: std::ops::Range<usize>) -> u64;
}

macro_rules! impl_bit_slice {
    ($($ty:ty),*) => {$(
        impl BitSlice for $ty {
            #[inline(always)]
            fn bit(&self, pos: usize) -> bool {
                assert!(pos < <$ty>::BITS as usize, "Bit position out of bounds");
                (self >> pos) & 1 == 1
            }

            #[inline(always)]
            fn bit_range(&self, range: std::ops::Range<usize>) -> u64 {
                let width = <$ty>::BITS as usize;
                assert!(range.end <= width, "Bit range end out of bounds");
                assert!(range.start <= range.end, "Invalid bit range");
                if range.start == range.end {
                    return 0;
                }
                let len = range.end - range.start;
                let value = (*self as u64) >> range.start;
                if len == 64 { value } else { value & ((1u64 << len) - 1) }
            }
        }
    )*};
}

impl_bit_slice!(u32, u64);
