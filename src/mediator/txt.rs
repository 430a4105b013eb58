//! TXT 公共空间读取前的平台检查

use platform_trait::{CpuControl, PhysicalMemory};
use tracing::warn;

use super::region::{RegionReader, TXT_PUBLIC_REGION};
use super::AccessError;
use crate::utils::BitSlice;

const CPUID_VENDOR: u32 = 0;
const CPUID_MODEL: u32 = 1;
/// CPUID.1:ECX 的 SMX 位
const CPUID_MODEL_SMX_BIT: usize = 6;

pub const MSR_IA32_FEATURE_CONTROL: u32 = 0x3A;
/// SENTER 全局使能
const SENTER_GLOBAL_ENABLE_BIT: usize = 15;
/// SENTER 各子功能使能位 [8..15)
const SENTER_LEAF_ENABLES: std::ops::Range<usize> = 8..15;

pub const INTEL_VENDOR: &[u8; 12] = b"GenuineIntel";

/// 每次调用都重新检查：Intel CPU、支持 SMX、GETSEC SENTER 已启用
#[derive(Debug, Clone, Copy, Default)]
pub struct TxtGate;

impl TxtGate {
    pub fn check<P: CpuControl + ?Sized>(&self, platform: &P) -> Result<(), AccessError> {
        let id = platform.identify_cpu(CPUID_VENDOR, 0);
        let mut vendor = [0u8; 12];
        vendor[..4].copy_from_slice(&id.ebx.to_le_bytes());
        vendor[4..8].copy_from_slice(&id.edx.to_le_bytes());
        vendor[8..].copy_from_slice(&id.ecx.to_le_bytes());
        if &vendor != INTEL_VENDOR {
            warn!(vendor = %String::from_utf8_lossy(&vendor), "非 Intel CPU");
            return Err(AccessError::Unsupported(format!(
                "CPU 厂商 {:?} 不是 GenuineIntel",
                String::from_utf8_lossy(&vendor)
            )));
        }

        let model = platform.identify_cpu(CPUID_MODEL, 0);
        if !model.ecx.bit(CPUID_MODEL_SMX_BIT) {
            warn!("CPU 不支持 SMX");
            return Err(AccessError::Unsupported("CPU 不支持 SMX".to_string()));
        }

        let (lo, hi) = platform
            .read_register(MSR_IA32_FEATURE_CONTROL)
            .map_err(|e| AccessError::Unsupported(format!("无法读取 IA32_FEATURE_CONTROL: {}", e)))?;
        let feature_control = (u64::from(hi) << 32) | u64::from(lo);
        if !feature_control.bit(SENTER_GLOBAL_ENABLE_BIT)
            || feature_control.bit_range(SENTER_LEAF_ENABLES) == 0
        {
            warn!(
                feature_control = format_args!("{:#x}", feature_control),
                "SENTER 未启用"
            );
            return Err(AccessError::Unsupported(format!(
                "SENTER 未启用: IA32_FEATURE_CONTROL = {:#x}",
                feature_control
            )));
        }
        Ok(())
    }
}

/// 带平台检查的 TXT 公共空间读取器
#[derive(Debug, Clone, Copy)]
pub struct TxtReader {
    gate: TxtGate,
    reader: RegionReader,
}

impl Default for TxtReader {
    fn default() -> Self {
        Self {
            gate: TxtGate,
            reader: RegionReader::new(TXT_PUBLIC_REGION),
        }
    }
}

impl TxtReader {
    pub fn gate(&self) -> &TxtGate {
        &self.gate
    }

    pub fn read<P: CpuControl + PhysicalMemory + ?Sized>(
        &self,
        platform: &P,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, AccessError> {
        self.gate.check(platform)?;
        self.reader.read(platform, offset, buf)
    }
}
