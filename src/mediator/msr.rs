//! 按逻辑 CPU 读取 MSR

use platform_trait::{Affinity, CpuControl};
use tracing::{debug, warn};

use super::AccessError;

/// 暴露内核位置的 MSR，一律拒绝读取
pub const DENIED_MSRS: [u32; 6] = [
    // AMD syscall / sysret
    0xC000_0081, // STAR
    0xC000_0082, // LSTAR
    0xC000_0083, // CSTAR
    // Intel sysenter / sysexit
    0x174, // IA32_SYSENTER_CS
    0x175, // IA32_SYSENTER_ESP
    0x176, // IA32_SYSENTER_EIP
];

#[inline(always)]
pub fn is_msr_allowed(index: u32) -> bool {
    !DENIED_MSRS.contains(&index)
}

/// MSR 读取结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsrValue {
    pub eax: u32,
    pub edx: u32,
}

impl MsrValue {
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.edx) << 32) | u64::from(self.eax)
    }

    /// `[eax 小端][edx 小端]`
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.eax.to_le_bytes());
        out[4..].copy_from_slice(&self.edx.to_le_bytes());
        out
    }
}

/// 固定到某个 CPU 期间持有，离开作用域时恢复原亲和性
struct AffinityGuard<'a, P: CpuControl + ?Sized> {
    platform: &'a P,
    previous: Affinity,
}

impl<'a, P: CpuControl + ?Sized> AffinityGuard<'a, P> {
    fn pin(platform: &'a P, cpu: u32) -> Result<Self, AccessError> {
        let previous = platform
            .pin_to_cpu(cpu)
            .map_err(|e| AccessError::Unsupported(format!("无法固定到 CPU {}: {}", cpu, e)))?;
        Ok(Self { platform, previous })
    }
}

impl<P: CpuControl + ?Sized> Drop for AffinityGuard<'_, P> {
    fn drop(&mut self) {
        self.platform.restore_affinity(self.previous);
    }
}

/// MSR 读取器
#[derive(Debug, Clone, Copy, Default)]
pub struct MsrReader;

impl MsrReader {
    /// 在逻辑 CPU `cpu` 上读取 `register`
    pub fn read<P: CpuControl + ?Sized>(
        &self,
        platform: &P,
        cpu: u32,
        register: u32,
    ) -> Result<MsrValue, AccessError> {
        let active = platform.active_cpu_count();
        if cpu >= active {
            return Err(AccessError::InvalidCpu { cpu, active });
        }

        let _pinned = AffinityGuard::pin(platform, cpu)?;

        if !is_msr_allowed(register) {
            warn!(cpu, register = format_args!("{:#x}", register), "拒绝读取受保护的 MSR");
            return Err(AccessError::Denied(register));
        }

        let (eax, edx) = platform
            .read_register(register)
            .map_err(|e| AccessError::FaultDuringRead {
                index: register,
                reason: e.to_string(),
            })?;
        debug!(cpu, register = format_args!("{:#x}", register), eax, edx, "MSR 读取");
        Ok(MsrValue { eax, edx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_platform::SimPlatform;

    fn platform() -> SimPlatform {
        let mut builder = SimPlatform::builder().cpus(4).msr(0x10, 0x0000_0012_3456_789A);
        for index in DENIED_MSRS {
            builder = builder.msr(index, 0xFFFF_FFFF_8100_0000);
        }
        builder.cpu_msr(2, 0x1B, 0xFEE0_0900).build()
    }

    #[test]
    fn test_msr_value_bytes() {
        let v = MsrValue {
            eax: 0x1122_3344,
            edx: 0x5566_7788,
        };
        assert_eq!(v.to_bytes(), [0x44, 0x33, 0x22, 0x11, 0x88, 0x77, 0x66, 0x55]);
        assert_eq!(v.as_u64(), 0x5566_7788_1122_3344);
    }

    #[test]
    fn test_policy_denies_exactly_six() {
        for index in DENIED_MSRS {
            assert!(!is_msr_allowed(index));
        }
        for index in [0u32, 0x10, 0x1B, 0x3A, 0x173, 0x177, 0xC000_0080, 0xC000_0084, u32::MAX] {
            assert!(is_msr_allowed(index));
        }
    }

    #[test]
    fn test_denied_on_every_cpu_without_reading() {
        let sim = platform();
        for cpu in 0..4 {
            for index in DENIED_MSRS {
                assert_eq!(MsrReader.read(&sim, cpu, index), Err(AccessError::Denied(index)));
            }
        }
        assert_eq!(sim.msr_reads(), 0);
        assert_eq!(sim.thread_affinity(), u64::MAX);
    }

    #[test]
    fn test_invalid_cpu_boundary() {
        let sim = platform();
        assert_eq!(
            MsrReader.read(&sim, 4, 0x10),
            Err(AccessError::InvalidCpu { cpu: 4, active: 4 })
        );
        assert!(matches!(
            MsrReader.read(&sim, u32::MAX, 0x10),
            Err(AccessError::InvalidCpu { .. })
        ));
        assert!(MsrReader.read(&sim, 3, 0x10).is_ok());
        assert_eq!(sim.msr_reads(), 1);
    }

    #[test]
    fn test_read_runs_on_requested_cpu() {
        let sim = platform();
        let v = MsrReader.read(&sim, 2, 0x1B).unwrap();
        assert_eq!(v.as_u64(), 0xFEE0_0900);
        // 其他 CPU 上没有该值
        assert!(matches!(
            MsrReader.read(&sim, 1, 0x1B),
            Err(AccessError::FaultDuringRead { index: 0x1B, .. })
        ));
        assert_eq!(sim.thread_affinity(), u64::MAX);
    }

    #[test]
    fn test_fault_restores_affinity() {
        let sim = platform();
        let result = MsrReader.read(&sim, 1, 0xDEAD);
        assert!(matches!(result, Err(AccessError::FaultDuringRead { .. })));
        assert_eq!(sim.thread_affinity(), u64::MAX);
    }

    #[test]
    fn test_value_split_into_halves() {
        let sim = platform();
        let v = MsrReader.read(&sim, 0, 0x10).unwrap();
        assert_eq!(v.eax, 0x3456_789A);
        assert_eq!(v.edx, 0x12);
    }
}
