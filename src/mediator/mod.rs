//! 硬件访问中介
//!
//! `Gate` 持有平台实现与各个读取器，是所有请求的唯一入口。每个请求都会留下一条审计记录。

mod audit;
mod error;
mod mapping;
pub mod msr;
pub mod pci;
pub mod phys;
pub mod region;
pub mod txt;

use std::sync::{Arc, Mutex, MutexGuard};

use platform_trait::Platform;
use tracing::debug;

pub use audit::{AuditEntry, AuditLog, RequestKind};
pub use error::AccessError;
pub use msr::{MsrReader, MsrValue};
pub use pci::{BusInterfaceState, PciLocation, PciReader};
pub use phys::PhysReader;
pub use region::{RegionDescriptor, RegionReader, FLASH_REGION, TXT_PUBLIC_REGION};
pub use txt::{TxtGate, TxtReader};

use crate::dispatch::Status;

/// 过滤设备的默认名字
pub const DEFAULT_FILTER_DEVICE: &str = r"\Device\hwgate_pci_flt";

/// 默认保留的审计记录条数
pub const DEFAULT_HISTORY_SIZE: usize = 64;

/// 构造 `Gate` 的选项
#[derive(Debug, Clone)]
pub struct GateOptions {
    pub filter_device: String,
    pub history_size: usize,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            filter_device: DEFAULT_FILTER_DEVICE.to_string(),
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

pub struct Gate {
    platform: Arc<dyn Platform>,
    flash: RegionReader,
    txt: TxtReader,
    phys: PhysReader,
    msr: MsrReader,
    pci: PciReader,
    audit: Mutex<AuditLog>,
}

impl Gate {
    pub fn new(platform: Arc<dyn Platform>, options: GateOptions) -> Self {
        debug!(
            platform = platform.name(),
            filter_device = %options.filter_device,
            history_size = options.history_size,
            "创建访问中介"
        );
        Self {
            platform,
            flash: RegionReader::new(FLASH_REGION),
            txt: TxtReader::default(),
            phys: PhysReader,
            msr: MsrReader,
            pci: PciReader::new(options.filter_device),
            audit: Mutex::new(AuditLog::new(options.history_size)),
        }
    }

    pub fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    /// 闪存区域读取，每次至多一页
    pub fn read_flash(&self, offset: u64, buf: &mut [u8]) -> Result<usize, AccessError> {
        let result = self.flash.read(&*self.platform, offset, buf);
        self.record(RequestKind::Flash, result, |n| *n)
    }

    /// TXT 公共空间读取，每次都先检查平台
    pub fn read_txt_public(&self, offset: u64, buf: &mut [u8]) -> Result<usize, AccessError> {
        let result = self.txt.read(&*self.platform, offset, buf);
        self.record(RequestKind::TxtPublic, result, |n| *n)
    }

    pub fn read_physical(&self, address: u64, buf: &mut [u8]) -> Result<usize, AccessError> {
        let result = self.phys.read(&*self.platform, address, buf);
        self.record(RequestKind::Physical, result, |n| *n)
    }

    /// 整个闪存区域读入 `buf` 开头
    pub fn flash_image(&self, buf: &mut [u8]) -> Result<usize, AccessError> {
        let result = self.region_image(&FLASH_REGION, buf);
        self.record(RequestKind::Flash, result, |n| *n)
    }

    /// 整个 TXT 公共空间读入 `buf` 开头
    pub fn txt_public_image(&self, buf: &mut [u8]) -> Result<usize, AccessError> {
        let result = self
            .txt
            .gate()
            .check(&*self.platform)
            .and_then(|_| self.region_image(&TXT_PUBLIC_REGION, buf));
        self.record(RequestKind::TxtPublic, result, |n| *n)
    }

    fn region_image(&self, region: &RegionDescriptor, buf: &mut [u8]) -> Result<usize, AccessError> {
        let size = region.size as usize;
        if buf.len() < size {
            return Err(AccessError::BufferTooSmall {
                needed: size,
                actual: buf.len(),
            });
        }
        self.phys.read(&*self.platform, region.base, &mut buf[..size])
    }

    pub fn read_msr(&self, cpu: u32, register: u32) -> Result<MsrValue, AccessError> {
        let result = self.msr.read(&*self.platform, cpu, register);
        self.record(RequestKind::Msr, result, |_| 8)
    }

    pub fn read_pci(&self, location: &PciLocation, buf: &mut [u8]) -> Result<usize, AccessError> {
        let result = self.pci.read(&*self.platform, location, buf);
        self.record(RequestKind::Pci, result, |n| *n)
    }

    pub fn pci_interface_state(&self) -> BusInterfaceState {
        self.pci.cache().state()
    }

    /// 释放总线接口，可重复调用
    pub fn shutdown(&self) {
        self.pci.cache().release();
    }

    /// 取出审计记录，从旧到新
    pub fn recent_requests(&self) -> Vec<AuditEntry> {
        self.audit_log().drain()
    }

    fn audit_log(&self) -> MutexGuard<'_, AuditLog> {
        self.audit.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record<T>(
        &self,
        kind: RequestKind,
        result: Result<T, AccessError>,
        transferred: impl Fn(&T) -> usize,
    ) -> Result<T, AccessError> {
        let entry = match &result {
            Ok(value) => AuditEntry {
                kind,
                status: Status::Success.code(),
                transferred: transferred(value),
            },
            Err(e) => AuditEntry {
                kind,
                status: Status::from(e).code(),
                transferred: 0,
            },
        };
        self.audit_log().record(entry);
        result
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use platform_trait::PAGE_SIZE;
    use sim_platform::SimPlatform;

    /// 支持 TXT 的四核模拟平台，闪存与 TXT 公共空间均已填充
    pub(crate) fn txt_platform() -> SimPlatform {
        SimPlatform::builder()
            .cpus(4)
            .vendor("GenuineIntel")
            .smx(true)
            .msr(txt::MSR_IA32_FEATURE_CONTROL, 0xFF07)
            .msr(0x10, 0x0000_0001_0000_0002)
            .pattern_region(FLASH_REGION.base, FLASH_REGION.size as usize)
            .pattern_region(TXT_PUBLIC_REGION.base, TXT_PUBLIC_REGION.size as usize)
            .pci_function(0, 31, 0, vec![0x86, 0x80, 0x84, 0xA3])
            .build()
    }

    pub(crate) fn gate_on(sim: SimPlatform) -> (Arc<SimPlatform>, Gate) {
        let sim = Arc::new(sim);
        let gate = Gate::new(sim.clone(), GateOptions::default());
        (sim, gate)
    }

    #[test]
    fn test_gate_flash_read_is_one_page_at_most() {
        let (sim, gate) = gate_on(txt_platform());
        let mut buf = vec![0u8; PAGE_SIZE as usize * 2];
        let n = gate.read_flash(0x10, &mut buf).unwrap();
        assert_eq!(n, PAGE_SIZE as usize);
        assert_eq!(buf[..n].to_vec(), sim.peek(FLASH_REGION.base + 0x10, n).unwrap());
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn test_gate_records_every_request() {
        let (_sim, gate) = gate_on(txt_platform());
        let mut buf = [0u8; 4];
        gate.read_txt_public(0, &mut buf).unwrap();
        assert!(gate.read_msr(0, 0x176).is_err());
        gate.read_msr(1, 0x10).unwrap();
        let location = PciLocation {
            bus: 0,
            device: 31,
            function: 0,
            offset: 0,
            length: 4,
        };
        gate.read_pci(&location, &mut buf).unwrap();

        let log = gate.recent_requests();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0].kind, RequestKind::TxtPublic);
        assert_eq!(log[0].transferred, 4);
        assert_eq!(log[1].kind, RequestKind::Msr);
        assert!(!log[1].succeeded());
        assert_eq!(log[1].transferred, 0);
        assert_eq!(log[2].transferred, 8);
        assert_eq!(log[3].kind, RequestKind::Pci);
        assert!(gate.recent_requests().is_empty());
    }

    #[test]
    fn test_gate_history_is_bounded() {
        let sim = Arc::new(txt_platform());
        let gate = Gate::new(
            sim,
            GateOptions {
                history_size: 2,
                ..GateOptions::default()
            },
        );
        let mut buf = [0u8; 1];
        for offset in 0..5 {
            gate.read_flash(offset, &mut buf).unwrap();
        }
        assert_eq!(gate.recent_requests().len(), 2);
    }

    #[test]
    fn test_txt_image_checks_platform_first() {
        let (sim, gate) = gate_on(txt_platform());
        let mut image = vec![0u8; TXT_PUBLIC_REGION.size as usize];
        assert_eq!(gate.txt_public_image(&mut image).unwrap(), image.len());
        assert_eq!(image, sim.peek(TXT_PUBLIC_REGION.base, image.len()).unwrap());

        let (sim, gate) = gate_on(
            SimPlatform::builder()
                .vendor("AuthenticAMD")
                .pattern_region(TXT_PUBLIC_REGION.base, TXT_PUBLIC_REGION.size as usize)
                .build(),
        );
        assert!(matches!(
            gate.txt_public_image(&mut image),
            Err(AccessError::Unsupported(_))
        ));
        assert_eq!(sim.total_mappings(), 0);
    }

    #[test]
    fn test_flash_image_needs_whole_region() {
        let (_sim, gate) = gate_on(txt_platform());
        let mut short = vec![0u8; FLASH_REGION.size as usize - 1];
        assert_eq!(
            gate.flash_image(&mut short),
            Err(AccessError::BufferTooSmall {
                needed: FLASH_REGION.size as usize,
                actual: FLASH_REGION.size as usize - 1,
            })
        );
    }

    #[test]
    fn test_shutdown_releases_interface_once() {
        let (sim, gate) = gate_on(txt_platform());
        let mut buf = [0u8; 2];
        let location = PciLocation {
            bus: 0,
            device: 31,
            function: 0,
            offset: 0,
            length: 2,
        };
        gate.read_pci(&location, &mut buf).unwrap();
        assert_eq!(gate.pci_interface_state(), BusInterfaceState::Acquired);
        gate.shutdown();
        gate.shutdown();
        drop(gate);
        assert_eq!(sim.dereferences(), 1);
    }
}
