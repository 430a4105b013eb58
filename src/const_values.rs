use anyhow::{self, Context};
use serde::Deserialize;
use std::path::Path;

use crate::mediator::{DEFAULT_HISTORY_SIZE, GateOptions};

/// 后端种类
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sim,
    Host,
}

#[derive(Deserialize, Debug, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
}

#[derive(Deserialize, Debug, Default)]
pub struct PciConfig {
    /// 不填时使用后端自己的默认设备
    pub filter_device: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct AuditConfig {
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

fn default_history_size() -> usize {
    DEFAULT_HISTORY_SIZE
}

/// 主配置（profile/config.toml）
#[derive(Deserialize, Debug, Default)]
pub struct GateConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub pci: PciConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl GateConfig {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<GateConfig> {
        let toml_str = std::fs::read_to_string(&path)
            .with_context(|| format!("无法读取主配置文件: {:?}", &path.as_ref().as_os_str()))?;
        let config: GateConfig = toml::from_str(&toml_str)
            .with_context(|| format!("无法解析主配置文件: {:?}", &path.as_ref().as_os_str()))?;
        anyhow::Ok(config)
    }

    /// 以 `default_device` 作为过滤设备的缺省值
    pub fn gate_options(&self, default_device: &str) -> GateOptions {
        GateOptions {
            filter_device: self
                .pci
                .filter_device
                .clone()
                .unwrap_or_else(|| default_device.to_string()),
            history_size: self.audit.history_size,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct MsrEntry {
    pub index: u32,
    pub value: u64,
    /// 不填时所有 CPU 可见
    pub cpu: Option<u32>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RegionEntry {
    pub name: String,
    pub base: u64,
    pub size: usize,
    /// 镜像文件，不填时按地址生成填充内容
    pub image: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PciFunctionEntry {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    /// 从偏移 0 开始的原始配置空间，优先于 vendor_id/device_id
    pub bytes: Option<Vec<u8>>,
}

impl PciFunctionEntry {
    pub fn config_space(&self) -> Vec<u8> {
        match &self.bytes {
            Some(bytes) => bytes.clone(),
            None => {
                let mut config = Vec::with_capacity(4);
                config.extend_from_slice(&self.vendor_id.to_le_bytes());
                config.extend_from_slice(&self.device_id.to_le_bytes());
                config
            }
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct CpuSection {
    pub count: u32,
    #[serde(default = "default_vendor")]
    pub vendor: String,
    #[serde(default)]
    pub smx: bool,
}

fn default_vendor() -> String {
    "GenuineIntel".to_string()
}

/// 模拟平台描述（profile/platform.toml）
#[derive(Deserialize, Debug)]
pub struct PlatformFile {
    #[serde(default = "default_platform_name")]
    pub name: String,
    pub cpu: CpuSection,
    #[serde(default)]
    pub msrs: Vec<MsrEntry>,
    #[serde(default)]
    pub regions: Vec<RegionEntry>,
    #[serde(default)]
    pub pci: Vec<PciFunctionEntry>,
}

fn default_platform_name() -> String {
    "sim".to_string()
}

impl PlatformFile {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<PlatformFile> {
        let toml_str = std::fs::read_to_string(&path)
            .with_context(|| format!("无法读取平台配置文件: {:?}", &path.as_ref().as_os_str()))?;
        let profile: PlatformFile = toml::from_str(&toml_str)
            .with_context(|| format!("无法解析平台配置文件: {:?}", &path.as_ref().as_os_str()))?;
        anyhow::Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_config_defaults() {
        let config: GateConfig = toml::from_str("").unwrap();
        assert_eq!(config.backend.kind, BackendKind::Sim);
        assert_eq!(config.audit.history_size, DEFAULT_HISTORY_SIZE);
        let options = config.gate_options("dev");
        assert_eq!(options.filter_device, "dev");
    }

    #[test]
    fn test_gate_config_parse() {
        let config: GateConfig = toml::from_str(
            r#"
            [backend]
            kind = "host"
            [pci]
            filter_device = "/sys/bus/pci/devices"
            [audit]
            history_size = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.kind, BackendKind::Host);
        let options = config.gate_options("unused");
        assert_eq!(options.filter_device, "/sys/bus/pci/devices");
        assert_eq!(options.history_size, 8);
    }

    #[test]
    fn test_platform_file_parse() {
        let file: PlatformFile = toml::from_str(
            r#"
            [cpu]
            count = 2
            smx = true

            [[msrs]]
            index = 0x3A
            value = 0xFF07

            [[msrs]]
            index = 0x1B
            value = 0xFEE00900
            cpu = 1

            [[regions]]
            name = "txt"
            base = 0xFED30000
            size = 0x10000

            [[pci]]
            bus = 0
            device = 31
            function = 0
            vendor_id = 0x8086
            device_id = 0xA384
            "#,
        )
        .unwrap();
        assert_eq!(file.name, "sim");
        assert_eq!(file.cpu.vendor, "GenuineIntel");
        assert_eq!(file.msrs.len(), 2);
        assert_eq!(file.msrs[1].cpu, Some(1));
        assert!(file.regions[0].image.is_none());
        assert_eq!(file.pci[0].config_space(), vec![0x86, 0x80, 0x84, 0xA3]);
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = GateConfig::new("/nonexistent/hwgate.toml").unwrap_err();
        assert!(err.to_string().contains("无法读取主配置文件"));
    }
}
