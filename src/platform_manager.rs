//! 平台管理模块
//! 根据配置创建平台实现并组装 `Gate`

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use platform_trait::Platform;
use sim_platform::SimPlatform;
use tracing::info;

use crate::const_values::{BackendKind, GateConfig, PlatformFile};
use crate::mediator::Gate;

/// 平台工厂
pub struct PlatformFactory;

impl PlatformFactory {
    /// 按平台描述创建模拟平台
    pub fn create_sim(file: &PlatformFile) -> anyhow::Result<SimPlatform> {
        let mut builder = SimPlatform::builder()
            .name(file.name.clone())
            .cpus(file.cpu.count)
            .vendor(&file.cpu.vendor)
            .smx(file.cpu.smx);

        for msr in &file.msrs {
            builder = match msr.cpu {
                Some(cpu) => builder.cpu_msr(cpu, msr.index, msr.value),
                None => builder.msr(msr.index, msr.value),
            };
        }

        for region in &file.regions {
            info!(
                "加载内存区域: {} (地址: {:#x}, 大小: {:#x})",
                region.name, region.base, region.size
            );
            builder = match &region.image {
                Some(image) => {
                    let mut data = std::fs::read(image)
                        .with_context(|| format!("无法读取区域 {} 的镜像: {}", region.name, image))?;
                    if data.len() > region.size {
                        bail!(
                            "区域 {} 的镜像 {} 大小 {:#x} 超过区域大小 {:#x}",
                            region.name,
                            image,
                            data.len(),
                            region.size
                        );
                    }
                    data.resize(region.size, 0xFF);
                    builder.region(region.base, data)
                }
                None => builder.pattern_region(region.base, region.size),
            };
        }

        for function in &file.pci {
            if function.device > 31 || function.function > 7 {
                bail!(
                    "PCI 功能 {:02x}:{:02x}.{} 超出范围",
                    function.bus,
                    function.device,
                    function.function
                );
            }
            builder = builder.pci_function(
                function.bus,
                function.device,
                function.function,
                function.config_space(),
            );
        }

        Ok(builder.build())
    }

    #[cfg(target_os = "linux")]
    fn create_host() -> anyhow::Result<Arc<dyn Platform>> {
        if !host_platform::is_available() {
            bail!("主机后端不可用: 缺少 /dev/mem");
        }
        Ok(Arc::new(host_platform::HostPlatform::new()))
    }

    #[cfg(not(target_os = "linux"))]
    fn create_host() -> anyhow::Result<Arc<dyn Platform>> {
        bail!("主机后端只支持 Linux")
    }
}

/// 平台管理器
pub struct PlatformManager;

impl PlatformManager {
    /// 读取配置并创建 `Gate`
    pub fn build_gate(config: &GateConfig, platform_file: impl AsRef<Path>) -> anyhow::Result<Gate> {
        let (platform, default_device): (Arc<dyn Platform>, &str) = match config.backend.kind {
            BackendKind::Sim => {
                let file = PlatformFile::new(platform_file)?;
                let sim = PlatformFactory::create_sim(&file)?;
                (Arc::new(sim), sim_platform::DEFAULT_FILTER_DEVICE)
            }
            BackendKind::Host => (PlatformFactory::create_host()?, host_platform::SYSFS_PCI_DEVICES),
        };
        info!(platform = platform.name(), "平台已创建");
        Ok(Gate::new(platform, config.gate_options(default_device)))
    }
}
