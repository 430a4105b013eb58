//! 硬件访问中介库
//!
//! 为用户态请求提供受控的只读硬件访问：闪存与 TXT 公共空间、任意物理内存、
//! 按 CPU 的 MSR 读取，以及 PCI 配置空间。

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::dispatch::{Attribute, dispatch_control, read_attribute};
use crate::mediator::{Gate, PciLocation};
use crate::platform_manager::PlatformManager;

pub mod const_values;
pub mod dispatch;
pub mod mediator;
pub mod platform_manager;
pub mod utils;

use const_values::GateConfig;
use utils::hexdump;

/// 解析十进制或 `0x` 前缀的十六进制数
pub fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim().replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| format!("无效数字 {:?}: {}", s, e))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let value = parse_number(s)?;
    u32::try_from(value).map_err(|_| format!("{:#x} 超出 32 位", value))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let value = parse_number(s)?;
    u8::try_from(value).map_err(|_| format!("{:#x} 超出 8 位", value))
}

/// 硬件访问中介
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// 主配置文件路径
    #[arg(short, long, default_value = "profile/config.toml")]
    pub config: PathBuf,

    /// 模拟平台描述文件路径
    #[arg(short, long, default_value = "profile/platform.toml")]
    pub platform: PathBuf,

    /// 结束后打印本次的请求记录
    #[arg(long)]
    pub audit: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 读取闪存区域 (bios_region)
    Flash {
        #[arg(short, long, value_parser = parse_number, default_value = "0")]
        offset: u64,
        #[arg(short, long, value_parser = parse_number, default_value = "0x100")]
        len: u64,
        /// 写入文件而不是打印
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// 读取 TXT 公共空间 (public_space)
    Txt {
        #[arg(short, long, value_parser = parse_number, default_value = "0")]
        offset: u64,
        #[arg(short, long, value_parser = parse_number, default_value = "0x100")]
        len: u64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// 读取任意物理地址
    Phys {
        #[arg(short, long, value_parser = parse_number)]
        address: u64,
        #[arg(short, long, value_parser = parse_number, default_value = "0x100")]
        len: u64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// 在指定 CPU 上读取 MSR
    Msr {
        #[arg(long, value_parser = parse_u32, default_value = "0")]
        cpu: u32,
        #[arg(short, long, value_parser = parse_u32)]
        register: u32,
    },
    /// 读取 PCI 配置空间
    Pci {
        #[arg(short, long, value_parser = parse_u8, default_value = "0")]
        bus: u8,
        #[arg(short, long, value_parser = parse_u8)]
        device: u8,
        #[arg(short, long, value_parser = parse_u8, default_value = "0")]
        function: u8,
        #[arg(short, long, value_parser = parse_u32, default_value = "0")]
        offset: u32,
        #[arg(short, long, value_parser = parse_u32, default_value = "0x40")]
        len: u32,
    },
    /// 直接发送控制请求
    Ioctl {
        #[arg(long, value_parser = parse_u32)]
        code: u32,
        /// 十六进制编码的输入缓冲
        #[arg(short, long, default_value = "00")]
        input: String,
        #[arg(short = 'n', long, value_parser = parse_number, default_value = "8")]
        output_len: u64,
    },
}

/// 按属性分块读取，直到读满或返回 0
fn read_attribute_range(gate: &Gate, attribute: Attribute, offset: u64, len: u64) -> Result<Vec<u8>> {
    // 区域内偏移会回绕，这里按属性大小截断
    if offset >= attribute.size() {
        bail!("偏移 {:#x} 超出 {} 大小 {:#x}", offset, attribute.name(), attribute.size());
    }
    let len = len.min(attribute.size() - offset);
    let mut data = vec![0u8; len as usize];
    let mut done = 0usize;
    while done < data.len() {
        let n = read_attribute(gate, attribute, offset + done as u64, &mut data[done..])
            .with_context(|| format!("读取 {} 失败", attribute.name()))?;
        if n == 0 {
            break;
        }
        done += n;
    }
    data.truncate(done);
    Ok(data)
}

fn emit(base: u64, data: &[u8], out: Option<PathBuf>) -> Result<()> {
    match out {
        Some(path) => {
            std::fs::write(&path, data).with_context(|| format!("无法写入 {:?}", path))?;
            info!(path = ?path, len = data.len(), "已写入文件");
        }
        None => print!("{}", hexdump(base, data)),
    }
    Ok(())
}

/// 单次读取的长度上限
pub const MAX_READ_LEN: u64 = 32 * 1024 * 1024;

/// 按用户给出的长度分配缓冲区，超过上限或分配失败时报错
fn alloc_buffer(len: u64) -> Result<Vec<u8>> {
    if len > MAX_READ_LEN {
        bail!("长度 {:#x} 超过上限 {:#x}", len, MAX_READ_LEN);
    }
    let mut data = Vec::new();
    data.try_reserve_exact(len as usize)
        .with_context(|| format!("无法分配 {:#x} 字节", len))?;
    data.resize(len as usize, 0);
    Ok(data)
}

pub fn build_gate_run(args: Args) -> Result<()> {
    let config = GateConfig::new(&args.config)?;
    let gate = PlatformManager::build_gate(&config, &args.platform)?;

    let outcome = run_command(&gate, args.command);

    if args.audit {
        for entry in gate.recent_requests() {
            println!(
                "{:<10} status {:#010x} transferred {}",
                entry.kind.to_string(),
                entry.status,
                entry.transferred
            );
        }
    }
    outcome
}

fn run_command(gate: &Gate, command: Command) -> Result<()> {
    match command {
        Command::Flash { offset, len, out } => {
            let data = read_attribute_range(gate, Attribute::BiosRegion, offset, len)?;
            emit(offset, &data, out)?;
        }
        Command::Txt { offset, len, out } => {
            let data = read_attribute_range(gate, Attribute::PublicSpace, offset, len)?;
            emit(offset, &data, out)?;
        }
        Command::Phys { address, len, out } => {
            let mut data = alloc_buffer(len)?;
            gate.read_physical(address, &mut data)?;
            emit(address, &data, out)?;
        }
        Command::Msr { cpu, register } => {
            let value = gate.read_msr(cpu, register)?;
            println!(
                "cpu {} msr {:#x} = {:#018x} (edx {:#010x} eax {:#010x})",
                cpu,
                register,
                value.as_u64(),
                value.edx,
                value.eax
            );
        }
        Command::Pci {
            bus,
            device,
            function,
            offset,
            len,
        } => {
            let location = PciLocation {
                bus,
                device,
                function,
                offset,
                length: len,
            };
            location.validate()?;
            let mut data = alloc_buffer(u64::from(len))?;
            gate.read_pci(&location, &mut data)?;
            emit(u64::from(offset), &data, None)?;
        }
        Command::Ioctl {
            code,
            input,
            output_len,
        } => {
            let input = hex::decode(&input).with_context(|| format!("输入不是十六进制: {}", input))?;
            let mut output = alloc_buffer(output_len)?;
            let completion = dispatch_control(gate, code, &input, &mut output);
            println!(
                "status {:#010x} ({:?}), information {}",
                completion.status.code(),
                completion.status,
                completion.information
            );
            print!("{}", hexdump(0, &output[..completion.information]));
            if !completion.status.is_success() {
                bail!("控制请求失败: {:?}", completion.status);
            }
        }
    }
    Ok(())
}
