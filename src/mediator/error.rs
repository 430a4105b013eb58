//! 访问错误类型

use thiserror::Error;

/// 单次请求的失败原因
///
/// 所有失败都只影响当前请求，调用方收到状态码与零字节传输。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("参数无效: {0}")]
    InvalidParameter(String),

    #[error("访问越界: 偏移 {offset:#x}, 长度 {length:#x}, 上限 {limit:#x}")]
    OutOfRange { offset: u64, length: u64, limit: u64 },

    #[error("MSR {0:#x} 被策略拒绝")]
    Denied(u32),

    #[error("平台不支持: {0}")]
    Unsupported(String),

    #[error("无可用映射空间: 地址 {addr:#x}, 长度 {len:#x}")]
    NoMappingSpace { addr: u64, len: usize },

    #[error("无法获取 PCI 总线接口: {0}")]
    NoBusInterface(String),

    #[error("传输不完整: 请求 {requested} 字节, 实际 {transferred} 字节")]
    PartialTransfer { requested: usize, transferred: usize },

    #[error("复制时发生硬件异常: {0}")]
    CopyFault(String),

    #[error("CPU {cpu} 无效, 活动 CPU 数为 {active}")]
    InvalidCpu { cpu: u32, active: u32 },

    #[error("读取 MSR {index:#x} 时发生异常: {reason}")]
    FaultDuringRead { index: u32, reason: String },

    #[error("输出缓冲区过小: 需要 {needed} 字节, 实际 {actual} 字节")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("未知请求: {0:#x}")]
    InvalidDeviceRequest(u32),
}
