//! 请求分发
//!
//! 控制请求按控制码解码输入缓冲，转交给 `Gate`，结果写回输出缓冲。
//! 另有按属性名读取的入口，对应 sysfs 的 `bios_region` 与 `public_space`。

use tracing::{debug, warn};

use crate::mediator::{AccessError, Gate, PciLocation, FLASH_REGION, TXT_PUBLIC_REGION};

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

/// Windows 的 CTL_CODE 编码
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

pub const IOCTL_GET_FLASH: u32 = ctl_code(FILE_DEVICE_UNKNOWN, 0x800, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const IOCTL_GET_TXT_PUBLIC: u32 =
    ctl_code(FILE_DEVICE_UNKNOWN, 0x801, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const IOCTL_GET_MSR: u32 = ctl_code(FILE_DEVICE_UNKNOWN, 0x802, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const IOCTL_GET_PCI: u32 = ctl_code(FILE_DEVICE_UNKNOWN, 0x803, METHOD_BUFFERED, FILE_ANY_ACCESS);

/// MSR 请求输入：`[cpu u32 小端][register u32 小端]`
pub const MSR_REQUEST_SIZE: usize = 8;
/// MSR 结果：`[eax][edx]`
pub const MSR_RESULT_SIZE: usize = 8;
/// PCI 请求输入：`[bus][dev][func][offset][bytes]`，每项 u32 小端
pub const PCI_REQUEST_SIZE: usize = 20;

/// 请求完成状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    InvalidParameter,
    BufferTooSmall,
    NotImplemented,
    Unsuccessful,
    InvalidDeviceRequest,
    AccessViolation,
    PrivilegedInstruction,
}

impl Status {
    /// 对应的 NTSTATUS 值
    pub fn code(&self) -> u32 {
        match self {
            Status::Success => 0x0000_0000,
            Status::InvalidParameter => 0xC000_000D,
            Status::BufferTooSmall => 0xC000_0023,
            Status::NotImplemented => 0xC000_0002,
            Status::Unsuccessful => 0xC000_0001,
            Status::InvalidDeviceRequest => 0xC000_0010,
            Status::AccessViolation => 0xC000_0005,
            Status::PrivilegedInstruction => 0xC000_0096,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }
}

impl From<&AccessError> for Status {
    fn from(e: &AccessError) -> Self {
        match e {
            AccessError::InvalidParameter(_)
            | AccessError::OutOfRange { .. }
            | AccessError::Denied(_)
            | AccessError::InvalidCpu { .. }
            | AccessError::NoBusInterface(_) => Status::InvalidParameter,
            AccessError::BufferTooSmall { .. } => Status::BufferTooSmall,
            AccessError::Unsupported(_) => Status::NotImplemented,
            AccessError::NoMappingSpace { .. } | AccessError::PartialTransfer { .. } => {
                Status::Unsuccessful
            }
            AccessError::CopyFault(_) => Status::AccessViolation,
            AccessError::FaultDuringRead { .. } => Status::PrivilegedInstruction,
            AccessError::InvalidDeviceRequest(_) => Status::InvalidDeviceRequest,
        }
    }
}

/// 请求完成信息：状态与写入输出缓冲的字节数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub status: Status,
    pub information: usize,
}

impl Completion {
    fn success(information: usize) -> Self {
        Self {
            status: Status::Success,
            information,
        }
    }

    fn failure(e: &AccessError) -> Self {
        Self {
            status: Status::from(e),
            information: 0,
        }
    }
}

fn le_u32(input: &[u8], index: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&input[index * 4..index * 4 + 4]);
    u32::from_le_bytes(word)
}

/// 处理一个控制请求
pub fn dispatch_control(gate: &Gate, code: u32, input: &[u8], output: &mut [u8]) -> Completion {
    debug!(
        code = format_args!("{:#x}", code),
        input_len = input.len(),
        output_len = output.len(),
        "控制请求"
    );
    let result = handle_control(gate, code, input, output);
    match result {
        Ok(information) => Completion::success(information),
        Err(e) => {
            warn!(code = format_args!("{:#x}", code), error = %e, "控制请求失败");
            Completion::failure(&e)
        }
    }
}

fn handle_control(gate: &Gate, code: u32, input: &[u8], output: &mut [u8]) -> Result<usize, AccessError> {
    if input.is_empty() || output.is_empty() {
        return Err(AccessError::InvalidParameter("输入或输出缓冲区为空".to_string()));
    }

    match code {
        IOCTL_GET_FLASH => gate.flash_image(output),
        IOCTL_GET_TXT_PUBLIC => gate.txt_public_image(output),
        IOCTL_GET_MSR => {
            if input.len() < MSR_REQUEST_SIZE {
                return Err(AccessError::InvalidParameter(format!(
                    "MSR 请求长度 {} 小于 {}",
                    input.len(),
                    MSR_REQUEST_SIZE
                )));
            }
            // CPU 与拒绝列表的检查先于输出长度检查
            let value = gate.read_msr(le_u32(input, 0), le_u32(input, 1))?;
            if output.len() < MSR_RESULT_SIZE {
                return Err(AccessError::BufferTooSmall {
                    needed: MSR_RESULT_SIZE,
                    actual: output.len(),
                });
            }
            output[..MSR_RESULT_SIZE].copy_from_slice(&value.to_bytes());
            Ok(MSR_RESULT_SIZE)
        }
        IOCTL_GET_PCI => {
            let location = decode_pci_request(input, output.len())?;
            gate.read_pci(&location, output)
        }
        other => Err(AccessError::InvalidDeviceRequest(other)),
    }
}

fn decode_pci_request(input: &[u8], output_len: usize) -> Result<PciLocation, AccessError> {
    if input.len() != PCI_REQUEST_SIZE {
        return Err(AccessError::InvalidParameter(format!(
            "PCI 请求长度 {} 不等于 {}",
            input.len(),
            PCI_REQUEST_SIZE
        )));
    }
    let [bus, device, function, offset, bytes] = [0, 1, 2, 3, 4].map(|i| le_u32(input, i));
    let end = u64::from(offset) + u64::from(bytes);
    if end > 4096 || (output_len as u64) < u64::from(bytes) {
        return Err(AccessError::InvalidParameter(format!(
            "PCI 请求偏移 {:#x} 长度 {:#x} 与输出 {} 字节不符",
            offset, bytes, output_len
        )));
    }
    let narrow = |value: u32, what: &str| {
        u8::try_from(value)
            .map_err(|_| AccessError::InvalidParameter(format!("{} {:#x} 超出范围", what, value)))
    };
    Ok(PciLocation {
        bus: narrow(bus, "总线号")?,
        device: narrow(device, "设备号")?,
        function: narrow(function, "功能号")?,
        offset,
        length: bytes,
    })
}

/// 按名字读取的区域属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    BiosRegion,
    PublicSpace,
}

impl Attribute {
    pub fn name(&self) -> &'static str {
        match self {
            Attribute::BiosRegion => FLASH_REGION.name,
            Attribute::PublicSpace => TXT_PUBLIC_REGION.name,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Attribute::BiosRegion => FLASH_REGION.size,
            Attribute::PublicSpace => TXT_PUBLIC_REGION.size,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [Attribute::BiosRegion, Attribute::PublicSpace]
            .into_iter()
            .find(|a| a.name() == name)
    }
}

/// 属性读取，每次至多一页
pub fn read_attribute(
    gate: &Gate,
    attribute: Attribute,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize, AccessError> {
    match attribute {
        Attribute::BiosRegion => gate.read_flash(offset, buf),
        Attribute::PublicSpace => gate.read_txt_public(offset, buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::tests::{gate_on, txt_platform};

    fn pci_request(words: [u32; 5]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_control_codes() {
        assert_eq!(IOCTL_GET_FLASH, 0x0022_2000);
        assert_eq!(IOCTL_GET_TXT_PUBLIC, 0x0022_2004);
        assert_eq!(IOCTL_GET_MSR, 0x0022_2008);
        assert_eq!(IOCTL_GET_PCI, 0x0022_200C);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::from(&AccessError::Denied(0x174)).code(), 0xC000_000D);
        assert_eq!(
            Status::from(&AccessError::InvalidCpu { cpu: 9, active: 4 }),
            Status::InvalidParameter
        );
        assert_eq!(
            Status::from(&AccessError::Unsupported(String::new())).code(),
            0xC000_0002
        );
        assert_eq!(
            Status::from(&AccessError::PartialTransfer {
                requested: 4,
                transferred: 0
            }),
            Status::Unsuccessful
        );
        assert!(Status::Success.is_success());
    }

    #[test]
    fn test_empty_buffers_rejected() {
        let (_sim, gate) = gate_on(txt_platform());
        let mut out = [0u8; 8];
        let c = dispatch_control(&gate, IOCTL_GET_MSR, &[], &mut out);
        assert_eq!(c.status, Status::InvalidParameter);
        let c = dispatch_control(&gate, IOCTL_GET_MSR, &[0u8; 8], &mut []);
        assert_eq!(c.status, Status::InvalidParameter);
        assert_eq!(c.information, 0);
    }

    #[test]
    fn test_msr_request_layout() {
        let (_sim, gate) = gate_on(txt_platform());
        let mut input = Vec::new();
        input.extend_from_slice(&2u32.to_le_bytes());
        input.extend_from_slice(&0x10u32.to_le_bytes());
        let mut out = [0u8; 8];
        let c = dispatch_control(&gate, IOCTL_GET_MSR, &input, &mut out);
        assert_eq!(c, Completion::success(8));
        assert_eq!(out, [2, 0, 0, 0, 1, 0, 0, 0]);

        let mut short = [0u8; 7];
        let c = dispatch_control(&gate, IOCTL_GET_MSR, &input, &mut short);
        assert_eq!(c.status, Status::BufferTooSmall);
        let c = dispatch_control(&gate, IOCTL_GET_MSR, &input[..7], &mut out);
        assert_eq!(c.status, Status::InvalidParameter);
    }

    #[test]
    fn test_msr_checks_precede_output_size() {
        let (sim, gate) = gate_on(txt_platform());
        let mut short = [0u8; 4];
        let request = |cpu: u32, register: u32| -> Vec<u8> {
            [cpu, register].iter().flat_map(|w| w.to_le_bytes()).collect()
        };

        let c = dispatch_control(&gate, IOCTL_GET_MSR, &request(0, 0x174), &mut short);
        assert_eq!(c.status, Status::InvalidParameter);
        let c = dispatch_control(&gate, IOCTL_GET_MSR, &request(9, 0x10), &mut short);
        assert_eq!(c.status, Status::InvalidParameter);
        assert_eq!(sim.msr_reads(), 0);

        let c = dispatch_control(&gate, IOCTL_GET_MSR, &request(0, 0x10), &mut short);
        assert_eq!(c.status, Status::BufferTooSmall);
        assert_eq!(c.information, 0);
        assert_eq!(short, [0u8; 4]);
    }

    #[test]
    fn test_pci_request_validation() {
        let (_sim, gate) = gate_on(txt_platform());
        let mut out = [0u8; 4];
        // 长度不是 20 字节
        let c = dispatch_control(&gate, IOCTL_GET_PCI, &[0u8; 16], &mut out);
        assert_eq!(c.status, Status::InvalidParameter);
        // 输出小于请求长度
        let c = dispatch_control(&gate, IOCTL_GET_PCI, &pci_request([0, 31, 0, 0, 8]), &mut out);
        assert_eq!(c.status, Status::InvalidParameter);
        // 越过配置空间
        let c = dispatch_control(&gate, IOCTL_GET_PCI, &pci_request([0, 31, 0, 4094, 4]), &mut out);
        assert_eq!(c.status, Status::InvalidParameter);
        // 总线号超过 8 位
        let c = dispatch_control(&gate, IOCTL_GET_PCI, &pci_request([256, 0, 0, 0, 4]), &mut out);
        assert_eq!(c.status, Status::InvalidParameter);

        let c = dispatch_control(&gate, IOCTL_GET_PCI, &pci_request([0, 31, 0, 0, 4]), &mut out);
        assert_eq!(c, Completion::success(4));
        assert_eq!(out, [0x86, 0x80, 0x84, 0xA3]);
    }

    #[test]
    fn test_unknown_code() {
        let (_sim, gate) = gate_on(txt_platform());
        let mut out = [0u8; 4];
        let c = dispatch_control(&gate, 0x0022_2010, &[1], &mut out);
        assert_eq!(c.status, Status::InvalidDeviceRequest);
        assert_eq!(c.status.code(), 0xC000_0010);
    }

    #[test]
    fn test_attributes() {
        let (sim, gate) = gate_on(txt_platform());
        assert_eq!(Attribute::from_name("bios_region"), Some(Attribute::BiosRegion));
        assert_eq!(Attribute::from_name("public_space"), Some(Attribute::PublicSpace));
        assert_eq!(Attribute::from_name("other"), None);
        assert_eq!(Attribute::PublicSpace.size(), 0x1_0000);

        let mut buf = [0u8; 2];
        let n = read_attribute(&gate, Attribute::PublicSpace, 0xFFFF, &mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], sim.peek(TXT_PUBLIC_REGION.base + 0xFFFF, 1).unwrap()[0]);
        let n = read_attribute(&gate, Attribute::BiosRegion, 0x20, &mut buf).unwrap();
        assert_eq!(n, 2);
    }
}
