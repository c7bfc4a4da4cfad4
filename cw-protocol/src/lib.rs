//! Wire protocol between corewatch and its privileged register mediator.
//!
//! Every primitive is a 32-bit control code plus a fixed-layout input frame.
//! Frames are little-endian and packed; sizes are checked on both encode
//! and decode so a short or oversized buffer never reaches the mediator.

use serde::{Deserialize, Serialize};

/// Device type shared by every mediator control code.
pub const DEVICE_TYPE: u32 = 40000;

/// Largest physical memory window a single read may request.
pub const MAX_MEMORY_READ: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Access {
    Any = 0,
    Read = 1,
    Write = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Method {
    Buffered = 0,
    InDirect = 1,
    OutDirect = 2,
    Neither = 3,
}

impl Method {
    fn from_bits(bits: u32) -> Method {
        match bits & 3 {
            0 => Method::Buffered,
            1 => Method::InDirect,
            2 => Method::OutDirect,
            _ => Method::Neither,
        }
    }
}

impl Access {
    fn from_bits(bits: u32) -> Option<Access> {
        match bits & 3 {
            0 => Some(Access::Any),
            1 => Some(Access::Read),
            2 => Some(Access::Write),
            _ => None,
        }
    }
}

/// Mediator function numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Function {
    GetVersion = 0x800,
    GetRefCount = 0x801,
    ReadMsr = 0x821,
    WriteMsr = 0x822,
    ReadIoPortByte = 0x833,
    WriteIoPortByte = 0x836,
    ReadMemory = 0x841,
    ReadPciConfig = 0x851,
    WritePciConfig = 0x852,
}

impl Function {
    pub const ALL: [Function; 9] = [
        Function::GetVersion,
        Function::GetRefCount,
        Function::ReadMsr,
        Function::WriteMsr,
        Function::ReadIoPortByte,
        Function::WriteIoPortByte,
        Function::ReadMemory,
        Function::ReadPciConfig,
        Function::WritePciConfig,
    ];

    pub fn number(self) -> u32 {
        self as u32
    }

    pub fn from_number(number: u32) -> Option<Function> {
        Self::ALL.iter().copied().find(|f| f.number() == number)
    }

    /// Access direction the mediator registers this function with.
    pub fn access(self) -> Access {
        match self {
            Function::ReadIoPortByte | Function::ReadPciConfig | Function::ReadMemory => {
                Access::Read
            }
            Function::WriteIoPortByte | Function::WritePciConfig => Access::Write,
            _ => Access::Any,
        }
    }

    pub fn code(self) -> ControlCode {
        ControlCode::new(DEVICE_TYPE, self.number(), Method::Buffered, self.access())
    }
}

/// A packed 32-bit mediator control code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlCode(u32);

impl ControlCode {
    pub const fn new(device_type: u32, function: u32, method: Method, access: Access) -> Self {
        ControlCode((device_type << 16) | ((access as u32) << 14) | (function << 2) | method as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        ControlCode(raw)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub fn device_type(self) -> u32 {
        self.0 >> 16
    }

    pub fn function_number(self) -> u32 {
        (self.0 >> 2) & 0xFFF
    }

    pub fn method(self) -> Method {
        Method::from_bits(self.0)
    }

    pub fn access_bits(self) -> u32 {
        (self.0 >> 14) & 3
    }

    /// Resolve the code to a known function.
    ///
    /// The device type, access direction and method must all match what
    /// that function is registered with, otherwise the code is rejected.
    pub fn function(self) -> Result<Function, String> {
        if self.device_type() != DEVICE_TYPE {
            return Err(format!(
                "Control code 0x{:08X} has device type {} (expected {})",
                self.0,
                self.device_type(),
                DEVICE_TYPE
            ));
        }
        let function = Function::from_number(self.function_number()).ok_or_else(|| {
            format!("Control code 0x{:08X} has unknown function 0x{:X}", self.0, self.function_number())
        })?;
        let access = Access::from_bits(self.access_bits())
            .ok_or_else(|| format!("Control code 0x{:08X} has invalid access bits", self.0))?;
        if access != function.access() {
            return Err(format!(
                "Control code 0x{:08X} uses {:?} access, {:?} requires {:?}",
                self.0,
                access,
                function,
                function.access()
            ));
        }
        if self.method() != Method::Buffered {
            return Err(format!("Control code 0x{:08X} is not buffered", self.0));
        }
        Ok(function)
    }
}

impl std::fmt::Display for ControlCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Pack bus/device/function into a PCI config address.
pub fn pci_address(bus: u8, device: u8, function: u8) -> u32 {
    ((bus as u32) << 8) | (((device as u32) & 0x1F) << 3) | ((function as u32) & 7)
}

pub fn pci_bus(address: u32) -> u8 {
    ((address >> 8) & 0xFF) as u8
}

pub fn pci_device(address: u32) -> u8 {
    ((address >> 3) & 0x1F) as u8
}

pub fn pci_function(address: u32) -> u8 {
    (address & 7) as u8
}

// ============================================================================
// Frames
// ============================================================================

/// A fixed-size little-endian input frame.
pub trait Frame: Sized {
    const SIZE: usize;

    fn write_to(&self, out: &mut Vec<u8>);

    fn read_from(bytes: &[u8]) -> Self;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut out);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != Self::SIZE {
            return Err(format!(
                "Frame of {} bytes, expected {}",
                bytes.len(),
                Self::SIZE
            ));
        }
        Ok(Self::read_from(bytes))
    }
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Single u32 argument (MSR index, IO port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInput {
    pub index: u32,
}

impl Frame for IndexInput {
    const SIZE: usize = 4;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.index.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        IndexInput { index: le_u32(bytes, 0) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteMsrInput {
    pub register: u32,
    pub value: u64,
}

impl Frame for WriteMsrInput {
    const SIZE: usize = 12;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.register.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        WriteMsrInput {
            register: le_u32(bytes, 0),
            value: le_u64(bytes, 4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteIoPortInput {
    pub port: u32,
    pub value: u8,
}

impl Frame for WriteIoPortInput {
    const SIZE: usize = 5;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.port.to_le_bytes());
        out.push(self.value);
    }

    fn read_from(bytes: &[u8]) -> Self {
        WriteIoPortInput {
            port: le_u32(bytes, 0),
            value: bytes[4],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPciConfigInput {
    pub pci_address: u32,
    pub reg_address: u32,
}

impl Frame for ReadPciConfigInput {
    const SIZE: usize = 8;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.pci_address.to_le_bytes());
        out.extend_from_slice(&self.reg_address.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        ReadPciConfigInput {
            pci_address: le_u32(bytes, 0),
            reg_address: le_u32(bytes, 4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePciConfigInput {
    pub pci_address: u32,
    pub reg_address: u32,
    pub value: u32,
}

impl Frame for WritePciConfigInput {
    const SIZE: usize = 12;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.pci_address.to_le_bytes());
        out.extend_from_slice(&self.reg_address.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        WritePciConfigInput {
            pci_address: le_u32(bytes, 0),
            reg_address: le_u32(bytes, 4),
            value: le_u32(bytes, 8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMemoryInput {
    pub address: u64,
    pub unit_size: u32,
    pub count: u32,
}

impl Frame for ReadMemoryInput {
    const SIZE: usize = 16;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(&self.unit_size.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        ReadMemoryInput {
            address: le_u64(bytes, 0),
            unit_size: le_u32(bytes, 8),
            count: le_u32(bytes, 12),
        }
    }
}

// ============================================================================
// Typed requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    GetVersion,
    GetRefCount,
    ReadMsr { index: u32 },
    WriteMsr { index: u32, value: u64 },
    ReadIoPort { port: u32 },
    WriteIoPort { port: u32, value: u8 },
    ReadPciConfig { address: u32, offset: u32 },
    WritePciConfig { address: u32, offset: u32, value: u32 },
    ReadMemory { address: u64, unit_size: u32, count: u32 },
}

impl Request {
    pub fn function(&self) -> Function {
        match self {
            Request::GetVersion => Function::GetVersion,
            Request::GetRefCount => Function::GetRefCount,
            Request::ReadMsr { .. } => Function::ReadMsr,
            Request::WriteMsr { .. } => Function::WriteMsr,
            Request::ReadIoPort { .. } => Function::ReadIoPortByte,
            Request::WriteIoPort { .. } => Function::WriteIoPortByte,
            Request::ReadPciConfig { .. } => Function::ReadPciConfig,
            Request::WritePciConfig { .. } => Function::WritePciConfig,
            Request::ReadMemory { .. } => Function::ReadMemory,
        }
    }

    pub fn code(&self) -> ControlCode {
        self.function().code()
    }

    /// Validate request parameters before they are marshalled
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::ReadPciConfig { offset, .. } | Request::WritePciConfig { offset, .. } => {
                validate_pci_offset(*offset)
            }
            Request::ReadMemory { unit_size, count, .. } => validate_memory_read(*unit_size, *count),
            _ => Ok(()),
        }
    }

    /// Encode the input frame for this request.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Request::GetVersion | Request::GetRefCount => Vec::new(),
            Request::ReadMsr { index } => IndexInput { index }.encode(),
            Request::WriteMsr { index, value } => WriteMsrInput { register: index, value }.encode(),
            Request::ReadIoPort { port } => IndexInput { index: port }.encode(),
            Request::WriteIoPort { port, value } => WriteIoPortInput { port, value }.encode(),
            Request::ReadPciConfig { address, offset } => ReadPciConfigInput {
                pci_address: address,
                reg_address: offset,
            }
            .encode(),
            Request::WritePciConfig { address, offset, value } => WritePciConfigInput {
                pci_address: address,
                reg_address: offset,
                value,
            }
            .encode(),
            Request::ReadMemory { address, unit_size, count } => ReadMemoryInput {
                address,
                unit_size,
                count,
            }
            .encode(),
        }
    }

    /// Decode a control code and input frame back into a request.
    pub fn decode(code: ControlCode, input: &[u8]) -> Result<Request, String> {
        let request = match code.function()? {
            Function::GetVersion => {
                expect_empty(input)?;
                Request::GetVersion
            }
            Function::GetRefCount => {
                expect_empty(input)?;
                Request::GetRefCount
            }
            Function::ReadMsr => Request::ReadMsr { index: IndexInput::decode(input)?.index },
            Function::WriteMsr => {
                let frame = WriteMsrInput::decode(input)?;
                Request::WriteMsr { index: frame.register, value: frame.value }
            }
            Function::ReadIoPortByte => Request::ReadIoPort { port: IndexInput::decode(input)?.index },
            Function::WriteIoPortByte => {
                let frame = WriteIoPortInput::decode(input)?;
                Request::WriteIoPort { port: frame.port, value: frame.value }
            }
            Function::ReadPciConfig => {
                let frame = ReadPciConfigInput::decode(input)?;
                Request::ReadPciConfig { address: frame.pci_address, offset: frame.reg_address }
            }
            Function::WritePciConfig => {
                let frame = WritePciConfigInput::decode(input)?;
                Request::WritePciConfig {
                    address: frame.pci_address,
                    offset: frame.reg_address,
                    value: frame.value,
                }
            }
            Function::ReadMemory => {
                let frame = ReadMemoryInput::decode(input)?;
                Request::ReadMemory {
                    address: frame.address,
                    unit_size: frame.unit_size,
                    count: frame.count,
                }
            }
        };
        request.validate()?;
        Ok(request)
    }

    /// Number of bytes the mediator writes back.
    pub fn output_size(&self) -> usize {
        match *self {
            Request::GetVersion | Request::GetRefCount => 4,
            Request::ReadMsr { .. } => 8,
            Request::ReadIoPort { .. } | Request::ReadPciConfig { .. } => 4,
            Request::ReadMemory { unit_size, count, .. } => unit_size as usize * count as usize,
            Request::WriteMsr { .. } | Request::WriteIoPort { .. } | Request::WritePciConfig { .. } => 0,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::GetVersion => "GetVersion",
            Request::GetRefCount => "GetRefCount",
            Request::ReadMsr { .. } => "ReadMsr",
            Request::WriteMsr { .. } => "WriteMsr",
            Request::ReadIoPort { .. } => "ReadIoPort",
            Request::WriteIoPort { .. } => "WriteIoPort",
            Request::ReadPciConfig { .. } => "ReadPciConfig",
            Request::WritePciConfig { .. } => "WritePciConfig",
            Request::ReadMemory { .. } => "ReadMemory",
        }
    }
}

fn expect_empty(input: &[u8]) -> Result<(), String> {
    if input.is_empty() {
        Ok(())
    } else {
        Err(format!("Frame of {} bytes, expected none", input.len()))
    }
}

pub fn validate_pci_offset(offset: u32) -> Result<(), String> {
    if offset & 3 != 0 {
        return Err(format!("PCI register offset 0x{:X} is not 4-byte aligned", offset));
    }
    if offset > 0xFFF {
        return Err(format!("PCI register offset 0x{:X} beyond extended config space", offset));
    }
    Ok(())
}

pub fn validate_memory_read(unit_size: u32, count: u32) -> Result<(), String> {
    if !matches!(unit_size, 1 | 2 | 4) {
        return Err(format!("Unit size {} not in (1, 2, 4)", unit_size));
    }
    if count == 0 {
        return Err("Memory read of zero units".into());
    }
    if unit_size as usize * count as usize > MAX_MEMORY_READ {
        return Err(format!(
            "Memory read of {} bytes exceeds {}",
            unit_size as usize * count as usize,
            MAX_MEMORY_READ
        ));
    }
    Ok(())
}

/// Split an 8-byte MSR output into (eax, edx).
pub fn split_msr(output: &[u8]) -> Option<(u32, u32)> {
    if output.len() != 8 {
        return None;
    }
    let value = le_u64(output, 0);
    Some((value as u32, (value >> 32) as u32))
}

pub fn read_u32(output: &[u8]) -> Option<u32> {
    if output.len() != 4 {
        return None;
    }
    Some(le_u32(output, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_code_bit_layout() {
        let code = Function::ReadMsr.code();
        assert_eq!(code.value(), (40000u32 << 16) | (0x821 << 2));
        assert_eq!(Function::ReadIoPortByte.code().value(), (40000u32 << 16) | (1 << 14) | (0x833 << 2));
        assert_eq!(Function::WriteIoPortByte.code().value(), (40000u32 << 16) | (2 << 14) | (0x836 << 2));
        assert_eq!(Function::WritePciConfig.code().value(), 0x9C40_0000 | 0x8000 | (0x852 << 2));
    }

    #[test]
    fn test_every_function_resolves_from_its_code() {
        for f in Function::ALL {
            assert_eq!(f.code().function(), Ok(f));
        }
    }

    #[test]
    fn test_mismatched_codes_rejected() {
        let wrong_device = ControlCode::new(0x22, 0x821, Method::Buffered, Access::Any);
        assert!(wrong_device.function().is_err());

        let wrong_access = ControlCode::new(DEVICE_TYPE, 0x833, Method::Buffered, Access::Write);
        assert!(wrong_access.function().is_err());

        let unknown = ControlCode::new(DEVICE_TYPE, 0x999, Method::Buffered, Access::Any);
        assert!(unknown.function().is_err());

        let direct = ControlCode::new(DEVICE_TYPE, 0x821, Method::Neither, Access::Any);
        assert!(direct.function().is_err());
    }

    #[test]
    fn test_pci_address_packing() {
        assert_eq!(pci_address(1, 2, 3), (1 << 8) | (2 << 3) | 3);
        let address = pci_address(0, 0x18, 3);
        assert_eq!(pci_bus(address), 0);
        assert_eq!(pci_device(address), 0x18);
        assert_eq!(pci_function(address), 3);
    }

    #[test]
    fn test_frame_sizes() {
        assert_eq!(WriteMsrInput { register: 0x1A2, value: 1 }.encode().len(), 12);
        assert_eq!(WriteIoPortInput { port: 0xCD6, value: 1 }.encode().len(), 5);
        assert_eq!(ReadPciConfigInput { pci_address: 0, reg_address: 0 }.encode().len(), 8);
        assert_eq!(ReadMemoryInput { address: 0, unit_size: 1, count: 1 }.encode().len(), 16);
    }

    #[test]
    fn test_write_msr_frame_is_little_endian_packed() {
        let bytes = WriteMsrInput { register: 0xC0010015, value: 0x0000_0001_0200_0000 }.encode();
        assert_eq!(&bytes[..4], &[0x15, 0x00, 0x01, 0xC0]);
        assert_eq!(&bytes[4..], &[0x00, 0x00, 0x00, 0x02, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(WritePciConfigInput::decode(&[0u8; 11]).is_err());
        assert!(Request::decode(Function::ReadMsr.code(), &[0u8; 3]).is_err());
        assert!(Request::decode(Function::GetVersion.code(), &[1]).is_err());
    }

    #[test]
    fn test_request_decode_matches_encoded() {
        let request = Request::WritePciConfig { address: pci_address(0, 0, 0), offset: 0x60, value: 0x59800 };
        let decoded = Request::decode(request.code(), &request.encode()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_unaligned_pci_offset_rejected() {
        let request = Request::ReadPciConfig { address: 0, offset: 0x62 };
        assert!(request.validate().is_err());
        assert!(Request::decode(request.code(), &request.encode()).is_err());
    }

    #[test]
    fn test_memory_read_bounds() {
        assert!(validate_memory_read(4, 16).is_ok());
        assert!(validate_memory_read(3, 16).is_err());
        assert!(validate_memory_read(1, 0).is_err());
        assert!(validate_memory_read(4, (MAX_MEMORY_READ / 4 + 1) as u32).is_err());
    }

    #[test]
    fn test_output_sizes() {
        assert_eq!(Request::ReadMsr { index: 0x10 }.output_size(), 8);
        assert_eq!(Request::ReadMemory { address: 0, unit_size: 2, count: 8 }.output_size(), 16);
        assert_eq!(Request::WriteIoPort { port: 0, value: 0 }.output_size(), 0);
    }

    #[test]
    fn test_split_msr() {
        let out = 0x0000_0012_8000_0044u64.to_le_bytes();
        assert_eq!(split_msr(&out), Some((0x8000_0044, 0x12)));
        assert_eq!(split_msr(&out[..4]), None);
    }

    #[test]
    fn test_request_serializes_tagged() {
        let json = serde_json::to_string(&Request::ReadMsr { index: 412 }).unwrap();
        assert_eq!(json, r#"{"cmd":"ReadMsr","data":{"index":412}}"#);
    }
}
