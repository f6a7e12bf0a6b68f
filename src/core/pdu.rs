//! Modbus PDU (Protocol Data Unit) handling
//!
//! Parsing requests, building requests and responses, and the
//! [`Request`]/[`Response`] message pair that flows through the mock-server
//! dispatch and the bridge pipeline. Everything here is framing-independent;
//! MBAP headers and CRCs live in [`crate::core::frame`].

use serde::{Deserialize, Serialize};

use crate::core::frame::{CapturedFrame, ModbusMode};
use crate::utils::error::{Result, UmdtError};

/// Modbus limit on registers per read/write request.
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Modbus limit on coils per read request.
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
    ReadWriteMultipleRegisters = 0x17,
    /// Encapsulated interface transport (device identification)
    EncapsulatedInterface = 0x2B,
}

impl From<FunctionCode> for u8 {
    fn from(code: FunctionCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = UmdtError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            0x17 => Ok(FunctionCode::ReadWriteMultipleRegisters),
            0x2B => Ok(FunctionCode::EncapsulatedInterface),
            _ => Err(UmdtError::invalid(format!(
                "unsupported function code 0x{value:02X}"
            ))),
        }
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
    Acknowledge = 0x05,
    SlaveDeviceBusy = 0x06,
    NegativeAcknowledge = 0x07,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailed = 0x0B,
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> u8 {
        code as u8
    }
}

impl ExceptionCode {
    /// Human-readable description for an exception code byte.
    pub fn describe(code: u8) -> &'static str {
        match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x07 => "Negative Acknowledge",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
    }
}

/// The four Modbus entity namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// 16-bit read/write (FC 03/06/16/23)
    Holding,
    /// 16-bit read-only (FC 04)
    Input,
    /// 1-bit read/write (FC 01/05/15)
    Coil,
    /// 1-bit read-only (FC 02)
    Discrete,
}

impl DataKind {
    pub fn is_bit(&self) -> bool {
        matches!(self, DataKind::Coil | DataKind::Discrete)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, DataKind::Holding | DataKind::Coil)
    }

    /// Function code that reads this namespace.
    pub fn read_function(&self) -> FunctionCode {
        match self {
            DataKind::Coil => FunctionCode::ReadCoils,
            DataKind::Discrete => FunctionCode::ReadDiscreteInputs,
            DataKind::Holding => FunctionCode::ReadHoldingRegisters,
            DataKind::Input => FunctionCode::ReadInputRegisters,
        }
    }

    /// Namespace a request function code operates on.
    pub fn for_function(function: u8) -> Option<DataKind> {
        match function {
            0x01 | 0x05 | 0x0F => Some(DataKind::Coil),
            0x02 => Some(DataKind::Discrete),
            0x03 | 0x06 | 0x10 | 0x17 => Some(DataKind::Holding),
            0x04 => Some(DataKind::Input),
            _ => None,
        }
    }

    /// Parse the user-facing aliases (`h`, `holding`, `ir`, `di`, ...).
    pub fn parse(text: &str) -> Result<DataKind> {
        match text.trim().to_ascii_lowercase().as_str() {
            "h" | "hr" | "holding" => Ok(DataKind::Holding),
            "i" | "ir" | "input" | "input_register" => Ok(DataKind::Input),
            "c" | "coil" | "coils" => Ok(DataKind::Coil),
            "d" | "di" | "discrete" | "discrete_input" => Ok(DataKind::Discrete),
            other => Err(UmdtError::invalid(format!("unknown data type '{other}'"))),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DataKind::Holding => "holding",
            DataKind::Input => "input",
            DataKind::Coil => "coil",
            DataKind::Discrete => "discrete",
        }
    }
}

// ============================================================================
// Bit/register packing
// ============================================================================

/// Pack booleans LSB-first into the Modbus coil byte layout.
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut data = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value {
            data[i / 8] |= 1 << (i % 8);
        }
    }
    data
}

/// Unpack `count` booleans from Modbus coil bytes.
pub fn unpack_bits(data: &[u8], count: usize) -> Vec<bool> {
    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let byte = data.get(i / 8).copied().unwrap_or(0);
        values.push((byte >> (i % 8)) & 1 != 0);
    }
    values
}

/// Serialize registers big-endian.
pub fn registers_to_bytes(values: &[u16]) -> Vec<u8> {
    let mut data = Vec::with_capacity(values.len() * 2);
    for &value in values {
        data.extend_from_slice(&value.to_be_bytes());
    }
    data
}

/// Deserialize big-endian register bytes; odd trailing bytes are dropped.
pub fn bytes_to_registers(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect()
}

// ============================================================================
// Parsed requests
// ============================================================================

/// A request PDU decoded into its operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduRequest {
    /// FC 01/02
    ReadBits {
        function: FunctionCode,
        start: u16,
        quantity: u16,
    },
    /// FC 03/04
    ReadRegisters {
        function: FunctionCode,
        start: u16,
        quantity: u16,
    },
    /// FC 05 (value on the wire is 0xFF00 / 0x0000)
    WriteSingleCoil { address: u16, value: bool },
    /// FC 06
    WriteSingleRegister { address: u16, value: u16 },
    /// FC 15
    WriteMultipleCoils { start: u16, values: Vec<bool> },
    /// FC 16
    WriteMultipleRegisters { start: u16, values: Vec<u16> },
    /// FC 23
    ReadWriteMultipleRegisters {
        read_start: u16,
        read_quantity: u16,
        write_start: u16,
        write_values: Vec<u16>,
    },
    /// FC 43 (MEI 0x0E device identification)
    DeviceIdentification { read_code: u8, object_id: u8 },
}

/// Parse a request PDU (function byte + payload).
pub fn parse_request(function: u8, payload: &[u8]) -> Result<PduRequest> {
    let short =
        |what: &str| UmdtError::invalid(format!("{what} request payload too short"));

    let fc = FunctionCode::try_from(function)?;
    match fc {
        FunctionCode::ReadCoils
        | FunctionCode::ReadDiscreteInputs
        | FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters => {
            if payload.len() < 4 {
                return Err(short("read"));
            }
            let start = u16::from_be_bytes([payload[0], payload[1]]);
            let quantity = u16::from_be_bytes([payload[2], payload[3]]);
            if matches!(
                fc,
                FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs
            ) {
                Ok(PduRequest::ReadBits {
                    function: fc,
                    start,
                    quantity,
                })
            } else {
                Ok(PduRequest::ReadRegisters {
                    function: fc,
                    start,
                    quantity,
                })
            }
        }
        FunctionCode::WriteSingleCoil => {
            if payload.len() < 4 {
                return Err(short("write single coil"));
            }
            let address = u16::from_be_bytes([payload[0], payload[1]]);
            let raw = u16::from_be_bytes([payload[2], payload[3]]);
            Ok(PduRequest::WriteSingleCoil {
                address,
                value: raw == 0xFF00,
            })
        }
        FunctionCode::WriteSingleRegister => {
            if payload.len() < 4 {
                return Err(short("write single register"));
            }
            Ok(PduRequest::WriteSingleRegister {
                address: u16::from_be_bytes([payload[0], payload[1]]),
                value: u16::from_be_bytes([payload[2], payload[3]]),
            })
        }
        FunctionCode::WriteMultipleCoils => {
            if payload.len() < 5 {
                return Err(short("write multiple coils"));
            }
            let start = u16::from_be_bytes([payload[0], payload[1]]);
            let quantity = u16::from_be_bytes([payload[2], payload[3]]) as usize;
            let byte_count = payload[4] as usize;
            if payload.len() < 5 + byte_count {
                return Err(short("write multiple coils"));
            }
            Ok(PduRequest::WriteMultipleCoils {
                start,
                values: unpack_bits(&payload[5..5 + byte_count], quantity),
            })
        }
        FunctionCode::WriteMultipleRegisters => {
            if payload.len() < 5 {
                return Err(short("write multiple registers"));
            }
            let start = u16::from_be_bytes([payload[0], payload[1]]);
            let byte_count = payload[4] as usize;
            if payload.len() < 5 + byte_count {
                return Err(short("write multiple registers"));
            }
            Ok(PduRequest::WriteMultipleRegisters {
                start,
                values: bytes_to_registers(&payload[5..5 + byte_count]),
            })
        }
        FunctionCode::ReadWriteMultipleRegisters => {
            if payload.len() < 9 {
                return Err(short("read/write multiple registers"));
            }
            let read_start = u16::from_be_bytes([payload[0], payload[1]]);
            let read_quantity = u16::from_be_bytes([payload[2], payload[3]]);
            let write_start = u16::from_be_bytes([payload[4], payload[5]]);
            let byte_count = payload[8] as usize;
            if payload.len() < 9 + byte_count {
                return Err(short("read/write multiple registers"));
            }
            Ok(PduRequest::ReadWriteMultipleRegisters {
                read_start,
                read_quantity,
                write_start,
                write_values: bytes_to_registers(&payload[9..9 + byte_count]),
            })
        }
        FunctionCode::EncapsulatedInterface => {
            if payload.len() < 3 {
                return Err(short("encapsulated interface"));
            }
            if payload[0] != 0x0E {
                return Err(UmdtError::invalid(format!(
                    "unsupported MEI type 0x{:02X}",
                    payload[0]
                )));
            }
            Ok(PduRequest::DeviceIdentification {
                read_code: payload[1],
                object_id: payload[2],
            })
        }
    }
}

// ============================================================================
// PDU builders
// ============================================================================

/// Request PDU for FC 01/02/03/04.
pub fn build_read_request(function: FunctionCode, start: u16, quantity: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function.into());
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu
}

/// Request PDU for FC 05/06. For coils, pass 0xFF00 or 0x0000 as the value.
pub fn build_write_single_request(function: FunctionCode, address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function.into());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Request PDU for FC 15.
pub fn build_write_multiple_coils_request(start: u16, values: &[bool]) -> Vec<u8> {
    let data = pack_bits(values);
    let mut pdu = Vec::with_capacity(6 + data.len());
    pdu.push(FunctionCode::WriteMultipleCoils.into());
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push(data.len() as u8);
    pdu.extend_from_slice(&data);
    pdu
}

/// Request PDU for FC 16.
pub fn build_write_multiple_registers_request(start: u16, values: &[u16]) -> Vec<u8> {
    let data = registers_to_bytes(values);
    let mut pdu = Vec::with_capacity(6 + data.len());
    pdu.push(FunctionCode::WriteMultipleRegisters.into());
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push(data.len() as u8);
    pdu.extend_from_slice(&data);
    pdu
}

/// Request PDU for FC 23.
pub fn build_read_write_request(
    read_start: u16,
    read_quantity: u16,
    write_start: u16,
    write_values: &[u16],
) -> Vec<u8> {
    let data = registers_to_bytes(write_values);
    let mut pdu = Vec::with_capacity(10 + data.len());
    pdu.push(FunctionCode::ReadWriteMultipleRegisters.into());
    pdu.extend_from_slice(&read_start.to_be_bytes());
    pdu.extend_from_slice(&read_quantity.to_be_bytes());
    pdu.extend_from_slice(&write_start.to_be_bytes());
    pdu.extend_from_slice(&(write_values.len() as u16).to_be_bytes());
    pdu.push(data.len() as u8);
    pdu.extend_from_slice(&data);
    pdu
}

/// Request PDU for FC 43 / MEI 0x0E basic device identification.
pub fn build_device_identification_request(read_code: u8, object_id: u8) -> Vec<u8> {
    vec![
        FunctionCode::EncapsulatedInterface.into(),
        0x0E,
        read_code,
        object_id,
    ]
}

/// Response PDU for FC 01/02.
pub fn build_bits_response(function: FunctionCode, values: &[bool]) -> Vec<u8> {
    let data = pack_bits(values);
    let mut pdu = Vec::with_capacity(2 + data.len());
    pdu.push(function.into());
    pdu.push(data.len() as u8);
    pdu.extend_from_slice(&data);
    pdu
}

/// Response PDU for FC 03/04/23.
pub fn build_registers_response(function: FunctionCode, values: &[u16]) -> Vec<u8> {
    let data = registers_to_bytes(values);
    let mut pdu = Vec::with_capacity(2 + data.len());
    pdu.push(function.into());
    pdu.push(data.len() as u8);
    pdu.extend_from_slice(&data);
    pdu
}

/// Echo response for FC 05/06 (address + value) and FC 15/16
/// (address + quantity); both share the four-byte shape.
pub fn build_write_echo_response(function: FunctionCode, address: u16, value: u16) -> Vec<u8> {
    build_write_single_request(function, address, value)
}

/// Exception response PDU for any request function byte.
pub fn build_exception_response(request_function: u8, code: u8) -> Vec<u8> {
    vec![request_function | 0x80, code]
}

/// Response PDU for FC 43 / MEI 0x0E carrying the basic identification
/// objects (vendor, product code, revision).
pub fn build_device_identification_response(
    vendor: &str,
    product: &str,
    revision: &str,
) -> Vec<u8> {
    let objects: [(u8, &str); 3] = [(0x00, vendor), (0x01, product), (0x02, revision)];
    let mut pdu = vec![
        FunctionCode::EncapsulatedInterface.into(),
        0x0E, // MEI type
        0x01, // read device id code: basic
        0x01, // conformity level: basic identification
        0x00, // more follows: no
        0x00, // next object id
        objects.len() as u8,
    ];
    for (id, text) in objects {
        pdu.push(id);
        pdu.push(text.len() as u8);
        pdu.extend_from_slice(text.as_bytes());
    }
    pdu
}

// ============================================================================
// Pipeline messages
// ============================================================================

/// A Modbus request as it moves through server dispatch or the bridge
/// pipeline. `raw` holds the frame exactly as received on the source
/// framing; re-encoding for another framing goes through [`Request::pdu`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub unit_id: u8,
    pub function: u8,
    pub payload: Vec<u8>,
    pub transaction_id: Option<u16>,
    pub mode: ModbusMode,
    pub raw: Vec<u8>,
}

impl Request {
    /// Build from a captured frame. The capture must be `valid`.
    pub fn from_frame(frame: &CapturedFrame) -> Self {
        Self {
            unit_id: frame.unit_id,
            function: frame.function,
            payload: frame.payload.clone(),
            transaction_id: frame.transaction_id,
            mode: frame.mode,
            raw: frame.raw.clone(),
        }
    }

    /// Function code + payload.
    pub fn pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.payload.len());
        pdu.push(self.function);
        pdu.extend_from_slice(&self.payload);
        pdu
    }

    /// Decode the operation carried by this request.
    pub fn operation(&self) -> Result<PduRequest> {
        parse_request(self.function, &self.payload)
    }

    /// Starting address for the function codes that carry one up front
    /// (01-06, 15, 16).
    pub fn address(&self) -> Option<u16> {
        match self.function {
            0x01..=0x06 | 0x0F | 0x10 if self.payload.len() >= 2 => {
                Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
            }
            _ => None,
        }
    }

    /// Rewrite the starting address in place. Hooks use this for address
    /// remapping; the raw bytes keep the as-received value.
    pub fn set_address(&mut self, address: u16) {
        if self.address().is_some() {
            self.payload[0..2].copy_from_slice(&address.to_be_bytes());
        }
    }

    /// Quantity field for read and write-multiple requests.
    pub fn quantity(&self) -> Option<u16> {
        match self.function {
            0x01..=0x04 | 0x0F | 0x10 if self.payload.len() >= 4 => {
                Some(u16::from_be_bytes([self.payload[2], self.payload[3]]))
            }
            _ => None,
        }
    }
}

/// A Modbus response moving back through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub unit_id: u8,
    pub function: u8,
    pub payload: Vec<u8>,
    pub transaction_id: Option<u16>,
    pub mode: ModbusMode,
    pub raw: Vec<u8>,
}

impl Response {
    pub fn from_frame(frame: &CapturedFrame) -> Self {
        Self {
            unit_id: frame.unit_id,
            function: frame.function,
            payload: frame.payload.clone(),
            transaction_id: frame.transaction_id,
            mode: frame.mode,
            raw: frame.raw.clone(),
        }
    }

    /// Build a response from a PDU, inheriting unit and transaction from the
    /// request it answers.
    pub fn from_pdu(request: &Request, pdu: Vec<u8>) -> Self {
        let (function, payload) = match pdu.split_first() {
            Some((&f, rest)) => (f, rest.to_vec()),
            None => (0, Vec::new()),
        };
        Self {
            unit_id: request.unit_id,
            function,
            payload,
            transaction_id: request.transaction_id,
            mode: request.mode,
            raw: Vec::new(),
        }
    }

    /// Exception response answering `request` with `code`.
    pub fn exception_for(request: &Request, code: u8) -> Self {
        Self::from_pdu(request, build_exception_response(request.function, code))
    }

    pub fn is_exception(&self) -> bool {
        self.function & 0x80 != 0
    }

    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.payload.first().copied()
        } else {
            None
        }
    }

    /// Function code + payload.
    pub fn pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.payload.len());
        pdu.push(self.function);
        pdu.extend_from_slice(&self.payload);
        pdu
    }

    /// Register values carried by a read response (FC 03/04/23).
    pub fn registers(&self) -> Option<Vec<u16>> {
        if self.is_exception() || !matches!(self.function, 0x03 | 0x04 | 0x17) {
            return None;
        }
        let byte_count = *self.payload.first()? as usize;
        if self.payload.len() < 1 + byte_count {
            return None;
        }
        Some(bytes_to_registers(&self.payload[1..1 + byte_count]))
    }

    /// Bit values carried by a read response (FC 01/02), given the
    /// requested count.
    pub fn bits(&self, count: usize) -> Option<Vec<bool>> {
        if self.is_exception() || !matches!(self.function, 0x01 | 0x02) {
            return None;
        }
        let byte_count = *self.payload.first()? as usize;
        if self.payload.len() < 1 + byte_count {
            return None;
        }
        Some(unpack_bits(&self.payload[1..1 + byte_count], count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_code_conversion() {
        assert_eq!(u8::from(FunctionCode::ReadCoils), 0x01);
        assert_eq!(
            FunctionCode::try_from(0x17).unwrap(),
            FunctionCode::ReadWriteMultipleRegisters
        );
        assert_eq!(
            FunctionCode::try_from(0x2B).unwrap(),
            FunctionCode::EncapsulatedInterface
        );
        assert!(FunctionCode::try_from(0x63).is_err());
    }

    #[test]
    fn test_bit_packing_round_trip() {
        let values = [true, false, true, true, false, false, true, false, true];
        let packed = pack_bits(&values);
        assert_eq!(packed, vec![0xCD, 0x01]);
        assert_eq!(unpack_bits(&packed, values.len()), values);
    }

    #[test]
    fn test_register_bytes_round_trip() {
        let values = [0x1234, 0x5678];
        let bytes = registers_to_bytes(&values);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(bytes_to_registers(&bytes), values);
    }

    #[test]
    fn test_parse_read_request() {
        let parsed = parse_request(0x03, &[0x00, 0x01, 0x00, 0x0A]).unwrap();
        assert_eq!(
            parsed,
            PduRequest::ReadRegisters {
                function: FunctionCode::ReadHoldingRegisters,
                start: 1,
                quantity: 10
            }
        );
    }

    #[test]
    fn test_parse_write_single_coil() {
        let on = parse_request(0x05, &[0x00, 0x10, 0xFF, 0x00]).unwrap();
        assert_eq!(
            on,
            PduRequest::WriteSingleCoil {
                address: 16,
                value: true
            }
        );
        let off = parse_request(0x05, &[0x00, 0x10, 0x00, 0x00]).unwrap();
        assert_eq!(
            off,
            PduRequest::WriteSingleCoil {
                address: 16,
                value: false
            }
        );
    }

    #[test]
    fn test_parse_write_multiple_registers() {
        // start=0x0001 qty=2 bytes=4 values=0x000A,0x0102
        let payload = [0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02];
        let parsed = parse_request(0x10, &payload).unwrap();
        assert_eq!(
            parsed,
            PduRequest::WriteMultipleRegisters {
                start: 1,
                values: vec![0x000A, 0x0102]
            }
        );
    }

    #[test]
    fn test_parse_read_write_request() {
        let pdu = build_read_write_request(0x0010, 2, 0x0020, &[0xBEEF]);
        let parsed = parse_request(pdu[0], &pdu[1..]).unwrap();
        assert_eq!(
            parsed,
            PduRequest::ReadWriteMultipleRegisters {
                read_start: 0x10,
                read_quantity: 2,
                write_start: 0x20,
                write_values: vec![0xBEEF]
            }
        );
    }

    #[test]
    fn test_parse_truncated_request() {
        assert!(parse_request(0x03, &[0x00, 0x01]).is_err());
        assert!(parse_request(0x10, &[0x00, 0x01, 0x00, 0x02, 0x04, 0x00]).is_err());
    }

    #[test]
    fn test_build_read_request() {
        let pdu = build_read_request(FunctionCode::ReadHoldingRegisters, 0x0001, 0x000A);
        assert_eq!(pdu, vec![0x03, 0x00, 0x01, 0x00, 0x0A]);
    }

    #[test]
    fn test_exception_response() {
        let pdu = build_exception_response(0x01, 0x02);
        assert_eq!(pdu, vec![0x81, 0x02]);
        assert_eq!(ExceptionCode::describe(0x0B), "Gateway Target Device Failed to Respond");
    }

    #[test]
    fn test_response_register_extraction() {
        let req = Request {
            unit_id: 1,
            function: 0x03,
            payload: vec![0x00, 0x64, 0x00, 0x02],
            transaction_id: Some(7),
            mode: ModbusMode::Tcp,
            raw: vec![],
        };
        let resp = Response::from_pdu(
            &req,
            build_registers_response(FunctionCode::ReadHoldingRegisters, &[0x4120, 0x0000]),
        );
        assert_eq!(resp.unit_id, 1);
        assert_eq!(resp.transaction_id, Some(7));
        assert!(!resp.is_exception());
        assert_eq!(resp.registers(), Some(vec![0x4120, 0x0000]));
    }

    #[test]
    fn test_exception_for_request() {
        let req = Request {
            unit_id: 3,
            function: 0x06,
            payload: vec![0x00, 0x0A, 0x12, 0x34],
            transaction_id: None,
            mode: ModbusMode::Rtu,
            raw: vec![],
        };
        let resp = Response::exception_for(&req, 0x0B);
        assert!(resp.is_exception());
        assert_eq!(resp.function, 0x86);
        assert_eq!(resp.exception_code(), Some(0x0B));
    }

    #[test]
    fn test_request_address_rewrite() {
        let mut req = Request {
            unit_id: 1,
            function: 0x03,
            payload: vec![0xA0, 0x28, 0x00, 0x01], // address 41000
            transaction_id: Some(1),
            mode: ModbusMode::Tcp,
            raw: vec![],
        };
        assert_eq!(req.address(), Some(41000));
        req.set_address(40000);
        assert_eq!(req.address(), Some(40000));
        assert_eq!(req.quantity(), Some(1));
    }

    #[test]
    fn test_device_identification_round_trip() {
        let req = build_device_identification_request(0x01, 0x00);
        let parsed = parse_request(req[0], &req[1..]).unwrap();
        assert_eq!(
            parsed,
            PduRequest::DeviceIdentification {
                read_code: 0x01,
                object_id: 0x00
            }
        );
        let resp = build_device_identification_response("UMDT", "mock-server", "0.3");
        assert_eq!(resp[0], 0x2B);
        assert_eq!(resp[1], 0x0E);
        assert_eq!(resp[6], 3); // object count
    }
}
