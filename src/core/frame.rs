//! Modbus frame processing
//!
//! Frame handling for both TCP (MBAP) and RTU modes: construction, permissive
//! parsing, CRC-16 validation and RTU length prediction. Decoding here never
//! throws malformed frames away; they come back as [`CapturedFrame`] values
//! with `valid = false` and a reason, so diagnostic layers can display the
//! bytes that actually hit the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::error::{FrameReason, Result, UmdtError};

/// Largest legal RTU ADU (address + PDU + CRC).
pub const MAX_RTU_FRAME: usize = 256;

/// MBAP header length on the wire.
pub const MBAP_HEADER_LEN: usize = 7;

/// Modbus transmission mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusMode {
    Tcp,
    Rtu,
}

/// CRC-16/Modbus lookup table (polynomial 0xA001, reflected).
const CRC16_TABLE: [u16; 256] = [
    0x0000, 0xC0C1, 0xC181, 0x0140, 0xC301, 0x03C0, 0x0280, 0xC241,
    0xC601, 0x06C0, 0x0780, 0xC741, 0x0500, 0xC5C1, 0xC481, 0x0440,
    0xCC01, 0x0CC0, 0x0D80, 0xCD41, 0x0F00, 0xCFC1, 0xCE81, 0x0E40,
    0x0A00, 0xCAC1, 0xCB81, 0x0B40, 0xC901, 0x09C0, 0x0880, 0xC841,
    0xD801, 0x18C0, 0x1980, 0xD941, 0x1B00, 0xDBC1, 0xDA81, 0x1A40,
    0x1E00, 0xDEC1, 0xDF81, 0x1F40, 0xDD01, 0x1DC0, 0x1C80, 0xDC41,
    0x1400, 0xD4C1, 0xD581, 0x1540, 0xD701, 0x17C0, 0x1680, 0xD641,
    0xD201, 0x12C0, 0x1380, 0xD341, 0x1100, 0xD1C1, 0xD081, 0x1040,
    0xF001, 0x30C0, 0x3180, 0xF141, 0x3300, 0xF3C1, 0xF281, 0x3240,
    0x3600, 0xF6C1, 0xF781, 0x3740, 0xF501, 0x35C0, 0x3480, 0xF441,
    0x3C00, 0xFCC1, 0xFD81, 0x3D40, 0xFF01, 0x3FC0, 0x3E80, 0xFE41,
    0xFA01, 0x3AC0, 0x3B80, 0xFB41, 0x3900, 0xF9C1, 0xF881, 0x3840,
    0x2800, 0xE8C1, 0xE981, 0x2940, 0xEB01, 0x2BC0, 0x2A80, 0xEA41,
    0xEE01, 0x2EC0, 0x2F80, 0xEF41, 0x2D00, 0xEDC1, 0xEC81, 0x2C40,
    0xE401, 0x24C0, 0x2580, 0xE541, 0x2700, 0xE7C1, 0xE681, 0x2640,
    0x2200, 0xE2C1, 0xE381, 0x2340, 0xE101, 0x21C0, 0x2080, 0xE041,
    0xA001, 0x60C0, 0x6180, 0xA141, 0x6300, 0xA3C1, 0xA281, 0x6240,
    0x6600, 0xA6C1, 0xA781, 0x6740, 0xA501, 0x65C0, 0x6480, 0xA441,
    0x6C00, 0xACC1, 0xAD81, 0x6D40, 0xAF01, 0x6FC0, 0x6E80, 0xAE41,
    0xAA01, 0x6AC0, 0x6B80, 0xAB41, 0x6900, 0xA9C1, 0xA881, 0x6840,
    0x7800, 0xB8C1, 0xB981, 0x7940, 0xBB01, 0x7BC0, 0x7A80, 0xBA41,
    0xBE01, 0x7EC0, 0x7F80, 0xBF41, 0x7D00, 0xBDC1, 0xBC81, 0x7C40,
    0xB401, 0x74C0, 0x7580, 0xB541, 0x7700, 0xB7C1, 0xB681, 0x7640,
    0x7200, 0xB2C1, 0xB381, 0x7340, 0xB101, 0x71C0, 0x7080, 0xB041,
    0x5000, 0x90C1, 0x9181, 0x5140, 0x9301, 0x53C0, 0x5280, 0x9241,
    0x9601, 0x56C0, 0x5780, 0x9741, 0x5500, 0x95C1, 0x9481, 0x5440,
    0x9C01, 0x5CC0, 0x5D80, 0x9D41, 0x5F00, 0x9FC1, 0x9E81, 0x5E40,
    0x5A00, 0x9AC1, 0x9B81, 0x5B40, 0x9901, 0x59C0, 0x5880, 0x9841,
    0x8801, 0x48C0, 0x4980, 0x8941, 0x4B00, 0x8BC1, 0x8A81, 0x4A40,
    0x4E00, 0x8EC1, 0x8F81, 0x4F40, 0x8D01, 0x4DC0, 0x4C80, 0x8C41,
    0x4400, 0x84C1, 0x8581, 0x4540, 0x8701, 0x47C0, 0x4680, 0x8641,
    0x8201, 0x42C0, 0x4380, 0x8341, 0x4100, 0x81C1, 0x8081, 0x4040,
];

/// CRC-16/Modbus over `data` (table-driven; initial 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        let idx = ((crc ^ byte as u16) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC16_TABLE[idx];
    }
    crc
}

/// RTU inter-frame silence: the greater of 3.5 character times (11 bits per
/// character) and the 1.75 ms floor the standard fixes above 19200 baud.
pub fn rtu_inter_frame_gap(baud: u32) -> Duration {
    if baud == 0 {
        return Duration::from_micros(1750);
    }
    let char_time_us = 11_000_000u64 / baud as u64;
    let gap_us = (char_time_us * 35) / 10;
    Duration::from_micros(gap_us.max(1750))
}

/// MBAP (Modbus Application Protocol) header for TCP mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus
    pub protocol_id: u16,
    /// Byte count of the fields that follow (unit id + PDU)
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_length: u16) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_length + 1,
            unit_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; MBAP_HEADER_LEN] {
        let mut bytes = [0u8; MBAP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(UmdtError::frame(FrameReason::Truncated, data));
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        })
    }

    /// Total ADU length including the header itself.
    pub fn frame_length(&self) -> usize {
        MBAP_HEADER_LEN + self.length.max(1) as usize - 1
    }

    /// PDU byte count (length field minus the unit id).
    pub fn pdu_length(&self) -> usize {
        self.length.max(1) as usize - 1
    }
}

/// RTU frame: unit id + PDU + little-endian CRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub unit_id: u8,
    pub pdu: Vec<u8>,
    pub crc: u16,
}

impl RtuFrame {
    pub fn new(unit_id: u8, pdu: Vec<u8>) -> Self {
        let mut body = Vec::with_capacity(1 + pdu.len());
        body.push(unit_id);
        body.extend_from_slice(&pdu);
        let crc = crc16(&body);
        Self { unit_id, pdu, crc }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.pdu.len() + 2);
        bytes.push(self.unit_id);
        bytes.extend_from_slice(&self.pdu);
        bytes.extend_from_slice(&self.crc.to_le_bytes());
        bytes
    }
}

/// TCP frame: MBAP header + PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFrame {
    pub header: MbapHeader,
    pub pdu: Vec<u8>,
}

impl TcpFrame {
    pub fn new(transaction_id: u16, unit_id: u8, pdu: Vec<u8>) -> Self {
        let header = MbapHeader::new(transaction_id, unit_id, pdu.len() as u16);
        Self { header, pdu }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MBAP_HEADER_LEN + self.pdu.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.pdu);
        bytes
    }
}

/// Build a wire frame in the given mode from unit id + PDU.
///
/// `transaction_id` is used for TCP and ignored for RTU.
pub fn build_frame(mode: ModbusMode, unit_id: u8, pdu: Vec<u8>, transaction_id: u16) -> Vec<u8> {
    match mode {
        ModbusMode::Tcp => TcpFrame::new(transaction_id, unit_id, pdu).to_bytes(),
        ModbusMode::Rtu => RtuFrame::new(unit_id, pdu).to_bytes(),
    }
}

/// A frame as received, malformed or not.
///
/// `valid` is the overall verdict; `crc_valid` is always true for TCP and
/// computed for RTU. When `valid` is false, `reason` says why and the parsed
/// fields hold a best-effort interpretation of whatever arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub mode: ModbusMode,
    pub raw: Vec<u8>,
    pub unit_id: u8,
    pub function: u8,
    pub payload: Vec<u8>,
    /// Present in TCP mode only
    pub transaction_id: Option<u16>,
    pub crc_valid: bool,
    pub valid: bool,
    pub reason: Option<FrameReason>,
}

impl CapturedFrame {
    /// Exception responses set the high bit of the function code.
    pub fn is_exception(&self) -> bool {
        self.function & 0x80 != 0
    }

    /// Exception code byte, when this is an exception response.
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.payload.first().copied()
        } else {
            None
        }
    }

    /// The PDU (function code + payload) without framing.
    pub fn pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.payload.len());
        pdu.push(self.function);
        pdu.extend_from_slice(&self.payload);
        pdu
    }

    /// Turn a malformed capture into the corresponding error.
    pub fn into_error(self) -> UmdtError {
        UmdtError::frame(self.reason.unwrap_or(FrameReason::Truncated), self.raw)
    }

    fn invalid(mode: ModbusMode, raw: Vec<u8>, reason: FrameReason) -> Self {
        let unit_id = match mode {
            ModbusMode::Rtu => raw.first().copied().unwrap_or(0),
            ModbusMode::Tcp => raw.get(6).copied().unwrap_or(0),
        };
        let function = match mode {
            ModbusMode::Rtu => raw.get(1).copied().unwrap_or(0),
            ModbusMode::Tcp => raw.get(7).copied().unwrap_or(0),
        };
        let transaction_id = match mode {
            ModbusMode::Tcp if raw.len() >= 2 => Some(u16::from_be_bytes([raw[0], raw[1]])),
            _ => None,
        };
        Self {
            mode,
            raw,
            unit_id,
            function,
            payload: Vec::new(),
            transaction_id,
            crc_valid: false,
            valid: false,
            reason: Some(reason),
        }
    }
}

/// Permissively decode an RTU frame from a complete buffer (a silence gap or
/// explicit boundary has already been declared by the transport).
pub fn decode_rtu(raw: &[u8]) -> CapturedFrame {
    if raw.len() < 4 {
        return CapturedFrame::invalid(ModbusMode::Rtu, raw.to_vec(), FrameReason::Truncated);
    }
    if raw.len() > MAX_RTU_FRAME {
        return CapturedFrame::invalid(ModbusMode::Rtu, raw.to_vec(), FrameReason::Oversize);
    }

    let pdu_end = raw.len() - 2;
    let received_crc = u16::from_le_bytes([raw[pdu_end], raw[pdu_end + 1]]);
    let computed_crc = crc16(&raw[..pdu_end]);
    let crc_valid = received_crc == computed_crc;

    if !crc_valid {
        tracing::debug!(
            "[Frame] RTU CRC mismatch - expected 0x{:04X}, got 0x{:04X}, raw {}",
            computed_crc,
            received_crc,
            hex::encode_upper(raw)
        );
    }

    CapturedFrame {
        mode: ModbusMode::Rtu,
        raw: raw.to_vec(),
        unit_id: raw[0],
        function: raw[1],
        payload: raw[2..pdu_end].to_vec(),
        transaction_id: None,
        crc_valid,
        valid: crc_valid,
        reason: if crc_valid { None } else { Some(FrameReason::Crc) },
    }
}

/// Permissively decode a TCP frame from a complete buffer.
pub fn decode_tcp(raw: &[u8]) -> CapturedFrame {
    if raw.len() < MBAP_HEADER_LEN + 1 {
        return CapturedFrame::invalid(ModbusMode::Tcp, raw.to_vec(), FrameReason::Truncated);
    }
    let header = match MbapHeader::from_bytes(raw) {
        Ok(h) => h,
        Err(_) => {
            return CapturedFrame::invalid(ModbusMode::Tcp, raw.to_vec(), FrameReason::Truncated)
        }
    };
    if raw.len() < header.frame_length() {
        return CapturedFrame::invalid(ModbusMode::Tcp, raw.to_vec(), FrameReason::Truncated);
    }

    let pdu = &raw[MBAP_HEADER_LEN..header.frame_length()];
    CapturedFrame {
        mode: ModbusMode::Tcp,
        raw: raw[..header.frame_length()].to_vec(),
        unit_id: header.unit_id,
        function: pdu[0],
        payload: pdu[1..].to_vec(),
        transaction_id: Some(header.transaction_id),
        crc_valid: true,
        valid: true,
        reason: None,
    }
}

/// Decode a complete frame in the given mode.
pub fn decode_frame(mode: ModbusMode, raw: &[u8]) -> CapturedFrame {
    match mode {
        ModbusMode::Tcp => decode_tcp(raw),
        ModbusMode::Rtu => decode_rtu(raw),
    }
}

/// Predict a complete RTU *request* frame length from the buffered bytes.
///
/// Returns `None` while more bytes are needed to decide.
pub fn expected_rtu_request_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let fc = buf[1];
    match fc {
        0x01..=0x06 => Some(8),
        0x0F | 0x10 => buf.get(6).map(|&bc| 9 + bc as usize),
        0x17 => buf.get(10).map(|&bc| 13 + bc as usize),
        0x2B => Some(7),
        _ => None,
    }
}

/// Predict a complete RTU *response* frame length from the buffered bytes.
pub fn expected_rtu_response_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let fc = buf[1];
    if fc & 0x80 != 0 {
        return Some(5);
    }
    match fc {
        0x01..=0x04 | 0x17 => buf.get(2).map(|&bc| 5 + bc as usize),
        0x05 | 0x06 | 0x0F | 0x10 => Some(8),
        // Device identification responses are object-list shaped; the
        // silence gap delimits them instead.
        0x2B => None,
        _ => None,
    }
}

/// All plausible frame lengths at a candidate start position, shortest
/// first. Used by the sniffer, which cannot know whether it is looking at a
/// request or a response.
pub fn candidate_rtu_lens(buf: &[u8]) -> Vec<usize> {
    let mut out = Vec::new();
    if buf.len() < 2 {
        return out;
    }
    let fc = buf[1];
    if fc & 0x80 != 0 {
        out.push(5);
        return out;
    }
    if let Some(len) = expected_rtu_request_len(buf) {
        out.push(len);
    }
    if let Some(len) = expected_rtu_response_len(buf) {
        if !out.contains(&len) {
            out.push(len);
        }
    }
    out.sort_unstable();
    out
}
