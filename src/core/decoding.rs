//! Register decoding across endian permutations
//!
//! Turns raw 16-bit registers into display rows with every useful numeric
//! interpretation (hex, unsigned, signed, float16, float32). A 32-bit value
//! spread over two registers can arrive in any of four byte orders; the
//! `All` mode produces one row per permutation so an operator can spot the
//! plausible one at a glance.

use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, UmdtError};

/// Byte order for multi-register values.
///
/// With input bytes labelled ABCD (big-endian register order):
/// `Big` = ABCD, `Little` = DCBA, `MidBig` = CDAB, `MidLittle` = BADC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Endian {
    Big,
    Little,
    MidBig,
    MidLittle,
}

impl Endian {
    /// Display label matching the diagnostic table headers.
    pub fn label(&self) -> &'static str {
        match self {
            Endian::Big => "Big",
            Endian::Little => "Little",
            Endian::MidBig => "Mid-Big",
            Endian::MidLittle => "Mid-Little",
        }
    }

    /// The four 32-bit permutations in display order.
    pub const ALL: [Endian; 4] = [Endian::Big, Endian::Little, Endian::MidBig, Endian::MidLittle];

    /// Apply this permutation to 4 big-endian bytes.
    pub fn permute4(&self, b: [u8; 4]) -> [u8; 4] {
        match self {
            Endian::Big => b,
            Endian::Little => [b[3], b[2], b[1], b[0]],
            Endian::MidBig => [b[2], b[3], b[0], b[1]],
            Endian::MidLittle => [b[1], b[0], b[3], b[2]],
        }
    }

    /// Apply this permutation to 2 big-endian bytes (16-bit values know only
    /// big and little).
    pub fn permute2(&self, b: [u8; 2]) -> [u8; 2] {
        match self {
            Endian::Big | Endian::MidBig => b,
            Endian::Little | Endian::MidLittle => [b[1], b[0]],
        }
    }

    /// Parse the user-facing spelling (`big`, `l`, `mid-big`, `mb`, ...).
    pub fn parse(text: &str) -> Result<Endian> {
        match text.to_ascii_lowercase().as_str() {
            "b" | "big" => Ok(Endian::Big),
            "l" | "little" => Ok(Endian::Little),
            "mb" | "mid-big" | "midbig" => Ok(Endian::MidBig),
            "ml" | "mid-little" | "midlittle" => Ok(Endian::MidLittle),
            other => Err(UmdtError::invalid(format!("unknown endian format: {other}"))),
        }
    }
}

/// A single permutation, or "show me all four".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndianMode {
    One(Endian),
    All,
}

impl EndianMode {
    pub fn parse(text: &str) -> Result<EndianMode> {
        if text.eq_ignore_ascii_case("all") {
            Ok(EndianMode::All)
        } else {
            Endian::parse(text).map(EndianMode::One)
        }
    }

    /// The permutations this mode selects.
    pub fn endians(&self) -> Vec<Endian> {
        match self {
            EndianMode::One(e) => vec![*e],
            EndianMode::All => Endian::ALL.to_vec(),
        }
    }
}

/// Float interpretation: a number, or a sentinel for the bit patterns that
/// mean "the sensor is lying to you".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatValue {
    Number(f64),
    /// NaN payloads, conventionally a failed transducer
    SensorFault,
    /// +/- infinity
    Overflow,
}

impl FloatValue {
    fn from_f64(v: f64) -> Self {
        if v.is_nan() {
            FloatValue::SensorFault
        } else if v.is_infinite() {
            FloatValue::Overflow
        } else {
            FloatValue::Number(v)
        }
    }

    /// Numeric value, if this is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FloatValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Table cell rendering.
    pub fn display(&self) -> String {
        match self {
            FloatValue::Number(v) => format!("{v:.6e}"),
            FloatValue::SensorFault => "SENSOR FAULT".to_string(),
            FloatValue::Overflow => "OVERFLOW".to_string(),
        }
    }
}

/// Decode 2 big-endian bytes as IEEE 754 binary16.
pub fn float16_from_bytes(b: [u8; 2]) -> FloatValue {
    let h = u16::from_be_bytes(b);
    let sign = if h & 0x8000 != 0 { -1.0f64 } else { 1.0 };
    let exp = ((h >> 10) & 0x1F) as i32;
    let frac = (h & 0x3FF) as f64;

    if exp == 0 {
        // zero or subnormal
        return FloatValue::Number(sign * (frac / 1024.0) * 2f64.powi(-14));
    }
    if exp == 0x1F {
        return if frac == 0.0 {
            FloatValue::Overflow
        } else {
            FloatValue::SensorFault
        };
    }
    FloatValue::Number(sign * (1.0 + frac / 1024.0) * 2f64.powi(exp - 15))
}

/// Decode 4 big-endian bytes as IEEE 754 binary32.
pub fn float32_from_bytes(b: [u8; 4]) -> FloatValue {
    FloatValue::from_f64(f32::from_be_bytes(b) as f64)
}

/// One row of decoded values for one endian format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodingRow {
    pub format: Endian,
    pub hex16: String,
    pub uint16: u16,
    pub int16: i16,
    pub float16: FloatValue,
    /// 32-bit columns, present when two registers were decoded
    pub hex32: Option<String>,
    pub uint32: Option<u32>,
    pub int32: Option<i32>,
    pub float32: Option<FloatValue>,
}

/// Complete decoding result for a register or register pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodingResult {
    pub rows: Vec<DecodingRow>,
    pub is_32bit: bool,
    /// Original big-endian bytes for reference
    pub raw: Vec<u8>,
}

/// Decode a single 16-bit register.
pub fn decode_register16(value: u16, mode: EndianMode) -> DecodingResult {
    let raw = value.to_be_bytes();
    let endians = match mode {
        EndianMode::One(e) => vec![e],
        // 16-bit values only have two distinct orders
        EndianMode::All => vec![Endian::Big, Endian::Little],
    };

    let rows = endians
        .into_iter()
        .map(|endian| {
            let b = endian.permute2(raw);
            let uint16 = u16::from_be_bytes(b);
            DecodingRow {
                format: endian,
                hex16: format!("0x{}", hex::encode_upper(b)),
                uint16,
                int16: uint16 as i16,
                float16: float16_from_bytes(b),
                hex32: None,
                uint32: None,
                int32: None,
                float32: None,
            }
        })
        .collect();

    DecodingResult {
        rows,
        is_32bit: false,
        raw: raw.to_vec(),
    }
}

/// Decode a register pair as a 32-bit value across endian permutations.
pub fn decode_registers32(reg1: u16, reg2: u16, mode: EndianMode) -> DecodingResult {
    let mut raw = [0u8; 4];
    raw[0..2].copy_from_slice(&reg1.to_be_bytes());
    raw[2..4].copy_from_slice(&reg2.to_be_bytes());

    let rows = mode
        .endians()
        .into_iter()
        .map(|endian| {
            let b = endian.permute4(raw);
            let uint32 = u32::from_be_bytes(b);
            let first = [b[0], b[1]];
            let uint16 = u16::from_be_bytes(first);
            DecodingRow {
                format: endian,
                hex16: format!("0x{}", hex::encode_upper(first)),
                uint16,
                int16: uint16 as i16,
                float16: float16_from_bytes(first),
                hex32: Some(format!("0x{}", hex::encode_upper(b))),
                uint32: Some(uint32),
                int32: Some(uint32 as i32),
                float32: Some(float32_from_bytes(b)),
            }
        })
        .collect();

    DecodingResult {
        rows,
        is_32bit: true,
        raw: raw.to_vec(),
    }
}

/// Main decode entry point: one register, or a pair in long mode.
pub fn decode_registers(registers: &[u16], long: bool, mode: EndianMode) -> DecodingResult {
    if long && registers.len() >= 2 {
        decode_registers32(registers[0], registers[1], mode)
    } else if let Some(&first) = registers.first() {
        decode_register16(first, mode)
    } else {
        DecodingResult {
            rows: Vec::new(),
            is_32bit: false,
            raw: Vec::new(),
        }
    }
}

/// Pull one typed value out of a register window for a given endian: the
/// happy path used by `read` once the operator has committed to an order.
pub fn value_f32(registers: &[u16], endian: Endian) -> Option<f32> {
    if registers.len() < 2 {
        return None;
    }
    let mut raw = [0u8; 4];
    raw[0..2].copy_from_slice(&registers[0].to_be_bytes());
    raw[2..4].copy_from_slice(&registers[1].to_be_bytes());
    Some(f32::from_be_bytes(endian.permute4(raw)))
}

/// 32-bit unsigned view of a register pair for a given endian.
pub fn value_u32(registers: &[u16], endian: Endian) -> Option<u32> {
    if registers.len() < 2 {
        return None;
    }
    let mut raw = [0u8; 4];
    raw[0..2].copy_from_slice(&registers[0].to_be_bytes());
    raw[2..4].copy_from_slice(&registers[1].to_be_bytes());
    Some(u32::from_be_bytes(endian.permute4(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutations_distinct() {
        let raw = [0x41, 0x20, 0x00, 0x01];
        let outputs: Vec<[u8; 4]> = Endian::ALL.iter().map(|e| e.permute4(raw)).collect();
        assert_eq!(outputs[0], [0x41, 0x20, 0x00, 0x01]);
        assert_eq!(outputs[1], [0x01, 0x00, 0x20, 0x41]);
        assert_eq!(outputs[2], [0x00, 0x01, 0x41, 0x20]);
        assert_eq!(outputs[3], [0x20, 0x41, 0x01, 0x00]);
        for i in 0..4 {
            for j in i + 1..4 {
                assert_ne!(outputs[i], outputs[j]);
            }
        }
    }

    #[test]
    fn test_symmetric_bytes_collapse() {
        // AAAA permutes to itself everywhere
        let raw = [0xAA; 4];
        for e in Endian::ALL {
            assert_eq!(e.permute4(raw), raw);
        }
    }

    #[test]
    fn test_float32_big_endian_ten() {
        // 0x41200000 is 10.0f32
        let result = decode_registers(&[0x4120, 0x0000], true, EndianMode::One(Endian::Big));
        assert_eq!(result.rows.len(), 1);
        let row = &result.rows[0];
        assert_eq!(row.hex32.as_deref(), Some("0x41200000"));
        assert_eq!(row.float32, Some(FloatValue::Number(10.0)));
        assert_eq!(row.uint32, Some(0x41200000));
        assert_eq!(value_f32(&[0x4120, 0x0000], Endian::Big), Some(10.0));
    }

    #[test]
    fn test_decode_all_permutations_table() {
        let result = decode_registers(&[0x4120, 0x0000], true, EndianMode::All);
        assert!(result.is_32bit);
        assert_eq!(result.rows.len(), 4);
        assert_eq!(result.rows[0].format, Endian::Big);

        // Little: bytes 00 00 20 41 -> 0x2041 * 2^-149 ~= 1.157e-41 (subnormal)
        let little = result.rows[1].float32.clone().unwrap().as_f64().unwrap();
        assert!(little > 1.0e-41 && little < 1.3e-41);

        // Mid-Big: bytes 00 00 41 20 -> tiny subnormal, not 10.0
        let mid_big = result.rows[2].float32.clone().unwrap().as_f64().unwrap();
        assert!(mid_big.abs() < 1e-38);
    }

    #[test]
    fn test_decode16_modes() {
        let one = decode_register16(0x1234, EndianMode::One(Endian::Big));
        assert_eq!(one.rows.len(), 1);
        assert_eq!(one.rows[0].uint16, 0x1234);

        let all = decode_register16(0x1234, EndianMode::All);
        assert_eq!(all.rows.len(), 2);
        assert_eq!(all.rows[1].format, Endian::Little);
        assert_eq!(all.rows[1].uint16, 0x3412);
    }

    #[test]
    fn test_int16_sign() {
        let result = decode_register16(0xFFFE, EndianMode::One(Endian::Big));
        assert_eq!(result.rows[0].int16, -2);
    }

    #[test]
    fn test_float16_values() {
        // 0x3C00 = 1.0 in binary16
        assert_eq!(
            float16_from_bytes([0x3C, 0x00]),
            FloatValue::Number(1.0)
        );
        // 0xC000 = -2.0
        assert_eq!(
            float16_from_bytes([0xC0, 0x00]),
            FloatValue::Number(-2.0)
        );
        // 0x7C00 = +inf
        assert_eq!(float16_from_bytes([0x7C, 0x00]), FloatValue::Overflow);
        // 0x7E00 = NaN
        assert_eq!(float16_from_bytes([0x7E, 0x00]), FloatValue::SensorFault);
        // zero
        assert_eq!(float16_from_bytes([0x00, 0x00]), FloatValue::Number(0.0));
    }

    #[test]
    fn test_float_sentinels() {
        assert_eq!(
            float32_from_bytes([0x7F, 0xC0, 0x00, 0x00]),
            FloatValue::SensorFault
        );
        assert_eq!(
            float32_from_bytes([0x7F, 0x80, 0x00, 0x00]),
            FloatValue::Overflow
        );
        assert_eq!(FloatValue::SensorFault.display(), "SENSOR FAULT");
        assert_eq!(FloatValue::Overflow.display(), "OVERFLOW");
    }

    #[test]
    fn test_endian_parsing() {
        assert_eq!(Endian::parse("big").unwrap(), Endian::Big);
        assert_eq!(Endian::parse("mb").unwrap(), Endian::MidBig);
        assert_eq!(EndianMode::parse("all").unwrap(), EndianMode::All);
        assert!(Endian::parse("sideways").is_err());
    }

    #[test]
    fn test_empty_input() {
        let result = decode_registers(&[], false, EndianMode::All);
        assert!(result.rows.is_empty());
    }
}
