//! Value encoding for Modbus writes
//!
//! Turns operator input (decimal, `0x` hex, floats) into register payloads
//! with endian permutations applied, validating ranges against the target
//! width. A negative integer automatically selects signed interpretation.

use serde::{Deserialize, Serialize};

use crate::core::decoding::Endian;
use crate::utils::error::{Result, UmdtError};

/// Outcome of encoding a value: the registers to put on the wire plus how
/// the input was interpreted (surfaced in the pre-flight summary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedValue {
    pub registers: Vec<u16>,
    pub signed: bool,
    pub float: bool,
    /// Canonical rendering of the interpreted input
    pub interpretation: String,
}

/// Encode a 16-bit integer into one register.
pub fn encode_int16(value: i64, signed: bool, endian: Endian) -> Result<Vec<u16>> {
    let signed = signed || value < 0;
    if signed {
        if !(-0x8000..=0x7FFF).contains(&value) {
            return Err(UmdtError::invalid(format!(
                "value {value} out of 16-bit signed range (-32768 to 32767)"
            )));
        }
    } else if !(0..=0xFFFF).contains(&value) {
        return Err(UmdtError::invalid(format!(
            "value {value} out of 16-bit unsigned range (0 to 65535)"
        )));
    }

    let raw = (value as u16).to_be_bytes();
    Ok(vec![u16::from_be_bytes(endian.permute2(raw))])
}

/// Encode a 32-bit integer into two registers.
pub fn encode_int32(value: i64, signed: bool, endian: Endian) -> Result<Vec<u16>> {
    let signed = signed || value < 0;
    if signed {
        if !(-0x8000_0000..=0x7FFF_FFFF).contains(&value) {
            return Err(UmdtError::invalid(format!(
                "value {value} out of 32-bit signed range"
            )));
        }
    } else if !(0..=0xFFFF_FFFF).contains(&value) {
        return Err(UmdtError::invalid(format!(
            "value {value} out of 32-bit unsigned range"
        )));
    }

    let raw = (value as u32).to_be_bytes();
    let b = endian.permute4(raw);
    Ok(vec![
        u16::from_be_bytes([b[0], b[1]]),
        u16::from_be_bytes([b[2], b[3]]),
    ])
}

/// Convert an f64 to IEEE 754 binary16 bits with round-to-nearest;
/// out-of-range values overflow to infinity.
pub fn float_to_half_bits(value: f64) -> u16 {
    if value.is_nan() {
        return 0x7E00;
    }
    if value.is_infinite() {
        return if value > 0.0 { 0x7C00 } else { 0xFC00 };
    }

    let sign: u16 = if value.is_sign_negative() { 0x8000 } else { 0 };
    let mag = value.abs();
    if mag == 0.0 {
        return sign;
    }

    let exp = mag.log2().floor() as i32;
    let exp16 = exp + 15;
    if exp16 <= 0 {
        // subnormal
        let mant = (mag / 2f64.powi(-24)).round() as u32;
        if mant >= 1 << 10 {
            // rounded up into the normal range
            return sign | (1 << 10);
        }
        return sign | mant as u16;
    }
    if exp16 >= 0x1F {
        return sign | 0x7C00;
    }

    let frac = mag / 2f64.powi(exp) - 1.0;
    let mut mant = (frac * 1024.0).round() as u32;
    let mut exp16 = exp16 as u32;
    if mant == 1024 {
        mant = 0;
        exp16 += 1;
        if exp16 >= 0x1F {
            return sign | 0x7C00;
        }
    }
    sign | ((exp16 as u16) << 10) | (mant as u16 & 0x3FF)
}

/// Encode a float into one register as binary16.
pub fn encode_float16(value: f64, endian: Endian) -> Vec<u16> {
    let raw = float_to_half_bits(value).to_be_bytes();
    vec![u16::from_be_bytes(endian.permute2(raw))]
}

/// Encode a float into two registers as binary32.
pub fn encode_float32(value: f64, endian: Endian) -> Vec<u16> {
    let raw = (value as f32).to_be_bytes();
    let b = endian.permute4(raw);
    vec![
        u16::from_be_bytes([b[0], b[1]]),
        u16::from_be_bytes([b[2], b[3]]),
    ]
}

/// Encode operator input text into registers.
///
/// Integers accept decimal and `0x` hex; floats reject hex. `long` selects
/// 32-bit (two registers). A negative integer forces signed mode.
pub fn encode_value(
    text: &str,
    long: bool,
    endian: Endian,
    float: bool,
    signed: bool,
) -> Result<EncodedValue> {
    let text = text.trim();
    let is_hex = text.len() > 2 && text[..2].eq_ignore_ascii_case("0x");

    if float {
        if is_hex {
            return Err(UmdtError::invalid("hex values are not allowed with float mode"));
        }
        let value: f64 = text
            .parse()
            .map_err(|_| UmdtError::invalid("value must be a valid float in float mode"))?;
        let registers = if long {
            encode_float32(value, endian)
        } else {
            encode_float16(value, endian)
        };
        return Ok(EncodedValue {
            registers,
            signed: false,
            float: true,
            interpretation: format!("{value}"),
        });
    }

    let value: i64 = if is_hex {
        i64::from_str_radix(&text[2..], 16)
            .map_err(|_| UmdtError::invalid("value must be an integer or 0xHEX"))?
    } else {
        text.parse()
            .map_err(|_| UmdtError::invalid("value must be an integer or 0xHEX"))?
    };

    let signed = signed || value < 0;
    let registers = if long {
        encode_int32(value, signed, endian)?
    } else {
        encode_int16(value, signed, endian)?
    };
    Ok(EncodedValue {
        registers,
        signed,
        float: false,
        interpretation: if is_hex {
            format!("0x{value:X}")
        } else {
            value.to_string()
        },
    })
}
