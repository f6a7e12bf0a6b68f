//! Input parsing helpers shared by probe combination building and the
//! front-end surfaces: CSV/range expansion, host:port and serial:baud
//! splitting, hex-aware address parsing.

use crate::utils::error::{Result, UmdtError};

/// Expand a CSV string with embedded numeric ranges into individual items.
///
/// `"1,5-8,10"` becomes `["1","5","6","7","8","10"]`; reverse ranges count
/// down; non-numeric entries pass through untouched (`"COM1,COM3"`).
pub fn expand_csv_or_range(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in input.split(',') {
        let p = part.trim();
        if p.is_empty() {
            continue;
        }
        let looks_like_range =
            p.matches('-').count() == 1 && !p.starts_with('-') && !p.ends_with('-');
        if looks_like_range {
            let (a, b) = p.split_once('-').expect("checked above");
            match (parse_int(a), parse_int(b)) {
                (Ok(ia), Ok(ib)) => {
                    if ia <= ib {
                        for v in ia..=ib {
                            out.push(v.to_string());
                        }
                    } else {
                        for v in (ib..=ia).rev() {
                            out.push(v.to_string());
                        }
                    }
                }
                _ => out.push(p.to_string()),
            }
        } else {
            out.push(p.to_string());
        }
    }
    out
}

/// Expand a CSV/range string into integers, skipping non-numeric items.
pub fn expand_int_range(input: &str) -> Vec<i64> {
    expand_csv_or_range(input)
        .iter()
        .filter_map(|s| parse_int(s).ok())
        .collect()
}

/// Split `host[:port]`, falling back to `default_port`.
pub fn parse_host_port(input: &str, default_port: u16) -> Result<(String, u16)> {
    let s = input.trim();
    match s.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| UmdtError::invalid(format!("invalid port number: {port}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((s.to_string(), default_port)),
    }
}

/// Split `path[:baud]`, falling back to `default_baud`.
pub fn parse_serial_baud(input: &str, default_baud: u32) -> Result<(String, u32)> {
    let s = input.trim();
    match s.rsplit_once(':') {
        Some((path, baud)) => {
            let baud: u32 = baud
                .parse()
                .map_err(|_| UmdtError::invalid(format!("invalid baud rate: {baud}")))?;
            Ok((path.to_string(), baud))
        }
        None => Ok((s.to_string(), default_baud)),
    }
}

/// Parse a decimal or `0x`-prefixed address, remembering which format the
/// caller used so output can match.
pub fn parse_address(input: &str) -> Result<(u16, bool)> {
    let s = input.trim();
    if s.is_empty() {
        return Err(UmdtError::invalid("address cannot be empty"));
    }
    let was_hex = s.len() > 2 && s[..2].eq_ignore_ascii_case("0x");
    let value = parse_int(s)
        .map_err(|_| UmdtError::invalid(format!("invalid address format: {s}")))?;
    if !(0..=0xFFFF).contains(&value) {
        return Err(UmdtError::invalid(format!("address {value} exceeds 65535")));
    }
    Ok((value as u16, was_hex))
}

/// Format an address back in the caller's preferred base.
pub fn format_address(value: u16, as_hex: bool) -> String {
    if as_hex {
        format!("0x{value:X}")
    } else {
        value.to_string()
    }
}

fn parse_int(s: &str) -> std::result::Result<i64, std::num::ParseIntError> {
    let t = s.trim();
    if t.len() > 2 && t[..2].eq_ignore_ascii_case("0x") {
        i64::from_str_radix(&t[2..], 16)
    } else {
        t.parse()
    }
}
