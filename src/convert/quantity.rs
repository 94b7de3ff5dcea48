//! Resource quantity rendering
//!
//! Compose expresses CPU as a decimal count and memory as bytes. Both are
//! rendered in the canonical form the API server stores them in, so that the
//! observed object compares equal to the desired one.

use crate::error::{Error, Result};

fn invalid(value: &str, reason: &str) -> Error {
    Error::InvalidQuantity {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Render a decimal CPU count (`"0.5"`, `"2"`, `"1.25"`) as a quantity.
///
/// Whole numbers stay as-is, fractions become millicores. Precision below a
/// millicore is rejected.
pub fn cpus(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(value, "empty"));
    }
    let (whole, fraction) = match trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (trimmed, ""),
    };
    let whole = if whole.is_empty() { "0" } else { whole };
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid(value, "not a decimal number"));
    }
    let fraction = fraction.trim_end_matches('0');
    if fraction.len() > 3 {
        return Err(invalid(value, "precision finer than 1m"));
    }

    let whole: u64 = whole
        .parse()
        .map_err(|_| invalid(value, "out of range"))?;
    if fraction.is_empty() {
        return Ok(whole.to_string());
    }
    let milli: u64 = format!("{fraction:0<3}")
        .parse()
        .map_err(|_| invalid(value, "out of range"))?;
    let total = whole
        .checked_mul(1000)
        .and_then(|w| w.checked_add(milli))
        .ok_or_else(|| invalid(value, "out of range"))?;
    Ok(format!("{total}m"))
}

/// Render a byte count in canonical binary-SI form (`134217728` -> `128Mi`).
pub fn memory(bytes: i64) -> Result<String> {
    if bytes < 0 {
        return Err(invalid(&bytes.to_string(), "negative"));
    }
    const SUFFIXES: [&str; 6] = ["Ei", "Pi", "Ti", "Gi", "Mi", "Ki"];
    if bytes == 0 {
        return Ok("0".to_string());
    }
    for (i, suffix) in SUFFIXES.iter().enumerate() {
        let unit = 1i64 << (10 * (SUFFIXES.len() - i));
        if bytes % unit == 0 {
            return Ok(format!("{}{}", bytes / unit, suffix));
        }
    }
    Ok(bytes.to_string())
}
