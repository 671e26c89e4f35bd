//! Arbitrary-precision `bigint` and `decimal` encoding.
//!
//! Both use the base-10000 numeric layout:
//! - UInt16: number of digits
//! - Int16: weight (position of the first digit, in base-10000 units)
//! - UInt16: sign (0x0000 positive, 0x4000 negative)
//! - UInt16: display scale (decimal digits after the point)
//! - UInt16[]: digits, most significant first

use bytes::{BufMut, BytesMut};

use crate::error::{Error, ErrorKind, Result};
use crate::wire::buffer::ReadBuffer;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;

/// Largest number of base-10 digits left of the point: the weight is an
/// Int16, so at most `i16::MAX + 1` integral base-10000 digits.
const MAX_INT_DIGITS: i64 = (i16::MAX as i64 + 1) * 4;
/// Display scale is a UInt16.
const MAX_FRAC_DIGITS: i64 = u16::MAX as i64;

fn invalid(message: String) -> Error {
    Error::new(ErrorKind::InvalidArgumentError, message)
}

/// Group a string of decimal digits into base-10000 digits.
///
/// `digits.len()` must be a multiple of four.
fn base10000(digits: &str) -> Vec<u16> {
    digits
        .as_bytes()
        .chunks(4)
        .map(|chunk| chunk.iter().fold(0u16, |acc, d| acc * 10 + (d - b'0') as u16))
        .collect()
}

fn write_numeric(
    buf: &mut BytesMut,
    digits: &[u16],
    weight: i16,
    negative: bool,
    dscale: u16,
) -> Result<()> {
    let ndigits = u16::try_from(digits.len())
        .map_err(|_| invalid(format!("too many numeric digits: {}", digits.len())))?;
    let len = i32::from(ndigits)
        .checked_mul(2)
        .and_then(|n| n.checked_add(8))
        .ok_or_else(|| invalid(format!("too many numeric digits: {}", digits.len())))?;
    buf.put_i32(len);
    buf.put_u16(ndigits);
    buf.put_i16(weight);
    buf.put_u16(if negative { NUMERIC_NEG } else { NUMERIC_POS });
    buf.put_u16(dscale);
    for d in digits {
        buf.put_u16(*d);
    }
    Ok(())
}

// ============================================================================
// bigint
// ============================================================================

/// Encode an integer given in decimal notation.
pub(crate) fn encode_bigint(buf: &mut BytesMut, text: &str) -> Result<()> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(format!("a bigint was expected, got \"{}\"", text)));
    }

    let body = body.trim_start_matches('0');
    if body.is_empty() {
        return write_numeric(buf, &[], 0, false, 0);
    }
    if body.len() as i64 > MAX_INT_DIGITS {
        return Err(invalid(format!(
            "bigint value out of range: {} digits",
            body.len()
        )));
    }

    let padded = format!("{:0>width$}", body, width = body.len().div_ceil(4) * 4);
    let digits = base10000(&padded);
    // At most 32768 groups, so the weight fits an Int16
    let weight = (digits.len() - 1) as i16;
    write_numeric(buf, &digits, weight, negative, 0)
}

fn read_sign(buf: &mut ReadBuffer, what: &str) -> Result<bool> {
    match buf.read_u16()? {
        NUMERIC_POS => Ok(false),
        NUMERIC_NEG => Ok(true),
        _ => Err(Error::new(
            ErrorKind::ProtocolError,
            format!("bad {} sign data", what),
        )),
    }
}

pub(crate) fn decode_bigint(buf: &mut ReadBuffer) -> Result<String> {
    let ndigits = buf.read_u16()? as i32;
    let weight = buf.read_i16()? as i32;
    let negative = read_sign(buf, "bigint")?;
    let dscale = buf.read_u16()?;

    if dscale != 0 {
        return Err(Error::new(
            ErrorKind::ProtocolError,
            "bigint data has fractional part",
        ));
    }
    if ndigits == 0 {
        return Ok("0".to_string());
    }

    let mut result = String::new();
    if negative {
        result.push('-');
    }

    let mut d = 0;
    for _ in (0..=weight).rev() {
        if d < ndigits {
            let digit = buf.read_u16()?;
            if d > 0 {
                result.push_str(&format!("{:04}", digit));
            } else {
                result.push_str(&digit.to_string());
            }
            d += 1;
        } else {
            result.push_str("0000");
        }
    }

    Ok(result)
}

// ============================================================================
// decimal
// ============================================================================

struct DecimalParts<'a> {
    negative: bool,
    int: &'a str,
    frac: &'a str,
    exp: i64,
}

/// Parse `-?[0-9]+(\.[0-9]+)?([eE][-+]?[0-9]+)?`.
fn parse_decimal(text: &str) -> Option<DecimalParts<'_>> {
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    let (mantissa, exp) = match rest.find(['e', 'E']) {
        Some(pos) => {
            let exp_text = &rest[pos + 1..];
            let digits = exp_text
                .strip_prefix('+')
                .or_else(|| exp_text.strip_prefix('-'))
                .unwrap_or(exp_text);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            (&rest[..pos], exp_text.parse::<i64>().ok()?)
        }
        None => (rest, 0),
    };

    let (int, frac) = match mantissa.split_once('.') {
        Some((int, frac)) => {
            if frac.is_empty() {
                return None;
            }
            (int, frac)
        }
        None => (mantissa, ""),
    };

    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if int.is_empty() || !all_digits(int) || !all_digits(frac) {
        return None;
    }

    Some(DecimalParts {
        negative,
        int,
        frac,
        exp,
    })
}

/// Encode a decimal given in plain or scientific notation.
pub(crate) fn encode_decimal(buf: &mut BytesMut, text: &str) -> Result<()> {
    let parts = parse_decimal(text)
        .ok_or_else(|| invalid(format!("invalid decimal string \"{}\"", text)))?;

    let out_of_range = || invalid(format!("decimal value out of range: \"{}\"", text));

    // Size the shifted integral and fractional parts before building strings
    let ndigits = (parts.int.len() + parts.frac.len()) as i64;
    let point = (parts.int.len() as i64)
        .checked_add(parts.exp)
        .ok_or_else(out_of_range)?;
    let (int_len, frac_len) = if point < 0 {
        (0, ndigits.checked_sub(point).ok_or_else(out_of_range)?)
    } else {
        (point, (ndigits - point).max(0))
    };
    if int_len > MAX_INT_DIGITS || frac_len > MAX_FRAC_DIGITS {
        return Err(out_of_range());
    }

    // Move the decimal point by the exponent before grouping digits
    let mut digits = format!("{}{}", parts.int, parts.frac);
    if point < 0 {
        digits.insert_str(0, &"0".repeat((frac_len - ndigits) as usize));
    }
    let int_len = int_len as usize;
    if int_len > digits.len() {
        digits.push_str(&"0".repeat(int_len - digits.len()));
    }

    let (int, frac) = digits.split_at(int_len);
    let int_width = int.len().div_ceil(4) * 4;
    let frac_width = frac.len().div_ceil(4) * 4;
    let sdigits = format!("{:0>iw$}{:0<fw$}", int, frac, iw = int_width, fw = frac_width);
    let groups = base10000(&sdigits);

    let weight = ((int_width / 4) as i32 - 1) as i16;
    write_numeric(buf, &groups, weight, parts.negative, frac.len() as u16)
}

pub(crate) fn decode_decimal(buf: &mut ReadBuffer) -> Result<String> {
    let ndigits = buf.read_u16()? as i32;
    let weight = buf.read_i16()? as i32;
    let negative = read_sign(buf, "decimal")?;
    let dscale = buf.read_u16()? as usize;

    let mut result = String::new();
    if negative {
        result.push('-');
    }

    let mut d: i32;
    if weight < 0 {
        d = weight + 1;
        result.push('0');
    } else {
        d = 0;
        while d <= weight {
            let digit = if d < ndigits { buf.read_u16()? } else { 0 };
            if d > 0 {
                result.push_str(&format!("{:04}", digit));
            } else {
                result.push_str(&digit.to_string());
            }
            d += 1;
        }
    }

    if dscale > 0 {
        result.push('.');
        let end = result.len() + dscale;
        let mut i = 0;
        while i < dscale {
            let digit = if d >= 0 && d < ndigits { buf.read_u16()? } else { 0 };
            result.push_str(&format!("{:04}", digit));
            d += 1;
            i += 4;
        }
        result.truncate(end);
    }

    Ok(result)
}
