//! Built-in scalar codecs.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::datetime;
use super::numeric;
use super::value::Value;
use crate::error::{Error, ErrorKind, Result};
use crate::wire::buffer::{checked_len, ReadBuffer};

/// Format marker preceding JSON text.
const JSON_FORMAT: u8 = 1;

/// Wire representation of a scalar type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Uuid,
    Str,
    Bytes,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    Bool,
    Datetime,
    LocalDatetime,
    LocalDate,
    LocalTime,
    Duration,
    Json,
    BigInt,
    RelativeDuration,
    DateDuration,
    ConfigMemory,
}

/// Codec for a built-in scalar or a scalar derived from one.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarCodec {
    pub id: Uuid,
    pub type_name: String,
    pub kind: ScalarKind,
}

fn mismatch(expected: &str, value: &Value) -> Error {
    Error::new(
        ErrorKind::InvalidArgumentError,
        format!("a {} was expected, got {}", expected, value.kind_name()),
    )
}

fn int_out_of_range(kind: &str, v: i64) -> Error {
    Error::new(
        ErrorKind::InvalidArgumentError,
        format!("{} is out of range for {}", v, kind),
    )
}

fn put_text(buf: &mut BytesMut, text: &str) -> Result<()> {
    buf.put_i32(checked_len(text.len())?);
    buf.put_slice(text.as_bytes());
    Ok(())
}

fn read_text(buf: &mut ReadBuffer) -> Result<String> {
    let raw = buf.consume();
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::new(ErrorKind::ProtocolError, "invalid UTF-8 in str value"))
}

impl ScalarCodec {
    pub fn new(id: Uuid, type_name: impl Into<String>, kind: ScalarKind) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            kind,
        }
    }

    /// Write `value` as a length-prefixed element.
    pub fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        match (self.kind, value) {
            (ScalarKind::Uuid, Value::Uuid(id)) => {
                buf.put_i32(16);
                buf.put_slice(id.as_bytes());
            }
            (ScalarKind::Str, Value::Str(s) | Value::Enum(s)) => put_text(buf, s)?,
            (ScalarKind::Bytes, Value::Bytes(b)) => {
                buf.put_i32(checked_len(b.len())?);
                buf.put_slice(b);
            }
            (ScalarKind::Int16, v) if v.as_i64().is_some() => {
                let n = v.as_i64().unwrap_or_default();
                let n = i16::try_from(n).map_err(|_| int_out_of_range("int16", n))?;
                buf.put_i32(2);
                buf.put_i16(n);
            }
            (ScalarKind::Int32, v) if v.as_i64().is_some() => {
                let n = v.as_i64().unwrap_or_default();
                let n = i32::try_from(n).map_err(|_| int_out_of_range("int32", n))?;
                buf.put_i32(4);
                buf.put_i32(n);
            }
            (ScalarKind::Int64, v) if v.as_i64().is_some() => {
                buf.put_i32(8);
                buf.put_i64(v.as_i64().unwrap_or_default());
            }
            (ScalarKind::Float32, Value::Float32(f)) => {
                buf.put_i32(4);
                buf.put_f32(*f);
            }
            (ScalarKind::Float32, Value::Float64(f)) => {
                buf.put_i32(4);
                buf.put_f32(*f as f32);
            }
            (ScalarKind::Float64, Value::Float64(f)) => {
                buf.put_i32(8);
                buf.put_f64(*f);
            }
            (ScalarKind::Float64, Value::Float32(f)) => {
                buf.put_i32(8);
                buf.put_f64(*f as f64);
            }
            (ScalarKind::Decimal, Value::Decimal(s) | Value::BigInt(s)) => {
                numeric::encode_decimal(buf, s)?
            }
            (ScalarKind::Decimal, v) if v.as_i64().is_some() => {
                numeric::encode_decimal(buf, &v.as_i64().unwrap_or_default().to_string())?
            }
            (ScalarKind::BigInt, Value::BigInt(s)) => numeric::encode_bigint(buf, s)?,
            (ScalarKind::BigInt, v) if v.as_i64().is_some() => {
                numeric::encode_bigint(buf, &v.as_i64().unwrap_or_default().to_string())?
            }
            (ScalarKind::Bool, Value::Bool(b)) => {
                buf.put_i32(1);
                buf.put_u8(*b as u8);
            }
            (ScalarKind::Datetime, Value::Datetime(dt)) => datetime::encode_datetime(buf, dt)?,
            (ScalarKind::LocalDatetime, Value::LocalDatetime(dt)) => {
                datetime::encode_local_datetime(buf, dt)?
            }
            (ScalarKind::LocalDate, Value::LocalDate(d)) => datetime::encode_local_date(buf, d)?,
            (ScalarKind::LocalTime, Value::LocalTime(t)) => datetime::encode_local_time(buf, t)?,
            (ScalarKind::Duration, Value::Duration(d)) => datetime::encode_duration(buf, d)?,
            (ScalarKind::RelativeDuration, Value::RelativeDuration(d)) => {
                datetime::encode_relative_duration(buf, d)?
            }
            (ScalarKind::DateDuration, Value::DateDuration(d)) => {
                datetime::encode_date_duration(buf, d)?
            }
            (ScalarKind::Json, Value::Json(text)) => {
                buf.put_i32(checked_len(text.len() + 1)?);
                buf.put_u8(JSON_FORMAT);
                buf.put_slice(text.as_bytes());
            }
            (ScalarKind::ConfigMemory, Value::ConfigMemory(n)) => {
                buf.put_i32(8);
                buf.put_i64(*n);
            }
            (ScalarKind::ConfigMemory, v) if v.as_i64().is_some() => {
                buf.put_i32(8);
                buf.put_i64(v.as_i64().unwrap_or_default());
            }
            (kind, v) => return Err(mismatch(kind.expected_name(), v)),
        }
        Ok(())
    }

    /// Decode one element payload (without its length prefix).
    pub fn decode(&self, buf: &mut ReadBuffer) -> Result<Value> {
        let value = match self.kind {
            ScalarKind::Uuid => Value::Uuid(buf.read_uuid()?),
            ScalarKind::Str => Value::Str(read_text(buf)?),
            ScalarKind::Bytes => Value::Bytes(Bytes::from(buf.consume().to_vec())),
            ScalarKind::Int16 => Value::Int16(buf.read_i16()?),
            ScalarKind::Int32 => Value::Int32(buf.read_i32()?),
            ScalarKind::Int64 => Value::Int64(buf.read_i64()?),
            ScalarKind::Float32 => Value::Float32(buf.read_f32()?),
            ScalarKind::Float64 => Value::Float64(buf.read_f64()?),
            ScalarKind::Decimal => Value::Decimal(numeric::decode_decimal(buf)?),
            ScalarKind::BigInt => Value::BigInt(numeric::decode_bigint(buf)?),
            ScalarKind::Bool => Value::Bool(buf.read_u8()? != 0),
            ScalarKind::Datetime => Value::Datetime(datetime::decode_datetime(buf)?),
            ScalarKind::LocalDatetime => {
                Value::LocalDatetime(datetime::decode_local_datetime(buf)?)
            }
            ScalarKind::LocalDate => Value::LocalDate(datetime::decode_local_date(buf)?),
            ScalarKind::LocalTime => Value::LocalTime(datetime::decode_local_time(buf)?),
            ScalarKind::Duration => Value::Duration(datetime::decode_duration(buf)?),
            ScalarKind::RelativeDuration => {
                Value::RelativeDuration(datetime::decode_relative_duration(buf)?)
            }
            ScalarKind::DateDuration => {
                Value::DateDuration(datetime::decode_date_duration(buf)?)
            }
            ScalarKind::Json => {
                let format = buf.read_u8()?;
                if format != JSON_FORMAT {
                    return Err(Error::new(
                        ErrorKind::ProtocolError,
                        format!("unexpected JSON format {}", format),
                    ));
                }
                Value::Json(read_text(buf)?)
            }
            ScalarKind::ConfigMemory => Value::ConfigMemory(buf.read_i64()?),
        };
        buf.finish()?;
        Ok(value)
    }
}

impl ScalarKind {
    fn expected_name(self) -> &'static str {
        match self {
            ScalarKind::Uuid => "uuid",
            ScalarKind::Str => "string",
            ScalarKind::Bytes => "bytes value",
            ScalarKind::Int16 | ScalarKind::Int32 | ScalarKind::Int64 => "integer",
            ScalarKind::Float32 | ScalarKind::Float64 => "float",
            ScalarKind::Decimal => "decimal string",
            ScalarKind::BigInt => "bigint",
            ScalarKind::Bool => "boolean",
            ScalarKind::Datetime => "datetime",
            ScalarKind::LocalDatetime => "local datetime",
            ScalarKind::LocalDate => "local date",
            ScalarKind::LocalTime => "local time",
            ScalarKind::Duration => "duration",
            ScalarKind::RelativeDuration => "relative duration",
            ScalarKind::DateDuration => "date duration",
            ScalarKind::Json => "JSON string",
            ScalarKind::ConfigMemory => "memory value",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::RelativeDuration;

    fn codec(kind: ScalarKind) -> ScalarCodec {
        ScalarCodec::new(Uuid::nil(), "test", kind)
    }

    fn roundtrip(kind: ScalarKind, value: Value) -> Value {
        let c = codec(kind);
        let mut buf = BytesMut::new();
        c.encode(&mut buf, &value).unwrap();
        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        c.decode(&mut ReadBuffer::from_slice(&buf[4..])).unwrap()
    }

    #[test]
    fn test_int_width_bounds() {
        assert_eq!(roundtrip(ScalarKind::Int16, Value::Int16(i16::MIN)), Value::Int16(i16::MIN));
        assert_eq!(roundtrip(ScalarKind::Int16, Value::Int16(i16::MAX)), Value::Int16(i16::MAX));
        assert_eq!(roundtrip(ScalarKind::Int32, Value::Int32(i32::MIN)), Value::Int32(i32::MIN));
        assert_eq!(roundtrip(ScalarKind::Int64, Value::Int64(i64::MAX)), Value::Int64(i64::MAX));
    }

    #[test]
    fn test_float_roundtrip() {
        for f in [0.0f32, -1.5, f32::MIN, f32::MAX, f32::INFINITY, f32::NEG_INFINITY] {
            assert_eq!(roundtrip(ScalarKind::Float32, Value::Float32(f)), Value::Float32(f));
        }
        for f in [0.0f64, 3.25, f64::MIN, f64::MAX, f64::INFINITY, f64::NEG_INFINITY] {
            assert_eq!(roundtrip(ScalarKind::Float64, Value::Float64(f)), Value::Float64(f));
        }
        match roundtrip(ScalarKind::Float64, Value::Float64(f64::NAN)) {
            Value::Float64(f) => assert!(f.is_nan()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_misc_scalar_roundtrip() {
        let id = Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef);
        let local = chrono::NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_micro_opt(13, 45, 30, 123_456)
            .unwrap();
        let before_epoch = chrono::NaiveDate::from_ymd_opt(1969, 7, 20)
            .unwrap()
            .and_hms_opt(20, 17, 0)
            .unwrap();
        let relative = RelativeDuration {
            months: -14,
            days: 3,
            micros: -1_500_000,
        };

        let cases = [
            (ScalarKind::Bool, Value::Bool(true)),
            (ScalarKind::Bool, Value::Bool(false)),
            (ScalarKind::Uuid, Value::Uuid(id)),
            (ScalarKind::Uuid, Value::Uuid(Uuid::nil())),
            (ScalarKind::ConfigMemory, Value::ConfigMemory(0)),
            (ScalarKind::ConfigMemory, Value::ConfigMemory(i64::MAX)),
            (ScalarKind::LocalDatetime, Value::LocalDatetime(local)),
            (ScalarKind::LocalDatetime, Value::LocalDatetime(before_epoch)),
            (ScalarKind::RelativeDuration, Value::RelativeDuration(relative)),
            (
                ScalarKind::RelativeDuration,
                Value::RelativeDuration(RelativeDuration::default()),
            ),
        ];
        for (kind, value) in cases {
            assert_eq!(roundtrip(kind, value.clone()), value, "{:?}", kind);
        }
    }

    #[test]
    fn test_int_narrowing() {
        // A wider value that fits is accepted
        assert_eq!(roundtrip(ScalarKind::Int16, Value::Int64(-5)), Value::Int16(-5));

        let mut buf = BytesMut::new();
        let err = codec(ScalarKind::Int16)
            .encode(&mut buf, &Value::Int32(40_000))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgumentError);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_str_and_bytes() {
        assert_eq!(roundtrip(ScalarKind::Str, Value::Str(String::new())), Value::Str(String::new()));
        assert_eq!(
            roundtrip(ScalarKind::Bytes, Value::Bytes(Bytes::new())),
            Value::Bytes(Bytes::new())
        );
    }

    #[test]
    fn test_json_format_byte() {
        let mut buf = BytesMut::new();
        codec(ScalarKind::Json)
            .encode(&mut buf, &Value::Json("{}".into()))
            .unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 3, 1, b'{', b'}']);

        let err = codec(ScalarKind::Json)
            .decode(&mut ReadBuffer::from_slice(&[2, b'{', b'}']))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn test_type_mismatch() {
        let mut buf = BytesMut::new();
        let err = codec(ScalarKind::Bool)
            .encode(&mut buf, &Value::Str("true".into()))
            .unwrap_err();
        assert_eq!(err.message(), "a boolean was expected, got str");
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let err = codec(ScalarKind::Int16)
            .decode(&mut ReadBuffer::from_slice(&[0, 1, 2]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BinaryProtocolError);
    }
}
