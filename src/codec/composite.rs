//! Container codecs: tuples, shapes, arrays, sets, ranges and enums.
//!
//! Encoders build the element payload in a scratch buffer and only append
//! it once every element has been validated, so a failed encode leaves the
//! output untouched.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use super::value::{QueryArgs, Range, Value};
use super::Codec;
use crate::error::{Error, ErrorKind, Result};
use crate::wire::buffer::{checked_len, ReadBuffer};
use crate::wire::protocol::Cardinality;

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn invalid(message: String) -> Error {
    Error::new(ErrorKind::InvalidArgumentError, message)
}

/// Append `[i32 len][payload]`.
fn put_block(buf: &mut BytesMut, payload: &[u8]) -> Result<()> {
    buf.put_i32(checked_len(payload.len())?);
    buf.put_slice(payload);
    Ok(())
}

/// Read one `i32`-prefixed element; `-1` decodes to [`Value::Nothing`].
pub(crate) fn decode_element(codec: &Codec, buf: &mut ReadBuffer) -> Result<Value> {
    match buf.read_nullable()? {
        None => Ok(Value::Nothing),
        Some(mut elem) => {
            let value = codec.decode(&mut elem)?;
            elem.finish()?;
            Ok(value)
        }
    }
}

/// Read the `ndims`, flags and reserved words that open arrays and sets.
///
/// Returns the element count, or `None` for a zero-dimension (empty) value.
fn read_array_header(buf: &mut ReadBuffer, what: &str) -> Result<Option<usize>> {
    let ndims = buf.read_i32()?;
    buf.skip(4)?; // flags
    buf.skip(4)?; // reserved
    if ndims == 0 {
        return Ok(None);
    }
    if ndims != 1 {
        return Err(Error::new(
            ErrorKind::ProtocolError,
            format!("only 1-dimensional {}s are supported, got {}", what, ndims),
        ));
    }
    let len = buf.read_u32()? as usize;
    buf.skip(4)?; // lower bound
    Ok(Some(len))
}

// ============================================================================
// Enum
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EnumCodec {
    pub id: Uuid,
    pub type_name: String,
    pub members: Vec<String>,
}

impl EnumCodec {
    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let label = match value {
            Value::Enum(s) | Value::Str(s) => s,
            other => {
                return Err(invalid(format!(
                    "a string was expected for enum {}, got {}",
                    self.type_name,
                    other.kind_name()
                )))
            }
        };
        if !self.members.is_empty() && !self.members.iter().any(|m| m == label) {
            return Err(invalid(format!(
                "'{}' is not a member of enum {}",
                label, self.type_name
            )));
        }
        put_block(buf, label.as_bytes())
    }

    fn decode(&self, buf: &mut ReadBuffer) -> Result<Value> {
        let raw = buf.consume();
        String::from_utf8(raw.to_vec())
            .map(Value::Enum)
            .map_err(|_| Error::new(ErrorKind::ProtocolError, "invalid UTF-8 in enum value"))
    }
}

// ============================================================================
// Array / Set
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayCodec {
    pub id: Uuid,
    pub type_name: String,
    pub element: Arc<Codec>,
    /// Fixed length, or -1 when unbounded.
    pub len: i32,
}

impl ArrayCodec {
    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        if !matches!(
            *self.element,
            Codec::Scalar(_)
                | Codec::Enum(_)
                | Codec::Tuple(_)
                | Codec::NamedTuple(_)
                | Codec::EmptyTuple
                | Codec::Range(_)
                | Codec::MultiRange(_)
        ) {
            return Err(invalid(
                "only arrays of scalars or tuples are supported".to_string(),
            ));
        }
        let Value::Array(items) = value else {
            return Err(invalid(format!(
                "an array was expected, got {}",
                value.kind_name()
            )));
        };

        let count = checked_len(items.len())?;
        let mut elems = BytesMut::new();
        for item in items {
            if item.is_nothing() {
                elems.put_i32(-1);
            } else {
                self.element.encode(&mut elems, item)?;
            }
        }

        buf.put_i32(checked_len(12 + 8 + elems.len())?);
        buf.put_i32(1); // ndims
        buf.put_i32(0); // flags
        buf.put_i32(0); // reserved
        buf.put_i32(count);
        buf.put_i32(1); // lower bound
        buf.put_slice(&elems);
        Ok(())
    }

    fn decode(&self, buf: &mut ReadBuffer) -> Result<Value> {
        let Some(len) = read_array_header(buf, "array")? else {
            return Ok(Value::Array(Vec::new()));
        };
        if self.len != -1 && len != self.len as usize {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!("invalid array size: received {}, expected {}", len, self.len),
            ));
        }
        let mut items = Vec::with_capacity(len.min(buf.remaining() / 4));
        for _ in 0..len {
            items.push(decode_element(&self.element, buf)?);
        }
        Ok(Value::Array(items))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetCodec {
    pub id: Uuid,
    pub element: Arc<Codec>,
}

impl SetCodec {
    fn decode(&self, buf: &mut ReadBuffer) -> Result<Value> {
        let Some(len) = read_array_header(buf, "set")? else {
            return Ok(Value::Set(Vec::new()));
        };
        let mut items = Vec::with_capacity(len.min(buf.remaining() / 4));

        if matches!(*self.element, Codec::Array(_)) {
            // Arrays inside sets travel in single-element record envelopes
            for _ in 0..len {
                buf.skip(4)?; // envelope size
                let rec_size = buf.read_u32()?;
                if rec_size != 1 {
                    return Err(Error::new(
                        ErrorKind::ProtocolError,
                        "expected a record with a single element as an array set element envelope",
                    ));
                }
                buf.skip(4)?; // reserved
                let value = decode_element(&self.element, buf)?;
                if value.is_nothing() {
                    return Err(Error::new(
                        ErrorKind::ProtocolError,
                        "unexpected NULL value in array set element",
                    ));
                }
                items.push(value);
            }
        } else {
            for _ in 0..len {
                items.push(decode_element(&self.element, buf)?);
            }
        }
        Ok(Value::Set(items))
    }
}

// ============================================================================
// Tuple / NamedTuple
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TupleCodec {
    pub id: Uuid,
    pub type_name: Option<String>,
    pub elements: Vec<Arc<Codec>>,
}

impl TupleCodec {
    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let Value::Tuple(items) = value else {
            return Err(invalid(format!(
                "a tuple was expected, got {}",
                value.kind_name()
            )));
        };
        let n = self.elements.len();
        if items.len() != n {
            return Err(invalid(format!(
                "expected {} tuple item{}, got {}",
                n,
                plural(n),
                items.len()
            )));
        }

        let mut elems = BytesMut::new();
        elems.put_i32(n as i32);
        for (i, (item, codec)) in items.iter().zip(&self.elements).enumerate() {
            if item.is_nothing() {
                return Err(Error::new(
                    ErrorKind::MissingArgumentError,
                    format!("element at index {} in tuple cannot be 'null'", i),
                ));
            }
            elems.put_i32(0); // reserved
            codec.encode(&mut elems, item)?;
        }
        put_block(buf, &elems)
    }

    fn decode(&self, buf: &mut ReadBuffer) -> Result<Value> {
        let count = buf.read_u32()? as usize;
        if count != self.elements.len() {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!(
                    "cannot decode Tuple: expected {} elements, got {}",
                    self.elements.len(),
                    count
                ),
            ));
        }
        let mut items = Vec::with_capacity(count);
        for codec in &self.elements {
            buf.skip(4)?; // reserved
            items.push(decode_element(codec, buf)?);
        }
        Ok(Value::Tuple(items))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedTupleCodec {
    pub id: Uuid,
    pub type_name: Option<String>,
    pub fields: Vec<(String, Arc<Codec>)>,
}

impl NamedTupleCodec {
    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let pairs = match value {
            Value::NamedTuple(pairs) | Value::Object(pairs) => pairs,
            other => {
                return Err(invalid(format!(
                    "a named tuple was expected, got {}",
                    other.kind_name()
                )))
            }
        };

        let extra: Vec<&str> = pairs
            .iter()
            .map(|(k, _)| k.as_str())
            .filter(|k| !self.fields.iter().any(|(name, _)| name == k))
            .collect();
        if !extra.is_empty() {
            return Err(Error::new(
                ErrorKind::UnknownArgumentError,
                format!(
                    "unexpected element{} in named tuple: '{}'",
                    plural(extra.len()),
                    extra.join("', '")
                ),
            ));
        }

        let mut elems = BytesMut::new();
        elems.put_i32(self.fields.len() as i32);
        for (name, codec) in &self.fields {
            let item = pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v)
                .filter(|v| !v.is_nothing())
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::MissingArgumentError,
                        format!("element '{}' in named tuple cannot be 'null'", name),
                    )
                })?;
            elems.put_i32(0); // reserved
            codec.encode(&mut elems, item)?;
        }
        put_block(buf, &elems)
    }

    fn decode(&self, buf: &mut ReadBuffer) -> Result<Value> {
        let count = buf.read_u32()? as usize;
        if count != self.fields.len() {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!(
                    "cannot decode NamedTuple: expected {} elements, got {}",
                    self.fields.len(),
                    count
                ),
            ));
        }
        let mut pairs = Vec::with_capacity(count);
        for (name, codec) in &self.fields {
            buf.skip(4)?; // reserved
            pairs.push((name.clone(), decode_element(codec, buf)?));
        }
        Ok(Value::NamedTuple(pairs))
    }
}

// ============================================================================
// Object shapes
// ============================================================================

/// Pointer flag: implicitly included field (`id`, `__tname__`).
pub const FIELD_IMPLICIT: u32 = 1 << 0;
/// Pointer flag: link property, exposed with an `@` prefix.
pub const FIELD_LINKPROP: u32 = 1 << 1;

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub name: String,
    pub flags: u32,
    pub cardinality: Cardinality,
    pub codec: Arc<Codec>,
}

impl ObjectField {
    pub fn new(name: String, flags: u32, cardinality: Cardinality, codec: Arc<Codec>) -> Self {
        let name = if flags & FIELD_LINKPROP != 0 {
            format!("@{}", name)
        } else {
            name
        };
        Self {
            name,
            flags,
            cardinality,
            codec,
        }
    }

    pub fn is_implicit(&self) -> bool {
        self.flags & FIELD_IMPLICIT != 0
    }

    fn is_required(&self) -> bool {
        matches!(self.cardinality, Cardinality::One | Cardinality::AtLeastOne)
    }
}

/// Output shape of a query, and the input shape of its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectCodec {
    pub id: Uuid,
    pub fields: Vec<ObjectField>,
}

impl ObjectCodec {
    fn decode(&self, buf: &mut ReadBuffer) -> Result<Value> {
        let count = buf.read_u32()? as usize;
        if count != self.fields.len() {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!(
                    "cannot decode Object: expected {} elements, got {}",
                    self.fields.len(),
                    count
                ),
            ));
        }
        let mut pairs = Vec::with_capacity(count);
        for field in &self.fields {
            buf.skip(4)?; // reserved
            pairs.push((field.name.clone(), decode_element(&field.codec, buf)?));
        }
        Ok(Value::Object(pairs))
    }

    /// Encode query arguments, including the outer length prefix.
    pub fn encode_args(&self, args: &QueryArgs) -> Result<BytesMut> {
        let positional = self
            .fields
            .first()
            .map(|f| f.name == "0")
            .unwrap_or(false);

        let values: Vec<&Value> = if positional {
            self.positional_values(args)?
        } else {
            self.named_values(args)?
        };

        let mut elems = BytesMut::new();
        for (field, value) in self.fields.iter().zip(values) {
            elems.put_i32(0); // reserved
            if value.is_nothing() {
                if field.is_required() {
                    return Err(Error::new(
                        ErrorKind::MissingArgumentError,
                        format!("argument {} is required, but received null", field.name),
                    ));
                }
                elems.put_i32(-1);
            } else {
                field.codec.encode(&mut elems, value)?;
            }
        }

        let mut out = BytesMut::with_capacity(elems.len() + 8);
        out.put_i32(checked_len(4 + elems.len())?);
        out.put_i32(self.fields.len() as i32);
        out.put_slice(&elems);
        Ok(out)
    }

    fn positional_values<'a>(&self, args: &'a QueryArgs) -> Result<Vec<&'a Value>> {
        let values: Vec<&Value> = match args {
            QueryArgs::Positional(values) => values.iter().collect(),
            QueryArgs::None => Vec::new(),
            QueryArgs::Named(_) => {
                return Err(invalid(
                    "positional arguments were expected, got named arguments".to_string(),
                ))
            }
        };
        let n = self.fields.len();
        if values.len() != n {
            return Err(Error::new(
                ErrorKind::QueryArgumentError,
                format!("expected {} argument{}, got {}", n, plural(n), values.len()),
            ));
        }
        Ok(values)
    }

    fn named_values<'a>(&self, args: &'a QueryArgs) -> Result<Vec<&'a Value>> {
        let pairs: &[(String, Value)] = match args {
            QueryArgs::Named(pairs) => pairs,
            QueryArgs::None => &[],
            QueryArgs::Positional(_) => {
                return Err(invalid(
                    "named arguments were expected, got positional arguments".to_string(),
                ))
            }
        };

        let extra: Vec<&str> = pairs
            .iter()
            .map(|(k, _)| k.as_str())
            .filter(|k| !self.fields.iter().any(|f| f.name == *k))
            .collect();
        if !extra.is_empty() {
            return Err(Error::new(
                ErrorKind::UnknownArgumentError,
                format!(
                    "Unused named argument{}: \"{}\"",
                    plural(extra.len()),
                    extra.join("\", \"")
                ),
            ));
        }

        Ok(self
            .fields
            .iter()
            .map(|f| {
                pairs
                    .iter()
                    .find(|(k, _)| *k == f.name)
                    .map(|(_, v)| v)
                    .unwrap_or(&Value::Nothing)
            })
            .collect())
    }
}

/// Input shape with optional members, used for session state.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseObjectCodec {
    pub id: Uuid,
    pub fields: Vec<(String, Arc<Codec>)>,
}

impl SparseObjectCodec {
    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let pairs = match value {
            Value::Object(pairs) | Value::NamedTuple(pairs) => pairs,
            other => {
                return Err(invalid(format!(
                    "an object was expected, got {}",
                    other.kind_name()
                )))
            }
        };

        let mut elems = BytesMut::new();
        for (key, item) in pairs {
            let index = self
                .fields
                .iter()
                .position(|(name, _)| name == key)
                .ok_or_else(|| self.unknown_key(key))?;
            elems.put_i32(index as i32);
            if item.is_nothing() {
                elems.put_i32(-1);
            } else {
                self.fields[index].1.encode(&mut elems, item)?;
            }
        }

        buf.put_i32(checked_len(4 + elems.len())?);
        buf.put_i32(pairs.len() as i32);
        buf.put_slice(&elems);
        Ok(())
    }

    fn unknown_key(&self, key: &str) -> Error {
        let message = if self.fields.is_empty() {
            format!("invalid global '{}', no valid globals exist", key)
        } else {
            let valid: Vec<String> = self.fields.iter().map(|(n, _)| format!("'{}'", n)).collect();
            format!("invalid global '{}', valid globals are {}", key, valid.join(", "))
        };
        Error::new(ErrorKind::UnknownArgumentError, message)
    }

    fn decode(&self, buf: &mut ReadBuffer) -> Result<Value> {
        let count = buf.read_u32()? as usize;
        let mut pairs = Vec::with_capacity(count.min(self.fields.len()));
        for _ in 0..count {
            let index = buf.read_u32()? as usize;
            let (name, codec) = self.fields.get(index).ok_or_else(|| {
                Error::new(
                    ErrorKind::ProtocolError,
                    format!("sparse object field index {} out of range", index),
                )
            })?;
            pairs.push((name.clone(), decode_element(codec, buf)?));
        }
        Ok(Value::Object(pairs))
    }
}

// ============================================================================
// Range / MultiRange
// ============================================================================

const RANGE_EMPTY: u8 = 1 << 0;
const RANGE_INC_LOWER: u8 = 1 << 1;
const RANGE_INC_UPPER: u8 = 1 << 2;
const RANGE_EMPTY_LOWER: u8 = 1 << 3;
const RANGE_EMPTY_UPPER: u8 = 1 << 4;

fn encode_range(buf: &mut BytesMut, range: &Range, element: &Codec) -> Result<()> {
    let mut bounds = BytesMut::new();
    let flags = if range.empty {
        RANGE_EMPTY
    } else {
        if let Some(lower) = &range.lower {
            element.encode(&mut bounds, lower)?;
        }
        if let Some(upper) = &range.upper {
            element.encode(&mut bounds, upper)?;
        }
        let mut flags = 0;
        if range.inc_lower {
            flags |= RANGE_INC_LOWER;
        }
        if range.inc_upper {
            flags |= RANGE_INC_UPPER;
        }
        if range.lower.is_none() {
            flags |= RANGE_EMPTY_LOWER;
        }
        if range.upper.is_none() {
            flags |= RANGE_EMPTY_UPPER;
        }
        flags
    };

    buf.put_i32(checked_len(1 + bounds.len())?);
    buf.put_u8(flags);
    buf.put_slice(&bounds);
    Ok(())
}

fn decode_range(buf: &mut ReadBuffer, element: &Codec) -> Result<Range> {
    let flags = buf.read_u8()?;
    if flags & RANGE_EMPTY != 0 {
        return Ok(Range::empty());
    }

    let mut read_bound = |buf: &mut ReadBuffer| -> Result<Option<Value>> {
        let mut elem = buf.read_nullable()?.ok_or_else(|| {
            Error::new(ErrorKind::ProtocolError, "unexpected NULL range bound")
        })?;
        let value = element.decode(&mut elem)?;
        elem.finish()?;
        Ok(Some(value))
    };

    let lower = if flags & RANGE_EMPTY_LOWER == 0 {
        read_bound(buf)?
    } else {
        None
    };
    let upper = if flags & RANGE_EMPTY_UPPER == 0 {
        read_bound(buf)?
    } else {
        None
    };

    Ok(Range::new(
        lower,
        upper,
        flags & RANGE_INC_LOWER != 0,
        flags & RANGE_INC_UPPER != 0,
    ))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeCodec {
    pub id: Uuid,
    pub type_name: String,
    pub element: Arc<Codec>,
}

impl RangeCodec {
    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        match value {
            Value::Range(range) => {
                let mut scratch = BytesMut::new();
                encode_range(&mut scratch, range, &self.element)?;
                buf.put_slice(&scratch);
                Ok(())
            }
            other => Err(invalid(format!(
                "a range was expected, got {}",
                other.kind_name()
            ))),
        }
    }

    fn decode(&self, buf: &mut ReadBuffer) -> Result<Value> {
        Ok(Value::Range(decode_range(buf, &self.element)?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiRangeCodec {
    pub id: Uuid,
    pub type_name: String,
    pub element: Arc<Codec>,
}

impl MultiRangeCodec {
    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let Value::MultiRange(ranges) = value else {
            return Err(invalid(format!(
                "a multirange was expected, got {}",
                value.kind_name()
            )));
        };
        let count = checked_len(ranges.len())?;
        let mut elems = BytesMut::new();
        for range in ranges {
            encode_range(&mut elems, range, &self.element).map_err(|e| {
                if e.is(ErrorKind::InvalidArgumentError) {
                    invalid(format!("invalid multirange element: {}", e.message()))
                } else {
                    e
                }
            })?;
        }
        buf.put_i32(checked_len(4 + elems.len())?);
        buf.put_i32(count);
        buf.put_slice(&elems);
        Ok(())
    }

    fn decode(&self, buf: &mut ReadBuffer) -> Result<Value> {
        let count = buf.read_i32()?;
        let count = usize::try_from(count).map_err(|_| {
            Error::new(ErrorKind::ProtocolError, "negative multirange element count")
        })?;
        let mut ranges = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            let mut elem = buf.read_nullable()?.ok_or_else(|| {
                Error::new(ErrorKind::ProtocolError, "unexpected NULL element in multirange")
            })?;
            ranges.push(decode_range(&mut elem, &self.element)?);
            elem.finish()?;
        }
        Ok(Value::MultiRange(ranges))
    }
}

// ============================================================================
// Dispatch helpers used by `Codec`
// ============================================================================

pub(super) fn encode_composite(codec: &Codec, buf: &mut BytesMut, value: &Value) -> Result<()> {
    match codec {
        Codec::Enum(c) => c.encode(buf, value),
        Codec::Array(c) => c.encode(buf, value),
        Codec::Set(_) => Err(invalid(
            "Sets cannot be passed in query arguments".to_string(),
        )),
        Codec::Tuple(c) => c.encode(buf, value),
        Codec::NamedTuple(c) => c.encode(buf, value),
        Codec::Object(_) => Err(invalid(
            "Objects cannot be passed as arguments".to_string(),
        )),
        Codec::SparseObject(c) => c.encode(buf, value),
        Codec::Range(c) => c.encode(buf, value),
        Codec::MultiRange(c) => c.encode(buf, value),
        Codec::Null | Codec::EmptyTuple | Codec::Scalar(_) => Err(Error::new(
            ErrorKind::InternalClientError,
            "not a composite codec",
        )),
    }
}

pub(super) fn decode_composite(codec: &Codec, buf: &mut ReadBuffer) -> Result<Value> {
    match codec {
        Codec::Enum(c) => c.decode(buf),
        Codec::Array(c) => c.decode(buf),
        Codec::Set(c) => c.decode(buf),
        Codec::Tuple(c) => c.decode(buf),
        Codec::NamedTuple(c) => c.decode(buf),
        Codec::Object(c) => c.decode(buf),
        Codec::SparseObject(c) => c.decode(buf),
        Codec::Range(c) => c.decode(buf),
        Codec::MultiRange(c) => c.decode(buf),
        Codec::Null | Codec::EmptyTuple | Codec::Scalar(_) => Err(Error::new(
            ErrorKind::InternalClientError,
            "not a composite codec",
        )),
    }
}
