//! Codecs translating between [`Value`]s and the binary data format.
//!
//! A [`Codec`] is built once per type descriptor id and shared through the
//! [`CodecRegistry`]. Composite codecs hold `Arc` handles to their element
//! codecs, so a codec tree is immutable once built.

mod composite;
mod datetime;
pub mod descriptor;
mod numeric;
pub mod registry;
mod scalar;
pub mod value;


use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::wire::buffer::ReadBuffer;

pub use composite::{
    ArrayCodec, EnumCodec, MultiRangeCodec, NamedTupleCodec, ObjectCodec, ObjectField,
    RangeCodec, SetCodec, SparseObjectCodec, TupleCodec, FIELD_IMPLICIT, FIELD_LINKPROP,
};
pub(crate) use composite::decode_element;
pub use registry::CodecRegistry;
pub use scalar::{ScalarCodec, ScalarKind};
pub use value::{DateDuration, Duration, QueryArgs, Range, RelativeDuration, Value};

/// Type id of the codec for "no data".
pub const NULL_CODEC_ID: Uuid = Uuid::nil();

/// Type id of the empty tuple `()`.
pub const EMPTY_TUPLE_CODEC_ID: Uuid = Uuid::from_u128(0xff);

/// Placeholder for "no codec known yet" (all bits set).
pub const INVALID_CODEC_ID: Uuid = Uuid::max();

/// A codec for one type descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Codec {
    /// The type of a statement without output or input.
    Null,
    EmptyTuple,
    Scalar(ScalarCodec),
    Enum(EnumCodec),
    Array(ArrayCodec),
    Set(SetCodec),
    Tuple(TupleCodec),
    NamedTuple(NamedTupleCodec),
    Object(ObjectCodec),
    SparseObject(SparseObjectCodec),
    Range(RangeCodec),
    MultiRange(MultiRangeCodec),
}

impl Codec {
    /// Type descriptor id this codec was built for.
    pub fn id(&self) -> Uuid {
        match self {
            Codec::Null => NULL_CODEC_ID,
            Codec::EmptyTuple => EMPTY_TUPLE_CODEC_ID,
            Codec::Scalar(c) => c.id,
            Codec::Enum(c) => c.id,
            Codec::Array(c) => c.id,
            Codec::Set(c) => c.id,
            Codec::Tuple(c) => c.id,
            Codec::NamedTuple(c) => c.id,
            Codec::Object(c) => c.id,
            Codec::SparseObject(c) => c.id,
            Codec::Range(c) => c.id,
            Codec::MultiRange(c) => c.id,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Codec::Null => "null",
            Codec::EmptyTuple => "empty tuple",
            Codec::Scalar(_) => "scalar",
            Codec::Enum(_) => "enum",
            Codec::Array(_) => "array",
            Codec::Set(_) => "set",
            Codec::Tuple(_) => "tuple",
            Codec::NamedTuple(_) => "named tuple",
            Codec::Object(_) => "object",
            Codec::SparseObject(_) => "sparse object",
            Codec::Range(_) => "range",
            Codec::MultiRange(_) => "multirange",
        }
    }

    /// Write `value` as a length-prefixed element.
    ///
    /// On error nothing is appended to `buf`.
    pub fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        match self {
            Codec::Null => Err(Error::new(
                ErrorKind::InvalidArgumentError,
                "cannot encode a value without a type",
            )),
            Codec::EmptyTuple => match value {
                Value::Tuple(items) if items.is_empty() => {
                    buf.put_i32(4);
                    buf.put_i32(0);
                    Ok(())
                }
                other => Err(Error::new(
                    ErrorKind::InvalidArgumentError,
                    format!("an empty tuple was expected, got {}", other.kind_name()),
                )),
            },
            Codec::Scalar(c) => {
                let mut scratch = BytesMut::new();
                c.encode(&mut scratch, value)?;
                buf.put_slice(&scratch);
                Ok(())
            }
            _ => composite::encode_composite(self, buf, value),
        }
    }

    /// Decode one element payload (without its length prefix).
    pub fn decode(&self, buf: &mut ReadBuffer) -> Result<Value> {
        match self {
            Codec::Null => {
                buf.consume();
                Ok(Value::Nothing)
            }
            Codec::EmptyTuple => {
                let count = buf.read_u32()?;
                if count != 0 {
                    return Err(Error::new(
                        ErrorKind::ProtocolError,
                        format!("cannot decode empty tuple: got {} elements", count),
                    ));
                }
                Ok(Value::Tuple(Vec::new()))
            }
            Codec::Scalar(c) => c.decode(buf),
            _ => composite::decode_composite(self, buf),
        }
    }

    /// Encode the argument block of an `Execute` message.
    pub fn encode_args(&self, args: &QueryArgs) -> Result<BytesMut> {
        match self {
            Codec::Null => {
                if !args.is_empty() {
                    return Err(Error::new(
                        ErrorKind::QueryArgumentError,
                        "This query does not contain any query parameters, but query \
                         arguments were provided to the 'query*()' method",
                    ));
                }
                let mut out = BytesMut::with_capacity(4);
                out.put_i32(0);
                Ok(out)
            }
            Codec::EmptyTuple => {
                if !args.is_empty() {
                    return Err(Error::new(
                        ErrorKind::QueryArgumentError,
                        "expected 0 arguments, got some",
                    ));
                }
                let mut out = BytesMut::with_capacity(8);
                out.put_i32(4);
                out.put_i32(0);
                Ok(out)
            }
            Codec::Object(c) => c.encode_args(args),
            other => Err(Error::new(
                ErrorKind::InternalClientError,
                format!("cannot encode arguments with a {} codec", other.kind_name()),
            )),
        }
    }
}
