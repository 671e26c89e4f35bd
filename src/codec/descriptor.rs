//! Type descriptor parsing.
//!
//! A descriptor block is a sequence of entries, each:
//! - Int32: entry length (excluding itself)
//! - UInt8: descriptor tag
//! - UUID: type id
//! - tag-specific body, referring to earlier entries by position
//!
//! The last non-annotation entry describes the type itself.

use std::sync::Arc;

use uuid::Uuid;

use super::composite::{
    ArrayCodec, EnumCodec, MultiRangeCodec, NamedTupleCodec, ObjectCodec, ObjectField,
    RangeCodec, SetCodec, SparseObjectCodec, TupleCodec,
};
use super::registry::{builtin, known_type_name, CodecRegistry};
use super::scalar::ScalarCodec;
use super::Codec;
use crate::error::{Error, ErrorKind, Result};
use crate::wire::buffer::ReadBuffer;
use crate::wire::protocol::Cardinality;

const CTYPE_SET: u8 = 0;
const CTYPE_SHAPE: u8 = 1;
const CTYPE_BASE_SCALAR: u8 = 2;
const CTYPE_SCALAR: u8 = 3;
const CTYPE_TUPLE: u8 = 4;
const CTYPE_NAMEDTUPLE: u8 = 5;
const CTYPE_ARRAY: u8 = 6;
const CTYPE_ENUM: u8 = 7;
const CTYPE_INPUT_SHAPE: u8 = 8;
const CTYPE_RANGE: u8 = 9;
const CTYPE_OBJECT: u8 = 10;
const CTYPE_COMPOUND: u8 = 11;
const CTYPE_MULTIRANGE: u8 = 12;
const CTYPE_RECORD: u8 = 13;

fn missing_subcodec(what: &str) -> Error {
    Error::new(
        ErrorKind::ProtocolError,
        format!("could not build {} codec: missing subcodec", what),
    )
}

fn no_codec_for(id: &Uuid) -> Error {
    let message = match known_type_name(id) {
        Some(name) => format!("no codec for {}", name),
        None => format!("no codec for the type with ID {}", id),
    };
    Error::new(ErrorKind::InternalClientError, message)
}

/// Entries built so far, addressed by position.
struct CodecList(Vec<Arc<Codec>>);

impl CodecList {
    fn at(&self, buf: &mut ReadBuffer, what: &str) -> Result<Arc<Codec>> {
        let pos = buf.read_u16()? as usize;
        self.0
            .get(pos)
            .cloned()
            .ok_or_else(|| missing_subcodec(what))
    }
}

/// Type name, schema-defined flag and ancestor positions.
fn read_header(buf: &mut ReadBuffer) -> Result<(String, Vec<u16>)> {
    let name = buf.read_string()?;
    buf.read_bool()?; // schema-defined
    let count = buf.read_u16()?;
    let mut ancestors = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ancestors.push(buf.read_u16()?);
    }
    Ok((name, ancestors))
}

pub(super) fn build(registry: &CodecRegistry, spec: &[u8]) -> Result<Arc<Codec>> {
    let mut buf = ReadBuffer::from_slice(spec);
    let mut list = CodecList(Vec::new());

    while !buf.is_empty() {
        let len = buf.read_i32()?;
        let len = usize::try_from(len).map_err(|_| {
            Error::new(ErrorKind::ProtocolError, "negative type descriptor length")
        })?;
        let mut entry = ReadBuffer::new(buf.read_bytes(len)?);
        let codec = build_entry(registry, &mut entry, &list)?;
        entry.finish()?;

        if let Some(codec) = codec {
            if !matches!(*codec, Codec::Null) {
                registry.insert(Arc::clone(&codec));
            }
            list.0.push(codec);
        }
    }

    list.0
        .pop()
        .ok_or_else(|| Error::new(ErrorKind::InternalClientError, "could not build a codec"))
}

/// Build one entry; `None` for annotations.
fn build_entry(
    registry: &CodecRegistry,
    buf: &mut ReadBuffer,
    list: &CodecList,
) -> Result<Option<Arc<Codec>>> {
    let tag = buf.read_u8()?;
    let id = buf.read_uuid()?;

    if tag >= 0x7f {
        buf.consume();
        return Ok(None);
    }

    if let Some(codec) = registry.get(&id) {
        buf.consume();
        return Ok(Some(codec));
    }

    let codec = match tag {
        CTYPE_BASE_SCALAR => builtin(&id).ok_or_else(|| no_codec_for(&id))?,

        CTYPE_SCALAR => {
            let (name, ancestors) = read_header(buf)?;
            match ancestors.last() {
                None => builtin(&id).ok_or_else(|| no_codec_for(&id))?,
                Some(&pos) => {
                    let base = list.0.get(pos as usize).ok_or_else(|| {
                        Error::new(
                            ErrorKind::ProtocolError,
                            "could not build scalar codec: missing a codec for base scalar",
                        )
                    })?;
                    let Codec::Scalar(base) = &**base else {
                        return Err(Error::new(
                            ErrorKind::ProtocolError,
                            format!(
                                "a scalar codec expected for base scalar type, got {}",
                                base.kind_name()
                            ),
                        ));
                    };
                    Arc::new(Codec::Scalar(ScalarCodec::new(id, name, base.kind)))
                }
            }
        }

        CTYPE_SET => {
            let element = list.at(buf, "set")?;
            Arc::new(Codec::Set(SetCodec { id, element }))
        }

        CTYPE_SHAPE | CTYPE_INPUT_SHAPE => {
            if tag == CTYPE_SHAPE {
                buf.read_bool()?; // ephemeral free shape
                buf.read_u16()?; // object type position
            }
            let count = buf.read_u16()?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let flags = buf.read_u32()?;
                let cardinality = Cardinality::try_from(buf.read_u8()?)?;
                let name = buf.read_string()?;
                let codec = list.at(buf, "object")?;
                if tag == CTYPE_SHAPE {
                    buf.read_u16()?; // source type position
                }
                fields.push(ObjectField::new(name, flags, cardinality, codec));
            }
            if tag == CTYPE_INPUT_SHAPE {
                let fields = fields.into_iter().map(|f| (f.name, f.codec)).collect();
                Arc::new(Codec::SparseObject(SparseObjectCodec { id, fields }))
            } else {
                Arc::new(Codec::Object(ObjectCodec { id, fields }))
            }
        }

        CTYPE_RECORD => {
            let count = buf.read_u16()?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name = buf.read_string()?;
                let codec = list.at(buf, "record")?;
                fields.push(ObjectField::new(name, 0, Cardinality::Many, codec));
            }
            Arc::new(Codec::Object(ObjectCodec { id, fields }))
        }

        CTYPE_ARRAY => {
            let (type_name, _) = read_header(buf)?;
            let element = list.at(buf, "array")?;
            let dims = buf.read_u16()?;
            if dims != 1 {
                return Err(Error::new(
                    ErrorKind::ProtocolError,
                    "cannot handle arrays with more than one dimension",
                ));
            }
            let len = buf.read_i32()?;
            Arc::new(Codec::Array(ArrayCodec {
                id,
                type_name,
                element,
                len,
            }))
        }

        CTYPE_TUPLE => {
            let (type_name, _) = read_header(buf)?;
            let count = buf.read_u16()?;
            if count == 0 {
                Arc::new(Codec::EmptyTuple)
            } else {
                let mut elements = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    elements.push(list.at(buf, "tuple")?);
                }
                Arc::new(Codec::Tuple(TupleCodec {
                    id,
                    type_name: Some(type_name),
                    elements,
                }))
            }
        }

        CTYPE_NAMEDTUPLE => {
            let (type_name, _) = read_header(buf)?;
            let count = buf.read_u16()?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name = buf.read_string()?;
                fields.push((name, list.at(buf, "namedtuple")?));
            }
            Arc::new(Codec::NamedTuple(NamedTupleCodec {
                id,
                type_name: Some(type_name),
                fields,
            }))
        }

        CTYPE_ENUM => {
            let (type_name, _) = read_header(buf)?;
            let count = buf.read_u16()?;
            let mut members = Vec::with_capacity(count as usize);
            for _ in 0..count {
                members.push(buf.read_string()?);
            }
            Arc::new(Codec::Enum(EnumCodec {
                id,
                type_name,
                members,
            }))
        }

        CTYPE_RANGE => {
            let (type_name, _) = read_header(buf)?;
            let element = list.at(buf, "range")?;
            Arc::new(Codec::Range(RangeCodec {
                id,
                type_name,
                element,
            }))
        }

        CTYPE_MULTIRANGE => {
            let (type_name, _) = read_header(buf)?;
            let element = list.at(buf, "multirange")?;
            Arc::new(Codec::MultiRange(MultiRangeCodec {
                id,
                type_name,
                element,
            }))
        }

        CTYPE_OBJECT | CTYPE_COMPOUND => {
            buf.consume();
            Arc::new(Codec::Null)
        }

        other => {
            return Err(Error::new(
                ErrorKind::InternalClientError,
                format!("could not build a codec for {} type (descriptor tag {})", id, other),
            ))
        }
    };

    Ok(Some(codec))
}
