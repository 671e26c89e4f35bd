//! Codec lookup: the fixed built-in scalars plus an LRU of built codecs.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use uuid::Uuid;

use super::descriptor;
use super::scalar::{ScalarCodec, ScalarKind};
use super::{Codec, EMPTY_TUPLE_CODEC_ID, NULL_CODEC_ID};
use crate::error::Result;

/// Number of descriptor-built codecs kept per registry.
const CODECS_CACHE_SIZE: usize = 1000;

const BUILTIN_SCALARS: &[(u128, &str, ScalarKind)] = &[
    (0x100, "std::uuid", ScalarKind::Uuid),
    (0x101, "std::str", ScalarKind::Str),
    (0x102, "std::bytes", ScalarKind::Bytes),
    (0x103, "std::int16", ScalarKind::Int16),
    (0x104, "std::int32", ScalarKind::Int32),
    (0x105, "std::int64", ScalarKind::Int64),
    (0x106, "std::float32", ScalarKind::Float32),
    (0x107, "std::float64", ScalarKind::Float64),
    (0x108, "std::decimal", ScalarKind::Decimal),
    (0x109, "std::bool", ScalarKind::Bool),
    (0x10a, "std::datetime", ScalarKind::Datetime),
    (0x10b, "cal::local_datetime", ScalarKind::LocalDatetime),
    (0x10c, "cal::local_date", ScalarKind::LocalDate),
    (0x10d, "cal::local_time", ScalarKind::LocalTime),
    (0x10e, "std::duration", ScalarKind::Duration),
    (0x10f, "std::json", ScalarKind::Json),
    (0x110, "std::bigint", ScalarKind::BigInt),
    (0x111, "cal::relative_duration", ScalarKind::RelativeDuration),
    (0x112, "cal::date_duration", ScalarKind::DateDuration),
    (0x130, "cfg::memory", ScalarKind::ConfigMemory),
];

static BUILTINS: OnceCell<HashMap<Uuid, Arc<Codec>>> = OnceCell::new();

/// Populate the built-in codec table.
///
/// Idempotent; every accessor calls it.
pub fn init_builtins() -> &'static HashMap<Uuid, Arc<Codec>> {
    BUILTINS.get_or_init(|| {
        let mut map: HashMap<Uuid, Arc<Codec>> = BUILTIN_SCALARS
            .iter()
            .map(|&(id, name, kind)| {
                let id = Uuid::from_u128(id);
                (id, Arc::new(Codec::Scalar(ScalarCodec::new(id, name, kind))))
            })
            .collect();
        map.insert(NULL_CODEC_ID, Arc::new(Codec::Null));
        map.insert(EMPTY_TUPLE_CODEC_ID, Arc::new(Codec::EmptyTuple));
        map
    })
}

/// Built-in codec for `id`, if any.
pub fn builtin(id: &Uuid) -> Option<Arc<Codec>> {
    init_builtins().get(id).cloned()
}

/// Name of a known built-in type, used in error messages.
pub(crate) fn known_type_name(id: &Uuid) -> Option<&'static str> {
    let raw = id.as_u128();
    BUILTIN_SCALARS
        .iter()
        .find(|(bid, _, _)| *bid == raw)
        .map(|(_, name, _)| *name)
}

/// Codecs shared by every connection of a pool.
pub struct CodecRegistry {
    codecs: Mutex<LruCache<Uuid, Arc<Codec>>>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("cached", &self.codecs.lock().len())
            .finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::with_capacity(CODECS_CACHE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            codecs: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn has(&self, id: &Uuid) -> bool {
        self.codecs.lock().contains(id) || init_builtins().contains_key(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Codec>> {
        if let Some(codec) = self.codecs.lock().get(id) {
            return Some(Arc::clone(codec));
        }
        builtin(id)
    }

    pub fn insert(&self, codec: Arc<Codec>) {
        self.codecs.lock().put(codec.id(), codec);
    }

    /// Build (or reuse) the codec described by a type descriptor block.
    ///
    /// Every codec built along the way is cached.
    pub fn build_codec(&self, spec: &[u8]) -> Result<Arc<Codec>> {
        descriptor::build(self, spec)
    }
}
