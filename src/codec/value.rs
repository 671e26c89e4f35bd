//! Dynamic values exchanged with the server.
//!
//! Every codec encodes from and decodes into [`Value`]. Query arguments are
//! passed as [`QueryArgs`].

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;

// ============================================================================
// Temporal types without a chrono counterpart
// ============================================================================

/// Exact duration (`std::duration`), in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Duration {
    pub micros: i64,
}

impl Duration {
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }
}

/// Calendar-aware duration (`cal::relative_duration`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RelativeDuration {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

/// Whole-day duration (`cal::date_duration`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DateDuration {
    pub months: i32,
    pub days: i32,
}

// ============================================================================
// Ranges
// ============================================================================

/// A range over scalar values.
///
/// `inc_lower`/`inc_upper` only matter when the matching bound is present.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub lower: Option<Box<Value>>,
    pub upper: Option<Box<Value>>,
    pub inc_lower: bool,
    pub inc_upper: bool,
    pub empty: bool,
}

impl Range {
    pub fn new(lower: Option<Value>, upper: Option<Value>, inc_lower: bool, inc_upper: bool) -> Self {
        Self {
            lower: lower.map(Box::new),
            upper: upper.map(Box::new),
            inc_lower,
            inc_upper,
            empty: false,
        }
    }

    /// The empty range: no bounds, contains nothing.
    pub fn empty() -> Self {
        Self {
            lower: None,
            upper: None,
            inc_lower: false,
            inc_upper: false,
            empty: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }
}

// ============================================================================
// Value
// ============================================================================

/// A decoded or to-be-encoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value (an empty set element or a missing optional).
    Nothing,
    Uuid(Uuid),
    Str(String),
    Bytes(Bytes),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    /// Arbitrary-precision integer in decimal notation.
    BigInt(String),
    /// Arbitrary-precision decimal in plain decimal notation.
    Decimal(String),
    Bool(bool),
    Datetime(DateTime<Utc>),
    LocalDatetime(NaiveDateTime),
    LocalDate(NaiveDate),
    LocalTime(NaiveTime),
    Duration(Duration),
    RelativeDuration(RelativeDuration),
    DateDuration(DateDuration),
    /// JSON document text.
    Json(String),
    /// `cfg::memory`, in bytes.
    ConfigMemory(i64),
    Enum(String),
    Array(Vec<Value>),
    Set(Vec<Value>),
    Tuple(Vec<Value>),
    NamedTuple(Vec<(String, Value)>),
    Object(Vec<(String, Value)>),
    Range(Range),
    MultiRange(Vec<Range>),
}

impl Value {
    /// Short type name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nothing => "nothing",
            Value::Uuid(_) => "uuid",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::BigInt(_) => "bigint",
            Value::Decimal(_) => "decimal",
            Value::Bool(_) => "bool",
            Value::Datetime(_) => "datetime",
            Value::LocalDatetime(_) => "local_datetime",
            Value::LocalDate(_) => "local_date",
            Value::LocalTime(_) => "local_time",
            Value::Duration(_) => "duration",
            Value::RelativeDuration(_) => "relative_duration",
            Value::DateDuration(_) => "date_duration",
            Value::Json(_) => "json",
            Value::ConfigMemory(_) => "memory",
            Value::Enum(_) => "enum",
            Value::Array(_) => "array",
            Value::Set(_) => "set",
            Value::Tuple(_) => "tuple",
            Value::NamedTuple(_) => "named tuple",
            Value::Object(_) => "object",
            Value::Range(_) => "range",
            Value::MultiRange(_) => "multirange",
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Value::Nothing)
    }

    /// Integer content of any integer variant.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int16(v) => Some(v as i64),
            Value::Int32(v) => Some(v as i64),
            Value::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Enum(s) | Value::Json(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a field of an object or named tuple.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) | Value::NamedTuple(fields) => {
                fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nothing)
    }
}

// ============================================================================
// Query arguments
// ============================================================================

/// Arguments of a single query.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum QueryArgs {
    #[default]
    None,
    /// `$0`, `$1`, ... in order.
    Positional(Vec<Value>),
    /// `$name` arguments.
    Named(Vec<(String, Value)>),
}

impl QueryArgs {
    pub fn is_empty(&self) -> bool {
        match self {
            QueryArgs::None => true,
            QueryArgs::Positional(v) => v.is_empty(),
            QueryArgs::Named(v) => v.is_empty(),
        }
    }

    /// Build named arguments from `(name, value)` pairs.
    pub fn named<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        QueryArgs::Named(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<()> for QueryArgs {
    fn from(_: ()) -> Self {
        QueryArgs::None
    }
}

impl From<Vec<Value>> for QueryArgs {
    fn from(v: Vec<Value>) -> Self {
        QueryArgs::Positional(v)
    }
}

impl From<Vec<(String, Value)>> for QueryArgs {
    fn from(v: Vec<(String, Value)>) -> Self {
        QueryArgs::Named(v)
    }
}
