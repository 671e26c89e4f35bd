//! Error types for the Gel client.
//!
//! Every failure, local or server-reported, is an [`Error`] carrying an
//! [`ErrorKind`] from the server's error-code hierarchy. The retry helpers
//! only look at the kind and its tags, never at message text.

use std::fmt;
use std::io;
use std::sync::Arc;

use serde::Deserialize;
use smallvec::SmallVec;
use thiserror::Error;

use crate::wire::scram::ScramError;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Error Kinds
// ============================================================================

macro_rules! error_kinds {
    ($($name:ident = $code:literal,)+) => {
        /// Error class, identified by the server's 32-bit error code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ErrorKind {
            $($name,)+
        }

        impl ErrorKind {
            const ALL: &'static [ErrorKind] = &[$(ErrorKind::$name,)+];

            /// Numeric code of this kind.
            pub const fn code(self) -> u32 {
                match self {
                    $(ErrorKind::$name => $code,)+
                }
            }

            /// Class name, as the server reports it.
            pub const fn name(self) -> &'static str {
                match self {
                    $(ErrorKind::$name => stringify!($name),)+
                }
            }
        }
    };
}

error_kinds! {
    InternalServerError = 0x0100_0000,
    UnsupportedFeatureError = 0x0200_0000,
    ProtocolError = 0x0300_0000,
    BinaryProtocolError = 0x0301_0000,
    UnsupportedProtocolVersionError = 0x0301_0001,
    TypeSpecNotFoundError = 0x0301_0002,
    UnexpectedMessageError = 0x0301_0003,
    InputDataError = 0x0302_0000,
    ParameterTypeMismatchError = 0x0302_0100,
    StateMismatchError = 0x0302_0200,
    ResultCardinalityMismatchError = 0x0303_0000,
    CapabilityError = 0x0304_0000,
    UnsupportedCapabilityError = 0x0304_0100,
    DisabledCapabilityError = 0x0304_0200,
    QueryError = 0x0400_0000,
    InvalidSyntaxError = 0x0401_0000,
    EdgeQLSyntaxError = 0x0401_0100,
    InvalidTypeError = 0x0402_0000,
    InvalidReferenceError = 0x0403_0000,
    SchemaError = 0x0404_0000,
    SchemaDefinitionError = 0x0405_0000,
    QueryTimeoutError = 0x0406_0000,
    ExecutionError = 0x0500_0000,
    InvalidValueError = 0x0501_0000,
    DivisionByZeroError = 0x0501_0001,
    NumericOutOfRangeError = 0x0501_0002,
    AccessPolicyError = 0x0501_0003,
    QueryAssertionError = 0x0501_0004,
    IntegrityError = 0x0502_0000,
    ConstraintViolationError = 0x0502_0001,
    CardinalityViolationError = 0x0502_0002,
    MissingRequiredError = 0x0502_0003,
    TransactionError = 0x0503_0000,
    TransactionConflictError = 0x0503_0100,
    TransactionSerializationError = 0x0503_0101,
    TransactionDeadlockError = 0x0503_0102,
    WatchError = 0x0504_0000,
    ConfigurationError = 0x0600_0000,
    AccessError = 0x0700_0000,
    AuthenticationError = 0x0701_0000,
    AvailabilityError = 0x0800_0000,
    BackendUnavailableError = 0x0800_0001,
    ServerOfflineError = 0x0800_0002,
    BackendError = 0x0900_0000,
    UnsupportedBackendFeatureError = 0x0900_0100,
    LogMessage = 0xF000_0000,
    WarningMessage = 0xF001_0000,
    ClientError = 0xFF00_0000,
    ClientConnectionError = 0xFF01_0000,
    ClientConnectionFailedError = 0xFF01_0100,
    ClientConnectionFailedTemporarilyError = 0xFF01_0101,
    ClientConnectionTimeoutError = 0xFF01_0200,
    ClientConnectionClosedError = 0xFF01_0300,
    InterfaceError = 0xFF02_0000,
    QueryArgumentError = 0xFF02_0100,
    MissingArgumentError = 0xFF02_0101,
    UnknownArgumentError = 0xFF02_0102,
    InvalidArgumentError = 0xFF02_0103,
    NoDataError = 0xFF03_0000,
    InternalClientError = 0xFF04_0000,
}

/// Behavioral tags the retry helpers consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Safe to re-run the enclosing transaction or read-only query.
    ShouldRetry,
    /// The connection should be re-established before retrying.
    ShouldReconnect,
}

/// Codes emitted by older servers for the conflict subclasses.
const OLD_ERROR_CODES: [(u32, u32); 2] = [(0x0503_0001, 0x0503_0101), (0x0503_0002, 0x0503_0102)];

impl ErrorKind {
    /// Resolve a server code to the closest known kind.
    ///
    /// Unknown subcodes resolve to their nearest ancestor by walking the
    /// code prefix masks.
    pub fn from_code(code: u32) -> ErrorKind {
        let code = OLD_ERROR_CODES
            .iter()
            .find(|(old, _)| *old == code)
            .map(|(_, new)| *new)
            .unwrap_or(code);

        if let Some(kind) = Self::lookup(code) {
            return kind;
        }
        for mask in [0xFFFF_FF00, 0xFFFF_0000, 0xFF00_0000] {
            if let Some(kind) = Self::lookup(code & mask) {
                return kind;
            }
        }
        ErrorKind::InternalClientError
    }

    fn lookup(code: u32) -> Option<ErrorKind> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }

    /// Returns true if `self` is `ancestor` or one of its subclasses.
    pub fn is_subclass_of(self, ancestor: ErrorKind) -> bool {
        let base = ancestor.code();
        let own = self.code();
        let mask = if base & 0x0000_00FF != 0 {
            0xFFFF_FFFF
        } else if base & 0x0000_FF00 != 0 {
            0xFFFF_FF00
        } else if base & 0x00FF_0000 != 0 {
            0xFFFF_0000
        } else {
            0xFF00_0000
        };
        own & mask == base
    }

    /// Check a behavioral tag.
    pub fn has_tag(self, tag: Tag) -> bool {
        use ErrorKind::*;
        match tag {
            Tag::ShouldRetry => matches!(
                self,
                TransactionConflictError
                    | TransactionSerializationError
                    | TransactionDeadlockError
                    | BackendUnavailableError
                    | ServerOfflineError
                    | ClientConnectionFailedTemporarilyError
                    | ClientConnectionTimeoutError
                    | ClientConnectionClosedError
            ),
            Tag::ShouldReconnect => matches!(
                self,
                ServerOfflineError
                    | ClientConnectionFailedTemporarilyError
                    | ClientConnectionTimeoutError
                    | ClientConnectionClosedError
            ),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// Side-channel attribute keys sent along with server errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ErrorAttr {
    Hint = 1,
    Details = 2,
    ServerTraceback = 257,
    PositionStart = -15,
    PositionEnd = -14,
    LineStart = -13,
    ColumnStart = -12,
    Utf16ColumnStart = -11,
    LineEnd = -10,
    ColumnEnd = -9,
    Utf16ColumnEnd = -8,
    CharacterStart = -7,
    CharacterEnd = -6,
}

/// Attribute list, usually empty or very short.
pub type Attributes = SmallVec<[(i16, String); 4]>;

// ============================================================================
// Error
// ============================================================================

/// Underlying cause of an error raised by the client itself.
#[derive(Error, Debug)]
pub enum Cause {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("SCRAM error: {0}")]
    Scram(#[from] ScramError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error(transparent)]
    Previous(Error),
}

/// A client or server error.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}{}", render_context(.query, .attributes))]
pub struct Error {
    kind: ErrorKind,
    code: u32,
    message: String,
    attributes: Attributes,
    query: Option<Arc<str>>,
    #[source]
    cause: Option<Arc<Cause>>,
}

impl Error {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code(),
            message: message.into(),
            attributes: Attributes::new(),
            query: None,
            cause: None,
        }
    }

    /// Build an error from a server `ErrorResponse`.
    pub fn from_server(code: u32, message: String, attributes: Attributes) -> Self {
        Self {
            kind: ErrorKind::from_code(code),
            code,
            message,
            attributes,
            query: None,
            cause: None,
        }
    }

    /// Attach the query text the error refers to.
    pub fn with_query(mut self, query: impl Into<Arc<str>>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Attach an underlying cause.
    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(Arc::new(cause.into()));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Raw code as sent by the server (may be more specific than the kind).
    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns true if this error is `kind` or one of its subclasses.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind.is_subclass_of(kind)
    }

    pub fn has_tag(&self, tag: Tag) -> bool {
        self.kind.has_tag(tag)
    }

    /// Look up a side-channel attribute.
    pub fn attribute(&self, attr: ErrorAttr) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| *k == attr as i16)
            .map(|(_, v)| v.as_str())
    }

    pub fn hint(&self) -> Option<&str> {
        self.attribute(ErrorAttr::Hint)
    }

    pub fn details(&self) -> Option<&str> {
        self.attribute(ErrorAttr::Details)
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Render the caret-annotated query excerpt with details and hint.
    ///
    /// Empty when the error is not tied to a query.
    pub fn pretty(&self) -> String {
        render_context(&self.query, &self.attributes)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::new(ErrorKind::ClientConnectionClosedError, e.to_string()).with_cause(e)
    }
}

fn attr_str(attributes: &Attributes, attr: ErrorAttr) -> Option<&str> {
    attributes
        .iter()
        .find(|(k, _)| *k == attr as i16)
        .map(|(_, v)| v.as_str())
}

fn attr_int(attributes: &Attributes, attr: ErrorAttr) -> Option<usize> {
    attr_str(attributes, attr).and_then(|v| v.trim().parse().ok())
}

/// Render the excerpt shown after the error message.
///
/// ```text
///    |
///  1 | select 1 +
///    |          ^
/// Hint: ...
/// ```
fn render_context(query: &Option<Arc<str>>, attributes: &Attributes) -> String {
    let Some(query) = query else {
        return String::new();
    };
    if attributes.is_empty() {
        return String::new();
    }

    let mut out = String::from("\n");

    let line_start = attr_int(attributes, ErrorAttr::LineStart);
    let line_end = attr_int(attributes, ErrorAttr::LineEnd);
    let col_start = attr_int(attributes, ErrorAttr::Utf16ColumnStart);
    let col_end = attr_int(attributes, ErrorAttr::Utf16ColumnEnd);

    if let (Some(line_start), Some(line_end), Some(col_start), Some(col_end)) =
        (line_start, line_end, col_start, col_end)
    {
        let lines: Vec<&str> = query.split('\n').collect();
        let width = line_end.to_string().len();
        out.push_str(&format!("{:>w$}\n", "|", w = width + 3));

        for i in line_start.max(1)..=line_end {
            let line = lines.get(i - 1).copied().unwrap_or("");
            let line_len = line.encode_utf16().count();
            let start = if i == line_start { col_start } else { 0 };
            let end = if i == line_end { col_end } else { line_len };
            out.push_str(&format!(" {:>w$} | {}\n", i, line, w = width));
            out.push_str(&format!(
                "{:>w$} {}{}\n",
                "|",
                " ".repeat(start.min(end)),
                "^".repeat(end.saturating_sub(start)),
                w = width + 3
            ));
        }
    }

    if let Some(details) = attr_str(attributes, ErrorAttr::Details) {
        out.push_str(&format!("Details: {}\n", details));
    }
    if let Some(hint) = attr_str(attributes, ErrorAttr::Hint) {
        out.push_str(&format!("Hint: {}\n", hint));
    }

    out
}

// ============================================================================
// Server warnings
// ============================================================================

/// A warning attached to a query description, as sent by the server.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WarningRecord {
    code: u32,
    message: String,
    #[serde(default)]
    hint: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    start: Option<i64>,
    #[serde(default)]
    end: Option<i64>,
    #[serde(default)]
    line: Option<i64>,
    #[serde(default)]
    col: Option<i64>,
}

impl WarningRecord {
    fn into_error(self, query: &Arc<str>) -> Error {
        let mut attributes = Attributes::new();
        if let Some(hint) = self.hint {
            attributes.push((ErrorAttr::Hint as i16, hint));
        }
        if let Some(details) = self.details {
            attributes.push((ErrorAttr::Details as i16, details));
        }
        let positions = [
            (ErrorAttr::CharacterStart, self.start),
            (ErrorAttr::CharacterEnd, self.end),
            (ErrorAttr::LineStart, self.line),
            (ErrorAttr::ColumnStart, self.col),
        ];
        for (attr, value) in positions {
            if let Some(v) = value {
                attributes.push((attr as i16, v.to_string()));
            }
        }
        Error::from_server(self.code, self.message, attributes).with_query(Arc::clone(query))
    }
}

/// Parse the JSON `warnings` header of a command description.
pub(crate) fn parse_warnings(json: &str, query: &Arc<str>) -> Result<Vec<Error>> {
    let records: Vec<WarningRecord> = serde_json::from_str(json).map_err(|e| {
        Error::new(ErrorKind::ProtocolError, "malformed warnings header").with_cause(e)
    })?;
    Ok(records.into_iter().map(|w| w.into_error(query)).collect())
}
