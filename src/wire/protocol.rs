//! Gel binary protocol message encoding and decoding.
//!
//! Every message is `[u8 type][i32 length incl. itself][payload]`. This
//! module implements the client messages used by the driver and decodes
//! the server messages it understands.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::buffer::{BufMutExt, Frame, ReadBuffer};
use crate::error::{Attributes, Error, ErrorKind, Result};

// ============================================================================
// Protocol Constants
// ============================================================================

/// A `major.minor` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Version 3 added annotations and the input language byte.
    pub fn has_annotations(self) -> bool {
        self.major >= 3
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Version proposed in the handshake.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(3, 0);

/// Oldest version the server may downgrade to.
pub const MIN_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(2, 0);

/// Capability bits a statement may require.
pub mod capabilities {
    pub const MODIFICATIONS: u64 = 1 << 0;
    pub const SESSION_CONFIG: u64 = 1 << 1;
    pub const TRANSACTION: u64 = 1 << 2;
    pub const DDL: u64 = 1 << 3;
    pub const PERSISTENT_CONFIG: u64 = 1 << 4;
    pub const SET_GLOBAL: u64 = 1 << 5;
    pub const ALL: u64 = 0xffff_ffff;

    /// Capabilities granted to user queries.
    pub const RESTRICTED: u64 = ALL & !TRANSACTION & !SESSION_CONFIG & !SET_GLOBAL;

    /// High word set on every request.
    pub(crate) const HIGH_WORD: u64 = 0xffff_ffff << 32;
}

/// Output format of query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Binary,
    Json,
    None,
}

impl OutputFormat {
    fn as_byte(self) -> u8 {
        match self {
            OutputFormat::Binary => b'b',
            OutputFormat::Json => b'j',
            OutputFormat::None => b'n',
        }
    }
}

/// Result-set size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    NoResult,
    AtMostOne,
    One,
    Many,
    AtLeastOne,
}

impl Cardinality {
    pub fn as_byte(self) -> u8 {
        match self {
            Cardinality::NoResult => b'n',
            Cardinality::AtMostOne => b'o',
            Cardinality::One => b'A',
            Cardinality::Many => b'm',
            Cardinality::AtLeastOne => b'M',
        }
    }

    /// Whether the caller expects at most a single result.
    pub fn is_single(self) -> bool {
        matches!(self, Cardinality::One | Cardinality::AtMostOne)
    }
}

impl TryFrom<u8> for Cardinality {
    type Error = Error;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            b'n' => Ok(Cardinality::NoResult),
            b'o' => Ok(Cardinality::AtMostOne),
            b'A' => Ok(Cardinality::One),
            b'm' => Ok(Cardinality::Many),
            b'M' => Ok(Cardinality::AtLeastOne),
            other => Err(Error::new(
                ErrorKind::BinaryProtocolError,
                format!("unexpected cardinality: {:#04x}", other),
            )),
        }
    }
}

/// Transaction status reported by `ReadyForCommand`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    InError,
    Unknown,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::InError,
            _ => TransactionStatus::Unknown,
        }
    }
}

/// Authentication status codes carried by `R` messages.
pub mod auth_status {
    pub const OK: u32 = 0;
    pub const SASL: u32 = 10;
    pub const SASL_CONTINUE: u32 = 11;
    pub const SASL_FINAL: u32 = 12;
}

/// Name/value annotation pairs.
pub type Annotations = Vec<(String, String)>;

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Prefix `body` with its type byte and length.
fn frame(mtype: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(mtype);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    buf
}

fn put_annotations(buf: &mut BytesMut, annotations: &[(String, String)]) {
    buf.put_u16(annotations.len() as u16);
    for (name, value) in annotations {
        buf.put_string(name);
        buf.put_string(value);
    }
}

/// Opening message ('V')
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    pub version: ProtocolVersion,
    pub params: Vec<(String, String)>,
}

impl FrontendMessage for ClientHandshake {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u16(self.version.major);
        body.put_u16(self.version.minor);
        body.put_u16(self.params.len() as u16);
        for (name, value) in &self.params {
            body.put_string(name);
            body.put_string(value);
        }
        body.put_u16(0); // protocol extensions
        frame(b'V', &body)
    }
}

/// First SASL message ('p')
#[derive(Debug, Clone)]
pub struct SaslInitialResponse {
    pub method: String,
    pub data: String,
}

impl FrontendMessage for SaslInitialResponse {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_string(&self.method);
        body.put_len_prefixed(self.data.as_bytes());
        frame(b'p', &body)
    }
}

/// Subsequent SASL message ('r')
#[derive(Debug, Clone)]
pub struct SaslResponse {
    pub data: String,
}

impl FrontendMessage for SaslResponse {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_len_prefixed(self.data.as_bytes());
        frame(b'r', &body)
    }
}

/// Fields shared by `Parse` and `Execute`.
#[derive(Debug, Clone)]
pub struct QueryHeader {
    pub version: ProtocolVersion,
    pub annotations: Annotations,
    /// Low word of the allowed capabilities.
    pub allowed_capabilities: u64,
    pub output_format: OutputFormat,
    pub expected_cardinality: Cardinality,
    pub query: String,
    pub state_type_id: Uuid,
    pub state_data: Bytes,
}

impl QueryHeader {
    fn encode_into(&self, buf: &mut BytesMut) {
        if self.version.has_annotations() {
            put_annotations(buf, &self.annotations);
        } else {
            buf.put_u16(0);
        }
        buf.put_u64(capabilities::HIGH_WORD | self.allowed_capabilities);
        buf.put_u64(0); // compilation flags
        buf.put_i64(0); // implicit limit
        if self.version.has_annotations() {
            buf.put_u8(b'E'); // input language: EdgeQL
        }
        buf.put_u8(self.output_format.as_byte());
        buf.put_u8(if self.expected_cardinality.is_single() {
            Cardinality::AtMostOne.as_byte()
        } else {
            Cardinality::Many.as_byte()
        });
        buf.put_string(&self.query);
        buf.put_uuid(&self.state_type_id);
        buf.put_len_prefixed(&self.state_data);
    }
}

/// Compile a statement without running it ('P')
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub header: QueryHeader,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        self.header.encode_into(&mut body);
        frame(b'P', &body)
    }
}

/// Compile (if needed) and run a statement ('O')
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub header: QueryHeader,
    pub input_type_id: Uuid,
    pub output_type_id: Uuid,
    /// Encoded argument block, including its own length prefix.
    pub arguments: Bytes,
}

impl FrontendMessage for ExecuteMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        self.header.encode_into(&mut body);
        body.put_uuid(&self.input_type_id);
        body.put_uuid(&self.output_type_id);
        body.put_slice(&self.arguments);
        frame(b'O', &body)
    }
}

/// Sync message ('S')
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        frame(b'S', &[])
    }
}

/// Terminate message ('X')
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        frame(b'X', &[])
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Server messages
#[derive(Debug, Clone)]
pub enum ServerMessage {
    ServerHandshake {
        version: ProtocolVersion,
        extensions: Vec<String>,
    },
    AuthenticationOk,
    AuthenticationSasl {
        methods: Vec<String>,
    },
    AuthenticationSaslContinue {
        data: Bytes,
    },
    AuthenticationSaslFinal {
        data: Bytes,
    },
    /// Any other authentication status.
    AuthenticationOther {
        status: u32,
    },
    ServerKeyData {
        data: Bytes,
    },
    StateDataDescription {
        type_id: Uuid,
        descriptor: Bytes,
    },
    ReadyForCommand {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: Bytes,
    },
    LogMessage {
        severity: u8,
        code: u32,
        text: String,
    },
    CommandDataDescription(CommandDataDescription),
    Data {
        /// The encoded row, without its length prefix.
        data: Bytes,
    },
    CommandComplete {
        capabilities: u64,
        status: String,
        state_type_id: Uuid,
        state_data: Bytes,
    },
    ErrorResponse {
        severity: u8,
        code: u32,
        message: String,
        attributes: Attributes,
    },
}

/// Type information for a compiled statement.
#[derive(Debug, Clone)]
pub struct CommandDataDescription {
    pub annotations: Annotations,
    pub capabilities: u64,
    pub cardinality: Cardinality,
    pub input_type_id: Uuid,
    pub input_descriptor: Bytes,
    pub output_type_id: Uuid,
    pub output_descriptor: Bytes,
}

impl CommandDataDescription {
    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.annotations
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

impl ServerMessage {
    /// Decode one framed server message.
    pub fn decode(frame: Frame) -> Result<Self> {
        let mtype = frame.mtype;
        let mut body = ReadBuffer::new(frame.payload);

        let msg = match mtype {
            b'v' => Self::decode_server_handshake(&mut body)?,
            b'R' => Self::decode_auth(&mut body)?,
            b'K' => ServerMessage::ServerKeyData {
                data: body.read_bytes(32)?,
            },
            b's' => ServerMessage::StateDataDescription {
                type_id: body.read_uuid()?,
                descriptor: body.read_len_prefixed()?,
            },
            b'Z' => {
                read_annotations(&mut body)?;
                ServerMessage::ReadyForCommand {
                    status: TransactionStatus::from(body.read_u8()?),
                }
            }
            b'S' => ServerMessage::ParameterStatus {
                name: body.read_string()?,
                value: body.read_len_prefixed()?,
            },
            b'L' => {
                let severity = body.read_u8()?;
                let code = body.read_u32()?;
                let text = body.read_string()?;
                read_annotations(&mut body)?;
                ServerMessage::LogMessage {
                    severity,
                    code,
                    text,
                }
            }
            b'T' => Self::decode_command_data_description(&mut body)?,
            b'D' => Self::decode_data(&mut body)?,
            b'C' => {
                read_annotations(&mut body)?;
                ServerMessage::CommandComplete {
                    capabilities: body.read_u64()?,
                    status: body.read_string()?,
                    state_type_id: body.read_uuid()?,
                    state_data: body.read_len_prefixed()?,
                }
            }
            b'E' => Self::decode_error_response(&mut body)?,
            other => {
                return Err(Error::new(
                    ErrorKind::UnexpectedMessageError,
                    format!("unexpected message type {:?}", other as char),
                ))
            }
        };

        body.finish()?;
        Ok(msg)
    }

    fn decode_server_handshake(body: &mut ReadBuffer) -> Result<Self> {
        let major = body.read_u16()?;
        let minor = body.read_u16()?;
        let count = body.read_u16()?;
        let mut extensions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            extensions.push(body.read_string()?);
            read_annotations(body)?;
        }
        Ok(ServerMessage::ServerHandshake {
            version: ProtocolVersion::new(major, minor),
            extensions,
        })
    }

    fn decode_auth(body: &mut ReadBuffer) -> Result<Self> {
        let status = body.read_u32()?;
        Ok(match status {
            auth_status::OK => ServerMessage::AuthenticationOk,
            auth_status::SASL => {
                let count = body.read_u32()?;
                let mut methods = Vec::with_capacity(count.min(16) as usize);
                for _ in 0..count {
                    methods.push(body.read_string()?);
                }
                ServerMessage::AuthenticationSasl { methods }
            }
            auth_status::SASL_CONTINUE => ServerMessage::AuthenticationSaslContinue {
                data: body.read_len_prefixed()?,
            },
            auth_status::SASL_FINAL => ServerMessage::AuthenticationSaslFinal {
                data: body.read_len_prefixed()?,
            },
            status => {
                body.consume();
                ServerMessage::AuthenticationOther { status }
            }
        })
    }

    fn decode_command_data_description(body: &mut ReadBuffer) -> Result<Self> {
        let annotations = read_annotations(body)?;
        let capabilities = body.read_u64()?;
        let cardinality = Cardinality::try_from(body.read_u8()?)?;
        let input_type_id = body.read_uuid()?;
        let input_descriptor = body.read_len_prefixed()?;
        let output_type_id = body.read_uuid()?;
        let output_descriptor = body.read_len_prefixed()?;
        Ok(ServerMessage::CommandDataDescription(CommandDataDescription {
            annotations,
            capabilities,
            cardinality,
            input_type_id,
            input_descriptor,
            output_type_id,
            output_descriptor,
        }))
    }

    fn decode_data(body: &mut ReadBuffer) -> Result<Self> {
        let count = body.read_u16()?;
        if count != 1 {
            return Err(Error::new(
                ErrorKind::BinaryProtocolError,
                format!("expected exactly one data element, got {}", count),
            ));
        }
        let len = body.read_i32()?;
        let len = usize::try_from(len).map_err(|_| {
            Error::new(ErrorKind::BinaryProtocolError, "negative data element length")
        })?;
        Ok(ServerMessage::Data {
            data: body.read_bytes(len)?,
        })
    }

    fn decode_error_response(body: &mut ReadBuffer) -> Result<Self> {
        let severity = body.read_u8()?;
        let code = body.read_u32()?;
        let message = body.read_string()?;
        let count = body.read_u16()?;
        let mut attributes = Attributes::new();
        for _ in 0..count {
            let key = body.read_i16()?;
            let value = body.read_len_prefixed()?;
            attributes.push((key, String::from_utf8_lossy(&value).into_owned()));
        }
        Ok(ServerMessage::ErrorResponse {
            severity,
            code,
            message,
            attributes,
        })
    }

    /// Short name used in "unexpected message" errors.
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::ServerHandshake { .. } => "ServerHandshake",
            ServerMessage::AuthenticationOk
            | ServerMessage::AuthenticationSasl { .. }
            | ServerMessage::AuthenticationOther { .. } => "Authentication",
            ServerMessage::AuthenticationSaslContinue { .. } => "SASLContinue",
            ServerMessage::AuthenticationSaslFinal { .. } => "SASLFinal",
            ServerMessage::ServerKeyData { .. } => "ServerKeyData",
            ServerMessage::StateDataDescription { .. } => "StateDataDescription",
            ServerMessage::ReadyForCommand { .. } => "ReadyForCommand",
            ServerMessage::ParameterStatus { .. } => "ParameterStatus",
            ServerMessage::LogMessage { .. } => "LogMessage",
            ServerMessage::CommandDataDescription(_) => "CommandDataDescription",
            ServerMessage::Data { .. } => "Data",
            ServerMessage::CommandComplete { .. } => "CommandComplete",
            ServerMessage::ErrorResponse { .. } => "ErrorResponse",
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn read_annotations(body: &mut ReadBuffer) -> Result<Annotations> {
    let count = body.read_u16()?;
    let mut annotations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = body.read_string()?;
        let value = body.read_string()?;
        annotations.push((name, value));
    }
    Ok(annotations)
}
