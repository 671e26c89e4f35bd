//! Binary protocol plumbing.
//!
//! This module contains:
//! - `buffer`: byte-level read/write helpers and framing
//! - `protocol`: message types and encoding/decoding
//! - `scram`: SCRAM-SHA-256 authentication
//! - `stream`: TCP/TLS transport
//! - `connection`: a single authenticated connection

pub mod buffer;
pub mod connection;
pub mod protocol;
pub mod scram;
pub mod stream;


pub use connection::{ConnectConfig, QueryCodecs, QueryRequest, RawConnection, ServerSettings};
pub use protocol::{Cardinality, OutputFormat, ProtocolVersion, TransactionStatus};
pub use stream::TlsSecurity;
