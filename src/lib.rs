//! gelwire - an async client for the Gel (EdgeDB) binary protocol.
//!
//! The crate is layered bottom-up:
//! - `wire`: framing, messages, SCRAM authentication and single connections
//! - `codec`: type descriptors and the codecs built from them
//! - `options`, `transaction`, `pool`: retry policy, session state,
//!   transactions and connection pooling
//! - `client`: the public query API

pub mod client;
pub mod codec;
pub mod error;
pub mod options;
pub mod pool;
pub mod transaction;
pub mod wire;

#[cfg(test)]
mod mock;

pub use client::Client;
pub use codec::registry::init_builtins;
pub use codec::{QueryArgs, Value};
pub use error::{Error, ErrorKind, Result, Tag};
pub use options::{
    IsolationLevel, Options, RetryCondition, RetryOptions, Session, TransactionOptions,
};
pub use pool::{ConnectionHolder, Pool, PoolConfig};
pub use transaction::{Transaction, TransactionState};
pub use wire::{ConnectConfig, TlsSecurity};
