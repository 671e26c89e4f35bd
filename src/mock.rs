//! Scripted in-process server speaking enough of the binary protocol to
//! drive connection, transaction and pool tests without a live instance.
//!
//! Every query is answered by a script closure. Results are described as
//! `int64` or `str` sets; transaction control statements update the
//! reported transaction status.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::codec::NULL_CODEC_ID;
use crate::wire::buffer::{take_frame, BufMutExt, ReadBuffer};
use crate::wire::connection::ConnectConfig;
use crate::wire::stream::TlsSecurity;

type HmacSha256 = Hmac<Sha256>;

const INT64_ID: Uuid = Uuid::from_u128(0x105);
const STR_ID: Uuid = Uuid::from_u128(0x101);
const SALT: &[u8] = b"mock-salt";
const ITERATIONS: u32 = 64;

/// How the server answers one query.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// A set of `int64` values.
    Ints(Vec<i64>),
    /// A set of `str` values (also used for JSON output).
    Strs(Vec<String>),
    /// A statement without a result.
    Done,
    /// An `ErrorResponse` with this code and message.
    Error(u32, String),
    /// Drop the socket without answering.
    Hangup,
}

type Script = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

#[derive(Clone)]
pub(crate) struct MockOptions {
    pub password: Option<String>,
    pub suggested_concurrency: Option<usize>,
    pub version: (u16, u16),
    pub delay: Duration,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            password: None,
            suggested_concurrency: None,
            version: (3, 0),
            delay: Duration::ZERO,
        }
    }
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl MockServer {
    pub async fn start(script: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self::with_options(MockOptions::default(), script).await
    }

    pub async fn with_options(
        options: MockOptions,
        script: impl Fn(&str) -> Reply + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));
        let script: Script = Arc::new(script);

        let handle = tokio::spawn({
            let accepted = Arc::clone(&accepted);
            let log = Arc::clone(&log);
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let session = MockSession {
                        socket,
                        options: options.clone(),
                        script: Arc::clone(&script),
                        log: Arc::clone(&log),
                        status: b'I',
                        buf: BytesMut::new(),
                    };
                    tokio::spawn(session.run());
                }
            }
        });

        Self {
            addr,
            accepted,
            log,
            handle,
        }
    }

    pub fn connect_config(&self) -> ConnectConfig {
        ConnectConfig::new(self.addr.ip().to_string(), self.addr.port())
            .tls_security(TlsSecurity::Disabled)
            .connect_timeout(Duration::from_secs(2))
            .wait_until_available(Duration::from_millis(500))
    }

    /// Number of accepted sockets.
    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Executed query texts, in arrival order.
    pub fn executed(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

// ============================================================================
// Per-connection session
// ============================================================================

struct MockSession {
    socket: TcpStream,
    options: MockOptions,
    script: Script,
    log: Arc<Mutex<Vec<String>>>,
    status: u8,
    buf: BytesMut,
}

struct ParsedQuery {
    query: String,
    output_type_id: Option<Uuid>,
}

impl MockSession {
    async fn run(mut self) {
        let mut scram: Option<(String, String)> = None;
        let mut out = BytesMut::new();
        loop {
            let frame = loop {
                match take_frame(&mut self.buf) {
                    Ok(Some(frame)) => break frame,
                    Ok(None) => {}
                    Err(_) => return,
                }
                let mut chunk = [0u8; 4096];
                match self.socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                }
            };
            let mut body = ReadBuffer::new(frame.payload);

            match frame.mtype {
                b'V' => {
                    let (major, minor) = self.options.version;
                    let mut msg = BytesMut::new();
                    msg.put_u16(major);
                    msg.put_u16(minor);
                    msg.put_u16(0);
                    put_frame(&mut out, b'v', &msg);
                    if self.options.password.is_some() {
                        let mut msg = BytesMut::new();
                        msg.put_u32(10);
                        msg.put_u32(1);
                        msg.put_string("SCRAM-SHA-256");
                        put_frame(&mut out, b'R', &msg);
                    } else {
                        self.ready(&mut out);
                    }
                }
                b'p' => {
                    let _method = body.read_string().unwrap();
                    let data = String::from_utf8(body.read_len_prefixed().unwrap().to_vec()).unwrap();
                    let bare = data.trim_start_matches("n,,").to_string();
                    let nonce = bare.split(",r=").nth(1).unwrap_or("").to_string();
                    let server_first =
                        format!("r={}mock,s={},i={}", nonce, BASE64.encode(SALT), ITERATIONS);
                    let mut msg = BytesMut::new();
                    msg.put_u32(11);
                    msg.put_len_prefixed(server_first.as_bytes());
                    put_frame(&mut out, b'R', &msg);
                    scram = Some((bare, server_first));
                }
                b'r' => {
                    let data = String::from_utf8(body.read_len_prefixed().unwrap().to_vec()).unwrap();
                    let Some((bare, server_first)) = scram.take() else {
                        return;
                    };
                    let password = self.options.password.clone().unwrap_or_default();
                    match verify_client_final(&password, &bare, &server_first, &data) {
                        Some(server_final) => {
                            let mut msg = BytesMut::new();
                            msg.put_u32(12);
                            msg.put_len_prefixed(server_final.as_bytes());
                            put_frame(&mut out, b'R', &msg);
                            self.ready(&mut out);
                        }
                        None => {
                            put_error(&mut out, 0x0701_0000, "authentication failed");
                            let _ = self.socket.write_all(&out).await;
                            return;
                        }
                    }
                }
                b'P' | b'O' => {
                    let parsed = parse_request(&mut body, frame.mtype == b'O');
                    let upper = parsed.query.trim().to_ascii_uppercase();
                    let reply = if upper.starts_with("START TRANSACTION")
                        || upper.starts_with("COMMIT")
                        || upper.starts_with("ROLLBACK")
                    {
                        Reply::Done
                    } else {
                        (self.script)(&parsed.query)
                    };
                    if !self.options.delay.is_zero() {
                        tokio::time::sleep(self.options.delay).await;
                    }
                    if frame.mtype == b'O' {
                        self.log.lock().push(parsed.query.clone());
                    }
                    if !self.answer(&mut out, &parsed, reply) {
                        return;
                    }
                }
                b'S' => {
                    let mut msg = BytesMut::new();
                    msg.put_u16(0);
                    msg.put_u8(self.status);
                    put_frame(&mut out, b'Z', &msg);
                }
                b'X' => return,
                _ => return,
            }

            if !out.is_empty() {
                if self.socket.write_all(&out).await.is_err() {
                    return;
                }
                out.clear();
            }
        }
    }

    /// `R 0`, key data, settings and the first `Z`.
    fn ready(&self, out: &mut BytesMut) {
        let mut msg = BytesMut::new();
        msg.put_u32(0);
        put_frame(out, b'R', &msg);
        put_frame(out, b'K', &[7u8; 32]);
        if let Some(n) = self.options.suggested_concurrency {
            let mut msg = BytesMut::new();
            msg.put_string("suggested_pool_concurrency");
            msg.put_len_prefixed(n.to_string().as_bytes());
            put_frame(out, b'S', &msg);
        }
        let mut msg = BytesMut::new();
        msg.put_u16(0);
        msg.put_u8(self.status);
        put_frame(out, b'Z', &msg);
    }

    /// Write the response to `P`/`O`; false when the socket should close.
    fn answer(&mut self, out: &mut BytesMut, parsed: &ParsedQuery, reply: Reply) -> bool {
        let upper = parsed.query.trim().to_ascii_uppercase();
        let (out_id, caps, rows): (Uuid, u64, Vec<Bytes>) = match reply {
            Reply::Hangup => return false,
            Reply::Error(code, message) => {
                if self.status == b'T' {
                    self.status = b'E';
                }
                put_error(out, code, &message);
                return true;
            }
            Reply::Ints(values) => (
                INT64_ID,
                0,
                values
                    .iter()
                    .map(|v| Bytes::copy_from_slice(&v.to_be_bytes()))
                    .collect(),
            ),
            Reply::Strs(values) => (
                STR_ID,
                0,
                values.into_iter().map(Bytes::from).collect(),
            ),
            Reply::Done => (NULL_CODEC_ID, 1, Vec::new()),
        };

        let describe = match parsed.output_type_id {
            None => true,
            Some(requested) => requested != out_id,
        };
        if describe {
            let mut msg = BytesMut::new();
            msg.put_u16(0);
            msg.put_u64(caps);
            msg.put_u8(if out_id == NULL_CODEC_ID { b'n' } else { b'm' });
            msg.put_uuid(&NULL_CODEC_ID);
            msg.put_len_prefixed(&[]);
            msg.put_uuid(&out_id);
            if out_id == NULL_CODEC_ID {
                msg.put_len_prefixed(&[]);
            } else {
                let mut desc = BytesMut::new();
                desc.put_i32(17);
                desc.put_u8(2); // base scalar
                desc.put_uuid(&out_id);
                msg.put_len_prefixed(&desc);
            }
            put_frame(out, b'T', &msg);
        }

        if parsed.output_type_id.is_none() {
            return true;
        }

        for row in rows {
            let mut msg = BytesMut::new();
            msg.put_u16(1);
            msg.put_len_prefixed(&row);
            put_frame(out, b'D', &msg);
        }

        if upper.starts_with("START TRANSACTION") {
            self.status = b'T';
        } else if upper.starts_with("COMMIT") || upper.starts_with("ROLLBACK") {
            self.status = b'I';
        }

        let mut msg = BytesMut::new();
        msg.put_u16(0);
        msg.put_u64(caps);
        msg.put_string(upper.split_whitespace().next().unwrap_or(""));
        msg.put_uuid(&NULL_CODEC_ID);
        msg.put_len_prefixed(&[]);
        put_frame(out, b'C', &msg);
        true
    }
}

/// Decode the common Parse/Execute header (protocol 3.0 layout).
fn parse_request(body: &mut ReadBuffer, execute: bool) -> ParsedQuery {
    let annotations = body.read_u16().unwrap();
    for _ in 0..annotations {
        body.read_string().unwrap();
        body.read_string().unwrap();
    }
    body.read_u64().unwrap(); // capabilities
    body.read_u64().unwrap(); // compilation flags
    body.read_i64().unwrap(); // implicit limit
    body.read_u8().unwrap(); // language
    body.read_u8().unwrap(); // output format
    body.read_u8().unwrap(); // cardinality
    let query = body.read_string().unwrap();
    body.read_uuid().unwrap();
    body.read_len_prefixed().unwrap();
    let output_type_id = if execute {
        body.read_uuid().unwrap();
        let out = body.read_uuid().unwrap();
        body.read_len_prefixed().unwrap(); // arguments
        Some(out)
    } else {
        None
    };
    ParsedQuery {
        query,
        output_type_id,
    }
}

fn put_frame(out: &mut BytesMut, mtype: u8, body: &[u8]) {
    out.put_u8(mtype);
    out.put_i32(body.len() as i32 + 4);
    out.put_slice(body);
}

fn put_error(out: &mut BytesMut, code: u32, message: &str) {
    let mut msg = BytesMut::new();
    msg.put_u8(120);
    msg.put_u32(code);
    msg.put_string(message);
    msg.put_u16(0);
    put_frame(out, b'E', &msg);
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Check the client proof; returns the server-final message on success.
fn verify_client_final(
    password: &str,
    client_first_bare: &str,
    server_first: &str,
    client_final: &str,
) -> Option<String> {
    let (without_proof, proof) = client_final.split_once(",p=")?;
    let proof = BASE64.decode(proof).ok()?;

    let mut salted = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), SALT, ITERATIONS, &mut salted).ok()?;
    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

    let client_key = hmac(&salted, b"Client Key");
    let stored_key = Sha256::digest(&client_key);
    let signature = hmac(&stored_key, auth_message.as_bytes());
    let expected: Vec<u8> = client_key.iter().zip(&signature).map(|(a, b)| a ^ b).collect();
    if expected != proof {
        return None;
    }

    let server_key = hmac(&salted, b"Server Key");
    Some(format!(
        "v={}",
        BASE64.encode(hmac(&server_key, auth_message.as_bytes()))
    ))
}
