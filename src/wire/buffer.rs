//! Byte-level cursors and message framing.
//!
//! - `BufMutExt`: length-prefixed writers on top of `bytes::BufMut`
//! - `ReadBuffer`: bounds-checked sequential reader over `Bytes`
//! - `take_frame`: splits complete `[type][length][payload]` units off a
//!   socket read buffer

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};

/// Size of the frame header: one type byte and a 4-byte length.
pub const FRAME_HEADER_LEN: usize = 5;

// ============================================================================
// Write helpers
// ============================================================================

/// Wire-format writers shared by messages and codecs.
pub trait BufMutExt: BufMut {
    /// Write a `u32` length followed by UTF-8 bytes.
    fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.put_slice(s.as_bytes());
    }

    /// Write a `u32` length followed by raw bytes.
    fn put_len_prefixed(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.put_slice(data);
    }

    fn put_uuid(&mut self, id: &Uuid) {
        self.put_slice(id.as_bytes());
    }
}

impl<T: BufMut> BufMutExt for T {}

/// Convert a length to the signed 4-byte prefix used by value encodings.
pub fn checked_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| {
        Error::new(
            ErrorKind::InvalidArgumentError,
            format!("value of {} bytes is too large to encode", len),
        )
    })
}

// ============================================================================
// Read cursor
// ============================================================================

/// Sequential reader that never reads past its end.
///
/// Every read checks the remaining length first; running short is a
/// protocol error rather than a panic or silent truncation.
#[derive(Debug, Clone)]
pub struct ReadBuffer {
    buf: Bytes,
}

impl ReadBuffer {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buf: Bytes::copy_from_slice(data),
        }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    fn ensure(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::new(
                ErrorKind::BinaryProtocolError,
                format!(
                    "buffer overread: need {} bytes, {} remaining",
                    n,
                    self.buf.remaining()
                ),
            ));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.ensure(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.ensure(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.ensure(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64())
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        self.ensure(16)?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    /// Split off exactly `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        self.ensure(n)?;
        Ok(self.buf.split_to(n))
    }

    /// Read a `u32`-prefixed byte blob.
    pub fn read_len_prefixed(&mut self) -> Result<Bytes> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Read a `u32`-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_len_prefixed()?;
        String::from_utf8(raw.to_vec()).map_err(|_| {
            Error::new(ErrorKind::BinaryProtocolError, "invalid UTF-8 in string")
        })
    }

    /// Read an `i32`-prefixed sub-buffer, as used by value encodings.
    ///
    /// Returns `None` for the `-1` null marker.
    pub fn read_nullable(&mut self) -> Result<Option<ReadBuffer>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(ReadBuffer::new(self.read_bytes(len as usize)?)))
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.buf.advance(n);
        Ok(())
    }

    /// Take everything that is left.
    pub fn consume(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len())
    }

    /// Fail if the value or message was not read in full.
    pub fn finish(&self) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(Error::new(
                ErrorKind::BinaryProtocolError,
                format!("unexpected trailing data: {} bytes", self.buf.len()),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Framing
// ============================================================================

/// One complete server message: its type byte and payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub mtype: u8,
    pub payload: Bytes,
}

/// Split the next complete message off the front of `buf`.
///
/// Returns `Ok(None)` while the message is still incomplete, so callers can
/// append more socket data and try again regardless of where reads split.
pub fn take_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if length < 4 {
        return Err(Error::new(
            ErrorKind::BinaryProtocolError,
            format!("invalid message length: {}", length),
        ));
    }

    let total_len = 1 + length;
    if buf.len() < total_len {
        return Ok(None);
    }

    let mut frame = buf.split_to(total_len).freeze();
    let mtype = frame[0];
    frame.advance(FRAME_HEADER_LEN);
    Ok(Some(Frame {
        mtype,
        payload: frame,
    }))
}
