//! Wire framing.
//!
//! Every datagram is a [`PacketHeader`] followed by zero or more message
//! frames:
//!
//! ```text
//! packet:  [sequence u32][reliable_ack u32] frame*
//! frame:   [tag u8][reliable_id u32][len u16][payload; len]
//! ```
//!
//! All integers are big-endian. Reads are bounds checked up front so that a
//! hostile datagram produces a [`WireError`] instead of a panic inside
//! `bytes::Buf`.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

/// Largest datagram the sender packs messages into.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Size of [`PacketHeader`] on the wire.
pub const PACKET_HEADER_LEN: usize = 8;

/// Size of a message frame header on the wire.
pub const FRAME_HEADER_LEN: usize = 7;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Largest message payload: one frame alone in one datagram.
pub const MAX_PAYLOAD_LEN: usize = MAX_DATAGRAM_SIZE - PACKET_HEADER_LEN - FRAME_HEADER_LEN;

/// Errors produced while decoding untrusted bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("message tag {tag} has payload length {actual}, expected {expected}")]
    BadLength {
        tag: u8,
        expected: PayloadLen,
        actual: usize,
    },
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
    #[error("string of {0} bytes does not fit a u16 length prefix")]
    StringTooLong(usize),
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    #[error("payload of {0} bytes exceeds the frame limit of {max} bytes", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge(usize),
    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: u32 },
}

/// Expected payload length of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLen {
    Exact(usize),
    AtLeast(usize),
}

impl PayloadLen {
    pub fn accepts(&self, len: usize) -> bool {
        match *self {
            PayloadLen::Exact(n) => len == n,
            PayloadLen::AtLeast(n) => len >= n,
        }
    }
}

impl fmt::Display for PayloadLen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadLen::Exact(n) => write!(f, "exactly {n}"),
            PayloadLen::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

/// Header carried by every datagram in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    /// Per-sender datagram sequence, strictly increasing from 1.
    /// Zero marks connectionless datagrams (refusals).
    pub sequence: u32,
    /// Highest reliable message id received in order by the sender.
    pub reliable_ack: u32,
}

impl PacketHeader {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sequence);
        buf.put_u32(self.reliable_ack);
    }

    /// Splits a datagram into its header and message body.
    pub fn read(datagram: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let mut buf = datagram;
        let sequence = read_u32(&mut buf)?;
        let reliable_ack = read_u32(&mut buf)?;
        Ok((
            Self {
                sequence,
                reliable_ack,
            },
            buf,
        ))
    }
}

/// One decoded message frame, borrowing its payload from the datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFrame<'a> {
    pub tag: u8,
    pub reliable_id: u32,
    pub payload: &'a [u8],
}

/// Fails for payloads that cannot travel in a frame.
pub fn check_payload_len(len: usize) -> Result<(), WireError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(len));
    }
    Ok(())
}

/// Appends a message frame to `buf`. Nothing is written when the payload
/// is too large.
pub fn write_frame(buf: &mut BytesMut, tag: u8, reliable_id: u32, payload: &[u8]) -> Result<(), WireError> {
    check_payload_len(payload.len())?;
    buf.put_u8(tag);
    buf.put_u32(reliable_id);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(())
}

/// On-wire size of a frame carrying `payload_len` bytes.
pub fn frame_len(payload_len: usize) -> usize {
    FRAME_HEADER_LEN + payload_len
}

/// Iterates the message frames of a datagram body.
///
/// Yields an error and then stops once a frame header or payload is cut
/// short; the remainder of that datagram cannot be resynchronised.
pub struct Frames<'a> {
    body: &'a [u8],
    failed: bool,
}

impl<'a> Frames<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self {
            body,
            failed: false,
        }
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<MessageFrame<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.body.is_empty() {
            return None;
        }
        let mut buf = self.body;
        let frame = read_frame(&mut buf);
        match frame {
            Ok(frame) => {
                self.body = buf;
                Some(Ok(frame))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn read_frame<'a>(buf: &mut &'a [u8]) -> Result<MessageFrame<'a>, WireError> {
    let tag = read_u8(buf)?;
    let reliable_id = read_u32(buf)?;
    let len = read_u16(buf)? as usize;
    ensure(buf, len)?;
    let data: &'a [u8] = *buf;
    let (payload, rest) = data.split_at(len);
    *buf = rest;
    Ok(MessageFrame {
        tag,
        reliable_id,
        payload,
    })
}

fn ensure(buf: &&[u8], needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn read_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut &[u8]) -> Result<u16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn read_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn read_i32(buf: &mut &[u8]) -> Result<i32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn read_f32(buf: &mut &[u8]) -> Result<f32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_f32())
}

/// Reads a `u16` length-prefixed UTF-8 string.
pub fn read_str(buf: &mut &[u8]) -> Result<String, WireError> {
    let len = read_u16(buf)? as usize;
    ensure(buf, len)?;
    let data: &[u8] = *buf;
    let (bytes, rest) = data.split_at(len);
    let s = std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)?;
    *buf = rest;
    Ok(s.to_string())
}

/// Writes a `u16` length-prefixed UTF-8 string.
pub fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), WireError> {
    let len = u16::try_from(s.len()).map_err(|_| WireError::StringTooLong(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Encoded size of a string written by [`put_str`].
pub fn str_len(s: &str) -> usize {
    2 + s.len()
}

/// Fails if a decoder left bytes behind.
pub fn finish(buf: &[u8]) -> Result<(), WireError> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(WireError::TrailingBytes(buf.len()))
    }
}
