//! Frame format carrying one encoded message.
//!
//! ```text
//! [Magic(4)] [Version(1)] [Length(4)] [Payload(N)]
//! ```
//!
//! The frame gives the reader a boundary to skip to when a message inside it
//! cannot be decoded. Header problems are not recoverable: after bad magic or an
//! oversized length the stream position can no longer be trusted.

use crate::config::{MAGIC_BYTES, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::error::{ProtocolError, Result};

/// Magic + version + length
pub const HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&MAGIC_BYTES);
        out.push(self.version);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse one complete frame using the default payload limit
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Self::from_bytes_with_limit(buf, MAX_PAYLOAD_SIZE)
    }

    pub fn from_bytes_with_limit(buf: &[u8], max_payload: usize) -> Result<Self> {
        let length = parse_header(buf, max_payload)?.ok_or(ProtocolError::InvalidHeader)?;
        if buf.len() < HEADER_SIZE + length {
            return Err(ProtocolError::InvalidHeader);
        }
        Ok(Self {
            version: buf[4],
            payload: buf[HEADER_SIZE..HEADER_SIZE + length].to_vec(),
        })
    }
}

/// Validate a frame header. `Ok(None)` means more bytes are needed.
pub fn parse_header(buf: &[u8], max_payload: usize) -> Result<Option<usize>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    if buf[0..4] != MAGIC_BYTES {
        return Err(ProtocolError::InvalidHeader);
    }
    if buf[4] != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(buf[4]));
    }
    let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    if length > max_payload {
        return Err(ProtocolError::OversizedPacket(length));
    }
    Ok(Some(length))
}
