//! Tokio codec framing [`Packet`]s over a byte stream.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::packet::{parse_header, Packet, HEADER_SIZE};
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_payload: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

impl PacketCodec {
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        let length = match parse_header(src, self.max_payload)? {
            Some(length) => length,
            None => return Ok(None),
        };

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        let version = src[4];
        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).to_vec();
        Ok(Some(Packet { version, payload }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > self.max_payload {
            return Err(ProtocolError::OversizedPacket(item.payload.len()));
        }
        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_slice(&crate::config::MAGIC_BYTES);
        dst.put_u8(item.version);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
