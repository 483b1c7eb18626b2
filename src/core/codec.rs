//! Tokio codec for framing packets over byte streams.
//!
//! Stream reads can split a frame at any byte boundary, so the decoder
//! consumes nothing from the buffer until the full header and the full
//! declared payload are available. Insufficient data yields `Ok(None)` with
//! no side effects, letting the caller retry with further input.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{HEADER_LEN, MAX_PAYLOAD_SIZE};
use crate::core::packet::Packet;
use crate::error::ProtocolError;

/// Length-prefixed packet codec for stream transports.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_payload: usize,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Codec with a custom payload ceiling.
    pub fn with_limit(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let packet_type = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let declared = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;

        // Validate before reserving: the length field is attacker-controlled.
        if declared > self.max_payload {
            return Err(ProtocolError::OversizedPacket(declared));
        }

        if src.len() < HEADER_LEN + declared {
            src.reserve(HEADER_LEN + declared - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(declared).to_vec();

        Ok(Some(Packet {
            packet_type,
            payload,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if packet.payload.len() > self.max_payload {
            return Err(ProtocolError::OversizedPacket(packet.payload.len()));
        }

        dst.reserve(HEADER_LEN + packet.payload.len());
        dst.put_u32_le(packet.packet_type);
        dst.put_u32_le(packet.payload.len() as u32);
        dst.put_slice(&packet.payload);
        Ok(())
    }
}
