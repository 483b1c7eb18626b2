//! One frame of the wire format.
//!
//! A frame is an 8-byte header followed by the payload: 4-byte little-endian
//! packet type, 4-byte little-endian payload length, then `length` payload
//! bytes (UTF-8 JSON or empty).
//!
//! Stream transports reassemble frames through [`crate::core::codec::PacketCodec`];
//! datagram transports carry exactly one frame per datagram and decode it
//! strictly with [`Packet::from_datagram`].

use crate::config::{HEADER_LEN, MAX_PAYLOAD_SIZE};
use crate::error::{ProtocolError, Result};

/// One `(type, payload)` unit of the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Numeric packet type (see `protocol::event::EventType` for the contract)
    pub packet_type: u32,
    /// Raw payload bytes; empty is legal
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: u32, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            payload,
        }
    }

    /// Serialize this packet to wire bytes: type, length, payload, all LE.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.packet_type.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a single datagram with default size limits.
    pub fn from_datagram(buf: &[u8]) -> Result<Self> {
        Self::from_datagram_bounded(buf, MAX_PAYLOAD_SIZE)
    }

    /// Decode a single datagram.
    ///
    /// A datagram must contain the full header and exactly the declared
    /// number of payload bytes. Anything else is malformed: "need more
    /// data" cannot happen on a datagram transport.
    pub fn from_datagram_bounded(buf: &[u8], max_payload: usize) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidHeader);
        }

        let packet_type = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let declared = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;

        if declared > max_payload {
            return Err(ProtocolError::OversizedPacket(declared));
        }

        let actual = buf.len() - HEADER_LEN;
        if declared != actual {
            return Err(ProtocolError::PayloadLengthMismatch { declared, actual });
        }

        Ok(Self {
            packet_type,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}
