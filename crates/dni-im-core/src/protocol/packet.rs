//! Peer-to-peer packet framing.
//!
//! ```text
//! ┌────────┬───────────────┬───────────┬──────────────┐
//! │ type   │ connection id │ stream id │   payload    │
//! │ 1 byte │ 4 bytes BE    │ 2 bytes BE│  (variable)  │
//! └────────┴───────────────┴───────────┴──────────────┘
//! ```
//!
//! The connection id is chosen by the session initiator and demultiplexes
//! inbound datagrams to sessions. The stream id multiplexes conversations
//! within one session and is meaningful only for DATA packets. There is no
//! counter field: the AEAD counter is implicit session state.

use crate::error::{Error, Result};
use crate::MAX_CIPHERTEXT_SIZE;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 7;

/// Maximum payload per packet. No fragmentation is performed above this.
pub const MAX_PAYLOAD_SIZE: usize = MAX_CIPHERTEXT_SIZE;

/// Peer packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// First Noise IK handshake message.
    HandshakeInit = 1,
    /// Second Noise IK handshake message.
    HandshakeResp = 2,
    /// AEAD ciphertext on a stream.
    Data = 3,
    /// Reserved for per-message delivery acknowledgements. Ignored on
    /// receipt, never emitted.
    Ack = 4,
}

impl PacketType {
    /// Parse a wire type byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::HandshakeInit),
            2 => Ok(Self::HandshakeResp),
            3 => Ok(Self::Data),
            4 => Ok(Self::Ack),
            other => Err(Error::MalformedPacket(format!("unknown packet type {other}"))),
        }
    }

    /// The wire type byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded peer packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type.
    pub packet_type: PacketType,
    /// Session tag chosen by the initiator.
    pub connection_id: u32,
    /// Logical channel within the session. Zero for handshake packets.
    pub stream_id: u16,
    /// Handshake message bytes or AEAD ciphertext with tag.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet, enforcing the payload ceiling.
    pub fn new(
        packet_type: PacketType,
        connection_id: u32,
        stream_id: u16,
        payload: Vec<u8>,
    ) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::MessageTooLarge(payload.len()));
        }
        Ok(Self {
            packet_type,
            connection_id,
            stream_id,
            payload,
        })
    }

    /// Serialize for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.push(self.packet_type.to_byte());
        bytes.extend_from_slice(&self.connection_id.to_be_bytes());
        bytes.extend_from_slice(&self.stream_id.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse a received datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::MalformedPacket(format!("{} byte datagram", bytes.len())));
        }

        let packet_type = PacketType::from_byte(bytes[0])?;
        let connection_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let stream_id = u16::from_be_bytes([bytes[5], bytes[6]]);
        let payload = bytes[HEADER_LEN..].to_vec();

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::MalformedPacket("oversized payload".into()));
        }

        Ok(Self {
            packet_type,
            connection_id,
            stream_id,
            payload,
        })
    }
}

/// Associated data binding a DATA packet's header to its ciphertext, so a
/// tampered connection or stream id fails authentication.
pub fn data_aad(connection_id: u32, stream_id: u16) -> [u8; HEADER_LEN] {
    let mut aad = [0u8; HEADER_LEN];
    aad[0] = PacketType::Data.to_byte();
    aad[1..5].copy_from_slice(&connection_id.to_be_bytes());
    aad[5..7].copy_from_slice(&stream_id.to_be_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_types() {
        for packet_type in [
            PacketType::HandshakeInit,
            PacketType::HandshakeResp,
            PacketType::Data,
            PacketType::Ack,
        ] {
            let packet =
                Packet::new(packet_type, 0x1234_5678, 42, b"payload".to_vec()).unwrap();
            let decoded = Packet::decode(&packet.encode()).unwrap();
            assert_eq!(packet, decoded);
        }
    }

    #[test]
    fn header_layout_is_big_endian() {
        let packet = Packet::new(PacketType::Data, 0x0102_0304, 0x0506, vec![0xaa]).unwrap();
        let bytes = packet.encode();
        assert_eq!(bytes, vec![3, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xaa]);
    }

    #[test]
    fn short_datagram_is_malformed() {
        let err = Packet::decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
        assert!(err.is_silent_drop());
    }

    #[test]
    fn unknown_type_is_malformed() {
        let mut bytes = Packet::new(PacketType::Data, 1, 0, vec![]).unwrap().encode();
        bytes[0] = 0x7f;
        assert!(matches!(Packet::decode(&bytes), Err(Error::MalformedPacket(_))));
    }

    #[test]
    fn empty_payload_is_valid() {
        let packet = Packet::new(PacketType::Ack, 9, 0, vec![]).unwrap();
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn oversized_payload_rejected_at_build() {
        let err = Packet::new(PacketType::Data, 1, 0, vec![0; MAX_PAYLOAD_SIZE + 1]).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge(_)));
    }

    #[test]
    fn data_aad_matches_encoded_header() {
        let packet = Packet::new(PacketType::Data, 0xdead_beef, 12, vec![1, 2]).unwrap();
        let encoded = packet.encode();
        assert_eq!(&data_aad(0xdead_beef, 12)[..], &encoded[..HEADER_LEN]);
    }
}
