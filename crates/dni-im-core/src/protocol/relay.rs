//! Client↔relay wire format.
//!
//! A separate protocol from the peer packets: these bytes travel only
//! between a client and the relay's known address and are parsed in that
//! context. Fingerprints are their 16 ASCII characters; names are
//! length-prefixed UTF-8.
//!
//! The relay observes source addresses, fingerprints and payload sizes. The
//! `RELAY` payload is a complete peer-to-peer packet and stays
//! Noise-encrypted end to end.

use crate::crypto::keys::{PublicKey, X25519_KEY_SIZE};
use crate::error::{Error, Result};
use crate::identity::{Fingerprint, FINGERPRINT_LEN};

/// Client registers its fingerprint, key and name.
pub const OP_REGISTER: u8 = 0x01;
/// Client asks the relay to forward an opaque payload.
pub const OP_RELAY: u8 = 0x02;
/// Client requests the registered peer list.
pub const OP_LIST: u8 = 0x03;
/// Client announces departure. Best effort, never acknowledged.
pub const OP_DEREGISTER: u8 = 0x04;
/// Relay confirms a registration.
pub const OP_REGISTER_ACK: u8 = 0x81;
/// Relay answers a LIST request.
pub const OP_LIST_RESP: u8 = 0x83;

/// A peer entry in a LIST response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPeer {
    /// The peer's fingerprint.
    pub fingerprint: Fingerprint,
    /// The static key the peer registered with.
    pub static_pub: PublicKey,
    /// The peer's display name.
    pub name: String,
}

/// A message on the client↔relay link, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// Register or refresh this client at the relay.
    Register {
        /// Registering client's fingerprint.
        fingerprint: Fingerprint,
        /// Static key to advertise to other clients.
        static_pub: PublicKey,
        /// Display name to advertise.
        name: String,
    },
    /// Registration confirmation.
    RegisterAck {
        /// Echo of the registered fingerprint.
        fingerprint: Fingerprint,
    },
    /// Forward `payload` to the client registered as `dest`.
    Relay {
        /// Destination fingerprint.
        dest: Fingerprint,
        /// A complete peer-to-peer packet; opaque to the relay.
        payload: Vec<u8>,
    },
    /// Request the registered peer list.
    List,
    /// The registered peer list.
    ListResp {
        /// All currently registered peers.
        peers: Vec<RelayPeer>,
    },
    /// Announce departure.
    Deregister {
        /// Departing client's fingerprint.
        fingerprint: Fingerprint,
    },
}

/// Whether a datagram from the relay address is a relay-protocol response
/// (as opposed to a forwarded peer packet).
pub fn is_relay_response(first_byte: u8) -> bool {
    matches!(first_byte, OP_REGISTER_ACK | OP_LIST_RESP)
}

impl RelayMessage {
    /// Serialize for transmission.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Register { fingerprint, static_pub, name } => {
                let name = truncate_name(name);
                let mut bytes = Vec::with_capacity(1 + FINGERPRINT_LEN + X25519_KEY_SIZE + 1 + name.len());
                bytes.push(OP_REGISTER);
                bytes.extend_from_slice(fingerprint.as_bytes());
                bytes.extend_from_slice(static_pub.as_bytes());
                bytes.push(name.len() as u8);
                bytes.extend_from_slice(name.as_bytes());
                bytes
            }
            Self::RegisterAck { fingerprint } => {
                let mut bytes = Vec::with_capacity(1 + FINGERPRINT_LEN);
                bytes.push(OP_REGISTER_ACK);
                bytes.extend_from_slice(fingerprint.as_bytes());
                bytes
            }
            Self::Relay { dest, payload } => {
                let mut bytes = Vec::with_capacity(1 + FINGERPRINT_LEN + payload.len());
                bytes.push(OP_RELAY);
                bytes.extend_from_slice(dest.as_bytes());
                bytes.extend_from_slice(payload);
                bytes
            }
            Self::List => vec![OP_LIST],
            Self::ListResp { peers } => {
                let mut bytes = vec![OP_LIST_RESP];
                bytes.extend_from_slice(&(peers.len().min(u16::MAX as usize) as u16).to_be_bytes());
                for peer in peers.iter().take(u16::MAX as usize) {
                    let name = truncate_name(&peer.name);
                    bytes.extend_from_slice(peer.fingerprint.as_bytes());
                    bytes.extend_from_slice(peer.static_pub.as_bytes());
                    bytes.push(name.len() as u8);
                    bytes.extend_from_slice(name.as_bytes());
                }
                bytes
            }
            Self::Deregister { fingerprint } => {
                let mut bytes = Vec::with_capacity(1 + FINGERPRINT_LEN);
                bytes.push(OP_DEREGISTER);
                bytes.extend_from_slice(fingerprint.as_bytes());
                bytes
            }
        }
    }

    /// Parse a received relay datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&op, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::MalformedPacket("empty relay datagram".into()))?;

        match op {
            OP_REGISTER => {
                let (fingerprint, rest) = take_fingerprint(rest)?;
                let (static_pub, rest) = take_key(rest)?;
                let (name, rest) = take_name(rest)?;
                if !rest.is_empty() {
                    return Err(Error::MalformedPacket("trailing bytes after REGISTER".into()));
                }
                Ok(Self::Register { fingerprint, static_pub, name })
            }
            OP_REGISTER_ACK => {
                let (fingerprint, rest) = take_fingerprint(rest)?;
                if !rest.is_empty() {
                    return Err(Error::MalformedPacket("trailing bytes after REGISTER_ACK".into()));
                }
                Ok(Self::RegisterAck { fingerprint })
            }
            OP_RELAY => {
                let (dest, rest) = take_fingerprint(rest)?;
                if rest.is_empty() {
                    return Err(Error::MalformedPacket("RELAY without payload".into()));
                }
                Ok(Self::Relay { dest, payload: rest.to_vec() })
            }
            OP_LIST => {
                if !rest.is_empty() {
                    return Err(Error::MalformedPacket("trailing bytes after LIST".into()));
                }
                Ok(Self::List)
            }
            OP_LIST_RESP => {
                if rest.len() < 2 {
                    return Err(Error::MalformedPacket("LIST_RESP without count".into()));
                }
                let count = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                let mut rest = &rest[2..];
                let mut peers = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let (fingerprint, after) = take_fingerprint(rest)?;
                    let (static_pub, after) = take_key(after)?;
                    let (name, after) = take_name(after)?;
                    peers.push(RelayPeer { fingerprint, static_pub, name });
                    rest = after;
                }
                if !rest.is_empty() {
                    return Err(Error::MalformedPacket("trailing bytes after LIST_RESP".into()));
                }
                Ok(Self::ListResp { peers })
            }
            OP_DEREGISTER => {
                let (fingerprint, rest) = take_fingerprint(rest)?;
                if !rest.is_empty() {
                    return Err(Error::MalformedPacket("trailing bytes after DEREGISTER".into()));
                }
                Ok(Self::Deregister { fingerprint })
            }
            other => Err(Error::MalformedPacket(format!("unknown relay opcode {other:#04x}"))),
        }
    }
}

fn truncate_name(name: &str) -> &str {
    // Names longer than one length byte allows are cut at a char boundary.
    if name.len() <= u8::MAX as usize {
        return name;
    }
    let mut end = u8::MAX as usize;
    while end > 0 && !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

fn take_fingerprint(bytes: &[u8]) -> Result<(Fingerprint, &[u8])> {
    if bytes.len() < FINGERPRINT_LEN {
        return Err(Error::MalformedPacket("truncated fingerprint".into()));
    }
    let mut raw = [0u8; FINGERPRINT_LEN];
    raw.copy_from_slice(&bytes[..FINGERPRINT_LEN]);
    Ok((Fingerprint::from_wire(raw)?, &bytes[FINGERPRINT_LEN..]))
}

fn take_key(bytes: &[u8]) -> Result<(PublicKey, &[u8])> {
    if bytes.len() < X25519_KEY_SIZE {
        return Err(Error::MalformedPacket("truncated static key".into()));
    }
    let mut raw = [0u8; X25519_KEY_SIZE];
    raw.copy_from_slice(&bytes[..X25519_KEY_SIZE]);
    Ok((PublicKey::from_bytes(raw), &bytes[X25519_KEY_SIZE..]))
}

fn take_name(bytes: &[u8]) -> Result<(String, &[u8])> {
    let (&len, rest) = bytes
        .split_first()
        .ok_or_else(|| Error::MalformedPacket("missing name length".into()))?;
    let len = len as usize;
    if rest.len() < len {
        return Err(Error::MalformedPacket("truncated name".into()));
    }
    let name = std::str::from_utf8(&rest[..len])
        .map_err(|_| Error::MalformedPacket("name is not UTF-8".into()))?
        .to_string();
    Ok((name, &rest[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(tag: &str) -> Fingerprint {
        Fingerprint::derive(tag.as_bytes())
    }

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_bytes([byte; X25519_KEY_SIZE])
    }

    #[test]
    fn register_round_trip() {
        let msg = RelayMessage::Register {
            fingerprint: fp("a"),
            static_pub: key(1),
            name: "Alice".into(),
        };
        assert_eq!(RelayMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn relay_round_trip_preserves_payload() {
        let msg = RelayMessage::Relay {
            dest: fp("b"),
            payload: vec![3, 0, 0, 0, 1, 0, 7, 0xde, 0xad],
        };
        assert_eq!(RelayMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn list_resp_round_trip() {
        let msg = RelayMessage::ListResp {
            peers: vec![
                RelayPeer { fingerprint: fp("a"), static_pub: key(1), name: "Alice".into() },
                RelayPeer { fingerprint: fp("b"), static_pub: key(2), name: "Bo b".into() },
            ],
        };
        assert_eq!(RelayMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn empty_list_resp() {
        let msg = RelayMessage::ListResp { peers: vec![] };
        assert_eq!(RelayMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn control_messages_round_trip() {
        for msg in [
            RelayMessage::List,
            RelayMessage::RegisterAck { fingerprint: fp("x") },
            RelayMessage::Deregister { fingerprint: fp("y") },
        ] {
            assert_eq!(RelayMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn response_bytes_are_distinguishable() {
        assert!(is_relay_response(OP_REGISTER_ACK));
        assert!(is_relay_response(OP_LIST_RESP));
        // Peer packet types must not look like relay responses.
        for byte in 1u8..=4 {
            assert!(!is_relay_response(byte));
        }
    }

    #[test]
    fn truncated_and_trailing_input_rejected() {
        let good = RelayMessage::Register {
            fingerprint: fp("a"),
            static_pub: key(1),
            name: "Alice".into(),
        }
        .encode();

        assert!(RelayMessage::decode(&good[..10]).is_err());

        let mut trailing = good.clone();
        trailing.push(0);
        assert!(RelayMessage::decode(&trailing).is_err());

        assert!(RelayMessage::decode(&[]).is_err());
        assert!(RelayMessage::decode(&[0x55]).is_err());
    }

    #[test]
    fn oversized_name_is_truncated() {
        let long = "x".repeat(300);
        let msg = RelayMessage::Register {
            fingerprint: fp("a"),
            static_pub: key(1),
            name: long,
        };
        let decoded = RelayMessage::decode(&msg.encode()).unwrap();
        match decoded {
            RelayMessage::Register { name, .. } => assert_eq!(name.len(), 255),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
