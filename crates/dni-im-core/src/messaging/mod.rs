//! Session layer: commands, events, and the session task.
//!
//! The session task ([`manager::SessionManager`]) is the single owner of the
//! session table, contact book, endpoint table and message queue. Everything
//! reaches it through one [`Input`] channel: decoded packets from the
//! receive task, observations from discovery, commands from the UI, and
//! timer ticks. Event ordering within that channel is the ordering
//! guarantee.

pub mod manager;
mod session;

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::crypto::keys::PublicKey;
use crate::discovery::{DiscoveryEvent, PeerSource};
use crate::error::{Error, Result};
use crate::identity::Fingerprint;
use crate::protocol::Packet;

/// Everything the session task consumes, in arrival order.
#[derive(Debug)]
pub enum Input {
    /// A decoded datagram from the receive task.
    Packet {
        /// The decoded packet.
        packet: Packet,
        /// Source address of the datagram.
        from: SocketAddr,
        /// Whether it arrived forwarded by the relay.
        via_relay: bool,
    },
    /// An observation from a discovery backend.
    Discovery(DiscoveryEvent),
    /// A command from the UI.
    Command(Command),
    /// Periodic timer tick for timeout sweeping.
    Tick,
}

/// Commands the UI can issue.
#[derive(Debug)]
pub enum Command {
    /// Send `plaintext` to a peer on a stream.
    Send {
        /// Destination fingerprint.
        to: Fingerprint,
        /// Logical conversation channel.
        stream_id: u16,
        /// Message content.
        plaintext: Vec<u8>,
        /// Outcome reply; absent for internally generated sends.
        reply: Option<oneshot::Sender<Result<SendOutcome>>>,
    },
    /// List currently known peers.
    ListPeers {
        /// Reply channel.
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    /// Remove a peer's endpoint and close any session with it.
    DeletePeer {
        /// The peer to drop.
        fingerprint: Fingerprint,
    },
    /// Add a peer endpoint by hand (for networks that filter mDNS).
    AddPeerManual {
        /// The peer's fingerprint.
        fingerprint: Fingerprint,
        /// Where to reach it.
        addr: SocketAddr,
        /// Its static key, as pinned or exchanged out of band.
        static_pub: PublicKey,
    },
    /// Change a contact's display name.
    RenameContact {
        /// The contact.
        fingerprint: Fingerprint,
        /// The new name.
        name: String,
    },
    /// Erase a pin so the next handshake re-pins. Explicit user action.
    ForgetContact {
        /// The contact.
        fingerprint: Fingerprint,
    },
    /// Stop the session task.
    Shutdown,
}

/// Result of a send command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Encrypted and handed to the transport.
    Sent,
    /// Persisted; will drain once a session to the recipient establishes.
    Queued,
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No traffic for the idle window.
    IdleTimeout,
    /// Decrypt failure or counter exhaustion.
    CryptoFailure,
    /// The peer presented a key differing from the pin.
    PinningViolation,
    /// The peer never answered the handshake.
    HandshakeTimeout,
    /// Closed at the user's request.
    UserRequest,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::CryptoFailure => f.write_str("crypto failure"),
            CloseReason::PinningViolation => f.write_str("pinning violation"),
            CloseReason::HandshakeTimeout => f.write_str("handshake timeout"),
            CloseReason::UserRequest => f.write_str("user request"),
        }
    }
}

/// Events emitted to the UI.
#[derive(Debug, Clone)]
pub enum Event {
    /// A new peer appeared on some backend.
    PeerDiscovered {
        /// The peer.
        fingerprint: Fingerprint,
        /// Advertised display name, if any.
        name: Option<String>,
        /// Which backend saw it first.
        source: PeerSource,
    },
    /// A peer's endpoints all expired or were removed.
    PeerLost {
        /// The peer.
        fingerprint: Fingerprint,
    },
    /// A session reached the established state.
    SessionEstablished {
        /// The peer.
        fingerprint: Fingerprint,
    },
    /// A session closed.
    SessionClosed {
        /// The peer.
        fingerprint: Fingerprint,
        /// Why it closed.
        reason: CloseReason,
    },
    /// A message arrived.
    MessageReceived {
        /// The sender.
        fingerprint: Fingerprint,
        /// The stream it arrived on.
        stream_id: u16,
        /// Decrypted content.
        plaintext: Vec<u8>,
    },
    /// A peer presented a key that differs from its pin. Prominent.
    PinningViolation {
        /// The offending fingerprint.
        fingerprint: Fingerprint,
    },
    /// The queue could not persist a message; the send was not accepted.
    QueuePersistFailed {
        /// The intended recipient.
        fingerprint: Fingerprint,
    },
}

/// A known peer, as reported by `list_peers`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer.
    pub fingerprint: Fingerprint,
    /// Last advertised display name.
    pub name: Option<String>,
    /// Current transport address.
    pub addr: SocketAddr,
    /// Winning discovery source.
    pub source: PeerSource,
}

/// Identity introduction carried encrypted inside each handshake message.
///
/// This is how the responder learns which fingerprint the authenticated
/// static key claims to belong to, and how display names propagate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeIntro {
    /// The sender's fingerprint.
    pub fingerprint: Fingerprint,
    /// The sender's display name.
    pub display_name: String,
}

impl HandshakeIntro {
    /// Encode for the handshake payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Crypto(format!("encode intro: {e}")))
    }

    /// Decode a received handshake payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|_| Error::HandshakeDecryptFailed("unparseable intro".into()))
    }
}
