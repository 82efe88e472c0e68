//! Per-session state.
//!
//! A session is one Noise IK exchange with a peer plus the cipher pair it
//! produced. Counters are strictly monotonic per direction and double as
//! AEAD nonces; they never appear on the wire. Streams are logical channels
//! within the session, created on first use and torn down with it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::crypto::noise::Handshake;
use crate::crypto::TransportCipher;
use crate::error::{Error, Result};
use crate::identity::Fingerprint;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake message sent, waiting for the response.
    AwaitingResponse,
    /// Both ciphers keyed; data flows.
    Established,
    /// Torn down; kept only until swept from the table.
    Closed,
}

/// A session with one peer.
pub struct Session {
    /// Session tag chosen by the initiator.
    pub connection_id: u32,
    /// Where packets for this session go (the relay for relayed peers).
    pub remote: SocketAddr,
    /// Whether traffic is wrapped for the relay.
    pub via_relay: bool,
    /// The peer on the other end.
    pub peer: Fingerprint,
    /// Current state.
    pub state: SessionState,
    /// In-flight handshake (initiator side only).
    pub handshake: Option<Handshake>,
    /// Encoded HANDSHAKE_INIT bytes kept for the single retransmission.
    pub init_frame: Option<Vec<u8>>,
    /// When the handshake message was last sent.
    pub handshake_sent_at: Instant,
    /// Whether the one allowed retransmission happened.
    pub handshake_retried: bool,
    send_cipher: Option<TransportCipher>,
    recv_cipher: Option<TransportCipher>,
    /// Next counter to encrypt with.
    pub send_counter: u64,
    /// Exactly the counter the next inbound message must decrypt at.
    pub recv_counter: u64,
    /// Streams by id, with last activity.
    pub streams: HashMap<u16, Instant>,
    /// Last packet in either direction.
    pub last_activity: Instant,
}

impl Session {
    /// A session we initiated; established once the response arrives.
    pub fn new_initiator(
        connection_id: u32,
        remote: SocketAddr,
        via_relay: bool,
        peer: Fingerprint,
        handshake: Handshake,
        init_frame: Vec<u8>,
    ) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            remote,
            via_relay,
            peer,
            state: SessionState::AwaitingResponse,
            handshake: Some(handshake),
            init_frame: Some(init_frame),
            handshake_sent_at: now,
            handshake_retried: false,
            send_cipher: None,
            recv_cipher: None,
            send_counter: 0,
            recv_counter: 0,
            streams: HashMap::new(),
            last_activity: now,
        }
    }

    /// A session accepted from an inbound handshake; established at birth.
    pub fn new_responder(
        connection_id: u32,
        remote: SocketAddr,
        via_relay: bool,
        peer: Fingerprint,
        send_cipher: TransportCipher,
        recv_cipher: TransportCipher,
    ) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            remote,
            via_relay,
            peer,
            state: SessionState::Established,
            handshake: None,
            init_frame: None,
            handshake_sent_at: now,
            handshake_retried: false,
            send_cipher: Some(send_cipher),
            recv_cipher: Some(recv_cipher),
            send_counter: 0,
            recv_counter: 0,
            streams: HashMap::new(),
            last_activity: now,
        }
    }

    /// Move an awaiting session to established with its cipher pair.
    pub fn establish(&mut self, send_cipher: TransportCipher, recv_cipher: TransportCipher) {
        self.send_cipher = Some(send_cipher);
        self.recv_cipher = Some(recv_cipher);
        self.handshake = None;
        self.init_frame = None;
        self.state = SessionState::Established;
        self.last_activity = Instant::now();
    }

    /// Whether data can flow.
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Encrypt at the current send counter without advancing it; call
    /// [`Session::commit_send`] after the datagram actually left.
    pub fn encrypt_at_current(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = self
            .send_cipher
            .as_ref()
            .ok_or_else(|| Error::Crypto("session not established".into()))?;
        cipher.encrypt(self.send_counter, plaintext, aad)
    }

    /// Advance the send counter and touch the stream after a successful send.
    pub fn commit_send(&mut self, stream_id: u16) {
        self.send_counter += 1;
        let now = Instant::now();
        self.streams.insert(stream_id, now);
        self.last_activity = now;
    }

    /// Decrypt at exactly the expected receive counter; advances it on
    /// success only.
    pub fn decrypt_next(&mut self, stream_id: u16, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = self
            .recv_cipher
            .as_ref()
            .ok_or_else(|| Error::Crypto("session not established".into()))?;
        let plaintext = cipher.decrypt(self.recv_counter, ciphertext, aad)?;
        self.recv_counter += 1;
        let now = Instant::now();
        self.streams.insert(stream_id, now);
        self.last_activity = now;
        Ok(plaintext.to_vec())
    }

    /// Mark the session closed.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.send_cipher = None;
        self.recv_cipher = None;
        self.handshake = None;
        self.init_frame = None;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("peer", &self.peer)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .field("streams", &self.streams.len())
            .finish()
    }
}
