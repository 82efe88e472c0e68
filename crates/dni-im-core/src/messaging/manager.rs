//! The session task.
//!
//! Single owner of sessions, contacts, endpoints and the queue. Consumes one
//! input channel serially; no state is shared with other tasks. The session
//! table is keyed by `(connection_id, remote address)` so two initiators
//! that independently pick the same connection id stay isolated.
//!
//! State machine per session:
//!
//! ```text
//! ──send HANDSHAKE_INIT──▶ AwaitingResponse
//! AwaitingResponse ──recv HANDSHAKE_RESP──▶ Established
//! Established ──send/recv DATA──▶ Established
//! any ──idle > 10 min──▶ Closed
//! any ──decrypt failure / pinning violation──▶ Closed (fatal)
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::session::{Session, SessionState};
use super::{CloseReason, Command, Event, HandshakeIntro, Input, PeerInfo, SendOutcome};
use crate::crypto::aead::TAG_SIZE;
use crate::crypto::keys::PublicKey;
use crate::crypto::noise;
use crate::discovery::{DiscoveryEvent, EndpointTable, ObserveOutcome, PeerObservation, PeerSource};
use crate::error::{Error, Result};
use crate::identity::{Fingerprint, Identity};
use crate::logging::ShortFp;
use crate::protocol::packet::{data_aad, Packet, PacketType, MAX_PAYLOAD_SIZE};
use crate::protocol::relay::RelayMessage;
use crate::storage::{ContactBook, MessageQueue, PinResult};
use crate::transport::UdpTransport;

/// Handshake response timeout; one retransmission, then the session fails.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle session timeout.
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Session table key. Two peers may pick the same connection id; the source
/// address disambiguates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SessionKey {
    connection_id: u32,
    remote: SocketAddr,
}

/// The session task state. Constructed by the node, consumed by
/// [`SessionManager::run`].
pub struct SessionManager {
    identity: Identity,
    transport: UdpTransport,
    relay_addr: Option<SocketAddr>,
    sessions: HashMap<SessionKey, Session>,
    by_peer: HashMap<Fingerprint, SessionKey>,
    endpoints: EndpointTable,
    contacts: ContactBook,
    queue: MessageQueue,
    violations: HashSet<Fingerprint>,
    events: broadcast::Sender<Event>,
}

impl SessionManager {
    /// Wire up the session task. Dependencies are passed in explicitly;
    /// there is no ambient state.
    pub fn new(
        identity: Identity,
        transport: UdpTransport,
        relay_addr: Option<SocketAddr>,
        contacts: ContactBook,
        queue: MessageQueue,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            identity,
            transport,
            relay_addr,
            sessions: HashMap::new(),
            by_peer: HashMap::new(),
            endpoints: EndpointTable::new(),
            contacts,
            queue,
            violations: HashSet::new(),
            events,
        }
    }

    /// Run until the input channel closes or a shutdown command arrives.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Input>) {
        info!(fingerprint = %ShortFp(self.identity.fingerprint().as_str()), "session task started");

        while let Some(input) = rx.recv().await {
            if matches!(input, Input::Command(Command::Shutdown)) {
                break;
            }
            self.handle_input(input).await;
        }

        info!("session task stopped");
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Packet { packet, from, via_relay } => {
                self.handle_packet(packet, from, via_relay).await;
            }
            Input::Discovery(event) => self.handle_discovery(event).await,
            Input::Command(command) => self.handle_command(command).await,
            Input::Tick => self.tick().await,
        }
    }

    // ---------- inbound packets ----------

    async fn handle_packet(&mut self, packet: Packet, from: SocketAddr, via_relay: bool) {
        match packet.packet_type {
            PacketType::HandshakeInit => self.on_handshake_init(packet, from, via_relay).await,
            PacketType::HandshakeResp => self.on_handshake_resp(packet, from).await,
            PacketType::Data => self.on_data(packet, from),
            PacketType::Ack => {
                debug!(from = %from, "ignoring ACK packet");
            }
        }
    }

    async fn on_handshake_init(&mut self, packet: Packet, from: SocketAddr, via_relay: bool) {
        let key = SessionKey { connection_id: packet.connection_id, remote: from };

        let mut handshake = noise::respond(self.identity.static_keys().clone());
        let payload = match handshake.read_message(&packet.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(from = %from, error = %e, "dropping handshake init");
                return;
            }
        };
        let intro = match HandshakeIntro::from_bytes(&payload) {
            Ok(intro) => intro,
            Err(e) => {
                debug!(from = %from, error = %e, "dropping handshake init");
                return;
            }
        };
        let Some(peer_static) = handshake.remote_static() else {
            debug!(from = %from, "handshake init without static key");
            return;
        };

        // TOFU before any reply leaves.
        match self.contacts.pin(intro.fingerprint, &peer_static, Some(&intro.display_name)) {
            Ok(PinResult::Created) => {
                info!(fingerprint = %ShortFp(intro.fingerprint.as_str()), "pinned new contact");
            }
            Ok(PinResult::Unchanged) => {}
            Ok(PinResult::Violation) => {
                warn!(
                    fingerprint = %ShortFp(intro.fingerprint.as_str()),
                    "handshake presented a key differing from the pin"
                );
                self.violations.insert(intro.fingerprint);
                self.emit(Event::PinningViolation { fingerprint: intro.fingerprint });
                return;
            }
            Err(e) => {
                warn!(error = %e, "contact book unavailable, refusing handshake");
                return;
            }
        }

        let our_intro = HandshakeIntro {
            fingerprint: self.identity.fingerprint(),
            display_name: self.identity.display_name().to_string(),
        };
        let response = match our_intro.to_bytes().and_then(|bytes| handshake.write_message(&bytes)) {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "could not build handshake response");
                return;
            }
        };
        let (send_cipher, recv_cipher, _) = match handshake.finalize() {
            Ok(split) => split,
            Err(e) => {
                debug!(error = %e, "handshake finalize failed");
                return;
            }
        };

        let response_packet =
            match Packet::new(PacketType::HandshakeResp, packet.connection_id, 0, response) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(error = %e, "handshake response too large");
                    return;
                }
            };
        if let Err(e) = self
            .transmit(from, via_relay, intro.fingerprint, &response_packet.encode())
            .await
        {
            debug!(from = %from, error = %e, "handshake response send failed");
            return;
        }

        // A fresh HANDSHAKE_INIT always establishes a new session bound to
        // the source address; any previous session with the peer is replaced.
        if let Some(old_key) = self.by_peer.remove(&intro.fingerprint) {
            self.sessions.remove(&old_key);
        }
        let session = Session::new_responder(
            packet.connection_id,
            from,
            via_relay,
            intro.fingerprint,
            send_cipher,
            recv_cipher,
        );
        self.sessions.insert(key, session);
        self.by_peer.insert(intro.fingerprint, key);

        let outcome = self.endpoints.observe(
            PeerObservation {
                fingerprint: intro.fingerprint,
                name: Some(intro.display_name.clone()),
                static_pub: Some(peer_static),
                addr: from,
                source: if via_relay { PeerSource::Relay } else { PeerSource::Lan },
            },
            Instant::now(),
        );
        if outcome == ObserveOutcome::Discovered {
            self.emit(Event::PeerDiscovered {
                fingerprint: intro.fingerprint,
                name: Some(intro.display_name),
                source: if via_relay { PeerSource::Relay } else { PeerSource::Lan },
            });
        }

        info!(
            fingerprint = %ShortFp(intro.fingerprint.as_str()),
            connection_id = packet.connection_id,
            "inbound session established"
        );
        self.emit(Event::SessionEstablished { fingerprint: intro.fingerprint });
        self.drain_queue(intro.fingerprint).await;
    }

    async fn on_handshake_resp(&mut self, packet: Packet, from: SocketAddr) {
        let key = SessionKey { connection_id: packet.connection_id, remote: from };

        let Some(session) = self.sessions.get_mut(&key) else {
            debug!(
                from = %from,
                error = %Error::UnknownConnectionId(packet.connection_id),
                "dropping handshake response"
            );
            return;
        };
        if session.state != SessionState::AwaitingResponse {
            debug!(from = %from, "handshake response for a settled session");
            return;
        }
        let Some(handshake) = session.handshake.as_mut() else {
            debug!(from = %from, "no handshake state");
            return;
        };

        let payload = match handshake.read_message(&packet.payload) {
            Ok(payload) => payload,
            Err(e) => {
                // Drop only; the retry timer decides the session's fate.
                debug!(from = %from, error = %e, "dropping handshake response");
                return;
            }
        };
        let intro = match HandshakeIntro::from_bytes(&payload) {
            Ok(intro) => intro,
            Err(e) => {
                debug!(from = %from, error = %e, "dropping handshake response");
                return;
            }
        };

        let Some(handshake) = session.handshake.take() else {
            return;
        };
        let peer = session.peer;
        let (send_cipher, recv_cipher, peer_static) = match handshake.finalize() {
            Ok(split) => split,
            Err(e) => {
                debug!(error = %e, "handshake finalize failed");
                self.close_session(key, CloseReason::CryptoFailure, true);
                return;
            }
        };

        if intro.fingerprint != peer {
            warn!(
                expected = %ShortFp(peer.as_str()),
                claimed = %ShortFp(intro.fingerprint.as_str()),
                "handshake response claimed a different fingerprint"
            );
            self.close_session(key, CloseReason::CryptoFailure, false);
            return;
        }

        match self.contacts.pin(peer, &peer_static, Some(&intro.display_name)) {
            Ok(PinResult::Created) => {
                info!(fingerprint = %ShortFp(peer.as_str()), "pinned new contact");
            }
            Ok(PinResult::Unchanged) => {}
            Ok(PinResult::Violation) => {
                self.violations.insert(peer);
                self.emit(Event::PinningViolation { fingerprint: peer });
                self.close_session(key, CloseReason::PinningViolation, true);
                return;
            }
            Err(e) => {
                warn!(error = %e, "contact book unavailable, closing session");
                self.close_session(key, CloseReason::CryptoFailure, true);
                return;
            }
        }

        if let Some(session) = self.sessions.get_mut(&key) {
            session.establish(send_cipher, recv_cipher);
        }

        info!(
            fingerprint = %ShortFp(peer.as_str()),
            connection_id = packet.connection_id,
            "outbound session established"
        );
        self.emit(Event::SessionEstablished { fingerprint: peer });
        self.drain_queue(peer).await;
    }

    fn on_data(&mut self, packet: Packet, from: SocketAddr) {
        let key = SessionKey { connection_id: packet.connection_id, remote: from };

        let Some(session) = self.sessions.get_mut(&key) else {
            debug!(
                from = %from,
                error = %Error::UnknownConnectionId(packet.connection_id),
                "dropping data packet"
            );
            return;
        };
        if !session.is_established() {
            debug!(from = %from, "data packet before establishment");
            return;
        }

        let aad = data_aad(packet.connection_id, packet.stream_id);
        match session.decrypt_next(packet.stream_id, &packet.payload, &aad) {
            Ok(plaintext) => {
                let fingerprint = session.peer;
                self.emit(Event::MessageReceived {
                    fingerprint,
                    stream_id: packet.stream_id,
                    plaintext,
                });
            }
            Err(e) => {
                // Fatal: strict counters make any mismatch indistinguishable
                // from tampering. No reply to the peer.
                warn!(
                    fingerprint = %ShortFp(session.peer.as_str()),
                    error = %e,
                    "data packet failed decryption, closing session"
                );
                self.close_session(key, CloseReason::CryptoFailure, true);
            }
        }
    }

    // ---------- discovery ----------

    async fn handle_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Up(obs) => {
                if obs.fingerprint == self.identity.fingerprint() {
                    return;
                }
                let fingerprint = obs.fingerprint;
                let name = obs.name.clone();
                let source = obs.source;

                if self.endpoints.observe(obs, Instant::now()) == ObserveOutcome::Discovered {
                    debug!(fingerprint = %ShortFp(fingerprint.as_str()), source = %source, "peer discovered");
                    self.emit(Event::PeerDiscovered { fingerprint, name, source });
                }

                self.connect_if_queued(fingerprint).await;
            }
            DiscoveryEvent::Down { fingerprint, source } => {
                if self.endpoints.backend_lost(fingerprint, source) {
                    self.emit(Event::PeerLost { fingerprint });
                }
            }
        }
    }

    // ---------- commands ----------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { to, stream_id, plaintext, reply } => {
                let result = self.cmd_send(to, stream_id, plaintext).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::ListPeers { reply } => {
                let peers = self
                    .endpoints
                    .iter()
                    .map(|endpoint| PeerInfo {
                        fingerprint: endpoint.fingerprint,
                        name: endpoint.name.clone(),
                        addr: endpoint.addr,
                        source: endpoint.source,
                    })
                    .collect();
                let _ = reply.send(peers);
            }
            Command::DeletePeer { fingerprint } => {
                if let Some(key) = self.by_peer.get(&fingerprint).copied() {
                    self.close_session(key, CloseReason::UserRequest, true);
                }
                if self.endpoints.remove(fingerprint) {
                    self.emit(Event::PeerLost { fingerprint });
                }
            }
            Command::AddPeerManual { fingerprint, addr, static_pub } => {
                let obs = PeerObservation {
                    fingerprint,
                    name: None,
                    static_pub: Some(static_pub),
                    addr,
                    source: PeerSource::Manual,
                };
                if self.endpoints.observe(obs, Instant::now()) == ObserveOutcome::Discovered {
                    self.emit(Event::PeerDiscovered {
                        fingerprint,
                        name: None,
                        source: PeerSource::Manual,
                    });
                }
                self.connect_if_queued(fingerprint).await;
            }
            Command::RenameContact { fingerprint, name } => {
                if let Err(e) = self.contacts.rename(fingerprint, &name) {
                    warn!(error = %e, "rename failed");
                }
            }
            Command::ForgetContact { fingerprint } => {
                match self.contacts.forget(fingerprint) {
                    Ok(true) => {
                        self.violations.remove(&fingerprint);
                        info!(fingerprint = %ShortFp(fingerprint.as_str()), "pin forgotten");
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "forget failed"),
                }
            }
            Command::Shutdown => {}
        }
    }

    async fn cmd_send(
        &mut self,
        to: Fingerprint,
        stream_id: u16,
        plaintext: Vec<u8>,
    ) -> Result<SendOutcome> {
        if self.violations.contains(&to) {
            return Err(Error::PinningViolation(to));
        }
        if plaintext.len() + TAG_SIZE > MAX_PAYLOAD_SIZE {
            return Err(Error::MessageTooLarge(plaintext.len()));
        }

        if let Some(key) = self.by_peer.get(&to).copied() {
            let established = self
                .sessions
                .get(&key)
                .map(Session::is_established)
                .unwrap_or(false);
            if established {
                return match self.send_data(key, stream_id, &plaintext).await {
                    Ok(()) => Ok(SendOutcome::Sent),
                    Err(Error::CounterExhausted) => {
                        self.close_session(key, CloseReason::CryptoFailure, true);
                        self.enqueue(to, stream_id, &plaintext)?;
                        Ok(SendOutcome::Queued)
                    }
                    Err(Error::EndpointUnreachable) => {
                        self.endpoints.mark_stale(to);
                        self.enqueue(to, stream_id, &plaintext)?;
                        Ok(SendOutcome::Queued)
                    }
                    Err(e) => Err(e),
                };
            }
            // Handshake still in flight.
            self.enqueue(to, stream_id, &plaintext)?;
            return Ok(SendOutcome::Queued);
        }

        // No session: persist first, then try to bring one up.
        self.enqueue(to, stream_id, &plaintext)?;
        if self.endpoints.resolve(to).is_some() {
            if let Err(e) = self.start_session(to).await {
                debug!(fingerprint = %ShortFp(to.as_str()), error = %e, "handshake not started");
            }
        }
        Ok(SendOutcome::Queued)
    }

    fn enqueue(&mut self, to: Fingerprint, stream_id: u16, plaintext: &[u8]) -> Result<()> {
        match self.queue.enqueue(to, stream_id, plaintext) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.emit(Event::QueuePersistFailed { fingerprint: to });
                Err(e)
            }
        }
    }

    // ---------- session plumbing ----------

    /// A newly reachable peer with queued messages gets a session right
    /// away so the queue can drain.
    async fn connect_if_queued(&mut self, fingerprint: Fingerprint) {
        let pending = self.queue.count(fingerprint).unwrap_or(0);
        if pending > 0
            && !self.by_peer.contains_key(&fingerprint)
            && !self.violations.contains(&fingerprint)
        {
            debug!(
                fingerprint = %ShortFp(fingerprint.as_str()),
                pending,
                "initiating session to drain queue"
            );
            if let Err(e) = self.start_session(fingerprint).await {
                debug!(error = %e, "could not initiate session");
            }
        }
    }

    /// Initiate a handshake toward a resolved endpoint.
    async fn start_session(&mut self, peer: Fingerprint) -> Result<()> {
        let Some(endpoint) = self.endpoints.resolve(peer) else {
            return Err(Error::EndpointUnreachable);
        };
        let remote = endpoint.addr;
        let via_relay = endpoint.source == PeerSource::Relay;

        // The responder's static key comes from discovery or the pin.
        let static_pub: Option<PublicKey> = match endpoint.static_pub {
            Some(key) => Some(key),
            None => self.contacts.lookup(peer)?.map(|contact| contact.static_pub),
        };
        let Some(responder_static) = static_pub else {
            return Err(Error::Identity(format!("no static key known for {peer}")));
        };

        let connection_id = loop {
            let candidate: u32 = rand::random();
            if !self
                .sessions
                .contains_key(&SessionKey { connection_id: candidate, remote })
            {
                break candidate;
            }
        };

        let mut handshake = noise::initiate(self.identity.static_keys().clone(), responder_static);
        let intro = HandshakeIntro {
            fingerprint: self.identity.fingerprint(),
            display_name: self.identity.display_name().to_string(),
        };
        let first_message = handshake.write_message(&intro.to_bytes()?)?;
        let init_packet = Packet::new(PacketType::HandshakeInit, connection_id, 0, first_message)?;
        let init_frame = init_packet.encode();

        if let Err(e) = self.transmit(remote, via_relay, peer, &init_frame).await {
            self.endpoints.mark_stale(peer);
            return Err(e);
        }

        let key = SessionKey { connection_id, remote };
        let session =
            Session::new_initiator(connection_id, remote, via_relay, peer, handshake, init_frame);
        self.sessions.insert(key, session);
        self.by_peer.insert(peer, key);

        info!(
            fingerprint = %ShortFp(peer.as_str()),
            connection_id,
            via_relay,
            "handshake initiated"
        );
        Ok(())
    }

    /// Encrypt and transmit one DATA packet on an established session.
    async fn send_data(&mut self, key: SessionKey, stream_id: u16, plaintext: &[u8]) -> Result<()> {
        let (bytes, remote, via_relay, peer) = {
            let session = self
                .sessions
                .get(&key)
                .ok_or(Error::UnknownConnectionId(key.connection_id))?;
            let aad = data_aad(session.connection_id, stream_id);
            let ciphertext = session.encrypt_at_current(plaintext, &aad)?;
            let packet = Packet::new(PacketType::Data, session.connection_id, stream_id, ciphertext)?;
            (packet.encode(), session.remote, session.via_relay, session.peer)
        };

        self.transmit(remote, via_relay, peer, &bytes).await?;

        if let Some(session) = self.sessions.get_mut(&key) {
            session.commit_send(stream_id);
        }
        Ok(())
    }

    /// Send raw packet bytes, wrapping them for the relay when the peer is
    /// reachable only through it.
    async fn transmit(
        &self,
        remote: SocketAddr,
        via_relay: bool,
        peer: Fingerprint,
        bytes: &[u8],
    ) -> Result<()> {
        if via_relay {
            let relay_addr = self.relay_addr.ok_or(Error::EndpointUnreachable)?;
            let wrapped = RelayMessage::Relay { dest: peer, payload: bytes.to_vec() }.encode();
            self.transport.send_to(relay_addr, &wrapped).await
        } else {
            self.transport.send_to(remote, bytes).await
        }
    }

    /// Drain queued messages for a freshly established peer, FIFO. The first
    /// failure leaves the failing message at the head and aborts.
    async fn drain_queue(&mut self, peer: Fingerprint) {
        loop {
            let message = match self.queue.peek(peer) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "queue unreadable during drain");
                    break;
                }
            };

            let Some(key) = self.by_peer.get(&peer).copied() else {
                break;
            };
            let established = self
                .sessions
                .get(&key)
                .map(Session::is_established)
                .unwrap_or(false);
            if !established {
                break;
            }

            match self.send_data(key, message.stream_id, &message.plaintext).await {
                Ok(()) => {
                    if let Err(e) = self.queue.remove(message.id) {
                        warn!(error = %e, "drained message not removed from queue");
                        break;
                    }
                }
                Err(e) => {
                    debug!(
                        fingerprint = %ShortFp(peer.as_str()),
                        error = %e,
                        "queue drain interrupted"
                    );
                    break;
                }
            }
        }
    }

    fn close_session(&mut self, key: SessionKey, reason: CloseReason, emit_event: bool) {
        if let Some(mut session) = self.sessions.remove(&key) {
            session.close();
            if self.by_peer.get(&session.peer) == Some(&key) {
                self.by_peer.remove(&session.peer);
            }
            info!(
                fingerprint = %ShortFp(session.peer.as_str()),
                connection_id = session.connection_id,
                reason = %reason,
                "session closed"
            );
            if emit_event {
                self.emit(Event::SessionClosed { fingerprint: session.peer, reason });
            }
        }
    }

    // ---------- timers ----------

    async fn tick(&mut self) {
        let now = Instant::now();

        let mut retransmit: Vec<(SocketAddr, bool, Fingerprint, Vec<u8>)> = Vec::new();
        let mut expired: Vec<(SessionKey, CloseReason)> = Vec::new();

        for (key, session) in self.sessions.iter_mut() {
            match session.state {
                SessionState::AwaitingResponse => {
                    if now.duration_since(session.handshake_sent_at) >= HANDSHAKE_TIMEOUT {
                        if !session.handshake_retried {
                            if let Some(frame) = session.init_frame.clone() {
                                session.handshake_retried = true;
                                session.handshake_sent_at = now;
                                retransmit.push((session.remote, session.via_relay, session.peer, frame));
                            }
                        } else {
                            expired.push((*key, CloseReason::HandshakeTimeout));
                        }
                    }
                }
                SessionState::Established => {
                    if now.duration_since(session.last_activity) >= IDLE_TIMEOUT {
                        expired.push((*key, CloseReason::IdleTimeout));
                    }
                }
                SessionState::Closed => {
                    expired.push((*key, CloseReason::UserRequest));
                }
            }
        }

        for (remote, via_relay, peer, frame) in retransmit {
            debug!(fingerprint = %ShortFp(peer.as_str()), "retransmitting handshake");
            if let Err(e) = self.transmit(remote, via_relay, peer, &frame).await {
                debug!(error = %e, "handshake retransmission failed");
            }
        }

        for (key, reason) in expired {
            let emit = reason != CloseReason::UserRequest;
            self.close_session(key, reason, emit);
        }

        for fingerprint in self.endpoints.sweep(now) {
            self.emit(Event::PeerLost { fingerprint });
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StaticKeypair;
    use crate::crypto::TransportCipher;
    use tokio::net::UdpSocket;

    struct Peer {
        identity: Identity,
        socket: UdpSocket,
    }

    impl Peer {
        async fn new(tag: &str) -> Self {
            let identity = Identity::new(
                Fingerprint::derive(tag.as_bytes()),
                tag.to_string(),
                StaticKeypair::generate(),
            );
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            Self { identity, socket }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        async fn recv_packet(&self) -> Packet {
            let mut buf = [0u8; 65536];
            let (len, _) = self.socket.recv_from(&mut buf).await.unwrap();
            Packet::decode(&buf[..len]).unwrap()
        }

        /// Run the initiator side of a handshake against a manager, feeding
        /// the manager through `handle_input` and reading its response off
        /// this peer's socket.
        async fn handshake_with(
            &self,
            manager: &mut SessionManager,
            connection_id: u32,
        ) -> (TransportCipher, TransportCipher) {
            let mut handshake = noise::initiate(
                self.identity.static_keys().clone(),
                manager.identity.static_public(),
            );
            let intro = HandshakeIntro {
                fingerprint: self.identity.fingerprint(),
                display_name: self.identity.display_name().to_string(),
            };
            let first = handshake.write_message(&intro.to_bytes().unwrap()).unwrap();
            let packet = Packet::new(PacketType::HandshakeInit, connection_id, 0, first).unwrap();

            manager
                .handle_input(Input::Packet { packet, from: self.addr(), via_relay: false })
                .await;

            let response = self.recv_packet().await;
            assert_eq!(response.packet_type, PacketType::HandshakeResp);
            handshake.read_message(&response.payload).unwrap();
            let (send, recv, _) = handshake.finalize().unwrap();
            (send, recv)
        }
    }

    async fn test_manager(tag: &str) -> (SessionManager, UdpTransport, broadcast::Receiver<Event>) {
        let identity = Identity::new(
            Fingerprint::derive(tag.as_bytes()),
            tag.to_string(),
            StaticKeypair::generate(),
        );
        let (events, event_rx) = broadcast::channel(64);
        let transport = UdpTransport::bind(0).await.unwrap();

        let manager = SessionManager::new(
            identity,
            transport.clone(),
            None,
            ContactBook::open_in_memory().unwrap(),
            MessageQueue::open_in_memory().unwrap(),
            events,
        );
        (manager, transport, event_rx)
    }

    fn next_event(rx: &mut broadcast::Receiver<Event>) -> Event {
        match rx.try_recv() {
            Ok(event) => event,
            Err(e) => panic!("expected an event, got {e}"),
        }
    }

    #[tokio::test]
    async fn inbound_handshake_then_data() {
        let (mut manager, _transport, mut events) = test_manager("bob").await;
        let alice = Peer::new("alice").await;

        let (alice_send, _alice_recv) = alice.handshake_with(&mut manager, 0x1111).await;

        assert!(matches!(next_event(&mut events), Event::PeerDiscovered { .. }));
        assert!(matches!(next_event(&mut events), Event::SessionEstablished { .. }));

        // Counter 0, stream 5.
        let aad = data_aad(0x1111, 5);
        let ciphertext = alice_send.encrypt(0, b"hello", &aad).unwrap();
        let packet = Packet::new(PacketType::Data, 0x1111, 5, ciphertext).unwrap();
        manager
            .handle_input(Input::Packet { packet, from: alice.addr(), via_relay: false })
            .await;

        match next_event(&mut events) {
            Event::MessageReceived { fingerprint, stream_id, plaintext } => {
                assert_eq!(fingerprint, alice.identity.fingerprint());
                assert_eq!(stream_id, 5);
                assert_eq!(plaintext, b"hello");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn skipped_counter_closes_session() {
        let (mut manager, _transport, mut events) = test_manager("bob").await;
        let alice = Peer::new("alice").await;

        let (alice_send, _) = alice.handshake_with(&mut manager, 0x2222).await;
        let _ = next_event(&mut events); // PeerDiscovered
        let _ = next_event(&mut events); // SessionEstablished

        // Counter 0 delivered.
        let aad = data_aad(0x2222, 1);
        let c0 = alice_send.encrypt(0, b"first", &aad).unwrap();
        let packet = Packet::new(PacketType::Data, 0x2222, 1, c0).unwrap();
        manager
            .handle_input(Input::Packet { packet, from: alice.addr(), via_relay: false })
            .await;
        let _ = next_event(&mut events); // MessageReceived

        // Counter 1 lost; counter 2 arrives and must kill the session.
        let c2 = alice_send.encrypt(2, b"third", &aad).unwrap();
        let packet = Packet::new(PacketType::Data, 0x2222, 1, c2).unwrap();
        manager
            .handle_input(Input::Packet { packet, from: alice.addr(), via_relay: false })
            .await;

        match next_event(&mut events) {
            Event::SessionClosed { reason, .. } => assert_eq!(reason, CloseReason::CryptoFailure),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(manager.sessions.is_empty());
    }

    #[tokio::test]
    async fn replayed_counter_is_rejected() {
        let (mut manager, _transport, mut events) = test_manager("bob").await;
        let alice = Peer::new("alice").await;

        let (alice_send, _) = alice.handshake_with(&mut manager, 0x3333).await;
        let _ = next_event(&mut events);
        let _ = next_event(&mut events);

        let aad = data_aad(0x3333, 0);
        let c0 = alice_send.encrypt(0, b"once", &aad).unwrap();
        let packet = Packet::new(PacketType::Data, 0x3333, 0, c0).unwrap();

        manager
            .handle_input(Input::Packet { packet: packet.clone(), from: alice.addr(), via_relay: false })
            .await;
        let _ = next_event(&mut events); // MessageReceived

        // Replay of the same packet: expected counter moved to 1, so the
        // tag no longer verifies and the session closes.
        manager
            .handle_input(Input::Packet { packet, from: alice.addr(), via_relay: false })
            .await;
        assert!(matches!(next_event(&mut events), Event::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn pinning_violation_on_rekeyed_peer() {
        let (mut manager, _transport, mut events) = test_manager("bob").await;

        let alice = Peer::new("alice").await;
        let _ = alice.handshake_with(&mut manager, 0x4444).await;
        let _ = next_event(&mut events);
        let _ = next_event(&mut events);

        // Same fingerprint, fresh static key.
        let rekeyed = Identity::new(
            alice.identity.fingerprint(),
            "alice".to_string(),
            StaticKeypair::generate(),
        );
        let mut handshake =
            noise::initiate(rekeyed.static_keys().clone(), manager.identity.static_public());
        let intro = HandshakeIntro {
            fingerprint: rekeyed.fingerprint(),
            display_name: "alice".into(),
        };
        let first = handshake.write_message(&intro.to_bytes().unwrap()).unwrap();
        let packet = Packet::new(PacketType::HandshakeInit, 0x5555, 0, first).unwrap();
        manager
            .handle_input(Input::Packet { packet, from: alice.addr(), via_relay: false })
            .await;

        match next_event(&mut events) {
            Event::PinningViolation { fingerprint } => {
                assert_eq!(fingerprint, alice.identity.fingerprint());
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Further sends to the violated fingerprint are refused.
        let result = manager
            .cmd_send(alice.identity.fingerprint(), 0, b"refused".to_vec())
            .await;
        assert!(matches!(result, Err(Error::PinningViolation(_))));
    }

    #[tokio::test]
    async fn connection_id_collision_keeps_sessions_apart() {
        let (mut manager, _transport, mut events) = test_manager("bob").await;

        let alice = Peer::new("alice").await;
        let carol = Peer::new("carol").await;

        // Both initiators picked the same connection id.
        let (alice_send, _) = alice.handshake_with(&mut manager, 0x1234_5678).await;
        let (carol_send, _) = carol.handshake_with(&mut manager, 0x1234_5678).await;
        for _ in 0..4 {
            let _ = next_event(&mut events);
        }

        assert_eq!(manager.sessions.len(), 2);

        let aad = data_aad(0x1234_5678, 0);
        let from_alice = alice_send.encrypt(0, b"from alice", &aad).unwrap();
        let from_carol = carol_send.encrypt(0, b"from carol", &aad).unwrap();

        let packet = Packet::new(PacketType::Data, 0x1234_5678, 0, from_alice).unwrap();
        manager
            .handle_input(Input::Packet { packet, from: alice.addr(), via_relay: false })
            .await;
        let packet = Packet::new(PacketType::Data, 0x1234_5678, 0, from_carol).unwrap();
        manager
            .handle_input(Input::Packet { packet, from: carol.addr(), via_relay: false })
            .await;

        let mut received = Vec::new();
        for _ in 0..2 {
            match next_event(&mut events) {
                Event::MessageReceived { fingerprint, plaintext, .. } => {
                    received.push((fingerprint, plaintext));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(received.contains(&(alice.identity.fingerprint(), b"from alice".to_vec())));
        assert!(received.contains(&(carol.identity.fingerprint(), b"from carol".to_vec())));
    }

    #[tokio::test]
    async fn send_without_endpoint_queues() {
        let (mut manager, _transport, _events) = test_manager("bob").await;
        let stranger = Fingerprint::derive(b"stranger");

        let outcome = manager.cmd_send(stranger, 1, b"later".to_vec()).await.unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
        assert_eq!(manager.queue.count(stranger).unwrap(), 1);
    }

    #[tokio::test]
    async fn oversized_send_is_rejected() {
        let (mut manager, _transport, _events) = test_manager("bob").await;
        let peer = Fingerprint::derive(b"peer");

        let result = manager.cmd_send(peer, 0, vec![0u8; MAX_PAYLOAD_SIZE]).await;
        assert!(matches!(result, Err(Error::MessageTooLarge(_))));
    }

    #[tokio::test]
    async fn handshake_times_out_after_one_retry() {
        let (mut manager, _transport, mut events) = test_manager("bob").await;
        let ghost = Peer::new("ghost").await;

        // Manual endpoint for a peer that will never answer.
        manager
            .handle_input(Input::Command(Command::AddPeerManual {
                fingerprint: ghost.identity.fingerprint(),
                addr: ghost.addr(),
                static_pub: ghost.identity.static_public(),
            }))
            .await;
        let _ = next_event(&mut events); // PeerDiscovered

        let outcome = manager
            .cmd_send(ghost.identity.fingerprint(), 0, b"anyone there?".to_vec())
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
        assert_eq!(manager.sessions.len(), 1);

        // First timeout: retransmission.
        for session in manager.sessions.values_mut() {
            session.handshake_sent_at = Instant::now() - HANDSHAKE_TIMEOUT - Duration::from_secs(1);
        }
        manager.handle_input(Input::Tick).await;
        assert_eq!(manager.sessions.len(), 1);
        assert!(manager.sessions.values().all(|s| s.handshake_retried));

        // Second timeout: the session fails; the message stays queued.
        for session in manager.sessions.values_mut() {
            session.handshake_sent_at = Instant::now() - HANDSHAKE_TIMEOUT - Duration::from_secs(1);
        }
        manager.handle_input(Input::Tick).await;
        assert!(manager.sessions.is_empty());
        assert_eq!(manager.queue.count(ghost.identity.fingerprint()).unwrap(), 1);
    }
}
