//! Relay client.
//!
//! Registers this node at the rendezvous relay, keeps the registration warm,
//! polls the peer list, and translates LIST responses into relay-source
//! observations. Registration retries back off 1 s → 2 s → 4 s … capped at
//! 60 s while the relay stays silent. On shutdown a best-effort DEREGISTER
//! is sent; no ack is awaited.
//!
//! Relay responses arrive on the node's single UDP socket; the transport
//! demultiplexes them into this task's channel.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{DiscoveryEvent, PeerObservation, PeerSource};
use crate::crypto::keys::PublicKey;
use crate::identity::Fingerprint;
use crate::logging::ShortFp;
use crate::messaging::Input;
use crate::protocol::relay::RelayMessage;
use crate::transport::UdpTransport;

/// Re-registration cadence once registered.
const REGISTER_INTERVAL: Duration = Duration::from_secs(60);

/// Peer list poll cadence.
const LIST_INTERVAL: Duration = Duration::from_secs(60);

/// How long to wait for a REGISTER_ACK before backing off.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Initial and maximum retry backoff.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Missed acks tolerated before the registration is considered lost.
const MAX_MISSED_ACKS: u32 = 3;

/// Spawn the relay client task.
pub fn spawn(
    transport: UdpTransport,
    relay_addr: SocketAddr,
    fingerprint: Fingerprint,
    display_name: String,
    static_pub: PublicKey,
    mut responses: mpsc::Receiver<RelayMessage>,
    session_tx: mpsc::Sender<Input>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = RelayClient {
            transport,
            relay_addr,
            fingerprint,
            display_name,
            static_pub,
            session_tx,
        };
        client.run(&mut responses).await;
    })
}

struct RelayClient {
    transport: UdpTransport,
    relay_addr: SocketAddr,
    fingerprint: Fingerprint,
    display_name: String,
    static_pub: PublicKey,
    session_tx: mpsc::Sender<Input>,
}

impl RelayClient {
    async fn run(&self, responses: &mut mpsc::Receiver<RelayMessage>) {
        info!(relay = %self.relay_addr, "relay backend starting");

        let mut register_tick = interval(REGISTER_INTERVAL);
        let mut list_tick = interval(LIST_INTERVAL);
        register_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        list_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut registered = false;
        let mut missed_acks: u32 = 0;

        loop {
            if !registered {
                if !self.register_with_backoff(responses).await {
                    break; // shutting down
                }
                registered = true;
                missed_acks = 0;
                self.send(RelayMessage::List).await;
                register_tick.reset();
                list_tick.reset();
            }

            tokio::select! {
                _ = register_tick.tick() => {
                    missed_acks += 1;
                    if missed_acks > MAX_MISSED_ACKS {
                        warn!(relay = %self.relay_addr, "relay stopped acknowledging, re-registering");
                        registered = false;
                        continue;
                    }
                    self.send(RelayMessage::Register {
                        fingerprint: self.fingerprint,
                        static_pub: self.static_pub,
                        name: self.display_name.clone(),
                    })
                    .await;
                }
                _ = list_tick.tick() => {
                    self.send(RelayMessage::List).await;
                }
                response = responses.recv() => match response {
                    Some(RelayMessage::RegisterAck { fingerprint }) => {
                        if fingerprint == self.fingerprint {
                            missed_acks = 0;
                        }
                    }
                    Some(RelayMessage::ListResp { peers }) => {
                        if !self.publish_peers(peers).await {
                            break;
                        }
                    }
                    Some(other) => debug!(message = ?other, "unexpected relay message"),
                    None => break,
                },
                _ = self.session_tx.closed() => break,
            }
        }

        // Best-effort departure notice.
        self.send(RelayMessage::Deregister { fingerprint: self.fingerprint }).await;
        info!(relay = %self.relay_addr, "relay backend stopped");
    }

    /// Register, retrying with exponential backoff until acknowledged.
    /// Returns false when shutdown interrupts the attempt.
    async fn register_with_backoff(&self, responses: &mut mpsc::Receiver<RelayMessage>) -> bool {
        let mut backoff = BACKOFF_START;

        loop {
            self.send(RelayMessage::Register {
                fingerprint: self.fingerprint,
                static_pub: self.static_pub,
                name: self.display_name.clone(),
            })
            .await;

            let deadline = Instant::now() + ACK_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match timeout(remaining, responses.recv()).await {
                    Ok(Some(RelayMessage::RegisterAck { fingerprint }))
                        if fingerprint == self.fingerprint =>
                    {
                        info!(
                            relay = %self.relay_addr,
                            fingerprint = %ShortFp(self.fingerprint.as_str()),
                            "registered at relay"
                        );
                        return true;
                    }
                    Ok(Some(RelayMessage::ListResp { peers })) => {
                        if !self.publish_peers(peers).await {
                            return false;
                        }
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => return false,
                    Err(_) => break, // ack timeout
                }
            }

            debug!(relay = %self.relay_addr, backoff = ?backoff, "relay registration unacknowledged");

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.session_tx.closed() => return false,
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    async fn publish_peers(&self, peers: Vec<crate::protocol::relay::RelayPeer>) -> bool {
        for peer in peers {
            if peer.fingerprint == self.fingerprint {
                continue;
            }
            let obs = PeerObservation {
                fingerprint: peer.fingerprint,
                name: Some(peer.name),
                static_pub: Some(peer.static_pub),
                addr: self.relay_addr,
                source: PeerSource::Relay,
            };
            if self
                .session_tx
                .send(Input::Discovery(DiscoveryEvent::Up(obs)))
                .await
                .is_err()
            {
                return false;
            }
        }
        true
    }

    async fn send(&self, message: RelayMessage) {
        if let Err(e) = self.transport.send_to(self.relay_addr, &message.encode()).await {
            debug!(relay = %self.relay_addr, error = %e, "relay send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay::RelayPeer;
    use tokio::net::UdpSocket;

    /// Drive the client against a scripted relay on loopback.
    #[tokio::test]
    async fn registers_and_publishes_list() {
        let relay_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay_socket.local_addr().unwrap();

        let transport = UdpTransport::bind(0).await.unwrap();
        let (session_tx, mut session_rx) = mpsc::channel(16);
        let (response_tx, response_rx) = mpsc::channel(16);

        let me = Fingerprint::derive(b"me");
        let other = Fingerprint::derive(b"other");

        spawn(
            transport,
            relay_addr,
            me,
            "Me".into(),
            PublicKey::from_bytes([1; 32]),
            response_rx,
            session_tx,
        );

        // The relay sees a REGISTER and answers through the response channel
        // (in production the transport demultiplexes this path).
        let mut buf = [0u8; 2048];
        let (len, _) = relay_socket.recv_from(&mut buf).await.unwrap();
        match RelayMessage::decode(&buf[..len]).unwrap() {
            RelayMessage::Register { fingerprint, .. } => assert_eq!(fingerprint, me),
            other => panic!("expected REGISTER, got {other:?}"),
        }
        response_tx
            .send(RelayMessage::RegisterAck { fingerprint: me })
            .await
            .unwrap();

        // After the ack the client asks for the peer list.
        let (len, _) = relay_socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(RelayMessage::decode(&buf[..len]).unwrap(), RelayMessage::List);

        response_tx
            .send(RelayMessage::ListResp {
                peers: vec![
                    RelayPeer {
                        fingerprint: me,
                        static_pub: PublicKey::from_bytes([1; 32]),
                        name: "Me".into(),
                    },
                    RelayPeer {
                        fingerprint: other,
                        static_pub: PublicKey::from_bytes([2; 32]),
                        name: "Other".into(),
                    },
                ],
            })
            .await
            .unwrap();

        // Only the other peer is published, addressed at the relay.
        match session_rx.recv().await {
            Some(Input::Discovery(DiscoveryEvent::Up(obs))) => {
                assert_eq!(obs.fingerprint, other);
                assert_eq!(obs.addr, relay_addr);
                assert_eq!(obs.source, PeerSource::Relay);
            }
            other => panic!("unexpected input {other:?}"),
        }
    }
}
