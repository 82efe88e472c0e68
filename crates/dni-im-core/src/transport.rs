//! UDP transport.
//!
//! One socket per node. The receive task decodes datagrams and feeds the
//! session task's input channel; it never touches session state. Datagrams
//! arriving from the relay's address are demultiplexed by their first byte:
//! relay-protocol responses go to the relay client, anything else is a
//! forwarded peer packet.
//!
//! Sends may come from any task; a single datagram send is atomic at the OS
//! level.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::logging::ByteLen;
use crate::messaging::Input;
use crate::protocol::{packet::Packet, relay};
use crate::protocol::relay::RelayMessage;
use crate::MAX_CIPHERTEXT_SIZE;

/// Receive buffer size; comfortably above the largest legal datagram.
const RECV_BUFFER_SIZE: usize = 65_536;

/// Largest datagram the transport will emit.
const MAX_DATAGRAM_SIZE: usize = MAX_CIPHERTEXT_SIZE + 1024;

/// Handle to the node's UDP socket.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the node socket on all interfaces.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::Socket(format!("bind udp port {port}: {e}")))?;
        Ok(Self { socket: Arc::new(socket) })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one datagram. Oversized sends are rejected, not fragmented.
    pub async fn send_to(&self, addr: SocketAddr, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::MessageTooLarge(bytes.len()));
        }
        self.socket
            .send_to(bytes, addr)
            .await
            .map_err(|_| Error::EndpointUnreachable)?;
        Ok(())
    }

    /// Spawn the receive task.
    ///
    /// Decoded peer packets go to `session_tx`; datagrams from `relay_addr`
    /// whose first byte marks a relay response go to `relay_tx`. The task
    /// ends when the session channel closes.
    pub fn spawn_receiver(
        &self,
        session_tx: mpsc::Sender<Input>,
        relay_addr: Option<SocketAddr>,
        relay_tx: Option<mpsc::Sender<RelayMessage>>,
    ) -> tokio::task::JoinHandle<()> {
        let socket = Arc::clone(&self.socket);

        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];

            loop {
                let (len, from) = tokio::select! {
                    received = socket.recv_from(&mut buf) => match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "socket receive failed");
                            continue;
                        }
                    },
                    _ = session_tx.closed() => break,
                };

                let datagram = &buf[..len];
                let via_relay = relay_addr == Some(from);

                if via_relay {
                    if let Some(first) = datagram.first() {
                        if relay::is_relay_response(*first) {
                            match RelayMessage::decode(datagram) {
                                Ok(message) => {
                                    if let Some(tx) = &relay_tx {
                                        let _ = tx.send(message).await;
                                    }
                                }
                                Err(e) => {
                                    debug!(payload = %ByteLen(datagram), error = %e, "dropping relay response");
                                }
                            }
                            continue;
                        }
                    }
                }

                match Packet::decode(datagram) {
                    Ok(packet) => {
                        if session_tx
                            .send(Input::Packet { packet, from, via_relay })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(from = %from, payload = %ByteLen(datagram), error = %e, "dropping datagram");
                    }
                }
            }

            debug!("receive task stopped");
        })
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_addr", &self.socket.local_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;

    #[tokio::test]
    async fn receiver_decodes_and_forwards() {
        let transport = UdpTransport::bind(0).await.unwrap();
        let addr = transport.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        transport.spawn_receiver(tx, None, None);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = Packet::new(PacketType::Data, 7, 1, vec![0xab; 3]).unwrap();
        sender
            .send_to(&packet.encode(), ("127.0.0.1", addr.port()))
            .await
            .unwrap();

        match rx.recv().await {
            Some(Input::Packet { packet: got, via_relay, .. }) => {
                assert_eq!(got, packet);
                assert!(!via_relay);
            }
            other => panic!("unexpected input {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_datagrams_are_dropped() {
        let transport = UdpTransport::bind(0).await.unwrap();
        let addr = transport.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        transport.spawn_receiver(tx, None, None);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&[0xff, 1, 2], ("127.0.0.1", addr.port())).await.unwrap();

        // A valid packet after the garbage still arrives.
        let packet = Packet::new(PacketType::Ack, 1, 0, vec![]).unwrap();
        sender
            .send_to(&packet.encode(), ("127.0.0.1", addr.port()))
            .await
            .unwrap();

        match rx.recv().await {
            Some(Input::Packet { packet: got, .. }) => assert_eq!(got, packet),
            other => panic!("unexpected input {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_send_is_rejected() {
        let transport = UdpTransport::bind(0).await.unwrap();
        let addr = transport.local_addr().unwrap();

        let result = transport.send_to(addr, &vec![0u8; MAX_DATAGRAM_SIZE + 1]).await;
        assert!(matches!(result, Err(Error::MessageTooLarge(_))));
    }
}
