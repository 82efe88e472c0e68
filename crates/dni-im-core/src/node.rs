//! Node assembly.
//!
//! The composition root: binds the socket, opens storage, starts the
//! receive, discovery and session tasks, and hands the caller a
//! [`NodeHandle`] exposing the command API and the event stream. All
//! dependencies are wired here explicitly.

use std::net::SocketAddr;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::config::Config;
use crate::crypto::keys::PublicKey;
use crate::discovery::lan::LanDiscovery;
use crate::discovery::relay as relay_client;
use crate::error::{Error, Result};
use crate::identity::{Fingerprint, Identity};
use crate::logging::ShortFp;
use crate::messaging::manager::SessionManager;
use crate::messaging::{Command, Event, Input, PeerInfo, SendOutcome};
use crate::storage::{ContactBook, MessageQueue, CONTACTS_DB, QUEUE_DB};
use crate::transport::UdpTransport;

/// Input channel depth; inbound packets, discovery and commands share it.
const INPUT_CHANNEL_DEPTH: usize = 256;

/// Event fan-out depth per subscriber.
const EVENT_CHANNEL_DEPTH: usize = 256;

/// Timer tick cadence for the session task.
const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// A running DNI-IM node.
pub struct Node;

impl Node {
    /// Start all tasks and return the control handle.
    pub async fn start(config: Config, identity: Identity) -> Result<NodeHandle> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| Error::Storage(format!("create data dir: {e}")))?;

        let contacts = ContactBook::open(config.data_dir.join(CONTACTS_DB))?;
        let queue = MessageQueue::open(config.data_dir.join(QUEUE_DB))?;

        let transport = UdpTransport::bind(config.udp_port).await?;
        let local_addr = transport.local_addr()?;
        let relay_addr = config.relay_socket_addr()?;

        let (input_tx, input_rx) = mpsc::channel::<Input>(INPUT_CHANNEL_DEPTH);
        let (events, _) = broadcast::channel::<Event>(EVENT_CHANNEL_DEPTH);

        // Receive task, with relay-response demultiplexing when configured.
        if let Some(relay_addr) = relay_addr {
            let (relay_tx, relay_rx) = mpsc::channel(64);
            transport.spawn_receiver(input_tx.clone(), Some(relay_addr), Some(relay_tx));
            relay_client::spawn(
                transport.clone(),
                relay_addr,
                identity.fingerprint(),
                identity.display_name().to_string(),
                identity.static_public(),
                relay_rx,
                input_tx.clone(),
            );
        } else {
            transport.spawn_receiver(input_tx.clone(), None, None);
        }

        // LAN discovery.
        let lan = if config.use_lan_discovery {
            Some(LanDiscovery::start(
                identity.fingerprint(),
                identity.display_name(),
                identity.static_public(),
                local_addr.port(),
                input_tx.clone(),
            )?)
        } else {
            None
        };

        // Timer ticks for the session task.
        {
            let tick_tx = input_tx.clone();
            tokio::spawn(async move {
                let mut ticker = interval(TICK_INTERVAL);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if tick_tx.send(Input::Tick).await.is_err() {
                        break;
                    }
                }
            });
        }

        let fingerprint = identity.fingerprint();
        let static_public = identity.static_public();

        let manager = SessionManager::new(
            identity,
            transport.clone(),
            relay_addr,
            contacts,
            queue,
            events.clone(),
        );
        tokio::spawn(manager.run(input_rx));

        info!(
            fingerprint = %ShortFp(fingerprint.as_str()),
            addr = %local_addr,
            lan = config.use_lan_discovery,
            relay = relay_addr.map(|a| a.to_string()).unwrap_or_else(|| "off".into()),
            "node started"
        );

        Ok(NodeHandle {
            fingerprint,
            static_public,
            local_addr,
            input_tx,
            events,
            lan,
        })
    }
}

/// Control handle for a running node.
pub struct NodeHandle {
    fingerprint: Fingerprint,
    static_public: PublicKey,
    local_addr: SocketAddr,
    input_tx: mpsc::Sender<Input>,
    events: broadcast::Sender<Event>,
    lan: Option<LanDiscovery>,
}

impl NodeHandle {
    /// This node's fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// This node's static public key.
    pub fn static_public(&self) -> PublicKey {
        self.static_public
    }

    /// The bound UDP address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Send `plaintext` to a peer on a stream.
    pub async fn send(
        &self,
        to: Fingerprint,
        stream_id: u16,
        plaintext: Vec<u8>,
    ) -> Result<SendOutcome> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Send { to, stream_id, plaintext, reply: Some(reply) })
            .await?;
        response.await.map_err(|_| Error::Shutdown)?
    }

    /// Currently known peers.
    pub async fn list_peers(&self) -> Result<Vec<PeerInfo>> {
        let (reply, response) = oneshot::channel();
        self.command(Command::ListPeers { reply }).await?;
        response.await.map_err(|_| Error::Shutdown)
    }

    /// Add a peer endpoint by hand.
    pub async fn add_peer_manual(
        &self,
        fingerprint: Fingerprint,
        addr: SocketAddr,
        static_pub: PublicKey,
    ) -> Result<()> {
        self.command(Command::AddPeerManual { fingerprint, addr, static_pub })
            .await
    }

    /// Remove a peer and close any session with it.
    pub async fn delete_peer(&self, fingerprint: Fingerprint) -> Result<()> {
        self.command(Command::DeletePeer { fingerprint }).await
    }

    /// Rename a contact.
    pub async fn rename_contact(&self, fingerprint: Fingerprint, name: String) -> Result<()> {
        self.command(Command::RenameContact { fingerprint, name }).await
    }

    /// Erase a contact's pin so the next handshake re-pins.
    pub async fn forget_contact(&self, fingerprint: Fingerprint) -> Result<()> {
        self.command(Command::ForgetContact { fingerprint }).await
    }

    /// Stop the node. Discovery backends deregister best-effort.
    pub async fn shutdown(self) {
        let _ = self.input_tx.send(Input::Command(Command::Shutdown)).await;
        if let Some(lan) = self.lan {
            lan.shutdown();
        }
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.input_tx
            .send(Input::Command(command))
            .await
            .map_err(|_| Error::Shutdown)
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("fingerprint", &self.fingerprint)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
