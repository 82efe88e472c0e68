//! DNI-IM rendezvous relay.
//!
//! A dumb, untrusted UDP forwarder: clients register their fingerprint, the
//! relay forwards opaque payloads between them and answers peer-list
//! queries. It sees source addresses, fingerprints and traffic shape;
//! payloads stay Noise-encrypted end to end and are never inspected.
//!
//! Registration is unauthenticated by design (an acknowledged limitation of
//! the deployment): anyone can claim any fingerprint toward the relay, but
//! cannot complete a handshake without the matching static key.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::time::interval;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use dni_im_core::identity::Fingerprint;
use dni_im_core::protocol::relay::RelayMessage;
use dni_im_core::protocol::RelayPeer;

/// DNI-IM relay - fingerprint-keyed UDP forwarding
#[derive(Parser)]
#[command(name = "dni-im-relay")]
#[command(author, version, about)]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:7777")]
    listen: String,

    /// Seconds after which silent clients are evicted
    #[arg(long, default_value = "120")]
    eviction_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// One registered client.
struct Registration {
    addr: SocketAddr,
    peer: RelayPeer,
    last_seen: Instant,
}

#[derive(Default)]
struct Stats {
    packets_forwarded: u64,
    bytes_forwarded: u64,
    drops_unknown_dest: u64,
}

struct Relay {
    socket: UdpSocket,
    clients: HashMap<Fingerprint, Registration>,
    eviction: Duration,
    stats: Stats,
}

impl Relay {
    async fn handle(&mut self, datagram: &[u8], from: SocketAddr) {
        let message = match RelayMessage::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                debug!(from = %from, error = %e, "dropping datagram");
                return;
            }
        };

        match message {
            RelayMessage::Register { fingerprint, static_pub, name } => {
                let fresh = !self.clients.contains_key(&fingerprint);
                self.clients.insert(
                    fingerprint,
                    Registration {
                        addr: from,
                        peer: RelayPeer { fingerprint, static_pub, name },
                        last_seen: Instant::now(),
                    },
                );
                if fresh {
                    info!(fingerprint = %fingerprint, from = %from, "client registered");
                }
                self.send(RelayMessage::RegisterAck { fingerprint }, from).await;
            }
            RelayMessage::Relay { dest, payload } => {
                let Some(dest_addr) = self.clients.get(&dest).map(|r| r.addr) else {
                    self.stats.drops_unknown_dest += 1;
                    debug!(dest = %dest, "destination not registered");
                    return;
                };
                if let Err(e) = self.socket.send_to(&payload, dest_addr).await {
                    warn!(dest = %dest, error = %e, "forward failed");
                    return;
                }
                self.stats.packets_forwarded += 1;
                self.stats.bytes_forwarded += payload.len() as u64;
            }
            RelayMessage::List => {
                let peers = self
                    .clients
                    .values()
                    .map(|registration| registration.peer.clone())
                    .collect();
                self.send(RelayMessage::ListResp { peers }, from).await;
            }
            RelayMessage::Deregister { fingerprint } => {
                // Only the registered address may deregister its entry.
                if self.clients.get(&fingerprint).map(|r| r.addr) == Some(from) {
                    self.clients.remove(&fingerprint);
                    info!(fingerprint = %fingerprint, "client deregistered");
                }
            }
            RelayMessage::RegisterAck { .. } | RelayMessage::ListResp { .. } => {
                debug!(from = %from, "ignoring response-type message");
            }
        }
    }

    async fn send(&self, message: RelayMessage, to: SocketAddr) {
        if let Err(e) = self.socket.send_to(&message.encode(), to).await {
            debug!(to = %to, error = %e, "send failed");
        }
    }

    fn evict_stale(&mut self) {
        let now = Instant::now();
        let eviction = self.eviction;
        let before = self.clients.len();
        self.clients
            .retain(|_, registration| now.duration_since(registration.last_seen) <= eviction);
        let evicted = before - self.clients.len();
        if evicted > 0 {
            info!(evicted, remaining = self.clients.len(), "evicted silent clients");
        }
    }

    fn log_stats(&self) {
        info!(
            clients = self.clients.len(),
            packets_forwarded = self.stats.packets_forwarded,
            mib_forwarded = self.stats.bytes_forwarded / (1024 * 1024),
            drops_unknown_dest = self.stats.drops_unknown_dest,
            "relay statistics"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let socket = UdpSocket::bind(&args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    info!(listen = %args.listen, "relay listening");

    let mut relay = Relay {
        socket,
        clients: HashMap::new(),
        eviction: Duration::from_secs(args.eviction_secs),
        stats: Stats::default(),
    };

    let mut evict_tick = interval(Duration::from_secs(30));
    let mut stats_tick = interval(Duration::from_secs(60));
    let mut buf = vec![0u8; 65_536];

    loop {
        tokio::select! {
            received = relay.socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    let datagram = buf[..len].to_vec();
                    relay.handle(&datagram, from).await;
                }
                Err(e) => warn!(error = %e, "receive failed"),
            },
            _ = evict_tick.tick() => relay.evict_stale(),
            _ = stats_tick.tick() => relay.log_stats(),
        }
    }
}
