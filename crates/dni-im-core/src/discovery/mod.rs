//! Peer discovery.
//!
//! Two backends run concurrently — mDNS on the local network ([`lan`]) and
//! an untrusted rendezvous relay ([`relay`]) — and feed one observation
//! stream. The [`EndpointTable`], owned by the session task, merges them:
//!
//! - a LAN sighting supersedes a relay entry and suppresses relay
//!   observations for the next 30 seconds (lower latency wins);
//! - a manual entry suppresses both and never expires;
//! - entries expire per source when their backend stops refreshing them.

pub mod lan;
pub mod relay;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::crypto::keys::PublicKey;
use crate::identity::Fingerprint;

/// How an endpoint was learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    /// mDNS on the local network, or a direct datagram.
    Lan,
    /// Learned from the rendezvous relay; traffic is relay-forwarded.
    Relay,
    /// Entered by the user.
    Manual,
}

impl std::fmt::Display for PeerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerSource::Lan => f.write_str("lan"),
            PeerSource::Relay => f.write_str("relay"),
            PeerSource::Manual => f.write_str("manual"),
        }
    }
}

/// A single sighting of a peer by one backend.
#[derive(Debug, Clone)]
pub struct PeerObservation {
    /// The observed peer.
    pub fingerprint: Fingerprint,
    /// Display name, when the backend carries one.
    pub name: Option<String>,
    /// Advertised static key, when the backend carries one.
    pub static_pub: Option<PublicKey>,
    /// Where to send packets for this peer.
    pub addr: SocketAddr,
    /// Which backend saw it.
    pub source: PeerSource,
}

/// Observation stream events from the discovery backends.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A peer was seen (or refreshed).
    Up(PeerObservation),
    /// A backend reports the peer gone.
    Down {
        /// The departed peer.
        fingerprint: Fingerprint,
        /// The backend reporting the departure.
        source: PeerSource,
    },
}

/// The merged, current endpoint for a peer.
#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    /// The peer this endpoint reaches.
    pub fingerprint: Fingerprint,
    /// Transport address (the relay's address for relay-sourced peers).
    pub addr: SocketAddr,
    /// Winning source.
    pub source: PeerSource,
    /// Last display name seen for the peer.
    pub name: Option<String>,
    /// Last static key advertised for the peer.
    pub static_pub: Option<PublicKey>,
    /// When this endpoint was last refreshed.
    pub last_seen: Instant,
}

/// LAN entries expire after this long without a refresh.
const LAN_TTL: Duration = Duration::from_secs(90);

/// Relay entries expire after this long without reappearing in a LIST.
const RELAY_TTL: Duration = Duration::from_secs(150);

/// A LAN sighting suppresses relay observations for this long.
const LAN_OVER_RELAY_HOLD: Duration = Duration::from_secs(30);

/// Result of feeding an observation into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// First sighting of this fingerprint; a `PeerDiscovered` event is due.
    Discovered,
    /// Known peer refreshed or superseded; no event.
    Refreshed,
    /// Observation suppressed by the merge policy.
    Suppressed,
}

/// Merged endpoint table. Not shared: owned by the session task.
#[derive(Debug, Default)]
pub struct EndpointTable {
    entries: HashMap<Fingerprint, PeerEndpoint>,
    lan_hold: HashMap<Fingerprint, Instant>,
}

impl EndpointTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one observation through the merge policy.
    pub fn observe(&mut self, obs: PeerObservation, now: Instant) -> ObserveOutcome {
        if obs.source == PeerSource::Lan {
            self.lan_hold.insert(obs.fingerprint, now);
        }

        let existing = self.entries.get(&obs.fingerprint);
        let accept = match (existing.map(|e| e.source), obs.source) {
            // Manual entries yield only to the user.
            (Some(PeerSource::Manual), PeerSource::Manual) => true,
            (Some(PeerSource::Manual), _) => false,
            // A recent LAN sighting keeps relay observations out.
            (Some(PeerSource::Lan), PeerSource::Relay) => self
                .lan_hold
                .get(&obs.fingerprint)
                .map(|seen| now.duration_since(*seen) > LAN_OVER_RELAY_HOLD)
                .unwrap_or(true),
            _ => true,
        };

        if !accept {
            // Keep the newer metadata even when the address loses.
            if let Some(entry) = self.entries.get_mut(&obs.fingerprint) {
                if entry.static_pub.is_none() {
                    entry.static_pub = obs.static_pub;
                }
                if entry.name.is_none() {
                    entry.name = obs.name;
                }
            }
            return ObserveOutcome::Suppressed;
        }

        let was_known = existing.is_some();
        let previous = self.entries.insert(
            obs.fingerprint,
            PeerEndpoint {
                fingerprint: obs.fingerprint,
                addr: obs.addr,
                source: obs.source,
                name: obs.name,
                static_pub: obs.static_pub,
                last_seen: now,
            },
        );

        // Carry metadata forward when the new observation lacks it.
        if let (Some(old), Some(entry)) = (previous, self.entries.get_mut(&obs.fingerprint)) {
            if entry.static_pub.is_none() {
                entry.static_pub = old.static_pub;
            }
            if entry.name.is_none() {
                entry.name = old.name;
            }
        }

        if was_known {
            ObserveOutcome::Refreshed
        } else {
            ObserveOutcome::Discovered
        }
    }

    /// A backend reports a peer gone. Removes the entry only if that backend
    /// currently owns it; returns whether the peer was dropped entirely.
    pub fn backend_lost(&mut self, fingerprint: Fingerprint, source: PeerSource) -> bool {
        match self.entries.get(&fingerprint) {
            Some(entry) if entry.source == source => {
                self.entries.remove(&fingerprint);
                true
            }
            _ => false,
        }
    }

    /// Current endpoint for a peer.
    pub fn resolve(&self, fingerprint: Fingerprint) -> Option<&PeerEndpoint> {
        self.entries.get(&fingerprint)
    }

    /// Drop an endpoint after a failed send so the next attempt re-resolves
    /// discovery.
    pub fn mark_stale(&mut self, fingerprint: Fingerprint) {
        self.entries.remove(&fingerprint);
    }

    /// Remove a peer entirely (user request).
    pub fn remove(&mut self, fingerprint: Fingerprint) -> bool {
        self.lan_hold.remove(&fingerprint);
        self.entries.remove(&fingerprint).is_some()
    }

    /// Expire stale entries; returns the fingerprints that vanished.
    pub fn sweep(&mut self, now: Instant) -> Vec<Fingerprint> {
        let mut lost = Vec::new();
        self.entries.retain(|fingerprint, entry| {
            let ttl = match entry.source {
                PeerSource::Lan => LAN_TTL,
                PeerSource::Relay => RELAY_TTL,
                PeerSource::Manual => return true,
            };
            if now.duration_since(entry.last_seen) > ttl {
                lost.push(*fingerprint);
                false
            } else {
                true
            }
        });
        self.lan_hold
            .retain(|_, seen| now.duration_since(*seen) <= LAN_OVER_RELAY_HOLD * 2);
        lost
    }

    /// All currently known endpoints.
    pub fn iter(&self) -> impl Iterator<Item = &PeerEndpoint> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(tag: &str) -> Fingerprint {
        Fingerprint::derive(tag.as_bytes())
    }

    fn obs(tag: &str, port: u16, source: PeerSource) -> PeerObservation {
        PeerObservation {
            fingerprint: fp(tag),
            name: Some(format!("peer-{tag}")),
            static_pub: Some(PublicKey::from_bytes([9; 32])),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            source,
        }
    }

    #[test]
    fn first_sighting_discovers_repeat_refreshes() {
        let mut table = EndpointTable::new();
        let now = Instant::now();

        assert_eq!(table.observe(obs("a", 1000, PeerSource::Lan), now), ObserveOutcome::Discovered);
        assert_eq!(table.observe(obs("a", 1000, PeerSource::Lan), now), ObserveOutcome::Refreshed);
        assert_eq!(table.observe(obs("a", 1000, PeerSource::Lan), now), ObserveOutcome::Refreshed);
    }

    #[test]
    fn lan_supersedes_relay() {
        let mut table = EndpointTable::new();
        let now = Instant::now();

        table.observe(obs("a", 2000, PeerSource::Relay), now);
        table.observe(obs("a", 1000, PeerSource::Lan), now);

        let endpoint = table.resolve(fp("a")).unwrap();
        assert_eq!(endpoint.source, PeerSource::Lan);
        assert_eq!(endpoint.addr.port(), 1000);
    }

    #[test]
    fn recent_lan_sighting_suppresses_relay() {
        let mut table = EndpointTable::new();
        let now = Instant::now();

        table.observe(obs("a", 1000, PeerSource::Lan), now);
        let outcome = table.observe(obs("a", 2000, PeerSource::Relay), now + Duration::from_secs(5));
        assert_eq!(outcome, ObserveOutcome::Suppressed);
        assert_eq!(table.resolve(fp("a")).unwrap().source, PeerSource::Lan);

        // After the hold expires the relay observation wins again.
        let later = now + Duration::from_secs(31);
        let outcome = table.observe(obs("a", 2000, PeerSource::Relay), later);
        assert_eq!(outcome, ObserveOutcome::Refreshed);
        assert_eq!(table.resolve(fp("a")).unwrap().source, PeerSource::Relay);
    }

    #[test]
    fn manual_suppresses_everything() {
        let mut table = EndpointTable::new();
        let now = Instant::now();

        table.observe(obs("a", 3000, PeerSource::Manual), now);
        assert_eq!(table.observe(obs("a", 1000, PeerSource::Lan), now), ObserveOutcome::Suppressed);
        assert_eq!(table.observe(obs("a", 2000, PeerSource::Relay), now), ObserveOutcome::Suppressed);
        assert_eq!(table.resolve(fp("a")).unwrap().addr.port(), 3000);
    }

    #[test]
    fn sweep_expires_by_source() {
        let mut table = EndpointTable::new();
        let now = Instant::now();

        table.observe(obs("lan", 1000, PeerSource::Lan), now);
        table.observe(obs("relay", 2000, PeerSource::Relay), now);
        table.observe(obs("manual", 3000, PeerSource::Manual), now);

        let lost = table.sweep(now + Duration::from_secs(91));
        assert_eq!(lost, vec![fp("lan")]);

        let lost = table.sweep(now + Duration::from_secs(151));
        assert_eq!(lost, vec![fp("relay")]);

        assert!(table.resolve(fp("manual")).is_some());
    }

    #[test]
    fn backend_lost_only_drops_owner() {
        let mut table = EndpointTable::new();
        let now = Instant::now();

        table.observe(obs("a", 1000, PeerSource::Lan), now);
        assert!(!table.backend_lost(fp("a"), PeerSource::Relay));
        assert!(table.resolve(fp("a")).is_some());

        assert!(table.backend_lost(fp("a"), PeerSource::Lan));
        assert!(table.resolve(fp("a")).is_none());
    }

    #[test]
    fn metadata_survives_source_switch() {
        let mut table = EndpointTable::new();
        let now = Instant::now();

        let mut with_key = obs("a", 2000, PeerSource::Relay);
        with_key.static_pub = Some(PublicKey::from_bytes([7; 32]));
        table.observe(with_key, now);

        let mut without_key = obs("a", 1000, PeerSource::Lan);
        without_key.static_pub = None;
        without_key.name = None;
        table.observe(without_key, now);

        let endpoint = table.resolve(fp("a")).unwrap();
        assert_eq!(endpoint.static_pub, Some(PublicKey::from_bytes([7; 32])));
        assert!(endpoint.name.is_some());
    }

    #[test]
    fn mark_stale_forces_rediscovery() {
        let mut table = EndpointTable::new();
        let now = Instant::now();

        table.observe(obs("a", 1000, PeerSource::Lan), now);
        table.mark_stale(fp("a"));
        assert!(table.resolve(fp("a")).is_none());

        assert_eq!(table.observe(obs("a", 1000, PeerSource::Lan), now), ObserveOutcome::Discovered);
    }
}
