//! LAN discovery over mDNS service discovery.
//!
//! Advertises `_dni-im._udp.local.` with the peer's fingerprint, static key
//! and display name in TXT records, and browses for other instances. The
//! advertisement is re-announced every 30 seconds; peers that stop
//! refreshing are pruned by the endpoint table.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{DiscoveryEvent, PeerObservation, PeerSource};
use crate::crypto::keys::PublicKey;
use crate::error::{Error, Result};
use crate::identity::{Fingerprint, FINGERPRINT_LEN};
use crate::messaging::Input;

/// mDNS service type for DNI-IM peers.
pub const SERVICE_TYPE: &str = "_dni-im._udp.local.";

/// Instance name prefix; the fingerprint follows.
const INSTANCE_PREFIX: &str = "dni-im-";

/// Advertisement refresh cadence.
const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Running LAN discovery backend.
pub struct LanDiscovery {
    daemon: ServiceDaemon,
    fullname: String,
}

impl LanDiscovery {
    /// Start advertising and browsing.
    ///
    /// Observations for other peers are fed into `session_tx`; the backend
    /// tasks stop when that channel closes.
    pub fn start(
        fingerprint: Fingerprint,
        display_name: &str,
        static_pub: PublicKey,
        udp_port: u16,
        session_tx: mpsc::Sender<Input>,
    ) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::Socket(format!("mdns daemon: {e}")))?;

        let instance = format!("{INSTANCE_PREFIX}{fingerprint}");
        let static_pub_b64 = BASE64.encode(static_pub.as_bytes());
        let port_str = udp_port.to_string();
        let properties = [
            ("fingerprint", fingerprint.as_str()),
            ("static_pub", static_pub_b64.as_str()),
            ("name", display_name),
            ("port", port_str.as_str()),
        ];

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &format!("{instance}.local."),
            "",
            udp_port,
            &properties[..],
        )
        .map_err(|e| Error::Socket(format!("mdns service info: {e}")))?
        .enable_addr_auto();

        let fullname = service.get_fullname().to_string();

        daemon
            .register(service.clone())
            .map_err(|e| Error::Socket(format!("mdns register: {e}")))?;
        info!(service = %fullname, port = udp_port, "advertising on the local network");

        // Periodic re-announcement.
        {
            let daemon = daemon.clone();
            let refresh_tx = session_tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = daemon.register(service.clone()) {
                                warn!(error = %e, "mdns re-announce failed");
                            }
                        }
                        _ = refresh_tx.closed() => break,
                    }
                }
            });
        }

        // Browse loop.
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| Error::Socket(format!("mdns browse: {e}")))?;
        let own_fingerprint = fingerprint;

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = receiver.recv_async() => match event {
                        Ok(event) => event,
                        Err(_) => break,
                    },
                    _ = session_tx.closed() => break,
                };

                match event {
                    ServiceEvent::ServiceResolved(service) => {
                        let Some(obs) = observation_from_service(&service) else {
                            debug!(fullname = %service.get_fullname(), "unusable mdns record");
                            continue;
                        };
                        if obs.fingerprint == own_fingerprint {
                            continue;
                        }
                        if session_tx
                            .send(Input::Discovery(DiscoveryEvent::Up(obs)))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        let Some(gone) = fingerprint_from_fullname(&fullname) else {
                            continue;
                        };
                        if gone == own_fingerprint {
                            continue;
                        }
                        let event = DiscoveryEvent::Down { fingerprint: gone, source: PeerSource::Lan };
                        if session_tx.send(Input::Discovery(event)).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            debug!("mdns browse task stopped");
        });

        Ok(Self { daemon, fullname })
    }

    /// Withdraw the advertisement and stop the daemon. Best effort.
    pub fn shutdown(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            debug!(error = %e, "mdns unregister failed");
        }
        let _ = self.daemon.shutdown();
    }
}

/// Translate a resolved mDNS record into a peer observation.
fn observation_from_service(service: &ServiceInfo) -> Option<PeerObservation> {
    let fingerprint: Fingerprint = service
        .get_property_val_str("fingerprint")?
        .parse()
        .ok()?;

    let static_pub = service
        .get_property_val_str("static_pub")
        .and_then(|b64| BASE64.decode(b64).ok())
        .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
        .map(PublicKey::from_bytes);

    let name = service
        .get_property_val_str("name")
        .map(|name| name.to_string());

    let port = service
        .get_property_val_str("port")
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or_else(|| service.get_port());

    let ip: IpAddr = *service.get_addresses().iter().next()?;

    Some(PeerObservation {
        fingerprint,
        name,
        static_pub,
        addr: SocketAddr::new(ip, port),
        source: PeerSource::Lan,
    })
}

/// Recover the fingerprint from an instance fullname like
/// `dni-im-3a91bc04d2e7f015._dni-im._udp.local.`.
fn fingerprint_from_fullname(fullname: &str) -> Option<Fingerprint> {
    let rest = fullname.strip_prefix(INSTANCE_PREFIX)?;
    if rest.len() < FINGERPRINT_LEN {
        return None;
    }
    rest[..FINGERPRINT_LEN].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fullname_parsing() {
        let fp = Fingerprint::derive(b"peer");
        let fullname = format!("{INSTANCE_PREFIX}{fp}.{SERVICE_TYPE}");
        assert_eq!(fingerprint_from_fullname(&fullname), Some(fp));

        assert_eq!(fingerprint_from_fullname("someone-else._x._udp.local."), None);
        assert_eq!(fingerprint_from_fullname("dni-im-short._dni-im._udp.local."), None);
    }

    #[test]
    fn observation_from_record() {
        let fp = Fingerprint::derive(b"peer");
        let key = PublicKey::from_bytes([5; 32]);
        let key_b64 = BASE64.encode(key.as_bytes());
        let properties = [
            ("fingerprint", fp.as_str()),
            ("static_pub", key_b64.as_str()),
            ("name", "Bea"),
            ("port", "6666"),
        ];

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &format!("{INSTANCE_PREFIX}{fp}"),
            "host.local.",
            "192.168.1.20",
            6666,
            &properties[..],
        )
        .unwrap();

        let obs = observation_from_service(&service).unwrap();
        assert_eq!(obs.fingerprint, fp);
        assert_eq!(obs.name.as_deref(), Some("Bea"));
        assert_eq!(obs.static_pub, Some(key));
        assert_eq!(obs.addr.port(), 6666);
        assert_eq!(obs.source, PeerSource::Lan);
    }

    #[test]
    fn record_without_fingerprint_is_ignored() {
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            "anonymous",
            "host.local.",
            "192.168.1.20",
            6666,
            &[("name", "nobody")][..],
        )
        .unwrap();

        assert!(observation_from_service(&service).is_none());
    }
}
