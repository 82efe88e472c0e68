//! Runtime configuration.
//!
//! Defaults cover the common LAN case; the relay backend activates only when
//! a relay address is configured. Environment variables (`DNI_IM_*`) override
//! defaults, command-line flags override both.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Default UDP port peers bind and advertise.
pub const DEFAULT_UDP_PORT: u16 = 6666;

/// Default UDP port of the rendezvous relay.
pub const DEFAULT_RELAY_PORT: u16 = 7777;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local UDP bind port. Port 0 binds an ephemeral port.
    pub udp_port: u16,
    /// Relay host or address. The relay backend is enabled when set.
    pub relay_address: Option<String>,
    /// Relay UDP port.
    pub relay_port: u16,
    /// Whether the mDNS LAN backend runs.
    pub use_lan_discovery: bool,
    /// Directory holding identity material, contacts and the queue.
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_UDP_PORT,
            relay_address: None,
            relay_port: DEFAULT_RELAY_PORT,
            use_lan_discovery: true,
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dni-im")
}

impl Config {
    /// Build a configuration from defaults plus `DNI_IM_*` environment
    /// overrides. Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("DNI_IM_UDP_PORT") {
            match port.parse::<u16>() {
                Ok(p) => config.udp_port = p,
                Err(_) => tracing::warn!(value = %port, "invalid DNI_IM_UDP_PORT, using default"),
            }
        }

        if let Ok(addr) = std::env::var("DNI_IM_RELAY_ADDRESS") {
            if !addr.is_empty() {
                config.relay_address = Some(addr);
            }
        }

        if let Ok(port) = std::env::var("DNI_IM_RELAY_PORT") {
            match port.parse::<u16>() {
                Ok(p) => config.relay_port = p,
                Err(_) => tracing::warn!(value = %port, "invalid DNI_IM_RELAY_PORT, using default"),
            }
        }

        if let Ok(flag) = std::env::var("DNI_IM_LAN_DISCOVERY") {
            match flag.as_str() {
                "0" | "false" | "off" => config.use_lan_discovery = false,
                "1" | "true" | "on" => config.use_lan_discovery = true,
                other => tracing::warn!(value = %other, "invalid DNI_IM_LAN_DISCOVERY, using default"),
            }
        }

        if let Ok(dir) = std::env::var("DNI_IM_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }

        config
    }

    /// Resolve the configured relay into a socket address, if any.
    pub fn relay_socket_addr(&self) -> Result<Option<SocketAddr>> {
        let Some(host) = &self.relay_address else {
            return Ok(None);
        };

        let target = if host.contains(':') {
            host.clone()
        } else {
            format!("{}:{}", host, self.relay_port)
        };

        let addr = target
            .to_socket_addrs()
            .map_err(|e| Error::Socket(format!("relay address {target}: {e}")))?
            .next()
            .ok_or_else(|| Error::Socket(format!("relay address {target} did not resolve")))?;

        Ok(Some(addr))
    }
}
