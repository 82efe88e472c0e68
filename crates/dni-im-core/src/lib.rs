//! # DNI-IM Core Library
//!
//! The core of a secure peer-to-peer instant messenger: Noise IK sessions
//! over a multiplexed UDP protocol, LAN and relay peer discovery, TOFU
//! contact pinning, and a durable offline message queue.
//!
//! ## Trust Model
//!
//! - Peers are identified by a short fingerprint issued by an external
//!   identity provider; the core treats it as opaque.
//! - The first static key observed for a fingerprint is pinned; any later
//!   key change is treated as an attack.
//! - The rendezvous relay is untrusted: it learns addresses, fingerprints
//!   and traffic shape, never message contents.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  Application                 │
//! ├──────────────────────────────────────────────┤
//! │  messaging   │   discovery   │   storage     │
//! ├──────────────────────────────────────────────┤
//! │        protocol (wire)  │  transport         │
//! ├──────────────────────────────────────────────┤
//! │       crypto        │      identity          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The session task is the single owner of sessions, contacts, endpoints and
//! the queue; the receive and discovery tasks feed it through one channel.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod logging;
pub mod messaging;
pub mod node;
pub mod protocol;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use node::{Node, NodeHandle};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum encrypted payload carried by one DATA packet (60 KiB).
///
/// Larger sends are rejected; no fragmentation is performed.
pub const MAX_CIPHERTEXT_SIZE: usize = 60 * 1024;
