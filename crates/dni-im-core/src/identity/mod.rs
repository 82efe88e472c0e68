//! Identity and fingerprints.
//!
//! An identity is issued by an external authenticator (a smart-card reader in
//! the reference deployment) and consists of a 16-hex-character fingerprint,
//! a display name, and the long-term static X25519 key. The core consumes
//! the result of [`IdentityProvider::authenticate`] and treats the
//! fingerprint as opaque: it is the sole durable peer identifier.
//!
//! For development and headless installs, [`FileIdentity`] generates an
//! identity on first run and persists it under the data directory.

mod store;

pub use store::FileIdentity;

use std::fmt;
use std::str::FromStr;

use blake2::{Blake2s256, Digest};
use serde::{Deserialize, Serialize};

use crate::crypto::keys::{PublicKey, StaticKeypair};
use crate::error::{Error, Result};
use crate::logging::Redacted;

/// Length of a fingerprint in characters (and wire bytes).
pub const FINGERPRINT_LEN: usize = 16;

/// A peer's stable identifier: 16 lowercase hexadecimal characters derived
/// from the identity certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Derive a fingerprint from identity certificate material.
    pub fn derive(certificate: &[u8]) -> Self {
        let digest = Blake2s256::digest(certificate);
        let mut chars = [0u8; FINGERPRINT_LEN];
        hex::encode_to_slice(&digest[..FINGERPRINT_LEN / 2], &mut chars)
            .unwrap_or_else(|_| unreachable!("8 bytes always encode to 16 hex chars"));
        Self(chars)
    }

    /// Parse the 16 ASCII bytes of a wire-format fingerprint.
    pub fn from_wire(bytes: [u8; FINGERPRINT_LEN]) -> Result<Self> {
        if !bytes.iter().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(Error::MalformedPacket("fingerprint not lowercase hex".into()));
        }
        Ok(Self(bytes))
    }

    /// The fingerprint as a string slice.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("................")
    }

    /// The 16 ASCII bytes sent on the wire.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.as_str())
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != FINGERPRINT_LEN
            || !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(Error::Identity(format!(
                "fingerprint must be {FINGERPRINT_LEN} lowercase hex characters"
            )));
        }
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(s.as_bytes());
        Ok(Self(bytes))
    }
}

/// A local identity: who this node is on the network.
#[derive(Clone)]
pub struct Identity {
    fingerprint: Fingerprint,
    display_name: String,
    static_keys: StaticKeypair,
}

impl Identity {
    /// Assemble an identity from authenticated parts.
    pub fn new(fingerprint: Fingerprint, display_name: impl Into<String>, static_keys: StaticKeypair) -> Self {
        Self {
            fingerprint,
            display_name: display_name.into(),
            static_keys,
        }
    }

    /// This node's fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Human-readable display name, advertised to peers.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The long-term static keypair (Noise `s`).
    pub fn static_keys(&self) -> &StaticKeypair {
        &self.static_keys
    }

    /// The static public key peers pin.
    pub fn static_public(&self) -> PublicKey {
        self.static_keys.public()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .field("display_name", &self.display_name)
            .field("static_keys", &Redacted(&self.static_keys))
            .finish()
    }
}

/// Source of authenticated identities.
///
/// The reference deployment backs this with a national-ID smart card; tests
/// and headless installs use [`FileIdentity`].
pub trait IdentityProvider {
    /// Authenticate and return the resulting identity.
    fn authenticate(&mut self) -> Result<Identity>;
}
