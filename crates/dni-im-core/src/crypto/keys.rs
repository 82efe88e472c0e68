//! X25519 key types.
//!
//! Static keypairs are long-term identity keys (Noise `s`); ephemeral
//! keypairs live for one handshake. Secret material is zeroized on drop and
//! never appears in Debug output.

use std::fmt;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::logging::Redacted;

/// X25519 key size in bytes.
pub const X25519_KEY_SIZE: usize = 32;

/// An X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey([u8; X25519_KEY_SIZE]);

impl PublicKey {
    /// Wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }

    fn to_dalek(self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}…)", hex::encode(&self.0[..4]))
    }
}

impl From<[u8; X25519_KEY_SIZE]> for PublicKey {
    fn from(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

/// A shared secret produced by Diffie-Hellman. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; X25519_KEY_SIZE]);

impl SharedSecret {
    /// The raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedSecret").field(&Redacted(&self.0)).finish()
    }
}

/// A long-term static X25519 keypair.
#[derive(Clone)]
pub struct StaticKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl StaticKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(secret)
    }

    /// Restore a keypair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(*x25519_dalek::PublicKey::from(&secret).as_bytes());
        Self { secret, public }
    }

    /// The public half.
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Diffie-Hellman with a peer public key.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        SharedSecret(*self.secret.diffie_hellman(&their_public.to_dalek()).as_bytes())
    }

    /// Export the secret bytes for persistence. Handle with care.
    pub fn secret_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.secret.to_bytes()
    }
}

impl fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &self.public)
            .field("secret", &Redacted(&self.secret))
            .finish()
    }
}

/// A per-handshake ephemeral X25519 keypair (Noise `e`).
///
/// The secret participates in two DH operations during the handshake, so it
/// is held rather than consumed on first use.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeypair {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(*x25519_dalek::PublicKey::from(&secret).as_bytes());
        Self { secret, public }
    }

    /// The public half.
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Diffie-Hellman with a peer public key.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        SharedSecret(*self.secret.diffie_hellman(&their_public.to_dalek()).as_bytes())
    }
}

impl fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &self.public)
            .field("secret", &Redacted(&self.secret))
            .finish()
    }
}
