//! Cryptographic engine.
//!
//! Fixed primitive suite, no negotiation:
//!
//! - **X25519** for Diffie-Hellman
//! - **BLAKE2s** as the protocol hash
//! - **ChaCha20-Poly1305** for authenticated encryption
//! - **Noise IK** as the handshake pattern
//!
//! Secret key material is zeroized on drop. Custom primitives are forbidden;
//! everything here composes audited implementations.

pub mod aead;
pub mod keys;
pub mod noise;

pub use aead::TransportCipher;
pub use keys::{EphemeralKeypair, PublicKey, SharedSecret, StaticKeypair};
pub use noise::Handshake;

use blake2::Blake2s256;
use hkdf::SimpleHkdf;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Symmetric key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Derive key material with HKDF over the protocol hash.
pub fn hkdf_derive(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
    output_length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = SimpleHkdf::<Blake2s256>::new(salt, input_key_material);
    let mut output = Zeroizing::new(vec![0u8; output_length]);
    hkdf.expand(info, &mut output)
        .map_err(|_| Error::Crypto("HKDF expansion failed".into()))?;
    Ok(output)
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic() {
        let out1 = hkdf_derive(Some(b"salt"), b"ikm", b"info", 32).unwrap();
        let out2 = hkdf_derive(Some(b"salt"), b"ikm", b"info", 32).unwrap();
        assert_eq!(&*out1, &*out2);

        let out3 = hkdf_derive(Some(b"salt"), b"ikm", b"other", 32).unwrap();
        assert_ne!(&*out1, &*out3);
    }

    #[test]
    fn random_bytes_differ() {
        let a: [u8; 32] = random_bytes();
        let b: [u8; 32] = random_bytes();
        assert_ne!(a, b);
    }
}
