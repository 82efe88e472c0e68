//! Authenticated encryption with counter nonces.
//!
//! Each session direction owns one [`TransportCipher`] keyed by the Noise
//! `Split()` output. Nonces are never random: the 96-bit nonce is the 64-bit
//! message counter in little-endian followed by four zero bytes, so both
//! sides reconstruct it from session state and no nonce travels on the wire.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Key size in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// The final counter value is reserved; reaching it closes the session.
const COUNTER_LIMIT: u64 = u64::MAX;

/// Build the nonce for a message counter.
pub(crate) fn nonce_for(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// One direction of an established session.
pub struct TransportCipher {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl TransportCipher {
    /// Key a cipher from `Split()` output.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key: Zeroizing::new(key) }
    }

    /// Encrypt `plaintext` at `counter`, binding `aad`.
    ///
    /// Returns ciphertext with the appended 16-byte tag. Fails with
    /// [`Error::CounterExhausted`] once the counter reaches its reserved
    /// final value; the caller must tear the session down.
    pub fn encrypt(&self, counter: u64, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if counter == COUNTER_LIMIT {
            return Err(Error::CounterExhausted);
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_ref()));
        let nonce = nonce_for(counter);

        cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| Error::Crypto("encryption failed".into()))
    }

    /// Decrypt `ciphertext` at `counter`, verifying `aad`.
    ///
    /// Fails with [`Error::AeadTagInvalid`] on any tamper, key, counter or
    /// aad mismatch; the error carries no distinguishing detail.
    pub fn decrypt(&self, counter: u64, ciphertext: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if counter == COUNTER_LIMIT {
            return Err(Error::CounterExhausted);
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_ref()));
        let nonce = nonce_for(counter);

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| Error::AeadTagInvalid)?;

        Ok(Zeroizing::new(plaintext))
    }
}

impl std::fmt::Debug for TransportCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TransportCipher")
            .field(&crate::logging::Redacted(&self.key))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (TransportCipher, TransportCipher) {
        let key = [7u8; KEY_SIZE];
        (TransportCipher::new(key), TransportCipher::new(key))
    }

    #[test]
    fn round_trip() {
        let (send, recv) = pair();

        let ciphertext = send.encrypt(0, b"hola", b"").unwrap();
        assert_eq!(ciphertext.len(), 4 + TAG_SIZE);

        let plaintext = recv.decrypt(0, &ciphertext, b"").unwrap();
        assert_eq!(&*plaintext, b"hola");
    }

    #[test]
    fn counter_mismatch_fails() {
        let (send, recv) = pair();
        let ciphertext = send.encrypt(3, b"msg", b"").unwrap();

        assert!(matches!(recv.decrypt(4, &ciphertext, b""), Err(Error::AeadTagInvalid)));
        assert!(matches!(recv.decrypt(2, &ciphertext, b""), Err(Error::AeadTagInvalid)));
        assert!(recv.decrypt(3, &ciphertext, b"").is_ok());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (send, recv) = pair();
        let mut ciphertext = send.encrypt(0, b"msg", b"").unwrap();
        ciphertext[0] ^= 0xff;

        assert!(matches!(recv.decrypt(0, &ciphertext, b""), Err(Error::AeadTagInvalid)));
    }

    #[test]
    fn aad_mismatch_fails() {
        let (send, recv) = pair();
        let ciphertext = send.encrypt(0, b"msg", b"right").unwrap();

        assert!(recv.decrypt(0, &ciphertext, b"wrong").is_err());
    }

    #[test]
    fn final_counter_is_reserved() {
        let (send, _) = pair();
        assert!(matches!(
            send.encrypt(u64::MAX, b"msg", b""),
            Err(Error::CounterExhausted)
        ));
    }

    #[test]
    fn nonce_layout_is_little_endian_counter() {
        let nonce = nonce_for(0x0102030405060708);
        assert_eq!(&nonce[..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&nonce[8..], &[0, 0, 0, 0]);
    }

    #[test]
    fn distinct_counters_produce_distinct_ciphertexts() {
        let (send, _) = pair();
        let a = send.encrypt(0, b"same", b"").unwrap();
        let b = send.encrypt(1, b"same", b"").unwrap();
        assert_ne!(a, b);
    }
}
