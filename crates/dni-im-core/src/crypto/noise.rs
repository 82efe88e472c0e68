//! Noise IK handshake.
//!
//! The initiator already knows the responder's static key (from discovery or
//! the contact book) and authenticates it on the first flight:
//!
//! ```text
//! <- s (known out of band)
//! -> e, es, s, ss   [+ encrypted intro payload]
//! <- e, ee, se      [+ encrypted intro payload]
//! ```
//!
//! After both messages each side calls [`Handshake::finalize`] to split the
//! chaining key into one cipher per direction; the initiator's send cipher is
//! the responder's receive cipher and vice versa. A passive observer without
//! the responder's private key learns nothing about the initiator's identity
//! from the first message.

use blake2::{Blake2s256, Digest};
use zeroize::Zeroizing;

use super::aead::{TransportCipher, TAG_SIZE};
use super::keys::{EphemeralKeypair, PublicKey, SharedSecret, StaticKeypair, X25519_KEY_SIZE};
use crate::error::{Error, Result};

/// Protocol name mixed into the initial handshake hash.
pub const PROTOCOL_NAME: &[u8] = b"Noise_IK_25519_ChaChaPoly_BLAKE2s";

/// Hash output length.
const HASH_LEN: usize = 32;

/// Wire size of the first handshake message with an empty payload:
/// ephemeral key, encrypted static key, payload tag.
pub const INIT_OVERHEAD: usize = X25519_KEY_SIZE + (X25519_KEY_SIZE + TAG_SIZE) + TAG_SIZE;

/// Wire size of the second handshake message with an empty payload.
pub const RESP_OVERHEAD: usize = X25519_KEY_SIZE + TAG_SIZE;

/// Noise symmetric state: transcript hash, chaining key, current cipher key.
struct SymmetricState {
    h: [u8; HASH_LEN],
    ck: Zeroizing<[u8; HASH_LEN]>,
    k: Option<Zeroizing<[u8; 32]>>,
    n: u64,
}

impl SymmetricState {
    fn new() -> Self {
        // The protocol name is longer than the hash output, so the initial
        // hash is HASH(name).
        let h: [u8; HASH_LEN] = Blake2s256::digest(PROTOCOL_NAME).into();
        Self {
            h,
            ck: Zeroizing::new(h),
            k: None,
            n: 0,
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Blake2s256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    fn mix_key(&mut self, input: &SharedSecret) -> Result<()> {
        let (ck, k) = hkdf2(&self.ck, input.as_bytes())?;
        self.ck = ck;
        self.k = Some(k);
        self.n = 0;
        Ok(())
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let k = self
            .k
            .as_ref()
            .ok_or_else(|| Error::Crypto("handshake cipher not keyed".into()))?;
        let ciphertext = TransportCipher::new(**k).encrypt(self.n, plaintext, &self.h)?;
        self.mix_hash(&ciphertext);
        self.n += 1;
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let k = self
            .k
            .as_ref()
            .ok_or_else(|| Error::Crypto("handshake cipher not keyed".into()))?;
        let plaintext = TransportCipher::new(**k)
            .decrypt(self.n, ciphertext, &self.h)
            .map_err(|_| Error::HandshakeDecryptFailed("payload rejected".into()))?;
        self.mix_hash(ciphertext);
        self.n += 1;
        Ok(plaintext)
    }

    fn split(&self) -> Result<([u8; 32], [u8; 32])> {
        let (k1, k2) = hkdf2(&self.ck, &[])?;
        Ok((*k1, *k2))
    }
}

/// Two 32-byte outputs of HKDF over the chaining key.
#[allow(clippy::type_complexity)]
fn hkdf2(ck: &[u8; HASH_LEN], input: &[u8]) -> Result<(Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>)> {
    let okm = super::hkdf_derive(Some(ck.as_slice()), input, &[], 64)?;
    let mut first = Zeroizing::new([0u8; 32]);
    let mut second = Zeroizing::new([0u8; 32]);
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    Ok((first, second))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// An in-progress IK handshake.
pub struct Handshake {
    role: Role,
    state: SymmetricState,
    local_static: StaticKeypair,
    ephemeral: Option<EphemeralKeypair>,
    remote_static: Option<PublicKey>,
    remote_ephemeral: Option<PublicKey>,
    messages_done: u8,
}

/// Start a handshake toward a responder whose static key is known.
pub fn initiate(local_static: StaticKeypair, responder_static: PublicKey) -> Handshake {
    let mut state = SymmetricState::new();
    state.mix_hash(&[]); // empty prologue
    state.mix_hash(responder_static.as_bytes());

    Handshake {
        role: Role::Initiator,
        state,
        local_static,
        ephemeral: None,
        remote_static: Some(responder_static),
        remote_ephemeral: None,
        messages_done: 0,
    }
}

/// Accept a handshake as responder.
pub fn respond(local_static: StaticKeypair) -> Handshake {
    let mut state = SymmetricState::new();
    state.mix_hash(&[]);
    let own_static = local_static.public();
    state.mix_hash(own_static.as_bytes());

    Handshake {
        role: Role::Responder,
        state,
        local_static,
        ephemeral: None,
        remote_static: None,
        remote_ephemeral: None,
        messages_done: 0,
    }
}

impl Handshake {
    /// Produce the next handshake message carrying `payload`.
    ///
    /// Fails if it is not this side's turn to write.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        match (self.role, self.messages_done) {
            (Role::Initiator, 0) => self.write_init(payload),
            (Role::Responder, 1) => self.write_resp(payload),
            _ => Err(Error::Crypto("handshake message out of order".into())),
        }
    }

    /// Consume the peer's handshake message, returning its decrypted
    /// payload. Fails with [`Error::HandshakeDecryptFailed`] on tag mismatch
    /// or malformed input.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        match (self.role, self.messages_done) {
            (Role::Responder, 0) => self.read_init(message),
            (Role::Initiator, 1) => self.read_resp(message),
            _ => Err(Error::Crypto("handshake message out of order".into())),
        }
    }

    /// Whether both handshake messages have been processed.
    pub fn is_complete(&self) -> bool {
        self.messages_done == 2
    }

    /// The peer's static key, once authenticated.
    pub fn remote_static(&self) -> Option<PublicKey> {
        self.remote_static
    }

    /// Split into `(send_cipher, recv_cipher, peer_static)`.
    pub fn finalize(self) -> Result<(TransportCipher, TransportCipher, PublicKey)> {
        if !self.is_complete() {
            return Err(Error::Crypto("handshake not complete".into()));
        }
        let peer_static = self
            .remote_static
            .ok_or_else(|| Error::Crypto("peer static key missing".into()))?;

        let (k1, k2) = self.state.split()?;
        let (send, recv) = match self.role {
            Role::Initiator => (k1, k2),
            Role::Responder => (k2, k1),
        };

        Ok((TransportCipher::new(send), TransportCipher::new(recv), peer_static))
    }

    // -> e, es, s, ss
    fn write_init(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let rs = self
            .remote_static
            .ok_or_else(|| Error::Crypto("responder static key missing".into()))?;

        let ephemeral = EphemeralKeypair::generate();
        let mut message = Vec::with_capacity(INIT_OVERHEAD + payload.len());

        self.state.mix_hash(ephemeral.public().as_bytes());
        message.extend_from_slice(ephemeral.public().as_bytes());

        self.state.mix_key(&ephemeral.diffie_hellman(&rs))?;
        message.extend_from_slice(&self.state.encrypt_and_hash(self.local_static.public().as_bytes())?);

        self.state.mix_key(&self.local_static.diffie_hellman(&rs))?;
        message.extend_from_slice(&self.state.encrypt_and_hash(payload)?);

        self.ephemeral = Some(ephemeral);
        self.messages_done = 1;
        Ok(message)
    }

    // <- e, ee, se
    fn write_resp(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let re = self
            .remote_ephemeral
            .ok_or_else(|| Error::Crypto("initiator ephemeral missing".into()))?;
        let rs = self
            .remote_static
            .ok_or_else(|| Error::Crypto("initiator static missing".into()))?;

        let ephemeral = EphemeralKeypair::generate();
        let mut message = Vec::with_capacity(RESP_OVERHEAD + payload.len());

        self.state.mix_hash(ephemeral.public().as_bytes());
        message.extend_from_slice(ephemeral.public().as_bytes());

        self.state.mix_key(&ephemeral.diffie_hellman(&re))?;
        self.state.mix_key(&ephemeral.diffie_hellman(&rs))?;
        message.extend_from_slice(&self.state.encrypt_and_hash(payload)?);

        self.ephemeral = Some(ephemeral);
        self.messages_done = 2;
        Ok(message)
    }

    fn read_init(&mut self, message: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if message.len() < INIT_OVERHEAD {
            return Err(Error::HandshakeDecryptFailed("truncated init message".into()));
        }

        let mut re_bytes = [0u8; X25519_KEY_SIZE];
        re_bytes.copy_from_slice(&message[..X25519_KEY_SIZE]);
        let re = PublicKey::from_bytes(re_bytes);

        self.state.mix_hash(re.as_bytes());
        self.state.mix_key(&self.local_static.diffie_hellman(&re))?;

        let static_ct = &message[X25519_KEY_SIZE..X25519_KEY_SIZE * 2 + TAG_SIZE];
        let rs_plain = self.state.decrypt_and_hash(static_ct)?;
        let rs_bytes: [u8; X25519_KEY_SIZE] = rs_plain
            .as_slice()
            .try_into()
            .map_err(|_| Error::HandshakeDecryptFailed("bad static key length".into()))?;
        let rs = PublicKey::from_bytes(rs_bytes);

        self.state.mix_key(&self.local_static.diffie_hellman(&rs))?;
        let payload = self.state.decrypt_and_hash(&message[X25519_KEY_SIZE * 2 + TAG_SIZE..])?;

        self.remote_ephemeral = Some(re);
        self.remote_static = Some(rs);
        self.messages_done = 1;
        Ok(payload)
    }

    fn read_resp(&mut self, message: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if message.len() < RESP_OVERHEAD {
            return Err(Error::HandshakeDecryptFailed("truncated response".into()));
        }

        let ephemeral = self
            .ephemeral
            .as_ref()
            .ok_or_else(|| Error::Crypto("own ephemeral missing".into()))?;

        let mut re_bytes = [0u8; X25519_KEY_SIZE];
        re_bytes.copy_from_slice(&message[..X25519_KEY_SIZE]);
        let re = PublicKey::from_bytes(re_bytes);

        self.state.mix_hash(re.as_bytes());
        self.state.mix_key(&ephemeral.diffie_hellman(&re))?;
        self.state.mix_key(&self.local_static.diffie_hellman(&re))?;

        let payload = self.state.decrypt_and_hash(&message[X25519_KEY_SIZE..])?;

        self.remote_ephemeral = Some(re);
        self.messages_done = 2;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake(
        init_payload: &[u8],
        resp_payload: &[u8],
    ) -> (Handshake, Handshake, Vec<u8>, Vec<u8>) {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();

        let mut initiator = initiate(alice.clone(), bob.public());
        let mut responder = respond(bob);

        let msg_a = initiator.write_message(init_payload).unwrap();
        let got_init = responder.read_message(&msg_a).unwrap().to_vec();

        let msg_b = responder.write_message(resp_payload).unwrap();
        let got_resp = initiator.read_message(&msg_b).unwrap().to_vec();

        (initiator, responder, got_init, got_resp)
    }

    #[test]
    fn full_handshake_delivers_payloads() {
        let (initiator, responder, got_init, got_resp) =
            run_handshake(b"hello from initiator", b"hello from responder");

        assert!(initiator.is_complete());
        assert!(responder.is_complete());
        assert_eq!(got_init, b"hello from initiator");
        assert_eq!(got_resp, b"hello from responder");
    }

    #[test]
    fn split_ciphers_cross_over() {
        let (initiator, responder, _, _) = run_handshake(b"", b"");

        let (i_send, i_recv, _) = initiator.finalize().unwrap();
        let (r_send, r_recv, _) = responder.finalize().unwrap();

        for counter in [0u64, 1, 2, 100] {
            let ct = i_send.encrypt(counter, b"ping", b"").unwrap();
            assert_eq!(&*r_recv.decrypt(counter, &ct, b"").unwrap(), b"ping");

            let ct = r_send.encrypt(counter, b"pong", b"").unwrap();
            assert_eq!(&*i_recv.decrypt(counter, &ct, b"").unwrap(), b"pong");
        }
    }

    #[test]
    fn responder_learns_initiator_static() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();

        let mut initiator = initiate(alice.clone(), bob.public());
        let mut responder = respond(bob.clone());

        let msg_a = initiator.write_message(b"").unwrap();
        responder.read_message(&msg_a).unwrap();

        assert_eq!(responder.remote_static(), Some(alice.public()));

        let msg_b = responder.write_message(b"").unwrap();
        initiator.read_message(&msg_b).unwrap();

        let (_, _, peer) = initiator.finalize().unwrap();
        assert_eq!(peer, bob.public());
    }

    #[test]
    fn wrong_responder_key_fails() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();
        let mallory = StaticKeypair::generate();

        // Initiator targets a key the responder does not hold.
        let mut initiator = initiate(alice, mallory.public());
        let mut responder = respond(bob);

        let msg_a = initiator.write_message(b"").unwrap();
        assert!(matches!(
            responder.read_message(&msg_a),
            Err(Error::HandshakeDecryptFailed(_))
        ));
    }

    #[test]
    fn tampered_init_message_fails() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();

        let mut initiator = initiate(alice, bob.public());
        let mut responder = respond(bob);

        let mut msg_a = initiator.write_message(b"payload").unwrap();
        let last = msg_a.len() - 1;
        msg_a[last] ^= 0x01;

        assert!(matches!(
            responder.read_message(&msg_a),
            Err(Error::HandshakeDecryptFailed(_))
        ));
    }

    #[test]
    fn out_of_order_calls_fail() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();

        let mut initiator = initiate(alice.clone(), bob.public());
        // Reading before writing is not the initiator's turn.
        assert!(matches!(
            initiator.read_message(&[0u8; 96]),
            Err(Error::Crypto(_))
        ));

        let mut responder = respond(bob);
        // Writing before the init message arrives is not the responder's turn.
        assert!(matches!(responder.write_message(b""), Err(Error::Crypto(_))));

        // Double-write on the initiator side.
        initiator.write_message(b"").unwrap();
        assert!(matches!(initiator.write_message(b""), Err(Error::Crypto(_))));
    }

    #[test]
    fn finalize_requires_completion() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();

        let mut initiator = initiate(alice, bob.public());
        initiator.write_message(b"").unwrap();
        assert!(initiator.finalize().is_err());
    }

    #[test]
    fn truncated_messages_are_rejected() {
        let bob = StaticKeypair::generate();
        let mut responder = respond(bob);
        assert!(matches!(
            responder.read_message(&[0u8; 40]),
            Err(Error::HandshakeDecryptFailed(_))
        ));
    }
}
