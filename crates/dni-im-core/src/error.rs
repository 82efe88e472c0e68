//! Error types for the DNI-IM core.
//!
//! Display strings stay deliberately generic; anything that could serve as a
//! decryption or parsing oracle carries its detail internally only.

use thiserror::Error;

use crate::identity::Fingerprint;

/// Core error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Datagram shorter than the header or with an unrecognized type byte.
    /// Always dropped silently.
    #[error("malformed packet")]
    MalformedPacket(String),

    /// Inbound packet referenced a connection id with no live session.
    #[error("unknown connection id")]
    UnknownConnectionId(u32),

    /// AEAD tag verification failed on a DATA packet. Fatal to the session.
    #[error("authentication failed")]
    AeadTagInvalid,

    /// The 64-bit send counter reached its reserved final value.
    #[error("cipher counter exhausted")]
    CounterExhausted,

    /// A handshake message failed to decrypt or parse. Dropped without a
    /// reply so the failure is not observable.
    #[error("handshake failed")]
    HandshakeDecryptFailed(String),

    /// Peer presented a static key that differs from the pinned one.
    #[error("pinned key mismatch for {0}")]
    PinningViolation(Fingerprint),

    /// Payload would exceed the single-datagram ceiling after encryption.
    #[error("message too large ({0} bytes)")]
    MessageTooLarge(usize),

    /// Send to the peer's last known address failed.
    #[error("endpoint unreachable")]
    EndpointUnreachable,

    /// Relay did not acknowledge a registration.
    #[error("relay registration failed")]
    RelayRegisterFailed(String),

    /// The message queue could not persist an enqueue. The send is not
    /// acknowledged.
    #[error("queue persistence failed")]
    QueuePersistFailure(String),

    /// Other cryptographic failure (key derivation, out-of-order handshake).
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Identity material could not be loaded, created or parsed.
    #[error("identity error")]
    Identity(String),

    /// Contact book or queue storage failure.
    #[error("storage error")]
    Storage(String),

    /// Socket bind or I/O failure.
    #[error("socket error")]
    Socket(String),

    /// The node is shutting down; the input channel is closed.
    #[error("node is shut down")]
    Shutdown,
}

/// Result alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error must be logged at debug level and otherwise have
    /// no effect (no reply, no session change).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            Error::MalformedPacket(_)
                | Error::UnknownConnectionId(_)
                | Error::HandshakeDecryptFailed(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Socket(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
