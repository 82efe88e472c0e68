//! Wire protocols.
//!
//! Two distinct codecs share this module:
//!
//! - [`packet`]: the peer-to-peer UDP format. Minimal framing (type,
//!   connection id, stream id); everything else is Noise-encrypted.
//! - [`relay`]: the client↔relay format. The relay forwards opaque
//!   peer-to-peer packets by fingerprint and never inspects them.
//!
//! Malformed input of either kind is dropped silently; no error responses
//! are ever sent.

pub mod packet;
pub mod relay;

pub use packet::{Packet, PacketType, HEADER_LEN, MAX_PAYLOAD_SIZE};
pub use relay::{RelayMessage, RelayPeer};
