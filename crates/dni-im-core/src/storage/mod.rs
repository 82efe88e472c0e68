//! Durable local state.
//!
//! Two small SQLite databases under the data directory: the contact book
//! (TOFU pins) and the offline message queue. Every mutation is flushed
//! synchronously; SQLite's journal makes each statement atomic, which is
//! what the queue's persistence contract requires.
//!
//! Plaintext message content only ever sits in the queue while the
//! recipient is unreachable; local history encryption is a separate layer
//! outside this crate.

mod contacts;
mod queue;

pub use contacts::{Contact, ContactBook, PinResult};
pub use queue::{MessageQueue, QueuedMessage};

/// Contact book database file name.
pub const CONTACTS_DB: &str = "contacts.db";

/// Message queue database file name.
pub const QUEUE_DB: &str = "queue.db";
