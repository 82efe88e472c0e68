//! Durable offline message queue.
//!
//! A per-recipient FIFO of plaintexts waiting for a session. Messages are
//! persisted on enqueue and removed only after successful transmission, so a
//! drain interrupted mid-way leaves the failing message at the head. Row ids
//! provide the FIFO order across the stream dimension.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::identity::Fingerprint;

/// Cap per recipient to bound unbounded absence.
pub const MAX_PER_RECIPIENT: usize = 1000;

/// A persisted pending message.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Queue row id; stable handle for removal.
    pub id: i64,
    /// Destination peer.
    pub recipient: Fingerprint,
    /// Stream the message belongs to.
    pub stream_id: u16,
    /// The message plaintext.
    pub plaintext: Vec<u8>,
    /// When the message was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// Per-recipient durable FIFO.
pub struct MessageQueue {
    conn: Mutex<Connection>,
}

impl MessageQueue {
    /// Open or create the queue database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// In-memory queue for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient   TEXT NOT NULL,
                stream_id   INTEGER NOT NULL,
                plaintext   BLOB NOT NULL,
                enqueued_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_recipient ON queue(recipient);
            "#,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Persist a message for later delivery.
    ///
    /// Failures map to [`Error::QueuePersistFailure`]; the caller must not
    /// acknowledge the send in that case.
    pub fn enqueue(&self, recipient: Fingerprint, stream_id: u16, plaintext: &[u8]) -> Result<i64> {
        let backlog = self.count(recipient)?;
        if backlog >= MAX_PER_RECIPIENT {
            return Err(Error::QueuePersistFailure(format!(
                "queue full for {recipient}"
            )));
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO queue (recipient, stream_id, plaintext, enqueued_at) VALUES (?, ?, ?, ?)",
            params![
                recipient.as_str(),
                stream_id as i64,
                plaintext,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| Error::QueuePersistFailure(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    /// The oldest pending message for a recipient, without consuming it.
    pub fn peek(&self, recipient: Fingerprint) -> Result<Option<QueuedMessage>> {
        let row = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT id, recipient, stream_id, plaintext, enqueued_at
                 FROM queue WHERE recipient = ? ORDER BY id LIMIT 1",
                params![recipient.as_str()],
                row_to_message,
            )
            .optional()?;

        match row {
            Some(message) => Ok(Some(message?)),
            None => Ok(None),
        }
    }

    /// Remove a delivered message.
    pub fn remove(&self, id: i64) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM queue WHERE id = ?", params![id])?;
        Ok(())
    }

    /// Pending message count for one recipient.
    pub fn count(&self, recipient: Fingerprint) -> Result<usize> {
        let count: i64 = self.conn.lock().unwrap().query_row(
            "SELECT COUNT(*) FROM queue WHERE recipient = ?",
            params![recipient.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// All recipients with pending messages.
    pub fn recipients(&self) -> Result<Vec<Fingerprint>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT recipient FROM queue ORDER BY recipient")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut recipients = Vec::new();
        for row in rows {
            recipients.push(row?.parse()?);
        }
        Ok(recipients)
    }
}

type MessageRow = std::result::Result<QueuedMessage, Error>;

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let id: i64 = row.get(0)?;
    let recipient: String = row.get(1)?;
    let stream_id: i64 = row.get(2)?;
    let plaintext: Vec<u8> = row.get(3)?;
    let enqueued_at: String = row.get(4)?;

    Ok((|| {
        Ok(QueuedMessage {
            id,
            recipient: recipient.parse()?,
            stream_id: stream_id as u16,
            plaintext,
            enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)
                .map_err(|e| Error::Storage(format!("stored timestamp: {e}")))?
                .with_timezone(&Utc),
        })
    })())
}
