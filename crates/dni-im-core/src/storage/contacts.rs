//! Contact book with trust-on-first-use pinning.
//!
//! The first static key observed for a fingerprint is pinned permanently.
//! A later handshake presenting a different key is a [`PinResult::Violation`]
//! and the caller treats it as an attack. Only an explicit user `forget`
//! erases a pin.

use std::path::Path;
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::crypto::keys::PublicKey;
use crate::error::{Error, Result};
use crate::identity::Fingerprint;

/// Outcome of a pin attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinResult {
    /// First observation; the key is now pinned.
    Created,
    /// Key matches the existing pin.
    Unchanged,
    /// Key differs from the pin. Fatal to the session.
    Violation,
}

/// A pinned contact.
#[derive(Debug, Clone)]
pub struct Contact {
    /// The contact's fingerprint.
    pub fingerprint: Fingerprint,
    /// Display name (mutable via [`ContactBook::rename`]).
    pub name: String,
    /// The pinned static key. Immutable.
    pub static_pub: PublicKey,
    /// When the contact was first seen.
    pub first_seen: DateTime<Utc>,
}

/// Fingerprint-keyed contact store.
pub struct ContactBook {
    conn: Mutex<Connection>,
}

impl ContactBook {
    /// Open or create the contact book at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// In-memory contact book for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                fingerprint TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                static_pub  TEXT NOT NULL,
                first_seen  TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Verify a fingerprint→key binding, pinning it on first sight.
    ///
    /// `name` is stored only for a new pin; an existing contact keeps its
    /// name (use [`ContactBook::rename`] to change it).
    pub fn pin(
        &self,
        fingerprint: Fingerprint,
        static_pub: &PublicKey,
        name: Option<&str>,
    ) -> Result<PinResult> {
        let observed = BASE64.encode(static_pub.as_bytes());

        let conn = self.conn.lock().unwrap();
        let pinned: Option<String> = conn
            .query_row(
                "SELECT static_pub FROM contacts WHERE fingerprint = ?",
                params![fingerprint.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match pinned {
            Some(stored) if stored == observed => Ok(PinResult::Unchanged),
            Some(_) => Ok(PinResult::Violation),
            None => {
                let name = name.unwrap_or(fingerprint.as_str());
                conn.execute(
                    "INSERT INTO contacts (fingerprint, name, static_pub, first_seen) VALUES (?, ?, ?, ?)",
                    params![fingerprint.as_str(), name, observed, Utc::now().to_rfc3339()],
                )?;
                Ok(PinResult::Created)
            }
        }
    }

    /// Look up a contact.
    pub fn lookup(&self, fingerprint: Fingerprint) -> Result<Option<Contact>> {
        let row: Option<ContactRow> = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT fingerprint, name, static_pub, first_seen FROM contacts WHERE fingerprint = ?",
                params![fingerprint.as_str()],
                row_to_contact,
            )
            .optional()?;

        match row {
            Some(contact) => Ok(Some(contact?)),
            None => Ok(None),
        }
    }

    /// Update a contact's display name.
    pub fn rename(&self, fingerprint: Fingerprint, new_name: &str) -> Result<()> {
        let changed = self.conn.lock().unwrap().execute(
            "UPDATE contacts SET name = ? WHERE fingerprint = ?",
            params![new_name, fingerprint.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::Storage(format!("no contact {fingerprint}")));
        }
        Ok(())
    }

    /// Erase a pin. Explicit user action; the next handshake re-pins.
    pub fn forget(&self, fingerprint: Fingerprint) -> Result<bool> {
        let removed = self.conn.lock().unwrap().execute(
            "DELETE FROM contacts WHERE fingerprint = ?",
            params![fingerprint.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// All contacts, oldest first.
    pub fn all(&self) -> Result<Vec<Contact>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT fingerprint, name, static_pub, first_seen FROM contacts ORDER BY first_seen")?;
        let rows = stmt.query_map([], row_to_contact)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row??);
        }
        Ok(contacts)
    }
}

type ContactRow = std::result::Result<Contact, Error>;

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRow> {
    let fingerprint: String = row.get(0)?;
    let name: String = row.get(1)?;
    let static_pub: String = row.get(2)?;
    let first_seen: String = row.get(3)?;

    Ok((|| {
        let fingerprint: Fingerprint = fingerprint.parse()?;
        let key_bytes = BASE64
            .decode(&static_pub)
            .map_err(|e| Error::Storage(format!("stored key: {e}")))?;
        let key: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Storage("stored key is not 32 bytes".into()))?;
        let first_seen = DateTime::parse_from_rfc3339(&first_seen)
            .map_err(|e| Error::Storage(format!("stored timestamp: {e}")))?
            .with_timezone(&Utc);

        Ok(Contact {
            fingerprint,
            name,
            static_pub: PublicKey::from_bytes(key),
            first_seen,
        })
    })())
}
