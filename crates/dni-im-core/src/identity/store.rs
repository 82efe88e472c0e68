//! File-backed identity for installs without a card reader.
//!
//! Generates identity material on first run and persists it under the data
//! directory. The file is written once and never rotated; writes go through
//! a temporary file and rename.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{Fingerprint, Identity, IdentityProvider};
use crate::crypto::keys::StaticKeypair;
use crate::error::{Error, Result};

/// Identity file name inside the data directory.
const IDENTITY_FILE: &str = "identity.json";

#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    fingerprint: String,
    display_name: String,
    static_secret: String,
}

/// Identity provider that generates and stores identity material locally.
pub struct FileIdentity {
    data_dir: PathBuf,
    display_name: String,
}

impl FileIdentity {
    /// Create a provider rooted at `data_dir`. `display_name` is used only
    /// when a new identity is generated.
    pub fn new(data_dir: impl Into<PathBuf>, display_name: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            display_name: display_name.into(),
        }
    }

    /// Whether identity material already exists on disk.
    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    fn path(&self) -> PathBuf {
        self.data_dir.join(IDENTITY_FILE)
    }

    fn load(&self) -> Result<Identity> {
        let raw = std::fs::read_to_string(self.path())
            .map_err(|e| Error::Identity(format!("read identity file: {e}")))?;
        let record: IdentityRecord = serde_json::from_str(&raw)
            .map_err(|e| Error::Identity(format!("parse identity file: {e}")))?;

        let fingerprint: Fingerprint = record.fingerprint.parse()?;

        let secret = Zeroizing::new(
            BASE64
                .decode(&record.static_secret)
                .map_err(|e| Error::Identity(format!("decode static secret: {e}")))?,
        );
        let secret: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| Error::Identity("static secret is not 32 bytes".into()))?;

        Ok(Identity::new(
            fingerprint,
            record.display_name,
            StaticKeypair::from_secret_bytes(secret),
        ))
    }

    fn generate(&self) -> Result<Identity> {
        // Stand-in certificate material; a card-backed provider derives the
        // fingerprint from the real certificate instead.
        let mut certificate = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut certificate);

        let fingerprint = Fingerprint::derive(&certificate);
        let keys = StaticKeypair::generate();
        let identity = Identity::new(fingerprint, self.display_name.clone(), keys);

        self.persist(&identity)?;

        tracing::info!(fingerprint = %identity.fingerprint(), "generated new identity");
        Ok(identity)
    }

    fn persist(&self, identity: &Identity) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| Error::Storage(format!("create data dir: {e}")))?;

        let record = IdentityRecord {
            fingerprint: identity.fingerprint().as_str().to_string(),
            display_name: identity.display_name().to_string(),
            static_secret: BASE64.encode(identity.static_keys().secret_bytes()),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| Error::Identity(format!("encode identity: {e}")))?;

        write_atomic(&self.path(), json.as_bytes())
    }
}

impl IdentityProvider for FileIdentity {
    fn authenticate(&mut self) -> Result<Identity> {
        if self.exists() {
            self.load()
        } else {
            self.generate()
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(|e| Error::Storage(format!("write identity: {e}")))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::Storage(format!("store identity: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_generates_then_reloads() {
        let dir = tempfile::tempdir().unwrap();

        let mut provider = FileIdentity::new(dir.path(), "Alice");
        assert!(!provider.exists());

        let first = provider.authenticate().unwrap();
        assert!(provider.exists());
        assert_eq!(first.display_name(), "Alice");

        let mut again = FileIdentity::new(dir.path(), "ignored");
        let second = again.authenticate().unwrap();

        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.static_public(), second.static_public());
        assert_eq!(second.display_name(), "Alice");
    }

    #[test]
    fn corrupt_file_is_an_identity_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IDENTITY_FILE), b"not json").unwrap();

        let mut provider = FileIdentity::new(dir.path(), "Alice");
        assert!(matches!(provider.authenticate(), Err(Error::Identity(_))));
    }
}
