//! Backing stores for identity records.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;

use super::identity::IdentityRecord;
use super::normalize_key;

/// File name of an identity record inside its directory.
pub const IDENTITY_FILE_NAME: &str = "identity.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid identity key '{0}'")]
    InvalidKey(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Keyed lookup of identity records.
#[async_trait]
pub trait IdentityStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, identity_key: &str) -> Result<Option<IdentityRecord>, StoreError>;
}

/// Records stored as `<root>/<identity_key>/identity.json`.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    root: PathBuf,
}

impl FileIdentityStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, identity_key: &str) -> Result<PathBuf, StoreError> {
        let valid = !identity_key.is_empty()
            && identity_key != "."
            && identity_key != ".."
            && !identity_key.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StoreError::InvalidKey(identity_key.to_string()));
        }
        Ok(self.root.join(identity_key).join(IDENTITY_FILE_NAME))
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn get(&self, identity_key: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let path = self.record_path(identity_key)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Parse { path, source })
    }
}

/// In-memory store, keyed by normalized identity key.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    records: DashMap<String, IdentityRecord>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity_key: &str, record: IdentityRecord) {
        self.records.insert(normalize_key(identity_key), record);
    }

    pub fn remove(&self, identity_key: &str) -> Option<IdentityRecord> {
        self.records.remove(&normalize_key(identity_key)).map(|(_, r)| r)
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get(&self, identity_key: &str) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self
            .records
            .get(&normalize_key(identity_key))
            .map(|r| r.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_reads_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("alice")).unwrap();
        std::fs::write(
            dir.path().join("alice").join(IDENTITY_FILE_NAME),
            r#"{ "password_hash": "$argon2id$x", "channels": { "home": { "is_default": true } } }"#,
        )
        .unwrap();

        let store = FileIdentityStore::new(dir.path());
        let record = store.get("alice").await.unwrap().unwrap();
        assert!(record.channels["home"].is_default);
        assert!(store.get("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join(IDENTITY_FILE_NAME), "{ nope").unwrap();

        let store = FileIdentityStore::new(dir.path());
        assert!(matches!(store.get("broken").await, Err(StoreError::Parse { .. })));
    }

    #[tokio::test]
    async fn file_store_rejects_path_traversal() {
        let store = FileIdentityStore::new("/tmp");
        assert!(matches!(store.get("../etc").await, Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.get("..").await, Err(StoreError::InvalidKey(_))));
    }
}
