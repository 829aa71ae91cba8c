//! Identity and contact storage.
//!
//! The store is a flat string table: the local key pair lives under `self`
//! and each friend's public key under `friend:<name>`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use x25519_dalek::PublicKey;

use crate::keys::{encode_public_key, parse_public_key, KeyPair};
use crate::types::{ChatError, Result};

/// Table key holding our own key pair.
pub const SELF_KEY: &str = "self";

/// Prefix of table keys holding friends' public keys.
pub const FRIEND_PREFIX: &str = "friend:";

/// Trait for persisting the local identity and friends' public keys.
///
/// Implementors provide the raw table; the typed accessors are shared.
#[async_trait::async_trait]
pub trait KeyStore: Send + Sync {
    /// Read a single table entry.
    async fn read_key(&self, key: &str) -> Result<Option<String>>;

    /// Write a single table entry.
    async fn write_key(&self, key: &str, value: &str) -> Result<()>;

    /// All table keys.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Remove the whole store.
    async fn delete_store(&self) -> Result<()>;

    /// Our own key pair, if `keygen` has run.
    async fn load_self_identity(&self) -> Result<Option<KeyPair>> {
        match self.read_key(SELF_KEY).await? {
            Some(text) => Ok(Some(text.parse()?)),
            None => Ok(None),
        }
    }

    /// Save our own key pair.
    async fn store_self_identity(&self, pair: &KeyPair) -> Result<()> {
        self.write_key(SELF_KEY, &pair.to_string()).await
    }

    /// A friend's public key.
    async fn load_friend_public_key(&self, name: &str) -> Result<Option<PublicKey>> {
        match self.read_key(&format!("{}{}", FRIEND_PREFIX, name)).await? {
            Some(text) => Ok(Some(parse_public_key(&text)?)),
            None => Ok(None),
        }
    }

    /// Add or replace a friend's public key.
    async fn store_friend_public_key(&self, name: &str, key: &PublicKey) -> Result<()> {
        self.write_key(&format!("{}{}", FRIEND_PREFIX, name), &encode_public_key(key))
            .await
    }

    /// Friend names in sorted order.
    async fn list_friend_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .keys()
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(FRIEND_PREFIX).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory implementation of KeyStore (for testing).
///
/// WARNING: Keys are lost when the process exits.
#[derive(Default, Clone)]
pub struct InMemoryKeyStore {
    table: Arc<RwLock<BTreeMap<String, String>>>,
}

impl InMemoryKeyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn read_key(&self, key: &str) -> Result<Option<String>> {
        Ok(self.table.read().await.get(key).cloned())
    }

    async fn write_key(&self, key: &str, value: &str) -> Result<()> {
        self.table
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.table.read().await.keys().cloned().collect())
    }

    async fn delete_store(&self) -> Result<()> {
        self.table.write().await.clear();
        Ok(())
    }
}

// ============================================================================
// File store
// ============================================================================

/// Keystore persisted as a JSON object file.
///
/// On Unix the file is only ever created with `0600` permissions and new
/// parent directories with `0700`. The contents are not encrypted.
pub struct FileKeyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileKeyStore {
    /// Use the keystore at `path`. Nothing is touched until the first access.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load_table(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                ChatError::StorageFailed(format!("{}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn create_parent(&self) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => return Ok(()),
        };

        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(parent).await?;
        Ok(())
    }

    /// Write the table to a `0600` sibling file, then rename it into place,
    /// so the secret is never readable by others and a crash leaves either
    /// the old or the new table.
    async fn save_table(&self, table: &BTreeMap<String, String>) -> Result<()> {
        self.create_parent().await?;

        let content = serde_json::to_string_pretty(table)?;
        let temp = self.temp_path();
        match tokio::fs::remove_file(&temp).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let written = async {
            let mut file = options.open(&temp).await?;
            file.write_all(content.as_bytes()).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp, &self.path).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(ChatError::StorageFailed(format!("{}: {}", self.path.display(), e)));
        }

        debug!(path = %self.path.display(), entries = table.len(), "saved keystore");
        Ok(())
    }
}

#[async_trait::async_trait]
impl KeyStore for FileKeyStore {
    async fn read_key(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load_table().await?.get(key).cloned())
    }

    async fn write_key(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut table = self.load_table().await?;
        table.insert(key.to_string(), value.to_string());
        self.save_table(&table).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load_table().await?.into_keys().collect())
    }

    async fn delete_store(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "deleted keystore");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
