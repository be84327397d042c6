//! Keyed persistent storage beneath the protocol layer.
//!
//! Only the protocol client reads or writes it; the broker and everything
//! above it see sessions, never storage entries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Error;

/// Host-provided key/value storage (browser storage, a file, a keychain).
///
/// # Example
///
/// ```rust,ignore
/// #[async_trait]
/// impl SessionStorage for KeychainStorage {
///     async fn get(&self, key: &str) -> Result<Option<String>, Error> {
///         self.keychain.read(key).await.map_err(|e| Error::Storage(e.to_string()))
///     }
///     // ...
/// }
/// ```
#[async_trait]
pub trait SessionStorage: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(&self, key: &str, value: String) -> Result<(), Error>;

    async fn remove(&self, key: &str) -> Result<(), Error>;

    /// Keys currently stored that start with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, Error>;
}

/// Process-local storage. Sessions do not survive a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), Error> {
        self.entries.lock().insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Single JSON file holding all entries, rewritten on every change.
///
/// Writes go to a sibling `.tmp` file that is renamed into place, so a reader
/// sees either the old or the new contents. Suitable for desktop and CLI hosts.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: tokio::sync::RwLock<()>,
}

impl FileStorage {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::RwLock::new(()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    async fn read_all(&self) -> Result<HashMap<String, String>, Error> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Storage(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Error::Storage(format!("{}: {e}", self.path.display()))),
        }
    }

    async fn write_all(&self, entries: &HashMap<String, String>) -> Result<(), Error> {
        let bytes = serde_json::to_vec_pretty(entries)
            .map_err(|e| Error::Storage(e.to_string()))?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|e| Error::Storage(format!("{}: {e}", temp.display())))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| Error::Storage(format!("{}: {e}", self.path.display())))
    }
}

#[async_trait]
impl SessionStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let _guard = self.lock.read().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), Error> {
        let _guard = self.lock.write().await;
        let mut entries = self.read_all().await?;
        entries.insert(key.to_owned(), value);
        self.write_all(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        let _guard = self.lock.write().await;
        let mut entries = self.read_all().await?;
        if entries.remove(key).is_some() {
            self.write_all(&entries).await?;
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let _guard = self.lock.read().await;
        Ok(self
            .read_all()
            .await?
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}
