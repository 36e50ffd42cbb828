//! The async record store.

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::types::{StoreStats, Value};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Environment variable overriding [`StoreConfig::root`] in [`StoreConfig::from_env`].
pub const ROOT_ENV_VAR: &str = "SHELF_ROOT";

/// Storage configuration shared by every store opened with it.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one subdirectory per database.
    pub root: PathBuf,

    /// Blob cache size (number of blobs).
    pub blob_cache_size: usize,

    /// Sync the record log every N writes.
    pub sync_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./shelf-data"),
            blob_cache_size: 1000,
            sync_interval: 100,
        }
    }
}

impl StoreConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults, with the root taken from `SHELF_ROOT` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = std::env::var_os(ROOT_ENV_VAR) {
            config.root = PathBuf::from(root);
        }
        config
    }
}

/// Options for constructing a [`RecordStore`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Name of the persistent database.
    pub db_name: String,

    pub config: StoreConfig,
}

impl StoreOptions {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            config: StoreConfig::default(),
        }
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }
}

struct Inner {
    options: StoreOptions,

    /// Set by the first operation; concurrent first operations share the open.
    db: OnceCell<Arc<Database>>,
}

/// A named, persistent store of text values and blobs.
///
/// Construction does no I/O. The database is opened (or created) by the
/// first operation, and every operation runs its file I/O on tokio's
/// blocking pool. Clones share the same open database.
///
/// ```ignore
/// let store = RecordStore::new(StoreOptions::new("test"));
///
/// store.save("Test").await?;
/// let blob = store.save(Blob::new(["Test"])).await?;
///
/// assert_eq!(store.size().await?, 2);
/// let found = store.get_by_blob(blob).await?;
/// assert_eq!(found.as_blob().unwrap().read_as_text().await?, "Test");
/// ```
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<Inner>,
}

impl RecordStore {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                db: OnceCell::new(),
            }),
        }
    }

    /// Name of the underlying database.
    pub fn name(&self) -> &str {
        &self.inner.options.db_name
    }

    /// Every record, oldest first.
    pub async fn all(&self) -> Result<Vec<Value>> {
        self.run(|db| db.get_all()).await
    }

    /// Insert a new record, resolving with the saved value.
    pub async fn save(&self, value: impl Into<Value>) -> Result<Value> {
        let value = value.into();
        self.run(move |db| {
            db.put(&value)?;
            Ok(value)
        })
        .await
    }

    /// Find the oldest stored record equal to `value`.
    ///
    /// Fails with [`StoreError::NotFound`] when nothing matches.
    pub async fn get_by_blob(&self, value: impl Into<Value>) -> Result<Value> {
        let value = value.into();
        self.run(move |db| db.find(&value)).await
    }

    /// Number of records.
    pub async fn size(&self) -> Result<u64> {
        self.run(|db| Ok(db.count())).await
    }

    /// Remove every record.
    pub async fn clear(&self) -> Result<()> {
        self.run(|db| db.clear()).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.run(|db| db.stats()).await
    }

    /// Close this store and remove its database from disk.
    ///
    /// Fails with [`StoreError::DatabaseInUse`] while any other handle to
    /// the same database is alive in this process.
    pub async fn delete_database(self) -> Result<()> {
        let inner = Arc::try_unwrap(self.inner)
            .map_err(|inner| StoreError::DatabaseInUse(inner.options.db_name.clone()))?;
        let Inner { options, db } = inner;
        drop(db);

        tokio::task::spawn_blocking(move || {
            Database::delete_database(&options.config, &options.db_name)
        })
        .await?
    }

    /// The open database, opening it on first use. A failed open is not
    /// cached; the next call tries again.
    async fn database(&self) -> Result<Arc<Database>> {
        let db = self
            .inner
            .db
            .get_or_try_init(|| async {
                let config = self.inner.options.config.clone();
                let name = self.inner.options.db_name.clone();
                tokio::task::spawn_blocking(move || Database::acquire(&config, &name)).await?
            })
            .await?;
        Ok(Arc::clone(db))
    }

    /// Run a blocking database operation on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.database().await?;
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Blob;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir, name: &str) -> RecordStore {
        RecordStore::new(StoreOptions::new(name).with_config(StoreConfig {
            root: dir.path().join("data"),
            blob_cache_size: 100,
            sync_interval: 1,
        }))
    }

    #[test]
    fn test_config_from_json_fills_defaults() {
        let config = StoreConfig::from_json(r#"{"root": "/tmp/shelf", "sync_interval": 5}"#).unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/shelf"));
        assert_eq!(config.sync_interval, 5);
        assert_eq!(config.blob_cache_size, 1000);

        assert!(matches!(
            StoreConfig::from_json("not json"),
            Err(StoreError::Deserialization(_))
        ));
    }

    #[test]
    fn test_config_from_env_overrides_root() {
        // Only test in this binary touching the variable
        let saved = std::env::var_os(ROOT_ENV_VAR);

        std::env::set_var(ROOT_ENV_VAR, "/var/lib/shelf");
        let config = StoreConfig::from_env();
        assert_eq!(config.root, PathBuf::from("/var/lib/shelf"));
        assert_eq!(config.blob_cache_size, 1000);
        assert_eq!(config.sync_interval, 100);

        std::env::remove_var(ROOT_ENV_VAR);
        assert_eq!(StoreConfig::from_env().root, PathBuf::from("./shelf-data"));

        if let Some(saved) = saved {
            std::env::set_var(ROOT_ENV_VAR, saved);
        }
    }

    #[test]
    fn test_construction_does_no_io() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir, "test");

        assert_eq!(store.name(), "test");
        assert!(!dir.path().join("data").exists());
    }

    #[tokio::test]
    async fn test_first_operation_creates_database() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir, "test");

        assert_eq!(store.size().await.unwrap(), 0);
        assert!(dir.path().join("data").join("test").join("MANIFEST").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_operations_open_once() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir, "test");

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.save(format!("record {}", i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.size().await.unwrap(), 16);
        assert_eq!(store.all().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_failed_open_is_retried() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir, "test");

        // A foreign directory without a manifest cannot be opened
        let path = dir.path().join("data").join("test");
        std::fs::create_dir_all(&path).unwrap();
        assert!(matches!(store.size().await, Err(StoreError::NotInitialized)));

        std::fs::remove_dir_all(&path).unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_save_returns_input() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir, "test");

        let blob = Blob::new(["Test"]).with_content_type("text/plain");
        let saved = store.save(blob.clone()).await.unwrap();
        assert_eq!(saved, Value::Blob(blob));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.blob_count, 1);
    }

    #[tokio::test]
    async fn test_delete_database_with_live_clone() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir, "test");
        store.save("Test").await.unwrap();

        let other = store.clone();
        assert!(matches!(
            store.delete_database().await,
            Err(StoreError::DatabaseInUse(_))
        ));

        other.delete_database().await.unwrap();
        assert!(!dir.path().join("data").join("test").exists());
    }
}
