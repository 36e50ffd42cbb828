//! The embedded storage engine behind a named store.
//!
//! A `Database` owns one directory under the configured root:
//!
//! ```text
//! <root>/<name>/
//!   MANIFEST      magic + format version
//!   LOCK          exclusive advisory lock while open
//!   records.log   append-only record log
//!   blobs/        content-addressed blob files
//! ```
//!
//! All methods block on file I/O; the async facade in `store` runs them on
//! the blocking pool.

use crate::blobs::BlobStorage;
use crate::error::{Result, StoreError};
use crate::records::{RecordIndex, RecordLog};
use crate::store::StoreConfig;
use crate::types::{Blob, RecordId, StoreStats, StoredValue, Value};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info};

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"SHF\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Databases currently open in this process, keyed by directory.
fn open_databases() -> &'static Mutex<HashMap<PathBuf, Weak<Database>>> {
    static OPEN: OnceLock<Mutex<HashMap<PathBuf, Weak<Database>>>> = OnceLock::new();
    OPEN.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A single open store directory.
pub struct Database {
    name: String,

    path: PathBuf,

    /// Exclusive lock, held until the database is dropped.
    lock_file: File,

    log: RecordLog,

    index: RecordIndex,

    blobs: Arc<BlobStorage>,

    /// Writers (put, clear) take this exclusively; readers share it so
    /// they never observe a half-applied clear.
    ops: RwLock<()>,
}

impl Database {
    /// Get the process-wide handle for `name`, opening it if no other
    /// handle is alive. Opening the same name twice yields the same database.
    pub fn acquire(config: &StoreConfig, name: &str) -> Result<Arc<Self>> {
        let path = Self::database_path(config, name)?;

        loop {
            let mut open = open_databases().lock();
            match open.get(&path).map(Weak::upgrade) {
                Some(Some(db)) => {
                    debug!(name, "reusing open database");
                    return Ok(db);
                }
                // The last handle is mid-drop; it deregisters and unlocks
                // under the registry mutex, so wait for it.
                Some(None) => {}
                None => {
                    let db = Arc::new(Self::open_or_create(config, name)?);
                    open.insert(path, Arc::downgrade(&db));
                    return Ok(db);
                }
            }
            drop(open);
            std::thread::yield_now();
        }
    }

    /// Open an existing database or create a new one, bypassing the
    /// process-wide registry.
    pub fn open_or_create(config: &StoreConfig, name: &str) -> Result<Self> {
        let path = Self::database_path(config, name)?;

        let created = if path.exists() {
            Self::verify_manifest(&path)?;
            false
        } else {
            fs::create_dir_all(path.join("blobs"))?;
            Self::write_manifest(&path)?;
            true
        };

        let lock_file = Self::acquire_lock(&path)?;

        let log = RecordLog::open_with_sync_interval(path.join("records.log"), config.sync_interval)?;
        let blobs = Arc::new(BlobStorage::new(path.join("blobs"), config.blob_cache_size)?);
        let index = RecordIndex::new();

        for (offset, entry) in log.entries()? {
            index.add(entry.id, offset, entry.value.digest()?);
        }

        info!(
            name,
            path = %path.display(),
            records = index.count(),
            created,
            "opened database"
        );

        Ok(Self {
            name: name.to_string(),
            path,
            lock_file,
            log,
            index,
            blobs,
            ops: RwLock::new(()),
        })
    }

    /// Remove a database directory. Fails if a handle to it is still alive
    /// in this process. Removing a database that does not exist is a no-op.
    pub fn delete_database(config: &StoreConfig, name: &str) -> Result<()> {
        let path = Self::database_path(config, name)?;

        loop {
            let open = open_databases().lock();
            match open.get(&path).map(Weak::strong_count) {
                Some(0) => {
                    // Mid-drop; see `acquire`
                    drop(open);
                    std::thread::yield_now();
                }
                Some(_) => return Err(StoreError::DatabaseInUse(name.to_string())),
                None => {
                    if path.exists() {
                        fs::remove_dir_all(&path)?;
                        info!(name, path = %path.display(), "deleted database");
                    }
                    return Ok(());
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a value as a new record. Blob content is written to blob
    /// storage before the log entry that references it.
    pub fn put(&self, value: &Value) -> Result<RecordId> {
        let stored = StoredValue::from(value);
        let digest = stored.digest()?;

        let _guard = self.ops.write();

        if let Value::Blob(blob) = value {
            let content = blob.load_blocking()?;
            self.blobs.store(&content, blob.content_type())?;
        }

        let (entry, offset) = self.log.append(stored)?;
        self.index.add(entry.id, offset, digest);

        debug!(name = %self.name, id = %entry.id, offset, "put record");
        Ok(entry.id)
    }

    /// Every record in insertion order.
    pub fn get_all(&self) -> Result<Vec<Value>> {
        let _guard = self.ops.read();

        Ok(self
            .log
            .entries()?
            .into_iter()
            .map(|(_, entry)| self.materialize(entry.value))
            .collect())
    }

    /// The oldest record equal to `value`.
    pub fn find(&self, value: &Value) -> Result<Value> {
        let stored = StoredValue::from(value);
        let digest = stored.digest()?;

        let _guard = self.ops.read();

        // Digests can collide, so confirm against the entry itself
        for offset in self.index.candidates(&digest) {
            let entry = self.log.read_at(offset)?;
            if entry.value == stored {
                return Ok(self.materialize(entry.value));
            }
        }

        Err(StoreError::NotFound)
    }

    pub fn count(&self) -> u64 {
        let _guard = self.ops.read();
        self.index.count() as u64
    }

    /// Remove every record and blob. The database itself stays.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.ops.write();

        let records = self.index.count();
        self.log.truncate()?;
        self.index.clear();
        let blobs = self.blobs.clear()?;

        debug!(name = %self.name, records, blobs, "cleared database");
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let _guard = self.ops.read();

        Ok(StoreStats {
            record_count: self.index.count() as u64,
            blob_count: self.blobs.list()?.len() as u64,
            log_size_bytes: self.log.size(),
            blob_size_bytes: self.blobs.total_size()?,
        })
    }

    /// Force pending log writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    fn materialize(&self, value: StoredValue) -> Value {
        match value {
            StoredValue::Text(text) => Value::Text(text),
            StoredValue::Blob {
                hash,
                size,
                content_type,
            } => Value::Blob(Blob::stored(
                hash,
                size,
                content_type,
                Arc::clone(&self.blobs),
            )),
        }
    }

    fn database_path(config: &StoreConfig, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        fs::create_dir_all(&config.root)?;
        Ok(fs::canonicalize(&config.root)?.join(name))
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(StoreError::NotInitialized);
        }

        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Deregister and unlock before anyone can reopen the directory
        let this: *const Database = self;
        let mut open = open_databases().lock();
        let registered = open
            .get(&self.path)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), this));
        if registered {
            open.remove(&self.path);
        }

        // Best-effort sync on drop
        let _ = self.sync();
        let _ = FileExt::unlock(&self.lock_file);
    }
}

/// A name maps to a single directory under the root.
fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(|c: char| matches!(c, '/' | '\\' | '\0'));
    if invalid {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}
