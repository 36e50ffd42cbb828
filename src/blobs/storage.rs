//! Blob storage implementation.

use crate::error::{Result, StoreError};
use crate::types::Hash;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Magic bytes for blob files.
const BLOB_MAGIC: &[u8; 4] = b"BLB\0";

/// Current blob format version.
const BLOB_VERSION: u8 = 1;

/// Bytes in a blob file besides content type and content:
/// magic + version + type length + content length + checksum.
const BLOB_FIXED_SIZE: u64 = 4 + 1 + 2 + 8 + 4;

/// Cached blob data (content + content_type).
#[derive(Clone)]
struct CachedBlob {
    content: Arc<[u8]>,
    content_type: String,
}

/// Content-addressed blob storage.
pub struct BlobStorage {
    /// Base directory for blobs.
    path: PathBuf,

    /// Recently read or written blob contents.
    cache: Mutex<LruCache<Hash, CachedBlob>>,
}

impl BlobStorage {
    /// Open blob storage rooted at `path`, creating the directory if needed.
    pub fn new(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Store a blob, returning its hash. Storing existing content is a no-op.
    pub fn store(&self, content: &[u8], content_type: &str) -> Result<Hash> {
        let hash = Hash::from_bytes(content);
        if self.exists(&hash) {
            return Ok(hash);
        }

        fs::create_dir_all(self.shard_path(&hash))?;

        // Write to a temporary name first so a crash never leaves a
        // half-written file under the final name.
        let blob_path = self.blob_path(&hash);
        let tmp_path = blob_path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);

            writer.write_all(BLOB_MAGIC)?;
            writer.write_all(&[BLOB_VERSION])?;

            let content_type = content_type.as_bytes();
            writer.write_all(&(content_type.len() as u16).to_le_bytes())?;
            writer.write_all(content_type)?;

            writer.write_all(&(content.len() as u64).to_le_bytes())?;
            writer.write_all(content)?;
            writer.write_all(&crc32fast::hash(content).to_le_bytes())?;

            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &blob_path)?;

        debug!(hash = %hash, size = content.len(), "stored blob");
        self.cache.lock().put(
            hash,
            CachedBlob {
                content: Arc::from(content),
                content_type: content_type.to_string(),
            },
        );

        Ok(hash)
    }

    /// Read a blob's bytes, failing with `BlobNotFound` if it is missing.
    pub fn read(&self, hash: &Hash) -> Result<Arc<[u8]>> {
        match self.get(hash)? {
            Some((content, _)) => Ok(content),
            None => Err(StoreError::BlobNotFound(*hash)),
        }
    }

    /// Get a blob's bytes and content type.
    pub fn get(&self, hash: &Hash) -> Result<Option<(Arc<[u8]>, String)>> {
        if let Some(cached) = self.cache.lock().get(hash).cloned() {
            return Ok(Some((cached.content, cached.content_type)));
        }

        let blob_path = self.blob_path(hash);
        if !blob_path.exists() {
            return Ok(None);
        }

        let file = File::open(&blob_path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != BLOB_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid blob magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != BLOB_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported blob version: {}",
                version[0]
            )));
        }

        let mut len16 = [0u8; 2];
        reader.read_exact(&mut len16)?;
        let content_type_len = u16::from_le_bytes(len16) as u64;
        if BLOB_FIXED_SIZE + content_type_len > file_len {
            return Err(StoreError::InvalidFormat(format!(
                "Blob {} content type length {} exceeds file size {}",
                hash, content_type_len, file_len
            )));
        }
        let mut content_type = vec![0u8; content_type_len as usize];
        reader.read_exact(&mut content_type)?;
        let content_type = String::from_utf8_lossy(&content_type).into_owned();

        let mut len64 = [0u8; 8];
        reader.read_exact(&mut len64)?;
        let content_len = u64::from_le_bytes(len64);
        let expected_len = content_len
            .checked_add(BLOB_FIXED_SIZE + content_type_len)
            .filter(|&len| len == file_len);
        if expected_len.is_none() {
            return Err(StoreError::InvalidFormat(format!(
                "Blob {} content length {} does not match file size {}",
                hash, content_len, file_len
            )));
        }
        let mut content = vec![0u8; content_len as usize];
        reader.read_exact(&mut content)?;

        let mut checksum = [0u8; 4];
        reader.read_exact(&mut checksum)?;
        let expected = u32::from_le_bytes(checksum);
        let got = crc32fast::hash(&content);
        if expected != got {
            return Err(StoreError::ChecksumMismatch { expected, got });
        }

        let computed = Hash::from_bytes(&content);
        if &computed != hash {
            return Err(StoreError::HashMismatch {
                expected: *hash,
                got: computed,
            });
        }

        let content: Arc<[u8]> = content.into();
        self.cache.lock().put(
            *hash,
            CachedBlob {
                content: Arc::clone(&content),
                content_type: content_type.clone(),
            },
        );

        Ok(Some((content, content_type)))
    }

    pub fn exists(&self, hash: &Hash) -> bool {
        if self.cache.lock().contains(hash) {
            return true;
        }
        self.blob_path(hash).exists()
    }

    /// Remove every blob, along with temporary files left by interrupted
    /// writes. Returns the number of blobs removed.
    pub fn clear(&self) -> Result<usize> {
        self.cache.lock().clear();

        let mut removed = 0;
        for path in self.blob_files()? {
            if is_blob_file(&path) {
                removed += 1;
            }
            fs::remove_file(&path)?;
        }
        Ok(removed)
    }

    /// List all blob hashes.
    pub fn list(&self) -> Result<Vec<Hash>> {
        let mut hashes = Vec::new();
        for path in self.blob_files()? {
            if let Some(hash) = blob_hash(&path) {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }

    /// Total on-disk size of all blob files.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for path in self.blob_files()? {
            total += fs::metadata(path)?.len();
        }
        Ok(total)
    }

    fn blob_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for shard in fs::read_dir(&self.path)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    files.push(entry.path());
                }
            }
        }
        Ok(files)
    }

    fn shard_path(&self, hash: &Hash) -> PathBuf {
        self.path.join(hash.shard_prefix())
    }

    fn blob_path(&self, hash: &Hash) -> PathBuf {
        self.shard_path(hash).join(hash.to_hex())
    }
}

/// The hash a blob file is named after, if it is one.
fn blob_hash(path: &Path) -> Option<Hash> {
    let name = path.file_name()?.to_str()?;
    Hash::from_hex(name).ok()
}

fn is_blob_file(path: &Path) -> bool {
    blob_hash(path).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(dir: &TempDir, cache_size: usize) -> BlobStorage {
        BlobStorage::new(dir.path().join("blobs"), cache_size).unwrap()
    }

    #[test]
    fn test_store_and_read_back_from_disk() {
        let dir = TempDir::new().unwrap();
        let hash = storage(&dir, 10).store(b"Hello, world!", "text/plain").unwrap();

        // Fresh instance so the read goes through the file
        let storage = storage(&dir, 10);
        let (content, content_type) = storage.get(&hash).unwrap().unwrap();
        assert_eq!(&content[..], b"Hello, world!");
        assert_eq!(content_type, "text/plain");
    }

    #[test]
    fn test_deduplication() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 10);

        let first = storage.store(b"Same content", "").unwrap();
        let second = storage.store(b"Same content", "").unwrap();

        assert_eq!(first, second);
        assert_eq!(storage.list().unwrap().len(), 1);
    }

    #[test]
    fn test_read_missing_blob() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 10);

        let missing = Hash::from_bytes(b"nonexistent");
        assert!(!storage.exists(&missing));
        assert!(matches!(storage.read(&missing), Err(StoreError::BlobNotFound(_))));
    }

    #[test]
    fn test_corrupted_blob_is_detected() {
        let dir = TempDir::new().unwrap();
        let hash = storage(&dir, 10).store(b"payload", "").unwrap();

        let path = dir
            .path()
            .join("blobs")
            .join(hash.shard_prefix())
            .join(hash.to_hex());
        let mut bytes = fs::read(&path).unwrap();
        // Flip a content byte; layout is magic(4) version(1) type_len(2) len(8)
        bytes[4 + 1 + 2 + 8] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let storage = storage(&dir, 10);
        assert!(matches!(
            storage.read(&hash),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_clear_removes_everything() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 10);

        let hash = storage.store(b"content1", "").unwrap();
        storage.store(b"content2", "").unwrap();

        assert_eq!(storage.clear().unwrap(), 2);
        assert!(storage.list().unwrap().is_empty());
        assert!(!storage.exists(&hash));
        assert_eq!(storage.total_size().unwrap(), 0);
    }

    #[test]
    fn test_oversized_length_field_is_rejected() {
        let dir = TempDir::new().unwrap();
        let hash = storage(&dir, 10).store(b"Test", "").unwrap();

        let path = dir
            .path()
            .join("blobs")
            .join(hash.shard_prefix())
            .join(hash.to_hex());
        let mut bytes = fs::read(&path).unwrap();
        // Content length follows magic(4) version(1) type_len(2) with an empty type
        bytes[7..15].copy_from_slice(&[0xff; 8]);
        fs::write(&path, bytes).unwrap();

        let storage = storage(&dir, 10);
        assert!(matches!(storage.read(&hash), Err(StoreError::InvalidFormat(_))));
    }

    #[test]
    fn test_clear_removes_leftover_temp_files() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 10);

        let hash = storage.store(b"content", "").unwrap();
        let shard = dir.path().join("blobs").join(hash.shard_prefix());
        let leftover = shard.join(format!("{}.tmp", Hash::from_bytes(b"interrupted")));
        fs::write(&leftover, b"BLB\0partial").unwrap();

        assert_eq!(storage.list().unwrap().len(), 1);
        assert_eq!(storage.clear().unwrap(), 1);
        assert!(!leftover.exists());
        assert_eq!(storage.total_size().unwrap(), 0);
    }
}
