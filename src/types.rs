//! Core types for the record store.

use crate::blobs::BlobStorage;
use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Internal identifier for a record. Never handed out to callers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash (SHA-256), used for blobs and value digests.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash(arr))
    }

    /// Directory shard for this hash (first byte, hex).
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[0..1])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Where a blob's bytes live.
#[derive(Clone)]
enum BlobSource {
    /// Built by the caller, bytes held in memory.
    Memory(Arc<[u8]>),
    /// Read back from a store; bytes are loaded from disk on demand.
    Stored(Arc<BlobStorage>),
}

/// A binary large object.
///
/// Blobs are built from byte chunks and read back asynchronously. A blob
/// returned by the store is a handle: its bytes stay on disk until one of
/// the `read*` methods is awaited.
///
/// Two blobs are equal when their content hash and content type match,
/// regardless of where their bytes live.
#[derive(Clone)]
pub struct Blob {
    hash: Hash,
    size: u64,
    content_type: String,
    source: BlobSource,
}

impl Blob {
    /// Build a blob by concatenating the given chunks.
    pub fn new<I, B>(parts: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut content = Vec::new();
        for part in parts {
            content.extend_from_slice(part.as_ref());
        }
        Self::from_bytes(content)
    }

    pub fn from_bytes(content: impl Into<Vec<u8>>) -> Self {
        let content: Vec<u8> = content.into();
        Self {
            hash: Hash::from_bytes(&content),
            size: content.len() as u64,
            content_type: String::new(),
            source: BlobSource::Memory(content.into()),
        }
    }

    pub fn from_text(text: &str) -> Self {
        Self::from_bytes(text.as_bytes()).with_content_type("text/plain")
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Handle to a blob held in `storage`.
    pub(crate) fn stored(
        hash: Hash,
        size: u64,
        content_type: String,
        storage: Arc<BlobStorage>,
    ) -> Self {
        Self {
            hash,
            size,
            content_type,
            source: BlobSource::Stored(storage),
        }
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Read the blob's bytes.
    ///
    /// Stored blobs are read on the blocking pool and verified against
    /// their checksum and hash.
    pub async fn read(&self) -> Result<Vec<u8>> {
        match &self.source {
            BlobSource::Memory(content) => Ok(content.to_vec()),
            BlobSource::Stored(storage) => {
                let storage = Arc::clone(storage);
                let hash = self.hash;
                let content =
                    tokio::task::spawn_blocking(move || storage.read(&hash)).await??;
                Ok(content.to_vec())
            }
        }
    }

    /// Read the blob with every byte mapped to the char of the same code
    /// point (Latin-1), so arbitrary binary data survives as a string.
    pub async fn read_as_binary_string(&self) -> Result<String> {
        let content = self.read().await?;
        Ok(content.into_iter().map(char::from).collect())
    }

    /// Read the blob as UTF-8 text.
    pub async fn read_as_text(&self) -> Result<String> {
        let content = self.read().await?;
        String::from_utf8(content).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    /// Blocking access to the bytes, for use inside the storage engine.
    pub(crate) fn load_blocking(&self) -> Result<Arc<[u8]>> {
        match &self.source {
            BlobSource::Memory(content) => Ok(Arc::clone(content)),
            BlobSource::Stored(storage) => storage.read(&self.hash),
        }
    }
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.content_type == other.content_type
    }
}

impl Eq for Blob {}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = match self.source {
            BlobSource::Memory(_) => "memory",
            BlobSource::Stored(_) => "stored",
        };
        f.debug_struct("Blob")
            .field("hash", &self.hash)
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .field("source", &location)
            .finish()
    }
}

/// A value held by the store: text or a blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Blob(Blob),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            Value::Blob(_) => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Blob> {
        match self {
            Value::Blob(blob) => Some(blob),
            Value::Text(_) => None,
        }
    }

    pub fn into_blob(self) -> Option<Blob> {
        match self {
            Value::Blob(blob) => Some(blob),
            Value::Text(_) => None,
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<Blob> for Value {
    fn from(blob: Blob) -> Self {
        Value::Blob(blob)
    }
}

impl PartialEq<str> for Value {
    fn eq(&self, other: &str) -> bool {
        self.as_text() == Some(other)
    }
}

impl PartialEq<&str> for Value {
    fn eq(&self, other: &&str) -> bool {
        self.as_text() == Some(*other)
    }
}

/// The persisted form of a value. Blob bytes live in blob storage; the log
/// only carries the reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredValue {
    Text(String),
    Blob {
        hash: Hash,
        size: u64,
        content_type: String,
    },
}

impl StoredValue {
    /// Tag byte written ahead of the body in the log.
    pub fn kind(&self) -> u8 {
        match self {
            StoredValue::Text(_) => 0,
            StoredValue::Blob { .. } => 1,
        }
    }

    /// Digest used to find records by value.
    pub fn digest(&self) -> Result<Hash> {
        Ok(Hash::from_bytes(&rmp_serde::to_vec(self)?))
    }
}

impl From<&Value> for StoredValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Text(text) => StoredValue::Text(text.clone()),
            Value::Blob(blob) => StoredValue::Blob {
                hash: blob.hash,
                size: blob.size,
                content_type: blob.content_type.clone(),
            },
        }
    }
}

/// One entry in the record log.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub id: RecordId,
    pub timestamp: Timestamp,
    pub value: StoredValue,
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub record_count: u64,
    pub blob_count: u64,
    pub log_size_bytes: u64,
    pub blob_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_roundtrip() {
        let hash = Hash::from_bytes(b"hello world");
        let parsed = Hash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(hash.shard_prefix().len(), 2);
    }

    #[test]
    fn test_blob_from_parts_concatenates() {
        let blob = Blob::new(["Te", "st"]);
        assert_eq!(blob.size(), 4);
        assert_eq!(blob, Blob::from_bytes(b"Test".to_vec()));
    }

    #[test]
    fn test_blob_equality_includes_content_type() {
        let plain = Blob::from_bytes(b"Test".to_vec());
        let typed = Blob::from_bytes(b"Test".to_vec()).with_content_type("text/plain");
        assert_ne!(plain, typed);
        assert_eq!(typed, Blob::from_text("Test"));
    }

    #[test]
    fn test_value_compares_with_str() {
        let value = Value::from("Test");
        assert_eq!(value, "Test");
        assert!(Value::Blob(Blob::new(["Test"])) != "Test");
    }

    #[test]
    fn test_digest_distinguishes_kinds() {
        let text = StoredValue::from(&Value::from("Test"));
        let blob = StoredValue::from(&Value::Blob(Blob::new(["Test"])));
        assert_eq!(text.kind(), 0);
        assert_eq!(blob.kind(), 1);
        assert_ne!(text.digest().unwrap(), blob.digest().unwrap());
    }

    #[tokio::test]
    async fn test_binary_string_maps_bytes_to_latin1() {
        let blob = Blob::from_bytes(vec![0x54, 0x00, 0xff]);
        let text = blob.read_as_binary_string().await.unwrap();
        assert_eq!(text.chars().map(|c| c as u32).collect::<Vec<_>>(), vec![0x54, 0, 0xff]);
    }

    #[tokio::test]
    async fn test_read_as_text_rejects_invalid_utf8() {
        let blob = Blob::from_bytes(vec![0xff, 0xfe]);
        let result = blob.read_as_text().await;
        assert!(matches!(result, Err(StoreError::Deserialization(_))));
    }
}
