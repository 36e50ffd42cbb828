//! Content-addressed blob storage.
//!
//! Blobs are stored by their SHA-256 hash, sharded into directories
//! by the first byte of the hash (like Git objects). The record log only
//! carries the hash; the bytes live here.

mod storage;

pub use storage::BlobStorage;
