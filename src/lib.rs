//! # shelf
//!
//! A named, persistent record store for text values and blobs, with an
//! async API.
//!
//! ## Core Concepts
//!
//! - **Store**: a named database directory, opened lazily on first use and
//!   kept across process restarts
//! - **Records**: text values or blobs, kept in insertion order and found
//!   by value
//! - **Blobs**: content-addressed binary data, read back asynchronously
//!
//! ## Example
//!
//! ```ignore
//! use shelf::{Blob, RecordStore, StoreOptions};
//!
//! let store = RecordStore::new(StoreOptions::new("test"));
//!
//! store.save("Johan").await?;
//! let blob = store.save(Blob::new(["Test"])).await?;
//! assert_eq!(store.size().await?, 2);
//!
//! let found = store.get_by_blob(blob).await?;
//! let contents = found.as_blob().unwrap().read_as_binary_string().await?;
//! assert_eq!(contents, "Test");
//!
//! store.clear().await?;
//! assert!(store.all().await?.is_empty());
//! ```

pub mod blobs;
pub mod database;
pub mod error;
pub mod records;
pub mod store;
pub mod types;

// Re-exports
pub use blobs::BlobStorage;
pub use database::Database;
pub use error::{Result, StoreError};
pub use records::{RecordIndex, RecordLog};
pub use store::{RecordStore, StoreConfig, StoreOptions, ROOT_ENV_VAR};
pub use types::*;
