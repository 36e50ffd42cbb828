//! In-memory record index, rebuilt from the log on open.

use crate::types::{Hash, RecordId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Index over the record log.
#[derive(Default)]
pub struct RecordIndex {
    /// Record ID to log offset.
    offsets: RwLock<BTreeMap<RecordId, u64>>,

    /// Value digest to the records holding that value, oldest first.
    by_digest: RwLock<HashMap<Hash, Vec<RecordId>>>,
}

impl RecordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry to the index.
    pub fn add(&self, id: RecordId, offset: u64, digest: Hash) {
        self.offsets.write().insert(id, offset);
        self.by_digest.write().entry(digest).or_default().push(id);
    }

    /// Offsets of records whose value hashes to `digest`, oldest first.
    pub fn candidates(&self, digest: &Hash) -> Vec<u64> {
        let ids = match self.by_digest.read().get(digest) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        let offsets = self.offsets.read();
        ids.iter().filter_map(|id| offsets.get(id).copied()).collect()
    }

    pub fn count(&self) -> usize {
        self.offsets.read().len()
    }

    pub fn clear(&self) {
        self.offsets.write().clear();
        self.by_digest.write().clear();
    }
}
