use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::blob::{BlobId, BlobStore};
use super::error::StorageError;
use crate::hash_tree::ContentId;

/// Whether a stored hash tree has been fully verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    /// Reserved and partially filled by a download.
    Downloading,
    /// Every block verified in order.
    Complete,
}

/// Location and state of one stored hash tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRecord {
    pub blob: BlobId,
    pub size: u64,
    pub state: TreeState,
}

/// Content addressed store of hash trees.
///
/// At most one tree exists per [`ContentId`]; its bytes live in a blob of
/// the underlying [`BlobStore`].
pub struct HashIndex {
    store: Arc<dyn BlobStore>,
    trees: DashMap<ContentId, TreeRecord>,
}

impl HashIndex {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            trees: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn find(&self, id: &ContentId) -> Option<TreeRecord> {
        self.trees.get(id).map(|record| *record)
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.trees.contains_key(id)
    }

    /// Reserves a tree of `size` bytes in state `Downloading`.
    ///
    /// Fails with [`StorageError::AlreadyExists`] if a tree is already stored
    /// under `id`.
    pub fn add(&self, id: ContentId, size: u64) -> Result<TreeRecord, StorageError> {
        match self.trees.entry(id) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                let blob = self.store.allocate(size)?;
                let record = TreeRecord {
                    blob,
                    size,
                    state: TreeState::Downloading,
                };
                slot.insert(record);
                Ok(record)
            }
        }
    }

    pub fn set_state(&self, id: &ContentId, state: TreeState) -> Result<(), StorageError> {
        let mut record = self
            .trees
            .get_mut(id)
            .ok_or(StorageError::NotFound(*id))?;
        record.state = state;
        Ok(())
    }

    /// Deletes the tree stored under `id` and frees its blob.
    pub fn remove(&self, id: &ContentId) -> Result<(), StorageError> {
        let (_, record) = self
            .trees
            .remove(id)
            .ok_or(StorageError::NotFound(*id))?;
        self.store.remove(record.blob)
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}
