use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use super::content_id::ContentId;
use super::error::HashTreeError;
use super::layout::TreeLayout;
use crate::constants::HASH_SIZE;
use crate::scheduler::{Bitfield, Coverage};
use crate::storage::{BlobId, HashIndex, StorageError, TreeState};

/// Result of verifying one block against the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Good,
    Bad,
}

/// Result of verifying a whole tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Good,
    /// The first tree block that failed verification.
    Bad(u64),
}

/// The hash tree of one file, stored in a [`HashIndex`] blob.
///
/// Tree blocks are verified top down: block 0 against the [`ContentId`],
/// every other block against the hash stored at its parent offset. Writes are
/// verified before anything is persisted, so a bad block can never overwrite
/// good data.
pub struct HashTree {
    id: ContentId,
    layout: TreeLayout,
    index: Arc<HashIndex>,
    blob: BlobId,
}

impl HashTree {
    /// Opens the stored tree for `id`, reserving space for it if none exists.
    ///
    /// A stored tree whose size disagrees with `file_size` is rejected.
    pub fn open(index: Arc<HashIndex>, id: ContentId, file_size: u64) -> Result<Self, HashTreeError> {
        if file_size == 0 {
            return Err(HashTreeError::EmptyFile);
        }
        let layout = TreeLayout::new(file_size);

        let record = match index.find(&id) {
            Some(record) => record,
            None => match index.add(id, layout.tree_size()) {
                Ok(record) => record,
                Err(StorageError::AlreadyExists(_)) => {
                    index.find(&id).ok_or(StorageError::NotFound(id))?
                }
                Err(e) => return Err(e.into()),
            },
        };

        if record.size != layout.tree_size() {
            return Err(HashTreeError::SizeMismatch {
                stored: record.size,
                expected: layout.tree_size(),
            });
        }

        Ok(Self {
            id,
            layout,
            index,
            blob: record.blob,
        })
    }

    pub fn id(&self) -> ContentId {
        self.id
    }

    pub fn layout(&self) -> &TreeLayout {
        &self.layout
    }

    pub fn file_size(&self) -> u64 {
        self.layout.file_size()
    }

    pub fn tree_block_count(&self) -> u64 {
        self.layout.tree_block_count()
    }

    pub fn file_block_count(&self) -> u64 {
        self.layout.file_block_count()
    }

    /// True once [`check`](Self::check) has verified every block.
    pub fn is_complete(&self) -> bool {
        self.index
            .find(&self.id)
            .is_some_and(|record| record.state == TreeState::Complete)
    }

    /// Reads the root hash (tree block 0).
    pub fn root_hash(&self) -> Result<[u8; HASH_SIZE], HashTreeError> {
        let data = self.read_block(0)?;
        let mut root = [0u8; HASH_SIZE];
        root.copy_from_slice(&data);
        Ok(root)
    }

    pub fn read_block(&self, block: u64) -> Result<Bytes, HashTreeError> {
        let info = self
            .layout
            .block_info(block)
            .ok_or(HashTreeError::BlockOutOfRange(block))?;
        Ok(self.index.store().read(self.blob, info.offset, info.len)?)
    }

    /// Verifies `data` as tree block `block` and persists it if good.
    pub fn write_block(&self, block: u64, data: &[u8]) -> Result<Verdict, HashTreeError> {
        let verdict = self.check_tree_block(block, data)?;
        if verdict == Verdict::Bad {
            debug!(content = %self.id, block, "rejected bad tree block");
            return Ok(Verdict::Bad);
        }
        let info = self
            .layout
            .block_info(block)
            .ok_or(HashTreeError::BlockOutOfRange(block))?;
        self.index.store().write(self.blob, info.offset, data)?;
        Ok(Verdict::Good)
    }

    /// Verifies `data` as tree block `block` without persisting it.
    pub fn check_tree_block(&self, block: u64, data: &[u8]) -> Result<Verdict, HashTreeError> {
        let info = self
            .layout
            .block_info(block)
            .ok_or(HashTreeError::BlockOutOfRange(block))?;
        if data.len() != info.len {
            return Err(HashTreeError::BlockSize {
                block,
                expected: info.len,
                actual: data.len(),
            });
        }

        let Some(parent) = info.parent else {
            let mut root = [0u8; HASH_SIZE];
            root.copy_from_slice(data);
            return Ok(verdict(ContentId::compute(self.file_size(), &root) == self.id));
        };

        let expected = self.index.store().read(self.blob, parent, HASH_SIZE)?;
        Ok(verdict(sha1(data) == expected[..]))
    }

    /// Verifies file block `block` against its leaf hash.
    pub fn check_file_block(&self, block: u64, data: &[u8]) -> Result<Verdict, HashTreeError> {
        let expected_len = self
            .layout
            .file_block_size(block)
            .ok_or(HashTreeError::BlockOutOfRange(block))?;
        if data.len() != expected_len {
            return Err(HashTreeError::BlockSize {
                block,
                expected: expected_len,
                actual: data.len(),
            });
        }

        let position = self.layout.file_hash_position(block);
        let expected = self.index.store().read(self.blob, position, HASH_SIZE)?;
        Ok(verdict(sha1(data) == expected[..]))
    }

    /// Verifies every tree block in order, stopping at the first bad one.
    ///
    /// A fully good tree is marked complete in the index.
    pub fn check(&self) -> Result<CheckOutcome, HashTreeError> {
        for block in 0..self.tree_block_count() {
            let data = self.read_block(block)?;
            if self.check_tree_block(block, &data)? == Verdict::Bad {
                warn!(content = %self.id, block, "hash tree check failed");
                return Ok(CheckOutcome::Bad(block));
            }
        }
        self.index.set_state(&self.id, TreeState::Complete)?;
        Ok(CheckOutcome::Good)
    }

    /// Returns the tree blocks already stored and verified.
    ///
    /// A block counts only if every block on its path to the root does, so
    /// the result is what a resumed download can rely on.
    pub fn scan(&self) -> Result<Coverage, HashTreeError> {
        if self.is_complete() {
            return Ok(Coverage::Complete);
        }

        let count = self.tree_block_count();
        let mut reachable = Bitfield::new(count);
        let mut held = Bitfield::new(count);
        reachable.set(0);

        for block in 0..count {
            if !reachable.has(block) {
                continue;
            }
            let data = self.read_block(block)?;
            if self.check_tree_block(block, &data)? == Verdict::Bad {
                continue;
            }
            held.set(block);
            if let Some(children) = self.layout.tree_block_children(block) {
                for child in children {
                    reachable.set(child);
                }
            }
        }

        Ok(Coverage::from_bitfield(held))
    }
}

impl std::fmt::Debug for HashTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTree")
            .field("id", &self.id)
            .field("file_size", &self.file_size())
            .field("blob", &self.blob)
            .finish()
    }
}

fn verdict(good: bool) -> Verdict {
    if good {
        Verdict::Good
    } else {
        Verdict::Bad
    }
}

pub(super) fn sha1(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}
