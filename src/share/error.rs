use thiserror::Error;

use crate::hash_tree::{ContentId, HashTreeError};
use crate::scheduler::SchedulerError;
use crate::storage::StorageError;
use crate::wire::BlockKind;

/// Errors that can occur while sharing or transferring content.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("hash tree error: {0}")]
    HashTree(#[from] HashTreeError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// A file size and root hash that do not produce the content id, or
    /// that differ from values already known.
    #[error("file size and root hash do not match content {0}")]
    ContentMismatch(ContentId),

    /// A block was requested that we do not hold.
    #[error("{kind:?} block {block} not held")]
    NotHeld { kind: BlockKind, block: u64 },

    /// The source file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
