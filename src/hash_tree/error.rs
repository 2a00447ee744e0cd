use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur while opening, building or accessing a hash tree.
#[derive(Debug, Error)]
pub enum HashTreeError {
    /// Reading or writing the tree's blob failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Reading the source file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A content id was not 20 bytes or 40 hex digits.
    #[error("invalid content id: {0}")]
    InvalidContentId(String),

    /// Empty files have no hash tree.
    #[error("empty file has no hash tree")]
    EmptyFile,

    /// A stored tree exists but its size does not match the file size.
    #[error("stored tree is {stored} bytes, expected {expected}")]
    SizeMismatch { stored: u64, expected: u64 },

    #[error("tree block {0} out of range")]
    BlockOutOfRange(u64),

    #[error("block {block} is {actual} bytes, expected {expected}")]
    BlockSize {
        block: u64,
        expected: usize,
        actual: usize,
    },

    /// The source changed size while its tree was being built. Retry later.
    #[error("source changed size during hashing (expected {expected}, now {actual})")]
    SourceChanged { expected: u64, actual: u64 },

    /// Tree creation was cancelled.
    #[error("tree creation cancelled")]
    Cancelled,
}
