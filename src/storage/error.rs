use thiserror::Error;

use super::BlobId;
use crate::hash_tree::ContentId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown blob: {0}")]
    UnknownBlob(BlobId),

    #[error("access of {len} bytes at offset {offset} outside blob {blob} of size {size}")]
    OutOfBounds {
        blob: BlobId,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("hash tree already stored: {0}")]
    AlreadyExists(ContentId),

    #[error("hash tree not found: {0}")]
    NotFound(ContentId),
}
