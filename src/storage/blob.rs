use std::fmt;

use bytes::Bytes;

use super::error::StorageError;

/// Handle to a fixed-size byte blob owned by a [`BlobStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(pub u64);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Random access storage for hash trees and downloaded payloads.
///
/// Blobs are allocated at their final size and zero filled. Reads and writes
/// must lie entirely inside the blob.
pub trait BlobStore: Send + Sync {
    /// Reserves a new zero-filled blob of `size` bytes.
    fn allocate(&self, size: u64) -> Result<BlobId, StorageError>;

    fn read(&self, blob: BlobId, offset: u64, len: usize) -> Result<Bytes, StorageError>;

    fn write(&self, blob: BlobId, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    fn size(&self, blob: BlobId) -> Result<u64, StorageError>;

    /// Frees a blob. Removing an unknown blob is an error.
    fn remove(&self, blob: BlobId) -> Result<(), StorageError>;
}

pub(super) fn check_bounds(
    blob: BlobId,
    offset: u64,
    len: u64,
    size: u64,
) -> Result<(), StorageError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(StorageError::OutOfBounds {
            blob,
            offset,
            len,
            size,
        }),
    }
}
