use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::blob::{check_bounds, BlobId, BlobStore};
use super::error::StorageError;

/// Blob store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<BlobId, RwLock<Vec<u8>>>,
    next_id: AtomicU64,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live blobs.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn allocate(&self, size: u64) -> Result<BlobId, StorageError> {
        let len = usize::try_from(size).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::OutOfMemory, "blob too large")
        })?;
        let id = BlobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.blobs.insert(id, RwLock::new(vec![0; len]));
        Ok(id)
    }

    fn read(&self, blob: BlobId, offset: u64, len: usize) -> Result<Bytes, StorageError> {
        let entry = self.blobs.get(&blob).ok_or(StorageError::UnknownBlob(blob))?;
        let data = entry.read();
        check_bounds(blob, offset, len as u64, data.len() as u64)?;
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&data[start..start + len]))
    }

    fn write(&self, blob: BlobId, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        let entry = self.blobs.get(&blob).ok_or(StorageError::UnknownBlob(blob))?;
        let mut data = entry.write();
        check_bounds(blob, offset, bytes.len() as u64, data.len() as u64)?;
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn size(&self, blob: BlobId) -> Result<u64, StorageError> {
        let entry = self.blobs.get(&blob).ok_or(StorageError::UnknownBlob(blob))?;
        let size = entry.read().len() as u64;
        Ok(size)
    }

    fn remove(&self, blob: BlobId) -> Result<(), StorageError> {
        self.blobs
            .remove(&blob)
            .map(|_| ())
            .ok_or(StorageError::UnknownBlob(blob))
    }
}
