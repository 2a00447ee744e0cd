use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::blob::{check_bounds, BlobId, BlobStore};
use super::error::StorageError;

struct BlobFile {
    file: Mutex<File>,
    size: u64,
}

/// Blob store keeping one file per blob in a directory.
///
/// Blob files are created on allocation and deleted on removal. Files left
/// behind by an earlier process are not adopted.
pub struct DiskBlobStore {
    dir: PathBuf,
    files: DashMap<BlobId, Arc<BlobFile>>,
    next_id: AtomicU64,
}

impl DiskBlobStore {
    /// Opens a store in `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: DashMap::new(),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, blob: BlobId) -> PathBuf {
        self.dir.join(format!("{:016x}.blob", blob.0))
    }

    fn get(&self, blob: BlobId) -> Result<Arc<BlobFile>, StorageError> {
        self.files
            .get(&blob)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StorageError::UnknownBlob(blob))
    }
}

impl BlobStore for DiskBlobStore {
    fn allocate(&self, size: u64) -> Result<BlobId, StorageError> {
        let id = BlobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path(id))?;
        file.set_len(size)?;

        self.files.insert(
            id,
            Arc::new(BlobFile {
                file: Mutex::new(file),
                size,
            }),
        );
        trace!(blob = id.0, size, "allocated blob file");
        Ok(id)
    }

    fn read(&self, blob: BlobId, offset: u64, len: usize) -> Result<Bytes, StorageError> {
        let entry = self.get(blob)?;
        check_bounds(blob, offset, len as u64, entry.size)?;

        let mut buf = BytesMut::zeroed(len);
        let mut file = entry.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf.freeze())
    }

    fn write(&self, blob: BlobId, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let entry = self.get(blob)?;
        check_bounds(blob, offset, data.len() as u64, entry.size)?;

        let mut file = entry.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn size(&self, blob: BlobId) -> Result<u64, StorageError> {
        Ok(self.get(blob)?.size)
    }

    fn remove(&self, blob: BlobId) -> Result<(), StorageError> {
        self.files
            .remove(&blob)
            .ok_or(StorageError::UnknownBlob(blob))?;
        fs::remove_file(self.path(blob))?;
        Ok(())
    }
}
