use std::fs::File;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::content_id::ContentId;
use super::error::HashTreeError;
use super::layout::TreeLayout;
use super::tree::{sha1, HashTree};
use crate::constants::{FILE_BLOCK_SIZE, HASH_SIZE, SOURCE_PROBE_INTERVAL};
use crate::storage::{BlobId, BlobStore, HashIndex, StorageError, TreeState};

/// A readable source whose current length can be probed while it is read.
pub trait TreeSource: Read {
    fn current_len(&self) -> io::Result<u64>;
}

impl TreeSource for File {
    fn current_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl<T: AsRef<[u8]>> TreeSource for Cursor<T> {
    fn current_len(&self) -> io::Result<u64> {
        Ok(self.get_ref().as_ref().len() as u64)
    }
}

/// Builds hash trees from local files.
///
/// Leaf hashes and inner rows are computed in a scratch blob, then copied
/// into the [`HashIndex`] under the resulting [`ContentId`]. If a tree is
/// already stored under that id the new one is discarded. On any failure
/// nothing is left behind.
pub struct TreeBuilder {
    index: Arc<HashIndex>,
    cancel: Option<Arc<AtomicBool>>,
    probe_interval: Duration,
}

impl TreeBuilder {
    pub fn new(index: Arc<HashIndex>) -> Self {
        Self {
            index,
            cancel: None,
            probe_interval: SOURCE_PROBE_INTERVAL,
        }
    }

    /// Aborts creation with [`HashTreeError::Cancelled`] once `flag` is set.
    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// How often the source length is re-checked.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Hashes `file_size` bytes of `source` and stores the resulting tree.
    pub fn create(
        &self,
        source: &mut impl TreeSource,
        file_size: u64,
    ) -> Result<HashTree, HashTreeError> {
        if file_size == 0 {
            return Err(HashTreeError::EmptyFile);
        }
        self.probe(&*source, file_size)?;

        let layout = TreeLayout::new(file_size);
        let store = self.index.store();
        let scratch = Scratch::new(store.as_ref(), layout.tree_size())?;

        let mut buf = vec![0u8; FILE_BLOCK_SIZE as usize];
        let mut last_probe = Instant::now();
        for block in 0..layout.file_block_count() {
            self.check_cancelled()?;
            if last_probe.elapsed() >= self.probe_interval {
                self.probe(&*source, file_size)?;
                last_probe = Instant::now();
            }

            let len = layout
                .file_block_size(block)
                .ok_or(HashTreeError::BlockOutOfRange(block))?;
            read_source(source, &mut buf[..len], file_size)?;
            store.write(scratch.blob, layout.file_hash_position(block), &sha1(&buf[..len]))?;
        }

        for block in (1..layout.tree_block_count()).rev() {
            let info = layout
                .block_info(block)
                .ok_or(HashTreeError::BlockOutOfRange(block))?;
            let Some(parent) = info.parent else {
                continue;
            };
            let data = store.read(scratch.blob, info.offset, info.len)?;
            store.write(scratch.blob, parent, &sha1(&data))?;
        }

        let mut root = [0u8; HASH_SIZE];
        root.copy_from_slice(&store.read(scratch.blob, 0, HASH_SIZE)?);
        let id = ContentId::compute(file_size, &root);

        // `owned` is false when a download reserved the tree; its verified
        // blocks are a prefix of what was just built, so the whole tree is
        // written over it.
        let (record, owned) = match self.index.find(&id) {
            Some(record) if record.state == TreeState::Complete => {
                debug!(content = %id, "hash tree already stored");
                return HashTree::open(Arc::clone(&self.index), id, file_size);
            }
            Some(record) => {
                debug!(content = %id, "completing partially downloaded hash tree");
                (record, false)
            }
            None => match self.index.add(id, layout.tree_size()) {
                Ok(record) => (record, true),
                Err(StorageError::AlreadyExists(_)) => {
                    let record = self.index.find(&id).ok_or(StorageError::NotFound(id))?;
                    (record, false)
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

        if let Err(e) = self.copy(scratch.blob, record.blob, layout.tree_size()) {
            if owned {
                if let Err(remove) = self.index.remove(&id) {
                    warn!(content = %id, error = %remove, "failed to discard partial tree");
                }
            }
            return Err(e);
        }
        self.index.set_state(&id, TreeState::Complete)?;

        info!(content = %id, file_size, "created hash tree");
        HashTree::open(Arc::clone(&self.index), id, file_size)
    }

    fn copy(&self, from: BlobId, to: BlobId, size: u64) -> Result<(), HashTreeError> {
        let store = self.index.store();
        let mut offset = 0;
        while offset < size {
            self.check_cancelled()?;
            let len = FILE_BLOCK_SIZE.min(size - offset) as usize;
            let data = store.read(from, offset, len)?;
            store.write(to, offset, &data)?;
            offset += len as u64;
        }
        Ok(())
    }

    fn probe(&self, source: &impl TreeSource, file_size: u64) -> Result<(), HashTreeError> {
        let actual = source.current_len()?;
        if actual != file_size {
            warn!(expected = file_size, actual, "source changed during hashing");
            return Err(HashTreeError::SourceChanged {
                expected: file_size,
                actual,
            });
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), HashTreeError> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(HashTreeError::Cancelled),
            _ => Ok(()),
        }
    }
}

fn read_source(source: &mut impl TreeSource, buf: &mut [u8], file_size: u64) -> Result<(), HashTreeError> {
    match source.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(HashTreeError::SourceChanged {
            expected: file_size,
            actual: source.current_len()?,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Scratch blob removed when dropped.
struct Scratch<'a> {
    store: &'a dyn BlobStore,
    blob: BlobId,
}

impl<'a> Scratch<'a> {
    fn new(store: &'a dyn BlobStore, size: u64) -> Result<Self, StorageError> {
        Ok(Self {
            store,
            blob: store.allocate(size)?,
        })
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.remove(self.blob) {
            warn!(blob = %self.blob, error = %e, "failed to remove scratch blob");
        }
    }
}
