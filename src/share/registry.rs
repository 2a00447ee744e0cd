use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::error::TransferError;
use super::transfer::Transfer;
use crate::constants::{FILE_BLOCK_SIZE, HASH_SIZE};
use crate::hash_tree::{ContentId, HashTree, TreeBuilder, TreeSource, Verdict};
use crate::storage::{BlobId, BlobStore, HashIndex};

/// One entry of the [`Share`]: content known by id, possibly before its
/// size and root hash are.
pub struct SharedFile {
    id: ContentId,
    index: Arc<HashIndex>,
    payloads: Arc<dyn BlobStore>,
    transfer: RwLock<Option<Arc<Transfer>>>,
    removed: AtomicBool,
}

impl SharedFile {
    fn new(id: ContentId, index: Arc<HashIndex>, payloads: Arc<dyn BlobStore>) -> Self {
        Self {
            id,
            index,
            payloads,
            transfer: RwLock::new(None),
            removed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ContentId {
        self.id
    }

    /// The transfer, once size and root hash are known.
    pub fn transfer(&self) -> Option<Arc<Transfer>> {
        self.transfer.read().clone()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// True if the content is fully held.
    pub fn complete(&self) -> bool {
        self.transfer().is_some_and(|transfer| transfer.complete())
    }

    /// Supplies the size and root hash learned from a `slot` message.
    ///
    /// The first call instantiates the transfer: the hash tree is opened (or
    /// reserved), the root hash is stored as tree block 0 and a payload blob
    /// is allocated. Later calls must agree with the known values.
    pub fn set_unknown(
        &self,
        file_size: u64,
        root_hash: &[u8; HASH_SIZE],
    ) -> Result<Arc<Transfer>, TransferError> {
        if ContentId::compute(file_size, root_hash) != self.id {
            return Err(TransferError::ContentMismatch(self.id));
        }

        let mut slot = self.transfer.write();
        if let Some(transfer) = slot.as_ref() {
            if transfer.file_size() != file_size || &transfer.root_hash()? != root_hash {
                return Err(TransferError::ContentMismatch(self.id));
            }
            return Ok(Arc::clone(transfer));
        }

        let tree = HashTree::open(Arc::clone(&self.index), self.id, file_size)?;
        if tree.write_block(0, root_hash)? != Verdict::Good {
            return Err(TransferError::ContentMismatch(self.id));
        }
        let payload = self.payloads.allocate(file_size)?;
        let transfer = match Transfer::download(tree, Arc::clone(&self.payloads), payload) {
            Ok(transfer) => Arc::new(transfer),
            Err(e) => {
                let _ = self.payloads.remove(payload);
                return Err(e);
            }
        };

        debug!(content = %self.id, file_size, "transfer instantiated");
        *slot = Some(Arc::clone(&transfer));
        Ok(transfer)
    }
}

impl std::fmt::Debug for SharedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFile")
            .field("id", &self.id)
            .field("transfer", &self.transfer())
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// Registry of all content this node shares or downloads.
pub struct Share {
    index: Arc<HashIndex>,
    payloads: Arc<dyn BlobStore>,
    files: DashMap<ContentId, Arc<SharedFile>>,
}

impl Share {
    /// Creates a registry storing hash trees in `index` and payloads in
    /// `payloads`.
    pub fn new(index: Arc<HashIndex>, payloads: Arc<dyn BlobStore>) -> Self {
        Self {
            index,
            payloads,
            files: DashMap::new(),
        }
    }

    pub fn index(&self) -> &Arc<HashIndex> {
        &self.index
    }

    /// Shares a local file.
    ///
    /// Builds (or reuses) its hash tree, copies the payload into a blob and
    /// registers a complete transfer. Sharing content that is already
    /// registered returns the existing entry.
    pub fn add_source<S: TreeSource + Seek>(
        &self,
        source: &mut S,
        file_size: u64,
    ) -> Result<Arc<SharedFile>, TransferError> {
        source.seek(SeekFrom::Start(0))?;
        let tree = TreeBuilder::new(Arc::clone(&self.index)).create(source, file_size)?;
        let id = tree.id();
        if let Some(existing) = self.find(&id).filter(|file| file.complete()) {
            return Ok(existing);
        }

        let payload = self.payloads.allocate(file_size)?;
        if let Err(e) = self.copy_payload(source, payload, file_size) {
            let _ = self.payloads.remove(payload);
            return Err(e);
        }

        let file = Arc::new(SharedFile::new(
            id,
            Arc::clone(&self.index),
            Arc::clone(&self.payloads),
        ));
        *file.transfer.write() = Some(Arc::new(Transfer::seeded(
            tree,
            Arc::clone(&self.payloads),
            payload,
        )));

        // Replaces a partial download of the same content.
        self.files.insert(id, Arc::clone(&file));
        info!(content = %id, file_size, "sharing file");
        Ok(file)
    }

    /// Registers content to download, known only by id.
    pub fn add_download(&self, id: ContentId) -> Arc<SharedFile> {
        let entry = self.files.entry(id).or_insert_with(|| {
            Arc::new(SharedFile::new(
                id,
                Arc::clone(&self.index),
                Arc::clone(&self.payloads),
            ))
        });
        entry.removed.store(false, Ordering::Release);
        Arc::clone(entry.value())
    }

    /// Looks up registered content. Removed entries are not returned.
    pub fn find(&self, id: &ContentId) -> Option<Arc<SharedFile>> {
        self.files
            .get(id)
            .filter(|file| !file.is_removed())
            .map(|file| Arc::clone(file.value()))
    }

    /// Marks content as no longer shared.
    ///
    /// Storage is released by [`garbage_collect`](Self::garbage_collect) once
    /// no connection uses the transfer.
    pub fn remove(&self, id: &ContentId) {
        if let Some(file) = self.files.get(id) {
            file.removed.store(true, Ordering::Release);
        }
    }

    pub fn len(&self) -> usize {
        self.files.iter().filter(|file| !file.is_removed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops removed entries nobody references any more, freeing their
    /// payload and, for incomplete content, their partial hash tree.
    pub fn garbage_collect(&self) {
        let mut collected = Vec::new();
        self.files.retain(|_, file| {
            if !file.is_removed() || Arc::strong_count(file) > 1 {
                return true;
            }
            let transfer = file.transfer.read().clone();
            match transfer {
                Some(transfer) if Arc::strong_count(&transfer) > 2 => true,
                other => {
                    collected.push((file.id, other));
                    false
                }
            }
        });

        for (id, transfer) in collected {
            if let Some(transfer) = transfer {
                if let Err(e) = self.payloads.remove(transfer.payload_blob()) {
                    warn!(content = %id, error = %e, "failed to free payload");
                }
                if !transfer.hash_tree().is_complete() {
                    if let Err(e) = self.index.remove(&id) {
                        warn!(content = %id, error = %e, "failed to free partial hash tree");
                    }
                }
            }
            debug!(content = %id, "collected");
        }
    }

    fn copy_payload<S: Read + Seek>(
        &self,
        source: &mut S,
        payload: BlobId,
        file_size: u64,
    ) -> Result<(), TransferError> {
        source.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; FILE_BLOCK_SIZE as usize];
        let mut offset = 0;
        while offset < file_size {
            let len = FILE_BLOCK_SIZE.min(file_size - offset) as usize;
            source.read_exact(&mut buf[..len])?;
            self.payloads.write(payload, offset, &buf[..len])?;
            offset += len as u64;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("files", &self.files.len())
            .finish()
    }
}
