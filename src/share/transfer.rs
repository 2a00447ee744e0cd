use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::error::TransferError;
use super::peers::{PeerBook, PeerEntry};
use crate::constants::{FILE_BLOCK_SIZE, HASH_SIZE};
use crate::hash_tree::{CheckOutcome, ContentId, HashTree, Verdict};
use crate::scheduler::{
    BlockScheduler, ConnectionId, Coverage, DownloadSubscription, UploadSubscription,
};
use crate::storage::{BlobId, BlobStore};
use crate::wire::BlockKind;

/// Outcome of writing a received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Verified and stored.
    Good,
    /// Failed verification; nothing was stored.
    Bad,
    /// Already held or being written by another connection.
    Late,
}

/// A block the scheduler chose for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextRequest {
    pub block_num: u64,
    /// Payload size of the expected `block` response.
    pub block_size: usize,
}

/// Progress summary of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatus {
    pub tree_percent: u32,
    pub file_percent: u32,
    pub downloading_from: usize,
    pub uploading_to: usize,
}

/// A connection's registration as a downloader of a transfer.
///
/// Dropping it releases the connection's outstanding requests.
#[derive(Debug)]
pub struct DownloadRegistration {
    tree: DownloadSubscription,
    _file: DownloadSubscription,
    _peer: PeerEntry,
}

impl DownloadRegistration {
    pub fn connection(&self) -> ConnectionId {
        self.tree.connection()
    }
}

/// A connection's registration as an uploader of a transfer.
#[derive(Debug)]
pub struct UploadRegistration {
    tree: UploadSubscription,
    _file: UploadSubscription,
    _peer: PeerEntry,
}

impl UploadRegistration {
    pub fn connection(&self) -> ConnectionId {
        self.tree.connection()
    }
}

/// Everything needed to move one file between peers.
///
/// A transfer owns the file's hash tree, the blob holding its payload and two
/// schedulers, one over tree blocks and one over file blocks. A tree block
/// becomes requestable once the block holding its hash is held, and a file
/// block once the leaf tree block holding its hash is held.
pub struct Transfer {
    tree: HashTree,
    payloads: Arc<dyn BlobStore>,
    payload: BlobId,
    tree_blocks: Arc<BlockScheduler>,
    file_blocks: Arc<BlockScheduler>,
    writing: Mutex<HashSet<(BlockKind, u64)>>,
    peers: Arc<Mutex<PeerBook>>,
}

impl Transfer {
    /// Creates a transfer for content we hold entirely.
    pub(super) fn seeded(tree: HashTree, payloads: Arc<dyn BlobStore>, payload: BlobId) -> Self {
        let transfer = Self::new(tree, payloads, payload);
        transfer.tree_blocks.mark_local_all();
        transfer.tree_blocks.approve_all();
        transfer.file_blocks.mark_local_all();
        transfer.file_blocks.approve_all();
        transfer
    }

    /// Creates a transfer to download into a fresh payload blob.
    ///
    /// Tree blocks already stored and verified are picked up, so an
    /// interrupted tree download resumes where it stopped.
    pub(super) fn download(
        tree: HashTree,
        payloads: Arc<dyn BlobStore>,
        payload: BlobId,
    ) -> Result<Self, TransferError> {
        let transfer = Self::new(tree, payloads, payload);
        transfer.tree_blocks.approve_block(0)?;

        match transfer.tree.scan()? {
            Coverage::Complete => {
                transfer.tree_blocks.mark_local_all();
                transfer.tree_blocks.approve_all();
                transfer.file_blocks.approve_all();
            }
            Coverage::Partial(held) => {
                for block in 0..held.len() {
                    if held.has(block) {
                        transfer.tree_blocks.mark_local_complete(block)?;
                        transfer.approve_children(block)?;
                    }
                }
            }
        }
        Ok(transfer)
    }

    fn new(tree: HashTree, payloads: Arc<dyn BlobStore>, payload: BlobId) -> Self {
        let tree_blocks = Arc::new(BlockScheduler::new(tree.tree_block_count()));
        let file_blocks = Arc::new(BlockScheduler::new(tree.file_block_count()));
        Self {
            tree,
            payloads,
            payload,
            tree_blocks,
            file_blocks,
            writing: Mutex::new(HashSet::new()),
            peers: Arc::new(Mutex::new(PeerBook::default())),
        }
    }

    pub fn id(&self) -> ContentId {
        self.tree.id()
    }

    pub fn file_size(&self) -> u64 {
        self.tree.file_size()
    }

    pub fn tree_block_count(&self) -> u64 {
        self.tree.tree_block_count()
    }

    pub fn file_block_count(&self) -> u64 {
        self.tree.file_block_count()
    }

    pub fn block_count(&self, kind: BlockKind) -> u64 {
        self.scheduler(kind).block_count()
    }

    pub fn hash_tree(&self) -> &HashTree {
        &self.tree
    }

    pub(super) fn payload_blob(&self) -> BlobId {
        self.payload
    }

    pub fn root_hash(&self) -> Result<[u8; HASH_SIZE], TransferError> {
        Ok(self.tree.root_hash()?)
    }

    /// True once every tree block and file block is held.
    pub fn complete(&self) -> bool {
        self.tree_blocks.is_complete() && self.file_blocks.is_complete()
    }

    pub fn percent_complete(&self) -> u32 {
        self.file_blocks.percent_complete()
    }

    pub fn status(&self) -> TransferStatus {
        TransferStatus {
            tree_percent: self.tree_blocks.percent_complete(),
            file_percent: self.file_blocks.percent_complete(),
            downloading_from: self.file_blocks.download_count(),
            uploading_to: self.file_blocks.upload_count(),
        }
    }

    /// Registers a peer we download from.
    ///
    /// `tree` and `file` are the coverages the peer announced in its slot
    /// grant; `remote_listen` is where the peer accepts connections.
    pub fn download_reg(
        &self,
        connection: ConnectionId,
        remote_listen: Option<SocketAddr>,
        tree: Coverage,
        file: Coverage,
    ) -> Result<DownloadRegistration, TransferError> {
        let tree = self.tree_blocks.subscribe_outgoing(connection, tree)?;
        let file = self.file_blocks.subscribe_outgoing(connection, file)?;
        Ok(DownloadRegistration {
            tree,
            _file: file,
            _peer: PeerEntry::register(&self.peers, connection, remote_listen, false),
        })
    }

    /// Registers a peer we upload to.
    ///
    /// Returns the registration with the tree and file coverage to announce
    /// in the slot grant. Queued have announcements are signalled on `tick`.
    pub fn upload_reg(
        &self,
        connection: ConnectionId,
        remote_listen: Option<SocketAddr>,
        tick: UnboundedSender<ConnectionId>,
    ) -> Result<(UploadRegistration, Coverage, Coverage), TransferError> {
        let (tree, tree_coverage) = self
            .tree_blocks
            .subscribe_incoming(connection, tick.clone())?;
        let (file, file_coverage) = self.file_blocks.subscribe_incoming(connection, tick)?;
        let registration = UploadRegistration {
            tree,
            _file: file,
            _peer: PeerEntry::register(&self.peers, connection, remote_listen, true),
        };
        Ok((registration, tree_coverage, file_coverage))
    }

    pub fn next_request_tree(&self, connection: ConnectionId) -> Option<NextRequest> {
        let block_num = self.tree_blocks.next_request(connection)?;
        let block_size = self.tree.layout().tree_block_size(block_num)?;
        Some(NextRequest {
            block_num,
            block_size,
        })
    }

    pub fn next_request_file(&self, connection: ConnectionId) -> Option<NextRequest> {
        let block_num = self.file_blocks.next_request(connection)?;
        let block_size = self.tree.layout().file_block_size(block_num)?;
        Some(NextRequest {
            block_num,
            block_size,
        })
    }

    /// Verifies and stores a tree block received from `connection`.
    pub fn write_tree_block(
        &self,
        connection: ConnectionId,
        block: u64,
        data: &[u8],
    ) -> Result<WriteStatus, TransferError> {
        let Some(_guard) = self.begin_write(BlockKind::Tree, block) else {
            return Ok(WriteStatus::Late);
        };

        if self.tree.write_block(block, data)? == Verdict::Bad {
            warn!(content = %self.id(), block, %connection, "tree block failed verification");
            return Ok(WriteStatus::Bad);
        }
        self.tree_blocks.mark_local_complete_by(connection, block)?;
        self.approve_children(block)?;

        if self.tree_blocks.is_complete() {
            match self.tree.check()? {
                CheckOutcome::Good => {
                    info!(content = %self.id(), "hash tree complete");
                    self.file_blocks.approve_all();
                }
                CheckOutcome::Bad(bad) => {
                    warn!(content = %self.id(), block = bad, "complete hash tree failed check");
                }
            }
        }
        Ok(WriteStatus::Good)
    }

    /// Verifies and stores a file block received from `connection`.
    pub fn write_file_block(
        &self,
        connection: ConnectionId,
        block: u64,
        data: &[u8],
    ) -> Result<WriteStatus, TransferError> {
        let Some(_guard) = self.begin_write(BlockKind::File, block) else {
            return Ok(WriteStatus::Late);
        };

        if self.tree.check_file_block(block, data)? == Verdict::Bad {
            warn!(content = %self.id(), block, %connection, "file block failed verification");
            return Ok(WriteStatus::Bad);
        }
        self.payloads
            .write(self.payload, block * FILE_BLOCK_SIZE, data)?;
        self.file_blocks.mark_local_complete_by(connection, block)?;

        if self.file_blocks.is_complete() {
            info!(content = %self.id(), "file complete");
        }
        Ok(WriteStatus::Good)
    }

    pub fn read_tree_block(&self, block: u64) -> Result<Bytes, TransferError> {
        if !self.tree_blocks.have_block(block) {
            return Err(TransferError::NotHeld {
                kind: BlockKind::Tree,
                block,
            });
        }
        Ok(self.tree.read_block(block)?)
    }

    pub fn read_file_block(&self, block: u64) -> Result<Bytes, TransferError> {
        let len = match self.tree.layout().file_block_size(block) {
            Some(len) if self.file_blocks.have_block(block) => len,
            _ => {
                return Err(TransferError::NotHeld {
                    kind: BlockKind::File,
                    block,
                })
            }
        };
        Ok(self
            .payloads
            .read(self.payload, block * FILE_BLOCK_SIZE, len)?)
    }

    pub fn read_block(&self, kind: BlockKind, block: u64) -> Result<Bytes, TransferError> {
        match kind {
            BlockKind::Tree => self.read_tree_block(block),
            BlockKind::File => self.read_file_block(block),
        }
    }

    pub fn write_block(
        &self,
        kind: BlockKind,
        connection: ConnectionId,
        block: u64,
        data: &[u8],
    ) -> Result<WriteStatus, TransferError> {
        match kind {
            BlockKind::Tree => self.write_tree_block(connection, block, data),
            BlockKind::File => self.write_file_block(connection, block, data),
        }
    }

    /// Records a have announcement from a peer we download from.
    pub fn recv_have(
        &self,
        kind: BlockKind,
        connection: ConnectionId,
        block: u64,
    ) -> Result<(), TransferError> {
        Ok(self.scheduler(kind).mark_remote_complete(connection, block)?)
    }

    pub fn recv_have_tree(&self, connection: ConnectionId, block: u64) -> Result<(), TransferError> {
        self.recv_have(BlockKind::Tree, connection, block)
    }

    pub fn recv_have_file(&self, connection: ConnectionId, block: u64) -> Result<(), TransferError> {
        self.recv_have(BlockKind::File, connection, block)
    }

    pub fn next_have_tree(&self, connection: ConnectionId) -> Option<u64> {
        self.tree_blocks.next_have(connection)
    }

    pub fn next_have_file(&self, connection: ConnectionId) -> Option<u64> {
        self.file_blocks.next_have(connection)
    }

    /// Pops the next peer endpoint to announce to an upload peer.
    pub fn next_peer(&self, connection: ConnectionId) -> Option<SocketAddr> {
        self.peers.lock().next_peer(connection)
    }

    /// Makes a block requestable again after a failed or abandoned request.
    pub fn force_rerequest(&self, kind: BlockKind, block: u64) {
        self.scheduler(kind).force_rerequest(block);
    }

    /// Blocks of `kind` with an outstanding request from `connection`.
    pub fn inflight_for(&self, kind: BlockKind, connection: ConnectionId) -> Vec<u64> {
        self.scheduler(kind).inflight_for(connection)
    }

    /// Releases requests older than `timeout` on both schedulers.
    pub fn expire_requests(&self, timeout: Duration) {
        let tree = self.tree_blocks.expire_requests(timeout);
        let file = self.file_blocks.expire_requests(timeout);
        if !tree.is_empty() || !file.is_empty() {
            debug!(content = %self.id(), tree = tree.len(), file = file.len(), "requests timed out");
        }
    }

    fn scheduler(&self, kind: BlockKind) -> &BlockScheduler {
        match kind {
            BlockKind::Tree => self.tree_blocks.as_ref(),
            BlockKind::File => self.file_blocks.as_ref(),
        }
    }

    fn approve_children(&self, block: u64) -> Result<(), TransferError> {
        let layout = self.tree.layout();
        if let Some(children) = layout.tree_block_children(block) {
            for child in children {
                self.tree_blocks.approve_block(child)?;
            }
        } else if let Some(children) = layout.file_block_children(block) {
            for child in children {
                self.file_blocks.approve_block(child)?;
            }
        }
        Ok(())
    }

    /// Claims `(kind, block)` for writing unless it is held or already
    /// being written.
    fn begin_write(&self, kind: BlockKind, block: u64) -> Option<WriteGuard<'_>> {
        if self.scheduler(kind).have_block(block) {
            return None;
        }
        if !self.writing.lock().insert((kind, block)) {
            return None;
        }
        Some(WriteGuard {
            writing: &self.writing,
            key: (kind, block),
        })
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id())
            .field("file_size", &self.file_size())
            .field("status", &self.status())
            .finish()
    }
}

struct WriteGuard<'a> {
    writing: &'a Mutex<HashSet<(BlockKind, u64)>>,
    key: (BlockKind, u64),
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.writing.lock().remove(&self.key);
    }
}
