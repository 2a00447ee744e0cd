use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

use super::error::SlotError;
use super::exchange::{Bounds, Exchange, Expectation, Outbound};
use crate::constants::{
    DEFAULT_MAX_BLOCK_PIPELINE, HASH_SIZE, MAX_SLOTS, REQUEST_TIMEOUT, TAG_BLOCK, TAG_ERROR,
    TAG_SLOT,
};
use crate::hash_tree::{ContentId, TreeLayout};
use crate::scheduler::{ConnectionId, Coverage};
use crate::share::{
    DownloadRegistration, Share, Transfer, TransferError, UploadRegistration, WriteStatus,
};
use crate::wire::{BlockKind, Message, WireError};

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotConfig {
    /// Block requests in flight per direction.
    pub max_block_pipeline: usize,
    /// Age after which an unanswered block request may go to another peer.
    pub request_timeout: Duration,
    /// Slots per direction, at most 256.
    pub max_slots: usize,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            max_block_pipeline: DEFAULT_MAX_BLOCK_PIPELINE,
            request_timeout: REQUEST_TIMEOUT,
            max_slots: MAX_SLOTS,
        }
    }
}

/// An endpoint learned from a `peer` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAnnouncement {
    pub content_id: ContentId,
    pub endpoint: SocketAddr,
}

struct UploadSlot {
    transfer: Arc<Transfer>,
    _registration: UploadRegistration,
}

struct DownloadSlot {
    transfer: Arc<Transfer>,
    _registration: DownloadRegistration,
}

/// The slot protocol state of one connection.
///
/// The manager is driven by its host: bytes received from the peer go to
/// [`recv`](Self::recv), [`tick`](Self::tick) is called whenever the
/// connection's id arrives on the tick channel or after a `recv`, and
/// [`drain_outbound`](Self::drain_outbound) yields the bytes to write.
///
/// Up to `max_slots` upload slots are granted to the peer and as many
/// download slots requested from it. Slot numbers are chosen by the side
/// granting the slot.
///
/// Dropping the manager tears the connection down: every registration is
/// released, outstanding requests become requestable on other connections
/// and unreferenced storage is collected.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use bytes::BytesMut;
/// use tokio::sync::mpsc::unbounded_channel;
/// use treeshare::share::Share;
/// use treeshare::slot::{SlotConfig, SlotManager};
/// use treeshare::storage::{HashIndex, MemoryBlobStore};
///
/// let store = Arc::new(MemoryBlobStore::new());
/// let share = Arc::new(Share::new(Arc::new(HashIndex::new(store.clone())), store));
/// let (ticks, _tick_rx) = unbounded_channel();
/// let (peers, _peer_rx) = unbounded_channel();
///
/// let mut manager = SlotManager::new(share, SlotConfig::default(), ticks, peers);
/// manager.recv(&mut BytesMut::new()).unwrap();
/// manager.tick();
/// assert!(manager.drain_outbound().is_empty());
/// ```
pub struct SlotManager {
    connection: ConnectionId,
    config: SlotConfig,
    share: Arc<Share>,
    ticks: UnboundedSender<ConnectionId>,
    peers: UnboundedSender<PeerAnnouncement>,
    exchange: Exchange,
    uploads: BTreeMap<u8, UploadSlot>,
    downloads: BTreeMap<u8, DownloadSlot>,
    /// Content to request a slot for.
    pending: VecDeque<ContentId>,
    /// Content with a slot request in flight or a download slot open.
    opened: HashSet<ContentId>,
    open_slots: usize,
    pipeline_in: usize,
    pipeline_out: usize,
    latest_slot: Option<u8>,
    remote_listen: Option<SocketAddr>,
}

impl SlotManager {
    /// Creates the slot state for a new connection.
    ///
    /// The connection's id is sent on `ticks` whenever have announcements are
    /// queued for it; endpoints learned from the peer are sent on `peers`.
    pub fn new(
        share: Arc<Share>,
        config: SlotConfig,
        ticks: UnboundedSender<ConnectionId>,
        peers: UnboundedSender<PeerAnnouncement>,
    ) -> Self {
        Self {
            connection: ConnectionId::next(),
            config,
            share,
            ticks,
            peers,
            exchange: Exchange::default(),
            uploads: BTreeMap::new(),
            downloads: BTreeMap::new(),
            pending: VecDeque::new(),
            opened: HashSet::new(),
            open_slots: 0,
            pipeline_in: 0,
            pipeline_out: 0,
            latest_slot: None,
            remote_listen: None,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Records where the peer accepts connections, for peer exchange.
    pub fn set_remote_listen(&mut self, endpoint: SocketAddr) {
        self.remote_listen = Some(endpoint);
    }

    /// Queues a slot request for content registered in the share.
    pub fn add(&mut self, content_id: ContentId) {
        if !self.opened.contains(&content_id) && !self.pending.contains(&content_id) {
            self.pending.push_back(content_id);
        }
    }

    /// Stops exchanging `content_id` on this connection.
    ///
    /// Download slots are closed. Upload slots are dropped silently; the
    /// peer's next request on them is answered with `error`.
    pub fn remove(&mut self, content_id: &ContentId) {
        self.pending.retain(|id| id != content_id);
        self.uploads
            .retain(|_, slot| slot.transfer.id() != *content_id);
        let closing: Vec<u8> = self
            .downloads
            .iter()
            .filter(|(_, slot)| slot.transfer.id() == *content_id)
            .map(|(&slot_num, _)| slot_num)
            .collect();
        for slot_num in closing {
            self.close_download(slot_num);
        }
        self.opened.remove(content_id);
    }

    /// Returns true when there is nothing left to exchange.
    pub fn is_empty(&self) -> bool {
        self.open_slots == 0 && self.uploads.is_empty() && self.pending.is_empty()
    }

    pub fn upload_slots(&self) -> usize {
        self.uploads.len()
    }

    pub fn download_slots(&self) -> usize {
        self.downloads.len()
    }

    /// Block requests we sent that are still unanswered.
    pub fn pipeline_out(&self) -> usize {
        self.pipeline_out
    }

    /// Block requests we received whose response has not been sent.
    pub fn pipeline_in(&self) -> usize {
        self.pipeline_in
    }

    /// Takes every message queued for the peer, in order.
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        self.exchange.drain()
    }

    /// Reports that an [`Outbound::Block`] was written to the connection.
    pub fn sent_block(&mut self) {
        self.pipeline_in = self.pipeline_in.saturating_sub(1);
    }

    /// Performs all periodic work.
    pub fn tick(&mut self) {
        self.close_complete();
        self.send_block_requests();
        self.send_have();
        self.send_peer();
        self.send_slot_requests();
        self.expire_requests();
    }

    /// Handles every complete message at the front of `buf`.
    ///
    /// Bytes of an incomplete trailing message are left in `buf`. Any error
    /// is a protocol violation and the connection must be dropped.
    pub fn recv(&mut self, buf: &mut BytesMut) -> Result<(), SlotError> {
        while let Some(message) = Message::decode(buf, &self.exchange)? {
            trace!(connection = %self.connection, tag = message.tag(), "received");
            self.dispatch(message)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, message: Message) -> Result<(), SlotError> {
        match message {
            Message::Error => self.recv_error(),
            Message::RequestSlot { content_id } => {
                self.recv_request_slot(content_id);
                Ok(())
            }
            Message::Slot {
                slot_num,
                file_size,
                root_hash,
                tree,
                file,
            } => self.recv_slot(slot_num, file_size, root_hash, tree, file),
            Message::RequestBlock {
                kind,
                slot_num,
                block_num,
                ..
            } => self.recv_request_block(kind, slot_num, block_num),
            Message::Block(data) => self.recv_block(data),
            Message::Have {
                kind,
                slot_num,
                block_num,
                ..
            } => {
                self.recv_have(kind, slot_num, block_num);
                Ok(())
            }
            Message::CloseSlot { slot_num } => self.recv_close_slot(slot_num),
            Message::Peer { slot_num, endpoint } => {
                self.recv_peer(slot_num, endpoint);
                Ok(())
            }
        }
    }

    fn recv_error(&mut self) -> Result<(), SlotError> {
        match self.exchange.next_expectation() {
            None => Err(WireError::Unexpected(TAG_ERROR).into()),
            Some(Expectation::SlotGrant { content_id }) => {
                debug!(connection = %self.connection, content = %content_id, "slot request refused");
                self.open_slots = self.open_slots.saturating_sub(1);
                if !self.is_downloading(&content_id) {
                    self.opened.remove(&content_id);
                }
                Ok(())
            }
            Some(Expectation::Block {
                slot_num,
                content_id,
                kind,
                block_num,
                ..
            }) => {
                self.pipeline_out = self.pipeline_out.saturating_sub(1);
                let open = self
                    .downloads
                    .get(&slot_num)
                    .is_some_and(|slot| slot.transfer.id() == content_id);
                if open {
                    debug!(
                        connection = %self.connection,
                        slot_num,
                        ?kind,
                        block_num,
                        "block request failed, dropping slot"
                    );
                    // The peer has already closed its side.
                    if let Some(slot) = self.downloads.remove(&slot_num) {
                        self.open_slots = self.open_slots.saturating_sub(1);
                        self.opened.remove(&content_id);
                        slot.transfer.force_rerequest(kind, block_num);
                    }
                }
                Ok(())
            }
        }
    }

    fn recv_request_slot(&mut self, content_id: ContentId) {
        let Some(transfer) = self.share.find(&content_id).and_then(|file| file.transfer()) else {
            debug!(connection = %self.connection, content = %content_id, "slot refused, content unknown or unresolved");
            self.exchange.send(Message::Error);
            return;
        };
        if self.uploads.values().any(|slot| slot.transfer.id() == content_id) {
            debug!(connection = %self.connection, content = %content_id, "slot refused, already uploading");
            self.exchange.send(Message::Error);
            return;
        }
        let slot_num = (0..=u8::MAX).find(|slot_num| !self.uploads.contains_key(slot_num));
        let slot_num = match slot_num {
            Some(slot_num) if self.uploads.len() < self.config.max_slots => slot_num,
            _ => {
                debug!(connection = %self.connection, content = %content_id, "slot refused, no free slot");
                self.exchange.send(Message::Error);
                return;
            }
        };

        let granted = transfer.root_hash().and_then(|root_hash| {
            let (registration, tree, file) =
                transfer.upload_reg(self.connection, self.remote_listen, self.ticks.clone())?;
            Ok((root_hash, registration, tree, file))
        });
        let (root_hash, registration, tree, file) = match granted {
            Ok(granted) => granted,
            Err(e) => {
                warn!(connection = %self.connection, content = %content_id, error = %e, "slot refused");
                self.exchange.send(Message::Error);
                return;
            }
        };

        self.exchange.send(Message::Slot {
            slot_num,
            file_size: transfer.file_size(),
            root_hash,
            tree,
            file,
        });
        self.exchange.open_upload(
            slot_num,
            Bounds {
                tree: transfer.tree_block_count(),
                file: transfer.file_block_count(),
            },
        );
        info!(connection = %self.connection, content = %content_id, slot_num, "upload slot opened");

        // A peer asking for content we are still downloading likely has some.
        if !transfer.complete() && !self.is_downloading(&content_id) {
            self.add(content_id);
        }
        self.uploads.insert(
            slot_num,
            UploadSlot {
                transfer,
                _registration: registration,
            },
        );
    }

    fn recv_slot(
        &mut self,
        slot_num: u8,
        file_size: u64,
        root_hash: [u8; HASH_SIZE],
        tree: Coverage,
        file: Coverage,
    ) -> Result<(), SlotError> {
        let Some(Expectation::SlotGrant { content_id }) = self.exchange.next_expectation() else {
            return Err(WireError::Unexpected(TAG_SLOT).into());
        };
        if self.downloads.contains_key(&slot_num) {
            return Err(SlotError::DuplicateSlot(slot_num));
        }
        if ContentId::compute(file_size, &root_hash) != content_id {
            return Err(SlotError::ContentMismatch(content_id));
        }

        // Haves may arrive for this slot number even if we close it at once.
        let layout = TreeLayout::new(file_size);
        self.exchange.open_download(
            slot_num,
            Bounds {
                tree: layout.tree_block_count(),
                file: layout.file_block_count(),
            },
        );

        let wanted = self.opened.contains(&content_id) && !self.is_downloading(&content_id);
        let Some(shared) = self.share.find(&content_id).filter(|_| wanted) else {
            debug!(connection = %self.connection, content = %content_id, slot_num, "slot no longer wanted");
            self.reject_grant(slot_num, content_id);
            return Ok(());
        };

        let opened = shared
            .set_unknown(file_size, &root_hash)
            .and_then(|transfer| {
                let registration =
                    transfer.download_reg(self.connection, self.remote_listen, tree, file)?;
                Ok((transfer, registration))
            });
        match opened {
            Ok((transfer, registration)) => {
                info!(connection = %self.connection, content = %content_id, slot_num, "download slot opened");
                self.downloads.insert(
                    slot_num,
                    DownloadSlot {
                        transfer,
                        _registration: registration,
                    },
                );
            }
            Err(e) => {
                warn!(connection = %self.connection, content = %content_id, slot_num, error = %e, "closing granted slot");
                self.reject_grant(slot_num, content_id);
            }
        }
        Ok(())
    }

    fn recv_request_block(
        &mut self,
        kind: BlockKind,
        slot_num: u8,
        block_num: u64,
    ) -> Result<(), SlotError> {
        if self.pipeline_in >= self.config.max_block_pipeline {
            warn!(connection = %self.connection, slot_num, "overpipelined");
            return Err(SlotError::Overpipelined);
        }
        let Some(slot) = self.uploads.get(&slot_num) else {
            debug!(connection = %self.connection, slot_num, "request on closed slot");
            self.exchange.send(Message::Error);
            return Ok(());
        };

        match slot.transfer.read_block(kind, block_num) {
            Ok(data) => {
                self.pipeline_in += 1;
                self.exchange.send(Message::Block(data));
                Ok(())
            }
            Err(TransferError::NotHeld { kind, block }) => Err(SlotError::NotHeld { kind, block }),
            Err(e) => {
                warn!(connection = %self.connection, slot_num, ?kind, block_num, error = %e, "failed to read block, closing slot");
                self.uploads.remove(&slot_num);
                self.exchange.send(Message::Error);
                Ok(())
            }
        }
    }

    fn recv_block(&mut self, data: Bytes) -> Result<(), SlotError> {
        let Some(Expectation::Block {
            slot_num,
            content_id,
            kind,
            block_num,
            ..
        }) = self.exchange.next_expectation()
        else {
            return Err(WireError::Unexpected(TAG_BLOCK).into());
        };
        self.pipeline_out = self.pipeline_out.saturating_sub(1);

        let Some(transfer) = self
            .downloads
            .get(&slot_num)
            .filter(|slot| slot.transfer.id() == content_id)
            .map(|slot| Arc::clone(&slot.transfer))
        else {
            debug!(connection = %self.connection, slot_num, ?kind, block_num, "block for closed slot");
            return Ok(());
        };

        match transfer.write_block(kind, self.connection, block_num, &data) {
            Ok(WriteStatus::Good) => {
                trace!(connection = %self.connection, slot_num, ?kind, block_num, "block stored");
            }
            Ok(WriteStatus::Late) => {
                debug!(connection = %self.connection, slot_num, ?kind, block_num, "block arrived late");
            }
            Ok(WriteStatus::Bad) => {
                warn!(connection = %self.connection, slot_num, ?kind, block_num, "bad block, closing slot");
                self.close_download(slot_num);
                self.share.garbage_collect();
            }
            Err(e) => {
                warn!(connection = %self.connection, slot_num, ?kind, block_num, error = %e, "failed to store block");
                transfer.force_rerequest(kind, block_num);
            }
        }
        Ok(())
    }

    fn recv_have(&mut self, kind: BlockKind, slot_num: u8, block_num: u64) {
        if let Some(slot) = self.downloads.get(&slot_num) {
            if let Err(e) = slot.transfer.recv_have(kind, self.connection, block_num) {
                debug!(connection = %self.connection, slot_num, error = %e, "ignoring have");
            }
        }
    }

    fn recv_close_slot(&mut self, slot_num: u8) -> Result<(), SlotError> {
        match self.uploads.remove(&slot_num) {
            Some(slot) => {
                info!(connection = %self.connection, content = %slot.transfer.id(), slot_num, "upload slot closed");
                Ok(())
            }
            None => Err(SlotError::NotOpen(slot_num)),
        }
    }

    fn recv_peer(&mut self, slot_num: u8, endpoint: SocketAddr) {
        if let Some(slot) = self.downloads.get(&slot_num) {
            debug!(connection = %self.connection, slot_num, %endpoint, "peer announced");
            let _ = self.peers.send(PeerAnnouncement {
                content_id: slot.transfer.id(),
                endpoint,
            });
        }
    }

    fn close_complete(&mut self) {
        let complete: Vec<u8> = self
            .downloads
            .iter()
            .filter(|(_, slot)| slot.transfer.complete())
            .map(|(&slot_num, _)| slot_num)
            .collect();
        if complete.is_empty() {
            return;
        }
        for slot_num in complete {
            info!(connection = %self.connection, slot_num, "download complete, closing slot");
            self.close_download(slot_num);
        }
        self.share.garbage_collect();
    }

    /// Requests blocks round-robin over the download slots, starting after
    /// the last slot served, until the pipeline is full or a whole round
    /// produces nothing.
    fn send_block_requests(&mut self) {
        let slots: Vec<u8> = self.downloads.keys().copied().collect();
        if slots.is_empty() {
            return;
        }
        let mut at = self
            .latest_slot
            .and_then(|latest| slots.iter().position(|&slot_num| slot_num > latest))
            .unwrap_or(0);

        let mut idle = 0;
        while self.pipeline_out < self.config.max_block_pipeline && idle < slots.len() {
            let slot_num = slots[at];
            at = (at + 1) % slots.len();
            if self.request_block(slot_num) {
                self.latest_slot = Some(slot_num);
                idle = 0;
            } else {
                idle += 1;
            }
        }
    }

    fn request_block(&mut self, slot_num: u8) -> bool {
        let Some(transfer) = self
            .downloads
            .get(&slot_num)
            .map(|slot| Arc::clone(&slot.transfer))
        else {
            return false;
        };

        let (kind, request) = if let Some(request) = transfer.next_request_tree(self.connection) {
            (BlockKind::Tree, request)
        } else if let Some(request) = transfer.next_request_file(self.connection) {
            (BlockKind::File, request)
        } else {
            return false;
        };

        self.exchange.send(Message::RequestBlock {
            kind,
            slot_num,
            block_num: request.block_num,
            block_count: transfer.block_count(kind),
        });
        self.exchange.expect(Expectation::Block {
            slot_num,
            content_id: transfer.id(),
            kind,
            block_num: request.block_num,
            size: request.block_size,
        });
        self.pipeline_out += 1;
        trace!(connection = %self.connection, slot_num, ?kind, block_num = request.block_num, "requested block");
        true
    }

    fn send_have(&mut self) {
        for (&slot_num, slot) in &self.uploads {
            for kind in [BlockKind::Tree, BlockKind::File] {
                let block_count = slot.transfer.block_count(kind);
                loop {
                    let next = match kind {
                        BlockKind::Tree => slot.transfer.next_have_tree(self.connection),
                        BlockKind::File => slot.transfer.next_have_file(self.connection),
                    };
                    let Some(block_num) = next else {
                        break;
                    };
                    self.exchange.send(Message::Have {
                        kind,
                        slot_num,
                        block_num,
                        block_count,
                    });
                }
            }
        }
    }

    fn send_peer(&mut self) {
        for (&slot_num, slot) in &self.uploads {
            while let Some(endpoint) = slot.transfer.next_peer(self.connection) {
                self.exchange.send(Message::Peer { slot_num, endpoint });
            }
        }
    }

    fn send_slot_requests(&mut self) {
        while self.open_slots < self.config.max_slots {
            let Some(content_id) = self.pending.pop_front() else {
                break;
            };
            if !self.share.find(&content_id).is_some_and(|file| !file.complete()) {
                debug!(connection = %self.connection, content = %content_id, "nothing to download");
                continue;
            }
            self.opened.insert(content_id);
            self.open_slots += 1;
            self.exchange.send(Message::RequestSlot { content_id });
            self.exchange.expect(Expectation::SlotGrant { content_id });
            debug!(connection = %self.connection, content = %content_id, "requested slot");
        }
    }

    fn expire_requests(&mut self) {
        for slot in self.downloads.values() {
            slot.transfer.expire_requests(self.config.request_timeout);
        }
    }

    fn close_download(&mut self, slot_num: u8) {
        if let Some(slot) = self.downloads.remove(&slot_num) {
            self.exchange.send(Message::CloseSlot { slot_num });
            self.open_slots = self.open_slots.saturating_sub(1);
            self.opened.remove(&slot.transfer.id());
        }
    }

    fn reject_grant(&mut self, slot_num: u8, content_id: ContentId) {
        self.exchange.send(Message::CloseSlot { slot_num });
        self.open_slots = self.open_slots.saturating_sub(1);
        if !self.is_downloading(&content_id) {
            self.opened.remove(&content_id);
        }
    }

    fn is_downloading(&self, content_id: &ContentId) -> bool {
        self.downloads
            .values()
            .any(|slot| slot.transfer.id() == *content_id)
    }
}

impl std::fmt::Debug for SlotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotManager")
            .field("connection", &self.connection)
            .field("uploads", &self.uploads.len())
            .field("downloads", &self.downloads.len())
            .field("pending", &self.pending.len())
            .field("expectations", &self.exchange.pending())
            .field("pipeline_in", &self.pipeline_in)
            .field("pipeline_out", &self.pipeline_out)
            .finish()
    }
}

impl Drop for SlotManager {
    fn drop(&mut self) {
        debug!(connection = %self.connection, "connection closed");
        self.uploads.clear();
        self.downloads.clear();
        self.share.garbage_collect();
    }
}
