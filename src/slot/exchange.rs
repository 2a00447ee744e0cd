use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use crate::hash_tree::ContentId;
use crate::wire::{BlockKind, DecodeContext, Message};

/// A response we are waiting for.
///
/// Responses arrive in the order their requests were sent, so expectations
/// form a FIFO per connection. Each one is satisfied either by the response
/// it names or by an `error` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Expectation {
    SlotGrant {
        content_id: ContentId,
    },
    Block {
        slot_num: u8,
        content_id: ContentId,
        kind: BlockKind,
        block_num: u64,
        size: usize,
    },
}

/// Tree and file block counts of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Bounds {
    pub tree: u64,
    pub file: u64,
}

impl Bounds {
    fn get(&self, kind: BlockKind) -> u64 {
        match kind {
            BlockKind::Tree => self.tree,
            BlockKind::File => self.file,
        }
    }
}

/// Bytes ready to be written to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(Bytes),
    /// A `block` response. Report its transmission with
    /// [`SlotManager::sent_block`](super::SlotManager::sent_block).
    Block(Bytes),
}

impl Outbound {
    pub fn bytes(&self) -> &Bytes {
        match self {
            Outbound::Message(bytes) | Outbound::Block(bytes) => bytes,
        }
    }
}

/// Per-connection message bookkeeping: armed expectations, the block counts
/// of every slot ever opened in either direction, and the outbound queue.
///
/// Bounds outlive their slot so that messages crossing a `close_slot` still
/// decode.
#[derive(Debug, Default)]
pub(super) struct Exchange {
    expectations: VecDeque<Expectation>,
    upload_bounds: BTreeMap<u8, Bounds>,
    download_bounds: BTreeMap<u8, Bounds>,
    outbound: VecDeque<Outbound>,
}

impl Exchange {
    pub(super) fn send(&mut self, message: Message) {
        let bytes = message.encode();
        match message {
            Message::Block(_) => self.outbound.push_back(Outbound::Block(bytes)),
            _ => self.outbound.push_back(Outbound::Message(bytes)),
        }
    }

    pub(super) fn expect(&mut self, expectation: Expectation) {
        self.expectations.push_back(expectation);
    }

    pub(super) fn next_expectation(&mut self) -> Option<Expectation> {
        self.expectations.pop_front()
    }

    pub(super) fn open_upload(&mut self, slot_num: u8, bounds: Bounds) {
        self.upload_bounds.insert(slot_num, bounds);
    }

    pub(super) fn open_download(&mut self, slot_num: u8, bounds: Bounds) {
        self.download_bounds.insert(slot_num, bounds);
    }

    pub(super) fn drain(&mut self) -> Vec<Outbound> {
        self.outbound.drain(..).collect()
    }

    pub(super) fn pending(&self) -> usize {
        self.expectations.len()
    }
}

impl DecodeContext for Exchange {
    fn expected_block_size(&self) -> Option<usize> {
        match self.expectations.front()? {
            Expectation::Block { size, .. } => Some(*size),
            Expectation::SlotGrant { .. } => None,
        }
    }

    fn request_bound(&self, kind: BlockKind, slot_num: u8) -> Option<u64> {
        self.upload_bounds
            .get(&slot_num)
            .map(|bounds| bounds.get(kind))
    }

    fn have_bound(&self, kind: BlockKind, slot_num: u8) -> Option<u64> {
        self.download_bounds
            .get(&slot_num)
            .map(|bounds| bounds.get(kind))
    }
}
