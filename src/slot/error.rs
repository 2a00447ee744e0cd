use thiserror::Error;

use crate::hash_tree::ContentId;
use crate::wire::{BlockKind, WireError};

/// Errors raised while handling the messages of one connection.
///
/// Every variant is a protocol violation: the caller is expected to
/// blacklist the peer and drop the connection. The offending message has
/// already been consumed and the exchange cannot be resumed.
#[derive(Debug, Error)]
pub enum SlotError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The peer granted a slot number that is already open.
    #[error("slot {0} granted twice")]
    DuplicateSlot(u8),

    /// The peer closed one of our upload slots that is not open.
    #[error("close of slot {0} which is not open")]
    NotOpen(u8),

    /// A slot grant whose size and root hash do not produce the requested id.
    #[error("slot grant does not match requested content {0}")]
    ContentMismatch(ContentId),

    /// The peer requested a block we never announced.
    #[error("request for {kind:?} block {block} which is not held")]
    NotHeld { kind: BlockKind, block: u64 },

    /// More block requests arrived than the pipeline allows. The request
    /// got no reply, so the peer's responses are out of step.
    #[error("incoming request pipeline full")]
    Overpipelined,
}

impl SlotError {
    /// Returns true if the peer broke the protocol.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            SlotError::Wire(_)
            | SlotError::DuplicateSlot(_)
            | SlotError::NotOpen(_)
            | SlotError::ContentMismatch(_)
            | SlotError::NotHeld { .. }
            | SlotError::Overpipelined => true,
        }
    }
}
