use bytes::Bytes;

use super::bitfield::Bitfield;

/// Which blocks of a transfer a party holds (or is allowed to request).
///
/// `Complete` stands for "every block" without storing a bit per block. A
/// `Partial` bitfield whose last missing bit gets set collapses to
/// `Complete`, so a full `Partial` value is never observable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coverage {
    Complete,
    Partial(Bitfield),
}

impl Coverage {
    /// Coverage holding none of `block_count` blocks.
    ///
    /// A transfer with no blocks is trivially complete.
    pub fn none(block_count: u64) -> Self {
        if block_count == 0 {
            Coverage::Complete
        } else {
            Coverage::Partial(Bitfield::new(block_count))
        }
    }

    /// Builds coverage from a bitfield received on the wire.
    pub fn from_wire(bytes: Bytes, block_count: u64) -> Self {
        Self::from_bitfield(Bitfield::from_bytes(&bytes, block_count))
    }

    /// Wraps `bits`, collapsing a full bitfield.
    pub fn from_bitfield(bits: Bitfield) -> Self {
        if bits.is_full() {
            Coverage::Complete
        } else {
            Coverage::Partial(bits)
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Coverage::Complete)
    }

    pub fn has(&self, block: u64) -> bool {
        match self {
            Coverage::Complete => true,
            Coverage::Partial(bits) => bits.has(block),
        }
    }

    /// Marks `block` as held. Returns true if this is new information.
    pub fn set(&mut self, block: u64) -> bool {
        let Coverage::Partial(bits) = self else {
            return false;
        };
        let added = bits.set(block);
        if bits.is_full() {
            *self = Coverage::Complete;
        }
        added
    }

    /// Returns the number of held blocks out of `block_count`.
    pub fn count(&self, block_count: u64) -> u64 {
        match self {
            Coverage::Complete => block_count,
            Coverage::Partial(bits) => bits.count(),
        }
    }

    /// Returns the partial bitfield, or `None` when complete.
    pub fn bitfield(&self) -> Option<&Bitfield> {
        match self {
            Coverage::Complete => None,
            Coverage::Partial(bits) => Some(bits),
        }
    }
}
