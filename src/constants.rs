//! Protocol constants and tuning parameters.
//!
//! Every peer must agree on the values in the "Tree geometry" and "Wire tags"
//! sections; the remaining values are local defaults that can be overridden
//! through [`Config`](crate::Config).

use std::time::Duration;

// ============================================================================
// Tree geometry
// ============================================================================

/// Size of a SHA-1 digest in bytes.
pub const HASH_SIZE: usize = 20;

/// Number of sibling hashes grouped into one stored/transferred tree block.
pub const HASH_BLOCK_FANOUT: u64 = 512;

/// Size of a file block. A full tree block and a full file block are the same
/// number of bytes, so both travel in equally sized `block` messages.
pub const FILE_BLOCK_SIZE: u64 = HASH_BLOCK_FANOUT * HASH_SIZE as u64;

// ============================================================================
// Connection limits
// ============================================================================

/// Slot numbers are one byte, so each direction of a connection multiplexes
/// at most this many transfers.
pub const MAX_SLOTS: usize = 256;

/// Default number of unanswered block requests allowed per connection and
/// direction.
pub const DEFAULT_MAX_BLOCK_PIPELINE: usize = 16;

// ============================================================================
// Timeouts
// ============================================================================

/// Time after which an unanswered block request may be made again.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(16);

/// How often tree creation re-checks that the source file has not shrunk.
pub const SOURCE_PROBE_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Wire tags
// ============================================================================

pub const TAG_ERROR: u8 = 0;
pub const TAG_REQUEST_SLOT: u8 = 1;
pub const TAG_SLOT: u8 = 2;
pub const TAG_REQUEST_HASH_TREE_BLOCK: u8 = 3;
pub const TAG_REQUEST_FILE_BLOCK: u8 = 4;
pub const TAG_BLOCK: u8 = 5;
pub const TAG_HAVE_HASH_TREE_BLOCK: u8 = 6;
pub const TAG_HAVE_FILE_BLOCK: u8 = 7;
pub const TAG_CLOSE_SLOT: u8 = 8;
pub const TAG_PEER_V4: u8 = 9;
pub const TAG_PEER_V6: u8 = 10;

/// Bit in the `slot` status byte set when a tree bitfield follows.
pub const SLOT_STATUS_TREE_BITFIELD: u8 = 0x01;

/// Bit in the `slot` status byte set when a file bitfield follows.
pub const SLOT_STATUS_FILE_BITFIELD: u8 = 0x02;

/// Fixed part of a `slot` message: tag, slot number, status, file size, root hash.
pub const SLOT_HEADER_LEN: usize = 3 + 8 + HASH_SIZE;

/// Upper bound on the combined bitfield bytes a `slot` message may carry.
/// Covers files well beyond a terabyte; anything larger is refused before
/// buffering.
pub const MAX_BITFIELD_BYTES: usize = 32 * 1024 * 1024;
