use thiserror::Error;

/// Errors produced while decoding wire messages.
///
/// Every variant is a protocol violation by the sender.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The leading byte is not a known message tag.
    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    /// A message arrived that no armed expectation accepts.
    #[error("unexpected message: tag {0}")]
    Unexpected(u8),

    /// A message referenced a slot number with no known bounds.
    #[error("unknown slot: {0}")]
    UnknownSlot(u8),

    /// The `slot` status byte has bits outside the defined flags.
    #[error("invalid slot status byte: {0:#04x}")]
    InvalidStatus(u8),

    /// A VLI decoded to a value not below its bound.
    #[error("block number {block_num} out of range (block count {block_count})")]
    BlockOutOfRange { block_num: u64, block_count: u64 },

    /// The message is structurally invalid.
    #[error("malformed message: {0}")]
    Malformed(String),
}
