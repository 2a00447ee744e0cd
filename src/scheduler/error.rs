use thiserror::Error;

use super::ConnectionId;

/// Errors returned by [`BlockScheduler`](super::BlockScheduler) operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The connection already holds a subscription of this kind.
    #[error("connection {0} already subscribed")]
    AlreadySubscribed(ConnectionId),

    /// The connection has no download subscription.
    #[error("connection {0} not subscribed")]
    NotSubscribed(ConnectionId),

    /// A block number not below the block count.
    #[error("block {block} out of range (block count {block_count})")]
    BlockOutOfRange { block: u64, block_count: u64 },

    /// A remote bitfield does not cover exactly the scheduler's blocks.
    #[error("bitfield covers {actual} blocks, expected {expected}")]
    CoverageLength { expected: u64, actual: u64 },
}
