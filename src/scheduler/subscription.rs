use std::fmt;
use std::sync::Arc;

use super::block_scheduler::BlockScheduler;
use super::error::SchedulerError;
use super::ConnectionId;

/// A connection's registration as a download peer of a scheduler.
///
/// Dropping the handle removes the peer's coverage and releases its
/// outstanding requests so other connections can pick them up.
pub struct DownloadSubscription {
    scheduler: Arc<BlockScheduler>,
    connection: ConnectionId,
}

impl DownloadSubscription {
    pub(super) fn new(scheduler: Arc<BlockScheduler>, connection: ConnectionId) -> Self {
        Self {
            scheduler,
            connection,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn scheduler(&self) -> &Arc<BlockScheduler> {
        &self.scheduler
    }

    /// Returns the next block to request from this peer.
    pub fn next_request(&self) -> Option<u64> {
        self.scheduler.next_request(self.connection)
    }

    /// Records a have announcement from this peer.
    pub fn recv_have(&self, block: u64) -> Result<(), SchedulerError> {
        self.scheduler.mark_remote_complete(self.connection, block)
    }
}

impl Drop for DownloadSubscription {
    fn drop(&mut self) {
        self.scheduler.unsubscribe_outgoing(self.connection);
    }
}

impl fmt::Debug for DownloadSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadSubscription")
            .field("connection", &self.connection)
            .finish()
    }
}

/// A connection's registration as an upload peer of a scheduler.
///
/// Dropping the handle discards the peer's pending have announcements.
pub struct UploadSubscription {
    scheduler: Arc<BlockScheduler>,
    connection: ConnectionId,
}

impl UploadSubscription {
    pub(super) fn new(scheduler: Arc<BlockScheduler>, connection: ConnectionId) -> Self {
        Self {
            scheduler,
            connection,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn scheduler(&self) -> &Arc<BlockScheduler> {
        &self.scheduler
    }

    /// Pops the next block to announce to this peer.
    pub fn next_have(&self) -> Option<u64> {
        self.scheduler.next_have(self.connection)
    }
}

impl Drop for UploadSubscription {
    fn drop(&mut self) {
        self.scheduler.unsubscribe_incoming(self.connection);
    }
}

impl fmt::Debug for UploadSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadSubscription")
            .field("connection", &self.connection)
            .finish()
    }
}
