//! Rarest-first block scheduling
//!
//! One [`BlockScheduler`] exists per block space (the tree blocks or the file
//! blocks of a transfer) and is shared by every connection moving those
//! blocks. It tracks which blocks we hold, which we may request, which each
//! download peer holds and which requests are outstanding, and queues have
//! announcements for upload peers.
//!
//! Peers register through [`BlockScheduler::subscribe_outgoing`] and
//! [`BlockScheduler::subscribe_incoming`]; the returned handles unsubscribe on
//! drop, so a connection that goes away can never leave stale requests
//! behind.

mod bitfield;
mod block_scheduler;
mod connection_id;
mod coverage;
mod error;
mod subscription;

pub use bitfield::Bitfield;
pub use block_scheduler::BlockScheduler;
pub use connection_id::ConnectionId;
pub use coverage::Coverage;
pub use error::SchedulerError;
pub use subscription::{DownloadSubscription, UploadSubscription};
