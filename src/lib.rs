//! treeshare - A verified block transfer engine
//!
//! This library moves files between peers in blocks that are verified
//! against a Merkle hash tree before they are stored. Files are named by a
//! [`ContentId`] derived from their size and root hash, blocks are scheduled
//! rarest first across every peer offering them, and many transfers are
//! multiplexed over one connection through numbered slots.
//!
//! The crate does no networking of its own. A host feeds received bytes to a
//! [`SlotManager`] per connection and writes out what it queues.
//!
//! # Modules
//!
//! - [`wire`] - Slot protocol messages and bound-sized integers
//! - [`hash_tree`] - Tree layout, verification and construction
//! - [`scheduler`] - Rarest-first block scheduling and have fan-out
//! - [`share`] - Shared content registry and per-file transfers
//! - [`slot`] - Per-connection slot protocol state machine
//! - [`storage`] - Blob storage and the content-addressed tree index
//! - [`config`] - Configuration files and environment overrides

pub mod config;
pub mod constants;
pub mod hash_tree;
pub mod scheduler;
pub mod share;
pub mod slot;
pub mod storage;
pub mod wire;

pub use config::{Config, ConfigError};
pub use hash_tree::{
    CheckOutcome, ContentId, HashTree, HashTreeError, TreeBuilder, TreeLayout, Verdict,
};
pub use scheduler::{BlockScheduler, ConnectionId, Coverage, SchedulerError};
pub use share::{Share, SharedFile, Transfer, TransferError, WriteStatus};
pub use slot::{Outbound, PeerAnnouncement, SlotConfig, SlotError, SlotManager};
pub use storage::{BlobStore, DiskBlobStore, HashIndex, MemoryBlobStore, StorageError};
pub use wire::{BlockKind, Message, WireError};
