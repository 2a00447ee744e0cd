//! Slot protocol state machine
//!
//! One connection multiplexes many transfers. Each transfer gets a slot, a
//! one-byte number chosen by the side that grants it, and each side keeps
//! separate tables for the slots it uploads on and the slots it downloads
//! on.
//!
//! ```text
//! downloader                         uploader
//!     request_slot(id)      ------>
//!                           <------  slot(n, size, root, bitfields) | error
//!     request_*_block(n, b) ------>
//!                           <------  block(bytes) | error
//!                           <------  have_*_block(n, b), peer(n, endpoint)
//!     close_slot(n)         ------>
//! ```
//!
//! Responses are matched to requests in the order the requests were sent;
//! `request_*`, `have_*`, `peer` and `close_slot` may arrive at any time.
//! [`SlotManager`] is transport agnostic: the host feeds it received bytes
//! and writes out what it queues.

mod error;
mod exchange;
mod manager;

pub use error::SlotError;
pub use exchange::Outbound;
pub use manager::{PeerAnnouncement, SlotConfig, SlotManager};

#[cfg(test)]
mod tests;
