//! Shared content and per-file transfers
//!
//! The [`Share`] registry maps [`ContentId`](crate::ContentId)s to
//! [`SharedFile`]s. A shared file starts out known only by id when it is
//! added for download, and gains a [`Transfer`] once a peer tells us its size
//! and root hash. Files added from a local source are complete from the
//! start.
//!
//! A [`Transfer`] couples the hash tree, the payload blob and the two block
//! schedulers of one file. Connections attach to it through
//! [`DownloadRegistration`] and [`UploadRegistration`] handles, which detach
//! on drop.

mod error;
mod peers;
mod registry;
mod transfer;

pub use error::TransferError;
pub use registry::{Share, SharedFile};
pub use transfer::{
    DownloadRegistration, NextRequest, Transfer, TransferStatus, UploadRegistration, WriteStatus,
};

#[cfg(test)]
mod tests;
