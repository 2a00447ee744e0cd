//! Blob storage for hash trees and payloads.
//!
//! The transfer engine never touches files directly. Hash trees and partially
//! downloaded payloads live in fixed-size blobs behind the [`BlobStore`]
//! trait, and hash trees are located by content through the [`HashIndex`].
//!
//! # Components
//!
//! - [`BlobStore`] - Allocate, read, write and free byte blobs
//! - [`MemoryBlobStore`] - Blobs held in memory
//! - [`DiskBlobStore`] - One file per blob under a directory
//! - [`HashIndex`] - Hash trees keyed by [`ContentId`](crate::ContentId)
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use treeshare::storage::{BlobStore, MemoryBlobStore};
//!
//! # fn example() -> Result<(), treeshare::storage::StorageError> {
//! let store = Arc::new(MemoryBlobStore::new());
//! let blob = store.allocate(64)?;
//! store.write(blob, 8, b"hello")?;
//! assert_eq!(&store.read(blob, 8, 5)?[..], b"hello");
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

mod blob;
mod disk;
mod error;
mod index;
mod memory;

pub use blob::{BlobId, BlobStore};
pub use disk::DiskBlobStore;
pub use error::StorageError;
pub use index::{HashIndex, TreeRecord, TreeState};
pub use memory::MemoryBlobStore;

#[cfg(test)]
mod tests;
