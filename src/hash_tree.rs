//! Merkle hash trees over fixed-size file blocks
//!
//! A file is cut into [`FILE_BLOCK_SIZE`](crate::constants::FILE_BLOCK_SIZE)
//! chunks whose SHA-1 hashes form the leaf row of a tree with fanout
//! [`HASH_BLOCK_FANOUT`](crate::constants::HASH_BLOCK_FANOUT). Each inner hash
//! is the SHA-1 of up to 512 consecutive child hashes, and the file is named
//! by a [`ContentId`] derived from its size and the root hash.
//!
//! Runs of sibling hashes are grouped into tree blocks, which are the unit of
//! storage, transfer and verification:
//!
//! ```text
//! row 0   [root]                         tree block 0
//! row 1   [h0 h1 ... h511][h512 ...]     tree blocks 1, 2, ...
//! leaf    [f0 f1 ... f511][f512 ...]     one hash per file block
//! ```
//!
//! # Components
//!
//! - [`TreeLayout`] - Row sizes and block geometry for a file size
//! - [`HashTree`] - Verified reads and writes of a stored tree
//! - [`TreeBuilder`] - Builds and stores the tree of a local file

mod builder;
mod content_id;
mod error;
mod layout;
mod tree;

pub use builder::{TreeBuilder, TreeSource};
pub use content_id::ContentId;
pub use error::HashTreeError;
pub use layout::{BlockInfo, TreeLayout};
pub use tree::{CheckOutcome, HashTree, Verdict};
