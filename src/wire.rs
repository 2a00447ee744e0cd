//! Slot protocol wire format
//!
//! Messages are a one-byte tag followed by a tag-specific body. Bodies are not
//! length prefixed: block numbers are VLIs whose width comes from a block
//! count announced earlier, and `block` payloads take their size from the
//! request they answer. Decoding therefore runs against a [`DecodeContext`]
//! supplied by the connection.
//!
//! # Tags
//!
//! | Tag | Message                  | Body                                        |
//! |-----|--------------------------|---------------------------------------------|
//! | 0   | `error`                  | none                                        |
//! | 1   | `request_slot`           | content id                                  |
//! | 2   | `slot`                   | slot, status, size, root hash, bitfields    |
//! | 3   | `request_hash_tree_block`| slot, VLI block number                      |
//! | 4   | `request_file_block`     | slot, VLI block number                      |
//! | 5   | `block`                  | raw payload                                 |
//! | 6   | `have_hash_tree_block`   | slot, VLI block number                      |
//! | 7   | `have_file_block`        | slot, VLI block number                      |
//! | 8   | `close_slot`             | slot                                        |
//! | 9   | `peer` (IPv4)            | slot, 4-byte address, port                  |
//! | 10  | `peer` (IPv6)            | slot, 16-byte address, port                 |

mod error;
mod message;
mod vli;

pub use error::WireError;
pub use message::{BlockKind, DecodeContext, Message};
pub use vli::{decode_vli, encode_vli, put_vli, vli_size};

#[cfg(test)]
mod tests;
