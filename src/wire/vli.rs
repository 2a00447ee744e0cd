//! Variable-length integers sized to a bound both peers already know.
//!
//! A VLI is not self-describing: the width is derived from an exclusive upper
//! bound (for example a block count announced in an earlier `slot` message),
//! so both ends must compute [`vli_size`] from the same bound.

use bytes::{BufMut, Bytes, BytesMut};

/// Returns the number of bytes used to encode any value below `bound`.
///
/// This is the minimal big-endian width of `bound - 1`, never less than one
/// byte.
pub fn vli_size(bound: u64) -> usize {
    debug_assert!(bound > 0, "VLI bound must be positive");
    let max = bound.saturating_sub(1);
    let width = 8 - (max.leading_zeros() as usize / 8);
    width.max(1)
}

/// Appends `value` to `buf` using the width implied by `bound`.
pub fn put_vli(buf: &mut impl BufMut, value: u64, bound: u64) {
    debug_assert!(value < bound, "VLI value {} not below bound {}", value, bound);
    let width = vli_size(bound);
    buf.put_slice(&value.to_be_bytes()[8 - width..]);
}

/// Encodes `value` using the width implied by `bound`.
pub fn encode_vli(value: u64, bound: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(vli_size(bound));
    put_vli(&mut buf, value, bound);
    buf.freeze()
}

/// Decodes a big-endian VLI of one to eight bytes.
pub fn decode_vli(bytes: &[u8]) -> u64 {
    debug_assert!(bytes.len() <= 8);
    bytes
        .iter()
        .take(8)
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}
