use std::fmt;
use std::str::FromStr;

use sha1::{Digest, Sha1};

use super::error::HashTreeError;
use crate::constants::HASH_SIZE;

/// Identifies a file by its size and the root of its hash tree.
///
/// `ContentId = SHA1(be_u64(file_size) || root_hash)`. Rendered as 40
/// lowercase hex digits; parsing accepts either case.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId([u8; HASH_SIZE]);

impl ContentId {
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashTreeError> {
        let arr: [u8; HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| HashTreeError::InvalidContentId(format!("{} bytes", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, HashTreeError> {
        let bytes = hex_decode(s).ok_or_else(|| HashTreeError::InvalidContentId(s.to_string()))?;
        Self::from_slice(&bytes).map_err(|_| HashTreeError::InvalidContentId(s.to_string()))
    }

    /// Derives the id of a file of `file_size` bytes whose tree root is
    /// `root_hash`.
    pub fn compute(file_size: u64, root_hash: &[u8; HASH_SIZE]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(file_size.to_be_bytes());
        hasher.update(root_hash);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }
}

impl FromStr for ContentId {
    type Err = HashTreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.to_hex())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
        s
    })
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    let digits = s.as_bytes();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}
