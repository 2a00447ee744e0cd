use bytes::Bytes;

/// A packed bit vector over the blocks of a tree or a file.
///
/// Bits are numbered from the high bit of the first byte, which is also the
/// order they travel in on the wire. Spare bits in the last byte are always
/// zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: u64,
}

impl Bitfield {
    /// Creates a bitfield of `len` blocks with no bit set.
    pub fn new(len: u64) -> Self {
        Self {
            bits: vec![0; byte_len(len)],
            len,
        }
    }

    /// Creates a bitfield from wire bytes, padding or truncating to `len`.
    pub fn from_bytes(bytes: &[u8], len: u64) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(byte_len(len), 0);

        let mut bf = Self { bits, len };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a bitfield of `len` blocks with every bit set.
    pub fn full(len: u64) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; byte_len(len)],
            len,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Returns true if the bit for `index` is set.
    pub fn has(&self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let (byte, shift) = position(index);
        (self.bits[byte] >> shift) & 1 == 1
    }

    /// Sets the bit for `index`, returning true if it was previously clear.
    pub fn set(&mut self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let (byte, shift) = position(index);
        let was_clear = (self.bits[byte] >> shift) & 1 == 0;
        self.bits[byte] |= 1 << shift;
        was_clear
    }

    pub fn clear(&mut self, index: u64) {
        if index >= self.len {
            return;
        }
        let (byte, shift) = position(index);
        self.bits[byte] &= !(1 << shift);
    }

    /// Returns the number of set bits.
    pub fn count(&self) -> u64 {
        self.bits.iter().map(|b| u64::from(b.count_ones())).sum()
    }

    /// Returns true if every bit is set.
    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    /// Returns true if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Returns the number of blocks the bitfield covers.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Returns indices of all clear bits.
    pub fn missing(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).filter(move |&i| !self.has(i))
    }

    fn clear_spare_bits(&mut self) {
        let spare = (self.bits.len() as u64 * 8) - self.len;
        if spare > 0 && spare < 8 {
            let mask = 0xFFu8 << spare;
            if let Some(last) = self.bits.last_mut() {
                *last &= mask;
            }
        }
    }
}

fn byte_len(len: u64) -> usize {
    // Callers bound `len` by what fits in memory.
    len.div_ceil(8) as usize
}

fn position(index: u64) -> (usize, u32) {
    ((index / 8) as usize, 7 - (index % 8) as u32)
}
