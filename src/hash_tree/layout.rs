use std::ops::Range;

use crate::constants::{FILE_BLOCK_SIZE, HASH_BLOCK_FANOUT, HASH_SIZE};

const HASH_BYTES: u64 = HASH_SIZE as u64;

/// Position of one tree block inside the tree's blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Byte offset of the block.
    pub offset: u64,
    /// Byte length of the block, a multiple of the hash size.
    pub len: usize,
    /// Byte offset of the hash covering this block. `None` for the root.
    pub parent: Option<u64>,
}

/// Shape of the hash tree of a file of known size.
///
/// Rows are stored root first. The last row holds one hash per file block and
/// every other row holds one hash per run of up to [`HASH_BLOCK_FANOUT`]
/// hashes of the row below. A tree block is such a run; blocks are numbered
/// row by row from the root, so the root row is always block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLayout {
    file_size: u64,
    rows: Vec<u64>,
    tree_block_count: u64,
    tree_size: u64,
    file_hash_offset: u64,
}

impl TreeLayout {
    pub fn new(file_size: u64) -> Self {
        let rows = rows_for(file_size.div_ceil(FILE_BLOCK_SIZE));

        let tree_block_count = rows.iter().map(|r| r.div_ceil(HASH_BLOCK_FANOUT)).sum();
        let tree_size = rows.iter().sum::<u64>() * HASH_BYTES;
        let file_hash_offset = rows
            .split_last()
            .map_or(0, |(_, upper)| upper.iter().sum::<u64>() * HASH_BYTES);

        Self {
            file_size,
            rows,
            tree_block_count,
            tree_size,
            file_hash_offset,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Hash counts per row, root first.
    pub fn rows(&self) -> &[u64] {
        &self.rows
    }

    pub fn tree_block_count(&self) -> u64 {
        self.tree_block_count
    }

    /// Total size of the tree in bytes.
    pub fn tree_size(&self) -> u64 {
        self.tree_size
    }

    /// Byte offset of the first file hash (the leaf row).
    pub fn file_hash_offset(&self) -> u64 {
        self.file_hash_offset
    }

    pub fn file_block_count(&self) -> u64 {
        self.rows.last().copied().unwrap_or(0)
    }

    /// Size of the final file block, which may be short.
    pub fn last_file_block_size(&self) -> usize {
        match self.file_size % FILE_BLOCK_SIZE {
            0 if self.file_size == 0 => 0,
            0 => FILE_BLOCK_SIZE as usize,
            rem => rem as usize,
        }
    }

    /// Size of file block `block`, or `None` if out of range.
    pub fn file_block_size(&self, block: u64) -> Option<usize> {
        let count = self.file_block_count();
        if block >= count {
            None
        } else if block + 1 == count {
            Some(self.last_file_block_size())
        } else {
            Some(FILE_BLOCK_SIZE as usize)
        }
    }

    /// Size of tree block `block`, or `None` if out of range.
    pub fn tree_block_size(&self, block: u64) -> Option<usize> {
        self.block_info(block).map(|info| info.len)
    }

    /// Locates tree block `block` in the tree's blob.
    pub fn block_info(&self, block: u64) -> Option<BlockInfo> {
        let mut row_offset = 0;
        let mut blocks_before = 0;

        for (x, &row) in self.rows.iter().enumerate() {
            let row_blocks = row.div_ceil(HASH_BLOCK_FANOUT);
            if block < blocks_before + row_blocks {
                let start = row_offset + (block - blocks_before) * HASH_BLOCK_FANOUT;
                let len = HASH_BLOCK_FANOUT.min(row_offset + row - start);
                let parent = x
                    .checked_sub(1)
                    .map(|prev| (row_offset - self.rows[prev] + block - blocks_before) * HASH_BYTES);
                return Some(BlockInfo {
                    offset: start * HASH_BYTES,
                    len: (len * HASH_BYTES) as usize,
                    parent,
                });
            }
            blocks_before += row_blocks;
            row_offset += row;
        }
        None
    }

    /// Tree blocks whose hashes are stored in tree block `block`.
    ///
    /// Returns `None` for blocks of the leaf row, whose hashes cover file
    /// blocks instead, and for out of range blocks.
    pub fn tree_block_children(&self, block: u64) -> Option<Range<u64>> {
        let mut row_offset = 0;
        let mut blocks_before = 0;

        for &row in &self.rows {
            let row_blocks = row.div_ceil(HASH_BLOCK_FANOUT);
            if block < blocks_before + row_blocks {
                let start = row_offset + (block - blocks_before) * HASH_BLOCK_FANOUT;
                if start * HASH_BYTES >= self.file_hash_offset {
                    return None;
                }
                let len = HASH_BLOCK_FANOUT.min(row_offset + row - start);
                let first = (start - row_offset) + blocks_before + row_blocks;
                return Some(first..first + len);
            }
            blocks_before += row_blocks;
            row_offset += row;
        }
        None
    }

    /// File blocks whose hashes are stored in tree block `block`.
    ///
    /// Returns `None` unless `block` belongs to the leaf row.
    pub fn file_block_children(&self, block: u64) -> Option<Range<u64>> {
        let info = self.block_info(block)?;
        if info.offset < self.file_hash_offset {
            return None;
        }
        let first = (info.offset - self.file_hash_offset) / HASH_BYTES;
        Some(first..first + (info.len as u64) / HASH_BYTES)
    }

    /// Byte offset of the hash of file block `block`.
    pub fn file_hash_position(&self, block: u64) -> u64 {
        self.file_hash_offset + block * HASH_BYTES
    }
}

/// Row sizes for `leaf_count` leaves, root first.
fn rows_for(leaf_count: u64) -> Vec<u64> {
    if leaf_count == 0 {
        return Vec::new();
    }
    let mut rows = vec![leaf_count];
    let mut row = leaf_count;
    while row > 1 {
        row = row.div_ceil(HASH_BLOCK_FANOUT);
        rows.push(row);
    }
    rows.reverse();
    rows
}
