use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::WireError;
use super::vli::{decode_vli, put_vli, vli_size};
use crate::constants::{
    HASH_SIZE, MAX_BITFIELD_BYTES, SLOT_HEADER_LEN, SLOT_STATUS_FILE_BITFIELD,
    SLOT_STATUS_TREE_BITFIELD, TAG_BLOCK, TAG_CLOSE_SLOT, TAG_ERROR, TAG_HAVE_FILE_BLOCK,
    TAG_HAVE_HASH_TREE_BLOCK, TAG_PEER_V4, TAG_PEER_V6, TAG_REQUEST_FILE_BLOCK,
    TAG_REQUEST_HASH_TREE_BLOCK, TAG_REQUEST_SLOT, TAG_SLOT,
};
use crate::hash_tree::{ContentId, TreeLayout};
use crate::scheduler::Coverage;

/// Which half of a transfer a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockKind {
    /// A group of sibling hashes from the hash tree.
    Tree,
    /// A chunk of file content.
    File,
}

impl BlockKind {
    fn request_tag(self) -> u8 {
        match self {
            BlockKind::Tree => TAG_REQUEST_HASH_TREE_BLOCK,
            BlockKind::File => TAG_REQUEST_FILE_BLOCK,
        }
    }

    fn have_tag(self) -> u8 {
        match self {
            BlockKind::Tree => TAG_HAVE_HASH_TREE_BLOCK,
            BlockKind::File => TAG_HAVE_FILE_BLOCK,
        }
    }
}

/// Information the decoder needs but the wire does not carry.
///
/// Block numbers are VLIs sized to the block count of the slot they address,
/// and a `block` payload has no length prefix; both are known only to the
/// connection that armed the corresponding expectation.
pub trait DecodeContext {
    /// Payload size of the `block` the oldest outstanding request expects,
    /// or `None` if no block response is expected.
    fn expected_block_size(&self) -> Option<usize>;

    /// Block count of one of our upload slots, used for incoming requests.
    fn request_bound(&self, kind: BlockKind, slot_num: u8) -> Option<u64>;

    /// Block count of one of our download slots, used for incoming haves.
    fn have_bound(&self, kind: BlockKind, slot_num: u8) -> Option<u64>;
}

/// A message of the slot protocol.
///
/// Variants that carry a block number also carry the block count that sizes
/// its VLI; the count itself is never transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Error,
    RequestSlot {
        content_id: ContentId,
    },
    Slot {
        slot_num: u8,
        file_size: u64,
        root_hash: [u8; HASH_SIZE],
        tree: Coverage,
        file: Coverage,
    },
    RequestBlock {
        kind: BlockKind,
        slot_num: u8,
        block_num: u64,
        block_count: u64,
    },
    Block(Bytes),
    Have {
        kind: BlockKind,
        slot_num: u8,
        block_num: u64,
        block_count: u64,
    },
    CloseSlot {
        slot_num: u8,
    },
    Peer {
        slot_num: u8,
        endpoint: SocketAddr,
    },
}

impl Message {
    /// Returns the wire tag of this message.
    pub fn tag(&self) -> u8 {
        match self {
            Message::Error => TAG_ERROR,
            Message::RequestSlot { .. } => TAG_REQUEST_SLOT,
            Message::Slot { .. } => TAG_SLOT,
            Message::RequestBlock { kind, .. } => kind.request_tag(),
            Message::Block(_) => TAG_BLOCK,
            Message::Have { kind, .. } => kind.have_tag(),
            Message::CloseSlot { .. } => TAG_CLOSE_SLOT,
            Message::Peer { endpoint, .. } => match endpoint {
                SocketAddr::V4(_) => TAG_PEER_V4,
                SocketAddr::V6(_) => TAG_PEER_V6,
            },
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.tag());

        match self {
            Message::Error => {}
            Message::RequestSlot { content_id } => {
                buf.put_slice(content_id.as_bytes());
            }
            Message::Slot {
                slot_num,
                file_size,
                root_hash,
                tree,
                file,
            } => {
                let mut status = 0u8;
                if !tree.is_complete() {
                    status |= SLOT_STATUS_TREE_BITFIELD;
                }
                if !file.is_complete() {
                    status |= SLOT_STATUS_FILE_BITFIELD;
                }
                buf.put_u8(*slot_num);
                buf.put_u8(status);
                buf.put_u64(*file_size);
                buf.put_slice(root_hash);
                if let Coverage::Partial(bits) = tree {
                    buf.put_slice(bits.as_bytes());
                }
                if let Coverage::Partial(bits) = file {
                    buf.put_slice(bits.as_bytes());
                }
            }
            Message::RequestBlock {
                slot_num,
                block_num,
                block_count,
                ..
            }
            | Message::Have {
                slot_num,
                block_num,
                block_count,
                ..
            } => {
                buf.put_u8(*slot_num);
                put_vli(&mut buf, *block_num, *block_count);
            }
            Message::Block(data) => {
                buf.put_slice(data);
            }
            Message::CloseSlot { slot_num } => {
                buf.put_u8(*slot_num);
            }
            Message::Peer { slot_num, endpoint } => {
                buf.put_u8(*slot_num);
                match endpoint.ip() {
                    IpAddr::V4(ip) => buf.put_slice(&ip.octets()),
                    IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
                }
                buf.put_u16(endpoint.port());
            }
        }

        buf.freeze()
    }

    /// Decodes one message from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the message is not
    /// yet complete. On success exactly the bytes of the message are consumed.
    pub fn decode(
        buf: &mut BytesMut,
        ctx: &impl DecodeContext,
    ) -> Result<Option<Message>, WireError> {
        let Some(&tag) = buf.first() else {
            return Ok(None);
        };

        match tag {
            TAG_ERROR => {
                buf.advance(1);
                Ok(Some(Message::Error))
            }
            TAG_REQUEST_SLOT => {
                if buf.len() < 1 + HASH_SIZE {
                    return Ok(None);
                }
                buf.advance(1);
                let content_id = ContentId::from_slice(&buf.split_to(HASH_SIZE))
                    .map_err(|e| WireError::Malformed(e.to_string()))?;
                Ok(Some(Message::RequestSlot { content_id }))
            }
            TAG_SLOT => decode_slot(buf),
            TAG_REQUEST_HASH_TREE_BLOCK | TAG_REQUEST_FILE_BLOCK => {
                let kind = if tag == TAG_REQUEST_HASH_TREE_BLOCK {
                    BlockKind::Tree
                } else {
                    BlockKind::File
                };
                let Some(&slot_num) = buf.get(1) else {
                    return Ok(None);
                };
                let block_count = ctx
                    .request_bound(kind, slot_num)
                    .ok_or(WireError::UnknownSlot(slot_num))?;
                let Some(block_num) = decode_block_num(buf, block_count)? else {
                    return Ok(None);
                };
                Ok(Some(Message::RequestBlock {
                    kind,
                    slot_num,
                    block_num,
                    block_count,
                }))
            }
            TAG_HAVE_HASH_TREE_BLOCK | TAG_HAVE_FILE_BLOCK => {
                let kind = if tag == TAG_HAVE_HASH_TREE_BLOCK {
                    BlockKind::Tree
                } else {
                    BlockKind::File
                };
                let Some(&slot_num) = buf.get(1) else {
                    return Ok(None);
                };
                let block_count = ctx
                    .have_bound(kind, slot_num)
                    .ok_or(WireError::UnknownSlot(slot_num))?;
                let Some(block_num) = decode_block_num(buf, block_count)? else {
                    return Ok(None);
                };
                Ok(Some(Message::Have {
                    kind,
                    slot_num,
                    block_num,
                    block_count,
                }))
            }
            TAG_BLOCK => {
                let size = ctx
                    .expected_block_size()
                    .ok_or(WireError::Unexpected(TAG_BLOCK))?;
                if buf.len() < 1 + size {
                    return Ok(None);
                }
                buf.advance(1);
                Ok(Some(Message::Block(buf.split_to(size).freeze())))
            }
            TAG_CLOSE_SLOT => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                buf.advance(1);
                Ok(Some(Message::CloseSlot {
                    slot_num: buf.get_u8(),
                }))
            }
            TAG_PEER_V4 => {
                if buf.len() < 2 + 4 + 2 {
                    return Ok(None);
                }
                buf.advance(1);
                let slot_num = buf.get_u8();
                let ip = Ipv4Addr::from(buf.get_u32());
                let port = buf.get_u16();
                Ok(Some(Message::Peer {
                    slot_num,
                    endpoint: SocketAddr::new(IpAddr::V4(ip), port),
                }))
            }
            TAG_PEER_V6 => {
                if buf.len() < 2 + 16 + 2 {
                    return Ok(None);
                }
                buf.advance(1);
                let slot_num = buf.get_u8();
                let ip = Ipv6Addr::from(buf.get_u128());
                let port = buf.get_u16();
                Ok(Some(Message::Peer {
                    slot_num,
                    endpoint: SocketAddr::new(IpAddr::V6(ip), port),
                }))
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

/// Consumes `tag, slot_num, VLI` and returns the block number.
fn decode_block_num(buf: &mut BytesMut, block_count: u64) -> Result<Option<u64>, WireError> {
    if block_count == 0 {
        return Err(WireError::Malformed("block number for empty transfer".into()));
    }
    let width = vli_size(block_count);
    if buf.len() < 2 + width {
        return Ok(None);
    }
    let frame = buf.split_to(2 + width);
    let block_num = decode_vli(&frame[2..]);
    if block_num >= block_count {
        return Err(WireError::BlockOutOfRange {
            block_num,
            block_count,
        });
    }
    Ok(Some(block_num))
}

fn decode_slot(buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
    if buf.len() < SLOT_HEADER_LEN {
        return Ok(None);
    }

    let status = buf[2];
    if status & !(SLOT_STATUS_TREE_BITFIELD | SLOT_STATUS_FILE_BITFIELD) != 0 {
        return Err(WireError::InvalidStatus(status));
    }

    let mut header = &buf[3..SLOT_HEADER_LEN];
    let file_size = header.get_u64();
    let layout = TreeLayout::new(file_size);

    let tree_count = layout.tree_block_count();
    let file_count = layout.file_block_count();
    let tree_len = if status & SLOT_STATUS_TREE_BITFIELD != 0 {
        bitfield_len(tree_count)?
    } else {
        0
    };
    let file_len = if status & SLOT_STATUS_FILE_BITFIELD != 0 {
        bitfield_len(file_count)?
    } else {
        0
    };
    if tree_len + file_len > MAX_BITFIELD_BYTES {
        return Err(WireError::Malformed(format!(
            "slot bitfields of {} bytes exceed limit",
            tree_len + file_len
        )));
    }
    if buf.len() < SLOT_HEADER_LEN + tree_len + file_len {
        return Ok(None);
    }

    let mut frame = buf.split_to(SLOT_HEADER_LEN + tree_len + file_len).freeze();
    frame.advance(1);
    let slot_num = frame.get_u8();
    frame.advance(1);
    let file_size = frame.get_u64();
    let mut root_hash = [0u8; HASH_SIZE];
    frame.copy_to_slice(&mut root_hash);

    let tree = if status & SLOT_STATUS_TREE_BITFIELD != 0 {
        Coverage::from_wire(frame.split_to(tree_len), tree_count)
    } else {
        Coverage::Complete
    };
    let file = if status & SLOT_STATUS_FILE_BITFIELD != 0 {
        Coverage::from_wire(frame.split_to(file_len), file_count)
    } else {
        Coverage::Complete
    };

    Ok(Some(Message::Slot {
        slot_num,
        file_size,
        root_hash,
        tree,
        file,
    }))
}

fn bitfield_len(block_count: u64) -> Result<usize, WireError> {
    usize::try_from(block_count.div_ceil(8))
        .ok()
        .filter(|&len| len <= MAX_BITFIELD_BYTES)
        .ok_or_else(|| WireError::Malformed(format!("bitfield for {} blocks", block_count)))
}
