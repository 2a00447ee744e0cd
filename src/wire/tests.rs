use super::*;
use crate::constants::{FILE_BLOCK_SIZE, HASH_SIZE, TAG_BLOCK};
use crate::hash_tree::{ContentId, TreeLayout};
use crate::scheduler::{Bitfield, Coverage};
use bytes::{BufMut, BytesMut};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Default)]
struct Ctx {
    block_size: Option<usize>,
    requests: HashMap<(BlockKind, u8), u64>,
    haves: HashMap<(BlockKind, u8), u64>,
}

impl DecodeContext for Ctx {
    fn expected_block_size(&self) -> Option<usize> {
        self.block_size
    }

    fn request_bound(&self, kind: BlockKind, slot_num: u8) -> Option<u64> {
        self.requests.get(&(kind, slot_num)).copied()
    }

    fn have_bound(&self, kind: BlockKind, slot_num: u8) -> Option<u64> {
        self.haves.get(&(kind, slot_num)).copied()
    }
}

fn decode_all(bytes: &[u8], ctx: &Ctx) -> Message {
    let mut buf = BytesMut::from(bytes);
    let msg = Message::decode(&mut buf, ctx).unwrap().unwrap();
    assert!(buf.is_empty(), "decoder left {} bytes", buf.len());
    msg
}

#[test]
fn test_vli_size() {
    assert_eq!(vli_size(1), 1);
    assert_eq!(vli_size(256), 1);
    assert_eq!(vli_size(257), 2);
    assert_eq!(vli_size(65536), 2);
    assert_eq!(vli_size(65537), 3);
    assert_eq!(vli_size(u64::MAX), 8);
}

#[test]
fn test_vli_encoding() {
    assert_eq!(&encode_vli(5, 10)[..], &[0x05]);
    assert_eq!(&encode_vli(0x1234, 70000)[..], &[0x00, 0x12, 0x34]);
    assert_eq!(decode_vli(&[0x00, 0x12, 0x34]), 0x1234);
    assert_eq!(decode_vli(&[0xff; 8]), u64::MAX);
}

#[test]
fn test_vli_roundtrip_across_bounds() {
    let mut rng = rand::thread_rng();
    for bound in [1, 2, 255, 256, 257, 65536, 1 << 40, u64::MAX] {
        let mut values = vec![0, bound - 1, bound / 2];
        values.extend((0..64).map(|_| rng.gen_range(0..bound)));
        for value in values {
            let encoded = encode_vli(value, bound);
            assert_eq!(encoded.len(), vli_size(bound), "value {value} bound {bound}");
            assert_eq!(decode_vli(&encoded), value, "bound {bound}");
        }
    }
}

#[test]
fn test_request_slot_encoding() {
    let content_id = ContentId::from_bytes([7u8; HASH_SIZE]);
    let msg = Message::RequestSlot { content_id };
    let encoded = msg.encode();

    assert_eq!(encoded.len(), 1 + HASH_SIZE);
    assert_eq!(encoded[0], 1);
    assert_eq!(decode_all(&encoded, &Ctx::default()), msg);
}

#[test]
fn test_request_block_uses_bound_width() {
    let msg = Message::RequestBlock {
        kind: BlockKind::File,
        slot_num: 3,
        block_num: 300,
        block_count: 1000,
    };
    let encoded = msg.encode();
    assert_eq!(&encoded[..], &[4, 3, 0x01, 0x2c]);

    let mut ctx = Ctx::default();
    ctx.requests.insert((BlockKind::File, 3), 1000);
    assert_eq!(decode_all(&encoded, &ctx), msg);
}

#[test]
fn test_request_block_out_of_range() {
    let mut ctx = Ctx::default();
    ctx.requests.insert((BlockKind::Tree, 0), 2);

    let mut buf = BytesMut::from(&[3u8, 0, 2][..]);
    let err = Message::decode(&mut buf, &ctx).unwrap_err();
    assert_eq!(
        err,
        WireError::BlockOutOfRange {
            block_num: 2,
            block_count: 2
        }
    );
}

#[test]
fn test_request_unknown_slot() {
    let mut buf = BytesMut::from(&[4u8, 9, 0][..]);
    let err = Message::decode(&mut buf, &Ctx::default()).unwrap_err();
    assert_eq!(err, WireError::UnknownSlot(9));
}

#[test]
fn test_have_decodes_against_download_bounds() {
    let mut ctx = Ctx::default();
    ctx.haves.insert((BlockKind::Tree, 1), 3);

    let msg = decode_all(&[6, 1, 2], &ctx);
    assert_eq!(
        msg,
        Message::Have {
            kind: BlockKind::Tree,
            slot_num: 1,
            block_num: 2,
            block_count: 3,
        }
    );

    // Upload-side bounds must not be used for haves.
    let mut buf = BytesMut::from(&[7u8, 1, 0][..]);
    assert_eq!(
        Message::decode(&mut buf, &ctx).unwrap_err(),
        WireError::UnknownSlot(1)
    );
}

#[test]
fn test_block_requires_expectation() {
    let mut buf = BytesMut::from(&[TAG_BLOCK, 1, 2, 3][..]);
    assert_eq!(
        Message::decode(&mut buf, &Ctx::default()).unwrap_err(),
        WireError::Unexpected(TAG_BLOCK)
    );

    let ctx = Ctx {
        block_size: Some(3),
        ..Default::default()
    };
    let mut buf = BytesMut::from(&[TAG_BLOCK, 1, 2, 3, 8][..]);
    let msg = Message::decode(&mut buf, &ctx).unwrap().unwrap();
    assert_eq!(msg, Message::Block(bytes::Bytes::from_static(&[1, 2, 3])));
    assert_eq!(&buf[..], &[8]);
}

#[test]
fn test_incomplete_input_is_not_consumed() {
    let content_id = ContentId::from_bytes([1u8; HASH_SIZE]);
    let encoded = Message::RequestSlot { content_id }.encode();

    let mut buf = BytesMut::from(&encoded[..10]);
    assert!(Message::decode(&mut buf, &Ctx::default()).unwrap().is_none());
    assert_eq!(buf.len(), 10);

    buf.put_slice(&encoded[10..]);
    assert!(Message::decode(&mut buf, &Ctx::default()).unwrap().is_some());
}

#[test]
fn test_unknown_tag() {
    let mut buf = BytesMut::from(&[0x42u8][..]);
    assert_eq!(
        Message::decode(&mut buf, &Ctx::default()).unwrap_err(),
        WireError::UnknownTag(0x42)
    );
}

#[test]
fn test_slot_complete_omits_bitfields() {
    let msg = Message::Slot {
        slot_num: 4,
        file_size: 3 * FILE_BLOCK_SIZE + 1,
        root_hash: [9u8; HASH_SIZE],
        tree: Coverage::Complete,
        file: Coverage::Complete,
    };
    let encoded = msg.encode();

    assert_eq!(encoded.len(), 31);
    assert_eq!(encoded[2], 0);
    assert_eq!(decode_all(&encoded, &Ctx::default()), msg);
}

#[test]
fn test_slot_with_partial_bitfields() {
    let file_size = 20 * FILE_BLOCK_SIZE;
    let layout = TreeLayout::new(file_size);

    let mut file_bits = Bitfield::new(layout.file_block_count());
    file_bits.set(0);
    file_bits.set(19);
    let tree_bits = Bitfield::new(layout.tree_block_count());

    let msg = Message::Slot {
        slot_num: 0,
        file_size,
        root_hash: [1u8; HASH_SIZE],
        tree: Coverage::Partial(tree_bits),
        file: Coverage::Partial(file_bits),
    };
    let encoded = msg.encode();

    // Two tree blocks, twenty file blocks.
    assert_eq!(encoded[2], 0x03);
    assert_eq!(encoded.len(), 31 + 1 + 3);
    assert_eq!(decode_all(&encoded, &Ctx::default()), msg);
}

#[test]
fn test_slot_full_bitfield_collapses_to_complete() {
    let file_size = 2 * FILE_BLOCK_SIZE;
    let mut bytes = BytesMut::new();
    bytes.put_u8(2);
    bytes.put_u8(0);
    bytes.put_u8(0x02);
    bytes.put_u64(file_size);
    bytes.put_slice(&[0u8; HASH_SIZE]);
    bytes.put_u8(0xc0);

    match decode_all(&bytes, &Ctx::default()) {
        Message::Slot { tree, file, .. } => {
            assert!(tree.is_complete());
            assert!(file.is_complete());
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn test_slot_invalid_status() {
    let mut bytes = BytesMut::new();
    bytes.put_u8(2);
    bytes.put_u8(0);
    bytes.put_u8(0x04);
    bytes.put_u64(1);
    bytes.put_slice(&[0u8; HASH_SIZE]);

    let mut buf = bytes;
    assert_eq!(
        Message::decode(&mut buf, &Ctx::default()).unwrap_err(),
        WireError::InvalidStatus(0x04)
    );
}

#[test]
fn test_peer_endpoints() {
    let v4: SocketAddr = "192.168.1.20:6881".parse().unwrap();
    let msg = Message::Peer {
        slot_num: 2,
        endpoint: v4,
    };
    let encoded = msg.encode();
    assert_eq!(encoded.len(), 8);
    assert_eq!(decode_all(&encoded, &Ctx::default()), msg);

    let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
    let msg = Message::Peer {
        slot_num: 2,
        endpoint: v6,
    };
    let encoded = msg.encode();
    assert_eq!(encoded.len(), 20);
    assert_eq!(decode_all(&encoded, &Ctx::default()), msg);
}

#[test]
fn test_close_slot_and_error() {
    assert_eq!(&Message::CloseSlot { slot_num: 7 }.encode()[..], &[8, 7]);
    assert_eq!(&Message::Error.encode()[..], &[0]);
    assert_eq!(decode_all(&[8, 7], &Ctx::default()), Message::CloseSlot { slot_num: 7 });
    assert_eq!(decode_all(&[0], &Ctx::default()), Message::Error);
}
