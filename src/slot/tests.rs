use super::*;
use crate::constants::{FILE_BLOCK_SIZE, TAG_SLOT};
use crate::hash_tree::{CheckOutcome, ContentId};
use crate::scheduler::{ConnectionId, Coverage};
use crate::share::Share;
use crate::storage::{HashIndex, MemoryBlobStore};
use crate::wire::{BlockKind, Message, WireError};
use bytes::{Bytes, BytesMut};
use rand::Rng;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

fn random_data(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill(&mut data[..]);
    data
}

fn new_share() -> Arc<Share> {
    let store = Arc::new(MemoryBlobStore::new());
    let index = Arc::new(HashIndex::new(store.clone()));
    Arc::new(Share::new(index, store))
}

fn seeded(data: &[u8]) -> (Arc<Share>, ContentId) {
    let share = new_share();
    let id = share
        .add_source(&mut Cursor::new(data), data.len() as u64)
        .unwrap()
        .id();
    (share, id)
}

fn manager(
    share: &Arc<Share>,
    config: SlotConfig,
) -> (
    SlotManager,
    UnboundedReceiver<ConnectionId>,
    UnboundedReceiver<PeerAnnouncement>,
) {
    let (ticks, tick_rx) = unbounded_channel();
    let (peers, peer_rx) = unbounded_channel();
    (
        SlotManager::new(Arc::clone(share), config, ticks, peers),
        tick_rx,
        peer_rx,
    )
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}

/// Delivers everything `from` queued to `to`, returning what `to` made of it.
fn deliver(from: &mut SlotManager, to: &mut SlotManager) -> Result<(), SlotError> {
    let mut buf = BytesMut::new();
    for out in from.drain_outbound() {
        buf.extend_from_slice(out.bytes());
        if let Outbound::Block(_) = out {
            from.sent_block();
        }
    }
    to.recv(&mut buf)
}

/// Delivers everything `from` queued to `to`. Returns false if nothing was
/// queued.
fn pump(from: &mut SlotManager, to: &mut SlotManager) -> bool {
    let outbound = from.drain_outbound();
    if outbound.is_empty() {
        return false;
    }
    let mut buf = BytesMut::new();
    for out in outbound {
        buf.extend_from_slice(out.bytes());
        if let Outbound::Block(_) = out {
            from.sent_block();
        }
    }
    to.recv(&mut buf).unwrap();
    assert!(buf.is_empty());
    true
}

fn run(a: &mut SlotManager, b: &mut SlotManager) {
    for _ in 0..1000 {
        a.tick();
        b.tick();
        let sent = pump(a, b);
        let received = pump(b, a);
        if !sent && !received {
            return;
        }
    }
    panic!("exchange did not settle");
}

#[test]
fn test_two_peer_transfer() {
    let data = random_data(3 * FILE_BLOCK_SIZE as usize + 1);
    let (seeder_share, id) = seeded(&data);
    let leecher_share = new_share();
    leecher_share.add_download(id);

    let (mut seeder, _, _) = manager(&seeder_share, SlotConfig::default());
    let (mut leecher, _, _) = manager(&leecher_share, SlotConfig::default());
    leecher.add(id);
    run(&mut seeder, &mut leecher);

    let transfer = leecher_share.find(&id).unwrap().transfer().unwrap();
    assert!(transfer.complete());
    assert_eq!(transfer.hash_tree().check().unwrap(), CheckOutcome::Good);

    let mut received = Vec::new();
    for block in 0..transfer.file_block_count() {
        received.extend_from_slice(&transfer.read_file_block(block).unwrap());
    }
    assert_eq!(received, data);

    // The finished download closed its slot on both ends.
    assert_eq!(leecher.download_slots(), 0);
    assert_eq!(seeder.upload_slots(), 0);
    assert!(leecher.is_empty());
    assert!(seeder.is_empty());
}

#[test]
fn test_overpipelined_request_is_refused() {
    let data = random_data(8 * FILE_BLOCK_SIZE as usize);
    let (share, id) = seeded(&data);
    let config = SlotConfig {
        max_block_pipeline: 4,
        ..SlotConfig::default()
    };
    let (mut seeder, _, _) = manager(&share, config);

    let mut buf = BytesMut::from(&Message::RequestSlot { content_id: id }.encode()[..]);
    seeder.recv(&mut buf).unwrap();
    let grant = seeder.drain_outbound();
    assert_eq!(grant.len(), 1);
    assert_eq!(grant[0].bytes()[0], TAG_SLOT);

    let request = |block_num| {
        Message::RequestBlock {
            kind: BlockKind::File,
            slot_num: 0,
            block_num,
            block_count: 8,
        }
        .encode()
    };
    for block_num in 0..5 {
        buf.extend_from_slice(&request(block_num));
    }
    let err = seeder.recv(&mut buf).unwrap_err();
    assert!(matches!(err, SlotError::Overpipelined));
    assert!(err.is_protocol_violation());
    assert!(buf.is_empty());
    assert_eq!(seeder.pipeline_in(), 4);

    // The four requests within the limit were still served.
    let blocks = seeder.drain_outbound();
    assert_eq!(blocks.len(), 4);
    assert!(blocks.iter().all(|out| matches!(out, Outbound::Block(_))));
}

#[test]
fn test_mismatched_pipeline_limits_fail_the_connection() {
    let data = random_data(40 * FILE_BLOCK_SIZE as usize);
    let (seeder_share, id) = seeded(&data);
    let leecher_share = new_share();
    leecher_share.add_download(id);

    let (mut seeder, _, _) = manager(
        &seeder_share,
        SlotConfig {
            max_block_pipeline: 2,
            ..SlotConfig::default()
        },
    );
    let (mut leecher, _, _) = manager(
        &leecher_share,
        SlotConfig {
            max_block_pipeline: 4,
            ..SlotConfig::default()
        },
    );
    leecher.add(id);

    let mut failure = None;
    for _ in 0..100 {
        seeder.tick();
        leecher.tick();
        if let Err(e) = deliver(&mut leecher, &mut seeder) {
            failure = Some(e);
            break;
        }
        if let Err(e) = deliver(&mut seeder, &mut leecher) {
            failure = Some(e);
            break;
        }
    }

    let err = failure.expect("leecher overran the seeder's pipeline");
    assert!(matches!(err, SlotError::Overpipelined));
    assert!(err.is_protocol_violation());
}

#[test]
fn test_slot_violations() {
    let (share, id) = seeded(&random_data(1000));
    let (mut seeder, _, _) = manager(&share, SlotConfig::default());

    let mut buf = BytesMut::from(&Message::CloseSlot { slot_num: 3 }.encode()[..]);
    let err = seeder.recv(&mut buf).unwrap_err();
    assert!(matches!(err, SlotError::NotOpen(3)));
    assert!(err.is_protocol_violation());

    let request = Message::RequestBlock {
        kind: BlockKind::File,
        slot_num: 0,
        block_num: 0,
        block_count: 1,
    }
    .encode();

    // Slot 0 was never granted.
    buf.extend_from_slice(&request);
    let err = seeder.recv(&mut buf).unwrap_err();
    assert!(matches!(err, SlotError::Wire(WireError::UnknownSlot(0))));
    buf.clear();

    // A request crossing a close is answered with an error.
    buf.extend_from_slice(&Message::RequestSlot { content_id: id }.encode());
    buf.extend_from_slice(&Message::CloseSlot { slot_num: 0 }.encode());
    buf.extend_from_slice(&request);
    seeder.recv(&mut buf).unwrap();
    let out = seeder.drain_outbound();
    assert_eq!(out.len(), 2);
    assert_eq!(out[1], Outbound::Message(Message::Error.encode()));

    buf.extend_from_slice(&Message::CloseSlot { slot_num: 0 }.encode());
    assert!(seeder.recv(&mut buf).unwrap_err().is_protocol_violation());

    let mut buf = BytesMut::from(&Message::Error.encode()[..]);
    assert!(matches!(
        seeder.recv(&mut buf),
        Err(SlotError::Wire(WireError::Unexpected(0)))
    ));
}

#[test]
fn test_grant_for_other_content_is_violation() {
    let (_seeder_share, id) = seeded(&random_data(1000));
    let leecher_share = new_share();
    leecher_share.add_download(id);

    let (mut leecher, _, _) = manager(&leecher_share, SlotConfig::default());
    leecher.add(id);
    leecher.tick();
    assert_eq!(leecher.drain_outbound().len(), 1);

    let mut buf = BytesMut::from(
        &Message::Slot {
            slot_num: 0,
            file_size: 1000,
            root_hash: [0; 20],
            tree: Coverage::Complete,
            file: Coverage::Complete,
        }
        .encode()[..],
    );
    let err = leecher.recv(&mut buf).unwrap_err();
    assert!(matches!(err, SlotError::ContentMismatch(got) if got == id));
    assert!(err.is_protocol_violation());
}

#[test]
fn test_duplicate_grant_is_violation() {
    let data = random_data(1000);
    let (seeder_share, first) = seeded(&data);
    let second = seeder_share
        .add_source(&mut Cursor::new(random_data(2000)), 2000)
        .unwrap()
        .id();
    let leecher_share = new_share();
    leecher_share.add_download(first);
    leecher_share.add_download(second);

    let (mut leecher, _, _) = manager(&leecher_share, SlotConfig::default());
    leecher.add(first);
    leecher.add(second);
    leecher.tick();
    assert_eq!(leecher.drain_outbound().len(), 2);

    let grant = |id: ContentId| {
        let transfer = seeder_share.find(&id).unwrap().transfer().unwrap();
        Message::Slot {
            slot_num: 0,
            file_size: transfer.file_size(),
            root_hash: transfer.root_hash().unwrap(),
            tree: Coverage::Complete,
            file: Coverage::Complete,
        }
        .encode()
    };
    let mut buf = BytesMut::from(&grant(first)[..]);
    leecher.recv(&mut buf).unwrap();
    assert_eq!(leecher.download_slots(), 1);

    buf.extend_from_slice(&grant(second));
    assert!(matches!(
        leecher.recv(&mut buf),
        Err(SlotError::DuplicateSlot(0))
    ));
}

#[test]
fn test_refused_slot_request() {
    let seeder_share = new_share();
    let leecher_share = new_share();
    let id = ContentId::from_bytes([9; 20]);
    leecher_share.add_download(id);

    let (mut seeder, _, _) = manager(&seeder_share, SlotConfig::default());
    let (mut leecher, _, _) = manager(&leecher_share, SlotConfig::default());
    leecher.add(id);
    run(&mut seeder, &mut leecher);

    assert_eq!(leecher.download_slots(), 0);
    assert!(leecher.is_empty());
}

#[test]
fn test_disconnect_releases_requests() {
    let data = random_data(600 * FILE_BLOCK_SIZE as usize);
    let (seeder_share, id) = seeded(&data);
    let leecher_share = new_share();
    leecher_share.add_download(id);

    let (mut first_seeder, _, _) = manager(&seeder_share, SlotConfig::default());
    let (mut first, _, _) = manager(&leecher_share, SlotConfig::default());
    first.add(id);
    first.tick();
    pump(&mut first, &mut first_seeder);
    pump(&mut first_seeder, &mut first);
    first.tick();

    let transfer = leecher_share.find(&id).unwrap().transfer().unwrap();
    let gone = first.connection();
    assert_eq!(transfer.inflight_for(BlockKind::Tree, gone), vec![1]);
    assert_eq!(first.pipeline_out(), 1);

    drop(first);
    assert!(transfer.inflight_for(BlockKind::Tree, gone).is_empty());
    assert_eq!(transfer.status().downloading_from, 0);

    let (mut second_seeder, _, _) = manager(&seeder_share, SlotConfig::default());
    let (mut second, _, _) = manager(&leecher_share, SlotConfig::default());
    second.add(id);
    run(&mut second_seeder, &mut second);
    assert!(transfer.complete());
}

#[test]
fn test_bad_block_closes_slot() {
    let data = random_data(2 * FILE_BLOCK_SIZE as usize);
    let (seeder_share, id) = seeded(&data);
    let leecher_share = new_share();
    leecher_share.add_download(id);

    let (mut seeder, _, _) = manager(&seeder_share, SlotConfig::default());
    let (mut leecher, _, _) = manager(&leecher_share, SlotConfig::default());
    leecher.add(id);
    leecher.tick();
    pump(&mut leecher, &mut seeder);
    pump(&mut seeder, &mut leecher);
    leecher.tick();
    assert_eq!(leecher.pipeline_out(), 1);
    leecher.drain_outbound();

    // Answer the tree block request with garbage of the right size.
    let mut buf = BytesMut::from(&Message::Block(Bytes::from(vec![0u8; 40])).encode()[..]);
    leecher.recv(&mut buf).unwrap();
    assert_eq!(leecher.pipeline_out(), 0);
    assert_eq!(leecher.download_slots(), 0);
    assert_eq!(
        leecher.drain_outbound(),
        vec![Outbound::Message(Message::CloseSlot { slot_num: 0 }.encode())]
    );
}

#[test]
fn test_peer_exchange_over_slots() {
    let (seeder_share, id) = seeded(&random_data(5000));

    let (mut to_first, _, _) = manager(&seeder_share, SlotConfig::default());
    let (mut to_second, _, _) = manager(&seeder_share, SlotConfig::default());
    to_first.set_remote_listen(addr(7001));
    to_second.set_remote_listen(addr(7002));

    let first_share = new_share();
    let second_share = new_share();
    first_share.add_download(id);
    second_share.add_download(id);
    let (mut first, _, mut first_peers) = manager(&first_share, SlotConfig::default());
    let (mut second, _, mut second_peers) = manager(&second_share, SlotConfig::default());
    first.add(id);
    second.add(id);

    for (seeder, leecher) in [(&mut to_first, &mut first), (&mut to_second, &mut second)] {
        leecher.tick();
        pump(leecher, seeder);
        pump(seeder, leecher);
    }

    to_first.tick();
    to_second.tick();
    pump(&mut to_first, &mut first);
    pump(&mut to_second, &mut second);

    assert_eq!(
        first_peers.try_recv().unwrap(),
        PeerAnnouncement {
            content_id: id,
            endpoint: addr(7002)
        }
    );
    assert_eq!(second_peers.try_recv().unwrap().endpoint, addr(7001));
    assert!(first_peers.try_recv().is_err());
}
