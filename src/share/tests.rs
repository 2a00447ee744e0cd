use super::*;
use crate::constants::{FILE_BLOCK_SIZE, HASH_SIZE};
use crate::hash_tree::{CheckOutcome, ContentId};
use crate::scheduler::{ConnectionId, Coverage};
use crate::storage::{HashIndex, MemoryBlobStore};
use crate::wire::BlockKind;
use rand::Rng;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;

fn random_data(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill(&mut data[..]);
    data
}

fn new_share() -> (Arc<MemoryBlobStore>, Share) {
    let store = Arc::new(MemoryBlobStore::new());
    let index = Arc::new(HashIndex::new(store.clone()));
    (store.clone(), Share::new(index, store))
}

fn seed(share: &Share, data: &[u8]) -> Arc<Transfer> {
    share
        .add_source(&mut Cursor::new(data), data.len() as u64)
        .unwrap()
        .transfer()
        .unwrap()
}

fn resolve(share: &Share, source: &Transfer) -> Arc<Transfer> {
    share
        .add_download(source.id())
        .set_unknown(source.file_size(), &source.root_hash().unwrap())
        .unwrap()
}

fn conn(id: u64) -> ConnectionId {
    ConnectionId(id)
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[test]
fn test_seeded_transfer_serves_blocks() {
    let (_store, share) = new_share();
    let data = random_data(2 * FILE_BLOCK_SIZE as usize + 10);
    let transfer = seed(&share, &data);

    assert!(transfer.complete());
    assert_eq!(transfer.percent_complete(), 100);
    assert_eq!(transfer.file_block_count(), 3);
    assert_eq!(&transfer.read_file_block(2).unwrap()[..], &data[2 * FILE_BLOCK_SIZE as usize..]);
    assert_eq!(transfer.read_tree_block(0).unwrap().len(), HASH_SIZE);
    assert!(matches!(
        transfer.read_file_block(3),
        Err(TransferError::NotHeld { kind: BlockKind::File, block: 3 })
    ));
}

#[test]
fn test_add_source_twice_returns_existing() {
    let (store, share) = new_share();
    let data = random_data(5000);

    let first = share.add_source(&mut Cursor::new(&data), 5000).unwrap();
    let blobs = store.len();
    let second = share.add_source(&mut Cursor::new(&data), 5000).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(store.len(), blobs);
    assert_eq!(share.len(), 1);
}

#[test]
fn test_download_between_transfers() {
    let (_, seeder_share) = new_share();
    let data = random_data(600 * FILE_BLOCK_SIZE as usize + 77);
    let seeder = seed(&seeder_share, &data);

    let (_, share) = new_share();
    let transfer = resolve(&share, &seeder);
    assert!(!transfer.complete());

    let from = conn(1);
    let _reg = transfer
        .download_reg(from, None, Coverage::Complete, Coverage::Complete)
        .unwrap();

    // Only the root is held, so only its children can be requested.
    assert_eq!(transfer.next_request_file(from), None);
    let mut count = 0;
    while let Some(request) = transfer.next_request_tree(from) {
        let block = seeder.read_tree_block(request.block_num).unwrap();
        assert_eq!(block.len(), request.block_size);
        assert_eq!(
            transfer.write_tree_block(from, request.block_num, &block).unwrap(),
            WriteStatus::Good
        );
        count += 1;
    }
    assert_eq!(count, transfer.tree_block_count() - 1);
    assert_eq!(transfer.hash_tree().check().unwrap(), CheckOutcome::Good);

    while let Some(request) = transfer.next_request_file(from) {
        let block = seeder.read_file_block(request.block_num).unwrap();
        assert_eq!(block.len(), request.block_size);
        assert_eq!(
            transfer.write_file_block(from, request.block_num, &block).unwrap(),
            WriteStatus::Good
        );
    }

    assert!(transfer.complete());
    let last = transfer.file_block_count() - 1;
    assert_eq!(transfer.read_file_block(last).unwrap().len(), 77);
}

#[test]
fn test_bad_and_late_blocks() {
    let (_, seeder_share) = new_share();
    let data = random_data(3 * FILE_BLOCK_SIZE as usize);
    let seeder = seed(&seeder_share, &data);

    let (_, share) = new_share();
    let transfer = resolve(&share, &seeder);
    let from = conn(1);
    let _reg = transfer
        .download_reg(from, None, Coverage::Complete, Coverage::Complete)
        .unwrap();

    let leaves = transfer.next_request_tree(from).unwrap();
    assert_eq!(leaves.block_num, 1);
    let block = seeder.read_tree_block(1).unwrap();
    transfer.write_tree_block(from, 1, &block).unwrap();
    assert!(transfer.hash_tree().is_complete());

    let request = transfer.next_request_file(from).unwrap();
    let mut block = seeder.read_file_block(request.block_num).unwrap().to_vec();
    block[0] ^= 1;
    assert_eq!(
        transfer.write_file_block(from, request.block_num, &block).unwrap(),
        WriteStatus::Bad
    );
    block[0] ^= 1;
    assert_eq!(
        transfer.write_file_block(from, request.block_num, &block).unwrap(),
        WriteStatus::Good
    );
    assert_eq!(
        transfer.write_file_block(conn(2), request.block_num, &block).unwrap(),
        WriteStatus::Late
    );
    assert_eq!(transfer.status().file_percent, 33);
}

#[test]
fn test_have_reaches_upload_peers() {
    let (_, seeder_share) = new_share();
    let data = random_data(2 * FILE_BLOCK_SIZE as usize);
    let seeder = seed(&seeder_share, &data);

    let (_, share) = new_share();
    let transfer = resolve(&share, &seeder);

    let (tick, mut ticks) = unbounded_channel();
    let (_upload, tree, file) = transfer.upload_reg(conn(9), None, tick).unwrap();
    assert!(!tree.is_complete());
    assert!(tree.has(0));
    assert!(!file.is_complete());

    let from = conn(1);
    let _reg = transfer
        .download_reg(from, None, Coverage::Complete, Coverage::Complete)
        .unwrap();
    let leaves = seeder.read_tree_block(1).unwrap();
    transfer.write_tree_block(from, 1, &leaves).unwrap();
    assert_eq!(ticks.try_recv().unwrap(), conn(9));
    assert_eq!(transfer.next_have_tree(conn(9)), Some(1));

    let request = transfer.next_request_file(from).unwrap();
    let block = seeder.read_file_block(request.block_num).unwrap();
    transfer.write_file_block(from, request.block_num, &block).unwrap();

    assert_eq!(ticks.try_recv().unwrap(), conn(9));
    assert_eq!(transfer.next_have_file(conn(9)), Some(request.block_num));
    assert_eq!(transfer.next_have_file(conn(9)), None);
}

#[test]
fn test_peer_exchange() {
    let (_, share) = new_share();
    let transfer = seed(&share, &random_data(100));
    let (tick, _ticks) = unbounded_channel();

    let (first, _, _) = transfer.upload_reg(conn(1), Some(addr(1001)), tick.clone()).unwrap();
    let (_second, _, _) = transfer.upload_reg(conn(2), Some(addr(1002)), tick.clone()).unwrap();

    assert_eq!(transfer.next_peer(conn(1)), Some(addr(1002)));
    assert_eq!(transfer.next_peer(conn(1)), None);
    assert_eq!(transfer.next_peer(conn(2)), Some(addr(1001)));
    assert_eq!(transfer.next_peer(conn(2)), None);

    drop(first);
    let (_third, _, _) = transfer.upload_reg(conn(3), None, tick).unwrap();
    assert_eq!(transfer.next_peer(conn(3)), Some(addr(1002)));
    assert_eq!(transfer.next_peer(conn(3)), None);
}

#[test]
fn test_set_unknown_rejects_mismatch() {
    let (_, share) = new_share();
    let file = share.add_download(ContentId::from_bytes([7; HASH_SIZE]));
    assert!(file.transfer().is_none());
    assert!(matches!(
        file.set_unknown(100, &[1; HASH_SIZE]),
        Err(TransferError::ContentMismatch(_))
    ));
    assert!(file.transfer().is_none());
}

#[test]
fn test_set_unknown_is_stable() {
    let (_, seeder_share) = new_share();
    let seeder = seed(&seeder_share, &random_data(1000));

    let (_, share) = new_share();
    let first = resolve(&share, &seeder);
    let second = resolve(&share, &seeder);
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn test_garbage_collect_frees_storage() {
    let (store, share) = new_share();
    let data = random_data(3000);
    let id = seed(&share, &data).id();
    assert_eq!(store.len(), 2);

    let file = share.find(&id).unwrap();
    share.remove(&id);
    assert!(share.find(&id).is_none());

    share.garbage_collect();
    assert_eq!(store.len(), 2, "entry still referenced");

    drop(file);
    share.garbage_collect();
    assert!(share.is_empty());
    // The complete tree stays cached in the index.
    assert_eq!(store.len(), 1);
    assert!(share.index().contains(&id));
}

#[test]
fn test_garbage_collect_drops_partial_download() {
    let (_, seeder_share) = new_share();
    let seeder = seed(&seeder_share, &random_data(600 * FILE_BLOCK_SIZE as usize));

    let (store, share) = new_share();
    let transfer = resolve(&share, &seeder);
    let id = transfer.id();
    drop(transfer);

    share.remove(&id);
    share.garbage_collect();
    assert!(!share.index().contains(&id));
    assert!(store.is_empty());
}

#[test]
fn test_add_source_completes_partial_download() {
    let (_seeder_store, seeder_share) = new_share();
    let data = random_data(2 * FILE_BLOCK_SIZE as usize + 10);
    let source = seed(&seeder_share, &data);

    let (_store, share) = new_share();
    let partial = resolve(&share, &source);
    assert!(!partial.hash_tree().is_complete());

    let transfer = seed(&share, &data);
    assert!(transfer.complete());
    assert!(transfer.hash_tree().is_complete());
    assert_eq!(transfer.hash_tree().check().unwrap(), CheckOutcome::Good);
    assert_eq!(
        transfer.read_tree_block(1).unwrap(),
        source.read_tree_block(1).unwrap()
    );
    assert!(Arc::ptr_eq(
        &share.find(&source.id()).unwrap().transfer().unwrap(),
        &transfer
    ));
}
