use super::*;
use crate::hash_tree::ContentId;
use std::sync::Arc;
use tempfile::TempDir;

fn exercise_store(store: &dyn BlobStore) {
    let blob = store.allocate(32).unwrap();
    assert_eq!(store.size(blob).unwrap(), 32);
    assert_eq!(&store.read(blob, 0, 4).unwrap()[..], &[0, 0, 0, 0]);

    store.write(blob, 28, &[1, 2, 3, 4]).unwrap();
    assert_eq!(&store.read(blob, 28, 4).unwrap()[..], &[1, 2, 3, 4]);

    assert!(matches!(
        store.write(blob, 30, &[1, 2, 3]),
        Err(StorageError::OutOfBounds { .. })
    ));
    assert!(matches!(
        store.read(blob, u64::MAX, 1),
        Err(StorageError::OutOfBounds { .. })
    ));

    store.remove(blob).unwrap();
    assert!(matches!(
        store.read(blob, 0, 1),
        Err(StorageError::UnknownBlob(_))
    ));
    assert!(matches!(store.remove(blob), Err(StorageError::UnknownBlob(_))));
}

#[test]
fn test_memory_store() {
    let store = MemoryBlobStore::new();
    exercise_store(&store);
    assert!(store.is_empty());
}

#[test]
fn test_disk_store() {
    let temp = TempDir::new().unwrap();
    let store = DiskBlobStore::open(temp.path().join("blobs")).unwrap();
    exercise_store(&store);
}

#[test]
fn test_disk_store_allocates_files() {
    let temp = TempDir::new().unwrap();
    let store = DiskBlobStore::open(temp.path()).unwrap();

    let blob = store.allocate(10240).unwrap();
    let entries: Vec<_> = std::fs::read_dir(store.dir()).unwrap().collect();
    assert_eq!(entries.len(), 1);
    let meta = entries[0].as_ref().unwrap().metadata().unwrap();
    assert_eq!(meta.len(), 10240);

    store.remove(blob).unwrap();
    assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
}

#[test]
fn test_hash_index() {
    let store = Arc::new(MemoryBlobStore::new());
    let index = HashIndex::new(store.clone());
    let id = ContentId::from_bytes([3u8; 20]);

    let record = index.add(id, 60).unwrap();
    assert_eq!(record.size, 60);
    assert_eq!(record.state, TreeState::Downloading);
    assert_eq!(store.size(record.blob).unwrap(), 60);

    assert!(matches!(
        index.add(id, 60),
        Err(StorageError::AlreadyExists(_))
    ));

    index.set_state(&id, TreeState::Complete).unwrap();
    assert_eq!(index.find(&id).unwrap().state, TreeState::Complete);

    index.remove(&id).unwrap();
    assert!(index.find(&id).is_none());
    assert!(store.is_empty());
    assert!(matches!(index.remove(&id), Err(StorageError::NotFound(_))));
}
