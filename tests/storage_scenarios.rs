//! End-to-end behaviour of the storage stack across reopen boundaries.

use indexio::index::{KeyToValueContainerStore, StoreOptions};
use indexio::storage::{
    CreationOptions, EnumerationCache, Enumerator, EnumeratorOptions, KeyRepresentation,
    ResizableFile, ResizableFileOptions, StringDescriptor, ValueLog,
};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn string_store(path: &Path, cache_size: usize) -> KeyToValueContainerStore<String, String> {
    KeyToValueContainerStore::open(
        path,
        KeyRepresentation::indirect(StringDescriptor),
        Arc::new(StringDescriptor),
        StoreOptions::default().cache_size(cache_size),
        None,
    )
    .unwrap()
}

fn open_enumerator(path: &Path, version: u32) -> indexio::storage::StorageResult<Enumerator<String>> {
    Enumerator::open(
        path,
        KeyRepresentation::indirect(StringDescriptor),
        &EnumeratorOptions::default().version(version),
        None,
    )
}

#[test]
fn test_evicted_container_reloads_lazily() {
    let dir = tempdir().unwrap();
    let store = string_store(&dir.path().join("idx"), 2);

    store.add_value(&"k1".to_string(), 1, "a".to_string()).unwrap();
    store.add_value(&"k2".to_string(), 2, "b".to_string()).unwrap();
    store.add_value(&"k3".to_string(), 3, "c".to_string()).unwrap();

    // k1 and k2 were pushed out of the cache and written back without a flush
    assert_eq!(store.stats().live_keys, 2);

    let k1 = store.read(&"k1".to_string()).unwrap();
    assert_eq!(k1.value_of(1), Some(&"a".to_string()));
    assert_eq!(k1.input_ids(), vec![1]);
}

#[test]
fn test_flushed_containers_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idx");
    let triples: Vec<(String, u32, String)> = (0..200u32)
        .map(|i| (format!("key-{}", i % 70), i, format!("value-{}", i)))
        .collect();
    {
        let store = string_store(&path, 8);
        for (key, input, value) in &triples {
            store.add_value(key, *input, value.clone()).unwrap();
        }
        store.flush().unwrap();
        store.close().unwrap();
    }

    let store = string_store(&path, 8);
    for (key, input, value) in &triples {
        let container = store.read(key).unwrap();
        assert_eq!(container.value_of(*input), Some(value), "{} / {}", key, input);
    }
}

#[test]
fn test_incremental_appends_concatenate() {
    let dir = tempdir().unwrap();
    let mut log = ValueLog::open(dir.path().join("values"), CreationOptions::default()).unwrap();

    let parts: [Vec<u8>; 3] = [vec![1u8; 10], vec![2u8; 20], vec![3u8; 5]];
    let mut tail = 0;
    let mut sizes = Vec::new();
    for part in &parts {
        let next = log.append_bytes(part, tail).unwrap();
        assert!(next > tail);
        tail = next;
        sizes.push(log.size());
    }
    assert!(sizes.windows(2).all(|w| w[0] < w[1]));

    let result = log.read_bytes(tail).unwrap();
    assert_eq!(result.bytes.len(), 35);
    assert_eq!(result.bytes, parts.concat());
    assert_eq!(result.chunk_count, 3);

    let compacted = log.compact_chunks(None, &result).unwrap();
    let reread = log.read_bytes(compacted).unwrap();
    assert_eq!(reread.bytes, result.bytes);
    assert_eq!(reread.chunk_count, 1);
}

#[test]
fn test_dirty_magic_is_detected_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("names");
    {
        let enumerator = open_enumerator(&path, 1).unwrap();
        enumerator.enumerate(&"alpha".to_string()).unwrap();
        enumerator.close().unwrap();
    }
    {
        let enumerator = open_enumerator(&path, 1).unwrap();
        assert_ne!(enumerator.try_enumerate(&"alpha".to_string()).unwrap(), 0);
        // simulate a crash: dirty magic on disk, no close
        enumerator.with_core(|core| core.mark_dirty()).unwrap();
    }

    let err = open_enumerator(&path, 1).err().unwrap();
    assert!(err.is_corruption());
    assert!(!err.is_version_update());
}

#[test]
fn test_version_change_is_distinguished_from_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("names");
    open_enumerator(&path, 1).unwrap().close().unwrap();

    let err = open_enumerator(&path, 2).err().unwrap();
    assert!(err.is_corruption());
    assert!(err.is_version_update());
}

#[test]
fn test_enumeration_round_trip_and_concurrency() {
    let dir = tempdir().unwrap();
    let cache = Arc::new(EnumerationCache::new(64));
    let enumerator = Arc::new(
        Enumerator::open(
            dir.path().join("names"),
            KeyRepresentation::indirect(StringDescriptor),
            &EnumeratorOptions::default(),
            Some(cache),
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let enumerator = Arc::clone(&enumerator);
            thread::spawn(move || {
                (0..300)
                    .map(|i| enumerator.enumerate(&format!("k{}", i)).unwrap())
                    .collect::<Vec<u32>>()
            })
        })
        .collect();
    let results: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.windows(2).all(|w| w[0] == w[1]));

    for (i, id) in results[0].iter().enumerate() {
        assert_eq!(enumerator.enumerate(&format!("k{}", i)).unwrap(), *id);
        assert_eq!(enumerator.value_of(*id).unwrap(), Some(format!("k{}", i)));
    }
    assert_eq!(enumerator.len(), 300);
}

#[test]
fn test_resizable_growth_is_bounded() {
    let dir = tempdir().unwrap();
    let mut file = ResizableFile::open(dir.path().join("grow"), ResizableFileOptions::default()).unwrap();

    let mut previous = file.physical_len();
    for size in (1..=200u64).map(|i| i * 7919) {
        file.ensure_size(size).unwrap();
        let physical = file.physical_len();
        assert!(physical >= previous);
        assert!(physical >= size);
        assert!(physical <= 2 * size + 4096, "{} for {}", physical, size);
        previous = physical;
    }
    file.close().unwrap();
}
