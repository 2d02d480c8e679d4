//! Index extensions and the storage-backed inverted index
//!
//! An [`IndexExtension`] describes one index: its name, how inputs are turned
//! into `key → value` maps, the key and value codecs, and a format version.
//! [`StorageBackedIndex`] persists such an index:
//!
//! ```text
//! <dir>/<name>            inverted store   key      → ValueContainer<V>
//! <dir>/<name>.forward    forward map      input id → keys it produced
//! ```
//!
//! The forward map lets [`InvertedIndex::update`] drop associations an input
//! no longer produces, also after a reopen.

use crate::index::container::ValueContainer;
use crate::index::persistent_map::{delete_map_files, PersistentContainerMap};
use crate::index::store::{KeyToValueContainerStore, StoreOptions, DEFAULT_CACHE_SIZE};
use crate::storage::codec::{read_varint, write_varint, DataExternalizer, KeyRepresentation};
use crate::storage::enumerator::{EnumerationCache, NULL_ID};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::options::CreationOptions;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Format version of the forward map layout
const FORWARD_VERSION: u32 = 1;

/// Declares one index over inputs of type `I`
pub trait IndexExtension<K, V, I>: Send + Sync {
    /// Unique name; also the name of the index directory
    fn name(&self) -> &str;

    /// Bumping the version discards data written by older versions
    fn version(&self) -> u32;

    fn key_representation(&self) -> KeyRepresentation<K>;

    fn value_externalizer(&self) -> Arc<dyn DataExternalizer<V>>;

    /// Keys and values produced by one input
    fn index(&self, input: &I) -> HashMap<K, V>;

    /// Every key is produced by at most one input
    fn has_unique_keys(&self) -> bool {
        false
    }

    /// Container cache size; `None` uses the service default
    fn cache_size(&self) -> Option<usize> {
        None
    }
}

/// Query and update surface of an inverted index
pub trait InvertedIndex<K, V: Clone + PartialEq> {
    /// Everything recorded for `key`
    fn get_data(&self, key: &K) -> StorageResult<ValueContainer<V>>;

    /// Replace what `input_id` contributes with `data`
    fn update(&self, input_id: u32, data: HashMap<K, V>) -> StorageResult<()>;

    fn flush(&self) -> StorageResult<()>;

    fn clear(&self) -> StorageResult<()>;

    /// Inputs that produced every one of `keys`, sorted
    fn input_ids_with_all_keys(&self, keys: &[K]) -> StorageResult<Vec<u32>> {
        let mut result: Option<BTreeSet<u32>> = None;
        for key in keys {
            let ids: BTreeSet<u32> = self.get_data(key)?.input_ids().into_iter().collect();
            let narrowed = match result {
                Some(current) => current.intersection(&ids).copied().collect(),
                None => ids,
            };
            if narrowed.is_empty() {
                return Ok(Vec::new());
            }
            result = Some(narrowed);
        }
        Ok(result.map(|ids| ids.into_iter().collect()).unwrap_or_default())
    }
}

/// Lifecycle hooks the storage service needs from an open index
pub trait ManagedIndex: Send + Sync {
    fn name(&self) -> &str;

    fn flush(&self) -> StorageResult<()>;

    fn close(&self) -> StorageResult<()>;
}

struct ForwardMap {
    path: PathBuf,
    options: CreationOptions,
    map: PersistentContainerMap<u32>,
}

impl ForwardMap {
    fn open(path: PathBuf, options: CreationOptions) -> StorageResult<Self> {
        let map = PersistentContainerMap::open(
            &path,
            KeyRepresentation::inline_u32(),
            FORWARD_VERSION,
            options.clone(),
            None,
        )?;
        Ok(Self { path, options, map })
    }

    /// Raw forward record of `input_id`; never enumerates a new input
    fn read(&mut self, input_id: u32) -> StorageResult<Option<Vec<u8>>> {
        let id = self.map.try_enumerate(&input_id)?;
        if id == NULL_ID {
            return Ok(None);
        }
        self.map.read(id)
    }

    fn put(&mut self, input_id: u32, keys: &[u8]) -> StorageResult<()> {
        let id = self.map.enumerate(&input_id)?;
        self.map.put(id, keys)
    }

    fn remove(&mut self, input_id: u32) -> StorageResult<()> {
        let id = self.map.try_enumerate(&input_id)?;
        if id == NULL_ID {
            return Ok(());
        }
        self.map.remove(id)
    }

    fn reset(&mut self) -> StorageResult<()> {
        if let Err(e) = self.map.close() {
            tracing::warn!("Ignoring close failure while clearing {:?}: {}", self.path, e);
        }
        delete_map_files(&self.path)?;
        self.map = PersistentContainerMap::open(
            &self.path,
            KeyRepresentation::inline_u32(),
            FORWARD_VERSION,
            self.options.clone(),
            None,
        )?;
        Ok(())
    }
}

/// Inverted index persisted through a container store plus a forward map
pub struct StorageBackedIndex<K, V, I> {
    extension: Arc<dyn IndexExtension<K, V, I>>,
    name: String,
    repr: KeyRepresentation<K>,
    store: KeyToValueContainerStore<K, V>,
    forward: Mutex<ForwardMap>,
}

impl<K, V, I> StorageBackedIndex<K, V, I>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    /// Open the index files of `extension` inside `dir`
    pub fn open(
        dir: impl AsRef<Path>,
        extension: Arc<dyn IndexExtension<K, V, I>>,
        creation: CreationOptions,
        default_cache_size: Option<usize>,
        enumeration_cache: Option<Arc<EnumerationCache>>,
    ) -> StorageResult<Self> {
        let dir = dir.as_ref();
        let name = extension.name().to_string();
        let repr = extension.key_representation();
        let options = StoreOptions::default()
            .creation(creation.clone())
            .version(extension.version())
            .unique_keys(extension.has_unique_keys())
            .cache_size(
                extension
                    .cache_size()
                    .or(default_cache_size)
                    .unwrap_or(DEFAULT_CACHE_SIZE),
            );

        let store = KeyToValueContainerStore::open(
            dir.join(&name),
            repr.clone(),
            extension.value_externalizer(),
            options,
            enumeration_cache,
        )?;
        let forward = match ForwardMap::open(dir.join(format!("{}.forward", name)), creation) {
            Ok(forward) => forward,
            Err(e) => {
                let _ = store.close();
                return Err(e);
            }
        };

        tracing::debug!("Opened index {} in {:?}", name, dir);
        Ok(Self {
            extension,
            name,
            repr,
            store,
            forward: Mutex::new(forward),
        })
    }

    pub fn store(&self) -> &KeyToValueContainerStore<K, V> {
        &self.store
    }

    /// Run the extension's indexer on `input` and record the result
    pub fn index_input(&self, input_id: u32, input: &I) -> StorageResult<()> {
        let data = self.extension.index(input);
        self.update(input_id, data)
    }

    /// Keys `input_id` produced when it was last indexed
    pub fn keys_of(&self, input_id: u32) -> StorageResult<Vec<K>> {
        let mut forward = self.forward.lock();
        match forward.read(input_id)? {
            Some(bytes) => self.decode_keys(&bytes),
            None => Ok(Vec::new()),
        }
    }

    fn encode_keys<'a>(&self, keys: impl Iterator<Item = &'a K>, count: usize) -> StorageResult<Vec<u8>>
    where
        K: 'a,
    {
        let mut out = Vec::new();
        write_varint(&mut out, count as u64)?;
        for key in keys {
            self.repr.save_key(&mut out, key)?;
        }
        Ok(out)
    }

    fn decode_keys(&self, bytes: &[u8]) -> StorageResult<Vec<K>> {
        let mut input = bytes;
        let count = read_varint(&mut input)?;
        if count > bytes.len() as u64 {
            return Err(StorageError::Serialization(format!(
                "forward record of index {} claims {} keys in {} bytes",
                self.name,
                count,
                bytes.len()
            )));
        }
        (0..count).map(|_| self.repr.read_key(&mut input)).collect()
    }

    pub fn is_corrupted(&self) -> bool {
        self.store.is_corrupted() || self.forward.lock().map.is_corrupted()
    }
}

impl<K, V, I> InvertedIndex<K, V> for StorageBackedIndex<K, V, I>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    fn get_data(&self, key: &K) -> StorageResult<ValueContainer<V>> {
        self.store.read(key)
    }

    fn update(&self, input_id: u32, data: HashMap<K, V>) -> StorageResult<()> {
        let mut forward = self.forward.lock();
        let previous = match forward.read(input_id)? {
            Some(bytes) => self.decode_keys(&bytes)?,
            None => Vec::new(),
        };

        let mut seen = HashSet::new();
        for key in previous {
            if !data.contains_key(&key) && seen.insert(key.clone()) {
                self.store.remove_all_values(&key, input_id)?;
            }
        }

        if data.is_empty() {
            return forward.remove(input_id);
        }
        let keys = self.encode_keys(data.keys(), data.len())?;
        for (key, value) in data {
            self.store.add_value(&key, input_id, value)?;
        }
        forward.put(input_id, &keys)
    }

    fn flush(&self) -> StorageResult<()> {
        self.store.flush()?;
        self.forward.lock().map.force()
    }

    fn clear(&self) -> StorageResult<()> {
        self.store.clear()?;
        self.forward.lock().reset()?;
        tracing::info!("Cleared index {}", self.name);
        Ok(())
    }
}

impl<K, V, I> ManagedIndex for StorageBackedIndex<K, V, I>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn flush(&self) -> StorageResult<()> {
        InvertedIndex::flush(self)
    }

    fn close(&self) -> StorageResult<()> {
        let store = self.store.close();
        let forward = self.forward.lock().map.close();
        store.and(forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::StringDescriptor;
    use tempfile::tempdir;

    /// Word → number of occurrences in a text
    struct WordCounts;

    impl IndexExtension<String, u32, String> for WordCounts {
        fn name(&self) -> &str {
            "words"
        }

        fn version(&self) -> u32 {
            1
        }

        fn key_representation(&self) -> KeyRepresentation<String> {
            KeyRepresentation::indirect(StringDescriptor)
        }

        fn value_externalizer(&self) -> Arc<dyn DataExternalizer<u32>> {
            Arc::new(crate::storage::codec::U32Externalizer)
        }

        fn index(&self, input: &String) -> HashMap<String, u32> {
            let mut counts = HashMap::new();
            for word in input.split_whitespace() {
                *counts.entry(word.to_string()).or_insert(0) += 1;
            }
            counts
        }

        fn cache_size(&self) -> Option<usize> {
            Some(4)
        }
    }

    fn open_index(dir: &Path) -> StorageBackedIndex<String, u32, String> {
        let extension: Arc<dyn IndexExtension<String, u32, String>> = Arc::new(WordCounts);
        StorageBackedIndex::open(dir, extension, CreationOptions::default(), None, None).unwrap()
    }

    fn words(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_index_and_query() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());
        index.index_input(1, &"red green red".to_string()).unwrap();
        index.index_input(2, &"green blue".to_string()).unwrap();
        index.index_input(3, &"red blue green".to_string()).unwrap();

        let red = index.get_data(&"red".to_string()).unwrap();
        assert_eq!(red.value_of(1), Some(&2));
        assert_eq!(red.input_ids(), vec![1, 3]);

        assert_eq!(
            index.input_ids_with_all_keys(&words(&["green", "blue"])).unwrap(),
            vec![2, 3]
        );
        assert!(index
            .input_ids_with_all_keys(&words(&["red", "missing"]))
            .unwrap()
            .is_empty());
        assert!(index.input_ids_with_all_keys(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_update_drops_stale_keys_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let index = open_index(dir.path());
            index.index_input(1, &"alpha beta".to_string()).unwrap();
            ManagedIndex::close(&index).unwrap();
        }

        let index = open_index(dir.path());
        assert_eq!(index.keys_of(1).unwrap().len(), 2);
        index.index_input(1, &"beta gamma".to_string()).unwrap();

        assert!(index.get_data(&"alpha".to_string()).unwrap().is_empty());
        assert_eq!(index.get_data(&"gamma".to_string()).unwrap().input_ids(), vec![1]);

        index.update(1, HashMap::new()).unwrap();
        assert!(index.get_data(&"beta".to_string()).unwrap().is_empty());
        assert!(index.keys_of(1).unwrap().is_empty());
    }

    #[test]
    fn test_clear_index() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());
        index.index_input(5, &"one two".to_string()).unwrap();
        InvertedIndex::flush(&index).unwrap();

        index.clear().unwrap();
        assert!(index.get_data(&"one".to_string()).unwrap().is_empty());
        assert!(index.keys_of(5).unwrap().is_empty());
        assert!(!index.is_corrupted());
    }
}
