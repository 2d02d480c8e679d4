//! Key → value container store
//!
//! Hot containers live in a segmented LRU keyed by the enumerated key id.
//! Mutations only touch the cached container; a dirty container is written to
//! the persistent map when it is evicted or on [`KeyToValueContainerStore::flush`].
//!
//! ```text
//! add_value(key, input, value)
//!   → enumerate(key) = id
//!   → cache[id] (loaded from the map on miss) .add_value(input, value)
//!   … eviction / flush
//!   → map.append(id, delta)      additions only
//!   → map.put(id, full)          after removals, or first write
//! ```
//!
//! Write-back runs under the map's data lock so it never interleaves with a
//! compaction that is moving value addresses.

use crate::index::cache::SegmentedLruCache;
use crate::index::container::{ChangeTrackingValueContainer, ValueContainer};
use crate::index::persistent_map::{delete_map_files, MapStats, PersistentContainerMap};
use crate::storage::codec::{DataExternalizer, KeyRepresentation};
use crate::storage::enumerator::{EnumerationCache, NULL_ID};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::options::CreationOptions;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default number of cached containers
pub const DEFAULT_CACHE_SIZE: usize = 64;

/// Store construction parameters
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub creation: CreationOptions,
    /// Extension format version folded into the on-disk version
    pub version: u32,
    pub cache_size: usize,
    /// Keys belong to a single input: first insertions bypass the cache
    pub unique_keys: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            creation: CreationOptions::default(),
            version: 0,
            cache_size: DEFAULT_CACHE_SIZE,
            unique_keys: false,
        }
    }
}

impl StoreOptions {
    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn unique_keys(mut self, unique_keys: bool) -> Self {
        self.unique_keys = unique_keys;
        self
    }

    pub fn creation(mut self, creation: CreationOptions) -> Self {
        self.creation = creation;
        self
    }
}

struct StoreState<K, V> {
    map: PersistentContainerMap<K>,
    cache: SegmentedLruCache<u32, ChangeTrackingValueContainer<V>>,
    closed: bool,
}

pub struct KeyToValueContainerStore<K, V> {
    path: PathBuf,
    repr: KeyRepresentation<K>,
    externalizer: Arc<dyn DataExternalizer<V>>,
    options: StoreOptions,
    enumeration_cache: Option<Arc<EnumerationCache>>,
    state: Mutex<StoreState<K, V>>,
}

impl<K, V> KeyToValueContainerStore<K, V>
where
    V: Clone + PartialEq,
{
    pub fn open(
        path: impl AsRef<Path>,
        repr: KeyRepresentation<K>,
        externalizer: Arc<dyn DataExternalizer<V>>,
        options: StoreOptions,
        enumeration_cache: Option<Arc<EnumerationCache>>,
    ) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let map = PersistentContainerMap::open(
            &path,
            repr.clone(),
            options.version,
            options.creation.clone(),
            enumeration_cache.clone(),
        )?;
        let cache = SegmentedLruCache::with_capacity(options.cache_size);
        Ok(Self {
            path,
            repr,
            externalizer,
            options,
            enumeration_cache,
            state: Mutex::new(StoreState {
                map,
                cache,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.options.creation.read_only
    }

    fn check_writable(&self, op: &'static str) -> StorageResult<()> {
        if self.is_read_only() {
            return Err(StorageError::ReadOnly(op));
        }
        Ok(())
    }

    fn check_open(&self, state: &StoreState<K, V>) -> StorageResult<()> {
        if state.closed {
            return Err(StorageError::Closed(self.path.clone()));
        }
        Ok(())
    }

    fn load(&self, map: &mut PersistentContainerMap<K>, id: u32) -> StorageResult<ValueContainer<V>> {
        let externalizer = self.externalizer.as_ref();
        let bytes = if self.options.creation.compact_chunks_with_value_deserialization {
            let normalize = |raw: &[u8]| ValueContainer::read(raw, externalizer)?.save(externalizer);
            map.read_with(id, Some(&normalize))?
        } else {
            map.read(id)?
        };
        match bytes {
            Some(bytes) => ValueContainer::read(&bytes, externalizer),
            None => Ok(ValueContainer::new()),
        }
    }

    /// Persist one container if it has unsaved changes
    fn write_back(
        &self,
        map: &mut PersistentContainerMap<K>,
        id: u32,
        container: &mut ChangeTrackingValueContainer<V>,
    ) -> StorageResult<()> {
        if !container.is_dirty() {
            return Ok(());
        }
        let externalizer = self.externalizer.as_ref();
        if container.container().is_empty() {
            map.remove(id)?;
        } else if container.needs_compacting()
            || self.options.creation.has_no_chunks
            || !map.contains(id)?
        {
            map.put(id, &container.save_full(externalizer)?)?;
        } else {
            map.append(id, &container.save_delta(externalizer)?)?;
        }
        container.mark_saved();
        Ok(())
    }

    fn write_back_evicted(&self, state: &mut StoreState<K, V>) -> StorageResult<()> {
        let evicted = state.cache.drain_evicted();
        if evicted.is_empty() {
            return Ok(());
        }
        let lock = state.map.data_lock();
        let _guard = lock.lock();
        for (id, mut container) in evicted {
            if let Err(e) = self.write_back(&mut state.map, id, &mut container) {
                tracing::error!("Failed to write back container {} of {:?}: {}", id, self.path, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Cached container of `id`, loading it on a miss.
    ///
    /// Only a hit counts as reuse: a freshly loaded container stays on
    /// probation, so one-off keys cannot push hot ones out of the protected
    /// segment.
    fn cached<'a>(
        &self,
        state: &'a mut StoreState<K, V>,
        id: u32,
    ) -> StorageResult<Option<&'a mut ChangeTrackingValueContainer<V>>> {
        if state.cache.contains(&id) {
            return Ok(state.cache.get_mut(&id));
        }
        let container = self.load(&mut state.map, id)?;
        state
            .cache
            .put(id, ChangeTrackingValueContainer::from_stored(container));
        self.write_back_evicted(state)?;
        Ok(state.cache.peek_mut(&id))
    }

    /// Current container for `key`; empty if the key has no values
    pub fn read(&self, key: &K) -> StorageResult<ValueContainer<V>> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        let id = if self.is_read_only() {
            state.map.try_enumerate(key)?
        } else {
            state.map.enumerate(key)?
        };
        if id == NULL_ID {
            return Ok(ValueContainer::new());
        }

        let container = match self.cached(&mut state, id)? {
            Some(cached) => cached.container().clone(),
            None => ValueContainer::new(),
        };
        self.write_back_evicted(&mut state)?;
        Ok(container)
    }

    /// Record that `input_id` produced `value` for `key`
    pub fn add_value(&self, key: &K, input_id: u32, value: V) -> StorageResult<()> {
        self.check_writable("add_value")?;
        let mut state = self.state.lock();
        self.check_open(&state)?;
        let id = state.map.enumerate(key)?;

        if self.options.unique_keys && !state.cache.contains(&id) && !state.map.contains(id)? {
            let single = ValueContainer::single(input_id, value);
            let bytes = single.save(self.externalizer.as_ref())?;
            let lock = state.map.data_lock();
            let _guard = lock.lock();
            return state.map.put(id, &bytes);
        }

        if let Some(container) = self.cached(&mut state, id)? {
            container.add_value(input_id, value);
        }
        self.write_back_evicted(&mut state)
    }

    /// Drop whatever `input_id` recorded for `key`
    pub fn remove_all_values(&self, key: &K, input_id: u32) -> StorageResult<()> {
        self.check_writable("remove_all_values")?;
        let mut state = self.state.lock();
        self.check_open(&state)?;
        let id = state.map.try_enumerate(key)?;
        if id == NULL_ID {
            return Ok(());
        }

        if let Some(container) = self.cached(&mut state, id)? {
            container.remove_associated_value(input_id);
        }
        self.write_back_evicted(&mut state)
    }

    /// Write every dirty container back and force the map
    pub fn flush(&self) -> StorageResult<()> {
        if self.is_read_only() {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.check_open(&state)?;
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut StoreState<K, V>) -> StorageResult<()> {
        self.write_back_evicted(state)?;
        let lock = state.map.data_lock();
        let _guard = lock.lock();
        let StoreState { map, cache, .. } = state;
        for (&id, container) in cache.iter_mut() {
            self.write_back(map, id, container)?;
        }
        map.force()
    }

    /// Delete all data and start over with an empty store
    pub fn clear(&self) -> StorageResult<()> {
        self.check_writable("clear")?;
        let mut state = self.state.lock();
        self.check_open(&state)?;

        state.cache.clear();
        if let Err(e) = state.map.close() {
            tracing::warn!("Ignoring close failure while clearing {:?}: {}", self.path, e);
        }
        delete_map_files(&self.path)?;
        state.map = PersistentContainerMap::open(
            &self.path,
            self.repr.clone(),
            self.options.version,
            self.options.creation.clone(),
            self.enumeration_cache.clone(),
        )?;
        tracing::info!("Cleared container store {:?}", self.path);
        Ok(())
    }

    /// Visit keys that currently have stored values
    ///
    /// Unflushed containers are not seen; call [`Self::flush`] first.
    pub fn process_keys<F>(&self, visitor: F) -> StorageResult<bool>
    where
        F: FnMut(K) -> StorageResult<bool>,
    {
        let state = self.state.lock();
        self.check_open(&state)?;
        state.map.process_keys(visitor)
    }

    /// Rewrite the value log, flushing cached containers first
    pub fn compact(&self) -> StorageResult<()> {
        self.check_writable("compact")?;
        let mut state = self.state.lock();
        self.check_open(&state)?;
        self.flush_locked(&mut state)?;
        state.map.compact().map(|_| ())
    }

    pub fn is_compaction_recommended(&self) -> bool {
        self.state.lock().map.is_compaction_recommended()
    }

    pub fn is_dirty(&self) -> bool {
        let mut state = self.state.lock();
        state.map.is_dirty() || state.cache.iter_mut().any(|(_, c)| c.is_dirty())
    }

    pub fn is_corrupted(&self) -> bool {
        self.state.lock().map.is_corrupted()
    }

    pub fn stats(&self) -> MapStats {
        self.state.lock().map.stats()
    }

    /// Flush and close; idempotent
    pub fn close(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let flushed = if self.is_read_only() || state.map.is_corrupted() {
            Ok(())
        } else {
            self.flush_locked(&mut state)
        };
        state.cache.clear();
        let closed = state.map.close();
        flushed.and(closed)
    }
}
