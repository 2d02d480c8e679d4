//! Persistent map from enumerated keys to serialized containers
//!
//! ```text
//! <path>           enumerator: key → id, and per id the value address
//! <path>.storage   value log: chunk chains of serialized containers
//! ```
//!
//! Writes either start a new chain ([`PersistentContainerMap::put`]) or extend
//! the existing one ([`PersistentContainerMap::append`]). Reading a chain of
//! more than one chunk rewrites it as a single chunk. Superseded chains are
//! counted as garbage; [`PersistentContainerMap::compact`] rewrites the value
//! log with live values only.
//!
//! Live and garbage key counters are kept in the enumerator header metadata:
//! `live << 32 | garbage`.

use crate::storage::codec::KeyRepresentation;
use crate::storage::compression::chunk_length_path;
use crate::storage::enumerator::{
    enumerator_files, EnumerationCache, Enumerator, EnumeratorOptions, HeaderInfo, HeaderState,
    MAX_VERSION,
};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::options::CreationOptions;
use crate::storage::value_log::{CompactionRecord, ValueLog, ValueLogStats};
use parking_lot::ReentrantMutex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Low bits of the format version taken by [`CreationOptions::version`]
pub const OPTIONS_VERSION_BITS: u32 = 10;
const OPTIONS_VERSION_MASK: u32 = (1 << OPTIONS_VERSION_BITS) - 1;

/// Minimum garbage before compaction is worth it
pub const COMPACTION_GARBAGE_THRESHOLD: u32 = 1000;

/// Reassigns a value's bytes during chunk compaction
pub type ValueAppender<'a> = &'a dyn Fn(&[u8]) -> StorageResult<Vec<u8>>;

/// On-disk format version of a map for an extension version and creation options
pub fn format_version(extension_version: u32, options: &CreationOptions) -> StorageResult<u32> {
    let version = extension_version
        .checked_shl(OPTIONS_VERSION_BITS)
        .map(|v| v | (options.version() & OPTIONS_VERSION_MASK))
        .filter(|v| *v <= MAX_VERSION && extension_version <= MAX_VERSION >> OPTIONS_VERSION_BITS);
    version.ok_or_else(|| {
        StorageError::Config(format!(
            "extension version {} is too large",
            extension_version
        ))
    })
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the value log belonging to a map at `path`
pub fn values_path(path: &Path) -> PathBuf {
    with_suffix(path, ".storage")
}

fn value_log_files(values: &Path) -> [PathBuf; 2] {
    [values.to_path_buf(), chunk_length_path(values)]
}

/// Every file a map at `path` may own
pub fn map_files(path: &Path) -> Vec<PathBuf> {
    let values = values_path(path);
    let mut files = enumerator_files(path);
    files.extend(value_log_files(&values));
    files.extend(value_log_files(&with_suffix(&values, ".compact")));
    files
}

fn remove_files(files: &[PathBuf]) -> StorageResult<()> {
    for file in files {
        match std::fs::remove_file(file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Outcome of a whole-file compaction
#[derive(Debug, Clone, Serialize)]
pub struct CompactionSummary {
    pub live_keys: usize,
    pub fragments: u64,
    pub new_fragments: u64,
    pub old_size: u64,
    pub new_size: u64,
    pub elapsed_ms: u128,
}

/// Map statistics
#[derive(Debug, Clone, Serialize)]
pub struct MapStats {
    pub keys: u64,
    pub live_keys: u32,
    pub garbage_keys: u32,
    pub compaction_recommended: bool,
    pub values: ValueLogStats,
}

pub struct PersistentContainerMap<K> {
    path: PathBuf,
    values_path: PathBuf,
    enumerator: Enumerator<K>,
    values: ValueLog,
    options: CreationOptions,
    live_keys: u32,
    garbage_keys: u32,
    counters_changed: bool,
    data_lock: Arc<ReentrantMutex<()>>,
    closed: bool,
}

impl<K> PersistentContainerMap<K> {
    pub fn open(
        path: impl AsRef<Path>,
        repr: KeyRepresentation<K>,
        extension_version: u32,
        options: CreationOptions,
        cache: Option<Arc<EnumerationCache>>,
    ) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !options.read_only {
                std::fs::create_dir_all(parent)?;
            }
        }

        let version = format_version(extension_version, &options)?;
        let enumerator = Enumerator::open(
            &path,
            repr,
            &EnumeratorOptions::from_creation(&options, version),
            cache,
        )?;
        let values_path = values_path(&path);
        let values = match ValueLog::open(&values_path, options.clone()) {
            Ok(values) => values,
            Err(e) => {
                // The enumerator is fine but useless without its values
                let _ = enumerator.close();
                return Err(e);
            }
        };

        let counters = enumerator.metadata()?;
        let map = Self {
            path,
            values_path,
            enumerator,
            values,
            options,
            live_keys: (counters >> 32) as u32,
            garbage_keys: counters as u32,
            counters_changed: false,
            data_lock: Arc::new(ReentrantMutex::new(())),
            closed: false,
        };
        tracing::debug!(
            "Opened container map {:?}: {} keys, {} live, {} garbage",
            map.path,
            map.enumerator.len(),
            map.live_keys,
            map.garbage_keys
        );
        Ok(map)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &CreationOptions {
        &self.options
    }

    pub fn enumerator(&self) -> &Enumerator<K> {
        &self.enumerator
    }

    /// Lock shared with everything that records value addresses
    pub fn data_lock(&self) -> Arc<ReentrantMutex<()>> {
        Arc::clone(&self.data_lock)
    }

    pub fn enumerate(&self, key: &K) -> StorageResult<u32> {
        self.enumerator.enumerate(key)
    }

    pub fn try_enumerate(&self, key: &K) -> StorageResult<u32> {
        self.enumerator.try_enumerate(key)
    }

    pub fn live_keys(&self) -> u32 {
        self.live_keys
    }

    pub fn garbage_keys(&self) -> u32 {
        self.garbage_keys
    }

    pub fn is_compaction_recommended(&self) -> bool {
        self.garbage_keys > self.live_keys && self.garbage_keys >= COMPACTION_GARBAGE_THRESHOLD
    }

    pub fn is_dirty(&self) -> bool {
        self.enumerator.is_dirty() || self.values.is_dirty() || self.counters_changed
    }

    pub fn is_corrupted(&self) -> bool {
        self.enumerator.is_corrupted()
    }

    pub fn mark_corrupted(&self, reason: &str) {
        self.enumerator.mark_corrupted(reason);
    }

    pub fn stats(&self) -> MapStats {
        MapStats {
            keys: self.enumerator.len(),
            live_keys: self.live_keys,
            garbage_keys: self.garbage_keys,
            compaction_recommended: self.is_compaction_recommended(),
            values: self.values.stats(),
        }
    }

    /// Run `op`, marking the map corrupted on any error that may have damaged it
    fn guarded<R>(&mut self, op: impl FnOnce(&mut Self) -> StorageResult<R>) -> StorageResult<R> {
        match op(self) {
            Ok(result) => Ok(result),
            Err(err) => {
                if !err.leaves_storage_intact() {
                    self.enumerator.mark_corrupted(&err.to_string());
                }
                Err(err)
            }
        }
    }

    /// Reject ids this map never handed out before touching storage
    fn check_id(&self, id: u32) -> StorageResult<()> {
        if !self.enumerator.is_valid_id(id) {
            return Err(StorageError::InvalidId(id));
        }
        Ok(())
    }

    pub fn value_address(&self, id: u32) -> StorageResult<u64> {
        self.check_id(id)?;
        self.enumerator.with_core(|core| core.value_address(id))
    }

    fn set_value_address(&mut self, id: u32, address: u64) -> StorageResult<()> {
        self.enumerator
            .with_core(|core| core.set_value_address(id, address))
    }

    /// The dirty magic must be on disk before the value log changes
    fn mark_dirty(&self) -> StorageResult<()> {
        self.enumerator.with_core(|core| core.mark_dirty())
    }

    pub fn contains(&self, id: u32) -> StorageResult<bool> {
        Ok(self.value_address(id)? != 0)
    }

    pub fn read(&mut self, id: u32) -> StorageResult<Option<Vec<u8>>> {
        self.read_with(id, None)
    }

    /// Bytes stored for `id`; a multi-chunk value is rewritten as one chunk,
    /// through `appender` when given
    pub fn read_with(
        &mut self,
        id: u32,
        appender: Option<ValueAppender<'_>>,
    ) -> StorageResult<Option<Vec<u8>>> {
        self.check_id(id)?;
        self.guarded(|map| {
            let address = map.value_address(id)?;
            if address == 0 {
                return Ok(None);
            }
            let result = map.values.read_bytes(address)?;
            if map.values.performs_chunk_compaction(result.chunk_count) {
                let lock = map.data_lock();
                let _guard = lock.lock();
                map.mark_dirty()?;
                let new_address = map.values.compact_chunks(appender, &result)?;
                map.set_value_address(id, new_address)?;
                map.garbage_keys += 1;
                map.counters_changed = true;
            }
            Ok(Some(result.bytes))
        })
    }

    /// Replace the value of `id`
    pub fn put(&mut self, id: u32, bytes: &[u8]) -> StorageResult<()> {
        self.check_writable("put")?;
        self.check_id(id)?;
        self.guarded(|map| {
            let old = map.value_address(id)?;
            map.mark_dirty()?;
            let address = map.values.append_bytes(bytes, 0)?;
            map.set_value_address(id, address)?;
            if old == 0 {
                map.live_keys += 1;
            } else {
                map.garbage_keys += 1;
            }
            map.counters_changed = true;
            Ok(())
        })
    }

    /// Extend the value of `id` with `bytes`
    pub fn append(&mut self, id: u32, bytes: &[u8]) -> StorageResult<()> {
        self.check_writable("append")?;
        if self.options.has_no_chunks {
            return Err(StorageError::Unsupported(
                "append on a map without chunks".into(),
            ));
        }
        self.check_id(id)?;
        self.guarded(|map| {
            let old = map.value_address(id)?;
            map.mark_dirty()?;
            let address = map.values.append_bytes(bytes, old)?;
            map.set_value_address(id, address)?;
            if old == 0 {
                map.live_keys += 1;
                map.counters_changed = true;
            }
            Ok(())
        })
    }

    pub fn remove(&mut self, id: u32) -> StorageResult<()> {
        self.check_writable("remove")?;
        self.check_id(id)?;
        self.guarded(|map| {
            if map.value_address(id)? == 0 {
                return Ok(());
            }
            map.set_value_address(id, 0)?;
            map.live_keys = map.live_keys.saturating_sub(1);
            map.garbage_keys += 1;
            map.counters_changed = true;
            Ok(())
        })
    }

    fn check_writable(&self, op: &'static str) -> StorageResult<()> {
        if self.options.read_only {
            return Err(StorageError::ReadOnly(op));
        }
        Ok(())
    }

    /// Visit keys that currently have a value
    pub fn process_keys<F>(&self, mut visitor: F) -> StorageResult<bool>
    where
        F: FnMut(K) -> StorageResult<bool>,
    {
        let mut live = HashSet::new();
        self.enumerator.with_core(|core| {
            core.process_records(|id, address| {
                if address != 0 {
                    live.insert(id);
                }
                Ok(true)
            })
        })?;
        self.enumerator.process_all_keys(|id, key| {
            if live.contains(&id) {
                visitor(key)
            } else {
                Ok(true)
            }
        })
    }

    /// Rewrite the value log keeping live values only
    pub fn compact(&mut self) -> StorageResult<CompactionSummary> {
        self.check_writable("compact")?;
        let lock = self.data_lock();
        let _guard = lock.lock();
        self.guarded(|map| map.compact_locked())
    }

    fn compact_locked(&mut self) -> StorageResult<CompactionSummary> {
        let started = Instant::now();
        let mut ids = Vec::new();
        let mut records = Vec::new();
        self.enumerator.with_core(|core| {
            core.process_records(|id, address| {
                if address != 0 {
                    ids.push(id);
                    records.push(CompactionRecord::new(address));
                }
                Ok(true)
            })
        })?;

        let old_size = self.values.size();
        self.values.force()?;

        let temp_path = with_suffix(&self.values_path, ".compact");
        remove_files(&value_log_files(&temp_path))?;
        let mut target = ValueLog::open(&temp_path, self.options.clone())?;

        self.values.switch_to_compaction_mode();
        let compacted = self.values.compact_values(&mut records, &mut target);
        let (fragments, new_fragments) = match compacted.and_then(|r| target.close().map(|_| r)) {
            Ok(result) => result,
            Err(e) => {
                let _ = target.close();
                let _ = remove_files(&value_log_files(&temp_path));
                self.reopen_values()?;
                return Err(e);
            }
        };
        let new_size = target.size();

        // From here until the addresses are rewritten the map is inconsistent
        self.enumerator.with_core(|core| core.mark_dirty())?;
        self.values.close()?;
        let [temp_data, temp_lengths] = value_log_files(&temp_path);
        let [data, lengths] = value_log_files(&self.values_path);
        std::fs::rename(temp_data, data)?;
        if temp_lengths.exists() {
            std::fs::rename(temp_lengths, lengths)?;
        } else {
            remove_files(&[lengths])?;
        }
        self.reopen_values()?;

        for (id, record) in ids.iter().zip(records.iter()) {
            self.set_value_address(*id, record.new_value_address)?;
        }
        self.live_keys = ids.len() as u32;
        self.garbage_keys = 0;
        self.counters_changed = true;
        self.force()?;

        let summary = CompactionSummary {
            live_keys: ids.len(),
            fragments,
            new_fragments,
            old_size,
            new_size,
            elapsed_ms: started.elapsed().as_millis(),
        };
        tracing::info!(
            "Compacted {:?}: {} -> {} bytes, {} live keys in {} ms",
            self.path,
            old_size,
            new_size,
            summary.live_keys,
            summary.elapsed_ms
        );
        Ok(summary)
    }

    fn reopen_values(&mut self) -> StorageResult<()> {
        self.values.close()?;
        self.values = ValueLog::open(&self.values_path, self.options.clone())?;
        Ok(())
    }

    fn save_counters(&mut self) -> StorageResult<()> {
        if self.counters_changed {
            let packed = (i64::from(self.live_keys) << 32) | i64::from(self.garbage_keys);
            self.enumerator.set_metadata(packed)?;
            self.counters_changed = false;
        }
        Ok(())
    }

    /// Values first, then the enumerator, whose clean magic seals both
    pub fn force(&mut self) -> StorageResult<()> {
        if self.options.read_only {
            return Ok(());
        }
        self.guarded(|map| {
            map.values.force()?;
            map.save_counters()?;
            map.enumerator.force()
        })
    }

    /// Flush and close; idempotent
    pub fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let flushed = if self.is_corrupted() || self.options.read_only {
            Ok(())
        } else {
            self.force()
        };
        let values = self.values.close();
        let enumerator = self.enumerator.close();
        flushed.and(values).and(enumerator)
    }
}

impl PersistentContainerMap<u32> {
    /// Open an existing map for maintenance without knowing its key type.
    /// Only id-based operations and compaction are meaningful on the result.
    pub fn open_for_maintenance(path: impl AsRef<Path>, read_only: bool) -> StorageResult<Self> {
        let path = path.as_ref();
        let version = match HeaderInfo::read(path)?.state {
            HeaderState::Clean { version } => version,
            HeaderState::Dirty => {
                return Err(StorageError::corrupted(path, "storage was not closed properly"))
            }
            HeaderState::Unknown { magic } => {
                return Err(StorageError::corrupted(
                    path,
                    format!("unknown magic {:#010x}", magic),
                ))
            }
        };
        let Some(mut options) = CreationOptions::from_version(version & OPTIONS_VERSION_MASK)
        else {
            return Err(StorageError::corrupted(
                path,
                format!("unknown layout options in version {}", version),
            ));
        };
        options.read_only = read_only;
        Self::open(
            path,
            KeyRepresentation::inline_u32(),
            version >> OPTIONS_VERSION_BITS,
            options,
            None,
        )
    }
}

/// Delete every file of the map at `path`
pub fn delete_map_files(path: &Path) -> StorageResult<()> {
    remove_files(&map_files(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::StringDescriptor;
    use tempfile::tempdir;

    fn open_map(path: &Path, options: CreationOptions) -> PersistentContainerMap<String> {
        PersistentContainerMap::open(
            path,
            KeyRepresentation::indirect(StringDescriptor),
            3,
            options,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_format_version_combines_extension_and_options() {
        let plain = format_version(3, &CreationOptions::default()).unwrap();
        let compressed =
            format_version(3, &CreationOptions::default().with_compression(true)).unwrap();
        assert_ne!(plain, compressed);
        assert_eq!(compressed >> OPTIONS_VERSION_BITS, 3);
        assert!(format_version(MAX_VERSION, &CreationOptions::default()).is_err());
    }

    #[test]
    fn test_put_append_read_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map");
        {
            let mut map = open_map(&path, CreationOptions::default());
            let id = map.enumerate(&"k".to_string()).unwrap();
            assert_eq!(map.read(id).unwrap(), None);

            map.put(id, b"abc").unwrap();
            map.append(id, b"def").unwrap();
            assert_eq!(map.read(id).unwrap().unwrap(), b"abcdef");
            // the read compacted the two chunks
            assert_eq!(map.garbage_keys(), 1);
            assert_eq!(map.live_keys(), 1);
            map.close().unwrap();
            map.close().unwrap();
        }

        let mut map = open_map(&path, CreationOptions::default());
        let id = map.try_enumerate(&"k".to_string()).unwrap();
        assert_eq!(map.read(id).unwrap().unwrap(), b"abcdef");
        assert_eq!(map.live_keys(), 1);
        assert_eq!(map.garbage_keys(), 1);
    }

    #[test]
    fn test_layout_change_is_version_update() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map");
        {
            let mut map = open_map(&path, CreationOptions::default());
            let id = map.enumerate(&"k".to_string()).unwrap();
            map.put(id, b"v").unwrap();
            map.close().unwrap();
        }

        let err = PersistentContainerMap::open(
            &path,
            KeyRepresentation::indirect(StringDescriptor),
            3,
            CreationOptions::default().with_compression(true),
            None,
        )
        .err()
        .unwrap();
        assert!(err.is_version_update());
    }

    #[test]
    fn test_remove_and_process_keys() {
        let dir = tempdir().unwrap();
        let mut map = open_map(&dir.path().join("map"), CreationOptions::default());
        for key in ["a", "b", "c"] {
            let id = map.enumerate(&key.to_string()).unwrap();
            map.put(id, key.as_bytes()).unwrap();
        }
        let b = map.try_enumerate(&"b".to_string()).unwrap();
        map.remove(b).unwrap();
        map.remove(b).unwrap();

        let mut keys = Vec::new();
        map.process_keys(|key| {
            keys.push(key);
            Ok(true)
        })
        .unwrap();
        assert_eq!(keys, vec!["a", "c"]);
        assert_eq!(map.live_keys(), 2);
        assert_eq!(map.garbage_keys(), 1);
    }

    #[test]
    fn test_compaction_keeps_live_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map");
        let mut map = open_map(&path, CreationOptions::default());

        let keys: Vec<String> = (0..50).map(|i| format!("key{}", i)).collect();
        for round in 0..30u8 {
            for key in &keys {
                let id = map.enumerate(key).unwrap();
                map.put(id, &[round; 16]).unwrap();
            }
        }
        let doomed = map.try_enumerate(&keys[0]).unwrap();
        map.remove(doomed).unwrap();

        assert!(map.is_compaction_recommended());
        let before = map.stats().values.size;
        let summary = map.compact().unwrap();

        assert_eq!(summary.live_keys, 49);
        assert!(summary.new_size < before);
        assert!(!map.is_compaction_recommended());
        for key in &keys[1..] {
            let id = map.try_enumerate(key).unwrap();
            assert_eq!(map.read(id).unwrap().unwrap(), vec![29u8; 16]);
        }
        assert_eq!(map.read(doomed).unwrap(), None);
        map.close().unwrap();

        let mut maintenance = PersistentContainerMap::open_for_maintenance(&path, true).unwrap();
        assert_eq!(maintenance.live_keys(), 49);
        assert_eq!(maintenance.read(doomed).unwrap(), None);
    }

    #[test]
    fn test_unknown_id_leaves_map_usable() {
        let dir = tempdir().unwrap();
        let mut map = open_map(&dir.path().join("map"), CreationOptions::default());
        let id = map.enumerate(&"k".to_string()).unwrap();
        map.put(id, b"v").unwrap();

        assert!(matches!(map.read(12345), Err(StorageError::InvalidId(12345))));
        assert!(matches!(map.contains(12345), Err(StorageError::InvalidId(_))));
        assert!(matches!(map.put(12345, b"w"), Err(StorageError::InvalidId(_))));
        assert!(matches!(map.remove(0), Err(StorageError::InvalidId(0))));

        assert!(!map.is_corrupted());
        assert_eq!(map.read(id).unwrap().unwrap(), b"v");
        map.close().unwrap();
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map");
        {
            let mut map = open_map(&path, CreationOptions::default());
            let id = map.enumerate(&"k".to_string()).unwrap();
            map.put(id, b"v").unwrap();
            map.close().unwrap();
        }

        let mut map = open_map(&path, CreationOptions::default().read_only());
        let id = map.try_enumerate(&"k".to_string()).unwrap();
        assert_eq!(map.read(id).unwrap().unwrap(), b"v");
        assert!(matches!(map.put(id, b"w"), Err(StorageError::ReadOnly(_))));
        assert!(!map.is_corrupted());
    }
}
