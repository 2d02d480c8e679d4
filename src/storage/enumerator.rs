//! Persistent key enumerator
//!
//! Assigns a stable id to every distinct key. Ids are the file offsets of hash
//! records, so they never change once handed out; `NULL_ID` (0) means "absent".
//!
//! # Files
//!
//! ```text
//! <path>            header + fixed-size records
//!   0   magic: i32          clean magic (family | version) or DIRTY_MAGIC
//!   4   record_count: i64
//!   12  metadata: i64       owner-defined
//!   20  records: [hash: i32][key_ref: i64][value_address: i64][next: i64] ...
//! <path>.hash       bucket directory: [bucket_count: i64][head: i64; bucket_count]
//! <path>.keystream  append log of serialized keys (indirect keys only)
//! <path>.len, <path>.hash.len, <path>.keystream.len   logical lengths
//! ```
//!
//! Buckets chain records through `next`, newest first. When the load factor
//! passes 3/4 the directory doubles and chains are relinked in place; records
//! never move, so ids stay valid.
//!
//! # State machine
//!
//! `Clean → Dirty` on the first mutation (the dirty magic is flushed before any
//! data changes), `Dirty → Clean` on [`Enumerator::force`], any unexpected
//! error → `Corrupted` (permanent, the dirty magic is left on disk), and
//! [`Enumerator::close`] → `Closed` from any state.

use crate::storage::append_log::AppendLog;
use crate::storage::codec::{to_bytes, KeyRepresentation};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::options::CreationOptions;
use crate::storage::paged::PagedFileOptions;
use crate::storage::resizable::{ResizableFile, ResizableFileOptions};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Read;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Id returned for keys that are not enumerated
pub const NULL_ID: u32 = 0;

/// Header layout
pub const HEADER_SIZE: u64 = 20;
const MAGIC_OFFSET: u64 = 0;
const RECORD_COUNT_OFFSET: u64 = 4;
const METADATA_OFFSET: u64 = 12;

/// Record layout
pub const RECORD_SIZE: u64 = 28;
const RECORD_HASH: u64 = 0;
const RECORD_KEY: u64 = 4;
const RECORD_VALUE: u64 = 12;
const RECORD_NEXT: u64 = 20;

/// Magic written while the enumerator has unflushed changes
pub const DIRTY_MAGIC: u32 = 0xBABE_0589;

/// High 12 bits of every correctly-closed magic; the low 20 bits hold the version
const CLEAN_MAGIC_FAMILY: u32 = 0x1DE0_0000;
const VERSION_MASK: u32 = 0x000F_FFFF;

/// Largest format version that fits into the magic
pub const MAX_VERSION: u32 = VERSION_MASK;

const MIN_BUCKETS: u64 = 16;
const BUCKET_HEADER_SIZE: u64 = 8;

/// Default capacity of the shared enumeration cache
pub const DEFAULT_ENUMERATION_CACHE_SIZE: usize = 8192;

fn clean_magic(version: u32) -> u32 {
    CLEAN_MAGIC_FAMILY | (version & VERSION_MASK)
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// All files that belong to an enumerator at `path`
pub fn enumerator_files(path: &Path) -> Vec<PathBuf> {
    let hash = sidecar_path(path, ".hash");
    let keys = sidecar_path(path, ".keystream");
    vec![
        path.to_path_buf(),
        sidecar_path(path, ".len"),
        sidecar_path(&hash, ".len"),
        hash,
        sidecar_path(&keys, ".len"),
        keys,
    ]
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnumeratorState {
    Clean,
    Dirty,
    Corrupted,
    Closed,
}

/// Header state as found on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HeaderState {
    Clean { version: u32 },
    Dirty,
    Unknown { magic: u32 },
}

/// Header snapshot read without mapping the file
#[derive(Debug, Clone, Serialize)]
pub struct HeaderInfo {
    pub state: HeaderState,
    pub record_count: i64,
    pub metadata: i64,
}

impl HeaderInfo {
    /// Read the first `HEADER_SIZE` bytes of an enumerator file
    pub fn read(path: &Path) -> StorageResult<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut buf)?;

        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let state = if magic == DIRTY_MAGIC {
            HeaderState::Dirty
        } else if magic & !VERSION_MASK == CLEAN_MAGIC_FAMILY {
            HeaderState::Clean {
                version: magic & VERSION_MASK,
            }
        } else {
            HeaderState::Unknown { magic }
        };

        let mut long = [0u8; 8];
        long.copy_from_slice(&buf[4..12]);
        let record_count = i64::from_le_bytes(long);
        long.copy_from_slice(&buf[12..20]);
        let metadata = i64::from_le_bytes(long);

        Ok(Self {
            state,
            record_count,
            metadata,
        })
    }
}

// ==================== Enumeration cache ====================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    owner: u64,
    key: Box<[u8]>,
}

/// Bounded LRU of `(enumerator, serialized key) → id`, shared by all
/// enumerators of one storage service
pub struct EnumerationCache {
    entries: Mutex<LruCache<CacheKey, u32>>,
    next_owner: AtomicU64,
}

impl EnumerationCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            next_owner: AtomicU64::new(1),
        }
    }

    fn register(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    fn get(&self, owner: u64, key: &[u8]) -> Option<u32> {
        let lookup = CacheKey {
            owner,
            key: key.into(),
        };
        self.entries.lock().get(&lookup).copied()
    }

    fn put(&self, owner: u64, key: Vec<u8>, id: u32) {
        self.entries.lock().put(
            CacheKey {
                owner,
                key: key.into_boxed_slice(),
            },
            id,
        );
    }

    /// Drop every entry of one enumerator
    fn remove_owner(&self, owner: u64) {
        let mut entries = self.entries.lock();
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.owner == owner)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for EnumerationCache {
    fn default() -> Self {
        Self::new(DEFAULT_ENUMERATION_CACHE_SIZE)
    }
}

// ==================== Core ====================

/// Options for opening an enumerator
#[derive(Debug, Clone)]
pub struct EnumeratorOptions {
    pub file: ResizableFileOptions,
    pub version: u32,
    pub initial_buckets: u64,
}

impl Default for EnumeratorOptions {
    fn default() -> Self {
        Self {
            file: ResizableFileOptions::default(),
            version: 0,
            initial_buckets: 1024,
        }
    }
}

impl EnumeratorOptions {
    pub fn from_creation(options: &CreationOptions, version: u32) -> Self {
        let paged = PagedFileOptions {
            page_size: options.page_size,
            max_open_pages: options.max_open_pages,
            read_only: options.read_only,
            io_statistics: options.io_statistics,
        };
        Self {
            file: ResizableFileOptions::default().with_paged(paged),
            version,
            ..Self::default()
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.file.paged.read_only = read_only;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.file.paged.page_size = page_size;
        self
    }
}

/// Untyped part of the enumerator: header, buckets, records and key stream
pub struct EnumeratorCore {
    path: PathBuf,
    records: ResizableFile,
    buckets: ResizableFile,
    keys: AppendLog,
    bucket_count: u64,
    bucket_bits: u32,
    record_count: u64,
    version: u32,
    state: EnumeratorState,
}

impl EnumeratorCore {
    pub fn open(path: impl AsRef<Path>, options: &EnumeratorOptions) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if options.version > MAX_VERSION {
            return Err(StorageError::Config(format!(
                "enumerator version {} exceeds {}",
                options.version, MAX_VERSION
            )));
        }
        let read_only = options.file.paged.read_only;

        let mut records = ResizableFile::open(&path, options.file.clone())?;
        let mut buckets = ResizableFile::open(sidecar_path(&path, ".hash"), options.file.clone())?;
        let keys = AppendLog::open(sidecar_path(&path, ".keystream"), options.file.clone())?;

        if records.is_empty() {
            if read_only {
                return Err(StorageError::corrupted(&path, "empty enumerator file"));
            }
            let bucket_count = options.initial_buckets.max(MIN_BUCKETS).next_power_of_two();
            records.put_i32(MAGIC_OFFSET, clean_magic(options.version) as i32)?;
            records.put_i64(RECORD_COUNT_OFFSET, 0)?;
            records.put_i64(METADATA_OFFSET, 0)?;
            buckets.clear()?;
            buckets.put_i64(0, bucket_count as i64)?;
            zero_range(&mut buckets, BUCKET_HEADER_SIZE, bucket_count * 8)?;

            let mut core = Self {
                path,
                records,
                buckets,
                keys,
                bucket_count,
                bucket_bits: bucket_count.trailing_zeros(),
                record_count: 0,
                version: options.version,
                state: EnumeratorState::Dirty,
            };
            core.flush_clean()?;
            tracing::debug!("Created enumerator {:?}", core.path);
            return Ok(core);
        }

        if records.len() < HEADER_SIZE {
            return Err(StorageError::corrupted(&path, "truncated header"));
        }

        let magic = records.get_i32(MAGIC_OFFSET)? as u32;
        if magic == DIRTY_MAGIC {
            return Err(StorageError::corrupted(&path, "storage was not closed properly"));
        }
        if magic & !VERSION_MASK != CLEAN_MAGIC_FAMILY {
            return Err(StorageError::corrupted(
                &path,
                format!("unknown magic {:#010x}", magic),
            ));
        }
        let found = magic & VERSION_MASK;
        if found != options.version {
            return Err(StorageError::VersionUpdated {
                path,
                expected: options.version,
                found,
            });
        }

        let record_count = records.get_i64(RECORD_COUNT_OFFSET)?;
        let records_len = u64::try_from(record_count)
            .ok()
            .and_then(|count| count.checked_mul(RECORD_SIZE))
            .and_then(|bytes| bytes.checked_add(HEADER_SIZE))
            .filter(|len| *len <= u64::from(u32::MAX));
        if records_len != Some(records.len()) {
            return Err(StorageError::corrupted(
                &path,
                format!(
                    "record count {} does not match length {}",
                    record_count,
                    records.len()
                ),
            ));
        }

        if buckets.len() < BUCKET_HEADER_SIZE {
            return Err(StorageError::corrupted(&path, "missing bucket directory"));
        }
        let bucket_count = buckets.get_i64(0)?;
        let directory_len = u64::try_from(bucket_count)
            .ok()
            .and_then(|count| count.checked_mul(8))
            .and_then(|bytes| bytes.checked_add(BUCKET_HEADER_SIZE));
        if bucket_count < MIN_BUCKETS as i64
            || !(bucket_count as u64).is_power_of_two()
            || directory_len != Some(buckets.len())
        {
            return Err(StorageError::corrupted(
                &path,
                format!("invalid bucket directory size {}", bucket_count),
            ));
        }

        tracing::debug!("Opened enumerator {:?} with {} records", path, record_count);

        Ok(Self {
            path,
            records,
            buckets,
            keys,
            bucket_count: bucket_count as u64,
            bucket_bits: (bucket_count as u64).trailing_zeros(),
            record_count: record_count as u64,
            version: options.version,
            state: EnumeratorState::Clean,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> EnumeratorState {
        self.state
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn is_read_only(&self) -> bool {
        self.records.is_read_only()
    }

    fn check_usable(&self) -> StorageResult<()> {
        match self.state {
            EnumeratorState::Closed => Err(StorageError::Closed(self.path.clone())),
            EnumeratorState::Corrupted => Err(StorageError::corrupted(
                &self.path,
                "enumerator was marked corrupted",
            )),
            _ => Ok(()),
        }
    }

    /// True if `id` names an existing record
    pub fn is_valid_id(&self, id: u32) -> bool {
        let id = id as u64;
        id >= HEADER_SIZE
            && (id - HEADER_SIZE) % RECORD_SIZE == 0
            && (id - HEADER_SIZE) / RECORD_SIZE < self.record_count
    }

    /// Move `Clean → Dirty`, making the dirty magic durable first
    pub fn mark_dirty(&mut self) -> StorageResult<()> {
        self.check_usable()?;
        if self.is_read_only() {
            return Err(StorageError::ReadOnly("mark_dirty"));
        }
        if self.state == EnumeratorState::Clean {
            self.records.put_i32(MAGIC_OFFSET, DIRTY_MAGIC as i32)?;
            self.records.force()?;
            self.state = EnumeratorState::Dirty;
        }
        Ok(())
    }

    /// Record a corruption; leaves the dirty magic on disk, best effort
    pub fn mark_corrupted(&mut self, reason: &str) {
        if matches!(
            self.state,
            EnumeratorState::Corrupted | EnumeratorState::Closed
        ) {
            return;
        }
        tracing::error!("Enumerator {:?} marked corrupted: {}", self.path, reason);
        self.state = EnumeratorState::Corrupted;
        if !self.is_read_only() {
            // Failures are ignored: the storage is already being abandoned
            let _ = self.records.put_i32(MAGIC_OFFSET, DIRTY_MAGIC as i32);
            let _ = self.records.force();
        }
    }

    /// Flush everything and write the clean magic
    fn flush_clean(&mut self) -> StorageResult<()> {
        self.keys.force()?;
        self.buckets.force()?;
        self.records.force()?;
        self.records
            .put_i32(MAGIC_OFFSET, clean_magic(self.version) as i32)?;
        self.records.force()?;
        self.state = EnumeratorState::Clean;
        Ok(())
    }

    /// Persist all changes and return to `Clean`
    pub fn force(&mut self) -> StorageResult<()> {
        self.check_usable()?;
        if self.state == EnumeratorState::Dirty {
            self.flush_clean()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> StorageResult<()> {
        if self.state == EnumeratorState::Closed {
            return Ok(());
        }
        let flushed = if self.state == EnumeratorState::Dirty {
            self.flush_clean()
        } else {
            Ok(())
        };
        let closed = self
            .keys
            .close()
            .and_then(|_| self.buckets.close())
            .and_then(|_| self.records.close());
        self.state = EnumeratorState::Closed;
        flushed.and(closed)
    }

    pub fn metadata(&mut self) -> StorageResult<i64> {
        self.check_usable()?;
        self.records.get_i64(METADATA_OFFSET)
    }

    pub fn set_metadata(&mut self, value: i64) -> StorageResult<()> {
        self.mark_dirty()?;
        self.records.put_i64(METADATA_OFFSET, value)
    }

    fn bucket_index(&self, hash: i32) -> u64 {
        let mixed = u64::from(hash as u32).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        mixed >> (64 - self.bucket_bits)
    }

    fn bucket_head(&mut self, bucket: u64) -> StorageResult<u32> {
        Ok(self.buckets.get_i64(BUCKET_HEADER_SIZE + bucket * 8)? as u32)
    }

    fn set_bucket_head(&mut self, bucket: u64, id: u32) -> StorageResult<()> {
        self.buckets
            .put_i64(BUCKET_HEADER_SIZE + bucket * 8, i64::from(id))
    }

    fn record_hash(&mut self, id: u32) -> StorageResult<i32> {
        self.records.get_i32(u64::from(id) + RECORD_HASH)
    }

    fn record_key(&mut self, id: u32) -> StorageResult<u64> {
        Ok(self.records.get_i64(u64::from(id) + RECORD_KEY)? as u64)
    }

    fn record_next(&mut self, id: u32) -> StorageResult<u32> {
        let next = self.records.get_i64(u64::from(id) + RECORD_NEXT)?;
        if next != 0 && !self.is_valid_id(next as u32) {
            return Err(StorageError::corrupted(
                &self.path,
                format!("record {} links to invalid record {}", id, next),
            ));
        }
        Ok(next as u32)
    }

    /// Value address stored next to the key
    pub fn value_address(&mut self, id: u32) -> StorageResult<u64> {
        self.check_usable()?;
        if !self.is_valid_id(id) {
            return Err(StorageError::InvalidId(id));
        }
        Ok(self.records.get_i64(u64::from(id) + RECORD_VALUE)? as u64)
    }

    pub fn set_value_address(&mut self, id: u32, address: u64) -> StorageResult<()> {
        if !self.is_valid_id(id) {
            return Err(StorageError::InvalidId(id));
        }
        self.mark_dirty()?;
        self.records
            .put_i64(u64::from(id) + RECORD_VALUE, address as i64)
    }

    /// Visit `(id, value_address)` for every record in id order
    pub fn process_records<F>(&mut self, mut visitor: F) -> StorageResult<bool>
    where
        F: FnMut(u32, u64) -> StorageResult<bool>,
    {
        self.check_usable()?;
        for index in 0..self.record_count {
            let id = (HEADER_SIZE + index * RECORD_SIZE) as u32;
            let address = self.records.get_i64(u64::from(id) + RECORD_VALUE)? as u64;
            if !visitor(id, address)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn key_matches<K>(
        &mut self,
        repr: &KeyRepresentation<K>,
        id: u32,
        key: &K,
    ) -> StorageResult<bool> {
        let key_ref = self.record_key(id)?;
        match repr {
            KeyRepresentation::Inline { to_int, .. } => Ok(key_ref == u64::from(to_int(key))),
            KeyRepresentation::Indirect(descriptor) => {
                if self
                    .keys
                    .check_bytes_are_the_same(key_ref, key, descriptor.as_ref())?
                {
                    return Ok(true);
                }
                let stored = self.keys.read(key_ref, descriptor.as_ref())?;
                Ok(descriptor.is_equal(&stored, key))
            }
        }
    }

    fn find<K>(&mut self, repr: &KeyRepresentation<K>, key: &K, hash: i32) -> StorageResult<u32> {
        let bucket = self.bucket_index(hash);
        let mut id = self.bucket_head(bucket)?;
        let mut steps = 0u64;
        while id != NULL_ID {
            if !self.is_valid_id(id) {
                return Err(StorageError::corrupted(
                    &self.path,
                    format!("bucket {} points to invalid record {}", bucket, id),
                ));
            }
            if self.record_hash(id)? == hash && self.key_matches(repr, id, key)? {
                return Ok(id);
            }
            steps += 1;
            if steps > self.record_count {
                return Err(StorageError::corrupted(&self.path, "cycle in bucket chain"));
            }
            id = self.record_next(id)?;
        }
        Ok(NULL_ID)
    }

    fn insert<K>(&mut self, repr: &KeyRepresentation<K>, key: &K, hash: i32) -> StorageResult<u32> {
        let id = HEADER_SIZE + self.record_count * RECORD_SIZE;
        if id + RECORD_SIZE > u64::from(u32::MAX) {
            return Err(StorageError::CapacityExceeded(format!(
                "enumerator {:?} is full",
                self.path
            )));
        }
        let id = id as u32;
        self.mark_dirty()?;

        let key_ref = match repr {
            KeyRepresentation::Inline { to_int, .. } => u64::from(to_int(key)),
            KeyRepresentation::Indirect(descriptor) => self.keys.append(key, descriptor.as_ref())?,
        };

        let bucket = self.bucket_index(hash);
        let head = self.bucket_head(bucket)?;
        let offset = u64::from(id);
        self.records.put_i32(offset + RECORD_HASH, hash)?;
        self.records.put_i64(offset + RECORD_KEY, key_ref as i64)?;
        self.records.put_i64(offset + RECORD_VALUE, 0)?;
        self.records.put_i64(offset + RECORD_NEXT, i64::from(head))?;
        self.set_bucket_head(bucket, id)?;

        self.record_count += 1;
        self.records
            .put_i64(RECORD_COUNT_OFFSET, self.record_count as i64)?;

        if self.record_count * 4 > self.bucket_count * 3 {
            self.rehash(self.bucket_count * 2)?;
        }
        Ok(id)
    }

    /// Rebuild the bucket directory with `new_count` buckets
    fn rehash(&mut self, new_count: u64) -> StorageResult<()> {
        tracing::debug!(
            "Rehashing {:?}: {} -> {} buckets",
            self.path,
            self.bucket_count,
            new_count
        );
        self.buckets.put_i64(0, new_count as i64)?;
        zero_range(&mut self.buckets, BUCKET_HEADER_SIZE, new_count * 8)?;
        self.bucket_count = new_count;
        self.bucket_bits = new_count.trailing_zeros();

        for index in 0..self.record_count {
            let id = (HEADER_SIZE + index * RECORD_SIZE) as u32;
            let hash = self.record_hash(id)?;
            let bucket = self.bucket_index(hash);
            let head = self.bucket_head(bucket)?;
            self.records
                .put_i64(u64::from(id) + RECORD_NEXT, i64::from(head))?;
            self.set_bucket_head(bucket, id)?;
        }
        Ok(())
    }

    fn key_of<K>(&mut self, repr: &KeyRepresentation<K>, id: u32) -> StorageResult<K> {
        let key_ref = self.record_key(id)?;
        match repr {
            KeyRepresentation::Inline { from_int, .. } => Ok(from_int(key_ref as u32)),
            KeyRepresentation::Indirect(descriptor) => self.keys.read(key_ref, descriptor.as_ref()),
        }
    }
}

fn zero_range(file: &mut ResizableFile, offset: u64, len: u64) -> StorageResult<()> {
    let zeros = [0u8; 4096];
    let mut done = 0u64;
    while done < len {
        let n = (len - done).min(zeros.len() as u64) as usize;
        file.put_bytes(offset + done, &zeros[..n])?;
        done += n as u64;
    }
    Ok(())
}

// ==================== Typed enumerator ====================

/// Thread-safe key enumerator
///
/// The internal mutex is the storage lock: every operation holds it for its
/// whole duration, so concurrent `enumerate` calls for equal keys always agree.
pub struct Enumerator<K> {
    core: Mutex<EnumeratorCore>,
    repr: KeyRepresentation<K>,
    cache: Option<Arc<EnumerationCache>>,
    owner: u64,
}

impl<K> Enumerator<K> {
    pub fn open(
        path: impl AsRef<Path>,
        repr: KeyRepresentation<K>,
        options: &EnumeratorOptions,
        cache: Option<Arc<EnumerationCache>>,
    ) -> StorageResult<Self> {
        let core = EnumeratorCore::open(path, options)?;
        let owner = cache.as_ref().map(|c| c.register()).unwrap_or(0);
        Ok(Self {
            core: Mutex::new(core),
            repr,
            cache,
            owner,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.core.lock().path().to_path_buf()
    }

    pub fn representation(&self) -> &KeyRepresentation<K> {
        &self.repr
    }

    /// Run `op` under the storage lock, marking the enumerator corrupted if it
    /// fails for any reason other than read-only, cancellation or closed
    pub fn with_core<R>(
        &self,
        op: impl FnOnce(&mut EnumeratorCore) -> StorageResult<R>,
    ) -> StorageResult<R> {
        let mut core = self.core.lock();
        core.check_usable()?;
        match op(&mut core) {
            Ok(result) => Ok(result),
            Err(err) => {
                if !err.leaves_storage_intact() {
                    core.mark_corrupted(&err.to_string());
                }
                Err(err)
            }
        }
    }

    fn cache_key(&self, key: &K) -> StorageResult<Option<Vec<u8>>> {
        match (&self.cache, &self.repr) {
            (Some(_), KeyRepresentation::Indirect(descriptor)) => {
                Ok(Some(to_bytes(descriptor.as_ref(), key)?))
            }
            _ => Ok(None),
        }
    }

    /// Cached ids are only trusted while the enumerator itself is usable
    fn check_usable(&self) -> StorageResult<()> {
        self.core.lock().check_usable()
    }

    /// Id of `key`, inserting it if absent
    pub fn enumerate(&self, key: &K) -> StorageResult<u32> {
        self.check_usable()?;
        let cache_key = self.cache_key(key)?;
        if let (Some(cache), Some(bytes)) = (&self.cache, &cache_key) {
            if let Some(id) = cache.get(self.owner, bytes) {
                return Ok(id);
            }
        }

        let hash = self.repr.hash_code(key);
        let repr = &self.repr;
        let id = self.with_core(|core| {
            let id = core.find(repr, key, hash)?;
            if id != NULL_ID {
                return Ok(id);
            }
            core.insert(repr, key, hash)
        })?;

        if let (Some(cache), Some(bytes)) = (&self.cache, cache_key) {
            cache.put(self.owner, bytes, id);
        }
        Ok(id)
    }

    /// Id of `key`, or `NULL_ID` when it was never enumerated; never inserts
    pub fn try_enumerate(&self, key: &K) -> StorageResult<u32> {
        self.check_usable()?;
        let cache_key = self.cache_key(key)?;
        if let (Some(cache), Some(bytes)) = (&self.cache, &cache_key) {
            if let Some(id) = cache.get(self.owner, bytes) {
                return Ok(id);
            }
        }

        let hash = self.repr.hash_code(key);
        let repr = &self.repr;
        let id = self.with_core(|core| core.find(repr, key, hash))?;

        if id != NULL_ID {
            if let (Some(cache), Some(bytes)) = (&self.cache, cache_key) {
                cache.put(self.owner, bytes, id);
            }
        }
        Ok(id)
    }

    /// Assign `key` a fresh id that shadows any previous one
    pub fn re_enumerate(&self, key: &K) -> StorageResult<u32> {
        let cache_key = self.cache_key(key)?;
        let hash = self.repr.hash_code(key);
        let repr = &self.repr;
        let id = self.with_core(|core| core.insert(repr, key, hash))?;

        if let (Some(cache), Some(bytes)) = (&self.cache, cache_key) {
            cache.put(self.owner, bytes, id);
        }
        Ok(id)
    }

    /// Key for `id`; `None` if `id` is not a record
    pub fn value_of(&self, id: u32) -> StorageResult<Option<K>> {
        let repr = &self.repr;
        self.with_core(|core| {
            if !core.is_valid_id(id) {
                return Ok(None);
            }
            core.key_of(repr, id).map(Some)
        })
    }

    /// Visit every enumerated key in id order
    pub fn process_all_keys<F>(&self, mut visitor: F) -> StorageResult<bool>
    where
        F: FnMut(u32, K) -> StorageResult<bool>,
    {
        let repr = &self.repr;
        self.with_core(|core| {
            for index in 0..core.record_count() {
                let id = (HEADER_SIZE + index * RECORD_SIZE) as u32;
                let key = core.key_of(repr, id)?;
                if !visitor(id, key)? {
                    return Ok(false);
                }
            }
            Ok(true)
        })
    }

    pub fn len(&self) -> u64 {
        self.core.lock().record_count()
    }

    /// True if `id` was handed out by this enumerator
    pub fn is_valid_id(&self, id: u32) -> bool {
        self.core.lock().is_valid_id(id)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> EnumeratorState {
        self.core.lock().state()
    }

    pub fn is_dirty(&self) -> bool {
        self.state() == EnumeratorState::Dirty
    }

    pub fn is_corrupted(&self) -> bool {
        self.state() == EnumeratorState::Corrupted
    }

    pub fn mark_corrupted(&self, reason: &str) {
        self.core.lock().mark_corrupted(reason);
    }

    pub fn metadata(&self) -> StorageResult<i64> {
        self.with_core(|core| core.metadata())
    }

    pub fn set_metadata(&self, value: i64) -> StorageResult<()> {
        self.with_core(|core| core.set_metadata(value))
    }

    pub fn force(&self) -> StorageResult<()> {
        self.with_core(|core| core.force())
    }

    /// Flush (if usable) and close; idempotent
    pub fn close(&self) -> StorageResult<()> {
        if let Some(cache) = &self.cache {
            cache.remove_owner(self.owner);
        }
        self.core.lock().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::StringDescriptor;
    use std::thread;
    use tempfile::tempdir;

    fn open_strings(path: &Path, cache: Option<Arc<EnumerationCache>>) -> Enumerator<String> {
        Enumerator::open(
            path,
            KeyRepresentation::indirect(StringDescriptor),
            &EnumeratorOptions::default().page_size(64 * 1024),
            cache,
        )
        .unwrap()
    }

    #[test]
    fn test_enumerate_is_idempotent_and_reversible() {
        let dir = tempdir().unwrap();
        let enumerator = open_strings(&dir.path().join("names"), None);

        let a = enumerator.enumerate(&"alpha".to_string()).unwrap();
        let b = enumerator.enumerate(&"beta".to_string()).unwrap();

        assert_ne!(a, NULL_ID);
        assert_ne!(a, b);
        assert_eq!(enumerator.enumerate(&"alpha".to_string()).unwrap(), a);
        assert_eq!(enumerator.value_of(a).unwrap().as_deref(), Some("alpha"));
        assert_eq!(enumerator.value_of(b).unwrap().as_deref(), Some("beta"));
        assert_eq!(enumerator.value_of(NULL_ID).unwrap(), None);
        assert_eq!(enumerator.value_of(a + 1).unwrap(), None);
    }

    #[test]
    fn test_try_enumerate_does_not_insert() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(EnumerationCache::new(16));
        let enumerator = open_strings(&dir.path().join("names"), Some(cache.clone()));

        assert_eq!(enumerator.try_enumerate(&"ghost".to_string()).unwrap(), NULL_ID);
        assert!(enumerator.is_empty());
        assert!(cache.is_empty());

        let id = enumerator.enumerate(&"ghost".to_string()).unwrap();
        assert_eq!(enumerator.try_enumerate(&"ghost".to_string()).unwrap(), id);
    }

    #[test]
    fn test_many_keys_survive_rehash_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names");

        let mut ids = Vec::new();
        {
            let enumerator = open_strings(&path, None);
            for i in 0..5000 {
                ids.push(enumerator.enumerate(&format!("key-{}", i)).unwrap());
            }
            enumerator.close().unwrap();
        }

        let enumerator = open_strings(&path, None);
        assert_eq!(enumerator.len(), 5000);
        for (i, &id) in ids.iter().enumerate() {
            let key = format!("key-{}", i);
            assert_eq!(enumerator.try_enumerate(&key).unwrap(), id);
            assert_eq!(enumerator.value_of(id).unwrap(), Some(key));
        }
    }

    #[test]
    fn test_clean_close_then_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names");
        {
            let enumerator = open_strings(&path, None);
            enumerator.enumerate(&"x".to_string()).unwrap();
            assert!(enumerator.is_dirty());
            enumerator.force().unwrap();
            assert_eq!(enumerator.state(), EnumeratorState::Clean);
            enumerator.close().unwrap();
            enumerator.close().unwrap();
            assert_eq!(enumerator.state(), EnumeratorState::Closed);
        }

        let info = HeaderInfo::read(&path).unwrap();
        assert_eq!(info.state, HeaderState::Clean { version: 0 });
        assert_eq!(info.record_count, 1);
        assert!(Enumerator::open(
            &path,
            KeyRepresentation::indirect(StringDescriptor),
            &EnumeratorOptions::default(),
            None,
        )
        .is_ok());
    }

    #[test]
    fn test_dirty_magic_is_detected_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names");
        {
            let enumerator = open_strings(&path, None);
            enumerator.enumerate(&"unsaved".to_string()).unwrap();
            // dropped without close: simulates a crash
        }

        assert_eq!(HeaderInfo::read(&path).unwrap().state, HeaderState::Dirty);
        let err = Enumerator::open(
            &path,
            KeyRepresentation::indirect(StringDescriptor),
            &EnumeratorOptions::default(),
            None,
        )
        .err()
        .unwrap();
        assert!(err.is_corruption());
        assert!(!err.is_version_update());
    }

    #[test]
    fn test_version_change_is_reported_separately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names");
        {
            let enumerator = open_strings(&path, None);
            enumerator.enumerate(&"v1".to_string()).unwrap();
            enumerator.close().unwrap();
        }

        let err = Enumerator::open(
            &path,
            KeyRepresentation::indirect(StringDescriptor),
            &EnumeratorOptions::default().version(2),
            None,
        )
        .err()
        .unwrap();
        assert!(err.is_version_update());
    }

    #[test]
    fn test_shared_cache_keeps_enumerators_apart() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(EnumerationCache::new(128));
        let first = open_strings(&dir.path().join("first"), Some(cache.clone()));
        let second = open_strings(&dir.path().join("second"), Some(cache.clone()));

        first.enumerate(&"pad".to_string()).unwrap();
        let in_first = first.enumerate(&"shared".to_string()).unwrap();
        let in_second = second.enumerate(&"shared".to_string()).unwrap();

        assert_ne!(in_first, in_second);
        assert_eq!(first.enumerate(&"shared".to_string()).unwrap(), in_first);
        assert_eq!(second.enumerate(&"shared".to_string()).unwrap(), in_second);
        assert_eq!(cache.len(), 3);

        first.close().unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_inline_keys() {
        let dir = tempdir().unwrap();
        let enumerator = Enumerator::open(
            dir.path().join("ints"),
            KeyRepresentation::inline_u32(),
            &EnumeratorOptions::default(),
            None,
        )
        .unwrap();

        let id = enumerator.enumerate(&77).unwrap();
        assert_eq!(enumerator.enumerate(&77).unwrap(), id);
        assert_eq!(enumerator.value_of(id).unwrap(), Some(77));
        assert_eq!(enumerator.try_enumerate(&78).unwrap(), NULL_ID);
    }

    #[test]
    fn test_re_enumerate_shadows_old_id() {
        let dir = tempdir().unwrap();
        let enumerator = open_strings(&dir.path().join("names"), None);

        let old = enumerator.enumerate(&"moved".to_string()).unwrap();
        let new = enumerator.re_enumerate(&"moved".to_string()).unwrap();

        assert_ne!(old, new);
        assert_eq!(enumerator.enumerate(&"moved".to_string()).unwrap(), new);
        assert_eq!(enumerator.value_of(old).unwrap().as_deref(), Some("moved"));
    }

    #[test]
    fn test_concurrent_enumerate_agrees() {
        let dir = tempdir().unwrap();
        let enumerator = Arc::new(open_strings(&dir.path().join("names"), None));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let enumerator = Arc::clone(&enumerator);
                thread::spawn(move || {
                    (0..200)
                        .map(|i| enumerator.enumerate(&format!("k{}", i)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &results[1..] {
            assert_eq!(other, &results[0]);
        }
        assert_eq!(enumerator.len(), 200);
    }

    #[test]
    fn test_corrupted_state_is_permanent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names");
        let enumerator = open_strings(&path, None);
        enumerator.enumerate(&"a".to_string()).unwrap();
        enumerator.force().unwrap();

        enumerator.mark_corrupted("test");
        assert!(enumerator.is_corrupted());
        assert!(enumerator.enumerate(&"b".to_string()).unwrap_err().is_corruption());
        assert!(enumerator.force().is_err());
        enumerator.close().unwrap();

        assert_eq!(HeaderInfo::read(&path).unwrap().state, HeaderState::Dirty);
    }

    #[test]
    fn test_corrupted_state_bypasses_cache() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(EnumerationCache::new(16));
        let enumerator = open_strings(&dir.path().join("names"), Some(cache.clone()));
        let id = enumerator.enumerate(&"cached".to_string()).unwrap();
        assert_eq!(enumerator.try_enumerate(&"cached".to_string()).unwrap(), id);

        enumerator.mark_corrupted("test");
        assert!(enumerator.enumerate(&"cached".to_string()).unwrap_err().is_corruption());
        assert!(enumerator.try_enumerate(&"cached".to_string()).unwrap_err().is_corruption());
    }

    #[test]
    fn test_invalid_id_does_not_corrupt() {
        let dir = tempdir().unwrap();
        let enumerator = open_strings(&dir.path().join("names"), None);
        let id = enumerator.enumerate(&"a".to_string()).unwrap();
        assert!(enumerator.is_valid_id(id));
        assert!(!enumerator.is_valid_id(12345));

        let err = enumerator
            .with_core(|core| core.value_address(12345))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidId(12345)));
        assert!(!enumerator.is_corrupted());
        assert_eq!(enumerator.with_core(|core| core.value_address(id)).unwrap(), 0);
    }

    fn overwrite_i64(path: &Path, offset: u64, value: i64) {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&value.to_le_bytes()).unwrap();
    }

    #[test]
    fn test_huge_header_counts_are_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names");
        open_strings(&path, None).close().unwrap();
        overwrite_i64(&path, RECORD_COUNT_OFFSET, i64::MAX);
        let err = Enumerator::open(
            &path,
            KeyRepresentation::indirect(StringDescriptor),
            &EnumeratorOptions::default(),
            None,
        )
        .err()
        .unwrap();
        assert!(err.is_corruption());

        let path = dir.path().join("buckets");
        open_strings(&path, None).close().unwrap();
        overwrite_i64(&sidecar_path(&path, ".hash"), 0, 1 << 62);
        let err = Enumerator::open(
            &path,
            KeyRepresentation::indirect(StringDescriptor),
            &EnumeratorOptions::default(),
            None,
        )
        .err()
        .unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_process_all_keys_and_metadata() {
        let dir = tempdir().unwrap();
        let enumerator = open_strings(&dir.path().join("names"), None);
        for key in ["one", "two", "three"] {
            enumerator.enumerate(&key.to_string()).unwrap();
        }
        enumerator.set_metadata(99).unwrap();

        let mut keys = Vec::new();
        enumerator
            .process_all_keys(|_, key| {
                keys.push(key);
                Ok(true)
            })
            .unwrap();
        assert_eq!(keys, vec!["one", "two", "three"]);
        assert_eq!(enumerator.metadata().unwrap(), 99);
    }
}
