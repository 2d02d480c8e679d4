//! Indexio Index Layer
//!
//! Builds inverted indices on top of the storage layer:
//!
//! - **ValueContainer**: values recorded for one key, per input id
//! - **SegmentedLruCache**: protected + probationary LRU used for containers
//! - **PersistentContainerMap**: enumerated keys → serialized containers in a value log
//! - **KeyToValueContainerStore**: write-back container cache over the map
//! - **StorageBackedIndex**: an [`IndexExtension`] persisted with a forward map
//! - **IndexStorageService**: opens, versions and shuts down indices
//!
//! # Architecture
//!
//! ```text
//! update(input, {key: value})
//!        ↓
//! StorageBackedIndex: forward map input → keys, drop stale keys
//!        ↓
//! KeyToValueContainerStore: cached container for key, mutate
//!        ↓ eviction / flush
//! PersistentContainerMap: enumerator id → value log chain
//! ```

mod cache;
mod container;
mod extension;
mod persistent_map;
mod service;
mod store;

pub use cache::SegmentedLruCache;
pub use container::{ChangeTrackingValueContainer, ValueContainer};
pub use extension::{IndexExtension, InvertedIndex, ManagedIndex, StorageBackedIndex};
pub use persistent_map::{
    delete_map_files, format_version, map_files, values_path, CompactionSummary, MapStats,
    PersistentContainerMap, ValueAppender, COMPACTION_GARBAGE_THRESHOLD, OPTIONS_VERSION_BITS,
};
pub use service::IndexStorageService;
pub use store::{KeyToValueContainerStore, StoreOptions, DEFAULT_CACHE_SIZE};
