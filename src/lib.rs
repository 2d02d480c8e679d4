//! # Indexio
//!
//! Persistent key-value index storage: a disk-backed, crash-detecting,
//! compacting store for inverted indices.
//!
//! ## Features
//!
//! - **Memory-mapped files**: paged access with geometric growth
//! - **Enumerator**: stable integer ids for arbitrary keys
//! - **Value log**: chunked appends with chunk and whole-file compaction
//! - **Compression**: optional LZ4 block compression of the value log
//! - **Container cache**: segmented LRU with write-back on eviction
//! - **Crash detection**: dirty/clean magic; dirty storage is rebuilt, never resumed
//!
//! ## Modules
//!
//! - [`storage`]: files, enumerator, value log, codecs, errors
//! - [`index`]: containers, container store, extensions, storage service
//! - [`config`]: TOML + environment configuration and logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use indexio::index::{KeyToValueContainerStore, StoreOptions};
//! use indexio::storage::{KeyRepresentation, StringDescriptor, U32Externalizer};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store: KeyToValueContainerStore<String, u32> = KeyToValueContainerStore::open(
//!         "/tmp/indexio/words",
//!         KeyRepresentation::indirect(StringDescriptor),
//!         Arc::new(U32Externalizer),
//!         StoreOptions::default(),
//!         None,
//!     )?;
//!
//!     // input 7 contains "hello" three times
//!     store.add_value(&"hello".to_string(), 7, 3)?;
//!
//!     let container = store.read(&"hello".to_string())?;
//!     println!("inputs with hello: {:?}", container.input_ids());
//!
//!     store.close()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod index;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    CreationOptions, DataExternalizer, EnumerationCache, Enumerator, KeyDescriptor,
    KeyRepresentation, StorageError, StorageResult, ValueLog,
};

pub use index::{
    IndexExtension, IndexStorageService, InvertedIndex, KeyToValueContainerStore,
    PersistentContainerMap, StorageBackedIndex, StoreOptions, ValueContainer,
};

pub use config::{generate_default_config, init_logging, Config, ConfigError, LoggingConfig, StorageSettings};
