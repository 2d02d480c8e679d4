//! Creation-time options
//!
//! Everything a storage component needs to know about how it was opened is
//! passed in explicitly as an immutable [`CreationOptions`] value.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::paged::{DEFAULT_MAX_OPEN_PAGES, DEFAULT_PAGE_SIZE};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Retained bytes after which bulk compaction starts spilling accumulated chains
pub const DEFAULT_SOFT_RETAINED_LIMIT: u64 = 10 * 1024 * 1024;

/// Retained bytes after which bulk compaction always spills
pub const DEFAULT_HARD_RETAINED_LIMIT: u64 = 100 * 1024 * 1024;

/// Hook polled at safe points of long operations; returns true to cancel
pub type CancellationHook = Arc<dyn Fn() -> bool + Send + Sync>;

/// Simple cancellation flag that can be turned into a [`CancellationHook`]
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn hook(&self) -> CancellationHook {
        let flag = Arc::clone(&self.0);
        Arc::new(move || flag.load(Ordering::SeqCst))
    }
}

/// Immutable options fixed when a storage is created or opened
#[derive(Clone)]
pub struct CreationOptions {
    /// Reject every mutating operation
    pub read_only: bool,
    /// Route the value log through the LZ4 compressed append file
    pub compression: bool,
    /// Every value is a single chunk; chaining is rejected
    pub has_no_chunks: bool,
    /// Re-serialize values instead of copying raw bytes when compacting chunks
    pub compact_chunks_with_value_deserialization: bool,
    /// Read and append through one file handle
    pub single_file_descriptor: bool,
    /// Report chunk compaction timings through tracing
    pub dump_chunk_removal_time: bool,
    /// Track page mapping statistics
    pub io_statistics: bool,
    pub soft_retained_limit: u64,
    pub hard_retained_limit: u64,
    /// Mapping granularity of the fixed-layout files
    pub page_size: usize,
    pub max_open_pages: usize,
    pub cancellation: Option<CancellationHook>,
}

impl Default for CreationOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            compression: false,
            has_no_chunks: false,
            compact_chunks_with_value_deserialization: false,
            single_file_descriptor: true,
            dump_chunk_removal_time: false,
            io_statistics: false,
            soft_retained_limit: DEFAULT_SOFT_RETAINED_LIMIT,
            hard_retained_limit: DEFAULT_HARD_RETAINED_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
            max_open_pages: DEFAULT_MAX_OPEN_PAGES,
            cancellation: None,
        }
    }
}

impl fmt::Debug for CreationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreationOptions")
            .field("read_only", &self.read_only)
            .field("compression", &self.compression)
            .field("has_no_chunks", &self.has_no_chunks)
            .field(
                "compact_chunks_with_value_deserialization",
                &self.compact_chunks_with_value_deserialization,
            )
            .field("single_file_descriptor", &self.single_file_descriptor)
            .field("dump_chunk_removal_time", &self.dump_chunk_removal_time)
            .field("io_statistics", &self.io_statistics)
            .field("soft_retained_limit", &self.soft_retained_limit)
            .field("hard_retained_limit", &self.hard_retained_limit)
            .field("page_size", &self.page_size)
            .field("max_open_pages", &self.max_open_pages)
            .field("cancellation", &self.cancellation.is_some())
            .finish()
    }
}

impl CreationOptions {
    /// Format version contributed by the options that change the on-disk layout
    pub fn version(&self) -> u32 {
        (if self.has_no_chunks { 10 } else { 0 }) * 31 + if self.compression { 0x13 } else { 0 }
    }

    /// Layout options recorded in a format version produced by [`Self::version`]
    pub fn from_version(version: u32) -> Option<Self> {
        [(false, false), (false, true), (true, false), (true, true)]
            .into_iter()
            .map(|(has_no_chunks, compression)| Self {
                has_no_chunks,
                compression,
                ..Self::default()
            })
            .find(|options| options.version() == version)
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn without_chunks(mut self) -> Self {
        self.has_no_chunks = true;
        self
    }

    pub fn with_cancellation(mut self, hook: CancellationHook) -> Self {
        self.cancellation = Some(hook);
        self
    }

    /// Poll the cancellation hook
    pub fn check_cancellation(&self) -> StorageResult<()> {
        match &self.cancellation {
            Some(hook) if hook() => Err(StorageError::Cancelled),
            _ => Ok(()),
        }
    }
}
