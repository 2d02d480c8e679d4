//! Indexio storage layer
//!
//! Low-level persistent building blocks for the index layer:
//!
//! - **paged**: memory-mapped file accessed through a bounded set of pages
//! - **resizable**: paged file with a logical length and geometric growth
//! - **append_log**: append-only record log with in-place comparison
//! - **enumerator**: persistent key → stable id mapping
//! - **compression**: LZ4 block-compressed append file
//! - **value_log**: chunked, compactable value log
//! - **codec**: key/value externalizers and varints
//! - **options**: immutable creation options
//! - **error**: error types
//!
//! # Architecture
//!
//! ```text
//! Key path:
//!   key → Enumerator (hash buckets + key stream) → id
//!
//! Value path:
//!   id → value address → ValueLog chunk chain → bytes
//!
//! All fixed-layout files sit on ResizableFile → PagedFile → mmap
//! ```

pub mod append_log;
pub mod codec;
pub mod compression;
pub mod enumerator;
pub mod error;
pub mod options;
pub mod paged;
pub mod resizable;
pub mod value_log;

// Re-export commonly used types
pub use append_log::AppendLog;
pub use codec::{
    BincodeExternalizer, BytesDescriptor, DataExternalizer, KeyDescriptor, KeyRepresentation,
    StringDescriptor, U32Externalizer,
};
pub use compression::{CompressedAppendFile, CompressionStats};
pub use enumerator::{
    EnumerationCache, Enumerator, EnumeratorCore, EnumeratorOptions, EnumeratorState, HeaderInfo,
    HeaderState, NULL_ID,
};
pub use error::{StorageError, StorageResult};
pub use options::{CancellationFlag, CancellationHook, CreationOptions};
pub use paged::{PagedFile, PagedFileOptions, PagedFileStats};
pub use resizable::{ResizableFile, ResizableFileOptions};
pub use value_log::{CompactionRecord, ReadResult, ValueLog, ValueLogStats};
