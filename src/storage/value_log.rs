//! Chunked value log
//!
//! Append-only storage for values that grow by appending deltas. A value is a
//! backward-linked chain of chunks; the address of its newest chunk (the
//! *tail*) identifies the whole value.
//!
//! # Record format
//!
//! ```text
//! chunk := varint(len) [varint(address - prev)] data[len]
//! ```
//!
//! The back-pointer is omitted when the log runs without chunks. A delta of 0
//! means "first chunk of the chain". The first append writes an empty header
//! record so that address 0 never holds a value and can mean "no value".
//!
//! # Compaction
//!
//! - [`ValueLog::compact_chunks`] rewrites one value as a single chunk after it
//!   was read with more than one chunk.
//! - [`ValueLog::compact_values`] copies every live value into a fresh log,
//!   walking the source backwards in large windows and assembling chains as
//!   their fragments are met. Partially assembled values are spilled early
//!   when the retained bytes exceed the soft or hard limit.

use crate::storage::codec::{decode_varint, encode_varint};
use crate::storage::compression::{CompressedAppendFile, CompressionStats};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::options::CreationOptions;
use serde::Serialize;
use std::collections::BinaryHeap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Initial read size when following a chain
const READ_BUFFER_SIZE: usize = 1024;

/// Window size of the backward scan in bulk compaction
const COMPACTION_WINDOW: usize = 256 * 1024;

/// Pending appends flushed to the file past this size
const APPEND_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Two varints of at most 10 bytes each
const MAX_CHUNK_HEADER: usize = 20;

/// Partially assembled values smaller than this stay in memory under the soft limit
const MIN_SPILL_SIZE: usize = 1024;

/// Chunk compactions between two timing reports
const CHUNK_REMOVAL_REPORT_INTERVAL: u64 = 1000;

/// Result of following a chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadResult {
    pub bytes: Vec<u8>,
    pub chunk_count: u32,
}

/// One value to carry over in [`ValueLog::compact_values`]
#[derive(Debug, Clone, Default)]
pub struct CompactionRecord {
    /// Tail address in the source log (0: nothing to copy)
    pub value_address: u64,
    /// Tail address in the target log, filled in by compaction
    pub new_value_address: u64,
    /// Known value bytes; written as-is instead of reading the source chain
    pub value: Option<Vec<u8>>,
}

impl CompactionRecord {
    pub fn new(value_address: u64) -> Self {
        Self {
            value_address,
            ..Self::default()
        }
    }
}

/// Counters collected while the log is open
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValueLogStats {
    pub size: u64,
    pub chunks_compacted: u64,
    pub chunk_compaction_time_ms: u128,
    pub compression: Option<CompressionStats>,
}

struct PlainFile {
    file: File,
    reader: Option<File>,
    durable_len: u64,
    pending: Vec<u8>,
}

impl PlainFile {
    fn open(path: &Path, options: &CreationOptions) -> StorageResult<Self> {
        let file = if options.read_only {
            File::open(path)?
        } else {
            OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(path)?
        };
        let reader = if options.single_file_descriptor {
            None
        } else {
            Some(File::open(path)?)
        };
        let durable_len = file.metadata()?.len();
        Ok(Self {
            file,
            reader,
            durable_len,
            pending: Vec::new(),
        })
    }

    fn len(&self) -> u64 {
        self.durable_len + self.pending.len() as u64
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.len();
        self.pending.extend_from_slice(data);
        if self.pending.len() >= APPEND_FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.write_all(&self.pending)?;
        self.durable_len += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    fn read_at(&mut self, offset: u64, dst: &mut [u8]) -> StorageResult<usize> {
        let mut copied = 0usize;
        if offset < self.durable_len {
            let n = ((self.durable_len - offset) as usize).min(dst.len());
            let mut handle = self.reader.as_ref().unwrap_or(&self.file);
            handle.seek(SeekFrom::Start(offset))?;
            handle.read_exact(&mut dst[..n])?;
            copied = n;
        }
        if copied < dst.len() {
            let pos = offset + copied as u64;
            if pos >= self.durable_len {
                let start = (pos - self.durable_len) as usize;
                if start < self.pending.len() {
                    let n = (self.pending.len() - start).min(dst.len() - copied);
                    dst[copied..copied + n].copy_from_slice(&self.pending[start..start + n]);
                    copied += n;
                }
            }
        }
        Ok(copied)
    }

    fn force(&mut self) -> StorageResult<()> {
        self.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

enum Backend {
    Plain(PlainFile),
    Compressed(CompressedAppendFile),
}

impl Backend {
    fn len(&self) -> u64 {
        match self {
            Backend::Plain(file) => file.len(),
            Backend::Compressed(file) => file.len(),
        }
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        match self {
            Backend::Plain(file) => file.append(data),
            Backend::Compressed(file) => file.append(data),
        }
    }

    fn read_at(&mut self, offset: u64, dst: &mut [u8]) -> StorageResult<usize> {
        match self {
            Backend::Plain(file) => file.read_at(offset, dst),
            Backend::Compressed(file) => file.read_at(offset, dst),
        }
    }

    fn is_dirty(&self) -> bool {
        match self {
            Backend::Plain(file) => !file.pending.is_empty(),
            Backend::Compressed(file) => file.is_dirty(),
        }
    }

    fn force(&mut self) -> StorageResult<()> {
        match self {
            Backend::Plain(file) => file.force(),
            Backend::Compressed(file) => file.force(),
        }
    }
}

/// Parsed chunk header
#[derive(Debug, Clone, Copy)]
struct ChunkHeader {
    header_len: usize,
    data_len: u64,
    prev: u64,
}

/// Bytes of the source log around the current backward-scan position
struct ScanWindow {
    start: u64,
    bytes: Vec<u8>,
}

impl ScanWindow {
    fn contains(&self, start: u64, end: u64) -> bool {
        start >= self.start && end <= self.start + self.bytes.len() as u64
    }

    fn slice(&self, start: u64, end: u64) -> &[u8] {
        &self.bytes[(start - self.start) as usize..(end - self.start) as usize]
    }
}

/// Value being reassembled by bulk compaction
#[derive(Default)]
struct PartialValue {
    /// Fragments newest first
    fragments: Vec<Vec<u8>>,
    retained: usize,
}

impl PartialValue {
    fn assemble(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.retained);
        for fragment in self.fragments.into_iter().rev() {
            bytes.extend_from_slice(&fragment);
        }
        bytes
    }
}

/// Append-only log of chunked values
pub struct ValueLog {
    path: PathBuf,
    backend: Backend,
    options: CreationOptions,
    compaction_mode: bool,
    chunks_compacted: u64,
    chunk_compaction_time: Duration,
    closed: bool,
}

impl ValueLog {
    pub fn open(path: impl AsRef<Path>, options: CreationOptions) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !options.read_only {
                std::fs::create_dir_all(parent)?;
            }
        }

        let backend = if options.compression {
            Backend::Compressed(CompressedAppendFile::open(&path, options.read_only)?)
        } else {
            Backend::Plain(PlainFile::open(&path, &options)?)
        };

        tracing::debug!(
            "Opened value log {:?} ({} bytes, compression={})",
            path,
            backend.len(),
            options.compression
        );

        Ok(Self {
            path,
            backend,
            options,
            compaction_mode: false,
            chunks_compacted: 0,
            chunk_compaction_time: Duration::ZERO,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &CreationOptions {
        &self.options
    }

    /// Logical size in bytes, including unflushed appends
    pub fn size(&self) -> u64 {
        self.backend.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.backend.is_dirty()
    }

    pub fn is_compaction_mode(&self) -> bool {
        self.compaction_mode
    }

    /// Forbid appends while a bulk compaction reads this log
    pub fn switch_to_compaction_mode(&mut self) {
        self.compaction_mode = true;
    }

    pub fn stats(&self) -> ValueLogStats {
        ValueLogStats {
            size: self.size(),
            chunks_compacted: self.chunks_compacted,
            chunk_compaction_time_ms: self.chunk_compaction_time.as_millis(),
            compression: match &self.backend {
                Backend::Compressed(file) => Some(file.stats()),
                Backend::Plain(_) => None,
            },
        }
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed(self.path.clone()));
        }
        Ok(())
    }

    fn encode_chunk(&self, data: &[u8], address: u64, prev: u64) -> Vec<u8> {
        let mut record = Vec::with_capacity(data.len() + MAX_CHUNK_HEADER);
        encode_varint(data.len() as u64, &mut record);
        if !self.options.has_no_chunks {
            let delta = if prev == 0 { 0 } else { address - prev };
            encode_varint(delta, &mut record);
        }
        record.extend_from_slice(data);
        record
    }

    /// Append `data` as a chunk linked to `prev` (0: new chain); returns its address
    pub fn append_bytes(&mut self, data: &[u8], prev: u64) -> StorageResult<u64> {
        self.check_open()?;
        if self.options.read_only {
            return Err(StorageError::ReadOnly("append_bytes"));
        }
        if self.compaction_mode {
            return Err(StorageError::Unsupported(
                "append to a value log in compaction mode".into(),
            ));
        }
        if self.options.has_no_chunks && prev != 0 {
            return Err(StorageError::Unsupported(
                "chunk chaining on a value log without chunks".into(),
            ));
        }

        if self.size() == 0 {
            let header = self.encode_chunk(&[], 0, 0);
            self.backend.append(&header)?;
        }

        let address = self.size();
        if prev >= address {
            return Err(StorageError::Unsupported(format!(
                "previous chunk {} is not before {}",
                prev, address
            )));
        }
        let record = self.encode_chunk(data, address, prev);
        self.backend.append(&record)?;
        Ok(address)
    }

    fn parse_header(&self, address: u64, bytes: &[u8], size: u64) -> StorageResult<ChunkHeader> {
        let Some((data_len, mut header_len)) = decode_varint(bytes) else {
            return Err(StorageError::corrupted(
                &self.path,
                format!("unreadable chunk length at {}", address),
            ));
        };
        let mut prev = 0u64;
        if !self.options.has_no_chunks {
            let Some((delta, n)) = decode_varint(&bytes[header_len..]) else {
                return Err(StorageError::corrupted(
                    &self.path,
                    format!("unreadable back-pointer at {}", address),
                ));
            };
            header_len += n;
            if delta != 0 {
                if delta >= address {
                    return Err(StorageError::corrupted(
                        &self.path,
                        format!("chunk at {} points before the log start", address),
                    ));
                }
                prev = address - delta;
            }
        }

        let data_start = address + header_len as u64;
        if data_len > size.saturating_sub(data_start) {
            return Err(StorageError::corrupted(
                &self.path,
                format!(
                    "chunk at {} has length {} past log size {}",
                    address, data_len, size
                ),
            ));
        }
        Ok(ChunkHeader {
            header_len,
            data_len,
            prev,
        })
    }

    /// Read the chunk at `address`, returning its data and back-pointer
    fn read_chunk(&mut self, address: u64, size: u64) -> StorageResult<(Vec<u8>, u64)> {
        if address == 0 || address >= size {
            return Err(StorageError::corrupted(
                &self.path,
                format!("chunk address {} outside log of {} bytes", address, size),
            ));
        }

        let initial = ((size - address) as usize).min(READ_BUFFER_SIZE);
        let mut buf = vec![0u8; initial];
        let read = self.backend.read_at(address, &mut buf)?;
        buf.truncate(read);

        let header = self.parse_header(address, &buf, size)?;
        let end = header.header_len + header.data_len as usize;
        if end > buf.len() {
            let have = buf.len();
            buf.resize(end, 0);
            let read = self.backend.read_at(address + have as u64, &mut buf[have..])?;
            if read != end - have {
                return Err(StorageError::corrupted(
                    &self.path,
                    format!("short read of chunk at {}", address),
                ));
            }
        }
        buf.truncate(end);
        buf.drain(..header.header_len);
        Ok((buf, header.prev))
    }

    /// Follow the chain ending at `tail` and return the concatenated value
    pub fn read_bytes(&mut self, tail: u64) -> StorageResult<ReadResult> {
        self.check_open()?;
        if tail == 0 {
            return Ok(ReadResult::default());
        }

        let size = self.size();
        let mut fragments: Vec<Vec<u8>> = Vec::new();
        let mut total = 0u64;
        let mut address = tail;
        loop {
            if fragments.len() > 1 {
                self.options.check_cancellation()?;
            }
            let (data, prev) = self.read_chunk(address, size)?;
            if prev != 0 && prev >= address {
                return Err(StorageError::corrupted(
                    &self.path,
                    format!("chunk at {} links forward to {}", address, prev),
                ));
            }
            total += data.len() as u64;
            if total > size {
                return Err(StorageError::corrupted(
                    &self.path,
                    format!("chain at {} is longer than the log", tail),
                ));
            }
            fragments.push(data);
            if prev == 0 {
                break;
            }
            address = prev;
        }

        let chunk_count = fragments.len() as u32;
        let mut bytes = Vec::with_capacity(total as usize);
        for fragment in fragments.into_iter().rev() {
            bytes.extend_from_slice(&fragment);
        }
        Ok(ReadResult { bytes, chunk_count })
    }

    /// Whether a value read with `chunk_count` chunks should be compacted now
    pub fn performs_chunk_compaction(&self, chunk_count: u32) -> bool {
        chunk_count > 1 && !self.options.read_only && !self.compaction_mode
    }

    /// Rewrite a value as a single chunk; `appender` optionally re-serializes it
    pub fn compact_chunks(
        &mut self,
        appender: Option<&dyn Fn(&[u8]) -> StorageResult<Vec<u8>>>,
        result: &ReadResult,
    ) -> StorageResult<u64> {
        let started = Instant::now();
        let address = match appender {
            Some(appender) => {
                let bytes = appender(&result.bytes)?;
                self.append_bytes(&bytes, 0)?
            }
            None => self.append_bytes(&result.bytes, 0)?,
        };

        self.chunks_compacted += 1;
        self.chunk_compaction_time += started.elapsed();
        if self.options.dump_chunk_removal_time
            && self.chunks_compacted % CHUNK_REMOVAL_REPORT_INTERVAL == 0
        {
            tracing::info!(
                "Compacted {} chunked values in {:?} ({:?})",
                self.chunks_compacted,
                self.chunk_compaction_time,
                self.path
            );
        }
        Ok(address)
    }

    /// Copy every record's value into `target`, filling `new_value_address`.
    /// Returns `(fragments read, fragments written)`.
    pub fn compact_values(
        &mut self,
        records: &mut [CompactionRecord],
        target: &mut ValueLog,
    ) -> StorageResult<(u64, u64)> {
        self.check_open()?;
        if self.options.has_no_chunks {
            return self.compact_single_chunk_values(records, target);
        }

        let size = self.size();
        let mut fragments = 0u64;
        let mut new_fragments = 0u64;

        // Max-heap on address: the scan only ever moves towards the log start
        let mut heap: BinaryHeap<(u64, usize)> = BinaryHeap::new();
        let mut partial: Vec<Option<PartialValue>> = Vec::with_capacity(records.len());
        for (index, record) in records.iter_mut().enumerate() {
            if let Some(value) = record.value.take() {
                record.new_value_address = target.append_bytes(&value, 0)?;
                new_fragments += 1;
                partial.push(None);
            } else if record.value_address == 0 {
                record.new_value_address = 0;
                partial.push(None);
            } else {
                heap.push((record.value_address, index));
                partial.push(Some(PartialValue::default()));
            }
        }

        let mut window = ScanWindow {
            start: 0,
            bytes: Vec::new(),
        };
        let mut retained = 0usize;

        while let Some((address, index)) = heap.pop() {
            self.options.check_cancellation()?;
            if address == 0 || address >= size {
                return Err(StorageError::corrupted(
                    &self.path,
                    format!("chunk address {} outside log of {} bytes", address, size),
                ));
            }

            let header_end = (address + MAX_CHUNK_HEADER as u64).min(size);
            self.fill_window(&mut window, address, header_end, size)?;
            let header = self.parse_header(address, window.slice(address, header_end), size)?;
            let data_start = address + header.header_len as u64;
            let data_end = data_start + header.data_len;
            self.fill_window(&mut window, address, data_end, size)?;
            let data = window.slice(data_start, data_end).to_vec();
            fragments += 1;

            let Some(value) = partial[index].as_mut() else {
                continue;
            };
            retained += data.len();
            value.retained += data.len();
            value.fragments.push(data);
            let value_retained = value.retained;

            if header.prev == 0 {
                if let Some(done) = partial[index].take() {
                    retained -= done.retained;
                    records[index].new_value_address = target.append_bytes(&done.assemble(), 0)?;
                    new_fragments += 1;
                }
                continue;
            }

            let spill = retained as u64 > self.options.hard_retained_limit
                || (retained as u64 > self.options.soft_retained_limit
                    && value_retained > MIN_SPILL_SIZE);
            if spill {
                if let Some(done) = partial[index].take() {
                    retained -= done.retained;
                    records[index].new_value_address =
                        self.save_preserving_write_order(header.prev, done.assemble(), target)?;
                    new_fragments += 2;
                }
            } else {
                heap.push((header.prev, index));
            }
        }

        tracing::debug!(
            "Compacted {:?}: {} fragments into {} ({} -> {} bytes)",
            self.path,
            fragments,
            new_fragments,
            size,
            target.size()
        );
        Ok((fragments, new_fragments))
    }

    /// Write the not-yet-visited head of a chain, then the accumulated rest linked to it
    fn save_preserving_write_order(
        &mut self,
        prev: u64,
        accumulated: Vec<u8>,
        target: &mut ValueLog,
    ) -> StorageResult<u64> {
        let head = self.read_bytes(prev)?;
        let first = target.append_bytes(&head.bytes, 0)?;
        target.append_bytes(&accumulated, first)
    }

    fn compact_single_chunk_values(
        &mut self,
        records: &mut [CompactionRecord],
        target: &mut ValueLog,
    ) -> StorageResult<(u64, u64)> {
        let mut order: Vec<usize> = (0..records.len()).collect();
        order.sort_by_key(|&index| records[index].value_address);

        let mut fragments = 0u64;
        let mut new_fragments = 0u64;
        for index in order {
            self.options.check_cancellation()?;
            let record = &mut records[index];
            if let Some(value) = record.value.take() {
                record.new_value_address = target.append_bytes(&value, 0)?;
                new_fragments += 1;
                continue;
            }
            if record.value_address == 0 {
                record.new_value_address = 0;
                continue;
            }
            let result = self.read_bytes(record.value_address)?;
            fragments += u64::from(result.chunk_count);
            record.new_value_address = target.append_bytes(&result.bytes, 0)?;
            new_fragments += 1;
        }
        Ok((fragments, new_fragments))
    }

    /// Make `[start, end)` available in `window`, reading backwards-biased blocks
    fn fill_window(
        &mut self,
        window: &mut ScanWindow,
        start: u64,
        end: u64,
        size: u64,
    ) -> StorageResult<()> {
        if window.contains(start, end) {
            return Ok(());
        }
        let end = end.min(size);
        let window_start = start.min(end.saturating_sub(COMPACTION_WINDOW as u64));
        let mut bytes = vec![0u8; (end - window_start) as usize];
        let read = self.backend.read_at(window_start, &mut bytes)?;
        if read != bytes.len() {
            return Err(StorageError::corrupted(
                &self.path,
                format!("short read at {} while compacting", window_start),
            ));
        }
        window.start = window_start;
        window.bytes = bytes;
        Ok(())
    }

    pub fn force(&mut self) -> StorageResult<()> {
        self.check_open()?;
        if self.options.read_only {
            return Ok(());
        }
        self.backend.force()
    }

    /// Flush and release; idempotent
    pub fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        let result = self.force();
        if let Backend::Compressed(file) = &mut self.backend {
            file.close()?;
        }
        self.closed = true;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::options::CancellationFlag;
    use tempfile::tempdir;

    fn open(dir: &Path, options: CreationOptions) -> ValueLog {
        ValueLog::open(dir.join("values"), options).unwrap()
    }

    #[test]
    fn test_chain_reads_in_write_order() {
        let dir = tempdir().unwrap();
        let mut log = open(dir.path(), CreationOptions::default());

        let a = log.append_bytes(&[1u8; 10], 0).unwrap();
        let b = log.append_bytes(&[2u8; 20], a).unwrap();
        let c = log.append_bytes(&[3u8; 5], b).unwrap();
        assert_ne!(a, 0);

        let result = log.read_bytes(c).unwrap();
        assert_eq!(result.chunk_count, 3);
        assert_eq!(result.bytes.len(), 35);
        assert_eq!(&result.bytes[..10], &[1u8; 10]);
        assert_eq!(&result.bytes[10..30], &[2u8; 20]);
        assert_eq!(&result.bytes[30..], &[3u8; 5]);
        assert!(log.performs_chunk_compaction(result.chunk_count));

        let compacted = log.compact_chunks(None, &result).unwrap();
        let again = log.read_bytes(compacted).unwrap();
        assert_eq!(again.chunk_count, 1);
        assert_eq!(again.bytes, result.bytes);
    }

    #[test]
    fn test_zero_address_is_empty_value() {
        let dir = tempdir().unwrap();
        let mut log = open(dir.path(), CreationOptions::default());
        assert_eq!(log.read_bytes(0).unwrap(), ReadResult::default());

        log.append_bytes(b"x", 0).unwrap();
        assert!(log.read_bytes(0).unwrap().bytes.is_empty());
    }

    #[test]
    fn test_reopen_after_close() {
        let dir = tempdir().unwrap();
        let tail;
        {
            let mut log = open(dir.path(), CreationOptions::default());
            let first = log.append_bytes(b"hello ", 0).unwrap();
            tail = log.append_bytes(b"world", first).unwrap();
            log.close().unwrap();
            log.close().unwrap();
            assert!(log.read_bytes(tail).is_err());
        }

        let mut log = open(dir.path(), CreationOptions::default().read_only());
        assert_eq!(log.read_bytes(tail).unwrap().bytes, b"hello world");
        assert!(matches!(
            log.append_bytes(b"!", 0),
            Err(StorageError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_compressed_backend() {
        let dir = tempdir().unwrap();
        let options = CreationOptions::default().with_compression(true);
        let tail;
        {
            let mut log = open(dir.path(), options.clone());
            let mut prev = 0;
            for i in 0..500u32 {
                prev = log.append_bytes(&i.to_le_bytes(), prev).unwrap();
            }
            tail = prev;
            log.close().unwrap();
        }

        let mut log = open(dir.path(), options);
        let result = log.read_bytes(tail).unwrap();
        assert_eq!(result.chunk_count, 500);
        assert_eq!(&result.bytes[4 * 499..], &499u32.to_le_bytes());
        assert!(log.stats().compression.is_some());
    }

    #[test]
    fn test_separate_read_descriptor() {
        let dir = tempdir().unwrap();
        let mut options = CreationOptions::default();
        options.single_file_descriptor = false;
        let mut log = open(dir.path(), options);

        let big = vec![9u8; APPEND_FLUSH_THRESHOLD * 2];
        let a = log.append_bytes(&big, 0).unwrap();
        let b = log.append_bytes(b"tail", a).unwrap();
        let result = log.read_bytes(b).unwrap();
        assert_eq!(result.bytes.len(), big.len() + 4);
    }

    #[test]
    fn test_corrupted_back_pointer() {
        let dir = tempdir().unwrap();
        let mut log = open(dir.path(), CreationOptions::default());
        log.append_bytes(b"abc", 0).unwrap();
        log.force().unwrap();
        drop(log);

        // chunk at 7: len=1, delta=7 points at the header (address 0)
        let path = dir.path().join("values");
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(&[1, 7, b'z']);
        std::fs::write(&path, raw).unwrap();

        let mut log = open(dir.path(), CreationOptions::default());
        let err = log.read_bytes(7).unwrap_err();
        assert!(err.is_corruption());
        let err = log.read_bytes(1000).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_no_chunks_mode_rejects_chaining() {
        let dir = tempdir().unwrap();
        let mut log = open(dir.path(), CreationOptions::default().without_chunks());
        let a = log.append_bytes(b"one", 0).unwrap();
        assert!(matches!(
            log.append_bytes(b"two", a),
            Err(StorageError::Unsupported(_))
        ));
        assert_eq!(log.read_bytes(a).unwrap().bytes, b"one");
    }

    #[test]
    fn test_compaction_mode_forbids_appends() {
        let dir = tempdir().unwrap();
        let mut log = open(dir.path(), CreationOptions::default());
        log.append_bytes(b"one", 0).unwrap();
        log.switch_to_compaction_mode();
        assert!(log.append_bytes(b"two", 0).is_err());
        assert!(!log.performs_chunk_compaction(5));
    }

    #[test]
    fn test_compact_values_rebuilds_interleaved_chains() {
        let dir = tempdir().unwrap();
        let mut source = open(dir.path(), CreationOptions::default());

        let mut tails = [0u64; 3];
        let mut expected = vec![Vec::new(); 3];
        for round in 0..20u8 {
            for (value, tail) in tails.iter_mut().enumerate() {
                let chunk = vec![round.wrapping_mul(3).wrapping_add(value as u8); 7 + value];
                expected[value].extend_from_slice(&chunk);
                *tail = source.append_bytes(&chunk, *tail).unwrap();
            }
        }

        let mut records: Vec<CompactionRecord> =
            tails.iter().map(|&tail| CompactionRecord::new(tail)).collect();
        records.push(CompactionRecord::new(0));
        records.push(CompactionRecord {
            value: Some(b"inline".to_vec()),
            ..CompactionRecord::default()
        });

        source.switch_to_compaction_mode();
        let mut target = ValueLog::open(dir.path().join("values.new"), CreationOptions::default())
            .unwrap();
        let (fragments, new_fragments) = source.compact_values(&mut records, &mut target).unwrap();

        assert_eq!(fragments, 60);
        assert_eq!(new_fragments, 4);
        for (value, record) in records.iter().take(3).enumerate() {
            let result = target.read_bytes(record.new_value_address).unwrap();
            assert_eq!(result.chunk_count, 1);
            assert_eq!(result.bytes, expected[value]);
        }
        assert_eq!(records[3].new_value_address, 0);
        assert_eq!(
            target.read_bytes(records[4].new_value_address).unwrap().bytes,
            b"inline"
        );
        assert!(target.size() < source.size());
    }

    #[test]
    fn test_compact_values_spills_over_limits() {
        let dir = tempdir().unwrap();
        let mut options = CreationOptions::default();
        options.soft_retained_limit = 2048;
        options.hard_retained_limit = 4096;
        let mut source = open(dir.path(), options.clone());

        let mut tail = 0;
        let mut expected = Vec::new();
        for round in 0..64u32 {
            let chunk = vec![(round % 256) as u8; 200];
            expected.extend_from_slice(&chunk);
            tail = source.append_bytes(&chunk, tail).unwrap();
        }

        let mut records = vec![CompactionRecord::new(tail)];
        let mut target = ValueLog::open(dir.path().join("values.new"), options).unwrap();
        let (_, new_fragments) = source.compact_values(&mut records, &mut target).unwrap();

        assert_eq!(new_fragments, 2);
        let result = target.read_bytes(records[0].new_value_address).unwrap();
        assert_eq!(result.chunk_count, 2);
        assert_eq!(result.bytes, expected);
    }

    #[test]
    fn test_no_chunks_compaction() {
        let dir = tempdir().unwrap();
        let options = CreationOptions::default().without_chunks();
        let mut source = open(dir.path(), options.clone());
        let a = source.append_bytes(b"first", 0).unwrap();
        let b = source.append_bytes(b"second", 0).unwrap();

        let mut records = vec![CompactionRecord::new(b), CompactionRecord::new(a)];
        let mut target = ValueLog::open(dir.path().join("values.new"), options).unwrap();
        let (fragments, new_fragments) = source.compact_values(&mut records, &mut target).unwrap();

        assert_eq!((fragments, new_fragments), (2, 2));
        assert!(records[1].new_value_address < records[0].new_value_address);
        assert_eq!(target.read_bytes(records[0].new_value_address).unwrap().bytes, b"second");
    }

    #[test]
    fn test_cancellation_stops_long_reads() {
        let dir = tempdir().unwrap();
        let flag = CancellationFlag::new();
        let mut log = open(
            dir.path(),
            CreationOptions::default().with_cancellation(flag.hook()),
        );
        let mut tail = 0;
        for i in 0..10u8 {
            tail = log.append_bytes(&[i], tail).unwrap();
        }
        assert_eq!(log.read_bytes(tail).unwrap().chunk_count, 10);

        flag.cancel();
        assert!(matches!(log.read_bytes(tail), Err(StorageError::Cancelled)));
    }
}
