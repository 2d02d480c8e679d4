//! Append-only record log over a resizable mapped file
//!
//! Records are serialized by a caller-supplied [`DataExternalizer`] and
//! identified by their start address. Small appends are collected in a
//! 4096-byte buffer; a record that does not fit the remaining buffer space
//! flushes the buffer first, and a record at least as large as the whole
//! buffer goes straight to the file. A record is therefore always either
//! entirely in the buffer or entirely in the file:
//!
//! ```text
//! address:  0 ............................. file.len() ....... file.len() + buffer.len()
//!           [ records on disk              ][ records in buffer ]
//! ```

use crate::storage::codec::DataExternalizer;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::resizable::{ResizableFile, ResizableFileOptions};
use std::io::{self, Read, Write};
use std::path::Path;

/// Size of the in-memory append buffer
pub const APPEND_BUFFER_SIZE: usize = 4096;

const READ_BUFFER_SIZE: usize = 512;

fn to_io_error(err: StorageError) -> io::Error {
    match err {
        StorageError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

/// Sequential reader over `[pos, end)` of a resizable file
pub(crate) struct MappedReader<'a> {
    file: &'a mut ResizableFile,
    pos: u64,
    end: u64,
    buf: Vec<u8>,
    buf_start: u64,
    buf_len: usize,
}

impl<'a> MappedReader<'a> {
    pub(crate) fn new(file: &'a mut ResizableFile, pos: u64, end: u64) -> Self {
        Self {
            file,
            pos,
            end,
            buf: vec![0u8; READ_BUFFER_SIZE],
            buf_start: pos,
            buf_len: 0,
        }
    }

    /// Address of the next unread byte
    pub(crate) fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for MappedReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.end || out.is_empty() {
            return Ok(0);
        }
        let buffered_end = self.buf_start + self.buf_len as u64;
        if self.pos < self.buf_start || self.pos >= buffered_end {
            let n = (self.end - self.pos).min(self.buf.len() as u64) as usize;
            self.file
                .get_bytes(self.pos, &mut self.buf[..n])
                .map_err(to_io_error)?;
            self.buf_start = self.pos;
            self.buf_len = n;
        }
        let in_buf = (self.pos - self.buf_start) as usize;
        let n = (self.buf_len - in_buf).min(out.len());
        out[..n].copy_from_slice(&self.buf[in_buf..in_buf + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

/// Sink that compares everything written to it against stored bytes
struct ComparingSink<'a> {
    log: &'a mut AppendLog,
    pos: u64,
    same: bool,
}

impl Write for ComparingSink<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.same {
            self.same = self
                .log
                .bytes_equal_at(self.pos, data)
                .map_err(to_io_error)?;
        }
        self.pos += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered append-only log of self-delimiting records
pub struct AppendLog {
    file: ResizableFile,
    buffer: Vec<u8>,
}

impl AppendLog {
    pub fn open(path: impl AsRef<Path>, options: ResizableFileOptions) -> StorageResult<Self> {
        let file = ResizableFile::open(path, options)?;
        Ok(Self {
            file,
            buffer: Vec::with_capacity(APPEND_BUFFER_SIZE),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Total length including unflushed records
    pub fn len(&self) -> u64 {
        self.file.len() + self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        !self.buffer.is_empty() || self.file.is_dirty()
    }

    fn flush_buffer(&mut self) -> StorageResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let at = self.file.len();
        self.file.put_bytes(at, &self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    /// Append raw record bytes, returning the record address
    pub fn append_bytes(&mut self, data: &[u8]) -> StorageResult<u64> {
        if self.file.is_read_only() {
            return Err(StorageError::ReadOnly("append"));
        }
        if data.len() > APPEND_BUFFER_SIZE - self.buffer.len() {
            self.flush_buffer()?;
        }
        let address = self.len();
        if data.len() >= APPEND_BUFFER_SIZE {
            let at = self.file.len();
            self.file.put_bytes(at, data)?;
        } else {
            self.buffer.extend_from_slice(data);
        }
        Ok(address)
    }

    /// Serialize `value` and append it
    pub fn append<T>(&mut self, value: &T, externalizer: &dyn DataExternalizer<T>) -> StorageResult<u64> {
        let mut data = Vec::new();
        externalizer.save(&mut data, value)?;
        self.append_bytes(&data)
    }

    fn check_address(&self, address: u64) -> StorageResult<()> {
        if address >= self.len() {
            return Err(StorageError::OutOfBounds {
                offset: address,
                len: 0,
                limit: self.len(),
            });
        }
        Ok(())
    }

    /// Deserialize the record at `address`
    pub fn read<T>(&mut self, address: u64, externalizer: &dyn DataExternalizer<T>) -> StorageResult<T> {
        self.check_address(address)?;
        let flushed = self.file.len();
        if address >= flushed {
            let mut slice = &self.buffer[(address - flushed) as usize..];
            externalizer.read(&mut slice)
        } else {
            let mut reader = MappedReader::new(&mut self.file, address, flushed);
            externalizer.read(&mut reader)
        }
    }

    /// Compare `data` with the stored bytes at `address`
    fn bytes_equal_at(&mut self, address: u64, data: &[u8]) -> StorageResult<bool> {
        let end = address + data.len() as u64;
        if end > self.len() {
            return Ok(false);
        }
        let flushed = self.file.len();
        if address >= flushed {
            let start = (address - flushed) as usize;
            return Ok(&self.buffer[start..start + data.len()] == data);
        }
        if end > flushed {
            // Records never straddle the flush boundary
            return Ok(false);
        }
        let mut stored = [0u8; READ_BUFFER_SIZE];
        let mut done = 0;
        while done < data.len() {
            let n = (data.len() - done).min(stored.len());
            self.file.get_bytes(address + done as u64, &mut stored[..n])?;
            if stored[..n] != data[done..done + n] {
                return Ok(false);
            }
            done += n;
        }
        Ok(true)
    }

    /// True if re-serializing `value` reproduces the record at `address` byte for byte
    pub fn check_bytes_are_the_same<T>(
        &mut self,
        address: u64,
        value: &T,
        externalizer: &dyn DataExternalizer<T>,
    ) -> StorageResult<bool> {
        self.check_address(address)?;
        let mut sink = ComparingSink {
            log: self,
            pos: address,
            same: true,
        };
        externalizer.save(&mut sink, value)?;
        Ok(sink.same)
    }

    /// Visit every record in address order; stops early when `visitor` returns false
    pub fn process_all<T, F>(
        &mut self,
        externalizer: &dyn DataExternalizer<T>,
        mut visitor: F,
    ) -> StorageResult<bool>
    where
        F: FnMut(u64, T) -> StorageResult<bool>,
    {
        if !self.file.is_read_only() {
            self.flush_buffer()?;
        }
        let end = self.file.len();
        let mut reader = MappedReader::new(&mut self.file, 0, end);
        while reader.position() < end {
            let address = reader.position();
            let value = externalizer.read(&mut reader)?;
            if !visitor(address, value)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Flush the append buffer and persist the file
    pub fn force(&mut self) -> StorageResult<()> {
        if self.file.is_read_only() {
            return Ok(());
        }
        self.flush_buffer()?;
        self.file.force()
    }

    pub fn clear(&mut self) -> StorageResult<()> {
        self.buffer.clear();
        self.file.clear()
    }

    pub fn close(&mut self) -> StorageResult<()> {
        if !self.file.is_read_only() {
            self.flush_buffer()?;
        }
        self.file.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::{BytesDescriptor, StringDescriptor};
    use tempfile::tempdir;

    #[test]
    fn test_append_and_read_buffered_and_flushed() {
        let dir = tempdir().unwrap();
        let mut log = AppendLog::open(dir.path().join("keys"), ResizableFileOptions::default()).unwrap();

        let mut addresses = Vec::new();
        for i in 0..2000 {
            let key = format!("key-{}", i);
            addresses.push(log.append(&key, &StringDescriptor).unwrap());
        }

        // Some records are on disk, the last few still in the buffer
        for (i, &address) in addresses.iter().enumerate() {
            let key: String = log.read(address, &StringDescriptor).unwrap();
            assert_eq!(key, format!("key-{}", i));
        }
    }

    #[test]
    fn test_large_record_bypasses_buffer() {
        let dir = tempdir().unwrap();
        let mut log = AppendLog::open(dir.path().join("keys"), ResizableFileOptions::default()).unwrap();

        let small = log.append(&vec![1u8; 10], &BytesDescriptor).unwrap();
        let large_value = vec![7u8; APPEND_BUFFER_SIZE * 3];
        let large = log.append(&large_value, &BytesDescriptor).unwrap();
        let tail = log.append(&vec![2u8; 5], &BytesDescriptor).unwrap();

        assert_eq!(small, 0);
        assert!(large > small);
        assert!(tail > large);
        assert_eq!(log.read(large, &BytesDescriptor).unwrap(), large_value);
        assert_eq!(log.read(tail, &BytesDescriptor).unwrap(), vec![2u8; 5]);
    }

    #[test]
    fn test_check_bytes_are_the_same() {
        let dir = tempdir().unwrap();
        let mut log = AppendLog::open(dir.path().join("keys"), ResizableFileOptions::default()).unwrap();

        let address = log.append(&"alpha".to_string(), &StringDescriptor).unwrap();
        assert!(log
            .check_bytes_are_the_same(address, &"alpha".to_string(), &StringDescriptor)
            .unwrap());
        assert!(!log
            .check_bytes_are_the_same(address, &"alphx".to_string(), &StringDescriptor)
            .unwrap());

        log.force().unwrap();
        assert!(log
            .check_bytes_are_the_same(address, &"alpha".to_string(), &StringDescriptor)
            .unwrap());
        assert!(!log
            .check_bytes_are_the_same(address, &"alpha-longer".to_string(), &StringDescriptor)
            .unwrap());
    }

    #[test]
    fn test_process_all_short_circuits() {
        let dir = tempdir().unwrap();
        let mut log = AppendLog::open(dir.path().join("keys"), ResizableFileOptions::default()).unwrap();
        for i in 0..10 {
            log.append(&format!("k{}", i), &StringDescriptor).unwrap();
        }

        let mut seen = Vec::new();
        let completed = log
            .process_all(&StringDescriptor, |_, key| {
                seen.push(key);
                Ok(seen.len() < 4)
            })
            .unwrap();

        assert!(!completed);
        assert_eq!(seen, vec!["k0", "k1", "k2", "k3"]);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys");

        let address;
        {
            let mut log = AppendLog::open(&path, ResizableFileOptions::default()).unwrap();
            log.append(&"first".to_string(), &StringDescriptor).unwrap();
            address = log.append(&"second".to_string(), &StringDescriptor).unwrap();
            log.close().unwrap();
        }

        let mut log = AppendLog::open(&path, ResizableFileOptions::default()).unwrap();
        assert_eq!(log.read(address, &StringDescriptor).unwrap(), "second");

        let mut count = 0;
        log.process_all(&StringDescriptor, |_, _| {
            count += 1;
            Ok(true)
        })
        .unwrap();
        assert_eq!(count, 2);
    }
}
