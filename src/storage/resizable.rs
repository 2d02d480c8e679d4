//! Resizable memory-mapped file
//!
//! Wraps a [`PagedFile`] with a *logical* length (bytes in use) that is
//! tracked separately from the *physical* length (bytes allocated on disk).
//!
//! - Physical length only grows, geometrically by 13/8 per step and rounded up
//!   to the allocation factor, so a file that ends at size S was resized
//!   O(log(S / initial)) times and is never more than ~62% over-allocated.
//! - The logical length is persisted in a `<file>.len` sidecar (8 bytes, LE)
//!   because the OS length reflects the rounded-up physical size.
//! - If the sidecar cannot be read on open, the physical length is used as the
//!   logical length. Lossy, but never reads past real data.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::paged::{PagedFile, PagedFileOptions, PagedFileStats};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Default granularity of physical growth
pub const DEFAULT_ALLOCATION_FACTOR: u64 = 4096;

/// Default size of the first physical allocation
pub const DEFAULT_INITIAL_SIZE: u64 = 4096;

/// Options for opening a resizable file
#[derive(Debug, Clone)]
pub struct ResizableFileOptions {
    pub paged: PagedFileOptions,
    pub initial_size: u64,
    pub allocation_factor: u64,
    /// Shrink the physical file to its logical length on close
    pub truncate_on_close: bool,
}

impl Default for ResizableFileOptions {
    fn default() -> Self {
        Self {
            paged: PagedFileOptions::default(),
            initial_size: DEFAULT_INITIAL_SIZE,
            allocation_factor: DEFAULT_ALLOCATION_FACTOR,
            truncate_on_close: false,
        }
    }
}

impl ResizableFileOptions {
    pub fn with_paged(mut self, paged: PagedFileOptions) -> Self {
        self.paged = paged;
        self
    }

    pub fn initial_size(mut self, initial_size: u64) -> Self {
        self.initial_size = initial_size;
        self
    }
}

/// Next physical size covering `requested`, growing from `current`
pub fn next_physical_size(
    current: u64,
    requested: u64,
    initial_size: u64,
    allocation_factor: u64,
) -> u64 {
    let mut size = if current == 0 {
        initial_size.max(requested)
    } else {
        let mut size = current;
        while size < requested {
            size = size.saturating_add((size * 5 / 8).max(1));
        }
        size
    };
    let factor = allocation_factor.max(1);
    if size % factor != 0 {
        size = (size / factor + 1) * factor;
    }
    size
}

/// Path of the logical-length sidecar for `path`
pub fn length_file_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".len");
    PathBuf::from(name)
}

/// Memory-mapped file with separately tracked logical length
pub struct ResizableFile {
    paged: PagedFile,
    len_path: PathBuf,
    logical_len: u64,
    last_forced_len: u64,
    options: ResizableFileOptions,
}

impl ResizableFile {
    pub fn open(path: impl AsRef<Path>, options: ResizableFileOptions) -> StorageResult<Self> {
        let path = path.as_ref();
        let paged = PagedFile::open(path, options.paged.clone())?;
        let len_path = length_file_path(path);

        let physical = paged.physical_len();
        let logical_len = match read_length_file(&len_path) {
            Ok(Some(len)) if len <= physical => len,
            Ok(Some(len)) => {
                tracing::warn!(
                    "Logical length {} exceeds physical length {} for {:?}, using physical",
                    len,
                    physical,
                    path
                );
                physical
            }
            Ok(None) => physical,
            Err(e) => {
                tracing::warn!(
                    "Failed to read length file {:?}: {}, using physical length",
                    len_path,
                    e
                );
                physical
            }
        };

        Ok(Self {
            paged,
            len_path,
            logical_len,
            last_forced_len: logical_len,
            options,
        })
    }

    pub fn path(&self) -> &Path {
        self.paged.path()
    }

    /// Logical length: bytes in use
    pub fn len(&self) -> u64 {
        self.logical_len
    }

    pub fn is_empty(&self) -> bool {
        self.logical_len == 0
    }

    pub fn physical_len(&self) -> u64 {
        self.paged.physical_len()
    }

    pub fn is_read_only(&self) -> bool {
        self.paged.is_read_only()
    }

    pub fn stats(&self) -> PagedFileStats {
        self.paged.stats()
    }

    /// True if the logical length or any page changed since the last force
    pub fn is_dirty(&self) -> bool {
        self.logical_len != self.last_forced_len || self.paged.is_dirty()
    }

    /// Grow the logical length to at least `pos`, expanding physically if needed
    pub fn ensure_size(&mut self, pos: u64) -> StorageResult<()> {
        if pos <= self.logical_len {
            return Ok(());
        }
        if self.paged.is_read_only() {
            return Err(StorageError::ReadOnly("ensure_size"));
        }
        if pos > self.paged.physical_len() {
            let new_size = next_physical_size(
                self.paged.physical_len(),
                pos,
                self.options.initial_size,
                self.options.allocation_factor,
            );
            tracing::trace!(
                "Expanding {:?} from {} to {} bytes",
                self.paged.path(),
                self.paged.physical_len(),
                new_size
            );
            self.paged.set_physical_len(new_size)?;
        }
        self.logical_len = pos;
        Ok(())
    }

    fn check_readable(&self, offset: u64, len: usize) -> StorageResult<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.logical_len => Ok(()),
            _ => Err(StorageError::OutOfBounds {
                offset,
                len,
                limit: self.logical_len,
            }),
        }
    }

    pub fn get_bytes(&mut self, offset: u64, dst: &mut [u8]) -> StorageResult<()> {
        self.check_readable(offset, dst.len())?;
        self.paged.get_bytes(offset, dst)
    }

    pub fn put_bytes(&mut self, offset: u64, src: &[u8]) -> StorageResult<()> {
        self.ensure_size(offset + src.len() as u64)?;
        self.paged.put_bytes(offset, src)
    }

    pub fn get_i32(&mut self, offset: u64) -> StorageResult<i32> {
        self.check_readable(offset, 4)?;
        self.paged.get_i32(offset)
    }

    pub fn put_i32(&mut self, offset: u64, value: i32) -> StorageResult<()> {
        self.ensure_size(offset + 4)?;
        self.paged.put_i32(offset, value)
    }

    pub fn get_i64(&mut self, offset: u64) -> StorageResult<i64> {
        self.check_readable(offset, 8)?;
        self.paged.get_i64(offset)
    }

    pub fn put_i64(&mut self, offset: u64, value: i64) -> StorageResult<()> {
        self.ensure_size(offset + 8)?;
        self.paged.put_i64(offset, value)
    }

    /// Persist the logical length (only if it changed) and flush dirty pages
    pub fn force(&mut self) -> StorageResult<()> {
        if self.paged.is_read_only() {
            return Ok(());
        }
        if self.logical_len != self.last_forced_len || !self.len_path.exists() {
            std::fs::write(&self.len_path, self.logical_len.to_le_bytes())?;
            self.last_forced_len = self.logical_len;
        }
        self.paged.force()
    }

    /// Drop all content: logical and physical length go back to zero
    pub fn clear(&mut self) -> StorageResult<()> {
        if self.paged.is_read_only() {
            return Err(StorageError::ReadOnly("clear"));
        }
        self.paged.set_physical_len(0)?;
        self.logical_len = 0;
        Ok(())
    }

    pub fn close(&mut self) -> StorageResult<()> {
        self.force()?;
        if self.options.truncate_on_close
            && !self.paged.is_read_only()
            && self.paged.physical_len() > self.logical_len
        {
            self.paged.set_physical_len(self.logical_len)?;
        }
        self.paged.close()
    }
}

fn read_length_file(path: &Path) -> std::io::Result<Option<u64>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(Some(u64::from_le_bytes(buf)))
}
