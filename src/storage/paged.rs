//! Paged memory-mapped file
//!
//! A [`PagedFile`] maps fixed-size windows ("pages") of its backing file on
//! demand and keeps a bounded LRU of open mappings, so a large file never needs
//! a single huge mapping and the number of live mappings stays capped.
//!
//! ```text
//! file:   [ page 0 ][ page 1 ][ page 2 ][ page 3 ] ...
//!              │                   │
//! cache:  LRU { 0 → MmapMut(dirty), 2 → MmapMut(clean) }   (max_open_pages)
//! ```
//!
//! All access is bounds-checked against the *physical* file length; growing
//! the file is the caller's job ([`PagedFile::set_physical_len`]). Writes always
//! go through a mapped page. Evicting a dirty page flushes it first.
//!
//! Mutation takes `&mut self`, so the owner's lock is the storage lock: callers
//! that share a file across threads wrap its owner in a mutex.

use crate::storage::error::{StorageError, StorageResult};
use lru::LruCache;
use memmap2::{Mmap, MmapMut, MmapOptions};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Default page window size (1 MiB)
pub const DEFAULT_PAGE_SIZE: usize = 1024 * 1024;

/// Default number of simultaneously mapped pages
pub const DEFAULT_MAX_OPEN_PAGES: usize = 64;

/// Options for opening a paged file
#[derive(Debug, Clone)]
pub struct PagedFileOptions {
    pub page_size: usize,
    pub max_open_pages: usize,
    pub read_only: bool,
    pub io_statistics: bool,
}

impl Default for PagedFileOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_open_pages: DEFAULT_MAX_OPEN_PAGES,
            read_only: false,
            io_statistics: false,
        }
    }
}

impl PagedFileOptions {
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Mapping statistics, collected when `io_statistics` is enabled
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PagedFileStats {
    pub pages_mapped: u64,
    pub pages_evicted: u64,
    pub pages_flushed: u64,
    pub page_hits: u64,
}

enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

/// One mapped window of the file
struct Page {
    offset: u64,
    mapping: Mapping,
    dirty: bool,
}

impl Page {
    fn len(&self) -> usize {
        match &self.mapping {
            Mapping::ReadOnly(map) => map.len(),
            Mapping::Writable(map) => map.len(),
        }
    }

    fn bytes(&self) -> &[u8] {
        match &self.mapping {
            Mapping::ReadOnly(map) => map,
            Mapping::Writable(map) => map,
        }
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.mapping {
            Mapping::ReadOnly(_) => None,
            Mapping::Writable(map) => Some(map),
        }
    }

    fn flush(&mut self) -> StorageResult<bool> {
        if !self.dirty {
            return Ok(false);
        }
        if let Mapping::Writable(map) = &self.mapping {
            map.flush()?;
        }
        self.dirty = false;
        Ok(true)
    }
}

/// File accessed through an LRU of page-sized memory mappings
pub struct PagedFile {
    path: PathBuf,
    file: File,
    physical_len: u64,
    pages: LruCache<u64, Page>,
    options: PagedFileOptions,
    stats: PagedFileStats,
    closed: bool,
}

impl PagedFile {
    /// Open or create a paged file
    pub fn open(path: impl AsRef<Path>, options: PagedFileOptions) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if options.page_size == 0 {
            return Err(StorageError::Config("page size must be positive".into()));
        }

        let file = if options.read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?
        };

        let physical_len = file.metadata()?.len();
        let capacity = NonZeroUsize::new(options.max_open_pages.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            file,
            physical_len,
            pages: LruCache::new(capacity),
            options,
            stats: PagedFileStats::default(),
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn physical_len(&self) -> u64 {
        self.physical_len
    }

    pub fn page_size(&self) -> usize {
        self.options.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn stats(&self) -> PagedFileStats {
        self.stats
    }

    /// True if any mapped page holds unflushed writes
    pub fn is_dirty(&self) -> bool {
        self.pages.iter().any(|(_, page)| page.dirty)
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed(self.path.clone()));
        }
        Ok(())
    }

    fn check_bounds(&self, offset: u64, len: usize) -> StorageResult<()> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.physical_len => Ok(()),
            _ => Err(StorageError::OutOfBounds {
                offset,
                len,
                limit: self.physical_len,
            }),
        }
    }

    /// Map (or fetch from the LRU) the page containing `offset`
    fn page_for(&mut self, offset: u64) -> StorageResult<&mut Page> {
        let page_size = self.options.page_size as u64;
        let index = offset / page_size;

        if self.pages.contains(&index) {
            if self.options.io_statistics {
                self.stats.page_hits += 1;
            }
        } else {
            let page_offset = index * page_size;
            let len = (self.physical_len - page_offset).min(page_size) as usize;

            // SAFETY: the file is opened by this process only (single-writer storage);
            // every access goes through bounds-checked slices of the mapping, and
            // mappings are dropped before the file is resized.
            let mapping = if self.options.read_only {
                Mapping::ReadOnly(unsafe {
                    MmapOptions::new()
                        .offset(page_offset)
                        .len(len)
                        .map(&self.file)?
                })
            } else {
                Mapping::Writable(unsafe {
                    MmapOptions::new()
                        .offset(page_offset)
                        .len(len)
                        .map_mut(&self.file)?
                })
            };

            if self.options.io_statistics {
                self.stats.pages_mapped += 1;
            }

            let page = Page {
                offset: page_offset,
                mapping,
                dirty: false,
            };

            if let Some((_, mut evicted)) = self.pages.push(index, page) {
                if evicted.flush()? && self.options.io_statistics {
                    self.stats.pages_flushed += 1;
                }
                if self.options.io_statistics {
                    self.stats.pages_evicted += 1;
                }
            }
        }

        self.pages.get_mut(&index).ok_or_else(|| {
            StorageError::corrupted(self.path.clone(), format!("page {} vanished", index))
        })
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`
    pub fn get_bytes(&mut self, offset: u64, dst: &mut [u8]) -> StorageResult<()> {
        self.check_open()?;
        self.check_bounds(offset, dst.len())?;

        let mut done = 0;
        while done < dst.len() {
            let pos = offset + done as u64;
            let page = self.page_for(pos)?;
            let in_page = (pos - page.offset) as usize;
            let n = (page.len() - in_page).min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&page.bytes()[in_page..in_page + n]);
            done += n;
        }
        Ok(())
    }

    /// Write `src` at `offset`; the range must already be inside the physical file
    pub fn put_bytes(&mut self, offset: u64, src: &[u8]) -> StorageResult<()> {
        self.check_open()?;
        if self.options.read_only {
            return Err(StorageError::ReadOnly("put_bytes"));
        }
        self.check_bounds(offset, src.len())?;

        let mut done = 0;
        while done < src.len() {
            let pos = offset + done as u64;
            let page = self.page_for(pos)?;
            let in_page = (pos - page.offset) as usize;
            let n = (page.len() - in_page).min(src.len() - done);
            let bytes = page.bytes_mut().ok_or(StorageError::ReadOnly("put_bytes"))?;
            bytes[in_page..in_page + n].copy_from_slice(&src[done..done + n]);
            page.dirty = true;
            done += n;
        }
        Ok(())
    }

    pub fn get_u8(&mut self, offset: u64) -> StorageResult<u8> {
        let mut buf = [0u8; 1];
        self.get_bytes(offset, &mut buf)?;
        Ok(buf[0])
    }

    pub fn put_u8(&mut self, offset: u64, value: u8) -> StorageResult<()> {
        self.put_bytes(offset, &[value])
    }

    pub fn get_i16(&mut self, offset: u64) -> StorageResult<i16> {
        let mut buf = [0u8; 2];
        self.get_bytes(offset, &mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }

    pub fn put_i16(&mut self, offset: u64, value: i16) -> StorageResult<()> {
        self.put_bytes(offset, &value.to_le_bytes())
    }

    pub fn get_i32(&mut self, offset: u64) -> StorageResult<i32> {
        let mut buf = [0u8; 4];
        self.get_bytes(offset, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn put_i32(&mut self, offset: u64, value: i32) -> StorageResult<()> {
        self.put_bytes(offset, &value.to_le_bytes())
    }

    pub fn get_i64(&mut self, offset: u64) -> StorageResult<i64> {
        let mut buf = [0u8; 8];
        self.get_bytes(offset, &mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    pub fn put_i64(&mut self, offset: u64, value: i64) -> StorageResult<()> {
        self.put_bytes(offset, &value.to_le_bytes())
    }

    /// Resize the backing file; every mapping is flushed and dropped first
    pub fn set_physical_len(&mut self, len: u64) -> StorageResult<()> {
        self.check_open()?;
        if self.options.read_only {
            return Err(StorageError::ReadOnly("set_physical_len"));
        }
        if len == self.physical_len {
            return Ok(());
        }

        self.unmap_all()?;
        self.file.set_len(len)?;
        self.physical_len = len;
        Ok(())
    }

    fn unmap_all(&mut self) -> StorageResult<()> {
        self.force()?;
        self.pages.clear();
        Ok(())
    }

    /// Flush every dirty page to disk
    pub fn force(&mut self) -> StorageResult<()> {
        if self.closed || self.options.read_only {
            return Ok(());
        }
        let mut flushed = 0;
        for (_, page) in self.pages.iter_mut() {
            if page.flush()? {
                flushed += 1;
            }
        }
        if self.options.io_statistics {
            self.stats.pages_flushed += flushed;
        }
        Ok(())
    }

    /// Flush and unmap everything; further access fails with `Closed`
    pub fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        self.unmap_all()?;
        if !self.options.read_only {
            self.file.sync_all()?;
        }
        if self.options.io_statistics {
            tracing::debug!("Paged file {:?} closed: {:?}", self.path, self.stats);
        }
        self.closed = true;
        Ok(())
    }
}
