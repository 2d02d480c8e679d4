//! LZ4 block-compressed append-only file
//!
//! Callers see a plain append-only byte stream addressed by *uncompressed*
//! offsets. Underneath, data is cut into blocks of at most [`BLOCK_SIZE`]
//! bytes, each LZ4-compressed and appended to the data file.
//!
//! ```text
//! <path>            [lz4 block 0][lz4 block 1]...
//! <path>.chunklen   [(compressed_len: u32, uncompressed_len: u32); block_count]
//! ```
//!
//! The trailing partial block stays in memory and is sealed into a (possibly
//! short) block on [`CompressedAppendFile::force`] or close. The next append
//! loads a short last block back into memory and the following seal replaces
//! it, so frequent flushes do not leave a trail of tiny blocks. The most
//! recently decompressed block is kept so sequential reads touch the codec
//! once per block.

use crate::storage::error::{StorageError, StorageResult};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Maximum uncompressed size of one block
pub const BLOCK_SIZE: usize = 32 * 1024;

const BLOCK_ENTRY_SIZE: usize = 8;

#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    compressed_offset: u64,
    compressed_len: u32,
    uncompressed_offset: u64,
    uncompressed_len: u32,
}

/// Size figures of a compressed file
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressionStats {
    pub block_count: usize,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// uncompressed / compressed over sealed blocks
    pub ratio: f64,
}

/// Append-only file with transparent LZ4 block compression
pub struct CompressedAppendFile {
    path: PathBuf,
    data: File,
    lengths: Option<File>,
    blocks: Vec<BlockEntry>,
    tail: Vec<u8>,
    sealed_len: u64,
    compressed_len: u64,
    cached: Option<(usize, Vec<u8>)>,
    /// Short block loaded back into `tail`; its bytes on disk are replaced on seal
    reopened: Option<BlockEntry>,
    read_only: bool,
}

/// Path of the block-length sidecar for `path`
pub fn chunk_length_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".chunklen");
    PathBuf::from(name)
}

impl CompressedAppendFile {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let lengths_path = chunk_length_path(&path);

        let data = if read_only {
            File::open(&path)?
        } else {
            OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?
        };
        let lengths = if read_only {
            None
        } else {
            Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&lengths_path)?,
            )
        };

        let raw = if lengths_path.exists() {
            std::fs::read(&lengths_path)?
        } else {
            Vec::new()
        };
        if raw.len() % BLOCK_ENTRY_SIZE != 0 {
            return Err(StorageError::corrupted(
                &lengths_path,
                format!("truncated block table ({} bytes)", raw.len()),
            ));
        }

        let mut blocks = Vec::with_capacity(raw.len() / BLOCK_ENTRY_SIZE);
        let mut compressed_len = 0u64;
        let mut sealed_len = 0u64;
        for entry in raw.chunks_exact(BLOCK_ENTRY_SIZE) {
            let compressed = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
            let uncompressed = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
            if uncompressed as usize > BLOCK_SIZE {
                return Err(StorageError::corrupted(
                    &lengths_path,
                    format!("block of {} bytes exceeds {}", uncompressed, BLOCK_SIZE),
                ));
            }
            blocks.push(BlockEntry {
                compressed_offset: compressed_len,
                compressed_len: compressed,
                uncompressed_offset: sealed_len,
                uncompressed_len: uncompressed,
            });
            compressed_len += u64::from(compressed);
            sealed_len += u64::from(uncompressed);
        }

        let on_disk = data.metadata()?.len();
        if on_disk != compressed_len {
            return Err(StorageError::corrupted(
                &path,
                format!(
                    "compressed data is {} bytes, block table expects {}",
                    on_disk, compressed_len
                ),
            ));
        }

        tracing::debug!(
            "Opened compressed file {:?}: {} blocks, {} bytes",
            path,
            blocks.len(),
            sealed_len
        );

        Ok(Self {
            path,
            data,
            lengths,
            blocks,
            tail: Vec::with_capacity(BLOCK_SIZE),
            sealed_len,
            compressed_len,
            cached: None,
            reopened: None,
            read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Uncompressed length, including the unsealed tail
    pub fn len(&self) -> u64 {
        self.sealed_len + self.tail.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        !self.tail.is_empty()
    }

    pub fn stats(&self) -> CompressionStats {
        let ratio = if self.compressed_len > 0 {
            self.sealed_len as f64 / self.compressed_len as f64
        } else {
            0.0
        };
        CompressionStats {
            block_count: self.blocks.len(),
            compressed_size: self.compressed_len,
            uncompressed_size: self.len(),
            ratio,
        }
    }

    /// Append bytes, returning the uncompressed offset they start at
    pub fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if self.read_only {
            return Err(StorageError::ReadOnly("append"));
        }
        let offset = self.len();
        if data.is_empty() {
            return Ok(offset);
        }
        if self.tail.is_empty() {
            self.reopen_last_block()?;
        }
        let mut rest = data;
        while !rest.is_empty() {
            let room = BLOCK_SIZE - self.tail.len();
            let take = room.min(rest.len());
            self.tail.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.tail.len() == BLOCK_SIZE {
                self.seal_tail()?;
            }
        }
        Ok(offset)
    }

    /// Move a short last block back into the tail
    fn reopen_last_block(&mut self) -> StorageResult<()> {
        let Some(&last) = self.blocks.last() else {
            return Ok(());
        };
        if last.uncompressed_len as usize >= BLOCK_SIZE {
            return Ok(());
        }
        let block = self.load_block(self.blocks.len() - 1)?.to_vec();
        self.blocks.pop();
        self.cached = None;
        self.sealed_len = last.uncompressed_offset;
        self.compressed_len = last.compressed_offset;
        self.tail = block;
        self.reopened = Some(last);
        Ok(())
    }

    fn seal_tail(&mut self) -> StorageResult<()> {
        if self.tail.is_empty() {
            return Ok(());
        }
        let compressed = lz4_flex::compress_prepend_size(&self.tail);
        let (Some(lengths), false) = (self.lengths.as_mut(), self.read_only) else {
            return Err(StorageError::ReadOnly("seal block"));
        };

        if let Some(replaced) = self.reopened.take() {
            tracing::trace!(
                "Replacing block {} of {:?} ({} bytes)",
                self.blocks.len(),
                self.path,
                replaced.uncompressed_len
            );
            lengths.set_len((self.blocks.len() * BLOCK_ENTRY_SIZE) as u64)?;
            self.data.set_len(replaced.compressed_offset)?;
        }
        self.data.write_all(&compressed)?;
        let mut entry = [0u8; BLOCK_ENTRY_SIZE];
        entry[..4].copy_from_slice(&(compressed.len() as u32).to_le_bytes());
        entry[4..].copy_from_slice(&(self.tail.len() as u32).to_le_bytes());
        lengths.write_all(&entry)?;

        self.blocks.push(BlockEntry {
            compressed_offset: self.compressed_len,
            compressed_len: compressed.len() as u32,
            uncompressed_offset: self.sealed_len,
            uncompressed_len: self.tail.len() as u32,
        });
        self.compressed_len += compressed.len() as u64;
        self.sealed_len += self.tail.len() as u64;
        self.tail.clear();
        Ok(())
    }

    fn block_containing(&self, offset: u64) -> Option<usize> {
        let index = self
            .blocks
            .partition_point(|block| block.uncompressed_offset <= offset);
        index.checked_sub(1)
    }

    fn load_block(&mut self, index: usize) -> StorageResult<&[u8]> {
        let hit = matches!(&self.cached, Some((cached, _)) if *cached == index);
        if !hit {
            let entry = self.blocks[index];
            let mut compressed = vec![0u8; entry.compressed_len as usize];
            let mut file = &self.data;
            file.seek(SeekFrom::Start(entry.compressed_offset))?;
            file.read_exact(&mut compressed)?;

            let block = lz4_flex::decompress_size_prepended(&compressed).map_err(|e| {
                StorageError::Compression(format!("LZ4 decompression failed: {}", e))
            })?;
            if block.len() != entry.uncompressed_len as usize {
                return Err(StorageError::corrupted(
                    &self.path,
                    format!(
                        "block {} decompressed to {} bytes, expected {}",
                        index,
                        block.len(),
                        entry.uncompressed_len
                    ),
                ));
            }
            self.cached = Some((index, block));
        }
        match &self.cached {
            Some((_, block)) => Ok(block),
            None => Err(StorageError::corrupted(&self.path, "block cache empty")),
        }
    }

    /// Copy bytes starting at `offset` into `dst`; returns the count copied
    pub fn read_at(&mut self, offset: u64, dst: &mut [u8]) -> StorageResult<usize> {
        let mut copied = 0usize;
        while copied < dst.len() {
            let pos = offset + copied as u64;
            if pos >= self.len() {
                break;
            }
            if pos >= self.sealed_len {
                let start = (pos - self.sealed_len) as usize;
                let n = (self.tail.len() - start).min(dst.len() - copied);
                dst[copied..copied + n].copy_from_slice(&self.tail[start..start + n]);
                copied += n;
                continue;
            }

            let Some(index) = self.block_containing(pos) else {
                return Err(StorageError::corrupted(
                    &self.path,
                    format!("no block covers offset {}", pos),
                ));
            };
            let block_start = self.blocks[index].uncompressed_offset;
            let block = self.load_block(index)?;
            let start = (pos - block_start) as usize;
            let n = (block.len() - start).min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&block[start..start + n]);
            copied += n;
        }
        Ok(copied)
    }

    /// Seal the tail and sync both files
    pub fn force(&mut self) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.seal_tail()?;
        self.data.sync_data()?;
        if let Some(lengths) = &self.lengths {
            lengths.sync_data()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> StorageResult<()> {
        self.force()?;
        self.cached = None;
        Ok(())
    }
}
