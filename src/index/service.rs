//! Index storage service
//!
//! Composes the storage layer for a set of indices and owns what they share:
//! the enumeration cache and the settings. Each index lives in its own
//! directory under the data dir:
//!
//! ```text
//! <data_dir>/<name>/<name>.version     extension version, plain text
//! <data_dir>/<name>/<name>*            inverted store files
//! <data_dir>/<name>/<name>.forward*    forward map files
//! ```
//!
//! An index whose version file disagrees with its extension, or whose files
//! fail to open as corrupted or outdated, is wiped and recreated empty.

use crate::config::StorageSettings;
use crate::index::extension::{IndexExtension, ManagedIndex, StorageBackedIndex};
use crate::storage::enumerator::EnumerationCache;
use crate::storage::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct IndexStorageService {
    settings: StorageSettings,
    data_dir: PathBuf,
    enumeration_cache: Arc<EnumerationCache>,
    indices: Mutex<Vec<Arc<dyn ManagedIndex>>>,
    shut_down: Mutex<bool>,
}

impl IndexStorageService {
    /// Create the data directory and the shared caches
    pub fn open(settings: StorageSettings) -> StorageResult<Self> {
        let data_dir = settings.data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let enumeration_cache = Arc::new(EnumerationCache::new(settings.enumeration_cache_size));
        tracing::info!(
            "Index storage opened at {:?} (enumeration cache {}, compression {})",
            data_dir,
            settings.enumeration_cache_size,
            settings.compression_enabled
        );
        Ok(Self {
            settings,
            data_dir,
            enumeration_cache,
            indices: Mutex::new(Vec::new()),
            shut_down: Mutex::new(false),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    pub fn enumeration_cache(&self) -> &Arc<EnumerationCache> {
        &self.enumeration_cache
    }

    /// Names of the indices opened so far
    pub fn index_names(&self) -> Vec<String> {
        self.indices
            .lock()
            .iter()
            .map(|index| index.name().to_string())
            .collect()
    }

    fn check_running(&self) -> StorageResult<()> {
        if *self.shut_down.lock() {
            return Err(StorageError::Closed(self.data_dir.clone()));
        }
        Ok(())
    }

    /// Open (or rebuild) the index declared by `extension`
    pub fn open_index<K, V, I>(
        &self,
        extension: Arc<dyn IndexExtension<K, V, I>>,
    ) -> StorageResult<Arc<StorageBackedIndex<K, V, I>>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + PartialEq + Send + Sync + 'static,
        I: 'static,
    {
        self.check_running()?;
        let name = extension.name().to_string();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StorageError::Config(format!("invalid index name {:?}", name)));
        }
        if self.index_names().contains(&name) {
            return Err(StorageError::Config(format!("index {} is already open", name)));
        }

        let dir = self.data_dir.join(&name);
        let version_file = dir.join(format!("{}.version", name));
        let expected = extension.version();

        match read_version(&version_file)? {
            Some(found) if found == expected => {}
            Some(found) => {
                tracing::info!(
                    "Index {} version changed ({} -> {}), rebuilding",
                    name,
                    found,
                    expected
                );
                wipe(&dir)?;
            }
            None if dir.exists() => {
                tracing::info!("Index {} has no version file, rebuilding", name);
                wipe(&dir)?;
            }
            None => {}
        }

        let index = match self.try_open(&dir, &version_file, &extension) {
            Ok(index) => index,
            Err(e) if e.is_corruption() => {
                if e.is_version_update() {
                    tracing::info!("Index {} storage format changed: {}; rebuilding", name, e);
                } else {
                    tracing::warn!("Index {} is corrupted: {}; rebuilding", name, e);
                }
                wipe(&dir)?;
                self.try_open(&dir, &version_file, &extension)?
            }
            Err(e) => return Err(e),
        };

        let index = Arc::new(index);
        self.indices
            .lock()
            .push(Arc::clone(&index) as Arc<dyn ManagedIndex>);
        Ok(index)
    }

    fn try_open<K, V, I>(
        &self,
        dir: &Path,
        version_file: &Path,
        extension: &Arc<dyn IndexExtension<K, V, I>>,
    ) -> StorageResult<StorageBackedIndex<K, V, I>>
    where
        K: Hash + Eq + Clone,
        V: Clone + PartialEq,
    {
        std::fs::create_dir_all(dir)?;
        std::fs::write(version_file, extension.version().to_string())?;
        StorageBackedIndex::open(
            dir,
            Arc::clone(extension),
            self.settings.creation_options(),
            Some(self.settings.cache_size),
            Some(Arc::clone(&self.enumeration_cache)),
        )
    }

    /// Flush every open index, reporting the first failure
    pub fn flush_all(&self) -> StorageResult<()> {
        let indices = self.indices.lock().clone();
        let mut first_error = None;
        for index in indices {
            if let Err(e) = index.flush() {
                tracing::error!("Failed to flush index {}: {}", index.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Close every index and release the shared caches; idempotent
    pub fn shutdown(&self) -> StorageResult<()> {
        {
            let mut shut_down = self.shut_down.lock();
            if *shut_down {
                return Ok(());
            }
            *shut_down = true;
        }

        let indices = std::mem::take(&mut *self.indices.lock());
        let mut first_error = None;
        for index in indices {
            if let Err(e) = index.close() {
                tracing::error!("Failed to close index {}: {}", index.name(), e);
                first_error.get_or_insert(e);
            }
        }
        self.enumeration_cache.clear();
        tracing::info!("Index storage at {:?} shut down", self.data_dir);
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for IndexStorageService {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Index storage shutdown failed: {}", e);
        }
    }
}

fn read_version(path: &Path) -> StorageResult<Option<u32>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn wipe(dir: &Path) -> StorageResult<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
