//! Segmented LRU cache
//!
//! New entries land in the probationary segment; a second hit promotes them
//! to the protected segment. The protected segment overflows into the
//! probationary one, and the probationary segment overflows out of the cache.
//! Entries pushed out are collected and handed back through
//! [`SegmentedLruCache::drain_evicted`] so the owner can write them back.

use lru::LruCache;
use std::hash::Hash;

pub struct SegmentedLruCache<K: Hash + Eq, V> {
    protected: LruCache<K, V>,
    probationary: LruCache<K, V>,
    protected_capacity: usize,
    probationary_capacity: usize,
    evicted: Vec<(K, V)>,
}

impl<K: Hash + Eq + Clone, V> SegmentedLruCache<K, V> {
    pub fn new(protected_capacity: usize, probationary_capacity: usize) -> Self {
        Self {
            protected: LruCache::unbounded(),
            probationary: LruCache::unbounded(),
            protected_capacity: protected_capacity.max(1),
            probationary_capacity: probationary_capacity.max(1),
            evicted: Vec::new(),
        }
    }

    /// Split a total capacity: a quarter probationary (at least one), the rest protected
    pub fn with_capacity(total: usize) -> Self {
        let probationary = total.div_ceil(4).max(1);
        let protected = total.saturating_sub(probationary).max(1);
        Self::new(protected, probationary)
    }

    pub fn len(&self) -> usize {
        self.protected.len() + self.probationary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.protected_capacity + self.probationary_capacity
    }

    pub fn contains(&self, key: &K) -> bool {
        self.protected.contains(key) || self.probationary.contains(key)
    }

    /// Look up `key`, promoting a probationary hit
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.protected.contains(key) {
            return self.protected.get_mut(key);
        }
        let value = self.probationary.pop(key)?;
        self.protected.push(key.clone(), value);
        while self.protected.len() > self.protected_capacity {
            match self.protected.pop_lru() {
                Some((k, v)) => self.push_probationary(k, v),
                None => break,
            }
        }
        self.protected.get_mut(key)
    }

    /// Look up `key` without promoting it or touching recency
    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.protected.contains(key) {
            return self.protected.peek_mut(key);
        }
        self.probationary.peek_mut(key)
    }

    /// Insert a new entry into the probationary segment
    pub fn put(&mut self, key: K, value: V) {
        if let Some(old) = self.protected.peek_mut(&key) {
            *old = value;
            return;
        }
        self.push_probationary(key, value);
    }

    fn push_probationary(&mut self, key: K, value: V) {
        if let Some((k, v)) = self.probationary.push(key, value) {
            // push returns the replaced entry for an existing key; only keep real evictions
            if !self.probationary.contains(&k) {
                self.evicted.push((k, v));
            }
        }
        while self.probationary.len() > self.probationary_capacity {
            match self.probationary.pop_lru() {
                Some(entry) => self.evicted.push(entry),
                None => break,
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.protected.pop(key).or_else(|| self.probationary.pop(key))
    }

    /// Entries pushed out of the cache since the last drain
    pub fn drain_evicted(&mut self) -> Vec<(K, V)> {
        std::mem::take(&mut self.evicted)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.protected.iter_mut().chain(self.probationary.iter_mut())
    }

    /// Empty the cache, returning every entry
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut entries = self.drain_evicted();
        while let Some(entry) = self.protected.pop_lru() {
            entries.push(entry);
        }
        while let Some(entry) = self.probationary.pop_lru() {
            entries.push(entry);
        }
        entries
    }

    /// Drop everything without reporting evictions
    pub fn clear(&mut self) {
        self.protected.clear();
        self.probationary.clear();
        self.evicted.clear();
    }
}
