//! Value containers
//!
//! A [`ValueContainer`] holds everything recorded for one key: each distinct
//! value together with the sorted ids of the inputs that produced it. An input
//! contributes at most one value per key.
//!
//! # Serialized form
//!
//! ```text
//! container := entry*
//! entry     := value  varint(count)  varint(id_0)  varint(id_1 - id_0) ...
//! ```
//!
//! Several serialized containers appended one after another (a chunk chain in
//! the value log) decode as a single container: later entries reassign inputs.

use crate::storage::codec::{read_varint, write_varint, DataExternalizer};
use crate::storage::error::{StorageError, StorageResult};
use std::collections::{BTreeSet, HashMap};

/// Values recorded for one key
#[derive(Debug, Clone, PartialEq)]
pub struct ValueContainer<V> {
    entries: Vec<(V, Vec<u32>)>,
}

impl<V> Default for ValueContainer<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V: Clone + PartialEq> ValueContainer<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Container holding a single association
    pub fn single(input_id: u32, value: V) -> Self {
        Self {
            entries: vec![(value, vec![input_id])],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct values
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Associate `input_id` with `value`, dropping its previous value if any
    pub fn add_value(&mut self, input_id: u32, value: V) {
        self.remove_associated_value(input_id);
        match self.entries.iter_mut().find(|(v, _)| *v == value) {
            Some((_, ids)) => {
                if let Err(pos) = ids.binary_search(&input_id) {
                    ids.insert(pos, input_id);
                }
            }
            None => self.entries.push((value, vec![input_id])),
        }
    }

    /// Remove whatever `input_id` contributed; true if something was removed
    pub fn remove_associated_value(&mut self, input_id: u32) -> bool {
        let mut removed = false;
        for (_, ids) in self.entries.iter_mut() {
            if let Ok(pos) = ids.binary_search(&input_id) {
                ids.remove(pos);
                removed = true;
                break;
            }
        }
        if removed {
            self.entries.retain(|(_, ids)| !ids.is_empty());
        }
        removed
    }

    pub fn value_of(&self, input_id: u32) -> Option<&V> {
        self.entries
            .iter()
            .find(|(_, ids)| ids.binary_search(&input_id).is_ok())
            .map(|(value, _)| value)
    }

    pub fn contains_input(&self, input_id: u32) -> bool {
        self.value_of(input_id).is_some()
    }

    /// `(value, sorted input ids)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&V, &[u32])> {
        self.entries.iter().map(|(value, ids)| (value, ids.as_slice()))
    }

    /// All input ids, sorted
    pub fn input_ids(&self) -> Vec<u32> {
        let ids: BTreeSet<u32> = self
            .entries
            .iter()
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        ids.into_iter().collect()
    }

    /// Replay `other` on top of this container
    pub fn merge(&mut self, other: ValueContainer<V>) {
        for (value, ids) in other.entries {
            for id in ids {
                self.add_value(id, value.clone());
            }
        }
    }

    pub fn save(&self, externalizer: &dyn DataExternalizer<V>) -> StorageResult<Vec<u8>> {
        let mut out = Vec::new();
        for (value, ids) in &self.entries {
            externalizer.save(&mut out, value)?;
            write_varint(&mut out, ids.len() as u64)?;
            let mut last = 0u32;
            for (i, &id) in ids.iter().enumerate() {
                let delta = if i == 0 { id } else { id - last };
                write_varint(&mut out, u64::from(delta))?;
                last = id;
            }
        }
        Ok(out)
    }

    /// Decode one or more concatenated containers
    ///
    /// Runs in one pass: ids are collected per entry and the entry an input
    /// was assigned to last is remembered, so reassignments cost no scans.
    pub fn read(bytes: &[u8], externalizer: &dyn DataExternalizer<V>) -> StorageResult<Self> {
        let mut entries: Vec<(V, Vec<u32>)> = Vec::new();
        let mut owner: HashMap<u32, usize> = HashMap::new();
        let mut input = bytes;
        while !input.is_empty() {
            let value = externalizer.read(&mut input)?;
            let count = read_varint(&mut input)?;
            if count > input.len() as u64 {
                return Err(StorageError::Serialization(format!(
                    "container entry claims {} ids with {} bytes left",
                    count,
                    input.len()
                )));
            }
            let slot = match entries.iter().position(|(v, _)| *v == value) {
                Some(slot) => slot,
                None => {
                    entries.push((value, Vec::with_capacity(count as usize)));
                    entries.len() - 1
                }
            };
            let mut id = 0u64;
            for i in 0..count {
                let delta = read_varint(&mut input)?;
                id = if i == 0 { delta } else { id + delta };
                let input_id = u32::try_from(id).map_err(|_| {
                    StorageError::Serialization(format!("input id {} out of range", id))
                })?;
                entries[slot].1.push(input_id);
                owner.insert(input_id, slot);
            }
        }

        for (slot, (_, ids)) in entries.iter_mut().enumerate() {
            ids.retain(|id| owner.get(id) == Some(&slot));
            ids.sort_unstable();
            ids.dedup();
        }
        entries.retain(|(_, ids)| !ids.is_empty());
        Ok(Self { entries })
    }
}

/// Container with the bookkeeping needed for incremental persistence
///
/// Additions since the last save are kept apart so they can be appended as a
/// delta. A removal cannot be expressed as a delta and forces a full rewrite.
#[derive(Debug, Clone)]
pub struct ChangeTrackingValueContainer<V> {
    merged: ValueContainer<V>,
    added: ValueContainer<V>,
    needs_compacting: bool,
    dirty: bool,
}

impl<V: Clone + PartialEq> ChangeTrackingValueContainer<V> {
    pub fn new() -> Self {
        Self::from_stored(ValueContainer::new())
    }

    /// Wrap a container loaded from storage
    pub fn from_stored(stored: ValueContainer<V>) -> Self {
        Self {
            merged: stored,
            added: ValueContainer::new(),
            needs_compacting: false,
            dirty: false,
        }
    }

    pub fn container(&self) -> &ValueContainer<V> {
        &self.merged
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn needs_compacting(&self) -> bool {
        self.needs_compacting
    }

    pub fn add_value(&mut self, input_id: u32, value: V) {
        self.merged.add_value(input_id, value.clone());
        self.added.add_value(input_id, value);
        self.dirty = true;
    }

    pub fn remove_associated_value(&mut self, input_id: u32) -> bool {
        if !self.merged.remove_associated_value(input_id) {
            return false;
        }
        self.added.remove_associated_value(input_id);
        self.needs_compacting = true;
        self.dirty = true;
        true
    }

    /// Additions since the last save
    pub fn save_delta(&self, externalizer: &dyn DataExternalizer<V>) -> StorageResult<Vec<u8>> {
        self.added.save(externalizer)
    }

    /// The whole container
    pub fn save_full(&self, externalizer: &dyn DataExternalizer<V>) -> StorageResult<Vec<u8>> {
        self.merged.save(externalizer)
    }

    /// Everything is persisted: reset the change tracking
    pub fn mark_saved(&mut self) {
        self.added = ValueContainer::new();
        self.needs_compacting = false;
        self.dirty = false;
    }
}

impl<V: Clone + PartialEq> Default for ChangeTrackingValueContainer<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::{StringDescriptor, U32Externalizer};

    fn s(value: &str) -> String {
        value.to_string()
    }

    #[test]
    fn test_input_contributes_one_value() {
        let mut container = ValueContainer::new();
        container.add_value(1, s("a"));
        container.add_value(2, s("a"));
        container.add_value(1, s("b"));

        assert_eq!(container.size(), 2);
        assert_eq!(container.value_of(1), Some(&s("b")));
        assert_eq!(container.value_of(2), Some(&s("a")));
        assert_eq!(container.input_ids(), vec![1, 2]);

        assert!(container.remove_associated_value(2));
        assert!(!container.remove_associated_value(2));
        assert_eq!(container.size(), 1);
    }

    #[test]
    fn test_concatenated_deltas_decode_as_one_container() {
        let mut base = ValueContainer::new();
        base.add_value(10, s("x"));
        base.add_value(3, s("x"));
        base.add_value(7, s("y"));

        let mut delta = ValueContainer::new();
        delta.add_value(7, s("x"));
        delta.add_value(1000, s("z"));

        let mut bytes = base.save(&StringDescriptor).unwrap();
        bytes.extend(delta.save(&StringDescriptor).unwrap());

        let restored = ValueContainer::<String>::read(&bytes, &StringDescriptor).unwrap();
        assert_eq!(restored.value_of(7), Some(&s("x")));
        assert_eq!(restored.value_of(1000), Some(&s("z")));
        assert_eq!(restored.input_ids(), vec![3, 7, 10, 1000]);
        assert_eq!(restored.size(), 2);
    }

    #[test]
    fn test_large_container_decodes_with_reassignments() {
        let mut base = ValueContainer::new();
        for id in 0..20_000u32 {
            base.add_value(id, id % 3);
        }
        let mut delta = ValueContainer::new();
        for id in (0..20_000u32).step_by(2) {
            delta.add_value(id, 7);
        }

        let mut bytes = base.save(&U32Externalizer).unwrap();
        bytes.extend(delta.save(&U32Externalizer).unwrap());
        let restored = ValueContainer::<u32>::read(&bytes, &U32Externalizer).unwrap();

        assert_eq!(restored.size(), 4);
        assert_eq!(restored.input_ids().len(), 20_000);
        assert_eq!(restored.value_of(4), Some(&7));
        assert_eq!(restored.value_of(5), Some(&2));
        let sevens = restored.iter().find(|(v, _)| **v == 7).map(|(_, ids)| ids.len());
        assert_eq!(sevens, Some(10_000));
    }

    #[test]
    fn test_truncated_container_is_rejected() {
        let container = ValueContainer::single(5, s("v"));
        let mut bytes = container.save(&StringDescriptor).unwrap();
        bytes.pop();
        assert!(ValueContainer::<String>::read(&bytes, &StringDescriptor).is_err());
    }

    #[test]
    fn test_change_tracking() {
        let mut tracked = ChangeTrackingValueContainer::from_stored(ValueContainer::single(1, s("a")));
        assert!(!tracked.is_dirty());

        tracked.add_value(2, s("b"));
        assert!(tracked.is_dirty());
        assert!(!tracked.needs_compacting());
        let delta = ValueContainer::<String>::read(&tracked.save_delta(&StringDescriptor).unwrap(), &StringDescriptor)
            .unwrap();
        assert_eq!(delta.input_ids(), vec![2]);

        tracked.mark_saved();
        assert!(!tracked.is_dirty());

        assert!(tracked.remove_associated_value(1));
        assert!(tracked.needs_compacting());
        assert!(!tracked.remove_associated_value(99));
        assert_eq!(tracked.container().input_ids(), vec![2]);
    }
}
