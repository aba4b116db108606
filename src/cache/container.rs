//! Local data container holding values, tombstones and remote-copy pointers.

use crate::partitioning::KeyPartitioner;
use crate::types::{EntryVersion, InternalEntry, Key, NodeId, SegmentId};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::ops::Bound;

/// Concurrent local store of one node.
///
/// Entries on a node that does not own their segment are stale copies kept
/// around until an invalidation with a newer version removes them.
///
/// Every key is also indexed in key order under its segment, so segment
/// listings never scan the whole store. The index is only changed while
/// the entry's shard is locked.
#[derive(Debug)]
pub struct DataContainer {
    entries: DashMap<Key, InternalEntry>,
    index: Vec<RwLock<BTreeSet<Key>>>,
    partitioner: KeyPartitioner,
}

impl DataContainer {
    /// Create an empty container.
    pub fn new(partitioner: KeyPartitioner) -> Self {
        Self {
            entries: DashMap::new(),
            index: (0..partitioner.num_segments())
                .map(|_| RwLock::new(BTreeSet::new()))
                .collect(),
            partitioner,
        }
    }

    /// The partitioner used for segment queries.
    pub fn partitioner(&self) -> KeyPartitioner {
        self.partitioner
    }

    /// Get an entry.
    pub fn get(&self, key: &[u8]) -> Option<InternalEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Get a locally held value.
    pub fn get_value(&self, key: &[u8]) -> Option<Bytes> {
        self.entries.get(key).and_then(|e| e.value.clone())
    }

    /// Version of the locally held copy of `key`; `None` for a pointer.
    pub fn local_version(&self, key: &[u8]) -> Option<EntryVersion> {
        self.entries
            .get(key)
            .filter(|e| !e.is_remote())
            .map(|e| e.version)
    }

    /// Store the result of an owner write unconditionally.
    pub fn put_local(&self, key: Key, entry: InternalEntry) {
        self.upsert(key, entry, |_, _| true);
    }

    /// Store a transferred or backed-up entry unless a newer copy exists.
    ///
    /// A remote pointer is replaced by data of the same version.
    /// Returns whether the entry was stored.
    pub fn apply(&self, key: Key, entry: InternalEntry) -> bool {
        self.upsert(key, entry, |existing, entry| {
            existing.version < entry.version
                || (existing.is_remote() && existing.version == entry.version)
        })
    }

    /// Record that `holder` has `key` at `version` unless we know better.
    pub fn merge_remote(&self, key: Key, version: EntryVersion, holder: NodeId) -> bool {
        self.upsert(key, InternalEntry::remote(holder, version), |existing, entry| {
            existing.version < entry.version
        })
    }

    /// Drop the local copy of `key` if `version` supersedes it.
    ///
    /// A regular invalidation removes strictly older copies; a removal
    /// invalidation also removes the copy carrying `version` itself.
    pub fn invalidate(&self, key: &[u8], version: EntryVersion, removal: bool) -> bool {
        self.remove_where(key, |entry| {
            if removal {
                entry.version <= version
            } else {
                entry.version < version
            }
        })
        .is_some()
    }

    /// Remove an entry unconditionally.
    pub fn remove(&self, key: &[u8]) -> Option<InternalEntry> {
        self.remove_where(key, |_| true)
    }

    /// Number of entries, including tombstones and pointers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the container is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Segment of a key.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        self.partitioner.segment_of(key)
    }

    /// Snapshot of the entries in the given segments.
    pub fn entries_in_segments(&self, segments: &BTreeSet<SegmentId>) -> Vec<(Key, InternalEntry)> {
        self.segment_keys(segments)
            .into_iter()
            .filter_map(|key| {
                let entry = self.get(&key)?;
                Some((key, entry))
            })
            .collect()
    }

    /// Up to `limit` locally held keys of `segments` ordered after `after`.
    ///
    /// Tombstones are listed, remote pointers are not. The flag is `true`
    /// when the listing is complete.
    pub fn keys_in_segments(
        &self,
        segments: &BTreeSet<SegmentId>,
        after: Option<&[u8]>,
        limit: usize,
    ) -> (Vec<(Key, EntryVersion)>, bool) {
        let limit = limit.max(1);
        // one key past the limit tells whether the listing goes on
        let mut keys: Vec<(Key, EntryVersion)> = segments
            .iter()
            .flat_map(|&segment| self.listed_in_segment(segment, after, limit + 1))
            .collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));

        let last = keys.len() <= limit;
        keys.truncate(limit);
        (keys, last)
    }

    /// Remote pointers in `segments`.
    pub fn remote_pointers(&self, segments: &BTreeSet<SegmentId>) -> Vec<(Key, NodeId, EntryVersion)> {
        self.segment_keys(segments)
            .into_iter()
            .filter_map(|key| {
                let entry = self.entries.get(&key)?;
                let holder = entry.remote?;
                let version = entry.version;
                drop(entry);
                Some((key, holder, version))
            })
            .collect()
    }

    /// Remove a remote pointer if it still points at `version`.
    pub fn drop_pointer(&self, key: &[u8], version: EntryVersion) -> bool {
        self.remove_where(key, |e| e.is_remote() && e.version == version)
            .is_some()
    }

    /// Insert `entry`, or replace the existing one when `replace` allows it.
    fn upsert<F>(&self, key: Key, entry: InternalEntry, replace: F) -> bool
    where
        F: FnOnce(&InternalEntry, &InternalEntry) -> bool,
    {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !replace(occupied.get(), &entry) {
                    return false;
                }
                occupied.insert(entry);
                true
            }
            Entry::Vacant(vacant) => {
                if let Some(keys) = self.index.get(self.segment_of(vacant.key()) as usize) {
                    keys.write().insert(vacant.key().clone());
                }
                vacant.insert(entry);
                true
            }
        }
    }

    fn remove_where<F>(&self, key: &[u8], remove: F) -> Option<InternalEntry>
    where
        F: FnOnce(&InternalEntry) -> bool,
    {
        self.entries
            .remove_if(key, |key, entry| {
                let removed = remove(entry);
                if removed {
                    if let Some(keys) = self.index.get(self.segment_of(key) as usize) {
                        keys.write().remove(key);
                    }
                }
                removed
            })
            .map(|(_, entry)| entry)
    }

    /// Indexed keys of `segments`.
    fn segment_keys(&self, segments: &BTreeSet<SegmentId>) -> Vec<Key> {
        segments
            .iter()
            .filter_map(|&s| self.index.get(s as usize))
            .flat_map(|keys| keys.read().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Up to `wanted` locally held keys of one segment after `after`.
    ///
    /// Keys are copied out of the index in small batches; entries are only
    /// looked up once the index lock is released.
    fn listed_in_segment(
        &self,
        segment: SegmentId,
        after: Option<&[u8]>,
        wanted: usize,
    ) -> Vec<(Key, EntryVersion)> {
        let Some(index) = self.index.get(segment as usize) else {
            return Vec::new();
        };
        let mut listed = Vec::with_capacity(wanted);
        let mut cursor: Option<Key> = after.map(Bytes::copy_from_slice);
        loop {
            let batch: Vec<Key> = {
                let keys = index.read();
                let lower = match &cursor {
                    Some(c) => Bound::Excluded(c.as_ref()),
                    None => Bound::Unbounded,
                };
                keys.range::<[u8], _>((lower, Bound::Unbounded))
                    .take(wanted)
                    .cloned()
                    .collect()
            };
            let exhausted = batch.len() < wanted;
            cursor = batch.last().cloned();

            for key in batch {
                if let Some(version) = self.local_version(&key) {
                    listed.push((key, version));
                    if listed.len() == wanted {
                        return listed;
                    }
                }
            }
            if exhausted {
                return listed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> DataContainer {
        DataContainer::new(KeyPartitioner::new(8))
    }

    fn key(k: &'static str) -> Key {
        Bytes::from_static(k.as_bytes())
    }

    #[test]
    fn test_apply_keeps_newer() {
        let c = container();
        let v2 = EntryVersion::new(1, 2);
        let v1 = EntryVersion::new(1, 1);

        assert!(c.apply(key("k"), InternalEntry::value(key("new"), v2)));
        assert!(!c.apply(key("k"), InternalEntry::value(key("old"), v1)));
        assert!(!c.apply(key("k"), InternalEntry::value(key("same"), v2)));
        assert_eq!(c.get_value(b"k"), Some(key("new")));
    }

    #[test]
    fn test_value_replaces_pointer_of_same_version() {
        let c = container();
        let v = EntryVersion::new(2, 5);
        assert!(c.merge_remote(key("k"), v, 3));
        assert!(c.get(b"k").unwrap().is_remote());

        assert!(c.apply(key("k"), InternalEntry::value(key("v"), v)));
        let entry = c.get(b"k").unwrap();
        assert!(!entry.is_remote());
        assert_eq!(entry.value, Some(key("v")));
    }

    #[test]
    fn test_merge_remote_only_if_newer() {
        let c = container();
        c.put_local(key("k"), InternalEntry::value(key("v"), EntryVersion::new(1, 3)));

        assert!(!c.merge_remote(key("k"), EntryVersion::new(1, 3), 2));
        assert!(!c.merge_remote(key("k"), EntryVersion::new(1, 2), 2));
        assert!(c.merge_remote(key("k"), EntryVersion::new(2, 1), 2));
        assert_eq!(c.get(b"k").unwrap().remote, Some(2));
    }

    #[test]
    fn test_invalidate_semantics() {
        let c = container();
        let v = EntryVersion::new(1, 4);
        c.put_local(key("k"), InternalEntry::value(key("v"), v));

        // older or equal regular invalidations keep the copy
        assert!(!c.invalidate(b"k", EntryVersion::new(1, 3), false));
        assert!(!c.invalidate(b"k", v, false));
        // a removal at the same version drops it
        assert!(c.invalidate(b"k", v, true));
        assert!(c.get(b"k").is_none());

        c.put_local(key("k"), InternalEntry::value(key("v"), v));
        assert!(c.invalidate(b"k", EntryVersion::new(2, 1), false));
        assert!(c.is_empty());
    }

    #[test]
    fn test_entries_in_segments() {
        let c = container();
        for i in 0..50 {
            let k = Bytes::from(format!("key-{}", i));
            c.put_local(k, InternalEntry::value(key("v"), EntryVersion::new(1, i)));
        }
        let segment = c.segment_of(b"key-7");
        let entries = c.entries_in_segments(&BTreeSet::from([segment]));
        assert!(entries.iter().any(|(k, _)| k.as_ref() == b"key-7"));
        assert!(entries.iter().all(|(k, _)| c.segment_of(k) == segment));
    }

    #[test]
    fn test_keys_in_segments_pages_in_order() {
        let c = DataContainer::new(KeyPartitioner::new(1));
        let all = BTreeSet::from([0]);
        for k in ["d", "a", "c", "b"] {
            c.put_local(
                Bytes::from_static(k.as_bytes()),
                InternalEntry::value(key("v"), EntryVersion::new(1, 1)),
            );
        }
        c.put_local(key("e"), InternalEntry::tombstone(EntryVersion::new(1, 2)));
        c.merge_remote(key("f"), EntryVersion::new(1, 3), 9);

        let (page, last) = c.keys_in_segments(&all, None, 2);
        assert_eq!(
            page.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![key("a"), key("b")]
        );
        assert!(!last);

        let (page, last) = c.keys_in_segments(&all, Some(b"b"), 3);
        assert_eq!(
            page.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![key("c"), key("d"), key("e")]
        );
        assert!(last);
        assert_eq!(c.remote_pointers(&all), vec![(key("f"), 9, EntryVersion::new(1, 3))]);

        assert!(!c.drop_pointer(b"f", EntryVersion::new(1, 2)));
        assert!(c.drop_pointer(b"f", EntryVersion::new(1, 3)));
    }

    #[test]
    fn test_keys_in_segments_merges_segments_and_skips_pointers() {
        let c = container();
        for i in 0..200 {
            let k = Bytes::from(format!("key-{:03}", i));
            if i % 3 == 0 {
                c.merge_remote(k, EntryVersion::new(1, i), 2);
            } else {
                c.put_local(k, InternalEntry::value(key("v"), EntryVersion::new(1, i)));
            }
        }
        c.remove(b"key-001");
        c.invalidate(b"key-002", EntryVersion::new(2, 0), false);

        let segments: BTreeSet<SegmentId> = (0..4).collect();
        let expected: Vec<Key> = (3..200)
            .filter(|i| i % 3 != 0)
            .map(|i| Bytes::from(format!("key-{:03}", i)))
            .filter(|k| segments.contains(&c.segment_of(k)))
            .collect();

        let mut listed = Vec::new();
        let mut after: Option<Key> = None;
        loop {
            let (page, last) = c.keys_in_segments(&segments, after.as_deref(), 7);
            assert!(page.len() <= 7);
            listed.extend(page.iter().map(|(k, _)| k.clone()));
            after = page.last().map(|(k, _)| k.clone());
            if last {
                break;
            }
        }
        assert_eq!(listed, expected);

        let pointers = c.remote_pointers(&segments);
        assert!(pointers.iter().all(|(k, holder, _)| *holder == 2 && segments.contains(&c.segment_of(k))));
        assert!(!pointers.iter().any(|(k, _, _)| k.as_ref() == b"key-001"));
    }
}
