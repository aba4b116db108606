//! Core types used throughout the scattered core.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Segment of the key hash space, in `[0, num_segments)`.
pub type SegmentId = u32;

/// Monotonically increasing id of a membership and ownership assignment.
pub type TopologyId = u32;

/// Cache key.
pub type Key = Bytes;

/// Version of an entry, ordered by topology first and counter second.
///
/// The derived ordering is lexicographic over the fields in declaration order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntryVersion {
    /// Topology in which the version was issued.
    pub topology_id: TopologyId,
    /// Per-segment counter, reset when the segment is registered.
    pub counter: u64,
}

impl EntryVersion {
    /// Create a new version.
    pub const fn new(topology_id: TopologyId, counter: u64) -> Self {
        Self {
            topology_id,
            counter,
        }
    }
}

impl fmt::Display for EntryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topology_id, self.counter)
    }
}

/// A locally stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalEntry {
    /// The value; `None` together with `remote == None` is a tombstone.
    pub value: Option<Bytes>,
    /// Version of the value.
    pub version: EntryVersion,
    /// Node that holds the value when only the key was transferred here.
    pub remote: Option<NodeId>,
}

impl InternalEntry {
    /// A locally held value.
    pub fn value(value: Bytes, version: EntryVersion) -> Self {
        Self {
            value: Some(value),
            version,
            remote: None,
        }
    }

    /// A removed entry kept until the cluster observed the removal.
    pub fn tombstone(version: EntryVersion) -> Self {
        Self {
            value: None,
            version,
            remote: None,
        }
    }

    /// A key whose value still lives on `holder`.
    pub fn remote(holder: NodeId, version: EntryVersion) -> Self {
        Self {
            value: None,
            version,
            remote: Some(holder),
        }
    }

    /// Whether the value is still on another node.
    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Whether this entry records a removal.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none() && self.remote.is_none()
    }
}

/// Pending cluster-wide notification that older copies of a key are stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRecord {
    /// The key.
    pub key: Key,
    /// Version that supersedes every older copy.
    pub version: EntryVersion,
    /// Whether the write was a removal.
    pub removal: bool,
}

impl InvalidationRecord {
    /// Merge another record for the same key, keeping the greater version.
    ///
    /// On equal versions the removal wins.
    pub fn merge(self, other: InvalidationRecord) -> InvalidationRecord {
        if other.version > self.version || (other.version == self.version && other.removal) {
            other
        } else {
            self
        }
    }
}
