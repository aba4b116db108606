//! Key to segment mapping.

use crate::types::SegmentId;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Maps keys onto a fixed number of segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPartitioner {
    num_segments: u32,
}

impl KeyPartitioner {
    /// Create a partitioner for `num_segments` segments.
    pub fn new(num_segments: u32) -> Self {
        Self {
            num_segments: num_segments.max(1),
        }
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    /// Segment of a key.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        (Self::hash_key(key) % self.num_segments as u64) as SegmentId
    }

    /// Compute the hash of a key.
    fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        key.hash(&mut hasher);
        hasher.finish()
    }
}
