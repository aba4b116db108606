//! Topology epochs and the per-node deltas derived from them.
//!
//! Topologies are produced by the membership orchestrator; this module only
//! describes them and computes which segments a node gains or loses.

use crate::types::{NodeId, SegmentId, TopologyId};
use std::collections::BTreeSet;
use std::sync::Arc;

/// An ownership assignment for one topology epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Monotonically increasing id.
    pub topology_id: TopologyId,

    /// Actual members, in ring order.
    pub members: Vec<NodeId>,

    /// Owner of each segment, indexed by segment id.
    pub segment_owners: Vec<NodeId>,
}

impl Topology {
    /// Create a topology from an explicit owner table.
    pub fn new(topology_id: TopologyId, members: Vec<NodeId>, segment_owners: Vec<NodeId>) -> Self {
        Self {
            topology_id,
            members,
            segment_owners,
        }
    }

    /// Assign segments to members round-robin.
    pub fn round_robin(topology_id: TopologyId, members: Vec<NodeId>, num_segments: u32) -> Self {
        let segment_owners = if members.is_empty() {
            Vec::new()
        } else {
            (0..num_segments as usize)
                .map(|s| members[s % members.len()])
                .collect()
        };
        Self::new(topology_id, members, segment_owners)
    }

    /// Derive the next topology with some segments reassigned.
    pub fn reassign(
        &self,
        topology_id: TopologyId,
        members: Vec<NodeId>,
        moves: &[(SegmentId, NodeId)],
    ) -> Self {
        let mut segment_owners = self.segment_owners.clone();
        for &(segment, owner) in moves {
            if let Some(slot) = segment_owners.get_mut(segment as usize) {
                *slot = owner;
            }
        }
        Self::new(topology_id, members, segment_owners)
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.segment_owners.len() as u32
    }

    /// Owner of a segment.
    pub fn owner_of(&self, segment: SegmentId) -> Option<NodeId> {
        self.segment_owners.get(segment as usize).copied()
    }

    /// Whether `node` owns `segment`.
    pub fn is_owner(&self, node: NodeId, segment: SegmentId) -> bool {
        self.owner_of(segment) == Some(node)
    }

    /// Whether `node` is an actual member.
    pub fn is_member(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    /// Segments owned by `node`.
    pub fn owned_segments(&self, node: NodeId) -> BTreeSet<SegmentId> {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == node)
            .map(|(segment, _)| segment as SegmentId)
            .collect()
    }

    /// The member following `node` in ring order, the sole backup target.
    ///
    /// Returns `None` when `node` is alone or not a member (still joining).
    pub fn next_member(&self, node: NodeId) -> Option<NodeId> {
        if self.members.len() <= 1 {
            return None;
        }
        let position = self.members.iter().position(|m| *m == node)?;
        Some(self.members[(position + 1) % self.members.len()])
    }

    /// Members other than `node`.
    pub fn other_members(&self, node: NodeId) -> Vec<NodeId> {
        self.members.iter().copied().filter(|m| *m != node).collect()
    }
}

/// A topology update as seen by one node.
#[derive(Debug, Clone)]
pub struct TopologyChange {
    /// Topology installed before this one, if any.
    pub previous: Option<Arc<Topology>>,

    /// Topology being installed.
    pub current: Arc<Topology>,

    /// Segments the local node gains.
    pub added_segments: BTreeSet<SegmentId>,

    /// Segments the local node loses.
    pub removed_segments: BTreeSet<SegmentId>,

    /// Whether this update starts a rebalance (state must move).
    pub is_rebalance: bool,
}

impl TopologyChange {
    /// Compute the deltas of `current` against `previous` for `node`.
    pub fn for_node(
        previous: Option<Arc<Topology>>,
        current: Arc<Topology>,
        node: NodeId,
        is_rebalance: bool,
    ) -> Self {
        let now_owned = current.owned_segments(node);
        let was_owned = previous
            .as_ref()
            .map(|p| p.owned_segments(node))
            .unwrap_or_default();

        Self {
            added_segments: now_owned.difference(&was_owned).copied().collect(),
            removed_segments: was_owned.difference(&now_owned).copied().collect(),
            previous,
            current,
            is_rebalance,
        }
    }

    /// Id of the topology being installed.
    pub fn topology_id(&self) -> TopologyId {
        self.current.topology_id
    }

    /// Whether `node` was missing from the previous topology.
    ///
    /// A node that was excluded and is back again may have missed
    /// revocations while it was away.
    pub fn was_excluded(&self, node: NodeId) -> bool {
        self.previous
            .as_ref()
            .map(|p| !p.is_member(node))
            .unwrap_or(false)
    }

    /// Segments whose owner differs between the two topologies.
    pub fn segments_with_new_owner(&self) -> BTreeSet<SegmentId> {
        let Some(previous) = &self.previous else {
            return BTreeSet::new();
        };
        (0..self.current.num_segments())
            .filter(|s| previous.owner_of(*s) != self.current.owner_of(*s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let topology = Topology::round_robin(1, vec![1, 2, 3], 6);
        assert_eq!(topology.segment_owners, vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(topology.owned_segments(2), BTreeSet::from([1, 4]));
        assert!(topology.is_owner(3, 5));
    }

    #[test]
    fn test_next_member_wraps() {
        let topology = Topology::round_robin(1, vec![1, 2, 3], 4);
        assert_eq!(topology.next_member(1), Some(2));
        assert_eq!(topology.next_member(3), Some(1));
        assert_eq!(topology.next_member(9), None);

        let single = Topology::round_robin(1, vec![1], 4);
        assert_eq!(single.next_member(1), None);
    }

    #[test]
    fn test_change_deltas() {
        let first = Arc::new(Topology::round_robin(1, vec![1], 4));
        let second = Arc::new(first.reassign(2, vec![1, 2], &[(1, 2), (3, 2)]));

        let on_1 = TopologyChange::for_node(Some(first.clone()), second.clone(), 1, true);
        assert!(on_1.added_segments.is_empty());
        assert_eq!(on_1.removed_segments, BTreeSet::from([1, 3]));

        let on_2 = TopologyChange::for_node(Some(first), second, 2, true);
        assert_eq!(on_2.added_segments, BTreeSet::from([1, 3]));
        assert!(on_2.removed_segments.is_empty());
        assert!(on_2.was_excluded(2));
        assert!(!on_2.was_excluded(1));
        assert_eq!(on_2.segments_with_new_owner(), BTreeSet::from([1, 3]));
    }

    #[test]
    fn test_first_topology() {
        let first = Arc::new(Topology::round_robin(1, vec![1, 2], 4));
        let change = TopologyChange::for_node(None, first, 2, false);
        assert_eq!(change.added_segments, BTreeSet::from([1, 3]));
        assert!(!change.was_excluded(2));
        assert!(change.segments_with_new_owner().is_empty());
    }
}
