//! Fault injection for the in-memory network.
//!
//! Faults are keyed by target node and command kind so a test can break one
//! step of a protocol (say, the key pull from node 1) without touching the
//! rest of the traffic.

use crate::network::CommandKind;
use crate::types::NodeId;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A network partition between two groups of nodes.
#[derive(Debug, Clone)]
pub struct NetworkPartition {
    /// Nodes on one side.
    pub side_a: HashSet<NodeId>,

    /// Nodes on the other side.
    pub side_b: HashSet<NodeId>,
}

impl NetworkPartition {
    /// Check if this partition separates the two nodes.
    pub fn separates(&self, from: NodeId, to: NodeId) -> bool {
        (self.side_a.contains(&from) && self.side_b.contains(&to))
            || (self.side_b.contains(&from) && self.side_a.contains(&to))
    }
}

/// What the network should do with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    /// Deliver it.
    Deliver,
    /// Fail the call without delivering.
    Fail,
    /// The nodes cannot reach each other.
    Partitioned,
}

/// Injects failures and delays into command delivery.
#[derive(Debug, Default)]
pub struct FaultInjector {
    /// Remaining forced failures per (target, kind).
    fail_next: RwLock<HashMap<(NodeId, CommandKind), u32>>,

    /// Probability of failing any delivery of a kind.
    fail_probability: RwLock<HashMap<CommandKind, f64>>,

    /// Extra latency per kind.
    latency: RwLock<HashMap<CommandKind, Duration>>,

    /// Active partitions.
    partitions: RwLock<Vec<NetworkPartition>>,

    /// Statistics: failures injected.
    failures_injected: AtomicU64,
}

impl FaultInjector {
    /// Create an injector without faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` commands of `kind` sent to `target`.
    pub fn fail_next(&self, target: NodeId, kind: CommandKind, count: u32) {
        *self.fail_next.write().entry((target, kind)).or_insert(0) += count;
    }

    /// Fail commands of `kind` with the given probability.
    pub fn fail_randomly(&self, kind: CommandKind, probability: f64) {
        self.fail_probability.write().insert(kind, probability);
    }

    /// Delay every command of `kind`.
    pub fn set_latency(&self, kind: CommandKind, latency: Duration) {
        self.latency.write().insert(kind, latency);
    }

    /// Create a partition between two groups.
    pub fn create_partition(&self, side_a: HashSet<NodeId>, side_b: HashSet<NodeId>) {
        self.partitions
            .write()
            .push(NetworkPartition { side_a, side_b });
    }

    /// Check if communication is blocked by a partition.
    pub fn is_partitioned(&self, from: NodeId, to: NodeId) -> bool {
        self.partitions.read().iter().any(|p| p.separates(from, to))
    }

    /// Heal all partitions immediately.
    pub fn heal_all_partitions(&self) {
        self.partitions.write().clear();
    }

    /// Remove every fault.
    pub fn reset(&self) {
        self.fail_next.write().clear();
        self.fail_probability.write().clear();
        self.latency.write().clear();
        self.heal_all_partitions();
    }

    /// Latency configured for `kind`.
    pub fn latency_for(&self, kind: CommandKind) -> Option<Duration> {
        self.latency.read().get(&kind).copied()
    }

    /// Number of failures injected so far.
    pub fn failures_injected(&self) -> u64 {
        self.failures_injected.load(Ordering::Relaxed)
    }

    /// Decide the fate of one command.
    pub fn decide(&self, from: NodeId, to: NodeId, kind: CommandKind) -> FaultDecision {
        if self.is_partitioned(from, to) {
            return FaultDecision::Partitioned;
        }

        {
            let mut fail_next = self.fail_next.write();
            if let Some(remaining) = fail_next.get_mut(&(to, kind)) {
                if *remaining > 0 {
                    *remaining -= 1;
                    self.failures_injected.fetch_add(1, Ordering::Relaxed);
                    return FaultDecision::Fail;
                }
            }
        }

        if let Some(&probability) = self.fail_probability.read().get(&kind) {
            if rand::rng().random::<f64>() < probability {
                self.failures_injected.fetch_add(1, Ordering::Relaxed);
                return FaultDecision::Fail;
            }
        }

        FaultDecision::Deliver
    }
}
