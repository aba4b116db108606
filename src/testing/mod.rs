//! Testing utilities for the scattered core.
//!
//! Nodes of a [`TestCluster`] talk over an [`InMemoryNetwork`], which
//! records every command and lets tests break single protocol steps through
//! its [`FaultInjector`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TestCluster                          │
//! │   ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │   │ScatteredNode │  │ScatteredNode │  │ScatteredNode │ ...  │
//! │   └──────┬───────┘  └──────┬───────┘  └──────┬───────┘      │
//! │          └─────────────────┼─────────────────┘              │
//! │                            ▼                                │
//! │   ┌─────────────────────────────────────────────────────┐   │
//! │   │ InMemoryNetwork: call log, FaultInjector            │   │
//! │   └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let mut cluster = TestCluster::start(&[1, 2], config).unwrap();
//! cluster.put(2, key.clone(), value).await.unwrap();
//!
//! cluster.add_node(3).unwrap();
//! let next = cluster.topology().reassign(2, vec![1, 2, 3], &[(0, 3)]);
//! cluster.install(next, true).unwrap();
//! cluster.quiesce().await;
//! ```

pub mod faults;
pub mod network;

mod scattered_e2e_tests;

pub use faults::{FaultDecision, FaultInjector, NetworkPartition};
pub use network::{CallRecord, InMemoryNetwork};

use crate::cache::{ScatteredNode, WriteOutcome};
use crate::config::ScatteredConfig;
use crate::error::Result;
use crate::network::CommandHandler;
use crate::partitioning::{KeyPartitioner, Topology, TopologyChange};
use crate::types::{Key, NodeId, SegmentId};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Uses the tokio clock, so it also works with a paused runtime.
pub async fn wait_for<F>(mut condition: F, timeout: Duration, interval: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Scattered nodes wired over one in-memory network.
#[derive(Debug)]
pub struct TestCluster {
    /// The network shared by all nodes.
    pub network: Arc<InMemoryNetwork>,

    nodes: BTreeMap<NodeId, Arc<ScatteredNode>>,
    topology: Option<Arc<Topology>>,
    template: ScatteredConfig,
}

impl TestCluster {
    /// Create nodes without installing any topology.
    pub fn new(members: &[NodeId], template: ScatteredConfig) -> Result<Self> {
        let mut cluster = Self {
            network: InMemoryNetwork::new(),
            nodes: BTreeMap::new(),
            topology: None,
            template,
        };
        for &node in members {
            cluster.add_node(node)?;
        }
        Ok(cluster)
    }

    /// Create nodes and install a round-robin first topology.
    pub fn start(members: &[NodeId], template: ScatteredConfig) -> Result<Self> {
        let num_segments = template.num_segments;
        let mut cluster = Self::new(members, template)?;
        cluster.install(
            Topology::round_robin(1, members.to_vec(), num_segments),
            false,
        )?;
        Ok(cluster)
    }

    /// Create and register a node; it takes part from the next install.
    pub fn add_node(&mut self, node_id: NodeId) -> Result<Arc<ScatteredNode>> {
        let mut config = self.template.clone();
        config.node_id = node_id;
        let node = ScatteredNode::new(config, self.network.transport(node_id))?;
        let handler: Arc<dyn CommandHandler> = node.clone();
        self.network.register(node_id, Arc::downgrade(&handler));
        node.start();
        self.nodes.insert(node_id, node.clone());
        Ok(node)
    }

    /// Stop a node and disconnect it; calls to it fail with `NodeLeft`.
    pub fn remove_node(&mut self, node_id: NodeId) {
        if let Some(node) = self.nodes.remove(&node_id) {
            node.stop();
        }
        self.network.remove(node_id);
    }

    /// A node of the cluster.
    ///
    /// Panics when the node is unknown.
    pub fn node(&self, node_id: NodeId) -> &Arc<ScatteredNode> {
        &self.nodes[&node_id]
    }

    /// IDs of the nodes.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Latest installed topology.
    ///
    /// Panics before the first install.
    pub fn topology(&self) -> Arc<Topology> {
        self.topology
            .clone()
            .unwrap_or_else(|| panic!("no topology installed"))
    }

    /// Install `topology` on every node that is a member of it.
    ///
    /// Every node sees the change against the previous cluster topology, so
    /// a joiner knows it was excluded before.
    pub fn install(&mut self, topology: Topology, is_rebalance: bool) -> Result<()> {
        let topology = Arc::new(topology);
        info!(
            topology_id = topology.topology_id,
            members = ?topology.members,
            is_rebalance,
            "Installing cluster topology"
        );
        for (&node_id, node) in &self.nodes {
            if !topology.is_member(node_id) {
                continue;
            }
            let change = TopologyChange::for_node(
                self.topology.clone(),
                topology.clone(),
                node_id,
                is_rebalance,
            );
            node.on_topology_change(&change)?;
        }
        self.topology = Some(topology);
        Ok(())
    }

    /// Segment of `key`.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        self.template_partitioner().segment_of(key)
    }

    /// A key named after `prefix` that falls into `segment`.
    pub fn key_in_segment(&self, segment: SegmentId, prefix: &str) -> Key {
        let partitioner = self.template_partitioner();
        (0u64..)
            .map(|i| Bytes::from(format!("{}-{}", prefix, i)))
            .find(|k| partitioner.segment_of(k) == segment)
            .unwrap_or_default()
    }

    /// Owner of `key` in the latest topology.
    pub fn owner_of(&self, key: &[u8]) -> NodeId {
        self.topology()
            .owner_of(self.segment_of(key))
            .unwrap_or_else(|| panic!("segment without owner"))
    }

    /// Write `value` from `origin` through the key's owner.
    pub async fn put(&self, origin: NodeId, key: Key, value: Bytes) -> Result<WriteOutcome> {
        self.update(origin, key, Some(value)).await
    }

    /// Remove `key` from `origin` through the key's owner.
    pub async fn delete(&self, origin: NodeId, key: Key) -> Result<WriteOutcome> {
        self.update(origin, key, None).await
    }

    async fn update(&self, origin: NodeId, key: Key, value: Option<Bytes>) -> Result<WriteOutcome> {
        let owner = self.node(self.owner_of(&key));
        let origin_node = self.node(origin);
        let topology_id = origin_node.versions().topology_id();
        if origin == owner.node_id() {
            return owner.update(origin, topology_id, key, value).await;
        }

        let pending = origin_node.begin_remote_write(key.clone());
        match owner.update(origin, topology_id, key, value.clone()).await {
            Ok(outcome) => {
                origin_node.cache_remote_write(pending, value, &outcome);
                Ok(outcome)
            }
            Err(e) => {
                origin_node.abandon_remote_write(pending);
                Err(e)
            }
        }
    }

    /// Wait for transfers, hand-offs and invalidation broadcasts to finish.
    pub async fn quiesce(&self) {
        let nodes: Vec<_> = self.nodes.values().cloned().collect();
        wait_for(
            || nodes.iter().all(|n| !n.is_transferring()),
            Duration::from_secs(10),
            Duration::from_millis(5),
        )
        .await;
        for node in &nodes {
            node.quiesce().await;
        }
    }

    /// Stop every node.
    pub fn stop(&self) {
        for node in self.nodes.values() {
            node.stop();
        }
    }

    fn template_partitioner(&self) -> KeyPartitioner {
        KeyPartitioner::new(self.template.num_segments)
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.stop();
    }
}
