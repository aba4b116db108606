//! Serving side of state transfer and hand-off of lost segments.

use super::backup::BackupReplicator;
use crate::bias::BiasManager;
use crate::cache::container::DataContainer;
use crate::config::StateTransferConfig;
use crate::network::{KeyEntry, Response, TransferEntry};
use crate::partitioning::TopologyChange;
use crate::types::{InternalEntry, Key, NodeId, SegmentId, TopologyId};
use crate::versioning::VersionManager;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Answers key and value requests of new owners and backs up the
/// segments this node loses.
#[derive(Debug)]
pub struct StateProvider {
    local_node: NodeId,
    config: StateTransferConfig,
    container: Arc<DataContainer>,
    versions: Arc<VersionManager>,
    bias: Arc<BiasManager>,
    replicator: Arc<BackupReplicator>,
    /// Cancels the hand-off of the previous topology.
    outbound: Mutex<CancellationToken>,
    tasks: TaskTracker,
}

impl StateProvider {
    /// Create a provider.
    pub fn new(
        local_node: NodeId,
        config: StateTransferConfig,
        container: Arc<DataContainer>,
        versions: Arc<VersionManager>,
        bias: Arc<BiasManager>,
        replicator: Arc<BackupReplicator>,
    ) -> Self {
        Self {
            local_node,
            config,
            container,
            versions,
            bias,
            replicator,
            outbound: Mutex::new(CancellationToken::new()),
            tasks: TaskTracker::new(),
        }
    }

    /// One page of the keys held for `segments`.
    pub fn handle_request_keys(
        &self,
        segments: &[SegmentId],
        after: Option<&[u8]>,
        chunk_size: u32,
    ) -> Response {
        let segments: BTreeSet<SegmentId> = segments.iter().copied().collect();
        let (keys, last) = self
            .container
            .keys_in_segments(&segments, after, chunk_size as usize);
        Response::Keys {
            entries: keys
                .into_iter()
                .map(|(key, version)| KeyEntry { key, version })
                .collect(),
            last,
        }
    }

    /// Values of `keys`, `None` where this node holds no data.
    pub fn handle_request_values(&self, keys: &[Key]) -> Response {
        let values = keys
            .iter()
            .map(|key| {
                self.container
                    .get(key)
                    .filter(|entry| !entry.is_remote())
                    .map(|entry| TransferEntry {
                        key: key.clone(),
                        value: entry.value,
                        version: entry.version,
                    })
            })
            .collect();
        Response::Values(values)
    }

    /// Store backup copies unless newer data is already here.
    pub fn handle_backup_put(&self, entries: Vec<TransferEntry>) -> Response {
        for entry in entries {
            let internal = match entry.value {
                Some(value) => InternalEntry::value(value, entry.version),
                None => InternalEntry::tombstone(entry.version),
            };
            self.container.apply(entry.key, internal);
        }
        Response::Ack
    }

    /// Confirm that `topology_id` is installed here and that no local
    /// bias of `segments` survives.
    pub async fn handle_confirm_revoked(
        &self,
        topology_id: TopologyId,
        segments: &[SegmentId],
    ) -> Response {
        let installed = tokio::time::timeout(
            self.config.timeout,
            self.versions.await_topology(topology_id),
        )
        .await;
        match installed {
            Ok(Ok(())) => {
                let segments: BTreeSet<SegmentId> = segments.iter().copied().collect();
                self.bias.revoke_local_bias_for_segments(&segments);
                Response::Ack
            }
            Ok(Err(e)) => Response::Error(e.to_string()),
            Err(_) => {
                warn!(
                    node_id = self.local_node,
                    topology_id, "Timed out waiting for topology install"
                );
                Response::Error(format!(
                    "topology {} not installed within {:?}",
                    topology_id, self.config.timeout
                ))
            }
        }
    }

    /// Hand off the segments this node lost: back them up on the next
    /// member, then invalidate them everywhere but at their new owner.
    pub fn on_topology_change(&self, change: &TopologyChange) {
        let cancellation = {
            let mut outbound = self.outbound.lock();
            outbound.cancel();
            *outbound = CancellationToken::new();
            outbound.clone()
        };

        if change.previous.is_none() || !change.is_rebalance || change.removed_segments.is_empty() {
            return;
        }

        let topology = change.current.clone();
        let mut by_new_owner: BTreeMap<NodeId, Vec<TransferEntry>> = BTreeMap::new();
        for (key, entry) in self.container.entries_in_segments(&change.removed_segments) {
            if entry.is_remote() {
                continue;
            }
            let Some(owner) = topology.owner_of(self.container.segment_of(&key)) else {
                continue;
            };
            by_new_owner.entry(owner).or_default().push(TransferEntry {
                key,
                value: entry.value,
                version: entry.version,
            });
        }
        if by_new_owner.is_empty() {
            return;
        }

        let backup = topology.next_member(self.local_node);
        let replicator = self.replicator.clone();
        let local_node = self.local_node;
        info!(
            node_id = local_node,
            topology_id = topology.topology_id,
            ?backup,
            segments = ?change.removed_segments,
            "Handing off removed segments"
        );

        self.tasks.spawn(async move {
            for (owner, entries) in by_new_owner {
                let targets: Vec<NodeId> = topology
                    .members
                    .iter()
                    .copied()
                    .filter(|n| *n != owner)
                    .collect();
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        debug!(node_id = local_node, "Hand-off superseded by a newer topology");
                        return;
                    }
                    _ = replicator.backup_then_invalidate(topology.topology_id, backup, entries, &targets) => {}
                }
            }
        });
    }

    /// Wait for running hand-offs.
    pub async fn quiesce(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Abort running hand-offs.
    pub fn stop(&self) {
        self.outbound.lock().cancel();
        self.tasks.close();
    }
}
