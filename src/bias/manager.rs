//! Bias manager: local leases, owner bookkeeping and the periodic sweep.

use super::local::{LocalBiasTable, PendingBias};
use super::remote::{BiasRevocation, RemoteBias, RemoteBiasTable};
use crate::config::{BiasAcquisition, BiasConfig};
use crate::metrics::ScatteredMetrics;
use crate::network::{Command, Response, Transport};
use crate::partitioning::{KeyPartitioner, Topology, TopologyChange};
use crate::types::{Key, NodeId, SegmentId, TopologyId};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Grants, checks, renews and revokes read biases.
#[derive(Debug)]
pub struct BiasManager {
    local_node: NodeId,
    config: BiasConfig,
    partitioner: KeyPartitioner,
    topology_id: AtomicU32,
    topology: RwLock<Option<Arc<Topology>>>,
    local: LocalBiasTable,
    remote: Arc<RemoteBiasTable>,
    transport: Arc<dyn Transport>,
    metrics: Arc<ScatteredMetrics>,
    cancellation: CancellationToken,
}

impl BiasManager {
    /// Create a bias manager.
    pub fn new(
        config: BiasConfig,
        partitioner: KeyPartitioner,
        transport: Arc<dyn Transport>,
        metrics: Arc<ScatteredMetrics>,
    ) -> Self {
        let remote = Arc::new(RemoteBiasTable::new(
            transport.clone(),
            metrics.clone(),
            config.remote_timeout,
        ));
        Self {
            local_node: transport.local_node(),
            local: LocalBiasTable::new(config.lifespan),
            config,
            partitioner,
            topology_id: AtomicU32::new(0),
            topology: RwLock::new(None),
            remote,
            transport,
            metrics,
            cancellation: CancellationToken::new(),
        }
    }

    /// Acquisition policy.
    pub fn acquisition(&self) -> BiasAcquisition {
        self.config.acquisition
    }

    /// Announce a request to the owner that may grant a lease on `key`.
    ///
    /// Revocations of `key` that arrive before the request is completed
    /// void its lease.
    pub fn begin_local_bias(&self, key: Key) -> PendingBias {
        self.local.begin(key)
    }

    /// Complete a request started with
    /// [`begin_local_bias`](Self::begin_local_bias).
    ///
    /// `granted` is the topology the owner granted the lease in, if it did.
    /// Leases from an older topology are ignored.
    pub fn complete_local_bias(&self, pending: PendingBias, granted: Option<TopologyId>) -> bool {
        let current = self.topology_id.load(Ordering::Acquire);
        let granted = match granted {
            Some(topology_id) if topology_id < current => {
                trace!(topology_id, current, "Ignoring bias from an older topology");
                false
            }
            Some(_) => true,
            None => false,
        };
        self.local.finish(pending, granted)
    }

    #[cfg(test)]
    pub(crate) fn add_local_bias(&self, key: Key, topology_id: TopologyId) -> bool {
        let pending = self.begin_local_bias(key);
        self.complete_local_bias(pending, Some(topology_id))
    }

    /// Whether this node may serve `key` from its local copy.
    pub fn has_local_bias(&self, key: &[u8]) -> bool {
        self.local.check(key)
    }

    /// Drop the lease of `key`.
    pub fn revoke_local_bias(&self, key: &[u8]) {
        self.local.remove(key);
    }

    /// Drop leases of keys in `segments`.
    pub fn revoke_local_bias_for_segments(&self, segments: &BTreeSet<SegmentId>) {
        if segments.is_empty() {
            return;
        }
        let partitioner = self.partitioner;
        let removed = self
            .local
            .remove_segments(segments, |k| partitioner.segment_of(k));
        if removed > 0 {
            debug!(removed, "Revoked local biases of re-owned segments");
        }
    }

    /// Number of local leases.
    pub fn local_bias_count(&self) -> usize {
        self.local.len()
    }

    /// Owner-side bias state of `key`.
    pub fn get_remote_bias(&self, key: &[u8]) -> Option<RemoteBias> {
        self.remote.get(key)
    }

    /// Make sure nobody but `new_node` is biased for `key`.
    ///
    /// See [`RemoteBiasTable::start_revoking`].
    pub fn start_revoking_remote_bias(
        &self,
        key: Key,
        new_node: Option<NodeId>,
    ) -> Option<BiasRevocation> {
        self.remote.start_revoking(key, new_node)
    }

    /// Grant a read bias to `reader` when the policy allows it.
    ///
    /// See [`RemoteBiasTable::try_grant`] for `still_current`.
    pub fn try_grant_remote_bias<F>(&self, key: Key, reader: NodeId, still_current: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        if self.config.acquisition != BiasAcquisition::OnRead {
            return false;
        }
        self.remote.try_grant(key, reader, still_current)
    }

    /// Owner side of `RenewBias`.
    ///
    /// Refreshes only biases `origin` already holds on keys this node still
    /// owns.
    pub fn handle_renew(&self, origin: NodeId, keys: &[Key]) -> Response {
        let topology = self.topology.read().clone();
        let mut renewed = 0;
        for key in keys {
            let owned = topology
                .as_ref()
                .map_or(false, |t| t.is_owner(self.local_node, self.partitioner.segment_of(key)));
            if owned && self.remote.refresh(key, origin) {
                renewed += 1;
            }
        }
        if renewed == keys.len() {
            Response::Ack
        } else {
            debug!(origin, renewed, requested = keys.len(), "Refused bias renewal");
            Response::Nack
        }
    }

    /// Biased side of `RevokeBias`.
    pub fn handle_revoke(&self, keys: &[Key]) -> Response {
        for key in keys {
            self.local.remove(key);
        }
        trace!(keys = keys.len(), "Biases revoked by owner");
        Response::Ack
    }

    /// React to a new topology.
    pub fn on_topology_change(&self, change: &TopologyChange) {
        let topology = change.current.clone();
        self.topology_id
            .fetch_max(topology.topology_id, Ordering::AcqRel);
        *self.topology.write() = Some(topology.clone());

        let local_node = self.local_node;
        let partitioner = self.partitioner;
        let dropped = self
            .remote
            .retain(|key| topology.is_owner(local_node, partitioner.segment_of(key)));
        if dropped > 0 {
            debug!(dropped, "Dropped remote biases of segments no longer owned");
        }

        if change.was_excluded(local_node) {
            info!(
                node_id = local_node,
                "Node was not in the previous topology, clearing local biases"
            );
            self.local.clear();
        } else {
            self.revoke_local_bias_for_segments(&change.segments_with_new_owner());
        }
    }

    /// One pass of the periodic maintenance.
    ///
    /// Drops expired leases, renews leases that are being read and revokes
    /// remote biases that outlived their lifespan.
    pub async fn sweep(&self) {
        let (expired, to_renew) = self.local.sweep(self.config.renewal_threshold());
        if expired > 0 {
            self.metrics.bias_expirations.inc_by(expired as u64);
            trace!(expired, "Local biases expired");
        }
        if !to_renew.is_empty() {
            self.renew(to_renew).await;
        }

        for key in self.remote.expired(self.config.lifespan) {
            // completion is tracked by the table itself
            let _ = self.remote.start_revoking(key, None);
        }
    }

    async fn renew(&self, keys: Vec<Key>) {
        let Some(topology) = self.topology.read().clone() else {
            return;
        };

        let mut by_owner: HashMap<NodeId, Vec<Key>> = HashMap::new();
        for key in keys {
            match topology.owner_of(self.partitioner.segment_of(&key)) {
                Some(owner) if owner != self.local_node => {
                    by_owner.entry(owner).or_default().push(key)
                }
                _ => {
                    self.local.remove(&key);
                }
            }
        }

        for (owner, keys) in by_owner {
            let command = Command::RenewBias { keys: keys.clone() };
            let call = self.transport.invoke(owner, command);
            match tokio::time::timeout(self.config.remote_timeout, call).await {
                Ok(Ok(Response::Ack)) => {
                    self.local.renewed(&keys);
                    self.metrics.bias_renewals.inc_by(keys.len() as u64);
                }
                Ok(Ok(response)) => {
                    debug!(owner, ?response, "Owner refused renewal, dropping biases");
                    for key in &keys {
                        self.local.remove(key);
                    }
                }
                Ok(Err(e)) => {
                    warn!(owner, error = %e, "Failed to renew biases");
                    for key in &keys {
                        self.local.remove(key);
                    }
                }
                Err(_) => {
                    warn!(owner, "Bias renewal timed out");
                    for key in &keys {
                        self.local.remove(key);
                    }
                }
            }
        }
    }

    /// Start the periodic sweep.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(manager.config.effective_wake_up_interval());

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.sweep().await;
                    }
                    _ = manager.cancellation.cancelled() => {
                        info!(node_id = manager.local_node, "Bias sweep shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the periodic sweep.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }
}
