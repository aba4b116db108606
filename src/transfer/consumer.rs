//! Receiving side of state transfer.
//!
//! A node that gains segments registers them, confirms with every member
//! that stale biases are gone, pulls the key listings of all members and
//! finally fetches the values whose newest copy lives elsewhere.

use super::backup::BackupReplicator;
use crate::cache::container::DataContainer;
use crate::config::StateTransferConfig;
use crate::error::{Error, NetworkError, Result};
use crate::metrics::ScatteredMetrics;
use crate::network::{expect_all_acks, Command, KeyEntry, Response, TransferEntry, Transport};
use crate::partitioning::{Topology, TopologyChange};
use crate::types::{EntryVersion, InternalEntry, Key, NodeId, SegmentId, TopologyId};
use crate::versioning::{SegmentState, VersionManager};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Inbound transfer of one topology.
#[derive(Debug)]
struct InboundTransfer {
    topology: Arc<Topology>,
    segments: BTreeSet<SegmentId>,
    confirm_revoked: bool,
    /// Cancelled when a newer topology supersedes the transfer.
    cancellation: CancellationToken,
    /// Child of `cancellation`, also cancelled when a value chunk fails.
    values: CancellationToken,
    pending_sources: AtomicUsize,
    pending_chunks: AtomicUsize,
    failed: AtomicBool,
    finished: AtomicBool,
    /// Listed keys for which the local copy is the newest one.
    local_newest: Mutex<BTreeMap<Key, EntryVersion>>,
}

impl InboundTransfer {
    fn topology_id(&self) -> TopologyId {
        self.topology.topology_id
    }
}

/// Pulls state for segments this node gains.
#[derive(Debug)]
pub struct StateConsumer {
    local_node: NodeId,
    config: StateTransferConfig,
    container: Arc<DataContainer>,
    versions: Arc<VersionManager>,
    replicator: Arc<BackupReplicator>,
    transport: Arc<dyn Transport>,
    metrics: Arc<ScatteredMetrics>,
    current: Mutex<Option<Arc<InboundTransfer>>>,
    /// Serializes segment transitions against topology installs.
    transitions: Mutex<()>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl StateConsumer {
    /// Create a consumer.
    pub fn new(
        config: StateTransferConfig,
        container: Arc<DataContainer>,
        versions: Arc<VersionManager>,
        replicator: Arc<BackupReplicator>,
        transport: Arc<dyn Transport>,
        metrics: Arc<ScatteredMetrics>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_outstanding_chunks.max(1)));
        Self {
            local_node: transport.local_node(),
            config,
            container,
            versions,
            replicator,
            transport,
            metrics,
            current: Mutex::new(None),
            transitions: Mutex::new(()),
            permits,
            tasks: TaskTracker::new(),
        }
    }

    /// Install a topology and start pulling the segments it assigns here.
    ///
    /// Segments still in transfer from a superseded topology are given up
    /// and, when still owned, transferred again.
    pub fn on_topology_change(self: &Arc<Self>, change: &TopologyChange) -> Result<()> {
        let topology = change.current.clone();
        let topology_id = topology.topology_id;

        let transfer = {
            let _guard = self.transitions.lock();
            let current = self.versions.topology_id();
            if topology_id <= current {
                return Err(Error::StaleTopology {
                    requested: topology_id,
                    current,
                });
            }
            if let Some(previous) = self.current.lock().take() {
                debug!(
                    node_id = self.local_node,
                    previous = previous.topology_id(),
                    topology_id,
                    "Cancelling superseded state transfer"
                );
                previous.cancellation.cancel();
            }

            for segment in 0..self.versions.num_segments() {
                let state = self.versions.segment_state(segment);
                if state == SegmentState::NotOwned {
                    continue;
                }
                if state != SegmentState::Owned || !topology.is_owner(self.local_node, segment) {
                    self.versions.unregister_segment(segment)?;
                }
            }
            self.versions.set_topology_id(topology_id)?;

            let gained: BTreeSet<SegmentId> = topology
                .owned_segments(self.local_node)
                .into_iter()
                .filter(|s| self.versions.segment_state(*s) == SegmentState::NotOwned)
                .collect();

            if change.previous.is_none() || !self.config.fetch_enabled || gained.is_empty() {
                self.versions.set_owned_segments(&gained)?;
                if self.versions.is_transferring_values() {
                    self.versions.notify_value_transfer_finished();
                }
                return Ok(());
            }

            self.versions.set_values_transfer_topology(topology_id);
            for &segment in &gained {
                self.versions.register_segment(segment)?;
            }
            info!(
                node_id = self.local_node,
                topology_id,
                segments = ?gained,
                "Starting state transfer"
            );

            let cancellation = CancellationToken::new();
            let transfer = Arc::new(InboundTransfer {
                topology,
                segments: gained,
                confirm_revoked: change.is_rebalance,
                values: cancellation.child_token(),
                cancellation,
                pending_sources: AtomicUsize::new(0),
                pending_chunks: AtomicUsize::new(0),
                failed: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                local_newest: Mutex::new(BTreeMap::new()),
            });
            *self.current.lock() = Some(transfer.clone());
            transfer
        };

        let consumer = Arc::clone(self);
        self.tasks.spawn(async move { consumer.run(transfer).await });
        Ok(())
    }

    /// Whether an inbound transfer is running.
    pub fn is_transferring(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|t| !t.finished.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Wait until running transfer tasks completed.
    pub async fn quiesce(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Abort the running transfer.
    pub fn stop(&self) {
        if let Some(transfer) = self.current.lock().take() {
            transfer.cancellation.cancel();
        }
        self.tasks.close();
    }

    async fn run(self: Arc<Self>, transfer: Arc<InboundTransfer>) {
        if transfer.confirm_revoked {
            let confirmed = tokio::select! {
                _ = transfer.cancellation.cancelled() => Err(Error::Cancelled),
                r = self.confirm_revoked(&transfer) => r,
            };
            match confirmed {
                Ok(()) => {}
                Err(Error::Cancelled) => return,
                Err(e) => {
                    warn!(
                        node_id = self.local_node,
                        topology_id = transfer.topology_id(),
                        error = %e,
                        "Failed to confirm revoked segments"
                    );
                    self.fail(&transfer);
                    return;
                }
            }
        }

        {
            let _guard = self.transitions.lock();
            if transfer.cancellation.is_cancelled() {
                return;
            }
            if let Err(e) = self.versions.start_key_transfer(&transfer.segments) {
                warn!(node_id = self.local_node, error = %e, "Cannot start key transfer");
                return;
            }
        }

        let mut sources = transfer.topology.other_members(self.local_node);
        sources.shuffle(&mut rand::rng());
        if sources.is_empty() {
            self.keys_received(&transfer);
            return;
        }

        transfer
            .pending_sources
            .store(sources.len(), Ordering::Release);
        for source in sources {
            let consumer = Arc::clone(&self);
            let transfer = transfer.clone();
            self.tasks.spawn(async move { consumer.pull(transfer, source).await });
        }
    }

    async fn confirm_revoked(&self, transfer: &InboundTransfer) -> Result<()> {
        let command = Command::ConfirmRevokedSegments {
            topology_id: transfer.topology_id(),
            segments: transfer.segments.iter().copied().collect(),
        };
        let responses = tokio::time::timeout(self.config.timeout, self.transport.broadcast(command))
            .await
            .map_err(|_| Error::Timeout)??;
        expect_all_acks(responses)
    }

    async fn pull(self: Arc<Self>, transfer: Arc<InboundTransfer>, source: NodeId) {
        let result = tokio::select! {
            _ = transfer.cancellation.cancelled() => Err(Error::Cancelled),
            r = self.pull_keys(&transfer, source) => r,
        };
        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => return,
            Err(Error::Network(NetworkError::NodeLeft(_))) => {
                debug!(node_id = self.local_node, source, "Source left during key transfer");
            }
            Err(e) => {
                warn!(node_id = self.local_node, source, error = %e, "Key transfer failed");
                transfer.failed.store(true, Ordering::Release);
            }
        }

        if transfer.pending_sources.fetch_sub(1, Ordering::AcqRel) == 1 {
            if transfer.failed.load(Ordering::Acquire) {
                self.fail(&transfer);
            } else {
                self.keys_received(&transfer);
            }
        }
    }

    async fn pull_keys(&self, transfer: &InboundTransfer, source: NodeId) -> Result<()> {
        let segments: Vec<SegmentId> = transfer.segments.iter().copied().collect();
        let mut after: Option<Key> = None;
        loop {
            let command = Command::RequestKeys {
                topology_id: transfer.topology_id(),
                segments: segments.clone(),
                after: after.clone(),
                chunk_size: self.config.chunk_size as u32,
            };
            let response = tokio::time::timeout(self.config.timeout, self.transport.invoke(source, command))
                .await
                .map_err(|_| Error::Timeout)??
                .into_result()?;
            let Response::Keys { entries, last } = response else {
                return Err(Error::Network(NetworkError::UnexpectedResponse(format!(
                    "{:?}",
                    response
                ))));
            };

            if let (Some(cursor), Some(first)) = (&after, entries.first()) {
                if first.key <= *cursor {
                    return Err(Error::Transfer(format!(
                        "node {} listed keys out of order",
                        source
                    )));
                }
            }

            trace!(source, count = entries.len(), last, "Received keys");
            for entry in &entries {
                self.merge_key(transfer, source, entry);
            }
            if last || entries.is_empty() {
                return Ok(());
            }
            after = entries.last().map(|e| e.key.clone());
        }
    }

    fn merge_key(&self, transfer: &InboundTransfer, source: NodeId, entry: &KeyEntry) {
        if self
            .container
            .merge_remote(entry.key.clone(), entry.version, source)
        {
            return;
        }
        if let Some(local) = self.container.get(&entry.key) {
            if !local.is_remote() {
                let mut newest = transfer.local_newest.lock();
                let version = newest.entry(entry.key.clone()).or_insert(local.version);
                *version = (*version).max(local.version);
            }
        }
    }

    /// Every source delivered its keys: settle the segments and fetch the
    /// values that live elsewhere.
    fn keys_received(self: &Arc<Self>, transfer: &Arc<InboundTransfer>) {
        let pointers = self.container.remote_pointers(&transfer.segments);
        {
            let _guard = self.transitions.lock();
            if transfer.cancellation.is_cancelled() {
                return;
            }
            let with_values: BTreeSet<SegmentId> = pointers
                .iter()
                .map(|(key, _, _)| self.container.segment_of(key))
                .collect();
            for &segment in &transfer.segments {
                if let Err(e) = self.versions.notify_key_transfer_finished(
                    segment,
                    with_values.contains(&segment),
                    false,
                ) {
                    warn!(node_id = self.local_node, segment, error = %e, "Cannot finish key transfer");
                }
            }
        }

        self.replicate_local_newest(transfer);

        let mut by_holder: BTreeMap<NodeId, Vec<(Key, EntryVersion)>> = BTreeMap::new();
        for (key, holder, version) in pointers {
            by_holder.entry(holder).or_default().push((key, version));
        }
        let chunk_size = self.config.chunk_size.max(1);
        let chunks: Vec<(NodeId, Vec<(Key, EntryVersion)>)> = by_holder
            .into_iter()
            .flat_map(|(holder, keys)| {
                keys.chunks(chunk_size)
                    .map(|c| (holder, c.to_vec()))
                    .collect::<Vec<_>>()
            })
            .collect();

        debug!(
            node_id = self.local_node,
            topology_id = transfer.topology_id(),
            chunks = chunks.len(),
            "Key transfer finished"
        );
        if chunks.is_empty() {
            self.values_received(transfer);
            return;
        }

        transfer
            .pending_chunks
            .store(chunks.len(), Ordering::Release);
        for (holder, keys) in chunks {
            let consumer = Arc::clone(self);
            let transfer = transfer.clone();
            self.tasks.spawn(async move { consumer.fetch(transfer, holder, keys).await });
        }
    }

    /// Back up entries this node already held the newest copy of, then
    /// invalidate them on the remaining members.
    fn replicate_local_newest(&self, transfer: &Arc<InboundTransfer>) {
        let newest = std::mem::take(&mut *transfer.local_newest.lock());
        let entries: Vec<TransferEntry> = newest
            .into_iter()
            .filter_map(|(key, version)| {
                let local = self.container.get(&key)?;
                (!local.is_remote() && local.version == version).then(|| TransferEntry {
                    key,
                    value: local.value,
                    version,
                })
            })
            .collect();
        if entries.is_empty() {
            return;
        }

        let topology = transfer.topology.clone();
        let backup = topology.next_member(self.local_node);
        let targets = topology.other_members(self.local_node);
        let replicator = self.replicator.clone();
        let cancellation = transfer.cancellation.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancellation.cancelled() => {}
                _ = replicator.backup_then_invalidate(topology.topology_id, backup, entries, &targets) => {}
            }
        });
    }

    async fn fetch(
        self: Arc<Self>,
        transfer: Arc<InboundTransfer>,
        holder: NodeId,
        keys: Vec<(Key, EntryVersion)>,
    ) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        self.metrics.outstanding_chunks.inc();
        let result = tokio::select! {
            _ = transfer.values.cancelled() => Err(Error::Cancelled),
            r = self.fetch_values(&transfer, holder, &keys) => r,
        };
        self.metrics.outstanding_chunks.dec();

        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => return,
            Err(e) => {
                warn!(
                    node_id = self.local_node,
                    holder,
                    keys = keys.len(),
                    error = %e,
                    "Value transfer failed"
                );
                self.fail_values(&transfer);
                return;
            }
        }

        if transfer.pending_chunks.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.values_received(&transfer);
        }
    }

    async fn fetch_values(
        &self,
        transfer: &InboundTransfer,
        holder: NodeId,
        keys: &[(Key, EntryVersion)],
    ) -> Result<()> {
        let topology_id = transfer.topology_id();
        let command = Command::RequestValues {
            topology_id,
            keys: keys.iter().map(|(k, _)| k.clone()).collect(),
        };
        let response = tokio::time::timeout(self.config.timeout, self.transport.invoke(holder, command))
            .await
            .map_err(|_| Error::Timeout)??
            .into_result()?;
        let Response::Values(values) = response else {
            return Err(Error::Network(NetworkError::UnexpectedResponse(format!(
                "{:?}",
                response
            ))));
        };
        if values.len() != keys.len() {
            return Err(Error::Transfer(format!(
                "node {} returned {} values for {} keys",
                holder,
                values.len(),
                keys.len()
            )));
        }

        let mut fetched = Vec::with_capacity(values.len());
        for ((key, pointer_version), value) in keys.iter().zip(values) {
            let Some(entry) = value else {
                // the holder lost the value meanwhile
                self.container.drop_pointer(key, *pointer_version);
                continue;
            };
            let internal = match entry.value {
                Some(value) => InternalEntry::value(value, entry.version),
                None => InternalEntry::tombstone(entry.version),
            };
            let tombstone = internal.is_tombstone();
            if self.container.apply(key.clone(), internal) {
                self.metrics.values_applied.inc();
                if tombstone {
                    self.versions
                        .schedule_key_invalidation(key.clone(), entry.version, true);
                }
            }
            fetched.push((key.clone(), entry.version));
        }

        let targets: Vec<NodeId> = transfer
            .topology
            .members
            .iter()
            .copied()
            .filter(|n| *n != holder && *n != self.local_node)
            .collect();
        if fetched.is_empty() || targets.is_empty() {
            return Ok(());
        }
        let command = Command::invalidate_versions(topology_id, &fetched, true);
        let call = self.transport.invoke_many(&targets, command);
        match tokio::time::timeout(self.config.timeout, call).await {
            Ok(Ok(responses)) => {
                if let Err(e) = expect_all_acks(responses) {
                    warn!(?targets, error = %e, "Invalidation of transferred values was rejected");
                }
            }
            Ok(Err(e)) => warn!(?targets, error = %e, "Failed to invalidate transferred values"),
            Err(_) => warn!(?targets, "Invalidation of transferred values timed out"),
        }
        Ok(())
    }

    fn values_received(&self, transfer: &InboundTransfer) {
        let _guard = self.transitions.lock();
        if transfer.cancellation.is_cancelled() || transfer.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.versions.notify_value_transfer_finished();
        info!(
            node_id = self.local_node,
            topology_id = transfer.topology_id(),
            "State transfer finished"
        );
    }

    /// Give up every segment of a failed transfer.
    fn fail(&self, transfer: &InboundTransfer) {
        let _guard = self.transitions.lock();
        if transfer.cancellation.is_cancelled() || transfer.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.metrics.key_transfer_failures.inc();
        for &segment in &transfer.segments {
            if let Err(e) = self.versions.notify_key_transfer_finished(segment, false, true) {
                debug!(node_id = self.local_node, segment, error = %e, "Segment already settled");
            }
        }
        self.drop_pointers(&transfer.segments);
        self.versions.notify_value_transfer_finished();
        warn!(
            node_id = self.local_node,
            topology_id = transfer.topology_id(),
            segments = ?transfer.segments,
            "State transfer failed, segments are not owned"
        );
    }

    /// Give up every segment of a transfer whose value pull failed and
    /// stop its remaining chunks.
    fn fail_values(&self, transfer: &InboundTransfer) {
        let _guard = self.transitions.lock();
        if transfer.cancellation.is_cancelled() || transfer.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        transfer.values.cancel();
        self.metrics.value_transfer_failures.inc();
        for &segment in &transfer.segments {
            if self.versions.segment_state(segment) != SegmentState::NotOwned {
                if let Err(e) = self.versions.unregister_segment(segment) {
                    debug!(node_id = self.local_node, segment, error = %e, "Segment already settled");
                }
            }
        }
        self.drop_pointers(&transfer.segments);
        self.versions.notify_value_transfer_finished();
        warn!(
            node_id = self.local_node,
            topology_id = transfer.topology_id(),
            segments = ?transfer.segments,
            "Value transfer failed, segments are not owned"
        );
    }

    fn drop_pointers(&self, segments: &BTreeSet<SegmentId>) {
        for (key, _, version) in self.container.remote_pointers(segments) {
            self.container.drop_pointer(&key, version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScatteredConfig;
    use crate::network::{CommandHandler, CommandKind};
    use crate::partitioning::KeyPartitioner;
    use crate::testing::InMemoryNetwork;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use test_log::test;

    const SEGMENTS: u32 = 4;

    /// A member serving a fixed data set.
    #[derive(Debug)]
    struct Holder {
        container: DataContainer,
    }

    #[async_trait]
    impl CommandHandler for Holder {
        async fn handle(&self, _origin: NodeId, command: Command) -> Response {
            match command {
                Command::RequestKeys {
                    segments,
                    after,
                    chunk_size,
                    ..
                } => {
                    let segments = segments.into_iter().collect();
                    let (keys, last) =
                        self.container
                            .keys_in_segments(&segments, after.as_deref(), chunk_size as usize);
                    Response::Keys {
                        entries: keys
                            .into_iter()
                            .map(|(key, version)| KeyEntry { key, version })
                            .collect(),
                        last,
                    }
                }
                Command::RequestValues { keys, .. } => Response::Values(
                    keys.iter()
                        .map(|k| {
                            self.container.get(k).map(|e| TransferEntry {
                                key: k.clone(),
                                value: e.value,
                                version: e.version,
                            })
                        })
                        .collect(),
                ),
                _ => Response::Ack,
            }
        }
    }

    struct Fixture {
        network: Arc<InMemoryNetwork>,
        container: Arc<DataContainer>,
        versions: Arc<VersionManager>,
        metrics: Arc<ScatteredMetrics>,
        consumer: Arc<StateConsumer>,
        _holders: Vec<Arc<dyn CommandHandler>>,
    }

    fn fixture(holders: Vec<(NodeId, Vec<(Key, InternalEntry)>)>) -> Fixture {
        let network = InMemoryNetwork::new();
        let transport = network.transport(1);
        let transfer = StateTransferConfig::default()
            .with_chunk_size(2)
            .with_timeout(Duration::from_secs(1));
        let config = ScatteredConfig::new(1)
            .with_num_segments(SEGMENTS)
            .with_state_transfer(transfer.clone());
        let partitioner = KeyPartitioner::new(SEGMENTS);
        let metrics = Arc::new(ScatteredMetrics::new());
        let container = Arc::new(DataContainer::new(partitioner));
        let versions = Arc::new(VersionManager::new(
            &config,
            transport.clone(),
            container.clone(),
            metrics.clone(),
        ));
        let replicator = Arc::new(BackupReplicator::new(&transfer, transport.clone(), metrics.clone()));
        let consumer = Arc::new(StateConsumer::new(
            transfer,
            container.clone(),
            versions.clone(),
            replicator,
            transport,
            metrics.clone(),
        ));

        let mut kept = Vec::new();
        for (node, entries) in holders {
            let holder = Holder {
                container: DataContainer::new(partitioner),
            };
            for (key, entry) in entries {
                holder.container.put_local(key, entry);
            }
            let handler: Arc<dyn CommandHandler> = Arc::new(holder);
            network.register(node, Arc::downgrade(&handler));
            kept.push(handler);
        }

        Fixture {
            network,
            container,
            versions,
            metrics,
            consumer,
            _holders: kept,
        }
    }

    fn keys_in(segment: SegmentId, n: usize) -> Vec<Key> {
        let partitioner = KeyPartitioner::new(SEGMENTS);
        (0..)
            .map(|i| Bytes::from(format!("key-{}", i)))
            .filter(|k| partitioner.segment_of(k) == segment)
            .take(n)
            .collect()
    }

    fn value(v: &'static str, version: EntryVersion) -> InternalEntry {
        InternalEntry::value(Bytes::from_static(v.as_bytes()), version)
    }

    /// Node 1 joins a cluster of nodes 2 and 3 and gains segment 0.
    fn join_change() -> TopologyChange {
        let first = Arc::new(Topology::round_robin(1, vec![2, 3], SEGMENTS));
        let second = Arc::new(first.reassign(2, vec![1, 2, 3], &[(0, 1)]));
        TopologyChange::for_node(Some(first), second, 1, true)
    }

    #[test(tokio::test)]
    async fn test_first_topology_owns_without_transfer() {
        let f = fixture(vec![]);
        let topology = Arc::new(Topology::round_robin(1, vec![1, 2], SEGMENTS));
        let change = TopologyChange::for_node(None, topology, 1, false);

        f.consumer.on_topology_change(&change).unwrap();
        assert_eq!(f.versions.segment_state(0), SegmentState::Owned);
        assert_eq!(f.versions.segment_state(1), SegmentState::NotOwned);
        assert!(!f.consumer.is_transferring());
        assert!(f.network.call_log().is_empty());
    }

    #[test(tokio::test)]
    async fn test_stale_topology_rejected_before_any_transition() {
        let f = fixture(vec![]);
        let topology = Arc::new(Topology::round_robin(2, vec![1, 2], SEGMENTS));
        f.consumer
            .on_topology_change(&TopologyChange::for_node(None, topology.clone(), 1, false))
            .unwrap();

        let older = Arc::new(Topology::new(1, vec![1, 2], vec![2; SEGMENTS as usize]));
        let change = TopologyChange::for_node(Some(topology), older, 1, true);
        assert!(matches!(
            f.consumer.on_topology_change(&change),
            Err(Error::StaleTopology {
                requested: 1,
                current: 2
            })
        ));
        assert_eq!(f.versions.segment_state(0), SegmentState::Owned);
        assert_eq!(f.versions.topology_id(), 2);
        assert!(!f.consumer.is_transferring());
    }

    #[test(tokio::test)]
    async fn test_pulls_newest_copies_from_all_members() {
        let keys = keys_in(0, 5);
        let old = EntryVersion::new(1, 1);
        let new = EntryVersion::new(1, 2);
        let f = fixture(vec![
            (
                2,
                vec![
                    (keys[0].clone(), value("new", new)),
                    (keys[1].clone(), value("old", old)),
                    (keys[2].clone(), value("two", new)),
                    (keys[3].clone(), InternalEntry::tombstone(new)),
                ],
            ),
            (
                3,
                vec![
                    (keys[0].clone(), value("old", old)),
                    (keys[1].clone(), value("new", new)),
                    (keys[4].clone(), value("three", old)),
                ],
            ),
        ]);

        f.consumer.on_topology_change(&join_change()).unwrap();
        f.consumer.quiesce().await;

        assert_eq!(f.versions.segment_state(0), SegmentState::Owned);
        assert!(!f.consumer.is_transferring());
        assert_eq!(f.container.get_value(&keys[0]), Some(Bytes::from_static(b"new")));
        assert_eq!(f.container.get_value(&keys[1]), Some(Bytes::from_static(b"new")));
        assert_eq!(f.container.get_value(&keys[2]), Some(Bytes::from_static(b"two")));
        assert_eq!(f.container.get_value(&keys[4]), Some(Bytes::from_static(b"three")));
        assert!(f.container.get(&keys[3]).unwrap().is_tombstone());
        assert!(f.container.remote_pointers(&BTreeSet::from([0])).is_empty());

        // confirm-revoked precedes every key request
        let log = f.network.call_log();
        let last_confirm = log
            .iter()
            .filter(|c| c.command.kind() == CommandKind::ConfirmRevokedSegments)
            .map(|c| c.completed_at.unwrap())
            .max()
            .unwrap();
        assert!(log
            .iter()
            .filter(|c| c.command.kind() == CommandKind::RequestKeys)
            .all(|c| c.sent_at > last_confirm));

        // values fetched from node 2 are invalidated on node 3 only
        let invalidations = f.network.commands_of(CommandKind::InvalidateVersions);
        assert!(invalidations
            .iter()
            .filter(|c| c.command.mentions_key(&keys[0]))
            .all(|c| c.target == 3));
        assert!(f.metrics.values_applied.get() >= 5);

        let peak = f.metrics.outstanding_chunks.peak();
        assert!(peak >= 1);
        assert!(peak <= StateTransferConfig::default().max_outstanding_chunks as i64);
        assert_eq!(f.metrics.outstanding_chunks.get(), 0);
    }

    #[test(tokio::test)]
    async fn test_writes_allowed_during_key_transfer() {
        let keys = keys_in(0, 1);
        let f = fixture(vec![(2, vec![(keys[0].clone(), value("old", EntryVersion::new(1, 7)))]), (3, vec![])]);
        f.network
            .faults()
            .set_latency(CommandKind::RequestKeys, Duration::from_millis(50));

        f.consumer.on_topology_change(&join_change()).unwrap();
        assert!(f.consumer.is_transferring());
        crate::testing::wait_for(
            || f.versions.segment_state(0) == SegmentState::KeyTransfer,
            Duration::from_secs(1),
            Duration::from_millis(1),
        )
        .await;

        let version = f.versions.increment_version(0).unwrap();
        assert_eq!(version, EntryVersion::new(2, 1));
        f.container.put_local(keys[0].clone(), value("mine", version));

        f.consumer.quiesce().await;
        assert_eq!(f.versions.segment_state(0), SegmentState::Owned);
        assert_eq!(f.container.get_value(&keys[0]), Some(Bytes::from_static(b"mine")));
        assert!(f.network.commands_of(CommandKind::RequestValues).is_empty());
    }

    #[test(tokio::test)]
    async fn test_failed_key_pull_reverts_segments() {
        let keys = keys_in(0, 1);
        let f = fixture(vec![(2, vec![(keys[0].clone(), value("v", EntryVersion::new(1, 1)))]), (3, vec![])]);
        f.network.faults().fail_next(3, CommandKind::RequestKeys, 1);

        f.consumer.on_topology_change(&join_change()).unwrap();
        f.consumer.quiesce().await;

        assert_eq!(f.versions.segment_state(0), SegmentState::NotOwned);
        assert_eq!(f.metrics.key_transfer_failures.get(), 1);
        assert!(!f.versions.is_transferring_values());
        assert!(f.versions.increment_version(0).is_err());
        assert!(f.container.is_empty());
    }

    #[test(tokio::test)]
    async fn test_failed_value_chunk_reverts_whole_transfer() {
        let first = keys_in(0, 3);
        let second = keys_in(1, 1);
        let version = EntryVersion::new(1, 1);
        let f = fixture(vec![
            (
                2,
                first
                    .iter()
                    .map(|k| (k.clone(), value("two", version)))
                    .collect(),
            ),
            (3, vec![(second[0].clone(), value("three", version))]),
        ]);
        f.network.faults().fail_next(3, CommandKind::RequestValues, 1);

        // node 1 joins and gains segments 0 and 1
        let before = Arc::new(Topology::round_robin(1, vec![2, 3], SEGMENTS));
        let after = Arc::new(before.reassign(2, vec![1, 2, 3], &[(0, 1), (1, 1)]));
        let change = TopologyChange::for_node(Some(before), after, 1, true);

        f.consumer.on_topology_change(&change).unwrap();
        f.consumer.quiesce().await;

        // chunks from node 2 succeeded, still nothing of the task is owned
        assert_eq!(f.versions.segment_state(0), SegmentState::NotOwned);
        assert_eq!(f.versions.segment_state(1), SegmentState::NotOwned);
        assert!(f.versions.increment_version(0).is_err());
        assert!(f.container.remote_pointers(&BTreeSet::from([0, 1])).is_empty());
        assert_eq!(f.metrics.value_transfer_failures.get(), 1);
        assert_eq!(f.metrics.key_transfer_failures.get(), 0);
        assert_eq!(f.metrics.outstanding_chunks.get(), 0);
        assert!(!f.versions.is_transferring_values());
        assert!(!f.consumer.is_transferring());
    }

    #[test(tokio::test)]
    async fn test_newer_topology_restarts_transfer() {
        let keys = keys_in(0, 1);
        let f = fixture(vec![(2, vec![(keys[0].clone(), value("v", EntryVersion::new(1, 1)))]), (3, vec![])]);
        f.network
            .faults()
            .set_latency(CommandKind::ConfirmRevokedSegments, Duration::from_millis(50));

        let change = join_change();
        f.consumer.on_topology_change(&change).unwrap();
        assert_eq!(f.versions.segment_state(0), SegmentState::Blocked);

        let third = Arc::new(change.current.reassign(3, vec![1, 2, 3], &[]));
        let next = TopologyChange::for_node(Some(change.current.clone()), third, 1, true);
        f.network.faults().reset();
        f.consumer.on_topology_change(&next).unwrap();
        f.consumer.quiesce().await;

        assert_eq!(f.versions.topology_id(), 3);
        assert_eq!(f.versions.segment_state(0), SegmentState::Owned);
        assert_eq!(f.container.get_value(&keys[0]), Some(Bytes::from_static(b"v")));
    }
}
