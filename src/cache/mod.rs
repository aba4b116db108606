//! One scattered cache member.

pub mod container;

use crate::bias::{BiasManager, PendingBias};
use crate::config::{BiasAcquisition, ScatteredConfig};
use crate::error::{Error, NetworkError, Result};
use crate::metrics::ScatteredMetrics;
use crate::network::{Command, CommandHandler, Response, Transport};
use crate::partitioning::{KeyPartitioner, Topology, TopologyChange};
use crate::transfer::{BackupReplicator, StateConsumer, StateProvider};
use crate::types::{EntryVersion, InternalEntry, Key, NodeId, SegmentId, TopologyId};
use crate::versioning::{SegmentState, VersionManager};
use async_trait::async_trait;
use bytes::Bytes;
use container::DataContainer;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Result of a write applied by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Version assigned by the owner.
    pub version: EntryVersion,
    /// Topology the owner was in.
    pub topology_id: TopologyId,
    /// Whether the origin is now biased for the key.
    pub biased: bool,
}

/// A scattered cache member.
///
/// Owns the local container and every consistency component, answers
/// commands of other members and exposes a thin owner-side write path and
/// a read path used by the surrounding interceptors.
pub struct ScatteredNode {
    config: ScatteredConfig,
    container: Arc<DataContainer>,
    versions: Arc<VersionManager>,
    bias: Arc<BiasManager>,
    provider: StateProvider,
    consumer: Arc<StateConsumer>,
    transport: Arc<dyn Transport>,
    metrics: Arc<ScatteredMetrics>,
    topology: RwLock<Option<Arc<Topology>>>,
    /// Serializes topology installs.
    installs: Mutex<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ScatteredNode {
    /// Wire the components of one member.
    ///
    /// `transport.local_node()` must match `config.node_id`.
    pub fn new(config: ScatteredConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;
        if transport.local_node() != config.node_id {
            return Err(Error::Config(format!(
                "transport belongs to node {} but config to node {}",
                transport.local_node(),
                config.node_id
            )));
        }

        let partitioner = KeyPartitioner::new(config.num_segments);
        let metrics = Arc::new(ScatteredMetrics::new());
        let container = Arc::new(DataContainer::new(partitioner));
        let versions = Arc::new(VersionManager::new(
            &config,
            transport.clone(),
            container.clone(),
            metrics.clone(),
        ));
        let bias = Arc::new(BiasManager::new(
            config.bias.clone(),
            partitioner,
            transport.clone(),
            metrics.clone(),
        ));
        let replicator = Arc::new(BackupReplicator::new(
            &config.state_transfer,
            transport.clone(),
            metrics.clone(),
        ));
        let provider = StateProvider::new(
            config.node_id,
            config.state_transfer.clone(),
            container.clone(),
            versions.clone(),
            bias.clone(),
            replicator.clone(),
        );
        let consumer = Arc::new(StateConsumer::new(
            config.state_transfer.clone(),
            container.clone(),
            versions.clone(),
            replicator,
            transport.clone(),
            metrics.clone(),
        ));

        info!(
            node_id = config.node_id,
            num_segments = config.num_segments,
            "Created scattered node"
        );

        Ok(Arc::new(Self {
            config,
            container,
            versions,
            bias,
            provider,
            consumer,
            transport,
            metrics,
            topology: RwLock::new(None),
            installs: Mutex::new(()),
            sweeper: Mutex::new(None),
        }))
    }

    // ==================== Accessors ====================

    /// This node's ID.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Local data container.
    pub fn container(&self) -> &Arc<DataContainer> {
        &self.container
    }

    /// Version manager.
    pub fn versions(&self) -> &Arc<VersionManager> {
        &self.versions
    }

    /// Bias manager.
    pub fn bias(&self) -> &Arc<BiasManager> {
        &self.bias
    }

    /// Metrics of this node.
    pub fn metrics(&self) -> &Arc<ScatteredMetrics> {
        &self.metrics
    }

    /// Currently installed topology.
    pub fn topology(&self) -> Option<Arc<Topology>> {
        self.topology.read().clone()
    }

    /// Segment of a key.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        self.container.segment_of(key)
    }

    /// Whether an inbound state transfer is running.
    pub fn is_transferring(&self) -> bool {
        self.consumer.is_transferring()
    }

    // ==================== Topology ====================

    /// Install a topology announced by the orchestrator.
    pub fn on_topology_change(&self, change: &TopologyChange) -> Result<()> {
        let _guard = self.installs.lock();
        let current = self.versions.topology_id();
        if change.topology_id() <= current {
            return Err(Error::StaleTopology {
                requested: change.topology_id(),
                current,
            });
        }
        debug!(
            node_id = self.node_id(),
            topology_id = change.topology_id(),
            added = ?change.added_segments,
            removed = ?change.removed_segments,
            is_rebalance = change.is_rebalance,
            "Installing topology"
        );

        self.bias.on_topology_change(change);
        self.consumer.on_topology_change(change)?;
        *self.topology.write() = Some(change.current.clone());
        self.provider.on_topology_change(change);
        Ok(())
    }

    /// Install `topology` on top of the current one.
    pub fn install_topology(&self, topology: Arc<Topology>, is_rebalance: bool) -> Result<()> {
        let change = TopologyChange::for_node(self.topology(), topology, self.node_id(), is_rebalance);
        self.on_topology_change(&change)
    }

    // ==================== Write path (owner) ====================

    /// Store `value` on behalf of `origin`.
    pub async fn write(&self, origin: NodeId, key: Key, value: Bytes) -> Result<WriteOutcome> {
        self.update(origin, self.versions.topology_id(), key, Some(value))
            .await
    }

    /// Remove `key` on behalf of `origin`.
    pub async fn remove(&self, origin: NodeId, key: Key) -> Result<WriteOutcome> {
        self.update(origin, self.versions.topology_id(), key, None)
            .await
    }

    /// Apply a write routed by `origin` while it was in `origin_topology_id`.
    ///
    /// Waits while the segment is blocked, rejects origins that routed
    /// with a topology older than this node's ownership, revokes the biases
    /// of other nodes and schedules the invalidation of older copies.
    /// A failed revocation is reported after the write was applied.
    pub async fn update(
        &self,
        origin: NodeId,
        origin_topology_id: TopologyId,
        key: Key,
        value: Option<Bytes>,
    ) -> Result<WriteOutcome> {
        let segment = self.segment_of(&key);
        if self.versions.segment_state(segment) == SegmentState::Blocked {
            self.versions.await_segment(segment).await?;
        }
        if !self
            .versions
            .is_version_actual(segment, EntryVersion::new(origin_topology_id, 0))
        {
            return Err(Error::StaleTopology {
                requested: origin_topology_id,
                current: self.versions.topology_id(),
            });
        }
        let version = self.versions.increment_version(segment)?;
        let topology_id = self.versions.topology_id();

        let new_bias = match self.bias.acquisition() {
            BiasAcquisition::OnWrite | BiasAcquisition::OnRead
                if origin != self.node_id() && value.is_some() =>
            {
                Some(origin)
            }
            _ => None,
        };

        let removal = value.is_none();
        let entry = match value {
            Some(value) => InternalEntry::value(value, version),
            None => InternalEntry::tombstone(version),
        };
        self.container.put_local(key.clone(), entry);

        let revoked = match self.bias.start_revoking_remote_bias(key.clone(), new_bias) {
            Some(revocation) => revocation.wait().await,
            None => true,
        };
        self.versions.schedule_key_invalidation(key, version, removal);
        trace!(node_id = self.node_id(), segment, %version, removal, "Applied write");

        if !revoked {
            return Err(Error::RevocationFailed);
        }
        Ok(WriteOutcome {
            version,
            topology_id,
            biased: new_bias.is_some(),
        })
    }

    /// Announce a write this node routes to the owner of `key`.
    ///
    /// The returned handle is completed by
    /// [`cache_remote_write`](Self::cache_remote_write) or
    /// [`abandon_remote_write`](Self::abandon_remote_write).
    pub fn begin_remote_write(&self, key: Key) -> PendingBias {
        self.bias.begin_local_bias(key)
    }

    /// Keep the copy of a write this node originated on another owner.
    ///
    /// The bias granted with the write is dropped if the owner revoked it
    /// while the write was in flight.
    pub fn cache_remote_write(
        &self,
        pending: PendingBias,
        value: Option<Bytes>,
        outcome: &WriteOutcome,
    ) {
        let entry = match value {
            Some(value) => InternalEntry::value(value, outcome.version),
            None => InternalEntry::tombstone(outcome.version),
        };
        self.container.apply(pending.key().clone(), entry);
        let granted = outcome.biased.then_some(outcome.topology_id);
        self.bias.complete_local_bias(pending, granted);
    }

    /// Forget a routed write that failed.
    pub fn abandon_remote_write(&self, pending: PendingBias) {
        self.bias.complete_local_bias(pending, None);
    }

    // ==================== Read path ====================

    /// Read `key`, locally when owned or biased, from the owner otherwise.
    pub async fn read(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let segment = self.segment_of(key);
        let topology = self.topology().ok_or(Error::NotOwner {
            segment,
            node: self.node_id(),
        })?;
        let owner = topology.owner_of(segment).ok_or(Error::NotOwner {
            segment,
            node: self.node_id(),
        })?;

        if owner == self.node_id() {
            return Ok(self.read_owned(key, segment).await?.0);
        }

        if self.bias.has_local_bias(key) {
            if let Some(entry) = self.container.get(key).filter(|e| !e.is_remote()) {
                trace!(node_id = self.node_id(), owner, "Read served from bias");
                return Ok(entry.value);
            }
        }

        let pending = self.bias.begin_local_bias(Bytes::copy_from_slice(key));
        match self.read_remote(owner, segment, pending.key().clone()).await {
            Ok((value, granted)) => {
                self.bias.complete_local_bias(pending, granted);
                Ok(value)
            }
            Err(e) => {
                self.bias.complete_local_bias(pending, None);
                Err(e)
            }
        }
    }

    /// `Get` round trip to the owner; also returns the topology of a
    /// granted bias.
    async fn read_remote(
        &self,
        owner: NodeId,
        segment: SegmentId,
        key: Key,
    ) -> Result<(Option<Bytes>, Option<TopologyId>)> {
        let command = Command::Get { key: key.clone() };
        let call = self.transport.invoke(owner, command);
        let response = tokio::time::timeout(self.config.bias.remote_timeout, call)
            .await
            .map_err(|_| Error::Timeout)??
            .into_result()?;
        match response {
            Response::Value {
                value,
                version,
                topology_id,
                biased,
            } => match (biased, &value, version) {
                (true, Some(bytes), Some(version)) => {
                    self.container
                        .apply(key, InternalEntry::value(bytes.clone(), version));
                    Ok((value, Some(topology_id)))
                }
                _ => Ok((value, None)),
            },
            Response::NotOwner => Err(Error::NotOwner {
                segment,
                node: owner,
            }),
            other => Err(Error::Network(NetworkError::UnexpectedResponse(format!(
                "{:?}",
                other
            )))),
        }
    }

    /// Read a key of a segment this node owns, fetching values still left
    /// on their previous holder.
    async fn read_owned(
        &self,
        key: &[u8],
        segment: SegmentId,
    ) -> Result<(Option<Bytes>, Option<EntryVersion>)> {
        match self.versions.segment_state(segment) {
            SegmentState::Blocked => self.versions.await_segment(segment).await?,
            SegmentState::NotOwned => {
                return Err(Error::NotOwner {
                    segment,
                    node: self.node_id(),
                })
            }
            _ => {}
        }

        match self.container.get(key) {
            None => Ok((None, None)),
            Some(InternalEntry {
                remote: Some(holder),
                version,
                ..
            }) => self.fetch_from_holder(key, holder, version).await,
            Some(entry) => Ok((entry.value, Some(entry.version))),
        }
    }

    async fn fetch_from_holder(
        &self,
        key: &[u8],
        holder: NodeId,
        version: EntryVersion,
    ) -> Result<(Option<Bytes>, Option<EntryVersion>)> {
        let key = Bytes::copy_from_slice(key);
        let command = Command::RequestValues {
            topology_id: self.versions.topology_id(),
            keys: vec![key.clone()],
        };
        let call = self.transport.invoke(holder, command);
        let response = tokio::time::timeout(self.config.state_transfer.timeout, call)
            .await
            .map_err(|_| Error::Timeout)??
            .into_result()?;
        let mut values = match response {
            Response::Values(values) => values,
            other => {
                return Err(Error::Network(NetworkError::UnexpectedResponse(format!(
                    "{:?}",
                    other
                ))))
            }
        };

        match values.pop().flatten() {
            Some(fetched) => {
                let entry = match fetched.value.clone() {
                    Some(value) => InternalEntry::value(value, fetched.version),
                    None => InternalEntry::tombstone(fetched.version),
                };
                self.container.apply(key, entry);
                Ok((fetched.value, Some(fetched.version)))
            }
            None => {
                self.container.drop_pointer(&key, version);
                Ok((None, None))
            }
        }
    }

    async fn handle_get(&self, origin: NodeId, key: Key) -> Response {
        let segment = self.segment_of(&key);
        if !self.versions.segment_state(segment).is_live_owner()
            && self.versions.segment_state(segment) != SegmentState::Blocked
        {
            return Response::NotOwner;
        }
        match self.read_owned(&key, segment).await {
            Ok((value, version)) => {
                let container = &self.container;
                let biased = value.is_some()
                    && self.bias.try_grant_remote_bias(key.clone(), origin, || {
                        version.is_some() && container.local_version(&key) == version
                    });
                Response::Value {
                    value,
                    version,
                    topology_id: self.versions.topology_id(),
                    biased,
                }
            }
            Err(Error::NotOwner { .. }) => Response::NotOwner,
            Err(e) => Response::Error(e.to_string()),
        }
    }

    fn handle_invalidate(&self, command: &Command) -> Response {
        let removal = matches!(command, Command::InvalidateVersions { removal: true, .. });
        let mut removed = 0;
        for (key, version) in command.invalidated() {
            if self.container.invalidate(&key, version, removal) {
                self.bias.revoke_local_bias(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            trace!(node_id = self.node_id(), removed, removal, "Invalidated copies");
        }
        Response::Ack
    }

    // ==================== Lifecycle ====================

    /// Start the periodic bias sweep.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() && self.bias.acquisition() != BiasAcquisition::Never {
            *sweeper = Some(self.bias.start());
        }
    }

    /// Send pending invalidations and wait for transfers and broadcasts in
    /// flight.
    pub async fn quiesce(&self) {
        self.consumer.quiesce().await;
        self.provider.quiesce().await;
        self.versions.flush();
        self.versions.quiesce_invalidations().await;
    }

    /// Stop every background activity and fail pending waiters.
    pub fn stop(&self) {
        info!(node_id = self.node_id(), "Stopping scattered node");
        self.bias.stop();
        self.consumer.stop();
        self.provider.stop();
        self.versions.stop();
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl CommandHandler for ScatteredNode {
    async fn handle(&self, origin: NodeId, command: Command) -> Response {
        match command {
            Command::RenewBias { keys } => self.bias.handle_renew(origin, &keys),
            Command::RevokeBias { keys } => self.bias.handle_revoke(&keys),
            command @ Command::InvalidateVersions { .. } => self.handle_invalidate(&command),
            Command::RequestKeys {
                segments,
                after,
                chunk_size,
                ..
            } => self
                .provider
                .handle_request_keys(&segments, after.as_deref(), chunk_size),
            Command::RequestValues { keys, .. } => self.provider.handle_request_values(&keys),
            Command::BackupPut { entries, .. } => self.provider.handle_backup_put(entries),
            Command::ConfirmRevokedSegments {
                topology_id,
                segments,
            } => {
                self.provider
                    .handle_confirm_revoked(topology_id, &segments)
                    .await
            }
            Command::Get { key } => self.handle_get(origin, key).await,
        }
    }
}

impl std::fmt::Debug for ScatteredNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScatteredNode")
            .field("node_id", &self.config.node_id)
            .field("topology_id", &self.versions.topology_id())
            .field("entries", &self.container.len())
            .finish()
    }
}

impl Drop for ScatteredNode {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
