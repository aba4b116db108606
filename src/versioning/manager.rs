//! Per-segment ownership state and version counters.

use super::invalidation::InvalidationBatcher;
use super::state::{SegmentEvent, SegmentState, SegmentTable};
use crate::cache::container::DataContainer;
use crate::config::ScatteredConfig;
use crate::error::{Error, Result};
use crate::metrics::ScatteredMetrics;
use crate::network::Transport;
use crate::types::{EntryVersion, Key, NodeId, SegmentId, TopologyId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Progress of the value transfer of the latest rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ValuesProgress {
    transferring: bool,
    values_topology: TopologyId,
    stopped: bool,
}

/// Owns segment states, version counters and pending invalidations.
///
/// Writes on the owner call [`increment_version`](Self::increment_version),
/// gate incoming versions with [`is_version_actual`](Self::is_version_actual)
/// and report the result through
/// [`schedule_key_invalidation`](Self::schedule_key_invalidation).
#[derive(Debug)]
pub struct VersionManager {
    local: NodeId,
    topology_id: AtomicU32,
    /// Latest installed topology id, for waiters.
    installed: watch::Sender<TopologyId>,
    states: SegmentTable,
    versions: Vec<AtomicU64>,
    /// Topology in which this node became the owner of each segment.
    owner_topology_ids: Vec<AtomicU32>,
    /// `true` while the segment is blocked.
    gates: Vec<watch::Sender<bool>>,
    /// Serializes registration changes.
    ownership_lock: Mutex<()>,
    values: watch::Sender<ValuesProgress>,
    invalidations: Arc<InvalidationBatcher>,
}

impl VersionManager {
    /// Create a manager with every segment `NotOwned`.
    pub fn new(
        config: &ScatteredConfig,
        transport: Arc<dyn Transport>,
        container: Arc<DataContainer>,
        metrics: Arc<ScatteredMetrics>,
    ) -> Self {
        let num_segments = config.num_segments;
        let invalidations = Arc::new(InvalidationBatcher::new(
            config.invalidation_batch_size,
            config.invalidation_retry_delay,
            transport,
            container,
            metrics,
        ));

        Self {
            local: config.node_id,
            topology_id: AtomicU32::new(0),
            installed: watch::channel(0).0,
            states: SegmentTable::new(num_segments),
            versions: (0..num_segments).map(|_| AtomicU64::new(0)).collect(),
            owner_topology_ids: (0..num_segments).map(|_| AtomicU32::new(0)).collect(),
            gates: (0..num_segments).map(|_| watch::channel(false).0).collect(),
            ownership_lock: Mutex::new(()),
            values: watch::channel(ValuesProgress::default()).0,
            invalidations,
        }
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.states.len() as u32
    }

    /// Current topology id.
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id.load(Ordering::Acquire)
    }

    /// Install a newer topology id.
    pub fn set_topology_id(&self, topology_id: TopologyId) -> Result<()> {
        let current = self.topology_id.load(Ordering::Acquire);
        if current >= topology_id {
            return Err(Error::StaleTopology {
                requested: topology_id,
                current,
            });
        }
        self.topology_id
            .compare_exchange(current, topology_id, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| Error::StaleTopology {
                requested: topology_id,
                current: actual,
            })?;
        self.installed.send_replace(topology_id);
        Ok(())
    }

    /// Wait until `topology_id` or a later topology is installed.
    pub async fn await_topology(&self, topology_id: TopologyId) -> Result<()> {
        let mut rx = self.installed.subscribe();
        rx.wait_for(|installed| *installed >= topology_id)
            .await
            .map_err(|_| Error::Stopping)?;
        if self.values.borrow().stopped {
            return Err(Error::Stopping);
        }
        Ok(())
    }

    /// State of a segment.
    pub fn segment_state(&self, segment: SegmentId) -> SegmentState {
        self.states.get(segment)
    }

    /// Issue the next version for a write to `segment`.
    pub fn increment_version(&self, segment: SegmentId) -> Result<EntryVersion> {
        match self.states.get(segment) {
            SegmentState::NotOwned => Err(Error::NotOwner {
                segment,
                node: self.local,
            }),
            SegmentState::Blocked => Err(Error::SegmentBlocked(segment)),
            SegmentState::KeyTransfer | SegmentState::ValueTransfer | SegmentState::Owned => {
                let counter = self.versions[segment as usize].fetch_add(1, Ordering::AcqRel) + 1;
                Ok(EntryVersion::new(self.topology_id(), counter))
            }
        }
    }

    /// Whether `version` was issued no earlier than this node's ownership.
    pub fn is_version_actual(&self, segment: SegmentId, version: EntryVersion) -> bool {
        self.owner_topology_ids
            .get(segment as usize)
            .map(|t| version.topology_id >= t.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Become the prospective owner of `segment`; access blocks until the
    /// key transfer starts.
    pub fn register_segment(&self, segment: SegmentId) -> Result<()> {
        let _guard = self.ownership_lock.lock();
        self.states.fire(segment, SegmentEvent::Register)?;

        let idx = segment as usize;
        self.owner_topology_ids[idx].store(self.topology_id(), Ordering::Release);
        self.versions[idx].store(0, Ordering::Release);
        self.gates[idx].send_replace(true);
        trace!(node_id = self.local, segment, "Blocked access to segment");
        Ok(())
    }

    /// Give up ownership of `segment`.
    pub fn unregister_segment(&self, segment: SegmentId) -> Result<()> {
        let _guard = self.ownership_lock.lock();
        let (previous, _) = self.states.fire(segment, SegmentEvent::Unregister)?;
        self.release_gate(segment);
        trace!(node_id = self.local, segment, ?previous, "Unregistered segment");
        Ok(())
    }

    /// Take ownership of segments without any transfer.
    pub fn set_owned_segments(&self, segments: &BTreeSet<SegmentId>) -> Result<()> {
        let _guard = self.ownership_lock.lock();
        let topology_id = self.topology_id();
        for &segment in segments {
            self.states.fire(segment, SegmentEvent::Own)?;
            let idx = segment as usize;
            self.versions[idx].store(0, Ordering::Release);
            self.owner_topology_ids[idx].store(topology_id, Ordering::Release);
        }
        debug!(
            node_id = self.local,
            segments = ?segments,
            "Node now owns segments"
        );
        self.print_table();
        Ok(())
    }

    /// Move blocked segments into key transfer and release waiters.
    pub fn start_key_transfer(&self, segments: &BTreeSet<SegmentId>) -> Result<()> {
        let _guard = self.ownership_lock.lock();
        for &segment in segments {
            self.states.fire(segment, SegmentEvent::StartKeyTransfer)?;
            self.release_gate(segment);
            trace!(node_id = self.local, segment, "Segment expects key transfer");
        }
        Ok(())
    }

    /// Record the end of the key pull for `segment`.
    pub fn notify_key_transfer_finished(
        &self,
        segment: SegmentId,
        expect_values: bool,
        cancelled: bool,
    ) -> Result<()> {
        let event = if cancelled {
            SegmentEvent::Cancel
        } else if expect_values {
            SegmentEvent::KeysFound
        } else {
            SegmentEvent::KeysEmpty
        };

        let _guard = self.ownership_lock.lock();
        let (previous, next) = self.states.fire(segment, event)?;
        self.release_gate(segment);
        trace!(
            node_id = self.local,
            segment,
            ?previous,
            ?next,
            "Finished key transfer"
        );
        Ok(())
    }

    /// Wait until `segment` is no longer blocked.
    ///
    /// Fails if the segment left `Blocked` without becoming a live owner.
    pub async fn await_segment(&self, segment: SegmentId) -> Result<()> {
        let gate = self.gates.get(segment as usize).ok_or(Error::NotOwner {
            segment,
            node: self.local,
        })?;
        let mut rx = gate.subscribe();
        rx.wait_for(|blocked| !*blocked)
            .await
            .map_err(|_| Error::Stopping)?;

        if self.values.borrow().stopped {
            return Err(Error::Stopping);
        }
        match self.states.get(segment) {
            state if state.is_live_owner() => Ok(()),
            SegmentState::Blocked => Err(Error::SegmentBlocked(segment)),
            _ => Err(Error::NotOwner {
                segment,
                node: self.local,
            }),
        }
    }

    /// Mark that values will be transferred for `topology_id`.
    pub fn set_values_transfer_topology(&self, topology_id: TopologyId) {
        trace!(node_id = self.local, topology_id, "Node will transfer values");
        self.values.send_modify(|p| p.transferring = true);
    }

    /// All values of the current topology arrived: every segment still in
    /// transfer becomes owned.
    pub fn notify_value_transfer_finished(&self) {
        let topology_id = self.topology_id();
        {
            let _guard = self.ownership_lock.lock();
            for segment in self.states.segments_in(SegmentState::ValueTransfer) {
                let received = self.states.fire_if(
                    segment,
                    SegmentState::ValueTransfer,
                    SegmentEvent::ValuesReceived,
                );
                if !matches!(received, Ok(true)) {
                    trace!(node_id = self.local, segment, "Segment left value transfer meanwhile");
                }
            }
            for state in [SegmentState::Blocked, SegmentState::KeyTransfer] {
                for segment in self.states.segments_in(state) {
                    warn!(
                        node_id = self.local,
                        segment,
                        topology_id,
                        ?state,
                        "Value transfer finished before key transfer, cancelling segment"
                    );
                    if matches!(self.states.fire_if(segment, state, SegmentEvent::Cancel), Ok(true)) {
                        self.release_gate(segment);
                    }
                }
            }
        }

        self.values.send_modify(|p| {
            p.values_topology = p.values_topology.max(topology_id);
            p.transferring = false;
        });
        debug!(
            node_id = self.local,
            topology_id, "Node received values for all segments"
        );
        self.print_table();
    }

    /// Whether a value transfer is in progress.
    pub fn is_transferring_values(&self) -> bool {
        self.values.borrow().transferring
    }

    /// Wait until values for `topology_id` (or a later one) arrived.
    ///
    /// Resolves immediately when no value transfer is running.
    pub async fn values_future(&self, topology_id: TopologyId) -> Result<()> {
        let mut rx = self.values.subscribe();
        let progress = *rx
            .wait_for(|p| p.stopped || !p.transferring || p.values_topology >= topology_id)
            .await
            .map_err(|_| Error::Stopping)?;
        if progress.stopped {
            return Err(Error::Stopping);
        }
        Ok(())
    }

    /// Schedule invalidation of older copies of `key` on other members.
    pub fn schedule_key_invalidation(&self, key: Key, version: EntryVersion, removal: bool) {
        self.invalidations.schedule(key, version, removal);
    }

    /// Send pending invalidations now; `false` if nothing was pending.
    pub fn flush(&self) -> bool {
        self.invalidations.flush()
    }

    /// Wait until invalidation broadcasts in flight completed.
    pub async fn quiesce_invalidations(&self) {
        self.invalidations.quiesce().await;
    }

    /// Pending (regular, removal) invalidation counts.
    pub fn pending_invalidations(&self) -> (usize, usize) {
        self.invalidations.pending()
    }

    /// Drop all pending invalidations.
    pub fn clear_invalidations(&self) {
        self.invalidations.clear();
    }

    /// Stop retries, drop pending invalidations and fail every waiter.
    pub fn stop(&self) {
        trace!(node_id = self.local, "Stopping version manager");
        self.values.send_modify(|p| {
            p.stopped = true;
            p.values_topology = TopologyId::MAX;
        });
        self.invalidations.stop();
        self.clear_invalidations();
        self.installed.send_replace(TopologyId::MAX);
        for gate in &self.gates {
            gate.send_replace(false);
        }
    }

    /// Render the segment table.
    pub fn segment_table(&self) -> String {
        format!("Segments for node {}:{}", self.local, self.states.render())
    }

    fn release_gate(&self, segment: SegmentId) {
        if let Some(gate) = self.gates.get(segment as usize) {
            gate.send_if_modified(|blocked| std::mem::replace(blocked, false));
        }
    }

    fn print_table(&self) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!("{}", self.segment_table());
        }
    }
}
