//! Backup replication followed by invalidation of the other copies.

use crate::config::StateTransferConfig;
use crate::error::Error;
use crate::metrics::ScatteredMetrics;
use crate::network::{expect_all_acks, Command, TransferEntry, Transport};
use crate::types::{NodeId, TopologyId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{trace, warn};

/// Pushes entries to the backup member and then invalidates them elsewhere.
///
/// The invalidation of a chunk is only sent once its backup call returned,
/// so no window exists in which neither the backup nor any other member
/// holds the entry.
#[derive(Debug)]
pub struct BackupReplicator {
    local_node: NodeId,
    transport: Arc<dyn Transport>,
    metrics: Arc<ScatteredMetrics>,
    chunk_size: usize,
    timeout: Duration,
    permits: Semaphore,
}

impl BackupReplicator {
    /// Create a replicator.
    pub fn new(
        config: &StateTransferConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<ScatteredMetrics>,
    ) -> Self {
        Self {
            local_node: transport.local_node(),
            transport,
            metrics,
            chunk_size: config.chunk_size.max(1),
            timeout: config.timeout,
            permits: Semaphore::new(config.max_outstanding_chunks.max(1)),
        }
    }

    /// Back up `entries` on `backup` chunk by chunk, invalidating each
    /// chunk on `targets` once its backup completed.
    ///
    /// The local node and the backup are never invalidated. A failed
    /// backup is counted and logged; the invalidation still goes out.
    /// Returns whether every backup call was acknowledged.
    pub async fn backup_then_invalidate(
        &self,
        topology_id: TopologyId,
        backup: Option<NodeId>,
        entries: Vec<TransferEntry>,
        targets: &[NodeId],
    ) -> bool {
        let targets: Vec<NodeId> = targets
            .iter()
            .copied()
            .filter(|n| *n != self.local_node && Some(*n) != backup)
            .collect();

        let mut all_backed_up = true;
        for chunk in entries.chunks(self.chunk_size) {
            let Ok(_permit) = self.permits.acquire().await else {
                return false;
            };
            self.metrics.outstanding_chunks.inc();

            if let Some(backup) = backup {
                all_backed_up &= self.backup(topology_id, backup, chunk.to_vec()).await;
            }
            if !targets.is_empty() {
                self.invalidate(topology_id, chunk, &targets).await;
            }

            self.metrics.outstanding_chunks.dec();
        }
        all_backed_up
    }

    async fn backup(&self, topology_id: TopologyId, backup: NodeId, entries: Vec<TransferEntry>) -> bool {
        let count = entries.len();
        let command = Command::BackupPut {
            topology_id,
            entries,
        };
        let result = match tokio::time::timeout(self.timeout, self.transport.invoke(backup, command)).await {
            Ok(Ok(response)) => response.expect_ack(),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout),
        };
        match result {
            Ok(()) => {
                trace!(backup, count, topology_id, "Backed up entries");
                true
            }
            Err(e) => {
                self.metrics.backup_failures.inc();
                warn!(backup, count, topology_id, error = %e, "Failed to back up entries");
                false
            }
        }
    }

    async fn invalidate(&self, topology_id: TopologyId, chunk: &[TransferEntry], targets: &[NodeId]) {
        let versions: Vec<_> = chunk.iter().map(|e| (e.key.clone(), e.version)).collect();
        let command = Command::invalidate_versions(topology_id, &versions, true);
        let call = self.transport.invoke_many(targets, command);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(responses)) => {
                if let Err(e) = expect_all_acks(responses) {
                    warn!(?targets, error = %e, "Invalidation after transfer was rejected");
                }
            }
            Ok(Err(e)) => warn!(?targets, error = %e, "Failed to invalidate after transfer"),
            Err(_) => warn!(?targets, "Invalidation after transfer timed out"),
        }
    }
}
