//! Batched, retried invalidation broadcasts.
//!
//! ```text
//!  schedule(k, v, removal)          flush (threshold or forced)
//!        │ read lock                      │ write lock: swap in empty batch
//!        ▼                                ▼
//!  ┌───────────┐  broadcast ok   ┌───────────────┐  broadcast ok
//!  │ scheduled │ ──────────────▶ │    removed    │ ──────────────▶ local removal
//!  └───────────┘  (retry forever)└───────────────┘  (retry forever)
//! ```
//!
//! Removal records only reach the second batch after the first broadcast
//! succeeded, so tombstones are deleted once every member dropped older
//! copies.

use crate::cache::container::DataContainer;
use crate::metrics::ScatteredMetrics;
use crate::network::{expect_all_acks, Command, Transport};
use crate::types::{EntryVersion, InvalidationRecord, Key};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Collects invalidation records and broadcasts them in batches.
#[derive(Debug)]
pub struct InvalidationBatcher {
    scheduled: RwLock<DashMap<Key, InvalidationRecord>>,
    removed: RwLock<DashMap<Key, EntryVersion>>,
    batch_size: usize,
    retry_delay: Duration,
    transport: Arc<dyn Transport>,
    container: Arc<DataContainer>,
    metrics: Arc<ScatteredMetrics>,
    cancellation: CancellationToken,
    /// Number of broadcast tasks still running.
    in_flight: watch::Sender<usize>,
}

impl InvalidationBatcher {
    /// Create a new batcher.
    pub fn new(
        batch_size: usize,
        retry_delay: Duration,
        transport: Arc<dyn Transport>,
        container: Arc<DataContainer>,
        metrics: Arc<ScatteredMetrics>,
    ) -> Self {
        Self {
            scheduled: RwLock::new(DashMap::with_capacity(batch_size)),
            removed: RwLock::new(DashMap::with_capacity(batch_size)),
            batch_size: batch_size.max(1),
            retry_delay,
            transport,
            container,
            metrics,
            cancellation: CancellationToken::new(),
            in_flight: watch::channel(0).0,
        }
    }

    /// Record that copies of `key` older than `version` are stale.
    ///
    /// Triggers a flush once the pending batch reaches the batch size.
    pub fn schedule(self: &Arc<Self>, key: Key, version: EntryVersion, removal: bool) {
        let record = InvalidationRecord {
            key: key.clone(),
            version,
            removal,
        };
        let full = {
            let batch = self.scheduled.read();
            batch
                .entry(key)
                .and_modify(|existing| *existing = existing.clone().merge(record.clone()))
                .or_insert(record);
            batch.len() >= self.batch_size
        };
        if full {
            self.try_regular(false);
        }
    }

    /// Start sending whatever is pending, regardless of the batch size.
    ///
    /// Returns `false` if both batches were empty.
    pub fn flush(self: &Arc<Self>) -> bool {
        if self.try_regular(true) {
            return true;
        }
        self.try_removed(true)
    }

    /// Drop both pending batches without sending them.
    pub fn clear(&self) {
        *self.scheduled.write() = DashMap::with_capacity(self.batch_size);
        *self.removed.write() = DashMap::with_capacity(self.batch_size);
    }

    /// Pending (regular, removal) record counts.
    pub fn pending(&self) -> (usize, usize) {
        (self.scheduled.read().len(), self.removed.read().len())
    }

    /// Wait until no broadcast task is running.
    pub async fn quiesce(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Halt retries of in-flight broadcasts.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    fn try_regular(self: &Arc<Self>, force: bool) -> bool {
        let batch = {
            let mut guard = self.scheduled.write();
            // a concurrent flush may have taken the batch already
            if guard.is_empty() || (!force && guard.len() < self.batch_size) {
                return false;
            }
            std::mem::replace(&mut *guard, DashMap::with_capacity(self.batch_size))
        };

        let records: Vec<InvalidationRecord> = batch.into_iter().map(|(_, r)| r).collect();
        self.spawn(move |this| async move { this.send_regular(records, force).await });
        true
    }

    fn try_removed(self: &Arc<Self>, force: bool) -> bool {
        let batch = {
            let mut guard = self.removed.write();
            if guard.is_empty() || (!force && guard.len() < self.batch_size) {
                return false;
            }
            std::mem::replace(&mut *guard, DashMap::with_capacity(self.batch_size))
        };

        let pairs: Vec<(Key, EntryVersion)> = batch.into_iter().collect();
        self.spawn(move |this| async move { this.send_removed(pairs).await });
        true
    }

    fn spawn<F, Fut>(self: &Arc<Self>, task: F)
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.in_flight.send_modify(|n| *n += 1);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            task(Arc::clone(&this)).await;
            this.in_flight.send_modify(|n| *n -= 1);
        });
    }

    async fn send_regular(self: Arc<Self>, records: Vec<InvalidationRecord>, force: bool) {
        let pairs: Vec<(Key, EntryVersion)> = records
            .iter()
            .map(|r| (r.key.clone(), r.version))
            .collect();
        let command = Command::invalidate_versions(highest_topology(&pairs), &pairs, false);

        if !self.broadcast_until_sent(command).await {
            return;
        }
        self.metrics.invalidation_batches.inc();
        debug!(keys = pairs.len(), "Invalidation batch sent");

        let removals: Vec<&InvalidationRecord> = records.iter().filter(|r| r.removal).collect();
        if removals.is_empty() && !force {
            return;
        }

        let full = {
            let batch = self.removed.read();
            for record in removals {
                batch
                    .entry(record.key.clone())
                    .and_modify(|v| {
                        if *v < record.version {
                            *v = record.version;
                        }
                    })
                    .or_insert(record.version);
            }
            batch.len() >= self.batch_size
        };
        if full || force {
            self.try_removed(force);
        }
    }

    async fn send_removed(self: Arc<Self>, pairs: Vec<(Key, EntryVersion)>) {
        let command = Command::invalidate_versions(highest_topology(&pairs), &pairs, true);
        if !self.broadcast_until_sent(command).await {
            return;
        }
        self.metrics.removal_batches.inc();

        for (key, version) in &pairs {
            self.container.invalidate(key, *version, true);
        }
        debug!(keys = pairs.len(), "Removal batch sent");
    }

    /// Broadcast `command` until it succeeds; `false` if stopped first.
    async fn broadcast_until_sent(&self, command: Command) -> bool {
        loop {
            if self.cancellation.is_cancelled() {
                return false;
            }
            let result = self
                .transport
                .broadcast(command.clone())
                .await
                .and_then(expect_all_acks);
            match result {
                Ok(()) => return true,
                Err(e) => {
                    warn!(error = %e, "Failed invalidating remote copies, retrying");
                    self.metrics.invalidation_retries.inc();
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {
                    trace!("Retrying invalidation broadcast");
                }
                _ = self.cancellation.cancelled() => {
                    debug!("Invalidation retries stopped");
                    return false;
                }
            }
        }
    }
}

fn highest_topology(pairs: &[(Key, EntryVersion)]) -> u32 {
    pairs
        .iter()
        .map(|(_, v)| v.topology_id)
        .max()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::CommandKind;
    use crate::partitioning::KeyPartitioner;
    use crate::testing::InMemoryNetwork;
    use crate::types::InternalEntry;
    use bytes::Bytes;
    use test_log::test;

    const RETRY: Duration = Duration::from_millis(50);

    fn key(k: &'static str) -> Key {
        Bytes::from_static(k.as_bytes())
    }

    struct Fixture {
        network: Arc<InMemoryNetwork>,
        container: Arc<DataContainer>,
        metrics: Arc<ScatteredMetrics>,
        batcher: Arc<InvalidationBatcher>,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let network = InMemoryNetwork::new();
        network.add_sink(2);
        network.add_sink(3);
        let container = Arc::new(DataContainer::new(KeyPartitioner::new(4)));
        let metrics = Arc::new(ScatteredMetrics::new());
        let batcher = Arc::new(InvalidationBatcher::new(
            batch_size,
            RETRY,
            network.transport(1),
            container.clone(),
            metrics.clone(),
        ));
        Fixture {
            network,
            container,
            metrics,
            batcher,
        }
    }

    fn is_removal(command: &Command) -> bool {
        matches!(command, Command::InvalidateVersions { removal: true, .. })
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_removal_batch_waits_for_acknowledged_regular_batch() {
        let f = fixture(10);
        let deleted = EntryVersion::new(1, 4);
        f.container.put_local(key("gone"), InternalEntry::tombstone(deleted));
        f.network
            .faults()
            .fail_next(3, CommandKind::InvalidateVersions, 1);

        f.batcher.schedule(key("gone"), deleted, true);
        f.batcher.schedule(key("kept"), EntryVersion::new(1, 2), false);
        assert!(f.batcher.flush());
        f.batcher.quiesce().await;

        let log = f.network.commands_of(CommandKind::InvalidateVersions);
        let (removals, regular): (Vec<_>, Vec<_>) = log.iter().partition(|c| is_removal(&c.command));
        // one failed attempt, then a retry reaching both members
        assert_eq!(regular.len(), 4);
        assert_eq!(regular.iter().filter(|c| c.completed_at.is_none()).count(), 1);
        assert_eq!(f.metrics.invalidation_retries.get(), 1);

        let acked = regular.iter().filter_map(|c| c.completed_at).max().unwrap();
        assert_eq!(removals.len(), 2);
        assert!(removals.iter().all(|c| c.sent_at > acked));
        assert!(removals.iter().all(|c| c.command.invalidated() == vec![(key("gone"), deleted)]));

        assert!(f.container.get(b"gone").is_none());
        assert_eq!(f.metrics.invalidation_batches.get(), 1);
        assert_eq!(f.metrics.removal_batches.get(), 1);
        assert_eq!(f.batcher.pending(), (0, 0));
    }

    #[test(tokio::test)]
    async fn test_full_batch_sends_itself() {
        let f = fixture(3);
        f.batcher.schedule(key("a"), EntryVersion::new(1, 1), false);
        f.batcher.schedule(key("a"), EntryVersion::new(1, 5), false);
        f.batcher.schedule(key("b"), EntryVersion::new(1, 2), false);
        // the same key counts once
        assert_eq!(f.batcher.pending(), (2, 0));

        f.batcher.schedule(key("c"), EntryVersion::new(1, 3), false);
        f.batcher.quiesce().await;
        assert_eq!(f.batcher.pending(), (0, 0));

        let sent = f.network.commands_of(CommandKind::InvalidateVersions);
        assert_eq!(sent.len(), 2);
        let mut invalidated = sent[0].command.invalidated();
        invalidated.sort();
        assert_eq!(
            invalidated,
            vec![
                (key("a"), EntryVersion::new(1, 5)),
                (key("b"), EntryVersion::new(1, 2)),
                (key("c"), EntryVersion::new(1, 3)),
            ]
        );

        f.batcher.schedule(key("d"), EntryVersion::new(1, 4), false);
        assert_eq!(f.batcher.pending(), (1, 0));
    }

    #[test(tokio::test)]
    async fn test_clear_drops_pending_records() {
        let f = fixture(10);
        f.batcher.schedule(key("a"), EntryVersion::new(1, 1), true);
        f.batcher.clear();

        assert_eq!(f.batcher.pending(), (0, 0));
        assert!(!f.batcher.flush());
        assert!(f.network.call_log().is_empty());
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_stop_halts_retries() {
        let f = fixture(10);
        let deleted = EntryVersion::new(1, 1);
        f.container.put_local(key("gone"), InternalEntry::tombstone(deleted));
        f.network
            .faults()
            .fail_next(2, CommandKind::InvalidateVersions, 100);

        f.batcher.schedule(key("gone"), deleted, true);
        assert!(f.batcher.flush());
        tokio::time::sleep(RETRY * 3).await;
        f.batcher.stop();
        f.batcher.quiesce().await;

        assert!(f.metrics.invalidation_retries.get() >= 2);
        assert_eq!(f.metrics.removal_batches.get(), 0);
        assert!(f.container.get(b"gone").unwrap().is_tombstone());
    }
}
