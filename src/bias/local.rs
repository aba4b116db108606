//! Leases held by this node for keys owned elsewhere.

use crate::types::{Key, SegmentId};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// A read lease on one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalBias {
    /// When the lease was granted or last renewed.
    pub acquired: Instant,
    /// Last read served from the lease.
    pub last_access: Instant,
}

impl LocalBias {
    fn new(now: Instant) -> Self {
        Self {
            acquired: now,
            last_access: now,
        }
    }

    /// Whether the lease was used since it was granted or renewed.
    pub fn read_since_acquired(&self) -> bool {
        self.last_access > self.acquired
    }
}

/// A request in flight that may come back with a lease.
///
/// Revoking the key while the request is in flight voids the lease the
/// response would grant.
#[derive(Debug)]
#[must_use = "a pending lease must be finished"]
pub struct PendingBias {
    key: Key,
    ticket: u64,
}

impl PendingBias {
    /// The key the lease is for.
    pub fn key(&self) -> &Key {
        &self.key
    }
}

/// Concurrent table of local leases.
#[derive(Debug)]
pub struct LocalBiasTable {
    biases: DashMap<Key, LocalBias>,
    /// Latest ticket of each key with a request in flight.
    pending: DashMap<Key, u64>,
    tickets: AtomicU64,
    lifespan: Duration,
}

impl LocalBiasTable {
    /// Create an empty table.
    pub fn new(lifespan: Duration) -> Self {
        Self {
            biases: DashMap::new(),
            pending: DashMap::new(),
            tickets: AtomicU64::new(0),
            lifespan,
        }
    }

    /// Announce a request that may grant a lease on `key`.
    pub fn begin(&self, key: Key) -> PendingBias {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending.insert(key.clone(), ticket);
        PendingBias { key, ticket }
    }

    /// Settle a request; records the lease when `granted` and the key was
    /// not revoked since [`begin`](Self::begin).
    ///
    /// Only the latest request of a key may record a lease.
    pub fn finish(&self, pending: PendingBias, granted: bool) -> bool {
        let PendingBias { key, ticket } = pending;
        // the pending entry stays locked while the lease is recorded, so a
        // concurrent revocation removes the lease right after
        let recorded = match self.pending.get(&key) {
            Some(current) if granted && *current == ticket => {
                self.biases
                    .insert(key.clone(), LocalBias::new(Instant::now()));
                true
            }
            _ => false,
        };
        self.pending.remove_if(&key, |_, t| *t == ticket);
        recorded
    }

    /// Whether a valid lease exists; refreshes its last access.
    ///
    /// Expired leases are dropped on the way.
    pub fn check(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        if let Some(mut bias) = self.biases.get_mut(key) {
            if now.duration_since(bias.acquired) < self.lifespan {
                bias.last_access = now;
                return true;
            }
        }
        self.biases
            .remove_if(key, |_, b| now.duration_since(b.acquired) >= self.lifespan);
        false
    }

    /// Lease of a key, without touching it.
    pub fn get(&self, key: &[u8]) -> Option<LocalBias> {
        self.biases.get(key).map(|b| *b)
    }

    /// Drop the lease of a key and void requests in flight for it.
    pub fn remove(&self, key: &[u8]) -> bool {
        self.pending.remove(key);
        self.biases.remove(key).is_some()
    }

    /// Drop leases of keys in `segments`.
    pub fn remove_segments<F>(&self, segments: &BTreeSet<SegmentId>, segment_of: F) -> usize
    where
        F: Fn(&[u8]) -> SegmentId,
    {
        self.pending
            .retain(|key, _| !segments.contains(&segment_of(key)));
        let before = self.biases.len();
        self.biases
            .retain(|key, _| !segments.contains(&segment_of(key)));
        before.saturating_sub(self.biases.len())
    }

    /// Drop every lease.
    pub fn clear(&self) {
        self.pending.clear();
        self.biases.clear();
    }

    /// Number of leases.
    pub fn len(&self) -> usize {
        self.biases.len()
    }

    /// Whether there are no leases.
    pub fn is_empty(&self) -> bool {
        self.biases.is_empty()
    }

    /// Drop expired leases and return the keys that need renewal.
    ///
    /// A lease needs renewal once it is older than `renewal_threshold` and
    /// was read since it was acquired. Returns `(expired, to_renew)`.
    pub fn sweep(&self, renewal_threshold: Duration) -> (usize, Vec<Key>) {
        let now = Instant::now();
        let mut expired = 0;
        let mut to_renew = Vec::new();

        self.biases.retain(|key, bias| {
            let age = now.duration_since(bias.acquired);
            if age >= self.lifespan {
                expired += 1;
                return false;
            }
            if age >= renewal_threshold && bias.read_since_acquired() {
                to_renew.push(key.clone());
            }
            true
        });
        (expired, to_renew)
    }

    /// Mark leases as renewed now.
    pub fn renewed(&self, keys: &[Key]) {
        let now = Instant::now();
        for key in keys {
            if let Some(mut bias) = self.biases.get_mut(key) {
                bias.acquired = now;
            }
        }
    }
}
