//! Owner-side bookkeeping of nodes biased for local keys.

use crate::metrics::ScatteredMetrics;
use crate::network::{Command, Response, Transport};
use crate::types::{Key, NodeId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Nodes biased for one key.
#[derive(Debug, Clone)]
pub struct RemoteBias {
    /// Nodes trusting their cached copy; at most one outside a revocation.
    pub biased: Vec<NodeId>,
    /// When the current bias was granted or refreshed.
    pub acquired: Instant,
    revocation: Option<Revocation>,
}

impl RemoteBias {
    fn granted(node: NodeId, now: Instant) -> Self {
        Self {
            biased: vec![node],
            acquired: now,
            revocation: None,
        }
    }

    /// Nodes being revoked, if a revocation is running.
    pub fn revoking(&self) -> Option<&[NodeId]> {
        self.revocation.as_ref().map(|r| r.revoking.as_slice())
    }

    /// Node that becomes biased once the revocation succeeds.
    pub fn pending_new_node(&self) -> Option<NodeId> {
        self.revocation.as_ref().and_then(|r| r.new_node)
    }
}

#[derive(Debug, Clone)]
struct Revocation {
    revoking: Vec<NodeId>,
    new_node: Option<NodeId>,
    done: watch::Receiver<Option<bool>>,
}

/// Shared completion of an in-flight revocation.
#[derive(Debug, Clone)]
pub struct BiasRevocation {
    done: watch::Receiver<Option<bool>>,
}

impl BiasRevocation {
    /// Wait for the revocation; `true` if every biased node dropped its bias.
    pub async fn wait(mut self) -> bool {
        match self.done.wait_for(|d| d.is_some()).await {
            Ok(done) => done.unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Remote biases of the keys this node owns.
#[derive(Debug)]
pub struct RemoteBiasTable {
    biases: DashMap<Key, RemoteBias>,
    transport: Arc<dyn Transport>,
    metrics: Arc<ScatteredMetrics>,
    remote_timeout: Duration,
}

impl RemoteBiasTable {
    /// Create an empty table.
    pub fn new(
        transport: Arc<dyn Transport>,
        metrics: Arc<ScatteredMetrics>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            biases: DashMap::new(),
            transport,
            metrics,
            remote_timeout,
        }
    }

    /// Bias state of a key.
    pub fn get(&self, key: &[u8]) -> Option<RemoteBias> {
        self.biases.get(key).map(|b| b.value().clone())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.biases.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.biases.is_empty()
    }

    /// Grant a bias to `node` if nobody else holds one.
    ///
    /// `still_current` runs under the key's entry lock and must confirm
    /// that the value handed to `node` was not overwritten meanwhile. A
    /// write updates the container before it looks for biased nodes, so a
    /// grant either sees the new version and is refused, or is registered
    /// before the write starts its revocation.
    pub fn try_grant<F>(&self, key: Key, node: NodeId, still_current: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let now = Instant::now();
        match self.biases.entry(key) {
            Entry::Vacant(vacant) => {
                if !still_current() {
                    return false;
                }
                vacant.insert(RemoteBias::granted(node, now));
                self.metrics.bias_grants.inc();
                true
            }
            Entry::Occupied(mut occupied) => {
                let bias = occupied.get_mut();
                let free = bias.biased.is_empty() || bias.biased == [node];
                if bias.revocation.is_some() || !free || !still_current() {
                    return false;
                }
                if bias.biased.is_empty() {
                    bias.biased.push(node);
                    self.metrics.bias_grants.inc();
                }
                bias.acquired = now;
                true
            }
        }
    }

    /// Make sure nobody but `new_node` is biased for `key`.
    ///
    /// Returns `None` when no RPC is needed; otherwise a handle on the
    /// single in-flight revocation of the key, shared by concurrent callers.
    pub fn start_revoking(
        self: &Arc<Self>,
        key: Key,
        new_node: Option<NodeId>,
    ) -> Option<BiasRevocation> {
        let now = Instant::now();
        let (revoking, tx, rx) = {
            let mut occupied = match self.biases.entry(key.clone()) {
                Entry::Vacant(vacant) => {
                    if let Some(node) = new_node {
                        vacant.insert(RemoteBias::granted(node, now));
                        self.metrics.bias_grants.inc();
                    }
                    return None;
                }
                Entry::Occupied(occupied) => occupied,
            };

            let bias = occupied.get_mut();
            if let Some(revocation) = &bias.revocation {
                return Some(BiasRevocation {
                    done: revocation.done.clone(),
                });
            }

            let revoking: Vec<NodeId> = bias
                .biased
                .iter()
                .copied()
                .filter(|n| Some(*n) != new_node)
                .collect();
            if revoking.is_empty() {
                match new_node {
                    Some(node) => {
                        if bias.biased.is_empty() {
                            self.metrics.bias_grants.inc();
                        }
                        bias.biased = vec![node];
                        bias.acquired = now;
                    }
                    None => {
                        occupied.remove();
                    }
                }
                return None;
            }

            let (tx, rx) = watch::channel(None);
            bias.revocation = Some(Revocation {
                revoking: revoking.clone(),
                new_node,
                done: rx.clone(),
            });
            (revoking, tx, rx)
        };

        debug!(?revoking, ?new_node, "Revoking remote bias");
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let revoked = table.revoke(key.clone(), &revoking).await;
            table.finish_revocation(&key, &revoking, new_node, revoked);
            tx.send_replace(Some(revoked));
        });
        Some(BiasRevocation { done: rx })
    }

    async fn revoke(&self, key: Key, revoking: &[NodeId]) -> bool {
        let command = Command::RevokeBias { keys: vec![key] };
        let call = self.transport.invoke_many(revoking, command);
        match tokio::time::timeout(self.remote_timeout, call).await {
            Ok(Ok(responses)) => responses.values().all(|r| *r == Response::Ack),
            Ok(Err(e)) => {
                warn!(error = %e, ?revoking, "Failed to revoke bias");
                false
            }
            Err(_) => {
                warn!(?revoking, "Bias revocation timed out");
                false
            }
        }
    }

    fn finish_revocation(
        &self,
        key: &Key,
        revoking: &[NodeId],
        new_node: Option<NodeId>,
        revoked: bool,
    ) {
        let now = Instant::now();
        if revoked {
            self.metrics.bias_revocations.inc();
        } else {
            self.metrics.bias_revocation_failures.inc();
        }

        if let Some(mut bias) = self.biases.get_mut(key) {
            bias.revocation = None;
            if revoked {
                bias.biased.retain(|n| !revoking.contains(n));
                if let Some(node) = new_node {
                    if !bias.biased.contains(&node) {
                        bias.biased.push(node);
                        self.metrics.bias_grants.inc();
                    }
                    bias.acquired = now;
                }
            }
        }
        self.biases
            .remove_if(key, |_, b| b.biased.is_empty() && b.revocation.is_none());
    }

    /// Refresh the bias `node` already holds on `key`.
    ///
    /// Never grants a new bias; fails while the key is being revoked.
    pub fn refresh(&self, key: &[u8], node: NodeId) -> bool {
        match self.biases.get_mut(key) {
            Some(mut bias) if bias.revocation.is_none() && bias.biased.contains(&node) => {
                bias.acquired = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Keys whose bias is at least `lifespan` old and not being revoked.
    pub fn expired(&self, lifespan: Duration) -> Vec<Key> {
        let now = Instant::now();
        self.biases
            .iter()
            .filter(|b| b.revocation.is_none() && now.duration_since(b.acquired) >= lifespan)
            .map(|b| b.key().clone())
            .collect()
    }

    /// Keep only keys for which `keep` holds.
    pub fn retain<F>(&self, keep: F) -> usize
    where
        F: Fn(&[u8]) -> bool,
    {
        let before = self.biases.len();
        self.biases.retain(|key, _| keep(key));
        before.saturating_sub(self.biases.len())
    }

    /// Forget every bias.
    pub fn clear(&self) {
        self.biases.clear();
    }
}
