//! In-memory transport connecting nodes of one process.

use super::faults::{FaultDecision, FaultInjector};
use crate::error::{Error, NetworkError, Result};
use crate::network::{Command, CommandHandler, CommandKind, Response, Transport};
use crate::types::NodeId;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinSet;
use tracing::trace;

/// One command recorded by the network.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Sender.
    pub origin: NodeId,
    /// Receiver.
    pub target: NodeId,
    /// The command.
    pub command: Command,
    /// Sequence number when the command was sent.
    pub sent_at: u64,
    /// Sequence number when the response arrived; `None` if it failed or
    /// is still in flight.
    pub completed_at: Option<u64>,
}

/// Simulated network delivering commands to registered handlers.
///
/// Handlers are held weakly so a dropped node behaves like a leaver.
#[derive(Default)]
pub struct InMemoryNetwork {
    handlers: RwLock<BTreeMap<NodeId, Weak<dyn CommandHandler>>>,
    /// Keeps handlers that nothing else owns alive.
    owned: Mutex<Vec<Arc<dyn CommandHandler>>>,
    log: Mutex<Vec<CallRecord>>,
    sequence: AtomicU64,
    faults: FaultInjector,
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("nodes", &self.nodes())
            .finish()
    }
}

impl InMemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport used by `node` to talk to the network.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<dyn Transport> {
        Arc::new(NetworkTransport {
            local: node,
            network: Arc::clone(self),
        })
    }

    /// Register the handler of `node`.
    pub fn register(&self, node: NodeId, handler: Weak<dyn CommandHandler>) {
        self.handlers.write().insert(node, handler);
    }

    /// Register a member that acknowledges everything.
    pub fn add_sink(&self, node: NodeId) {
        let sink: Arc<dyn CommandHandler> = Arc::new(AckSink);
        self.register(node, Arc::downgrade(&sink));
        self.owned.lock().push(sink);
    }

    /// Remove `node`; calls to it fail with `NodeLeft`.
    pub fn remove(&self, node: NodeId) {
        self.handlers.write().remove(&node);
    }

    /// Registered nodes.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.handlers.read().keys().copied().collect()
    }

    /// Fault injector.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Every command sent so far, in send order.
    pub fn call_log(&self) -> Vec<CallRecord> {
        self.log.lock().clone()
    }

    /// Commands of `kind` sent so far.
    pub fn commands_of(&self, kind: CommandKind) -> Vec<CallRecord> {
        self.log
            .lock()
            .iter()
            .filter(|c| c.command.kind() == kind)
            .cloned()
            .collect()
    }

    /// Forget the recorded commands.
    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Deliver `command` to `target`.
    ///
    /// Commands and responses cross the network in their wire encoding.
    async fn deliver(&self, origin: NodeId, target: NodeId, command: Command) -> Result<Response> {
        let kind = command.kind();
        let sent_at = {
            let mut log = self.log.lock();
            let sent_at = self.next_sequence();
            log.push(CallRecord {
                origin,
                target,
                command: command.clone(),
                sent_at,
                completed_at: None,
            });
            sent_at
        };
        let request = command.to_bytes()?;

        if let Some(latency) = self.faults.latency_for(kind) {
            tokio::time::sleep(latency).await;
        }

        match self.faults.decide(origin, target, kind) {
            FaultDecision::Deliver => {}
            FaultDecision::Fail => {
                trace!(origin, target, ?kind, "Injected failure");
                return Err(Error::Network(NetworkError::SendFailed(format!(
                    "injected failure of {:?} to {}",
                    kind, target
                ))));
            }
            FaultDecision::Partitioned => {
                return Err(Error::Network(NetworkError::Unreachable(target)));
            }
        }

        let handler = self
            .handlers
            .read()
            .get(&target)
            .and_then(Weak::upgrade)
            .ok_or(Error::Network(NetworkError::NodeLeft(target)))?;

        let response = handler.handle(origin, Command::from_bytes(&request)?).await;
        let reply = response.to_bytes()?;
        let completed = self.next_sequence();
        if let Some(record) = self
            .log
            .lock()
            .iter_mut()
            .rev()
            .find(|r| r.sent_at == sent_at)
        {
            record.completed_at = Some(completed);
        }
        Response::from_bytes(&reply)
    }
}

/// Transport handle of one node.
#[derive(Debug)]
struct NetworkTransport {
    local: NodeId,
    network: Arc<InMemoryNetwork>,
}

#[async_trait]
impl Transport for NetworkTransport {
    fn local_node(&self) -> NodeId {
        self.local
    }

    async fn invoke(&self, target: NodeId, command: Command) -> Result<Response> {
        self.network.deliver(self.local, target, command).await
    }

    async fn broadcast(&self, command: Command) -> Result<HashMap<NodeId, Response>> {
        let targets: Vec<NodeId> = self
            .network
            .nodes()
            .into_iter()
            .filter(|n| *n != self.local)
            .collect();

        let mut tasks = JoinSet::new();
        for target in targets {
            let network = Arc::clone(&self.network);
            let command = command.clone();
            let local = self.local;
            tasks.spawn(async move { (target, network.deliver(local, target, command).await) });
        }

        let mut responses = HashMap::new();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let (target, result) =
                joined.map_err(|e| Error::Network(NetworkError::SendFailed(e.to_string())))?;
            match result {
                Ok(response) => {
                    responses.insert(target, response);
                }
                Err(Error::Network(NetworkError::NodeLeft(_))) => {}
                Err(e) => failure = Some(e),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(responses),
        }
    }
}

/// Member that acknowledges every command.
#[derive(Debug)]
struct AckSink;

#[async_trait]
impl CommandHandler for AckSink {
    async fn handle(&self, _origin: NodeId, _command: Command) -> Response {
        Response::Ack
    }
}
