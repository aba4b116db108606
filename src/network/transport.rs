//! Transport abstraction consumed by the scattered core.
//!
//! The real transport (connections, encoding, timeouts) lives outside this
//! crate; components only see point-to-point request/response, a
//! leaver-tolerant multi-target call and a best-effort broadcast.

use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{Command, Response};
use crate::types::NodeId;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use tracing::debug;

/// Request/response transport between members.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug + 'static {
    /// This node's ID.
    fn local_node(&self) -> NodeId;

    /// Send a command to one node and wait for its response.
    async fn invoke(&self, target: NodeId, command: Command) -> Result<Response>;

    /// Send a command to every other current member.
    ///
    /// Members that leave while the call is in flight are skipped.
    async fn broadcast(&self, command: Command) -> Result<HashMap<NodeId, Response>>;

    /// Send a command to several nodes at once, skipping those that left.
    ///
    /// Fails with the first error other than a leaver once every call
    /// completed.
    async fn invoke_many(
        &self,
        targets: &[NodeId],
        command: Command,
    ) -> Result<HashMap<NodeId, Response>> {
        let calls = targets.iter().map(|&target| {
            let command = command.clone();
            async move { (target, self.invoke(target, command).await) }
        });

        let mut responses = HashMap::with_capacity(targets.len());
        let mut failure = None;
        for (target, result) in join_all(calls).await {
            match result {
                Ok(response) => {
                    responses.insert(target, response);
                }
                Err(Error::Network(NetworkError::NodeLeft(node))) => {
                    debug!(node_id = node, "Ignoring response of a leaver");
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(responses),
        }
    }
}

/// Handler for commands arriving from other nodes.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Handle a command sent by `origin`.
    async fn handle(&self, origin: NodeId, command: Command) -> Response;
}

/// Fail if any collected response is not an ack.
pub fn expect_all_acks(responses: HashMap<NodeId, Response>) -> Result<()> {
    for (_, response) in responses {
        response.expect_ack()?;
    }
    Ok(())
}
