//! Error types for the scattered consistency core.

use crate::types::{NodeId, SegmentId, TopologyId};
use crate::versioning::{SegmentEvent, SegmentState};
use thiserror::Error;

/// Result type alias for scattered operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A version was requested for a segment this node does not own.
    #[error("segment {segment} is not owned by node {node}")]
    NotOwner { segment: SegmentId, node: NodeId },

    /// The segment is blocked until the key transfer starts; wait on its gate.
    #[error("segment {0} is currently blocked")]
    SegmentBlocked(SegmentId),

    /// The segment state machine rejected an event.
    #[error("segment {segment} cannot handle {event:?} in state {state:?}")]
    IllegalTransition {
        segment: SegmentId,
        state: SegmentState,
        event: SegmentEvent,
    },

    /// A topology update did not advance the topology id.
    #[error("updating to topology {requested} but current is {current}")]
    StaleTopology {
        requested: TopologyId,
        current: TopologyId,
    },

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// State transfer failed.
    #[error("state transfer failed: {0}")]
    Transfer(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Biased nodes could not be told to drop their bias.
    #[error("bias revocation failed")]
    RevocationFailed,

    /// The operation was cancelled, usually by a newer topology.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The component is stopping.
    #[error("component is stopping")]
    Stopping,

    /// Error reported by a remote node.
    #[error("remote error: {0}")]
    Remote(String),
}

impl Error {
    /// Errors caused by a caller that skipped the ownership guard.
    ///
    /// These are reported to the caller and never retried.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::NotOwner { .. }
                | Error::SegmentBlocked(_)
                | Error::IllegalTransition { .. }
                | Error::StaleTopology { .. }
        )
    }
}

/// Transport errors.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// The target left the cluster; leaver-tolerant collectors skip it.
    #[error("node {0} left the cluster")]
    NodeLeft(NodeId),

    /// The target did not answer.
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    /// Failed to send a command.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The remote answered with something the caller cannot use.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}
