//! Consistency core of a scattered distributed cache.
//!
//! In a scattered cache every key has exactly one owner per topology and
//! other nodes may keep cached copies. This crate provides the pieces that
//! keep those copies coherent:
//! - **Segment versions**: the owner issues `(topology, counter)` versions
//!   per segment, ordered across topology changes
//! - **Invalidations**: batched broadcasts drop copies older than a write
//! - **Read biases**: leases that let a non-owner serve reads locally until
//!   the owner revokes them before a conflicting write returns
//! - **State transfer**: a new owner pulls keys first, values later, and
//!   accepts writes while values are still on their way
//!
//! # Example
//!
//! ```rust,ignore
//! use scattered::{ScatteredConfig, ScatteredNode, Topology};
//! use std::sync::Arc;
//!
//! // `transport` implements `scattered::Transport` for node 1
//! let node = ScatteredNode::new(ScatteredConfig::new(1), transport)?;
//! node.start();
//!
//! node.install_topology(Arc::new(Topology::round_robin(1, vec![1, 2, 3], 256)), false)?;
//!
//! // owner-side write on behalf of node 2
//! let outcome = node.write(2, "user:123".into(), "Alice".into()).await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  interceptors / orchestrator                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ScatteredNode                        │
//! │  • write(origin, key, value) / remove(origin, key)          │
//! │  • read(key)                                                │
//! │  • on_topology_change(change)                               │
//! └─────────────────────────────────────────────────────────────┘
//!          │                  │                    │
//!          ▼                  ▼                    ▼
//! ┌────────────────┐  ┌───────────────┐  ┌───────────────────┐
//! │ VersionManager │  │  BiasManager  │  │ StateConsumer /   │
//! │ + invalidation │  │ local/remote  │  │ StateProvider     │
//! └────────────────┘  └───────────────┘  └───────────────────┘
//!          │                  │                    │
//!          └──────────────────┼────────────────────┘
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            DataContainer           Transport (trait)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Writes**: applied on the owner; a write returns only after every
//!   other biased node dropped its bias for the key
//! - **Reads**: on the owner, or locally under a valid bias
//! - **Topology changes**: a segment is never `Owned` by a node that did
//!   not finish pulling its keys

pub mod bias;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod partitioning;
pub mod testing;
pub mod transfer;
pub mod types;
pub mod versioning;

// Re-export main types for convenience
pub use cache::{ScatteredNode, WriteOutcome};
pub use config::{BiasAcquisition, BiasConfig, ScatteredConfig, StateTransferConfig};
pub use error::{Error, NetworkError, Result};
pub use types::{EntryVersion, InternalEntry, Key, NodeId, SegmentId, TopologyId};

// Re-export component types
pub use bias::{BiasManager, BiasRevocation, PendingBias};
pub use cache::container::DataContainer;
pub use transfer::{BackupReplicator, StateConsumer, StateProvider};
pub use versioning::{SegmentState, VersionManager};

// Re-export network types
pub use network::{Command, CommandHandler, CommandKind, Response, TransferEntry, Transport};

// Re-export partitioning types
pub use partitioning::{KeyPartitioner, Topology, TopologyChange};

// Re-export metrics types
pub use metrics::{Counter, Gauge, MetricsSnapshot, ScatteredMetrics};

// Re-export testing types
pub use testing::{FaultInjector, InMemoryNetwork, TestCluster};
