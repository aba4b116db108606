//! Partitioning of the key space into segments and the topologies that
//! assign them to nodes.
//!
//! ```text
//! key ──XxHash64──▶ segment ──Topology.segment_owners──▶ owner
//!                                     │
//!                     members (ring) ─┴─▶ next_member = backup target
//! ```
//!
//! Every segment has exactly one owner in a stable topology. When the
//! orchestrator installs a new topology each node receives a
//! [`TopologyChange`] listing the segments it gains and loses.

mod partitioner;
mod topology;

pub use partitioner::KeyPartitioner;
pub use topology::{Topology, TopologyChange};
