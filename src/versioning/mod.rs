//! Segment ownership, version issuing and invalidation batching.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      VersionManager                         │
//! │  ┌──────────────────┐ ┌─────────────────┐ ┌─────────────┐  │
//! │  │  SegmentTable    │ │ version counter │ │ owner topo  │  │
//! │  │  (atomic cells)  │ │  per segment    │ │ per segment │  │
//! │  └──────────────────┘ └─────────────────┘ └─────────────┘  │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │ InvalidationBatcher: scheduled ──▶ removed ──▶ local │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```

mod invalidation;
mod manager;
mod state;

pub use invalidation::InvalidationBatcher;
pub use manager::VersionManager;
pub use state::{SegmentEvent, SegmentState, SegmentTable};
