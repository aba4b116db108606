//! Read biases (leases).
//!
//! A bias lets a non-owner serve a cached read without contacting the owner.
//! The owner remembers who is biased for each key and revokes the bias
//! before a conflicting write returns.
//!
//! ```text
//!   reader (biased)                         owner
//!  ┌──────────────────┐   RenewBias    ┌──────────────────────┐
//!  │ LocalBiasTable   │ ─────────────▶ │ RemoteBiasTable      │
//!  │  key -> lease    │                │  key -> biased nodes │
//!  │                  │ ◀───────────── │  + one in-flight     │
//!  └──────────────────┘   RevokeBias   │    revocation        │
//!                                      └──────────────────────┘
//! ```

mod local;
mod manager;
mod remote;

pub use local::{LocalBias, LocalBiasTable, PendingBias};
pub use manager::BiasManager;
pub use remote::{BiasRevocation, RemoteBias, RemoteBiasTable};
