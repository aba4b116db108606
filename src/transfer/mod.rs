//! State transfer between segment owners.
//!
//! ```text
//!   new owner (consumer)                         other members (provider)
//!   ────────────────────                         ────────────────────────
//!   register gained segments (Blocked)
//!   ConfirmRevokedSegments ───────────────────▶  wait for topology, drop biases
//!   start key transfer (KeyTransfer)
//!   RequestKeys (cursor, per member) ─────────▶  sorted page of held keys
//!   merge remote pointers
//!   keys done (ValueTransfer / Owned)
//!   RequestValues (per holder, bounded) ──────▶  values or tombstones
//!   apply, invalidate elsewhere
//!   values done (Owned)
//!
//!   previous owner: BackupPut to next member, then invalidate the rest
//! ```

mod backup;
mod consumer;
mod provider;

pub use backup::BackupReplicator;
pub use consumer::StateConsumer;
pub use provider::StateProvider;
