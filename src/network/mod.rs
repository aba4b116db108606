//! Network layer: wire commands and the transport seam.

pub mod rpc;
pub mod transport;

pub use rpc::{Command, CommandKind, KeyEntry, Response, TransferEntry};
pub use transport::{expect_all_acks, CommandHandler, Transport};
