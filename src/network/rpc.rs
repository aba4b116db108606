//! Commands exchanged between scattered nodes and their responses.

use crate::error::{Error, NetworkError, Result};
use crate::types::{EntryVersion, Key, SegmentId, TopologyId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A command sent to another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Biased reader asks the owner to extend its biases.
    RenewBias { keys: Vec<Key> },

    /// Owner tells a biased node to drop its biases; answered with ack/nack.
    RevokeBias { keys: Vec<Key> },

    /// Drop copies superseded by the given versions.
    ///
    /// Idempotent and order-independent, so it can be retried freely.
    InvalidateVersions {
        topology_id: TopologyId,
        keys: Vec<Key>,
        topology_ids: Vec<TopologyId>,
        versions: Vec<u64>,
        removal: bool,
    },

    /// List keys (not values) of the given segments, in key order after `after`.
    RequestKeys {
        topology_id: TopologyId,
        segments: Vec<SegmentId>,
        after: Option<Key>,
        chunk_size: u32,
    },

    /// Fetch values for keys whose value lives on the target.
    RequestValues {
        topology_id: TopologyId,
        keys: Vec<Key>,
    },

    /// Store backup copies.
    BackupPut {
        topology_id: TopologyId,
        entries: Vec<TransferEntry>,
    },

    /// Confirm the target installed `topology_id` and stopped trusting
    /// biases for the segments.
    ConfirmRevokedSegments {
        topology_id: TopologyId,
        segments: Vec<SegmentId>,
    },

    /// Read a key on its owner.
    Get { key: Key },
}

impl Command {
    /// Build an invalidation command from key/version pairs.
    pub fn invalidate_versions(
        topology_id: TopologyId,
        pairs: &[(Key, EntryVersion)],
        removal: bool,
    ) -> Self {
        Command::InvalidateVersions {
            topology_id,
            keys: pairs.iter().map(|(k, _)| k.clone()).collect(),
            topology_ids: pairs.iter().map(|(_, v)| v.topology_id).collect(),
            versions: pairs.iter().map(|(_, v)| v.counter).collect(),
            removal,
        }
    }

    /// Key/version pairs carried by an invalidation command.
    pub fn invalidated(&self) -> Vec<(Key, EntryVersion)> {
        match self {
            Command::InvalidateVersions {
                keys,
                topology_ids,
                versions,
                ..
            } => keys
                .iter()
                .zip(topology_ids.iter().zip(versions.iter()))
                .map(|(k, (t, v))| (k.clone(), EntryVersion::new(*t, *v)))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::RenewBias { .. } => CommandKind::RenewBias,
            Command::RevokeBias { .. } => CommandKind::RevokeBias,
            Command::InvalidateVersions { .. } => CommandKind::InvalidateVersions,
            Command::RequestKeys { .. } => CommandKind::RequestKeys,
            Command::RequestValues { .. } => CommandKind::RequestValues,
            Command::BackupPut { .. } => CommandKind::BackupPut,
            Command::ConfirmRevokedSegments { .. } => CommandKind::ConfirmRevokedSegments,
            Command::Get { .. } => CommandKind::Get,
        }
    }

    /// Whether the command mentions `key`.
    pub fn mentions_key(&self, key: &[u8]) -> bool {
        match self {
            Command::RenewBias { keys }
            | Command::RevokeBias { keys }
            | Command::InvalidateVersions { keys, .. }
            | Command::RequestValues { keys, .. } => keys.iter().any(|k| k.as_ref() == key),
            Command::BackupPut { entries, .. } => entries.iter().any(|e| e.key.as_ref() == key),
            Command::Get { key: k } => k.as_ref() == key,
            Command::RequestKeys { .. } | Command::ConfirmRevokedSegments { .. } => false,
        }
    }

    /// Serialize the command.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a command.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Command discriminant, used for logging and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    RenewBias,
    RevokeBias,
    InvalidateVersions,
    RequestKeys,
    RequestValues,
    BackupPut,
    ConfirmRevokedSegments,
    Get,
}

/// An entry shipped during state transfer or backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
    /// The key.
    pub key: Key,
    /// The value; `None` for a removal.
    pub value: Option<Bytes>,
    /// Version of the value.
    pub version: EntryVersion,
}

/// A key listed by a key transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    /// The key.
    pub key: Key,
    /// Version held by the responder.
    pub version: EntryVersion,
}

/// Response to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// The command was applied.
    Ack,

    /// The command was refused.
    Nack,

    /// A chunk of keys; `last` marks the end of the listing.
    Keys { entries: Vec<KeyEntry>, last: bool },

    /// Values aligned with the requested keys; `None` if not held locally.
    Values(Vec<Option<TransferEntry>>),

    /// Result of a read on the owner.
    Value {
        value: Option<Bytes>,
        version: Option<EntryVersion>,
        topology_id: TopologyId,
        biased: bool,
    },

    /// The target does not own the segment.
    NotOwner,

    /// The command failed on the target.
    Error(String),
}

impl Response {
    /// Turn anything but an ack into an error.
    pub fn expect_ack(self) -> Result<()> {
        match self {
            Response::Ack => Ok(()),
            Response::Error(e) => Err(Error::Remote(e)),
            other => Err(Error::Network(NetworkError::UnexpectedResponse(format!(
                "{:?}",
                other
            )))),
        }
    }

    /// Serialize the response.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a response.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    /// Turn a remote error into an error, pass everything else through.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error(e) => Err(Error::Remote(e)),
            other => Ok(other),
        }
    }
}
