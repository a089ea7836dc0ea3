//! Error types for ripple-core

use thiserror::Error;

use crate::state::EntryId;

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Transport closed")]
    Closed,
}

/// A frame that could not be turned into an event.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("JSON frame error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack decode error: {0}")]
    MessagePackDecode(#[from] rmp_serde::decode::Error),

    #[error("MessagePack encode error: {0}")]
    MessagePackEncode(#[from] rmp_serde::encode::Error),
}

/// Errors surfaced to callers of signal writes.
///
/// A failed compare-and-set is not an error; it resolves to `false`.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Event log dropped before the event was confirmed")]
    Closed,

    #[error("Entry {0} does not exist")]
    MissingEntry(EntryId),

    #[error("Update gave up after {attempts} contended attempts")]
    Contention { attempts: u32 },
}
