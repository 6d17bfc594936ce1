//! Error types for the sync engine
//!
//! Every failure the protocol can observe falls into one of these classes:
//!
//! - **Protocol violations:** malformed messages, unknown node types
//! - **Identity conflicts:** one SyncId bound to two live handles
//! - **Structural errors:** an insert whose parent or sibling cannot be found
//! - **Ordering violations:** duplicate or stale sequence ids
//! - **Desync:** the log trimmed past what this replica has seen
//!
//! Only `Desync` is terminal. Everything else is logged and the offending
//! unit of work is dropped.

use crate::ids::{SequenceId, SyncId};
use crate::tree::NodeKey;
use thiserror::Error;

/// Errors raised by the sync engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Malformed or unrecognized message
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The host tree cannot construct this node type
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    /// A SyncId is already bound to a different live handle
    #[error("duplicate identity {id}: bound to {existing}, rejected {rejected}")]
    DuplicateIdentity {
        id: SyncId,
        existing: NodeKey,
        rejected: NodeKey,
    },

    /// An operation references a node this replica does not have
    #[error("target not found: {0}")]
    MissingTarget(SyncId),

    /// The host tree refused a structural change
    #[error("structural error: {0}")]
    Structural(String),

    /// Sequence id is not newer than the last applied one
    #[error("out-of-order sequence {received} (last seen {last_seen})")]
    OutOfOrder {
        received: SequenceId,
        last_seen: SequenceId,
    },

    /// Sequence id has already been processed
    #[error("duplicate sequence {0}")]
    DuplicateSequence(SequenceId),

    /// The log no longer retains what this replica needs to resume
    #[error("desynced: last seen {last_seen}, oldest retained {oldest_retained}")]
    Desync {
        last_seen: SequenceId,
        oldest_retained: SequenceId,
    },

    /// Transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Encoding or decoding failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("invalid config: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether this error ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::Desync { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SyncError>;
