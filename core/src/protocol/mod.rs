//! Wire protocol
//!
//! Both transport bindings speak the same four JSON messages, tagged by
//! `type`:
//!
//! | direction       | message            | payload                                         |
//! |-----------------|--------------------|-------------------------------------------------|
//! | log → replica   | `init`             | `lastSequenceId`, `oldestRetainedSequenceId?`, `serializedDocument` |
//! | replica → log   | `init-ack`         | `lastSequenceId`                                |
//! | both ways       | `operation-batch`  | `operations[]`                                  |
//! | replica → log   | `persist-snapshot` | `lastSequenceId`, `serializedDocument`          |

pub mod serialize;

use serde::{Deserialize, Serialize};

use crate::ids::SequenceId;
use crate::operation::Operation;
use crate::tree::SerializedDocument;

pub use serialize::{decode_client, decode_server, encode_client, encode_server};

/// Snapshot announcement sent on every (re)connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Init {
    /// Tail of the log the snapshot corresponds to
    pub last_sequence_id: SequenceId,

    /// Oldest entry still retained; absent while nothing was ever trimmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_retained_sequence_id: Option<SequenceId>,

    pub serialized_document: SerializedDocument,
}

/// Messages from the log (broker or mesh peer) to a replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Init(Init),

    #[serde(rename_all = "camelCase")]
    OperationBatch { operations: Vec<Operation> },
}

/// Messages from a replica to the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Position the replica resumes (or starts) streaming from
    #[serde(rename_all = "camelCase")]
    InitAck { last_sequence_id: SequenceId },

    #[serde(rename_all = "camelCase")]
    OperationBatch { operations: Vec<Operation> },

    #[serde(rename_all = "camelCase")]
    PersistSnapshot {
        last_sequence_id: SequenceId,
        serialized_document: SerializedDocument,
    },
}

impl ClientMessage {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ClientMessage::InitAck { .. } => "init-ack",
            ClientMessage::OperationBatch { .. } => "operation-batch",
            ClientMessage::PersistSnapshot { .. } => "persist-snapshot",
        }
    }
}
