//! Replicated append-only log
//!
//! The log is the source of truth: it serializes every accepted operation
//! into one global order and keeps a persisted snapshot that new replicas
//! adopt. The storage technology is up to the implementation;
//! [`MemoryLog`] keeps everything in process.

pub mod memory;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::SequenceId;
use crate::operation::Operation;
use crate::protocol::Init;
use crate::tree::SerializedDocument;

pub use memory::MemoryLog;

/// A document's persisted state as announced to connecting replicas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSnapshot {
    /// Last persisted document
    pub serialized_document: SerializedDocument,

    /// Position `serialized_document` corresponds to
    pub last_sequence_id: SequenceId,

    /// Oldest entry still retained; `None` while nothing was ever trimmed
    pub oldest_retained_sequence_id: Option<SequenceId>,
}

impl LogSnapshot {
    /// The `init` message announcing this snapshot
    pub fn to_init(&self) -> Init {
        Init {
            last_sequence_id: self.last_sequence_id,
            oldest_retained_sequence_id: self.oldest_retained_sequence_id,
            serialized_document: self.serialized_document.clone(),
        }
    }
}

/// Storage behind the log, one stream per document
pub trait LogStore: Send {
    /// Persisted snapshot plus retention bounds
    fn snapshot(&self, document_id: &str) -> LogSnapshot;

    /// Append an operation, stamping and returning its sequence id
    fn append(&mut self, document_id: &str, operation: Operation) -> SequenceId;

    /// Entries strictly after `from`, in order
    fn subscribe(&self, document_id: &str, from: SequenceId) -> Vec<Operation>;

    /// Record a replica's document as of `sequence`
    fn persist_snapshot(
        &mut self,
        document_id: &str,
        document: SerializedDocument,
        sequence: SequenceId,
    ) -> Result<()>;
}
