//! In-memory log store with retention trimming

use std::collections::HashMap;
use tracing::{debug, warn};

use super::{LogSnapshot, LogStore};
use crate::error::{Result, SyncError};
use crate::ids::{SequenceClock, SequenceId};
use crate::operation::Operation;
use crate::tree::SerializedDocument;
use crate::DocumentId;

#[derive(Debug, Default)]
struct Stream {
    entries: Vec<Operation>,
    document: SerializedDocument,
    persisted_at: SequenceId,
    clock: SequenceClock,
    trimmed: bool,
}

impl Stream {
    fn tail(&self) -> SequenceId {
        self.entries
            .last()
            .and_then(|op| op.sequence)
            .unwrap_or(self.persisted_at)
    }
}

/// Log store holding every stream in memory
///
/// # Example
///
/// ```rust
/// use docsync_core::ids::SequenceId;
/// use docsync_core::log::{LogStore, MemoryLog};
/// use docsync_core::operation::{NodeChange, Operation};
/// use docsync_core::tree::SerializedNode;
///
/// let mut log = MemoryLog::new();
/// let op = Operation::created("a", NodeChange::new(SerializedNode::paragraph().with_sync_id("p1".into())));
/// let seq = log.append("doc", op);
///
/// assert_eq!(log.subscribe("doc", SequenceId::ZERO).len(), 1);
/// assert!(log.subscribe("doc", seq).is_empty());
/// ```
#[derive(Debug, Default)]
pub struct MemoryLog {
    streams: HashMap<DocumentId, Stream>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained entries for a document
    pub fn len(&self, document_id: &str) -> usize {
        self.streams.get(document_id).map_or(0, |s| s.entries.len())
    }

    /// Append with an explicit wall-clock reading
    pub fn append_at(&mut self, document_id: &str, mut operation: Operation, now_ms: u64) -> SequenceId {
        let stream = self.streams.entry(document_id.to_string()).or_default();
        let sequence = stream.clock.tick_at(now_ms);
        operation.sequence = Some(sequence);
        stream.entries.push(operation);
        sequence
    }

    /// Drop the oldest entries, keeping at most `retain`
    ///
    /// Entries newer than the persisted snapshot are never dropped, so a
    /// fresh replica can always catch up from the snapshot. Returns how many
    /// entries were removed.
    pub fn trim(&mut self, document_id: &str, retain: usize) -> usize {
        let Some(stream) = self.streams.get_mut(document_id) else {
            return 0;
        };
        let persisted_at = stream.persisted_at;
        let removable = stream
            .entries
            .iter()
            .take_while(|op| op.sequence.map_or(true, |seq| seq <= persisted_at))
            .count();
        let excess = stream.entries.len().saturating_sub(retain);
        let removed = excess.min(removable);

        if removed > 0 {
            stream.entries.drain(..removed);
            stream.trimmed = true;
            debug!(document_id, removed, "trimmed log");
        }
        removed
    }
}

impl LogStore for MemoryLog {
    fn snapshot(&self, document_id: &str) -> LogSnapshot {
        let Some(stream) = self.streams.get(document_id) else {
            return LogSnapshot {
                serialized_document: SerializedDocument::empty(),
                last_sequence_id: SequenceId::ZERO,
                oldest_retained_sequence_id: None,
            };
        };

        let oldest = stream.trimmed.then(|| {
            stream
                .entries
                .first()
                .and_then(|op| op.sequence)
                .unwrap_or_else(|| stream.tail())
        });

        LogSnapshot {
            serialized_document: stream.document.clone(),
            last_sequence_id: stream.persisted_at,
            oldest_retained_sequence_id: oldest,
        }
    }

    fn append(&mut self, document_id: &str, operation: Operation) -> SequenceId {
        let now = crate::ids::now_millis().max(0) as u64;
        self.append_at(document_id, operation, now)
    }

    fn subscribe(&self, document_id: &str, from: SequenceId) -> Vec<Operation> {
        self.streams
            .get(document_id)
            .map(|stream| {
                stream
                    .entries
                    .iter()
                    .filter(|op| op.sequence.map_or(false, |seq| seq > from))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn persist_snapshot(
        &mut self,
        document_id: &str,
        document: SerializedDocument,
        sequence: SequenceId,
    ) -> Result<()> {
        let stream = self.streams.entry(document_id.to_string()).or_default();
        if sequence > stream.tail() {
            return Err(SyncError::Protocol(format!(
                "snapshot at {} is ahead of the log tail {}",
                sequence,
                stream.tail()
            )));
        }
        if sequence < stream.persisted_at {
            warn!(document_id, %sequence, persisted_at = %stream.persisted_at, "ignoring stale snapshot");
            return Ok(());
        }
        stream.document = document;
        stream.persisted_at = sequence;
        debug!(document_id, %sequence, "persisted snapshot");
        Ok(())
    }
}
