//! Log client
//!
//! Tracks where this replica stands in the replicated log and decides what
//! to do with every inbound message:
//!
//! - **First connect:** adopt the announced snapshot and its tail.
//! - **Reconnect:** never re-adopt (that would drop unsynced edits); resume
//!   from `last_seen`, unless the log has trimmed past it, which is a
//!   terminal desync.
//! - **Inbound operations:** strictly increasing, never seen before. Our own
//!   operations only advance the position.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected --open--> AwaitingInit --init--> Streaming --close--> Disconnected
//!                                         \
//!                                          `--trimmed--> Desynced (terminal)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, error, info};

use crate::error::{Result, SyncError};
use crate::ids::SequenceId;
use crate::operation::Operation;
use crate::protocol::{ClientMessage, Init};
use crate::tree::SerializedDocument;
use crate::AuthorId;

/// Connection state of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Disconnected,
    AwaitingInit,
    Streaming,
    Desynced,
}

/// What to do with an `init` message
#[derive(Debug, Clone, PartialEq)]
pub enum InitDecision {
    /// First connect: take the log's state. `document` is `None` when the
    /// snapshot is empty and the local tree should be left alone.
    Adopt {
        document: Option<SerializedDocument>,
        last: SequenceId,
    },

    /// Reconnect: keep the local tree and stream from `from`
    Resume { from: SequenceId },
}

/// What to do with an admitted inbound operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Authored here; already reflected locally
    Own,

    /// Apply it
    Apply,
}

/// Sequence tracking for one replica
#[derive(Debug, Clone)]
pub struct LogClient {
    author: AuthorId,
    status: ConnectionStatus,
    last_seen: Option<SequenceId>,
    last_persisted: Option<SequenceId>,
    seen: HashSet<SequenceId>,
    seen_order: VecDeque<SequenceId>,
    seen_window: usize,
}

impl LogClient {
    pub fn new(author: impl Into<AuthorId>, seen_window: usize) -> Self {
        Self {
            author: author.into(),
            status: ConnectionStatus::Disconnected,
            last_seen: None,
            last_persisted: None,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            seen_window: seen_window.max(1),
        }
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_streaming(&self) -> bool {
        self.status == ConnectionStatus::Streaming
    }

    pub fn is_desynced(&self) -> bool {
        self.status == ConnectionStatus::Desynced
    }

    pub fn last_seen(&self) -> Option<SequenceId> {
        self.last_seen
    }

    /// Transport opened; wait for the log's `init`
    pub fn on_open(&mut self) {
        if !self.is_desynced() {
            self.status = ConnectionStatus::AwaitingInit;
        }
    }

    pub fn on_close(&mut self) {
        if !self.is_desynced() {
            self.status = ConnectionStatus::Disconnected;
        }
    }

    /// Decide between adopting, resuming and desync
    pub fn on_init(&mut self, init: Init) -> Result<InitDecision> {
        if let Some(last_seen) = self.last_seen {
            let oldest = init.oldest_retained_sequence_id;
            if let Some(oldest_retained) = oldest.filter(|oldest| *oldest > last_seen) {
                self.status = ConnectionStatus::Desynced;
                error!(%last_seen, %oldest_retained, "log trimmed past our position; desynced");
                return Err(SyncError::Desync {
                    last_seen,
                    oldest_retained,
                });
            }
        }
        if self.is_desynced() {
            return Err(SyncError::Desync {
                last_seen: self.last_seen.unwrap_or(SequenceId::ZERO),
                oldest_retained: init
                    .oldest_retained_sequence_id
                    .unwrap_or(init.last_sequence_id),
            });
        }

        self.status = ConnectionStatus::Streaming;
        match self.last_seen {
            Some(from) => {
                info!(%from, "resuming stream");
                Ok(InitDecision::Resume { from })
            }
            None => {
                let last = init.last_sequence_id;
                self.last_seen = Some(last);
                self.last_persisted = Some(last);
                info!(%last, "adopting snapshot");
                let document = Some(init.serialized_document).filter(|doc| !doc.is_empty());
                Ok(InitDecision::Adopt { document, last })
            }
        }
    }

    /// Reply to `init` with the position to stream from
    pub fn ack(&self) -> ClientMessage {
        ClientMessage::InitAck {
            last_sequence_id: self.last_seen.unwrap_or(SequenceId::ZERO),
        }
    }

    /// Check an inbound operation and record its sequence id
    pub fn admit(&mut self, op: &Operation) -> Result<Admission> {
        if !self.is_streaming() {
            return Err(SyncError::Protocol(format!(
                "operation received while {:?}",
                self.status
            )));
        }
        let sequence = op
            .sequence
            .ok_or_else(|| SyncError::Protocol("inbound operation without sequence id".into()))?;

        if self.seen.contains(&sequence) {
            return Err(SyncError::DuplicateSequence(sequence));
        }
        if let Some(last_seen) = self.last_seen.filter(|last| sequence <= *last) {
            return Err(SyncError::OutOfOrder {
                received: sequence,
                last_seen,
            });
        }

        self.advance(sequence);
        if op.author == self.author {
            debug!(%sequence, "own operation echoed back");
            Ok(Admission::Own)
        } else {
            Ok(Admission::Apply)
        }
    }

    fn advance(&mut self, sequence: SequenceId) {
        self.last_seen = Some(sequence);
        if self.seen.insert(sequence) {
            self.seen_order.push_back(sequence);
        }
        while self.seen_order.len() > self.seen_window {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }

    /// Position to persist, if it moved since the last persist
    pub fn persist_due(&mut self) -> Option<SequenceId> {
        if !self.is_streaming() {
            return None;
        }
        let last = self.last_seen?;
        if self.last_persisted == Some(last) {
            return None;
        }
        self.last_persisted = Some(last);
        Some(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{NodeChange, Operation};
    use crate::tree::SerializedNode;

    fn init(last: u64, oldest: Option<u64>, document: SerializedDocument) -> Init {
        Init {
            last_sequence_id: SequenceId::new(last, 0),
            oldest_retained_sequence_id: oldest.map(|o| SequenceId::new(o, 0)),
            serialized_document: document,
        }
    }

    fn op(author: &str, seq: u64) -> Operation {
        Operation::created(
            author,
            NodeChange::new(SerializedNode::paragraph().with_sync_id(format!("p{}", seq).into())),
        )
        .with_sequence(SequenceId::new(seq, 0))
    }

    fn streaming_at(last: u64) -> LogClient {
        let mut client = LogClient::new("me", 16);
        client.on_open();
        client.on_init(init(last, None, SerializedDocument::empty())).unwrap();
        client
    }

    #[test]
    fn test_first_connect_adopts() {
        let mut client = LogClient::new("me", 16);
        client.on_open();
        assert_eq!(client.status(), ConnectionStatus::AwaitingInit);

        let doc = SerializedDocument {
            root: SerializedNode::new("root").with_child(SerializedNode::paragraph()),
        };
        let decision = client.on_init(init(7, None, doc.clone())).unwrap();

        assert_eq!(
            decision,
            InitDecision::Adopt {
                document: Some(doc),
                last: SequenceId::new(7, 0)
            }
        );
        assert!(client.is_streaming());
        assert_eq!(
            client.ack(),
            ClientMessage::InitAck {
                last_sequence_id: SequenceId::new(7, 0)
            }
        );
    }

    #[test]
    fn test_empty_snapshot_not_imported() {
        let mut client = LogClient::new("me", 16);
        client.on_open();
        let decision = client.on_init(init(0, None, SerializedDocument::empty())).unwrap();
        assert!(matches!(decision, InitDecision::Adopt { document: None, .. }));
    }

    #[test]
    fn test_reconnect_resumes_without_snapshot() {
        let mut client = streaming_at(3);
        client.admit(&op("other", 5)).unwrap();
        client.on_close();
        client.on_open();

        let decision = client.on_init(init(9, Some(4), SerializedDocument::empty())).unwrap();
        assert_eq!(
            decision,
            InitDecision::Resume {
                from: SequenceId::new(5, 0)
            }
        );
    }

    #[test]
    fn test_desync_is_terminal() {
        let mut client = streaming_at(5);
        client.on_close();
        client.on_open();

        let err = client
            .on_init(init(12, Some(8), SerializedDocument::empty()))
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::Desync {
                last_seen: SequenceId::new(5, 0),
                oldest_retained: SequenceId::new(8, 0),
            }
        );
        assert!(client.is_desynced());

        client.on_close();
        client.on_open();
        assert!(client.is_desynced());
        assert!(client.on_init(init(12, None, SerializedDocument::empty())).is_err());
    }

    #[test]
    fn test_admission_rules() {
        let mut client = streaming_at(1);

        assert_eq!(client.admit(&op("other", 2)).unwrap(), Admission::Apply);
        assert_eq!(client.admit(&op("me", 3)).unwrap(), Admission::Own);
        assert_eq!(client.last_seen(), Some(SequenceId::new(3, 0)));

        assert_eq!(
            client.admit(&op("other", 3)),
            Err(SyncError::DuplicateSequence(SequenceId::new(3, 0)))
        );
        assert!(matches!(
            client.admit(&op("other", 1)),
            Err(SyncError::OutOfOrder { .. })
        ));

        let mut unsequenced = op("other", 9);
        unsequenced.sequence = None;
        assert!(matches!(client.admit(&unsequenced), Err(SyncError::Protocol(_))));
        assert_eq!(client.last_seen(), Some(SequenceId::new(3, 0)));
    }

    #[test]
    fn test_seen_window_is_bounded() {
        let mut client = LogClient::new("me", 2);
        client.on_open();
        client.on_init(init(0, None, SerializedDocument::empty())).unwrap();
        for seq in 1..=5 {
            client.admit(&op("other", seq)).unwrap();
        }
        assert_eq!(client.seen.len(), 2);
        // Forgotten ids are still rejected by position
        assert!(client.admit(&op("other", 1)).is_err());
    }

    #[test]
    fn test_persist_only_when_advanced() {
        let mut client = streaming_at(4);
        assert_eq!(client.persist_due(), None, "adopted position is already persisted");

        client.admit(&op("other", 6)).unwrap();
        assert_eq!(client.persist_due(), Some(SequenceId::new(6, 0)));
        assert_eq!(client.persist_due(), None);
    }
}
