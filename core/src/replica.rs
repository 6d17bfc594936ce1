//! Replica engine
//!
//! One collaborating copy of a document. The replica owns the host tree and
//! every piece of sync state, but does no I/O: inbound messages are passed
//! to [`Replica::receive`], outbound ones collected with
//! [`Replica::take_outbox`], and timers are driven from outside through the
//! `*_tick` methods. The session driver wires it to a transport and a clock.
//!
//! # Example
//!
//! ```rust
//! use docsync_core::config::SyncConfig;
//! use docsync_core::replica::Replica;
//! use docsync_core::tree::MemoryTree;
//!
//! let mut replica = Replica::new("alice", MemoryTree::new(), SyncConfig::default());
//! replica.edit(|tree| {
//!     let p = tree.append_paragraph().unwrap();
//!     tree.append_text(p, "hi").unwrap();
//! });
//!
//! assert_eq!(replica.text(), "hi");
//! // Not connected yet: edits wait in the batcher
//! assert!(!replica.flush());
//! assert!(replica.has_pending());
//! ```

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::applier::Applier;
use crate::batcher::{Batcher, HistoryEntry, Origin};
use crate::capture::capture;
use crate::client::{Admission, ConnectionStatus, InitDecision, LogClient};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::identity::IdentityMap;
use crate::ids::{now_millis, SequenceId};
use crate::operation::{CursorChange, Operation};
use crate::presence::{Presence, PresenceChange, PresenceTracker};
use crate::protocol::{ClientMessage, Init, ServerMessage};
use crate::splitter::split_words;
use crate::tree::{HostTree, MutationBatch, NodeKey, SerializedDocument, UpdateTag, UpdateTags};
use crate::AuthorId;

/// Something the owner of a replica should know about
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    /// Streaming from the log; `adopted` on first connect
    Connected { adopted: bool, last: SequenceId },

    /// Remote carets moved, appeared or expired
    PresenceChanged(PresenceChange),

    /// The log trimmed past this replica's position. Terminal.
    Desynced(SyncError),
}

/// A document replica
pub struct Replica<T: HostTree> {
    author: AuthorId,
    tree: T,
    identities: IdentityMap,
    batcher: Batcher,
    client: LogClient,
    presence: PresenceTracker,
    config: SyncConfig,
    outbox: Vec<ClientMessage>,
    events: Vec<ReplicaEvent>,
    last_cursor: Option<CursorChange>,
    last_cursor_sent_at: i64,
}

impl<T: HostTree> Replica<T> {
    pub fn new(author: impl Into<AuthorId>, tree: T, config: SyncConfig) -> Self {
        let author = author.into();
        let mut identities = IdentityMap::new(tree.root());
        identities.populate(&tree);

        Self {
            client: LogClient::new(author.clone(), config.seen_window),
            author,
            tree,
            identities,
            batcher: Batcher::new(),
            presence: PresenceTracker::new(),
            config,
            outbox: Vec::new(),
            events: Vec::new(),
            last_cursor: None,
            last_cursor_sent_at: 0,
        }
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn tree(&self) -> &T {
        &self.tree
    }

    pub fn identities(&self) -> &IdentityMap {
        &self.identities
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.client.status()
    }

    pub fn last_seen(&self) -> Option<SequenceId> {
        self.client.last_seen()
    }

    pub fn is_desynced(&self) -> bool {
        self.client.is_desynced()
    }

    pub fn has_pending(&self) -> bool {
        self.batcher.has_pending()
    }

    pub fn can_undo(&self) -> bool {
        self.batcher.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.batcher.can_redo()
    }

    pub fn export_document(&self) -> SerializedDocument {
        self.tree.export_document()
    }

    /// Plain text of the document
    pub fn text(&self) -> String {
        self.tree.export_document().text()
    }

    /// Run a user edit
    ///
    /// Opens an untagged host update, splits dirty text at word boundaries
    /// before committing, then captures the result.
    pub fn edit<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        self.tree.begin_update(UpdateTags::none());
        let result = f(&mut self.tree);
        if let Err(err) = split_words(&mut self.tree) {
            warn!(error = %err, "word split failed");
        }
        let batch = self.tree.commit_update();
        self.on_mutations(&batch);
        result
    }

    /// Capture a committed host batch; returns whether anything was queued
    pub fn on_mutations(&mut self, batch: &MutationBatch) -> bool {
        match capture(&mut self.tree, &mut self.identities, batch, &self.author) {
            Some((origin, ops)) if !ops.is_empty() => {
                self.batcher.record(ops, origin);
                true
            }
            _ => false,
        }
    }

    /// Close the undo window and send pending operations
    ///
    /// Returns whether a batch was queued for sending. While not streaming
    /// the operations stay pending.
    pub fn flush(&mut self) -> bool {
        self.batcher.seal();
        if !self.client.is_streaming() || !self.batcher.has_pending() {
            return false;
        }
        let operations = self.batcher.drain();
        if operations.is_empty() {
            return false;
        }
        debug!(count = operations.len(), "flushing operations");
        self.outbox.push(ClientMessage::OperationBatch { operations });
        true
    }

    /// Put a message that failed to send back into the queue
    pub fn requeue(&mut self, message: ClientMessage) {
        if let ClientMessage::OperationBatch { operations } = message {
            self.batcher.requeue(operations);
        }
    }

    /// Handle one message from the log
    ///
    /// Only desync is returned as an error; anything wrong with individual
    /// operations is logged and skipped.
    pub fn receive(&mut self, message: ServerMessage, now_ms: i64) -> Result<()> {
        match message {
            ServerMessage::Init(init) => self.on_init(init),
            ServerMessage::OperationBatch { operations } => {
                self.apply_remote(operations, now_ms);
                Ok(())
            }
        }
    }

    fn on_init(&mut self, init: Init) -> Result<()> {
        match self.client.on_init(init) {
            Ok(InitDecision::Adopt { document, last }) => {
                if let Some(document) = document {
                    self.tree.begin_update(UpdateTags::of(UpdateTag::Sync));
                    let imported = self.tree.import_document(&document);
                    self.tree.commit_update();
                    if let Err(err) = imported {
                        warn!(error = %err, "snapshot import incomplete");
                    }
                    self.identities.populate(&self.tree);
                    self.replay_pending();
                }
                self.events.push(ReplicaEvent::Connected {
                    adopted: true,
                    last,
                });
            }
            Ok(InitDecision::Resume { from }) => {
                self.events.push(ReplicaEvent::Connected {
                    adopted: false,
                    last: from,
                });
            }
            Err(err) => {
                if err.is_terminal() {
                    self.events.push(ReplicaEvent::Desynced(err.clone()));
                }
                return Err(err);
            }
        }

        self.outbox.push(self.client.ack());
        self.flush();
        Ok(())
    }

    /// Re-apply unsent local edits on top of an adopted snapshot
    ///
    /// Edits made before the first init are sent after adoption and echoed
    /// back as our own, so the adopted tree has to show them already.
    fn replay_pending(&mut self) {
        let operations: Vec<Operation> = self
            .batcher
            .peek()
            .into_iter()
            .filter(|op| !op.is_cursor())
            .collect();
        if operations.is_empty() {
            return;
        }
        debug!(count = operations.len(), "replaying unsent edits onto snapshot");
        self.tree.begin_update(UpdateTags::of(UpdateTag::Sync));
        let mut applier = Applier::new(
            &mut self.tree,
            &mut self.identities,
            &mut self.presence,
            now_millis(),
        );
        for op in &operations {
            if let Err(err) = applier.apply(op) {
                warn!(error = %err, kind = op.kind_name(), "unsent edit does not fit snapshot");
            }
        }
        self.tree.commit_update();
    }

    fn apply_remote(&mut self, operations: Vec<Operation>, now_ms: i64) {
        let mut admitted = Vec::with_capacity(operations.len());
        for op in operations {
            match self.client.admit(&op) {
                Ok(Admission::Apply) => admitted.push(op),
                Ok(Admission::Own) => {}
                Err(err) => warn!(error = %err, kind = op.kind_name(), "rejected inbound operation"),
            }
        }
        if admitted.is_empty() {
            return;
        }

        let before = self.presence.get_states().clone();
        self.tree.begin_update(UpdateTags::of(UpdateTag::Sync));
        let mut applier = Applier::new(
            &mut self.tree,
            &mut self.identities,
            &mut self.presence,
            now_ms,
        );
        for op in &admitted {
            if let Err(err) = applier.apply(op) {
                warn!(
                    error = %err,
                    sequence = ?op.sequence,
                    kind = op.kind_name(),
                    "dropping inbound operation"
                );
            }
        }
        self.tree.commit_update();

        let tree = &self.tree;
        self.presence.retain_resolvable(|point| tree.contains(point.key));
        self.note_presence(before);
    }

    fn note_presence(&mut self, before: HashMap<AuthorId, Presence>) {
        let after = self.presence.get_states();
        let mut updated: Vec<AuthorId> = after
            .iter()
            .filter(|(author, presence)| before.get(*author) != Some(*presence))
            .map(|(author, _)| author.clone())
            .collect();
        let mut removed: Vec<AuthorId> = before
            .keys()
            .filter(|author| !after.contains_key(*author))
            .cloned()
            .collect();
        updated.sort();
        removed.sort();

        let change = PresenceChange { updated, removed };
        if !change.is_empty() {
            self.events.push(ReplicaEvent::PresenceChanged(change));
        }
    }

    /// Reverse the latest local batch; returns whether there was one
    pub fn undo(&mut self) -> bool {
        match self.batcher.pop_undo() {
            Some(entry) => {
                self.replay(&entry, true);
                true
            }
            None => false,
        }
    }

    /// Re-apply the latest undone batch; returns whether there was one
    pub fn redo(&mut self) -> bool {
        match self.batcher.pop_redo() {
            Some(entry) => {
                self.replay(&entry, false);
                true
            }
            None => false,
        }
    }

    fn replay(&mut self, entry: &HistoryEntry, reverse: bool) {
        debug!(version = entry.version, reverse, "replaying history entry");
        self.tree.begin_update(UpdateTags::of(UpdateTag::History));
        let mut applier = Applier::new(
            &mut self.tree,
            &mut self.identities,
            &mut self.presence,
            now_millis(),
        );
        for op in &entry.operations {
            let result = if reverse {
                applier.reverse(op)
            } else {
                applier.apply(op)
            };
            if let Err(err) = result {
                warn!(error = %err, kind = op.kind_name(), version = entry.version, "history step failed");
            }
        }
        let batch = self.tree.commit_update();
        self.on_mutations(&batch);
    }

    /// Expire idle carets and queue the local caret when it moved (or the
    /// heartbeat is due). Returns whether a cursor was queued.
    pub fn cursor_tick(&mut self, now_ms: i64) -> bool {
        let before = self.presence.get_states().clone();
        self.presence.remove_stale(now_ms);
        self.note_presence(before);

        if !self.client.is_streaming() {
            return false;
        }
        let Some(cursor) = self.local_cursor(now_ms) else {
            return false;
        };

        let moved = self
            .last_cursor
            .as_ref()
            .map_or(true, |last| !last.same_position(&cursor));
        let heartbeat_due =
            now_ms - self.last_cursor_sent_at >= self.config.cursor_heartbeat_ms as i64;
        if !moved && !heartbeat_due {
            return false;
        }

        self.last_cursor = Some(cursor.clone());
        self.last_cursor_sent_at = now_ms;
        self.batcher
            .record(vec![Operation::cursor(self.author.clone(), cursor)], Origin::Local);
        true
    }

    fn local_cursor(&self, now_ms: i64) -> Option<CursorChange> {
        let selection = self.tree.selection()?;
        let id_of = |key: NodeKey| {
            self.identities
                .reverse_lookup(key)
                .cloned()
                .or_else(|| self.tree.sync_id(key))
        };
        Some(CursorChange {
            anchor_id: id_of(selection.anchor.key)?,
            anchor_offset: selection.anchor.offset,
            focus_id: id_of(selection.focus.key)?,
            focus_offset: selection.focus.offset,
            last_activity: now_ms,
        })
    }

    /// Queue a snapshot when the log position moved since the last one
    ///
    /// Skipped while local edits are still pending, so the snapshot never
    /// holds changes the log has not accepted yet.
    pub fn persist_tick(&mut self) -> bool {
        if self.batcher.has_pending() {
            return false;
        }
        let Some(sequence) = self.client.persist_due() else {
            return false;
        };
        self.outbox.push(ClientMessage::PersistSnapshot {
            last_sequence_id: sequence,
            serialized_document: self.tree.export_document(),
        });
        true
    }

    /// Transport opened
    pub fn on_open(&mut self) {
        self.client.on_open();
        self.last_cursor = None;
    }

    /// Transport closed
    pub fn on_close(&mut self) {
        self.client.on_close();
    }

    pub fn take_outbox(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<ReplicaEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequenceId;
    use crate::tree::{MemoryTree, Point, Selection};

    fn connected(author: &str) -> Replica<MemoryTree> {
        let mut replica = Replica::new(author, MemoryTree::new(), SyncConfig::default());
        replica.on_open();
        replica
            .receive(
                ServerMessage::Init(Init {
                    last_sequence_id: SequenceId::ZERO,
                    oldest_retained_sequence_id: None,
                    serialized_document: SerializedDocument::empty(),
                }),
                0,
            )
            .unwrap();
        replica.take_outbox();
        replica.take_events();
        replica
    }

    fn sent_operations(replica: &mut Replica<MemoryTree>) -> Vec<Operation> {
        replica
            .take_outbox()
            .into_iter()
            .flat_map(|msg| match msg {
                ClientMessage::OperationBatch { operations } => operations,
                _ => Vec::new(),
            })
            .collect()
    }

    #[test]
    fn test_init_acks_and_flushes_offline_edits() {
        let mut replica = Replica::new("a", MemoryTree::new(), SyncConfig::default());
        replica.edit(|t| t.append_paragraph().unwrap());
        assert!(!replica.flush());

        replica.on_open();
        replica
            .receive(
                ServerMessage::Init(Init {
                    last_sequence_id: SequenceId::new(3, 0),
                    oldest_retained_sequence_id: None,
                    serialized_document: SerializedDocument::empty(),
                }),
                0,
            )
            .unwrap();

        let outbox = replica.take_outbox();
        assert_eq!(outbox.len(), 2);
        assert_eq!(
            outbox[0],
            ClientMessage::InitAck {
                last_sequence_id: SequenceId::new(3, 0)
            }
        );
        assert_eq!(outbox[1].kind_name(), "operation-batch");
        assert_eq!(
            replica.take_events(),
            vec![ReplicaEvent::Connected {
                adopted: true,
                last: SequenceId::new(3, 0)
            }]
        );
    }

    #[test]
    fn test_edit_splits_and_captures_in_one_batch() {
        let mut replica = connected("a");
        replica.edit(|t| {
            let p = t.append_paragraph().unwrap();
            t.append_text(p, "hello world").unwrap();
        });
        assert!(replica.flush());

        let ops = sent_operations(&mut replica);
        let kinds: Vec<_> = ops.iter().map(Operation::kind_name).collect();
        assert_eq!(kinds, vec!["created", "created", "created"]);
        assert_eq!(ops[2].change().unwrap().node.text_content(), Some("world"));
        assert_eq!(ops[2].change().unwrap().previous_id.as_ref(), ops[1].target());
    }

    #[test]
    fn test_undo_redo_round_trip() {
        let mut replica = connected("a");
        replica.edit(|t| {
            let p = t.append_paragraph().unwrap();
            t.append_text(p, "red ").unwrap();
        });
        replica.flush();
        let before = replica.export_document();

        replica.edit(|t| {
            let p = t.children(t.root())[0];
            let text = t.children(p)[0];
            t.set_text(text, "blue car").unwrap();
        });
        replica.flush();
        let after = replica.export_document();
        assert_eq!(replica.text(), "blue car");

        assert!(replica.undo());
        assert_eq!(replica.export_document(), before);
        assert!(replica.redo());
        assert_eq!(replica.export_document(), after);
        assert!(replica.can_undo());
        assert!(!replica.can_redo());

        // History replays are transmitted
        assert!(replica.flush());
    }

    #[test]
    fn test_cursor_sent_on_move_and_heartbeat_only() {
        let mut replica = connected("a");
        let text = replica.edit(|t| {
            let p = t.append_paragraph().unwrap();
            t.append_text(p, "hi").unwrap()
        });
        replica.flush();
        replica.take_outbox();

        let caret = |offset| Some(Selection::caret(Point::new(text, offset)));
        replica.tree.set_selection(caret(1));

        assert!(replica.cursor_tick(1_000));
        assert!(!replica.cursor_tick(1_100), "unchanged caret is not resent");
        replica.tree.set_selection(caret(2));
        assert!(replica.cursor_tick(1_200));
        assert!(replica.cursor_tick(1_200 + 5_000), "heartbeat");

        replica.flush();
        let ops = sent_operations(&mut replica);
        assert_eq!(ops.len(), 1, "only the latest cursor is sent");
        assert!(ops[0].is_cursor());
    }

    #[test]
    fn test_persist_tick_waits_for_progress() {
        let mut replica = connected("a");
        assert!(!replica.persist_tick());

        replica
            .receive(
                ServerMessage::OperationBatch {
                    operations: vec![Operation::created(
                        "b",
                        crate::operation::NodeChange::new(
                            crate::tree::SerializedNode::paragraph().with_sync_id("p1".into()),
                        ),
                    )
                    .with_sequence(SequenceId::new(1, 0))],
                },
                0,
            )
            .unwrap();

        assert!(replica.persist_tick());
        assert!(!replica.persist_tick());
        match &replica.take_outbox()[0] {
            ClientMessage::PersistSnapshot {
                last_sequence_id,
                serialized_document,
            } => {
                assert_eq!(*last_sequence_id, SequenceId::new(1, 0));
                assert!(!serialized_document.is_empty());
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }
}
