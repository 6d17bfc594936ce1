//! Batcher / Flattener
//!
//! Collects captured operations between flushes and turns a burst of
//! keystrokes into the smallest ordered set worth sending. Also owns the
//! undo and redo stacks: one [`HistoryEntry`] per flush window of local
//! edits.
//!
//! # Flattening rules
//!
//! Per target SyncId, in arrival order:
//!
//! | earlier   | later             | result                                  |
//! |-----------|-------------------|-----------------------------------------|
//! | created   | destroyed         | both dropped                            |
//! | updated   | destroyed         | destroy replaces the update             |
//! | created   | created / updated | create carries the final payload        |
//! | updated   | created / updated | later op, keeping the first previousNode |
//! | destroyed | created           | both kept (re-creation)                 |
//!
//! Only the most recent cursor survives. Updates that change nothing are
//! dropped, as is anything whose parent ends the flush destroyed. Survivors
//! keep their original relative order.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::ids::SyncId;
use crate::operation::{Operation, OperationKind};

/// Where a captured batch came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A user edit; joins the undo window
    Local,

    /// Undo/redo replay; sent, but never recorded in history
    History,
}

/// One undoable unit: the local operations of a flush window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Outbound: children of destroyed parents are implied
    Wire,

    /// Undo entries: every node must be rebuildable on its own
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Created,
    Updated,
    Destroyed,
}

fn slot_of(op: &Operation) -> Option<Slot> {
    match op.kind {
        OperationKind::Created(_) => Some(Slot::Created),
        OperationKind::Updated(_) => Some(Slot::Updated),
        OperationKind::Destroyed(_) => Some(Slot::Destroyed),
        OperationKind::Cursor(_) => None,
    }
}

/// Flatten a burst of operations for transmission
///
/// # Example
///
/// ```rust
/// use docsync_core::batcher::flatten;
/// use docsync_core::operation::{NodeChange, Operation};
/// use docsync_core::tree::SerializedNode;
///
/// let node = |text: &str| SerializedNode::text(text).with_sync_id("x".into());
/// let ops = vec![
///     Operation::created("a", NodeChange::new(node("h"))),
///     Operation::updated("a", NodeChange::new(node("hi")).replacing(node("h"))),
///     Operation::destroyed("a", NodeChange::new(node("hi"))),
/// ];
///
/// assert!(flatten(ops).is_empty());
/// ```
pub fn flatten(ops: Vec<Operation>) -> Vec<Operation> {
    normalize(ops, Mode::Wire)
}

/// Flatten for the undo stack: same merging, but destroyed children are kept
/// so a whole subtree can be rebuilt
pub fn compact_history(ops: Vec<Operation>) -> Vec<Operation> {
    normalize(ops, Mode::History)
}

fn normalize(ops: Vec<Operation>, mode: Mode) -> Vec<Operation> {
    let mut slots: Vec<Option<(usize, Operation)>> = Vec::with_capacity(ops.len());
    let mut latest: HashMap<SyncId, usize> = HashMap::new();
    let mut cursor: Option<usize> = None;

    for (index, op) in ops.into_iter().enumerate() {
        if op.is_cursor() {
            if let Some(previous) = cursor.replace(slots.len()) {
                slots[previous] = None;
            }
            slots.push(Some((index, op)));
            continue;
        }

        let Some(id) = op.target().cloned() else {
            slots.push(Some((index, op)));
            continue;
        };

        let earlier = latest.get(&id).copied().and_then(|at| {
            slots[at]
                .as_ref()
                .and_then(|(_, earlier)| slot_of(earlier))
                .map(|kind| (at, kind))
        });

        match (earlier, slot_of(&op)) {
            (Some((at, Slot::Created)), Some(Slot::Destroyed)) => {
                slots[at] = None;
                latest.remove(&id);
            }
            (Some((at, Slot::Created)), Some(Slot::Created | Slot::Updated)) => {
                let final_node = op.change().map(|c| c.node.clone());
                if let (Some((_, earlier)), Some(node)) = (slots[at].as_mut(), final_node) {
                    if let OperationKind::Created(change) = &mut earlier.kind {
                        change.node = node;
                    }
                }
            }
            (Some((at, Slot::Updated)), Some(_)) => {
                let first_previous = slots[at].take().and_then(|(_, earlier)| match earlier.kind {
                    OperationKind::Updated(change) => change.previous_node,
                    _ => None,
                });
                let mut op = op;
                match &mut op.kind {
                    OperationKind::Updated(change) => {
                        if first_previous.is_some() {
                            change.previous_node = first_previous;
                        }
                    }
                    // The node as it stood when the window opened
                    OperationKind::Destroyed(change) => {
                        if let Some(node) = first_previous {
                            change.node = node;
                        }
                    }
                    _ => {}
                }
                latest.insert(id, slots.len());
                slots.push(Some((index, op)));
            }
            _ => {
                latest.insert(id, slots.len());
                slots.push(Some((index, op)));
            }
        }
    }

    let destroyed: HashSet<SyncId> = latest
        .iter()
        .filter(|(_, at)| {
            slots[**at]
                .as_ref()
                .map_or(false, |(_, op)| slot_of(op) == Some(Slot::Destroyed))
        })
        .map(|(id, _)| id.clone())
        .collect();

    let mut survivors: Vec<(usize, Operation)> = slots
        .into_iter()
        .flatten()
        .filter(|(_, op)| match &op.kind {
            OperationKind::Updated(change) => change.previous_node.as_ref() != Some(&change.node),
            _ => true,
        })
        .filter(|(_, op)| {
            mode == Mode::History
                || op
                    .change()
                    .and_then(|c| c.parent_id.as_ref())
                    .map_or(true, |parent| !destroyed.contains(parent))
        })
        .collect();

    survivors.sort_by_key(|(index, _)| *index);
    survivors.into_iter().map(|(_, op)| op).collect()
}

/// Pending send queue plus undo/redo stacks
#[derive(Debug, Default)]
pub struct Batcher {
    pending: Vec<Operation>,
    window: Vec<Operation>,
    undo: Vec<HistoryEntry>,
    redo: Vec<HistoryEntry>,
    next_version: u64,
}

impl Batcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue captured operations for the next flush
    pub fn record(&mut self, ops: Vec<Operation>, origin: Origin) {
        if origin == Origin::Local {
            self.window
                .extend(ops.iter().filter(|op| !op.is_cursor()).cloned());
        }
        self.pending.extend(ops);
    }

    /// Close the open undo window
    ///
    /// Returns the version of the new history entry, if the window held
    /// anything worth undoing. A new entry invalidates the redo stack.
    pub fn seal(&mut self) -> Option<u64> {
        if self.window.is_empty() {
            return None;
        }
        let operations = compact_history(std::mem::take(&mut self.window));
        if operations.is_empty() {
            return None;
        }

        self.next_version += 1;
        self.undo.push(HistoryEntry {
            version: self.next_version,
            operations,
        });
        self.redo.clear();
        Some(self.next_version)
    }

    /// Take the flattened pending queue
    pub fn drain(&mut self) -> Vec<Operation> {
        flatten(std::mem::take(&mut self.pending))
    }

    /// Flattened pending queue, left in place
    pub fn peek(&self) -> Vec<Operation> {
        flatten(self.pending.clone())
    }

    /// Put operations that failed to send back in front of the queue
    pub fn requeue(&mut self, mut ops: Vec<Operation>) {
        ops.append(&mut self.pending);
        self.pending = ops;
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Pop the latest history entry and move it to the redo stack
    pub fn pop_undo(&mut self) -> Option<HistoryEntry> {
        self.seal();
        let entry = self.undo.pop()?;
        self.redo.push(entry.clone());
        Some(entry)
    }

    /// Pop the latest undone entry and move it back to the undo stack
    pub fn pop_redo(&mut self) -> Option<HistoryEntry> {
        let entry = self.redo.pop()?;
        self.undo.push(entry.clone());
        Some(entry)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty() || !self.window.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }
}
