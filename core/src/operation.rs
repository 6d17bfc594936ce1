//! Operations: the unit of replication
//!
//! Four kinds travel through the log:
//!
//! - **Created / Updated:** the full shallow node plus its structural
//!   position (`previousId` or `parentId`). Updates also carry the node as it
//!   was before the edit so they can be reversed.
//! - **Destroyed:** the node as it was immediately before removal and where
//!   it lived, so undo can rebuild it.
//! - **Cursor:** ephemeral presence, never part of the undo history.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "sequenceId": "1718000000000-0",
//!   "author": "alice",
//!   "type": "created",
//!   "node": { "type": "text", "syncId": "t1", "text": "hi" },
//!   "parentId": "p1"
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::ids::{SequenceId, SyncId};
use crate::tree::SerializedNode;
use crate::AuthorId;

/// Node payload shared by create, update and destroy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeChange {
    /// Shallow node (for destroys: as it was before removal)
    pub node: SerializedNode,

    /// Left sibling at mutation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<SyncId>,

    /// Parent at mutation time (absent when the parent is the root)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SyncId>,

    /// Pre-edit node, for updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_node: Option<SerializedNode>,
}

impl NodeChange {
    pub fn new(node: SerializedNode) -> Self {
        Self {
            node,
            previous_id: None,
            parent_id: None,
            previous_node: None,
        }
    }

    pub fn after(mut self, previous_id: Option<SyncId>) -> Self {
        self.previous_id = previous_id;
        self
    }

    pub fn under(mut self, parent_id: Option<SyncId>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn replacing(mut self, previous_node: SerializedNode) -> Self {
        self.previous_node = Some(previous_node);
        self
    }

    /// Identity of the target node
    pub fn sync_id(&self) -> Option<&SyncId> {
        self.node.sync_id.as_ref()
    }
}

/// Remote caret, expressed in durable identities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorChange {
    pub anchor_id: SyncId,
    pub anchor_offset: usize,
    pub focus_id: SyncId,
    pub focus_offset: usize,

    /// Epoch milliseconds of the author's last activity
    pub last_activity: i64,
}

impl CursorChange {
    /// Same caret position, ignoring activity time
    pub fn same_position(&self, other: &CursorChange) -> bool {
        self.anchor_id == other.anchor_id
            && self.anchor_offset == other.anchor_offset
            && self.focus_id == other.focus_id
            && self.focus_offset == other.focus_offset
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OperationKind {
    Created(NodeChange),
    Updated(NodeChange),
    Destroyed(NodeChange),
    Cursor(CursorChange),
}

/// One replicated operation
///
/// # Example
///
/// ```rust
/// use docsync_core::operation::{NodeChange, Operation};
/// use docsync_core::tree::SerializedNode;
///
/// let op = Operation::created(
///     "alice",
///     NodeChange::new(SerializedNode::paragraph().with_sync_id("p1".into())),
/// );
/// let json = serde_json::to_value(&op).unwrap();
///
/// assert_eq!(json["type"], "created");
/// assert_eq!(json["author"], "alice");
/// assert_eq!(json["node"]["syncId"], "p1");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Log position, assigned once the log accepts the operation
    #[serde(rename = "sequenceId", default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceId>,

    pub author: AuthorId,

    #[serde(flatten)]
    pub kind: OperationKind,
}

impl Operation {
    pub fn new(author: impl Into<AuthorId>, kind: OperationKind) -> Self {
        Self {
            sequence: None,
            author: author.into(),
            kind,
        }
    }

    pub fn created(author: impl Into<AuthorId>, change: NodeChange) -> Self {
        Self::new(author, OperationKind::Created(change))
    }

    pub fn updated(author: impl Into<AuthorId>, change: NodeChange) -> Self {
        Self::new(author, OperationKind::Updated(change))
    }

    pub fn destroyed(author: impl Into<AuthorId>, change: NodeChange) -> Self {
        Self::new(author, OperationKind::Destroyed(change))
    }

    pub fn cursor(author: impl Into<AuthorId>, cursor: CursorChange) -> Self {
        Self::new(author, OperationKind::Cursor(cursor))
    }

    pub fn with_sequence(mut self, sequence: SequenceId) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Node payload of structural operations
    pub fn change(&self) -> Option<&NodeChange> {
        match &self.kind {
            OperationKind::Created(c) | OperationKind::Updated(c) | OperationKind::Destroyed(c) => {
                Some(c)
            }
            OperationKind::Cursor(_) => None,
        }
    }

    /// Identity of the node this operation targets
    pub fn target(&self) -> Option<&SyncId> {
        self.change().and_then(NodeChange::sync_id)
    }

    pub fn is_cursor(&self) -> bool {
        matches!(self.kind, OperationKind::Cursor(_))
    }

    /// Short name for logging
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            OperationKind::Created(_) => "created",
            OperationKind::Updated(_) => "updated",
            OperationKind::Destroyed(_) => "destroyed",
            OperationKind::Cursor(_) => "cursor",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_updated_wire_shape() {
        let op = Operation::updated(
            "bob",
            NodeChange::new(SerializedNode::text("blue ").with_sync_id("t1".into()))
                .under(Some("p1".into()))
                .replacing(SerializedNode::text("red ").with_sync_id("t1".into())),
        )
        .with_sequence(SequenceId::new(10, 1));

        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(
            json,
            json!({
                "sequenceId": "10-1",
                "author": "bob",
                "type": "updated",
                "node": { "type": "text", "syncId": "t1", "text": "blue " },
                "parentId": "p1",
                "previousNode": { "type": "text", "syncId": "t1", "text": "red " }
            })
        );

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_cursor_wire_shape() {
        let op: Operation = serde_json::from_value(json!({
            "author": "carol",
            "type": "cursor",
            "anchorId": "t1",
            "anchorOffset": 2,
            "focusId": "t2",
            "focusOffset": 0,
            "lastActivity": 1000
        }))
        .unwrap();

        assert!(op.is_cursor());
        assert_eq!(op.sequence, None);
        assert_eq!(op.target(), None);
        match op.kind {
            OperationKind::Cursor(c) => {
                assert_eq!(c.anchor_id, SyncId::from("t1"));
                assert_eq!(c.focus_offset, 0);
                assert_eq!(c.last_activity, 1000);
            }
            other => panic!("expected cursor, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result = serde_json::from_value::<Operation>(json!({
            "author": "x",
            "type": "moved",
            "node": { "type": "text" }
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_cursor_position_ignores_activity() {
        let a = CursorChange {
            anchor_id: "t1".into(),
            anchor_offset: 1,
            focus_id: "t1".into(),
            focus_offset: 1,
            last_activity: 5,
        };
        let b = CursorChange {
            last_activity: 99,
            ..a.clone()
        };
        assert!(a.same_position(&b));
        assert!(!a.same_position(&CursorChange {
            focus_offset: 2,
            ..a.clone()
        }));
    }
}
