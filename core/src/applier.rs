//! Applier / Reverser
//!
//! Writes operations into the host tree: remote operations from the log,
//! and local history entries replayed by undo and redo. Callers open and
//! commit the host update; the applier only mutates inside it.
//!
//! Placement of a created node:
//!
//! 1. after `previousId`, when set;
//! 2. otherwise first under `parentId` (which must be an element);
//! 3. otherwise first under the root (text may not sit directly under it).
//!
//! A `created` for a SyncId that is already live degrades to an update, and
//! an `updated` whose declared parent differs from the live one is a move.

use tracing::{debug, trace};

use crate::error::{Result, SyncError};
use crate::identity::IdentityMap;
use crate::ids::SyncId;
use crate::operation::{CursorChange, NodeChange, Operation, OperationKind};
use crate::presence::{Presence, PresenceTracker};
use crate::tree::{HostTree, NodeKey, Point};

enum Placement {
    After(NodeKey),
    Before(NodeKey),
    Append(NodeKey),
}

/// Applies and reverses operations against one host tree
pub struct Applier<'a, T: HostTree + ?Sized> {
    tree: &'a mut T,
    identities: &'a mut IdentityMap,
    presence: &'a mut PresenceTracker,
    now_ms: i64,
}

impl<'a, T: HostTree + ?Sized> Applier<'a, T> {
    pub fn new(
        tree: &'a mut T,
        identities: &'a mut IdentityMap,
        presence: &'a mut PresenceTracker,
        now_ms: i64,
    ) -> Self {
        Self {
            tree,
            identities,
            presence,
            now_ms,
        }
    }

    /// Apply one operation
    pub fn apply(&mut self, op: &Operation) -> Result<()> {
        trace!(kind = op.kind_name(), author = %op.author, "applying operation");
        match &op.kind {
            OperationKind::Created(change) => self.create(change),
            OperationKind::Updated(change) => self.update(change),
            OperationKind::Destroyed(change) => self.destroy(change),
            OperationKind::Cursor(cursor) => {
                self.cursor(&op.author, cursor);
                Ok(())
            }
        }
    }

    /// Undo the effect of one operation
    pub fn reverse(&mut self, op: &Operation) -> Result<()> {
        trace!(kind = op.kind_name(), "reversing operation");
        match &op.kind {
            OperationKind::Created(change) => {
                let id = Self::identity(change)?;
                // Already gone, e.g. removed along with a reversed parent
                if let Some(key) = self.live(id) {
                    self.identities.remove(id);
                    self.tree.remove(key)?;
                }
                Ok(())
            }
            OperationKind::Updated(change) => {
                let id = Self::identity(change)?;
                let mut previous = change.previous_node.clone().ok_or_else(|| {
                    SyncError::Protocol(format!("update of {} has no previous node", id))
                })?;
                previous.sync_id = Some(id.clone());
                self.update(&NodeChange {
                    node: previous,
                    previous_id: change.previous_id.clone(),
                    parent_id: change.parent_id.clone(),
                    previous_node: None,
                })
            }
            OperationKind::Destroyed(change) => self.create(change),
            OperationKind::Cursor(_) => Ok(()),
        }
    }

    fn identity(change: &NodeChange) -> Result<&SyncId> {
        change
            .sync_id()
            .ok_or_else(|| SyncError::Protocol("operation node has no syncId".into()))
    }

    /// Resolve to a live handle, forgetting mappings to dead ones
    fn live(&mut self, id: &SyncId) -> Option<NodeKey> {
        let key = self.identities.resolve(id)?;
        if self.tree.contains(key) {
            Some(key)
        } else {
            self.identities.remove(id);
            None
        }
    }

    fn require(&mut self, id: &SyncId) -> Result<NodeKey> {
        self.live(id)
            .ok_or_else(|| SyncError::MissingTarget(id.clone()))
    }

    fn placement(&mut self, change: &NodeChange) -> Result<Placement> {
        if let Some(previous) = &change.previous_id {
            return Ok(Placement::After(self.require(previous)?));
        }
        let parent = match &change.parent_id {
            Some(parent) => {
                let key = self.require(parent)?;
                if !self.tree.is_element(key) {
                    return Err(SyncError::Structural(format!(
                        "parent {} cannot hold children",
                        parent
                    )));
                }
                key
            }
            None => self.tree.root(),
        };
        Ok(match self.tree.first_child(parent) {
            Some(first) => Placement::Before(first),
            None => Placement::Append(parent),
        })
    }

    fn create(&mut self, change: &NodeChange) -> Result<()> {
        let id = Self::identity(change)?;
        if let Some(key) = self.live(id) {
            debug!(sync_id = %id, "create of a live node; applying as update");
            return self.tree.update_from(key, &change.node);
        }

        let placement = self.placement(change)?;
        let parent = match placement {
            Placement::After(anchor) | Placement::Before(anchor) => self.tree.parent(anchor),
            Placement::Append(parent) => Some(parent),
        };

        let key = self.tree.construct(&change.node.shallow())?;
        if parent == Some(self.tree.root()) && self.tree.is_text(key) {
            // Never attached; the host drops it on commit
            return Err(SyncError::Structural(format!(
                "text node {} cannot be placed under the root",
                id
            )));
        }

        match placement {
            Placement::After(anchor) => self.tree.insert_after(anchor, key)?,
            Placement::Before(anchor) => self.tree.insert_before(anchor, key)?,
            Placement::Append(parent) => self.tree.append_child(parent, key)?,
        }
        self.identities.set(id.clone(), key)
    }

    fn update(&mut self, change: &NodeChange) -> Result<()> {
        let id = Self::identity(change)?;
        let key = self.require(id)?;

        let root = self.tree.root();
        let live_parent = self
            .tree
            .parent(key)
            .filter(|parent| *parent != root)
            .and_then(|parent| self.tree.sync_id(parent));

        if live_parent != change.parent_id {
            debug!(sync_id = %id, "parent changed; moving node");
            self.identities.remove(id);
            self.tree.remove(key)?;
            return self.create(change);
        }
        self.tree.update_from(key, &change.node)
    }

    fn destroy(&mut self, change: &NodeChange) -> Result<()> {
        let id = Self::identity(change)?;
        let key = self.require(id)?;
        self.identities.remove(id);
        self.tree.remove(key)
    }

    fn cursor(&mut self, author: &str, cursor: &CursorChange) {
        let anchor = self.live(&cursor.anchor_id);
        let focus = self.live(&cursor.focus_id);

        match (anchor, focus) {
            (Some(anchor), Some(focus))
                if !self.presence.is_expired(cursor.last_activity, self.now_ms) =>
            {
                self.presence.update(Presence {
                    author: author.to_string(),
                    anchor: Point::new(anchor, cursor.anchor_offset),
                    focus: Point::new(focus, cursor.focus_offset),
                    last_activity: cursor.last_activity,
                });
            }
            _ => {
                self.presence.clear(author);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{MemoryTree, SerializedNode, UpdateTags};

    struct Fixture {
        tree: MemoryTree,
        ids: IdentityMap,
        presence: PresenceTracker,
    }

    impl Fixture {
        fn new() -> Self {
            let tree = MemoryTree::new();
            let ids = IdentityMap::new(tree.root());
            Self {
                tree,
                ids,
                presence: PresenceTracker::new(),
            }
        }

        fn apply(&mut self, op: &Operation) -> Result<()> {
            self.tree.begin_update(UpdateTags::none());
            let result = Applier::new(&mut self.tree, &mut self.ids, &mut self.presence, 50_000).apply(op);
            self.tree.commit_update();
            result
        }

        fn reverse(&mut self, op: &Operation) -> Result<()> {
            self.tree.begin_update(UpdateTags::none());
            let result = Applier::new(&mut self.tree, &mut self.ids, &mut self.presence, 50_000).reverse(op);
            self.tree.commit_update();
            result
        }
    }

    fn paragraph(id: &str) -> Operation {
        Operation::created(
            "remote",
            NodeChange::new(SerializedNode::paragraph().with_sync_id(id.into())),
        )
    }

    fn text(id: &str, content: &str) -> SerializedNode {
        SerializedNode::text(content).with_sync_id(id.into())
    }

    #[test]
    fn test_create_placements() {
        let mut f = Fixture::new();
        f.apply(&paragraph("p1")).unwrap();
        f.apply(&Operation::created(
            "remote",
            NodeChange::new(text("b", "b")).under(Some("p1".into())),
        ))
        .unwrap();
        f.apply(&Operation::created(
            "remote",
            NodeChange::new(text("a", "a")).under(Some("p1".into())),
        ))
        .unwrap();
        f.apply(&Operation::created(
            "remote",
            NodeChange::new(text("c", "c"))
                .after(Some("b".into()))
                .under(Some("p1".into())),
        ))
        .unwrap();

        assert_eq!(f.tree.text_content(), "abc");
        assert_eq!(f.ids.len(), 4);
    }

    #[test]
    fn test_text_under_root_rejected() {
        let mut f = Fixture::new();
        let err = f
            .apply(&Operation::created("remote", NodeChange::new(text("t", "x"))))
            .unwrap_err();
        assert!(matches!(err, SyncError::Structural(_)));
        assert!(f.tree.is_empty());
        assert_eq!(f.ids.resolve(&"t".into()), None);
    }

    #[test]
    fn test_unknown_type_and_missing_target() {
        let mut f = Fixture::new();
        let video = Operation::created(
            "remote",
            NodeChange::new(SerializedNode::new("video").with_sync_id("v".into())),
        );
        assert!(matches!(f.apply(&video), Err(SyncError::UnknownNodeType(_))));

        let orphan = Operation::created(
            "remote",
            NodeChange::new(text("t", "x")).under(Some("nowhere".into())),
        );
        assert_eq!(f.apply(&orphan), Err(SyncError::MissingTarget("nowhere".into())));
    }

    #[test]
    fn test_duplicate_create_degrades_to_update() {
        let mut f = Fixture::new();
        f.apply(&paragraph("p1")).unwrap();
        let create = |content: &str| {
            Operation::created(
                "remote",
                NodeChange::new(text("t1", content)).under(Some("p1".into())),
            )
        };
        f.apply(&create("one")).unwrap();
        f.apply(&create("two")).unwrap();

        assert_eq!(f.tree.len(), 2);
        assert_eq!(f.tree.text_content(), "two");
    }

    #[test]
    fn test_update_in_place_and_move() {
        let mut f = Fixture::new();
        f.apply(&paragraph("p1")).unwrap();
        f.apply(&paragraph("p2")).unwrap();
        f.apply(&Operation::created(
            "remote",
            NodeChange::new(text("t", "x")).under(Some("p1".into())),
        ))
        .unwrap();

        f.apply(&Operation::updated(
            "remote",
            NodeChange::new(text("t", "y")).under(Some("p1".into())),
        ))
        .unwrap();
        let t = f.ids.resolve(&"t".into()).unwrap();
        assert_eq!(f.tree.text(t).as_deref(), Some("y"));

        f.apply(&Operation::updated(
            "remote",
            NodeChange::new(text("t", "z")).under(Some("p2".into())),
        ))
        .unwrap();
        let moved = f.ids.resolve(&"t".into()).unwrap();
        let p2 = f.ids.resolve(&"p2".into()).unwrap();
        assert_eq!(f.tree.parent(moved), Some(p2));
        assert_eq!(f.tree.len(), 3);
    }

    #[test]
    fn test_destroy_and_reverse() {
        let mut f = Fixture::new();
        f.apply(&paragraph("p1")).unwrap();
        f.apply(&Operation::created(
            "remote",
            NodeChange::new(text("t", "x")).under(Some("p1".into())),
        ))
        .unwrap();
        let before = f.tree.export_document();

        let destroy = Operation::destroyed(
            "remote",
            NodeChange::new(text("t", "x")).under(Some("p1".into())),
        );
        f.apply(&destroy).unwrap();
        assert_eq!(f.tree.text_content(), "");
        assert_eq!(f.apply(&destroy), Err(SyncError::MissingTarget("t".into())));

        f.reverse(&destroy).unwrap();
        assert_eq!(f.tree.export_document(), before);
    }

    #[test]
    fn test_reverse_update_restores_previous_payload() {
        let mut f = Fixture::new();
        f.apply(&paragraph("p1")).unwrap();
        f.apply(&Operation::created(
            "remote",
            NodeChange::new(text("t", "red ")).under(Some("p1".into())),
        ))
        .unwrap();
        let update = Operation::updated(
            "remote",
            NodeChange::new(text("t", "blue "))
                .under(Some("p1".into()))
                .replacing(text("t", "red ")),
        );

        f.apply(&update).unwrap();
        assert_eq!(f.tree.text_content(), "blue ");
        f.reverse(&update).unwrap();
        assert_eq!(f.tree.text_content(), "red ");
    }

    #[test]
    fn test_cursor_presence() {
        let mut f = Fixture::new();
        f.apply(&paragraph("p1")).unwrap();
        f.apply(&Operation::created(
            "remote",
            NodeChange::new(text("t", "hi")).under(Some("p1".into())),
        ))
        .unwrap();

        let cursor = |id: &str, at: i64| {
            Operation::cursor(
                "bob",
                CursorChange {
                    anchor_id: id.into(),
                    anchor_offset: 1,
                    focus_id: id.into(),
                    focus_offset: 2,
                    last_activity: at,
                },
            )
        };

        f.apply(&cursor("t", 49_000)).unwrap();
        let presence = f.presence.get("bob").unwrap();
        assert_eq!(presence.focus.offset, 2);

        f.apply(&cursor("gone", 49_500)).unwrap();
        assert!(f.presence.get("bob").is_none());

        f.apply(&cursor("t", 49_000)).unwrap();
        f.apply(&cursor("t", 50_000 - 11_000)).unwrap();
        assert!(f.presence.get("bob").is_none(), "stale cursor clears presence");
    }
}
