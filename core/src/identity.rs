//! Identity Map
//!
//! Bidirectional mapping between durable [`SyncId`]s and the host's local
//! [`NodeKey`] handles. One live handle per SyncId per replica; the root is
//! never entered.

use std::collections::HashMap;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::ids::SyncId;
use crate::tree::{HostTree, NodeKey};

/// SyncId ⇄ NodeKey map
///
/// # Example
///
/// ```rust
/// use docsync_core::identity::IdentityMap;
/// use docsync_core::tree::NodeKey;
///
/// let mut map = IdentityMap::new(NodeKey(0));
/// map.set("p1".into(), NodeKey(1)).unwrap();
///
/// assert_eq!(map.resolve(&"p1".into()), Some(NodeKey(1)));
/// assert!(map.set("p1".into(), NodeKey(2)).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct IdentityMap {
    root: NodeKey,
    forward: HashMap<SyncId, NodeKey>,
    reverse: HashMap<NodeKey, SyncId>,
}

impl IdentityMap {
    /// Create an empty map for a tree with the given root
    pub fn new(root: NodeKey) -> Self {
        Self {
            root,
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Bind `id` to `key`
    ///
    /// Binding the same pair again is a no-op, as is binding the root. An id
    /// already bound to another handle is rejected and the old binding kept.
    pub fn set(&mut self, id: SyncId, key: NodeKey) -> Result<()> {
        if key == self.root {
            return Ok(());
        }
        match self.forward.get(&id) {
            Some(existing) if *existing == key => Ok(()),
            Some(existing) => Err(SyncError::DuplicateIdentity {
                id,
                existing: *existing,
                rejected: key,
            }),
            None => {
                self.insert(id, key);
                Ok(())
            }
        }
    }

    /// Bind `id` to `key`, dropping whatever either side was bound to
    pub fn rebind(&mut self, id: SyncId, key: NodeKey) {
        if key == self.root {
            return;
        }
        if let Some(old_key) = self.forward.remove(&id) {
            self.reverse.remove(&old_key);
        }
        if let Some(old_id) = self.reverse.remove(&key) {
            self.forward.remove(&old_id);
        }
        self.insert(id, key);
    }

    fn insert(&mut self, id: SyncId, key: NodeKey) {
        // A handle carries one identity; drop a stale one it may still have
        if let Some(old_id) = self.reverse.insert(key, id.clone()) {
            if old_id != id {
                self.forward.remove(&old_id);
            }
        }
        self.forward.insert(id, key);
    }

    pub fn resolve(&self, id: &SyncId) -> Option<NodeKey> {
        self.forward.get(id).copied()
    }

    /// Unbind `id`, returning the handle it was bound to
    pub fn remove(&mut self, id: &SyncId) -> Option<NodeKey> {
        let key = self.forward.remove(id)?;
        self.reverse.remove(&key);
        Some(key)
    }

    pub fn reverse_lookup(&self, key: NodeKey) -> Option<&SyncId> {
        self.reverse.get(&key)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    /// Rebuild the map from a depth-first walk of the tree
    ///
    /// Nodes without a SyncId are skipped. Returns how many bindings were
    /// rejected as duplicates.
    pub fn populate<T: HostTree + ?Sized>(&mut self, tree: &T) -> usize {
        self.clear();
        self.root = tree.root();

        let mut rejected = 0;
        for key in crate::tree::depth_first(tree) {
            if let Some(id) = tree.sync_id(key) {
                if let Err(err) = self.set(id, key) {
                    warn!(error = %err, "skipping node during identity population");
                    rejected += 1;
                }
            }
        }
        rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{MemoryTree, SerializedNode, UpdateTags};

    #[test]
    fn test_set_is_idempotent_and_rejects_duplicates() {
        let mut map = IdentityMap::new(NodeKey(0));
        map.set("a".into(), NodeKey(1)).unwrap();
        map.set("a".into(), NodeKey(1)).unwrap();
        assert_eq!(map.len(), 1);

        let err = map.set("a".into(), NodeKey(2)).unwrap_err();
        assert_eq!(
            err,
            SyncError::DuplicateIdentity {
                id: "a".into(),
                existing: NodeKey(1),
                rejected: NodeKey(2),
            }
        );
        assert_eq!(map.resolve(&"a".into()), Some(NodeKey(1)));
    }

    #[test]
    fn test_root_is_never_mapped() {
        let mut map = IdentityMap::new(NodeKey(0));
        map.set("root".into(), NodeKey(0)).unwrap();
        map.rebind("root".into(), NodeKey(0));
        assert!(map.is_empty());
    }

    #[test]
    fn test_rebind_cleans_both_sides() {
        let mut map = IdentityMap::new(NodeKey(0));
        map.set("a".into(), NodeKey(1)).unwrap();
        map.set("b".into(), NodeKey(2)).unwrap();

        map.rebind("a".into(), NodeKey(2));

        assert_eq!(map.resolve(&"a".into()), Some(NodeKey(2)));
        assert_eq!(map.resolve(&"b".into()), None);
        assert_eq!(map.reverse_lookup(NodeKey(1)), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut map = IdentityMap::new(NodeKey(0));
        map.set("a".into(), NodeKey(1)).unwrap();

        assert_eq!(map.remove(&"a".into()), Some(NodeKey(1)));
        assert_eq!(map.remove(&"a".into()), None);
        assert_eq!(map.reverse_lookup(NodeKey(1)), None);
    }

    #[test]
    fn test_populate_from_tree() {
        let mut tree = MemoryTree::new();
        tree.begin_update(UpdateTags::none());
        let p = tree.construct(&SerializedNode::paragraph().with_sync_id("p1".into())).unwrap();
        tree.append_child(tree.root(), p).unwrap();
        let t = tree.construct(&SerializedNode::text("hi").with_sync_id("t1".into())).unwrap();
        tree.append_child(p, t).unwrap();
        let unset = tree.append_text(p, "x").unwrap();
        tree.commit_update();

        let mut map = IdentityMap::new(tree.root());
        map.set("stale".into(), NodeKey(99)).unwrap();
        assert_eq!(map.populate(&tree), 0);

        assert_eq!(map.len(), 2);
        assert_eq!(map.resolve(&"p1".into()), Some(p));
        assert_eq!(map.resolve(&"t1".into()), Some(t));
        assert_eq!(map.reverse_lookup(unset), None);
        assert_eq!(map.resolve(&"stale".into()), None);
    }
}
