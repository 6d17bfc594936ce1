//! In-memory host tree
//!
//! A small document engine implementing [`HostTree`]: element and text
//! nodes, transactions that snapshot the pre-update state, mutation tracking
//! in first-touch order, and garbage collection of detached nodes on commit.
//!
//! # Example
//!
//! ```rust
//! use docsync_core::tree::{HostTree, MemoryTree, UpdateTags};
//!
//! let mut tree = MemoryTree::new();
//! tree.begin_update(UpdateTags::none());
//! let paragraph = tree.append_paragraph().unwrap();
//! tree.append_text(paragraph, "hi").unwrap();
//! let batch = tree.commit_update();
//!
//! assert_eq!(batch.mutations.len(), 2);
//! assert_eq!(tree.text_content(), "hi");
//! ```

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use super::{
    HostTree, Mutation, MutationBatch, MutationKind, NodeKey, PreviousNode, Selection,
    SerializedDocument, SerializedNode, UpdateTags, PARAGRAPH_TYPE, ROOT_TYPE, TEXT_FIELD,
    TEXT_TYPE,
};
use crate::error::{Result, SyncError};
use crate::ids::SyncId;

/// How a registered node type behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Can hold children
    Element,

    /// Leaf carrying a `text` field
    Text,
}

#[derive(Debug, Clone)]
struct NodeRecord {
    node_type: String,
    sync_id: Option<SyncId>,
    parent: Option<NodeKey>,
    children: Vec<NodeKey>,
    fields: Map<String, Value>,
}

impl NodeRecord {
    fn shallow(&self) -> SerializedNode {
        SerializedNode {
            node_type: self.node_type.clone(),
            sync_id: self.sync_id.clone(),
            children: Vec::new(),
            fields: self.fields.clone(),
        }
    }
}

#[derive(Debug)]
struct Transaction {
    tags: UpdateTags,
    before: HashMap<NodeKey, NodeRecord>,
    touched: Vec<NodeKey>,
    touched_set: HashSet<NodeKey>,
}

/// In-memory document tree
#[derive(Debug)]
pub struct MemoryTree {
    nodes: HashMap<NodeKey, NodeRecord>,
    root: NodeKey,
    next_key: u64,
    kinds: HashMap<String, NodeKind>,
    selection: Option<Selection>,
    txn: Option<Transaction>,
}

fn is_attached(nodes: &HashMap<NodeKey, NodeRecord>, root: NodeKey, key: NodeKey) -> bool {
    let mut current = key;
    // Parent chains are acyclic; the bound only guards against corrupt input
    for _ in 0..=nodes.len() {
        if current == root {
            return true;
        }
        match nodes.get(&current).and_then(|r| r.parent) {
            Some(parent) => current = parent,
            None => return false,
        }
    }
    false
}

fn previous_in(
    nodes: &HashMap<NodeKey, NodeRecord>,
    parent: Option<NodeKey>,
    key: NodeKey,
) -> Option<NodeKey> {
    let siblings = &nodes.get(&parent?)?.children;
    let index = siblings.iter().position(|k| *k == key)?;
    index.checked_sub(1).map(|i| siblings[i])
}

impl MemoryTree {
    /// Empty document with `paragraph` and `text` types registered
    pub fn new() -> Self {
        let root = NodeKey(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            NodeRecord {
                node_type: ROOT_TYPE.to_string(),
                sync_id: None,
                parent: None,
                children: Vec::new(),
                fields: Map::new(),
            },
        );

        let mut kinds = HashMap::new();
        kinds.insert(PARAGRAPH_TYPE.to_string(), NodeKind::Element);
        kinds.insert(TEXT_TYPE.to_string(), NodeKind::Text);

        Self {
            nodes,
            root,
            next_key: 1,
            kinds,
            selection: None,
            txn: None,
        }
    }

    /// Teach the tree to construct another node type
    pub fn register_type(&mut self, name: &str, kind: NodeKind) {
        self.kinds.insert(name.to_string(), kind);
    }

    /// Append a new paragraph to the root
    pub fn append_paragraph(&mut self) -> Result<NodeKey> {
        let key = self.construct(&SerializedNode::paragraph())?;
        self.append_child(self.root, key)?;
        Ok(key)
    }

    /// Append a new text node under `parent`
    pub fn append_text(&mut self, parent: NodeKey, text: &str) -> Result<NodeKey> {
        let key = self.construct(&SerializedNode::text(text))?;
        self.append_child(parent, key)?;
        Ok(key)
    }

    /// Live node carrying the given identity
    pub fn find(&self, id: &SyncId) -> Option<NodeKey> {
        self.nodes
            .iter()
            .filter(|(_, record)| record.sync_id.as_ref() == Some(id))
            .map(|(key, _)| *key)
            .find(|key| self.contains(*key))
    }

    /// Plain text of the document
    pub fn text_content(&self) -> String {
        self.export_document().text()
    }

    /// Number of live nodes, root excluded
    pub fn len(&self) -> usize {
        super::depth_first(self).len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[&self.root].children.is_empty()
    }

    fn kind_of(&self, node_type: &str) -> Option<NodeKind> {
        self.kinds.get(node_type).copied()
    }

    fn record(&self, key: NodeKey) -> Result<&NodeRecord> {
        self.nodes
            .get(&key)
            .ok_or_else(|| SyncError::Structural(format!("node {} does not exist", key)))
    }

    fn record_mut(&mut self, key: NodeKey) -> Result<&mut NodeRecord> {
        self.nodes
            .get_mut(&key)
            .ok_or_else(|| SyncError::Structural(format!("node {} does not exist", key)))
    }

    fn touch(&mut self, key: NodeKey) {
        if let Some(txn) = self.txn.as_mut() {
            if txn.touched_set.insert(key) {
                txn.touched.push(key);
            }
        }
    }

    fn is_ancestor_or_self(&self, candidate: NodeKey, key: NodeKey) -> bool {
        let mut current = Some(key);
        while let Some(k) = current {
            if k == candidate {
                return true;
            }
            current = self.nodes.get(&k).and_then(|r| r.parent);
        }
        false
    }

    fn detach(&mut self, key: NodeKey) {
        let parent = self.nodes.get_mut(&key).and_then(|r| r.parent.take());
        if let Some(parent) = parent {
            if let Some(record) = self.nodes.get_mut(&parent) {
                record.children.retain(|k| *k != key);
            }
            self.touch(parent);
        }
    }

    fn subtree(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut stack = vec![key];
        while let Some(k) = stack.pop() {
            out.push(k);
            if let Some(record) = self.nodes.get(&k) {
                stack.extend(record.children.iter().rev().copied());
            }
        }
        out
    }

    fn check_insertable(&self, target: NodeKey, key: NodeKey) -> Result<()> {
        self.record(key)?;
        if key == self.root {
            return Err(SyncError::Structural("the root cannot be moved".into()));
        }
        if self.is_ancestor_or_self(key, target) {
            return Err(SyncError::Structural(format!(
                "inserting {} relative to {} would create a cycle",
                key, target
            )));
        }
        Ok(())
    }

    fn insert_sibling(&mut self, anchor: NodeKey, key: NodeKey, after: bool) -> Result<()> {
        self.check_insertable(anchor, key)?;
        let parent = self.record(anchor)?.parent.ok_or_else(|| {
            SyncError::Structural(format!("anchor {} has no parent", anchor))
        })?;
        self.detach(key);

        let siblings = &mut self.record_mut(parent)?.children;
        let index = siblings
            .iter()
            .position(|k| *k == anchor)
            .ok_or_else(|| SyncError::Structural(format!("anchor {} not under its parent", anchor)))?;
        siblings.insert(if after { index + 1 } else { index }, key);

        self.record_mut(key)?.parent = Some(parent);
        self.touch(parent);
        self.touch(key);
        Ok(())
    }

    fn build(&mut self, node: &SerializedNode, parent: NodeKey) -> Result<()> {
        let key = self.construct(&node.shallow())?;
        self.append_child(parent, key)?;
        for child in &node.children {
            self.build(child, key)?;
        }
        Ok(())
    }

    fn export_deep(&self, key: NodeKey) -> SerializedNode {
        let record = &self.nodes[&key];
        let mut node = record.shallow();
        node.children = record
            .children
            .iter()
            .map(|child| self.export_deep(*child))
            .collect();
        node
    }

    fn collect_garbage(&mut self) {
        let root = self.root;
        let dead: Vec<NodeKey> = self
            .nodes
            .keys()
            .copied()
            .filter(|key| !is_attached(&self.nodes, root, *key))
            .collect();
        for key in dead {
            self.nodes.remove(&key);
        }

        if let Some(selection) = self.selection {
            if !self.contains(selection.anchor.key) || !self.contains(selection.focus.key) {
                self.selection = None;
            }
        }
    }
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTree for MemoryTree {
    fn root(&self) -> NodeKey {
        self.root
    }

    fn contains(&self, key: NodeKey) -> bool {
        self.nodes.contains_key(&key) && is_attached(&self.nodes, self.root, key)
    }

    fn node_type(&self, key: NodeKey) -> Option<&str> {
        self.nodes.get(&key).map(|r| r.node_type.as_str())
    }

    fn is_element(&self, key: NodeKey) -> bool {
        key == self.root
            || self
                .node_type(key)
                .and_then(|t| self.kind_of(t))
                .map_or(false, |kind| kind == NodeKind::Element)
    }

    fn is_text(&self, key: NodeKey) -> bool {
        self.node_type(key)
            .and_then(|t| self.kind_of(t))
            .map_or(false, |kind| kind == NodeKind::Text)
    }

    fn parent(&self, key: NodeKey) -> Option<NodeKey> {
        self.nodes.get(&key).and_then(|r| r.parent)
    }

    fn previous_sibling(&self, key: NodeKey) -> Option<NodeKey> {
        previous_in(&self.nodes, self.parent(key), key)
    }

    fn next_sibling(&self, key: NodeKey) -> Option<NodeKey> {
        let siblings = &self.nodes.get(&self.parent(key)?)?.children;
        let index = siblings.iter().position(|k| *k == key)?;
        siblings.get(index + 1).copied()
    }

    fn first_child(&self, key: NodeKey) -> Option<NodeKey> {
        self.nodes.get(&key)?.children.first().copied()
    }

    fn children(&self, key: NodeKey) -> Vec<NodeKey> {
        self.nodes
            .get(&key)
            .map(|r| r.children.clone())
            .unwrap_or_default()
    }

    fn sync_id(&self, key: NodeKey) -> Option<SyncId> {
        self.nodes.get(&key).and_then(|r| r.sync_id.clone())
    }

    fn set_sync_id(&mut self, key: NodeKey, id: SyncId) -> Result<()> {
        if key == self.root {
            return Err(SyncError::Structural("the root carries no identity".into()));
        }
        self.record_mut(key)?.sync_id = Some(id);
        self.touch(key);
        Ok(())
    }

    fn text(&self, key: NodeKey) -> Option<String> {
        if !self.is_text(key) {
            return None;
        }
        self.nodes
            .get(&key)
            .and_then(|r| r.fields.get(TEXT_FIELD))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn set_text(&mut self, key: NodeKey, text: &str) -> Result<()> {
        if !self.is_text(key) {
            return Err(SyncError::Structural(format!("{} is not a text node", key)));
        }
        self.record_mut(key)?
            .fields
            .insert(TEXT_FIELD.to_string(), Value::from(text));
        self.touch(key);
        Ok(())
    }

    fn export_node(&self, key: NodeKey) -> Option<SerializedNode> {
        if !self.contains(key) {
            return None;
        }
        self.nodes.get(&key).map(NodeRecord::shallow)
    }

    fn construct(&mut self, node: &SerializedNode) -> Result<NodeKey> {
        let kind = match self.kind_of(&node.node_type) {
            Some(kind) if node.node_type != ROOT_TYPE => kind,
            _ => return Err(SyncError::UnknownNodeType(node.node_type.clone())),
        };

        let mut fields = node.fields.clone();
        if kind == NodeKind::Text && !fields.contains_key(TEXT_FIELD) {
            fields.insert(TEXT_FIELD.to_string(), Value::from(""));
        }

        let key = NodeKey(self.next_key);
        self.next_key += 1;
        self.nodes.insert(
            key,
            NodeRecord {
                node_type: node.node_type.clone(),
                sync_id: node.sync_id.clone(),
                parent: None,
                children: Vec::new(),
                fields,
            },
        );
        self.touch(key);
        Ok(key)
    }

    fn update_from(&mut self, key: NodeKey, node: &SerializedNode) -> Result<()> {
        let record = self.record_mut(key)?;
        record.fields = node.fields.clone();
        if node.sync_id.is_some() {
            record.sync_id = node.sync_id.clone();
        }
        self.touch(key);
        Ok(())
    }

    fn insert_after(&mut self, anchor: NodeKey, key: NodeKey) -> Result<()> {
        self.insert_sibling(anchor, key, true)
    }

    fn insert_before(&mut self, anchor: NodeKey, key: NodeKey) -> Result<()> {
        self.insert_sibling(anchor, key, false)
    }

    fn append_child(&mut self, parent: NodeKey, key: NodeKey) -> Result<()> {
        self.check_insertable(parent, key)?;
        if !self.is_element(parent) {
            return Err(SyncError::Structural(format!(
                "{} is not an element and cannot hold children",
                parent
            )));
        }
        self.detach(key);
        self.record_mut(parent)?.children.push(key);
        self.record_mut(key)?.parent = Some(parent);
        self.touch(parent);
        self.touch(key);
        Ok(())
    }

    fn remove(&mut self, key: NodeKey) -> Result<()> {
        if key == self.root {
            return Err(SyncError::Structural("the root cannot be removed".into()));
        }
        self.record(key)?;
        self.detach(key);
        for k in self.subtree(key) {
            self.touch(k);
        }
        if self.txn.is_none() {
            self.collect_garbage();
        }
        Ok(())
    }

    fn selection(&self) -> Option<Selection> {
        self.selection
    }

    fn set_selection(&mut self, selection: Option<Selection>) {
        self.selection = selection;
    }

    fn begin_update(&mut self, tags: UpdateTags) {
        if self.txn.is_some() {
            warn!("begin_update while an update is open; joining it");
            return;
        }
        self.txn = Some(Transaction {
            tags,
            before: self.nodes.clone(),
            touched: Vec::new(),
            touched_set: HashSet::new(),
        });
    }

    fn dirty_text_nodes(&self) -> Vec<NodeKey> {
        match &self.txn {
            Some(txn) => txn
                .touched
                .iter()
                .copied()
                .filter(|key| self.is_text(*key) && self.contains(*key))
                .collect(),
            None => Vec::new(),
        }
    }

    fn commit_update(&mut self) -> MutationBatch {
        let Some(txn) = self.txn.take() else {
            return MutationBatch::default();
        };

        let mut batch = MutationBatch {
            tags: txn.tags.clone(),
            ..Default::default()
        };

        for key in txn.touched.iter().copied() {
            if key == self.root {
                continue;
            }
            let before = txn
                .before
                .get(&key)
                .filter(|_| is_attached(&txn.before, self.root, key));
            let kind = match (before.is_some(), self.contains(key)) {
                (false, true) => MutationKind::Created,
                (true, false) => MutationKind::Destroyed,
                (true, true) => MutationKind::Updated,
                (false, false) => continue,
            };

            let node_type = self
                .nodes
                .get(&key)
                .or(before)
                .map(|r| r.node_type.as_str())
                .unwrap_or_default();
            let is_element = self.kind_of(node_type) == Some(NodeKind::Element);

            if let Some(record) = before {
                batch.previous.insert(
                    key,
                    PreviousNode {
                        node: record.shallow(),
                        parent: record.parent,
                        previous: previous_in(&txn.before, record.parent, key),
                    },
                );
            }
            batch.mutations.push(Mutation {
                key,
                kind,
                is_element,
            });
        }

        self.collect_garbage();
        batch
    }

    fn export_document(&self) -> SerializedDocument {
        SerializedDocument {
            root: self.export_deep(self.root),
        }
    }

    fn import_document(&mut self, document: &SerializedDocument) -> Result<()> {
        for child in self.children(self.root) {
            self.remove(child)?;
        }
        for child in &document.root.children {
            self.build(child, self.root)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Point, UpdateTag};

    fn kinds(batch: &MutationBatch) -> Vec<(NodeKey, MutationKind)> {
        batch.mutations.iter().map(|m| (m.key, m.kind)).collect()
    }

    #[test]
    fn test_created_mutations_in_touch_order() {
        let mut tree = MemoryTree::new();
        tree.begin_update(UpdateTags::none());
        let p = tree.append_paragraph().unwrap();
        let t = tree.append_text(p, "hi").unwrap();
        let batch = tree.commit_update();

        assert_eq!(
            kinds(&batch),
            vec![(p, MutationKind::Created), (t, MutationKind::Created)]
        );
        assert!(batch.mutations[0].is_element);
        assert!(!batch.mutations[1].is_element);
        assert!(batch.previous.is_empty());
    }

    #[test]
    fn test_update_and_destroy_carry_previous_state() {
        let mut tree = MemoryTree::new();
        tree.begin_update(UpdateTags::none());
        let p = tree.append_paragraph().unwrap();
        let a = tree.append_text(p, "a").unwrap();
        let b = tree.append_text(p, "b").unwrap();
        tree.commit_update();

        tree.begin_update(UpdateTags::of(UpdateTag::History));
        tree.set_text(a, "A").unwrap();
        tree.remove(b).unwrap();
        let batch = tree.commit_update();

        assert!(batch.tags.has(UpdateTag::History));
        assert_eq!(
            kinds(&batch),
            vec![
                (a, MutationKind::Updated),
                (p, MutationKind::Updated),
                (b, MutationKind::Destroyed)
            ]
        );
        assert_eq!(batch.previous[&a].node.text_content(), Some("a"));
        assert_eq!(batch.previous[&b].previous, Some(a));
        assert_eq!(batch.previous[&b].parent, Some(p));
        assert!(!tree.contains(b));
        assert_eq!(tree.text_content(), "A");
    }

    #[test]
    fn test_remove_reports_whole_subtree() {
        let mut tree = MemoryTree::new();
        tree.begin_update(UpdateTags::none());
        let p = tree.append_paragraph().unwrap();
        let t = tree.append_text(p, "x").unwrap();
        tree.commit_update();

        tree.begin_update(UpdateTags::none());
        tree.remove(p).unwrap();
        let batch = tree.commit_update();

        assert_eq!(
            kinds(&batch),
            vec![(p, MutationKind::Destroyed), (t, MutationKind::Destroyed)]
        );
        assert!(tree.is_empty());
    }

    #[test]
    fn test_detached_nodes_are_not_reported() {
        let mut tree = MemoryTree::new();
        tree.begin_update(UpdateTags::none());
        tree.construct(&SerializedNode::text("orphan")).unwrap();
        let batch = tree.commit_update();

        assert!(batch.is_empty());
        assert_eq!(tree.len(), 0);
    }

    #[test]
    fn test_structural_rules() {
        let mut tree = MemoryTree::new();
        tree.begin_update(UpdateTags::none());
        let p = tree.append_paragraph().unwrap();
        let t = tree.append_text(p, "x").unwrap();
        let other = tree.construct(&SerializedNode::text("y")).unwrap();

        assert!(tree.append_child(t, other).is_err(), "text cannot hold children");
        assert!(tree.insert_after(tree.root(), other).is_err(), "root has no siblings");
        assert!(tree.append_child(t, p).is_err(), "cycle");
        assert!(matches!(
            tree.construct(&SerializedNode::new("video")),
            Err(SyncError::UnknownNodeType(_))
        ));

        tree.insert_before(t, other).unwrap();
        tree.commit_update();
        assert_eq!(tree.children(p), vec![other, t]);
        assert_eq!(tree.previous_sibling(t), Some(other));
        assert_eq!(tree.next_sibling(other), Some(t));
        assert_eq!(tree.first_child(p), Some(other));
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut tree = MemoryTree::new();
        tree.begin_update(UpdateTags::none());
        let p = tree.append_paragraph().unwrap();
        tree.set_sync_id(p, SyncId::from("p1")).unwrap();
        let t = tree.append_text(p, "hi").unwrap();
        tree.set_sync_id(t, SyncId::from("t1")).unwrap();
        tree.commit_update();
        let doc = tree.export_document();

        let mut other = MemoryTree::new();
        other.begin_update(UpdateTags::of(UpdateTag::Sync));
        other.import_document(&doc).unwrap();
        other.commit_update();

        assert_eq!(other.export_document(), doc);
        assert!(other.find(&SyncId::from("t1")).is_some());
    }

    #[test]
    fn test_selection_cleared_when_node_removed() {
        let mut tree = MemoryTree::new();
        tree.begin_update(UpdateTags::none());
        let p = tree.append_paragraph().unwrap();
        let t = tree.append_text(p, "x").unwrap();
        tree.commit_update();
        tree.set_selection(Some(Selection::caret(Point::new(t, 1))));

        tree.begin_update(UpdateTags::none());
        tree.remove(t).unwrap();
        tree.commit_update();

        assert_eq!(tree.selection(), None);
    }
}
