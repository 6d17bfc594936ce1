//! Host document tree seam
//!
//! The sync engine does not own a document model. It drives whatever tree
//! engine the application uses through the [`HostTree`] trait:
//!
//! - Scoped updates tagged with opaque markers ([`UpdateTag`]). Committing an
//!   update yields a [`MutationBatch`] carrying the tags back, so the engine
//!   can tell its own writes from user edits.
//! - Structural queries and edits keyed by local handles ([`NodeKey`]).
//! - An out-of-band SyncId field per node (`None` is the unset sentinel).
//! - Shallow serialization of single nodes and deep serialization of the
//!   whole document.
//!
//! [`memory::MemoryTree`] is the in-memory reference implementation.

pub mod memory;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::Result;
use crate::ids::SyncId;

pub use memory::MemoryTree;

/// Node type name of the document root
pub const ROOT_TYPE: &str = "root";

/// Node type name of paragraphs
pub const PARAGRAPH_TYPE: &str = "paragraph";

/// Node type name of text runs
pub const TEXT_TYPE: &str = "text";

/// Field holding a text node's content
pub const TEXT_FIELD: &str = "text";

/// Local, ephemeral handle of a node in the host tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(pub u64);

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Marker attached to a host update and echoed back to mutation consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateTag {
    /// Writes made by the engine itself (remote apply, identity assignment,
    /// snapshot adoption). Never captured.
    Sync,

    /// Undo/redo replay. Captured and transmitted, never pushed on the undo stack.
    History,

    /// Initial listener registration bookkeeping. Never captured.
    ListenerRegistration,

    /// History-merge bookkeeping. Never captured.
    HistoryMerge,
}

/// Set of tags attached to one update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateTags(Vec<UpdateTag>);

impl UpdateTags {
    /// No tags: a plain user edit
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn of(tag: UpdateTag) -> Self {
        Self(vec![tag])
    }

    pub fn with(mut self, tag: UpdateTag) -> Self {
        if !self.0.contains(&tag) {
            self.0.push(tag);
        }
        self
    }

    pub fn has(&self, tag: UpdateTag) -> bool {
        self.0.contains(&tag)
    }
}

/// Kind of change a node went through during one update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Created,
    Updated,
    Destroyed,
}

/// One mutated node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: NodeKey,
    pub kind: MutationKind,

    /// Element nodes are captured before leaves so parents precede children
    pub is_element: bool,
}

/// A node as it was before the update started
#[derive(Debug, Clone, PartialEq)]
pub struct PreviousNode {
    /// Shallow serialization (no children)
    pub node: SerializedNode,

    pub parent: Option<NodeKey>,

    /// Left sibling
    pub previous: Option<NodeKey>,
}

/// Everything one committed update changed
#[derive(Debug, Clone, Default)]
pub struct MutationBatch {
    pub tags: UpdateTags,

    /// Mutations in the order the nodes were first touched
    pub mutations: Vec<Mutation>,

    /// Pre-update view of every touched node that existed before
    pub previous: HashMap<NodeKey, PreviousNode>,
}

impl MutationBatch {
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Caret endpoint: a node and a grapheme offset inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub key: NodeKey,
    pub offset: usize,
}

impl Point {
    pub fn new(key: NodeKey, offset: usize) -> Self {
        Self { key, offset }
    }
}

/// Range selection (a collapsed caret has anchor == focus)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selection {
    pub anchor: Point,
    pub focus: Point,
}

impl Selection {
    pub fn caret(point: Point) -> Self {
        Self {
            anchor: point,
            focus: point,
        }
    }
}

/// Structural, JSON-like form of a node
///
/// In operations the node is shallow (`children` is empty); in document
/// snapshots it is deep.
///
/// # Example
///
/// ```rust
/// use docsync_core::tree::SerializedNode;
///
/// let node = SerializedNode::text("hi").with_sync_id("t1".into());
/// let json = serde_json::to_value(&node).unwrap();
/// assert_eq!(json["type"], "text");
/// assert_eq!(json["syncId"], "t1");
/// assert_eq!(json["text"], "hi");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedNode {
    /// Host node type name
    #[serde(rename = "type")]
    pub node_type: String,

    /// Durable identity (absent on the root)
    #[serde(rename = "syncId", default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<SyncId>,

    /// Child nodes (deep form only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SerializedNode>,

    /// Every other field (text, format, style...)
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl SerializedNode {
    /// Node of the given type with no fields
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            sync_id: None,
            children: Vec::new(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn paragraph() -> Self {
        Self::new(PARAGRAPH_TYPE)
    }

    pub fn text(text: &str) -> Self {
        Self::new(TEXT_TYPE).with_field(TEXT_FIELD, serde_json::Value::from(text))
    }

    pub fn with_sync_id(mut self, id: SyncId) -> Self {
        self.sync_id = Some(id);
        self
    }

    pub fn with_field(mut self, name: &str, value: serde_json::Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn with_child(mut self, child: SerializedNode) -> Self {
        self.children.push(child);
        self
    }

    /// Text content of a text node
    pub fn text_content(&self) -> Option<&str> {
        self.fields.get(TEXT_FIELD).and_then(|v| v.as_str())
    }

    /// Same node without children
    pub fn shallow(&self) -> Self {
        Self {
            node_type: self.node_type.clone(),
            sync_id: self.sync_id.clone(),
            children: Vec::new(),
            fields: self.fields.clone(),
        }
    }
}

/// Full document snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedDocument {
    pub root: SerializedNode,
}

impl SerializedDocument {
    /// Document with an empty root
    pub fn empty() -> Self {
        Self {
            root: SerializedNode::new(ROOT_TYPE),
        }
    }

    /// No content under the root
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Plain text: paragraphs joined by newlines
    pub fn text(&self) -> String {
        fn collect(node: &SerializedNode, out: &mut String) {
            if let Some(text) = node.text_content() {
                out.push_str(text);
            }
            for child in &node.children {
                collect(child, out);
            }
        }

        self.root
            .children
            .iter()
            .map(|block| {
                let mut out = String::new();
                collect(block, &mut out);
                out
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for SerializedDocument {
    fn default() -> Self {
        Self::empty()
    }
}

/// Interface the engine needs from the host document tree
///
/// Mutating calls are expected inside `begin_update` / `commit_update`. The
/// engine assumes at most one open update at a time.
pub trait HostTree {
    /// Handle of the implicit, shared document root
    fn root(&self) -> NodeKey;

    /// Whether the handle refers to a node attached to the document
    fn contains(&self, key: NodeKey) -> bool;

    fn node_type(&self, key: NodeKey) -> Option<&str>;

    fn is_element(&self, key: NodeKey) -> bool;

    fn is_text(&self, key: NodeKey) -> bool;

    fn parent(&self, key: NodeKey) -> Option<NodeKey>;

    fn previous_sibling(&self, key: NodeKey) -> Option<NodeKey>;

    fn next_sibling(&self, key: NodeKey) -> Option<NodeKey>;

    fn first_child(&self, key: NodeKey) -> Option<NodeKey>;

    fn children(&self, key: NodeKey) -> Vec<NodeKey>;

    /// Out-of-band identity field; `None` means unset
    fn sync_id(&self, key: NodeKey) -> Option<SyncId>;

    fn set_sync_id(&mut self, key: NodeKey, id: SyncId) -> Result<()>;

    fn text(&self, key: NodeKey) -> Option<String>;

    fn set_text(&mut self, key: NodeKey, text: &str) -> Result<()>;

    /// Shallow serialization of a live node
    fn export_node(&self, key: NodeKey) -> Option<SerializedNode>;

    /// Build a detached node from its serialized form (children ignored)
    fn construct(&mut self, node: &SerializedNode) -> Result<NodeKey>;

    /// Overwrite a node's fields (and identity, when present) from serialized form
    fn update_from(&mut self, key: NodeKey, node: &SerializedNode) -> Result<()>;

    fn insert_after(&mut self, anchor: NodeKey, key: NodeKey) -> Result<()>;

    fn insert_before(&mut self, anchor: NodeKey, key: NodeKey) -> Result<()>;

    fn append_child(&mut self, parent: NodeKey, key: NodeKey) -> Result<()>;

    /// Remove a node and its subtree
    fn remove(&mut self, key: NodeKey) -> Result<()>;

    fn selection(&self) -> Option<Selection>;

    fn set_selection(&mut self, selection: Option<Selection>);

    /// Open a scoped update
    fn begin_update(&mut self, tags: UpdateTags);

    /// Text nodes created or written during the open update
    fn dirty_text_nodes(&self) -> Vec<NodeKey>;

    /// Close the open update and report what changed
    fn commit_update(&mut self) -> MutationBatch;

    /// Deep serialization of the document
    fn export_document(&self) -> SerializedDocument;

    /// Replace the document content (inside an update)
    fn import_document(&mut self, document: &SerializedDocument) -> Result<()>;
}

/// Depth-first walk of the document, root excluded
pub fn depth_first<T: HostTree + ?Sized>(tree: &T) -> Vec<NodeKey> {
    let mut order = Vec::new();
    let mut stack: Vec<NodeKey> = tree.children(tree.root()).into_iter().rev().collect();
    while let Some(key) = stack.pop() {
        order.push(key);
        stack.extend(tree.children(key).into_iter().rev());
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialized_node_shape() {
        let node: SerializedNode = serde_json::from_value(json!({
            "type": "text",
            "syncId": "t1",
            "text": "hello",
            "format": 1
        }))
        .unwrap();

        assert_eq!(node.node_type, "text");
        assert_eq!(node.sync_id, Some(SyncId::from("t1")));
        assert_eq!(node.text_content(), Some("hello"));
        assert_eq!(node.fields.get("format"), Some(&json!(1)));
        assert!(node.children.is_empty());
    }

    #[test]
    fn test_document_text() {
        let doc = SerializedDocument {
            root: SerializedNode::new(ROOT_TYPE)
                .with_child(
                    SerializedNode::paragraph()
                        .with_child(SerializedNode::text("red "))
                        .with_child(SerializedNode::text("car")),
                )
                .with_child(SerializedNode::paragraph().with_child(SerializedNode::text("hi"))),
        };

        assert_eq!(doc.text(), "red car\nhi");
        assert!(!doc.is_empty());
        assert!(SerializedDocument::empty().is_empty());
    }

    #[test]
    fn test_update_tags() {
        let tags = UpdateTags::of(UpdateTag::Sync).with(UpdateTag::Sync);
        assert!(tags.has(UpdateTag::Sync));
        assert!(!tags.has(UpdateTag::History));
        assert!(!UpdateTags::none().has(UpdateTag::Sync));
    }
}
