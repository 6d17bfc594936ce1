//! Conflict-avoidance splitter
//!
//! Keeps text nodes at word granularity so two replicas editing different
//! words of one paragraph write to different nodes. A text node holding a
//! space followed by more text is cut right after the space: the original
//! node keeps the word and its trailing space (and its identity), the rest
//! moves to a new sibling with a freshly minted SyncId.
//!
//! ```text
//! "red car"   ->  "red " | "car"
//! "red  car"  ->  "red " | " " | "car"
//! ```
//!
//! Runs inside the local edit's host update, before commit, so the new
//! fragments are captured as `created` operations in the same batch.

use std::collections::VecDeque;
use tracing::trace;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::Result;
use crate::ids::SyncId;
use crate::tree::{HostTree, NodeKey, Point, TEXT_FIELD};

/// Where to cut `text`, in graphemes: the length of the kept left piece
///
/// `None` when there is no space with text after it.
pub fn split_point(text: &str) -> Option<usize> {
    let graphemes: Vec<&str> = text.graphemes(true).collect();
    let space = graphemes.iter().position(|g| *g == " ")?;
    (space + 1 < graphemes.len()).then_some(space + 1)
}

fn split_at_grapheme(text: &str, at: usize) -> (&str, &str) {
    let byte = text
        .grapheme_indices(true)
        .nth(at)
        .map_or(text.len(), |(i, _)| i);
    text.split_at(byte)
}

fn relocate(point: Point, from: NodeKey, to: NodeKey, kept: usize) -> Point {
    if point.key == from && point.offset > kept {
        Point::new(to, point.offset - kept)
    } else {
        point
    }
}

/// Split every dirty text node of the open update at word boundaries
///
/// Returns the handles of the new fragments, in creation order.
///
/// # Example
///
/// ```rust
/// use docsync_core::splitter::split_words;
/// use docsync_core::tree::{HostTree, MemoryTree, UpdateTags};
///
/// let mut tree = MemoryTree::new();
/// tree.begin_update(UpdateTags::none());
/// let p = tree.append_paragraph().unwrap();
/// tree.append_text(p, "hello world").unwrap();
/// let created = split_words(&mut tree).unwrap();
/// tree.commit_update();
///
/// assert_eq!(created.len(), 1);
/// assert_eq!(tree.children(p).len(), 2);
/// assert_eq!(tree.text_content(), "hello world");
/// ```
pub fn split_words<T: HostTree + ?Sized>(tree: &mut T) -> Result<Vec<NodeKey>> {
    let mut worklist: VecDeque<NodeKey> = tree.dirty_text_nodes().into();
    let mut created = Vec::new();

    while let Some(key) = worklist.pop_front() {
        let Some(text) = tree.text(key) else {
            continue;
        };
        let Some(kept_len) = split_point(&text) else {
            continue;
        };
        let (kept, rest) = split_at_grapheme(&text, kept_len);
        let Some(mut fragment) = tree.export_node(key) else {
            continue;
        };

        fragment.sync_id = Some(SyncId::mint());
        fragment
            .fields
            .insert(TEXT_FIELD.to_string(), serde_json::Value::from(rest));

        let new_key = tree.construct(&fragment)?;
        tree.insert_after(key, new_key)?;
        tree.set_text(key, kept)?;

        if let Some(mut selection) = tree.selection() {
            selection.anchor = relocate(selection.anchor, key, new_key, kept_len);
            selection.focus = relocate(selection.focus, key, new_key, kept_len);
            tree.set_selection(Some(selection));
        }

        trace!(node = %key, fragment = %new_key, "split text at word boundary");
        created.push(new_key);
        worklist.push_back(new_key);
    }

    Ok(created)
}
