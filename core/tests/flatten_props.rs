//! Property tests for batch flattening

use std::collections::HashMap;

use docsync_core::batcher::flatten;
use docsync_core::operation::{CursorChange, NodeChange};
use docsync_core::tree::SerializedNode;
use docsync_core::{Operation, OperationKind, SyncId};
use proptest::prelude::*;

const WORDS: [&str; 4] = ["a", "b", "c", "d"];

fn node(id: usize, word: usize) -> SerializedNode {
    SerializedNode::text(WORDS[word]).with_sync_id(SyncId::from(format!("n{}", id)))
}

fn build(step: (usize, u8, usize, usize)) -> Operation {
    let (id, kind, word, before) = step;
    match kind {
        0 => Operation::created("a", NodeChange::new(node(id, word))),
        1 => Operation::updated(
            "a",
            NodeChange::new(node(id, word)).replacing(node(id, before)),
        ),
        2 => Operation::destroyed("a", NodeChange::new(node(id, word))),
        _ => Operation::cursor(
            "a",
            CursorChange {
                anchor_id: SyncId::from(format!("n{}", id)),
                anchor_offset: word,
                focus_id: SyncId::from(format!("n{}", id)),
                focus_offset: word,
                last_activity: before as i64,
            },
        ),
    }
}

fn burst() -> impl Strategy<Value = Vec<Operation>> {
    prop::collection::vec((0usize..4, 0u8..4, 0usize..4, 0usize..4), 0..40)
        .prop_map(|steps| steps.into_iter().map(build).collect())
}

proptest! {
    #[test]
    fn prop_flatten_never_grows(ops in burst()) {
        let len = ops.len();
        prop_assert!(flatten(ops).len() <= len);
    }

    #[test]
    fn prop_only_latest_cursor_survives(ops in burst()) {
        let last_cursor = ops.iter().rev().find(|op| op.is_cursor()).cloned();
        let cursors: Vec<Operation> = flatten(ops).into_iter().filter(Operation::is_cursor).collect();

        prop_assert!(cursors.len() <= 1);
        prop_assert_eq!(cursors.into_iter().next(), last_cursor);
    }

    #[test]
    fn prop_one_create_and_one_update_per_node(ops in burst()) {
        let mut seen: HashMap<(SyncId, &'static str), usize> = HashMap::new();
        for op in flatten(ops).iter().filter(|op| !op.is_cursor()) {
            if let Some(id) = op.target() {
                *seen.entry((id.clone(), op.kind_name())).or_default() += 1;
            }
        }
        for ((_, kind), count) in &seen {
            if *kind != "destroyed" {
                prop_assert_eq!(*count, 1);
            }
        }
    }

    #[test]
    fn prop_no_empty_updates(ops in burst()) {
        for op in flatten(ops) {
            if let OperationKind::Updated(change) = &op.kind {
                prop_assert_ne!(change.previous_node.as_ref(), Some(&change.node));
            }
        }
    }
}
