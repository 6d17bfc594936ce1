//! Change capture
//!
//! Turns a committed [`MutationBatch`] into operations in two phases:
//!
//! 1. **Identity assignment** in its own `Sync`-tagged host update, so the
//!    writes never come back as user edits. New nodes without a SyncId, and
//!    clones carrying the SyncId of another live node, get a fresh one.
//! 2. **Synthesis**: one operation per mutated node, elements first so
//!    parents are created before their children.
//!
//! Batches written by the engine itself (remote apply, identity assignment,
//! snapshot adoption) and host bookkeeping are ignored. A mutation that
//! cannot be described is logged and skipped; the rest of the batch goes on.

use tracing::{debug, warn};

use crate::batcher::Origin;
use crate::identity::IdentityMap;
use crate::ids::SyncId;
use crate::operation::{NodeChange, Operation};
use crate::tree::{HostTree, MutationBatch, MutationKind, NodeKey, UpdateTag, UpdateTags};

/// Decide whether a batch is captured, and as what
pub fn origin_of(tags: &UpdateTags) -> Option<Origin> {
    if tags.has(UpdateTag::Sync)
        || tags.has(UpdateTag::ListenerRegistration)
        || tags.has(UpdateTag::HistoryMerge)
    {
        None
    } else if tags.has(UpdateTag::History) {
        Some(Origin::History)
    } else {
        Some(Origin::Local)
    }
}

/// Give every newly created node a usable SyncId
///
/// Returns how many nodes were (re)identified.
pub fn assign_identities<T: HostTree + ?Sized>(
    tree: &mut T,
    identities: &mut IdentityMap,
    batch: &MutationBatch,
) -> usize {
    let created: Vec<NodeKey> = batch
        .mutations
        .iter()
        .filter(|m| m.kind == MutationKind::Created && tree.contains(m.key))
        .map(|m| m.key)
        .collect();
    if created.is_empty() {
        return 0;
    }

    let mut assigned = 0;
    tree.begin_update(UpdateTags::of(UpdateTag::Sync));
    for key in created {
        let fresh = match tree.sync_id(key) {
            None => true,
            Some(id) => match identities.resolve(&id) {
                // A clone of a live node
                Some(other) if other != key && tree.contains(other) => true,
                // The old holder is gone; the id moves with the node
                Some(other) if other != key => {
                    identities.rebind(id, key);
                    false
                }
                _ => false,
            },
        };

        if fresh {
            let id = SyncId::mint();
            match tree.set_sync_id(key, id.clone()) {
                Ok(()) => {
                    debug!(node = %key, sync_id = %id, "assigned identity");
                    assigned += 1;
                }
                Err(err) => warn!(node = %key, error = %err, "failed to assign identity"),
            }
        }
    }
    tree.commit_update();
    assigned
}

/// SyncId of a handle, from the map, the live tree, or the pre-update view
fn identity_of<T: HostTree + ?Sized>(
    tree: &T,
    identities: &IdentityMap,
    batch: &MutationBatch,
    key: NodeKey,
) -> Option<SyncId> {
    identities
        .reverse_lookup(key)
        .cloned()
        .or_else(|| tree.sync_id(key))
        .or_else(|| batch.previous.get(&key).and_then(|p| p.node.sync_id.clone()))
}

/// Build operations for every mutation in the batch
pub fn synthesize<T: HostTree + ?Sized>(
    tree: &T,
    identities: &mut IdentityMap,
    batch: &MutationBatch,
    author: &str,
) -> Vec<Operation> {
    let root = tree.root();
    let position = |key: Option<NodeKey>, identities: &IdentityMap| {
        key.filter(|k| *k != root)
            .and_then(|k| identity_of(tree, identities, batch, k))
    };

    let ordered = batch
        .mutations
        .iter()
        .filter(|m| m.is_element)
        .chain(batch.mutations.iter().filter(|m| !m.is_element))
        .filter(|m| m.key != root);

    let mut ops = Vec::with_capacity(batch.mutations.len());
    for mutation in ordered {
        let key = mutation.key;
        match mutation.kind {
            MutationKind::Created | MutationKind::Updated => {
                let Some(node) = tree.export_node(key) else {
                    warn!(node = %key, "mutated node no longer resolves; dropping");
                    continue;
                };
                let Some(id) = node.sync_id.clone() else {
                    warn!(node = %key, "mutated node has no identity; dropping");
                    continue;
                };
                if let Err(err) = identities.set(id, key) {
                    warn!(node = %key, error = %err, "dropping operation");
                    continue;
                }

                let change = NodeChange::new(node)
                    .after(position(tree.previous_sibling(key), &*identities))
                    .under(position(tree.parent(key), &*identities));

                if mutation.kind == MutationKind::Created {
                    ops.push(Operation::created(author, change));
                } else {
                    let change = match batch.previous.get(&key) {
                        Some(previous) => change.replacing(previous.node.clone()),
                        None => change,
                    };
                    ops.push(Operation::updated(author, change));
                }
            }
            MutationKind::Destroyed => {
                let Some(previous) = batch.previous.get(&key) else {
                    warn!(node = %key, "destroyed node has no previous position; dropping");
                    continue;
                };
                let Some(id) = identity_of(tree, identities, batch, key) else {
                    warn!(node = %key, "destroyed node has no identity; dropping");
                    continue;
                };
                if identities.resolve(&id) == Some(key) {
                    identities.remove(&id);
                }

                let mut node = previous.node.clone();
                node.sync_id = Some(id);
                let change = NodeChange::new(node)
                    .after(position(previous.previous, &*identities))
                    .under(position(previous.parent, &*identities));
                ops.push(Operation::destroyed(author, change));
            }
        }
    }
    ops
}

/// Run both capture phases on a committed batch
///
/// Returns `None` for batches that must not be captured.
pub fn capture<T: HostTree + ?Sized>(
    tree: &mut T,
    identities: &mut IdentityMap,
    batch: &MutationBatch,
    author: &str,
) -> Option<(Origin, Vec<Operation>)> {
    let origin = origin_of(&batch.tags)?;
    if batch.is_empty() {
        return Some((origin, Vec::new()));
    }
    assign_identities(tree, identities, batch);
    let ops = synthesize(tree, identities, batch, author);
    debug!(count = ops.len(), ?origin, "captured operations");
    Some((origin, ops))
}
