//! Deletion cascade over an Update Tree subtree.
//!
//! Runs when a tracked node transitions into `Deleted` from a non-deleted
//! state. The subtree is classified child-first: purely created nodes
//! vanish, nodes that were moved in from elsewhere are moved back to their
//! Synced-Tree-recorded link and marked deleted (unless their origin is
//! itself inside a deleted branch), and everything else gains the deleted
//! status while keeping its edit/rename history. Once a node is processed
//! its remaining children are dropped outright, which keeps the invariant
//! that a deleted node has no children.

use crate::errors::{ConsolidationError, TreeError};
use crate::models::{NodeKey, Operation, Replica};
use crate::status::UpdateStatus;
use crate::tree::{post_order_ids, SyncedNodeModel, SyncedTree, UpdateTree};

use super::ancestors::with_missing_ancestors;

/// Apply the deletion cascade rooted at `start`.
pub fn run_cascade<Id: NodeKey>(
    replica: Replica,
    synced: &SyncedTree<Id>,
    updates: &mut UpdateTree<Id>,
    start: Id,
) -> Result<(), ConsolidationError> {
    for id in post_order_ids(updates, start, true) {
        // Earlier steps may have removed this node together with a subtree.
        let Some(node) = updates.node(id).cloned() else {
            continue;
        };

        // Children were classified before their parent; whatever remains
        // under it is deletable as a whole.
        updates
            .delete_children(id)
            .map_err(ConsolidationError::Tree)?;

        if node.status.contains(UpdateStatus::CREATED) {
            // A created node that gets deleted never existed for the other
            // replica.
            updates
                .execute(Operation::delete(node))
                .map_err(ConsolidationError::Tree)?;
        } else if node.status.contains(UpdateStatus::MOVED) {
            let synced_node = synced.node_by_own_id(id, replica).ok_or_else(|| {
                ConsolidationError::Tree(TreeError::NodeNotFound(id.to_string()))
            })?;

            if origin_branch_deleted(replica, synced, updates, synced_node)? {
                updates
                    .execute(Operation::delete(node))
                    .map_err(ConsolidationError::Tree)?;
            } else {
                // Undo the move rather than losing history: back to the
                // synced link, deleted, edits retained.
                let synced_parent = synced
                    .get(synced_node.fs.parent_id)
                    .map_err(ConsolidationError::Tree)?;

                let mut model = node.clone();
                model.fs.name = synced_node.fs.name.clone();
                model.fs.parent_id = synced_parent.own_id(replica);
                model.status = node
                    .status
                    .intersect(UpdateStatus::EDITED)
                    .insert(UpdateStatus::DELETED);

                let ops = with_missing_ancestors(replica, synced, updates, Operation::mv(model))?;
                updates.execute_all(ops).map_err(ConsolidationError::Tree)?;
            }
        } else if node.status.contains(UpdateStatus::DELETED) {
            // Already deleted, nothing to do.
        } else {
            let mut model = node.clone();
            model.status = node.status.insert(UpdateStatus::DELETED);
            updates
                .execute(Operation::update(model))
                .map_err(ConsolidationError::Tree)?;
        }
    }

    Ok(())
}

/// Whether the node's pre-move origin lies inside a deleted branch: the
/// nearest Synced-Tree ancestor tracked by this Update Tree carries the
/// deleted status.
fn origin_branch_deleted<Id: NodeKey>(
    replica: Replica,
    synced: &SyncedTree<Id>,
    updates: &UpdateTree<Id>,
    synced_node: &SyncedNodeModel<Id>,
) -> Result<bool, ConsolidationError> {
    let mut current = synced_node;

    while !synced.is_root(current.fs.id) {
        let parent = synced
            .get(current.fs.parent_id)
            .map_err(ConsolidationError::Tree)?;

        if let Some(tracked) = updates.node(parent.own_id(replica)) {
            return Ok(tracked.status.contains(UpdateStatus::DELETED));
        }

        current = parent;
    }

    Ok(false)
}
