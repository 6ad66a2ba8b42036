//! Missing-ancestor synthesis for Update Trees.
//!
//! Before a create or move lands in an Update Tree, every ancestor of the
//! target parent that the tree does not yet track is materialized as an
//! `Unchanged` copy of its Synced Tree counterpart, translated into the
//! replica's own id space.

use crate::errors::TreeError;
use crate::models::{NodeKey, Operation, OperationType, Replica};
use crate::status::UpdateStatus;
use crate::tree::{SyncedTree, UpdateNodeModel, UpdateTree};

/// Wrap `operation` with the create operations for any ancestors missing
/// from the Update Tree, outermost first.
pub fn with_missing_ancestors<Id: NodeKey>(
    replica: Replica,
    synced: &SyncedTree<Id>,
    updates: &UpdateTree<Id>,
    operation: Operation<UpdateNodeModel<Id>>,
) -> Result<Vec<Operation<UpdateNodeModel<Id>>>, TreeError> {
    if !matches!(
        operation.op_type,
        OperationType::Create | OperationType::Move
    ) {
        return Ok(vec![operation]);
    }

    let mut operations =
        missing_ancestor_creates(replica, synced, updates, operation.model.fs.parent_id)?;
    operations.push(operation);
    Ok(operations)
}

/// Create operations for the ancestors of `parent_id` (own id space) that
/// are missing from the Update Tree, outermost first.
fn missing_ancestor_creates<Id: NodeKey>(
    replica: Replica,
    synced: &SyncedTree<Id>,
    updates: &UpdateTree<Id>,
    parent_id: Id,
) -> Result<Vec<Operation<UpdateNodeModel<Id>>>, TreeError> {
    if let Some(parent) = updates.node(parent_id) {
        if parent.status.contains(UpdateStatus::DELETED) {
            return Err(TreeError::UnexpectedState(format!(
                "update tree parent {parent_id} is deleted"
            )));
        }

        return Ok(Vec::new());
    }

    let mut synced_node = synced
        .node_by_own_id(parent_id, replica)
        .ok_or_else(|| TreeError::NodeNotFound(parent_id.to_string()))?;

    // Walk upward until we hit an ancestor the Update Tree already tracks
    // (or the root), then materialize the gap top-down.
    let mut gap = Vec::new();

    loop {
        if synced.is_root(synced_node.fs.id) {
            break;
        }

        gap.push(synced_node.clone());

        let parent = synced.get(synced_node.fs.parent_id)?;
        if let Some(existing) = updates.node(parent.own_id(replica)) {
            if existing.status.contains(UpdateStatus::DELETED) {
                return Err(TreeError::UnexpectedState(format!(
                    "update tree ancestor {} is deleted",
                    existing.fs.id
                )));
            }
            break;
        }

        synced_node = parent;
    }

    let mut operations = Vec::with_capacity(gap.len());
    for synced_model in gap.into_iter().rev() {
        let parent = synced.get(synced_model.fs.parent_id)?;

        operations.push(Operation::create(UpdateNodeModel::unchanged_from_synced(
            &synced_model,
            replica,
            parent.own_id(replica),
        )));
    }

    Ok(operations)
}
