//! Pseudo-conflict resolution.
//!
//! A pseudo conflict is no real divergence: both replicas reached the same
//! outcome independently. Resolution clears the agreeing status bits from
//! both Update Trees, folds the agreed change into the Synced Tree (the
//! only place the two id spaces are linked), and prunes nodes that became
//! fully unchanged.

use tracing::debug;

use crate::errors::ReconciliationError;
use crate::models::{names_eq, NodeKey, Operation, OperationType, Replica};
use crate::status::UpdateStatus;
use crate::tree::{SyncedNodeModel, TreeSet, UpdateNodeModel};

use super::types::ConflictType;

/// Resolve one pseudo conflict between the prepared models. The models
/// are adjusted in place; the Update and Synced Trees are rewritten.
pub fn resolve_pseudo_conflict<Id: NodeKey>(
    trees: &mut TreeSet<Id>,
    remote: &mut UpdateNodeModel<Id>,
    local: &mut UpdateNodeModel<Id>,
    conflict: ConflictType,
    conflicting_status: UpdateStatus,
) -> Result<(), ReconciliationError> {
    let op_type = match conflict {
        ConflictType::None => return Ok(()),
        ConflictType::CreateCreatePseudo => OperationType::Create,
        ConflictType::MoveMovePseudo => OperationType::Move,
        ConflictType::EditEditPseudo => OperationType::Edit,
        ConflictType::DeleteDeletePseudo => OperationType::Delete,
        other => {
            return Err(ReconciliationError::UnhandledConflict {
                conflict_type: other.to_string(),
                pipeline: "pseudo".to_string(),
            })
        }
    };

    if conflicting_status.is_unchanged() {
        return Ok(());
    }

    debug!(
        id = %local.fs.id,
        conflict = %conflict,
        status = %conflicting_status,
        "resolving pseudo conflict"
    );

    adjust_update_tree(trees, remote, conflicting_status, Replica::Remote)?;
    adjust_update_tree(trees, local, conflicting_status, Replica::Local)?;
    adjust_synced_tree(trees, remote, local, op_type)?;

    remote.status = remote.status.minus(conflicting_status);
    local.status = local.status.minus(conflicting_status);

    Ok(())
}

/// Clear the agreeing bits from one replica's Update Tree node and prune
/// what became unchanged.
fn adjust_update_tree<Id: NodeKey>(
    trees: &mut TreeSet<Id>,
    model: &UpdateNodeModel<Id>,
    conflicting_status: UpdateStatus,
    replica: Replica,
) -> Result<(), ReconciliationError> {
    // Created nodes have no Synced Tree entry yet; their prepared model
    // already carries the replica's own id.
    let own_id = match replica {
        Replica::Remote => trees
            .synced
            .node(model.fs.id)
            .map_or(model.fs.id, |synced| synced.alt_id),
        Replica::Local => model.fs.id,
    };

    let updates = match replica {
        Replica::Remote => &mut trees.remote_updates,
        Replica::Local => &mut trees.local_updates,
    };

    // A missing node means the parent was deleted on this replica; there
    // is nothing to adjust.
    let Some(node) = updates.node(own_id).cloned() else {
        return Ok(());
    };

    let adjusted = node.clone().with_status(node.status.minus(conflicting_status));
    updates
        .execute(Operation::update(adjusted))
        .map_err(ReconciliationError::Tree)?;

    updates
        .prune_upward(Some(own_id), |m| m.status.is_unchanged())
        .map_err(ReconciliationError::Tree)?;

    Ok(())
}

/// Fold the agreed change into the Synced Tree.
fn adjust_synced_tree<Id: NodeKey>(
    trees: &mut TreeSet<Id>,
    remote: &UpdateNodeModel<Id>,
    local: &UpdateNodeModel<Id>,
    op_type: OperationType,
) -> Result<(), ReconciliationError> {
    let mut model = SyncedNodeModel::new(local.fs.clone(), remote.fs.id);

    if !matches!(op_type, OperationType::Create | OperationType::Delete) {
        let synced = trees
            .synced
            .node(local.fs.id)
            .ok_or_else(|| ReconciliationError::MissingSyncedNode(local.fs.id.to_string()))?;

        if op_type == OperationType::Move {
            // Fold only the agreed link components; a disagreeing name or
            // parent keeps its baseline value.
            if !names_eq(&remote.fs.name, &local.fs.name) {
                model.fs.name = synced.fs.name.clone();
            }
            if remote.fs.parent_id != local.fs.parent_id {
                model.fs.parent_id = synced.fs.parent_id;
            }
        }

        model.alt_id = synced.alt_id;
    }

    trees
        .synced
        .execute(Operation::new(op_type, model))
        .map_err(ReconciliationError::Tree)?;

    Ok(())
}
