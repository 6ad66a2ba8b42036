//! Status consolidation and Update Tree operation construction.
//!
//! A detected operation is folded into the Update Tree by (a) computing the
//! node's new divergence status against its Synced Tree counterpart and
//! (b) deriving the minimal tree operation that records it. Operations
//! whose outcome is observably identical to the current node are discarded
//! by the effectiveness filter.

use crate::errors::ConsolidationError;
use crate::models::{names_eq, FsNodeModel, NodeKey, Operation, OperationType, Replica};
use crate::status::UpdateStatus;
use crate::tree::{SyncedNodeModel, SyncedTree, UpdateNodeModel};

// ---------------------------------------------------------------------------
// Consolidated status
// ---------------------------------------------------------------------------

/// Compute the node's new status after applying `detected`.
pub fn consolidated_status<Id: NodeKey>(
    replica: Replica,
    synced_tree: &SyncedTree<Id>,
    detected: &Operation<FsNodeModel<Id>>,
    node: Option<&UpdateNodeModel<Id>>,
    synced: Option<&SyncedNodeModel<Id>>,
) -> Result<UpdateStatus, ConsolidationError> {
    let id = detected.model.id;

    if detected.op_type != OperationType::Create && node.is_none() && synced.is_none() {
        return Err(ConsolidationError::InvalidStatus {
            id: id.to_string(),
            detail: format!(
                "cannot consolidate {}: node exists in neither tree",
                detected.op_type
            ),
        });
    }

    if detected.op_type != OperationType::Delete
        && node.is_some_and(|n| n.status.contains(UpdateStatus::DELETED))
    {
        return Err(ConsolidationError::InvalidStatus {
            id: id.to_string(),
            detail: format!("cannot consolidate {}: node is already deleted", detected.op_type),
        });
    }

    match detected.op_type {
        OperationType::Create if synced.is_some() => Err(ConsolidationError::InvalidStatus {
            id: id.to_string(),
            detail: "created node already exists in the synced tree".into(),
        }),

        OperationType::Create => Ok(UpdateStatus::CREATED),

        // Modified before the creation was even recorded.
        OperationType::Edit | OperationType::Move if synced.is_none() => Ok(UpdateStatus::CREATED),

        OperationType::Edit => {
            let base = node.map_or(UpdateStatus::UNCHANGED, |n| n.status);
            Ok(edited(base, &detected.model, synced.unwrap()))
        }

        OperationType::Move => {
            let base = node.map_or(UpdateStatus::UNCHANGED, |n| n.status);
            renamed_and_or_moved(replica, synced_tree, base, &detected.model, synced.unwrap())
        }

        OperationType::Delete => {
            // The Restore flag survives deletion.
            if node.is_some_and(|n| n.status.contains(UpdateStatus::RESTORE)) {
                Ok(UpdateStatus::DELETED.insert(UpdateStatus::RESTORE))
            } else {
                Ok(UpdateStatus::DELETED)
            }
        }

        OperationType::Update => Err(ConsolidationError::InvalidStatus {
            id: id.to_string(),
            detail: "detected streams never carry update operations".into(),
        }),
    }
}

/// Toggle the `Edited` bit: a node is edited while its content differs
/// from the Synced Tree.
fn edited<Id: NodeKey>(
    status: UpdateStatus,
    model: &FsNodeModel<Id>,
    synced: &SyncedNodeModel<Id>,
) -> UpdateStatus {
    if model.content_eq(&synced.fs) {
        status.minus(UpdateStatus::EDITED)
    } else {
        status.union(UpdateStatus::EDITED)
    }
}

/// Toggle the `Renamed` and `Moved` bits against the Synced Tree link,
/// with the parent compared in the replica's own id space.
fn renamed_and_or_moved<Id: NodeKey>(
    replica: Replica,
    synced_tree: &SyncedTree<Id>,
    status: UpdateStatus,
    model: &FsNodeModel<Id>,
    synced: &SyncedNodeModel<Id>,
) -> Result<UpdateStatus, ConsolidationError> {
    let mut status = if names_eq(&model.name, &synced.fs.name) {
        status.minus(UpdateStatus::RENAMED)
    } else {
        status.union(UpdateStatus::RENAMED)
    };

    let synced_parent = synced_tree
        .get(synced.fs.parent_id)
        .map_err(ConsolidationError::Tree)?;

    status = if model.parent_id == synced_parent.own_id(replica) {
        status.minus(UpdateStatus::MOVED)
    } else {
        status.union(UpdateStatus::MOVED)
    };

    Ok(status)
}

// ---------------------------------------------------------------------------
// Operation factory
// ---------------------------------------------------------------------------

/// Derive the Update Tree operation recording `detected`, or `None` when
/// there is nothing to record.
pub fn consolidation_operation<Id: NodeKey>(
    replica: Replica,
    synced_tree: &SyncedTree<Id>,
    detected: &Operation<FsNodeModel<Id>>,
    node: Option<&UpdateNodeModel<Id>>,
    synced: Option<&SyncedNodeModel<Id>>,
) -> Result<Option<Operation<UpdateNodeModel<Id>>>, ConsolidationError> {
    let status = consolidated_status(replica, synced_tree, detected, node, synced)?;

    if status.contains(UpdateStatus::DELETED) && node.is_none() && synced.is_none() {
        return Ok(None);
    }

    if status.is_unchanged() && node.is_none() {
        return Ok(None);
    }

    let model = if detected.op_type == OperationType::Create {
        UpdateNodeModel::new(detected.model.clone(), status)
    } else {
        let mut model = match node {
            Some(node) => node.clone(),
            None => {
                let synced = synced.expect("non-create without a tracked node has a synced counterpart");
                let parent = synced_tree
                    .get(synced.fs.parent_id)
                    .map_err(ConsolidationError::Tree)?;

                let mut copy = UpdateNodeModel::unchanged_from_synced(synced, replica, parent.own_id(replica));
                copy.fs.id = detected.model.id;
                copy
            }
        };

        match detected.op_type {
            OperationType::Edit => model.fs.copy_attributes_from(&detected.model),
            OperationType::Move => model.fs.copy_link_from(&detected.model),
            _ => {}
        }

        model.with_status(status)
    };

    let mut op_type = detected.op_type;
    if node.is_none() {
        op_type = OperationType::Create;
    } else if status.contains(UpdateStatus::DELETED)
        || (status == UpdateStatus::CREATED && op_type == OperationType::Create)
    {
        op_type = OperationType::Update;
    }

    Ok(Some(Operation::new(op_type, model)))
}

// ---------------------------------------------------------------------------
// Effectiveness filter
// ---------------------------------------------------------------------------

/// Whether applying `operation` would observably change the current node.
pub fn has_effect<Id: NodeKey>(
    operation: &Operation<UpdateNodeModel<Id>>,
    node: Option<&UpdateNodeModel<Id>>,
) -> bool {
    let Some(current) = node else {
        return true;
    };

    let incoming = &operation.model;

    match operation.op_type {
        OperationType::Edit => {
            !incoming.fs.attributes_eq(&current.fs) || incoming.status != current.status
        }
        OperationType::Move => {
            !incoming.fs.link_eq(&current.fs) || incoming.status != current.status
        }
        OperationType::Update => incoming.status != current.status,
        OperationType::Create | OperationType::Delete => true,
    }
}
