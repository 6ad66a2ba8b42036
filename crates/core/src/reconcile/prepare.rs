//! Merge preparation: pairing the two replicas' views of a node.
//!
//! Remote Update Tree models live in the remote id space; preparation maps
//! them through the Synced Tree into the local space (created nodes have
//! no mapping and keep their ids). A missing counterpart is synthesized:
//! an unchanged copy of the other side's model or of the Synced Tree
//! baseline, inheriting a deleted status when the node sits under a branch
//! the replica deleted.

use crate::errors::ReconciliationError;
use crate::models::{NodeKey, Replica};
use crate::status::UpdateStatus;
use crate::tree::{SyncedTree, TreeSet, UpdateNodeModel};

use crate::conflict::update_tree_parent_deleted;

/// Translate a remote Update Tree model into the local id space.
pub fn mapped_from_remote<Id: NodeKey>(
    synced: &SyncedTree<Id>,
    model: &UpdateNodeModel<Id>,
) -> UpdateNodeModel<Id> {
    let mut mapped = model.clone();

    if let Some(node) = synced.node_by_alt_id(model.fs.id) {
        mapped.fs.id = node.fs.id;
    }
    if let Some(parent) = synced.node_by_alt_id(model.fs.parent_id) {
        mapped.fs.parent_id = parent.fs.id;
    }

    mapped
}

/// Produce the (remote, local) model pair for one merge, both in the
/// local id space. At least one side must be present.
pub fn prepared_models<Id: NodeKey>(
    trees: &TreeSet<Id>,
    remote_node: Option<&UpdateNodeModel<Id>>,
    local_node: Option<&UpdateNodeModel<Id>>,
) -> Result<(UpdateNodeModel<Id>, UpdateNodeModel<Id>), ReconciliationError> {
    debug_assert!(
        remote_node.is_some() || local_node.is_some(),
        "at least one side of a merge pair must exist"
    );

    let remote = remote_model(trees, remote_node, local_node)?;
    let local = local_model(trees, remote_node, local_node)?;

    Ok((remote, local))
}

fn local_model<Id: NodeKey>(
    trees: &TreeSet<Id>,
    remote_node: Option<&UpdateNodeModel<Id>>,
    local_node: Option<&UpdateNodeModel<Id>>,
) -> Result<UpdateNodeModel<Id>, ReconciliationError> {
    if let Some(local) = local_node {
        return Ok(local.clone());
    }

    let remote = remote_node.expect("one side present");

    // A created node exists in neither the Synced Tree nor the other
    // replica's Update Tree.
    if remote.status.primary() == UpdateStatus::CREATED {
        return Ok(mapped_from_remote(&trees.synced, remote).with_status(UpdateStatus::UNCHANGED));
    }

    let synced = trees
        .synced
        .node_by_alt_id(remote.fs.id)
        .ok_or_else(|| ReconciliationError::MissingSyncedNode(remote.fs.id.to_string()))?;

    if let Some(node) = trees.local_updates.node(synced.fs.id) {
        return Ok(node.clone());
    }

    let model = UpdateNodeModel::new(synced.fs.clone(), UpdateStatus::UNCHANGED);

    // An untracked node under a branch the local replica deleted is
    // implicitly deleted on this side.
    if !remote.status.is_unchanged()
        && update_tree_parent_deleted(trees, synced.fs.id, Replica::Local)?
    {
        return Ok(model.with_status(UpdateStatus::DELETED));
    }

    Ok(model)
}

fn remote_model<Id: NodeKey>(
    trees: &TreeSet<Id>,
    remote_node: Option<&UpdateNodeModel<Id>>,
    local_node: Option<&UpdateNodeModel<Id>>,
) -> Result<UpdateNodeModel<Id>, ReconciliationError> {
    if let Some(remote) = remote_node {
        return Ok(mapped_from_remote(&trees.synced, remote));
    }

    let local = local_node.expect("one side present");

    if local.status.primary() == UpdateStatus::CREATED {
        return Ok(local.clone().with_status(UpdateStatus::UNCHANGED));
    }

    let synced = trees
        .synced
        .node(local.fs.id)
        .ok_or_else(|| ReconciliationError::MissingSyncedNode(local.fs.id.to_string()))?;

    if let Some(node) = trees.remote_updates.node(synced.alt_id) {
        return Ok(mapped_from_remote(&trees.synced, node));
    }

    let model = UpdateNodeModel::new(synced.fs.clone(), UpdateStatus::UNCHANGED);

    if !local.status.is_unchanged()
        && update_tree_parent_deleted(trees, synced.fs.id, Replica::Remote)?
    {
        return Ok(model.with_status(UpdateStatus::DELETED));
    }

    Ok(model)
}
