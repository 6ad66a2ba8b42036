//! Merging the two prepared models into one Propagation Tree model.
//!
//! The merged model's `remote_status` carries the local replica's changes
//! (to be applied to the remote replica) and `local_status` the remote
//! replica's changes. The remote model is the base unless the remote side
//! is unchanged or deleted; surviving local edit/rename/move components
//! are folded on top.

use crate::models::NodeKey;
use crate::status::UpdateStatus;
use crate::tree::{PropagationNodeModel, SyncedTree, UpdateNodeModel};

/// Merge the prepared models. `backup` marks content that must be
/// preserved before being overwritten.
pub fn merged_model<Id: NodeKey>(
    synced: &SyncedTree<Id>,
    remote: &UpdateNodeModel<Id>,
    local: &UpdateNodeModel<Id>,
    backup: bool,
) -> PropagationNodeModel<Id> {
    let mut model = merged(remote, local);

    // The authoritative alt id comes from the Synced Tree where the node
    // is known to it.
    if let Some(synced_node) = synced.node(model.fs.id) {
        model.alt_id = synced_node.alt_id;
    }

    model.with_backup(backup)
}

fn merged<Id: NodeKey>(
    remote: &UpdateNodeModel<Id>,
    local: &UpdateNodeModel<Id>,
) -> PropagationNodeModel<Id> {
    let restore_pending = |status: UpdateStatus| {
        status.contains(UpdateStatus::DELETED) && status.contains(UpdateStatus::RESTORE)
    };

    if remote.status.is_unchanged() || remote.status.contains(UpdateStatus::DELETED) {
        let mut model = PropagationNodeModel::new(local.fs.clone(), remote.fs.id)
            .with_remote_status(local.status)
            .with_local_status(remote.status);

        // A deletion already marked for restoration re-merges as a
        // recreation on the replica that deleted.
        if local.status.is_unchanged() && restore_pending(remote.status) {
            model = model
                .with_local_status(UpdateStatus::UNCHANGED)
                .with_remote_status(UpdateStatus::CREATED.insert(UpdateStatus::RESTORE));
        }

        return model;
    }

    let mut fs = remote.fs.clone();
    fs.id = local.fs.id;

    let mut model = PropagationNodeModel::new(fs, remote.fs.id)
        .with_remote_status(local.status)
        .with_local_status(remote.status);

    if local.status.is_unchanged() || local.status.contains(UpdateStatus::DELETED) {
        return model;
    }

    if local.status.contains(UpdateStatus::EDITED) {
        model.fs.copy_attributes_from(&local.fs);
    }
    if local.status.contains(UpdateStatus::RENAMED) {
        model.fs.name = local.fs.name.clone();
    }
    if local.status.contains(UpdateStatus::MOVED) {
        model.fs.parent_id = local.fs.parent_id;
    }

    if remote.status.is_unchanged() && restore_pending(local.status) {
        model = model
            .with_remote_status(UpdateStatus::UNCHANGED)
            .with_local_status(UpdateStatus::CREATED.insert(UpdateStatus::RESTORE));
    }

    model
}
