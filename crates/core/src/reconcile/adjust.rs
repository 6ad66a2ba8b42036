//! Status adjustment of a merged Propagation Tree model.
//!
//! Each direction's `Renamed`/`Moved` bits are recomputed against the
//! replica's *current* position for the node (its own Update Tree link,
//! or the Synced Tree baseline), so a direction only carries a link
//! operation when that replica actually has to apply one. A rename or
//! move both replicas already agree on would vanish from both diffs; such
//! lost common bits are restored to both directions. A deleted node under
//! an already-deleted ancestor needs no operation at all.

use crate::errors::ReconciliationError;
use crate::models::{names_eq, FsNodeModel, NodeKey};
use crate::status::UpdateStatus;
use crate::tree::{PropagationNodeModel, TreeSet};

use crate::conflict::nearest_ancestor_deleted;

use super::prepare::mapped_from_remote;

/// Recompute the merged model's per-direction statuses.
pub fn adjusted_status<Id: NodeKey>(
    trees: &TreeSet<Id>,
    model: PropagationNodeModel<Id>,
) -> Result<PropagationNodeModel<Id>, ReconciliationError> {
    if model.is_deleted() {
        // Skip adding a deleted node when an ancestor is already deleted.
        if nearest_ancestor_deleted(&trees.synced, &trees.propagation, model.fs.parent_id)? {
            return Ok(model
                .with_remote_status(UpdateStatus::UNCHANGED)
                .with_local_status(UpdateStatus::UNCHANGED));
        }

        return Ok(model);
    }

    let previous_common = model.remote_status.intersect(model.local_status);

    let model = with_adjusted_local_status(trees, with_adjusted_remote_status(trees, model));

    let missing = previous_common
        .minus(model.remote_status)
        .minus(model.local_status)
        .intersect(UpdateStatus::RENAMED_AND_MOVED);

    if missing.is_unchanged() {
        return Ok(model);
    }

    let remote_status = model.remote_status.union(missing);
    let local_status = model.local_status.union(missing);
    Ok(model
        .with_remote_status(remote_status)
        .with_local_status(local_status))
}

/// Ops toward the remote replica compare against where the remote replica
/// currently has the node.
fn with_adjusted_remote_status<Id: NodeKey>(
    trees: &TreeSet<Id>,
    model: PropagationNodeModel<Id>,
) -> PropagationNodeModel<Id> {
    if model.remote_status.contains(UpdateStatus::CREATED) {
        return model;
    }

    let original = trees
        .remote_updates
        .node(model.alt_id)
        .map(|node| mapped_from_remote(&trees.synced, node).fs)
        .or_else(|| trees.synced.node(model.fs.id).map(|node| node.fs.clone()));

    let adjusted = model
        .remote_status
        .minus(UpdateStatus::RENAMED_AND_MOVED)
        .union(link_diff(&model.fs, original.as_ref()));

    model.with_remote_status(adjusted)
}

/// Ops toward the local replica compare against the local replica's
/// current position.
fn with_adjusted_local_status<Id: NodeKey>(
    trees: &TreeSet<Id>,
    model: PropagationNodeModel<Id>,
) -> PropagationNodeModel<Id> {
    if model.local_status.contains(UpdateStatus::CREATED) {
        return model;
    }

    let original = trees
        .local_updates
        .node(model.fs.id)
        .map(|node| node.fs.clone())
        .or_else(|| trees.synced.node(model.fs.id).map(|node| node.fs.clone()));

    let adjusted = model
        .local_status
        .minus(UpdateStatus::RENAMED_AND_MOVED)
        .union(link_diff(&model.fs, original.as_ref()));

    model.with_local_status(adjusted)
}

fn link_diff<Id: NodeKey>(
    merged: &FsNodeModel<Id>,
    original: Option<&FsNodeModel<Id>>,
) -> UpdateStatus {
    let Some(original) = original else {
        return UpdateStatus::UNCHANGED;
    };

    let mut status = UpdateStatus::UNCHANGED;
    if !names_eq(&merged.name, &original.name) {
        status = status.union(UpdateStatus::RENAMED);
    }
    if merged.parent_id != original.parent_id {
        status = status.union(UpdateStatus::MOVED);
    }

    status
}
