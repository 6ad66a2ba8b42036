//! Conflict classification.
//!
//! Pure predicates over the prepared node models and the current tree
//! state. Each detector covers the conflict classes one resolution stage
//! consumes, so by the time a stage runs, earlier stages have already
//! removed the classes they handle from the state space.

use crate::errors::ReconciliationError;
use crate::models::{names_eq, NodeKey, NodeType};
use crate::status::UpdateStatus;
use crate::tree::{PropagationNodeModel, TreeSet, UpdateNodeModel};

use super::structure;
use super::types::ConflictType;

// ---------------------------------------------------------------------------
// Indirect conflicts (one side against structure)
// ---------------------------------------------------------------------------

/// Classify a prepared model (local id space) against the structural
/// context: deleted destination parents and cross-replica move cycles.
pub fn indirect_conflict<Id: NodeKey>(
    trees: &TreeSet<Id>,
    model: &UpdateNodeModel<Id>,
) -> Result<ConflictType, ReconciliationError> {
    let status = model.status;
    let renamed_or_moved = status.contains(UpdateStatus::RENAMED)
        || status.contains(UpdateStatus::MOVED);

    if renamed_or_moved
        && structure::nearest_ancestor_deleted(&trees.synced, &trees.propagation, model.fs.parent_id)?
    {
        return Ok(ConflictType::MoveParentDeleteDest);
    }

    if status.contains(UpdateStatus::CREATED)
        && structure::nearest_ancestor_deleted(&trees.synced, &trees.propagation, model.fs.parent_id)?
    {
        return Ok(ConflictType::CreateParentDelete);
    }

    if status.contains(UpdateStatus::MOVED)
        && structure::cyclic_move_exists(trees, model.fs.id, model.fs.parent_id)
    {
        return Ok(ConflictType::MoveMoveCycle);
    }

    Ok(ConflictType::None)
}

// ---------------------------------------------------------------------------
// Direct conflicts (side against side)
// ---------------------------------------------------------------------------

/// Same node moved or renamed differently by each replica.
pub fn move_conflict<Id: NodeKey>(
    remote: &UpdateNodeModel<Id>,
    local: &UpdateNodeModel<Id>,
) -> ConflictType {
    if remote.status.contains(UpdateStatus::RENAMED)
        && local.status.contains(UpdateStatus::RENAMED)
        && !names_eq(&remote.fs.name, &local.fs.name)
    {
        return ConflictType::MoveMoveSource;
    }

    if remote.status.contains(UpdateStatus::MOVED)
        && local.status.contains(UpdateStatus::MOVED)
        && remote.fs.parent_id != local.fs.parent_id
    {
        return ConflictType::MoveMoveSource;
    }

    ConflictType::None
}

/// Both replicas edited the file content.
pub fn edit_conflict<Id: NodeKey>(
    remote: &UpdateNodeModel<Id>,
    local: &UpdateNodeModel<Id>,
) -> ConflictType {
    if remote.fs.node_type == NodeType::File
        && local.fs.node_type == NodeType::File
        && remote.status.contains(UpdateStatus::EDITED)
        && local.status.contains(UpdateStatus::EDITED)
    {
        return ConflictType::EditEdit;
    }

    ConflictType::None
}

// ---------------------------------------------------------------------------
// Delete conflicts (on the merged model)
// ---------------------------------------------------------------------------

/// Classify a merged model whose directions disagree about existence.
pub fn delete_conflict<Id: NodeKey>(
    trees: &TreeSet<Id>,
    model: &PropagationNodeModel<Id>,
) -> ConflictType {
    let remote_status = model.remote_status;
    let local_status = model.local_status;
    let deleted = |s: UpdateStatus| s.contains(UpdateStatus::DELETED);
    let renamed_or_moved = |s: UpdateStatus| {
        s.contains(UpdateStatus::RENAMED) || s.contains(UpdateStatus::MOVED)
    };

    if renamed_or_moved(remote_status) && deleted(local_status)
        || renamed_or_moved(local_status) && deleted(remote_status)
    {
        return ConflictType::MoveDelete;
    }

    if remote_status.contains(UpdateStatus::EDITED) && deleted(local_status)
        || local_status.contains(UpdateStatus::EDITED) && deleted(remote_status)
    {
        // The deletion may be inherited from a deleted ancestor rather
        // than aimed at the node itself.
        if parent_deleted_on_remote(trees, model) || parent_deleted_on_local(trees, model) {
            return ConflictType::EditParentDelete;
        }

        return ConflictType::EditDelete;
    }

    ConflictType::None
}

/// The remote replica deleted an ancestor: the deletion arrived through
/// `local_status` but the remote Update Tree node itself is not deleted.
fn parent_deleted_on_remote<Id: NodeKey>(
    trees: &TreeSet<Id>,
    model: &PropagationNodeModel<Id>,
) -> bool {
    if !model.local_status.contains(UpdateStatus::DELETED) {
        return false;
    }

    trees
        .remote_updates
        .node(model.alt_id)
        .map_or(true, |node| !node.status.contains(UpdateStatus::DELETED))
}

/// The local replica deleted an ancestor.
fn parent_deleted_on_local<Id: NodeKey>(
    trees: &TreeSet<Id>,
    model: &PropagationNodeModel<Id>,
) -> bool {
    if !model.remote_status.contains(UpdateStatus::DELETED) {
        return false;
    }

    trees
        .local_updates
        .node(model.fs.id)
        .map_or(true, |node| !node.status.contains(UpdateStatus::DELETED))
}

// ---------------------------------------------------------------------------
// Name clashes
// ---------------------------------------------------------------------------

/// Two nodes wanting the same name under the same parent. Returns the
/// conflicting node's model together with the classification.
pub fn name_clash_conflict<Id: NodeKey>(
    trees: &TreeSet<Id>,
    model: &PropagationNodeModel<Id>,
) -> Option<(ConflictType, PropagationNodeModel<Id>)> {
    let changed = |s: UpdateStatus| {
        s.contains(UpdateStatus::CREATED)
            || s.contains(UpdateStatus::RENAMED)
            || s.contains(UpdateStatus::MOVED)
    };

    if !changed(model.local_status) && !changed(model.remote_status) {
        return None;
    }

    let other = structure::name_clash(&trees.synced, &trees.propagation, model)?;

    let created = |m: &PropagationNodeModel<Id>| {
        m.local_status.contains(UpdateStatus::CREATED)
            || m.remote_status.contains(UpdateStatus::CREATED)
    };
    let renamed_or_moved = |m: &PropagationNodeModel<Id>| {
        m.local_status.contains(UpdateStatus::RENAMED)
            || m.remote_status.contains(UpdateStatus::RENAMED)
            || m.local_status.contains(UpdateStatus::MOVED)
            || m.remote_status.contains(UpdateStatus::MOVED)
    };

    let conflict = if created(model) && created(&other) {
        ConflictType::CreateCreate
    } else if created(model) && renamed_or_moved(&other)
        || renamed_or_moved(model) && created(&other)
    {
        ConflictType::MoveCreate
    } else {
        ConflictType::MoveMoveDest
    };

    Some((conflict, other))
}

// ---------------------------------------------------------------------------
// Pseudo conflicts
// ---------------------------------------------------------------------------

/// Both replicas independently created the same file: same link, same
/// type, same content. Two created directories sharing a name are a real
/// name clash, not a convergence, and stay distinct. Returns the
/// counterpart from the *other* replica's Update Tree, in the id space it
/// was found in.
pub fn create_create_pseudo<Id: NodeKey>(
    trees: &TreeSet<Id>,
    remote: &UpdateNodeModel<Id>,
    local: &UpdateNodeModel<Id>,
) -> Option<(ConflictType, UpdateNodeModel<Id>)> {
    if remote.status.contains(UpdateStatus::CREATED) {
        if let Some(counterpart) = created_counterpart(trees, remote, CounterpartSide::Local) {
            return Some((ConflictType::CreateCreatePseudo, counterpart));
        }
    }

    if local.status.contains(UpdateStatus::CREATED) {
        if let Some(counterpart) = created_counterpart(trees, local, CounterpartSide::Remote) {
            return Some((ConflictType::CreateCreatePseudo, counterpart));
        }
    }

    None
}

enum CounterpartSide {
    Local,
    Remote,
}

fn created_counterpart<Id: NodeKey>(
    trees: &TreeSet<Id>,
    model: &UpdateNodeModel<Id>,
    side: CounterpartSide,
) -> Option<UpdateNodeModel<Id>> {
    // Resolve the parent into the other replica's Update Tree id space,
    // preferring the merged Propagation Tree over the baseline.
    let parent_id = match side {
        CounterpartSide::Local => trees
            .propagation
            .node(model.fs.parent_id)
            .map(|p| p.fs.id)
            .or_else(|| trees.synced.node(model.fs.parent_id).map(|p| p.fs.id))?,
        CounterpartSide::Remote => trees
            .propagation
            .node(model.fs.parent_id)
            .map(|p| p.alt_id)
            .or_else(|| trees.synced.node(model.fs.parent_id).map(|p| p.alt_id))?,
    };

    let updates = match side {
        CounterpartSide::Local => &trees.local_updates,
        CounterpartSide::Remote => &trees.remote_updates,
    };

    let counterpart = updates
        .children_by_name(parent_id, &model.fs.name)
        .find(|sibling| {
            sibling.fs.node_type == model.fs.node_type
                && sibling.status == UpdateStatus::CREATED
        })?;

    let same_outcome =
        counterpart.fs.node_type == NodeType::File && counterpart.fs.content_eq(&model.fs);

    same_outcome.then(|| counterpart.clone())
}

/// Pseudo conflicts between the two prepared models. At most two can hold
/// at once (edit-edit and move-move); delete-delete is always reported
/// last.
pub fn pseudo_conflicts<Id: NodeKey>(
    remote: &UpdateNodeModel<Id>,
    local: &UpdateNodeModel<Id>,
) -> Vec<(ConflictType, UpdateStatus)> {
    let mut conflicts = Vec::new();
    let common = remote.status.intersect(local.status);

    if common.contains(UpdateStatus::EDITED) && remote.fs.content_eq(&local.fs) {
        conflicts.push((ConflictType::EditEditPseudo, UpdateStatus::EDITED));
    }

    let mut agreed = UpdateStatus::UNCHANGED;
    if common.contains(UpdateStatus::RENAMED) && names_eq(&remote.fs.name, &local.fs.name) {
        agreed = agreed.union(UpdateStatus::RENAMED);
    }
    if common.contains(UpdateStatus::MOVED) && remote.fs.parent_id == local.fs.parent_id {
        agreed = agreed.union(UpdateStatus::MOVED);
    }
    if !agreed.is_unchanged() {
        conflicts.push((ConflictType::MoveMovePseudo, agreed));
    }

    if common.contains(UpdateStatus::DELETED) {
        conflicts.push((ConflictType::DeleteDeletePseudo, UpdateStatus::DELETED));
    }

    conflicts
}
