//! Deterministic conflict resolution.
//!
//! Every resolution either rewrites the node in place or relocates it to
//! its nearest sync root, which cannot itself conflict; no rule can fire
//! twice for the same node within a pass.

use tracing::debug;

use crate::errors::ReconciliationError;
use crate::models::{NodeKey, Operation};
use crate::name::NameFactory;
use crate::status::UpdateStatus;
use crate::tree::{PropagationNodeModel, TreeSet, UpdateNodeModel};

use super::structure;
use super::types::ConflictType;

// ---------------------------------------------------------------------------
// Move conflicts (same node, different destinations)
// ---------------------------------------------------------------------------

/// `MoveMoveSource`: the remote destination wins; the local link is reset
/// to match. Statuses are recomputed by the adjustment stage.
pub fn resolve_move_conflict<Id: NodeKey>(
    remote: &UpdateNodeModel<Id>,
    local: &mut UpdateNodeModel<Id>,
    conflict: ConflictType,
) -> Result<(), ReconciliationError> {
    match conflict {
        ConflictType::None => Ok(()),
        ConflictType::MoveMoveSource => {
            debug!(id = %local.fs.id, "move-move conflict: remote destination wins");
            local.fs.copy_link_from(&remote.fs);
            Ok(())
        }
        other => Err(unhandled(other, "move")),
    }
}

// ---------------------------------------------------------------------------
// Edit conflicts (both sides edited content)
// ---------------------------------------------------------------------------

/// `EditEdit`: the remote content wins, the local edit is discarded, and
/// the overwritten local content is flagged for backup. Returns whether a
/// backup is required.
pub fn resolve_edit_conflict<Id: NodeKey>(
    remote: &UpdateNodeModel<Id>,
    local: &mut UpdateNodeModel<Id>,
    conflict: ConflictType,
) -> Result<bool, ReconciliationError> {
    match conflict {
        ConflictType::None => Ok(false),
        ConflictType::EditEdit => {
            debug!(id = %local.fs.id, "edit-edit conflict: remote content wins, local backed up");
            local.status = local.status.minus(UpdateStatus::EDITED);
            local.fs.copy_attributes_from(&remote.fs);
            Ok(true)
        }
        other => Err(unhandled(other, "edit")),
    }
}

// ---------------------------------------------------------------------------
// Indirect conflicts (invalid destination, cycles)
// ---------------------------------------------------------------------------

/// `MoveParentDeleteDest` / `MoveMoveCycle`: undo the move back to the
/// Synced-Tree-recorded link; if the restored position is itself invalid,
/// escalate to the nearest sync root. `CreateParentDelete`: relocate to
/// the sync root directly.
pub fn resolve_indirect_conflict<Id: NodeKey>(
    trees: &TreeSet<Id>,
    mut model: UpdateNodeModel<Id>,
    conflict: ConflictType,
    names: &dyn NameFactory<Id>,
) -> Result<UpdateNodeModel<Id>, ReconciliationError> {
    match conflict {
        ConflictType::None => Ok(model),

        ConflictType::MoveParentDeleteDest | ConflictType::MoveMoveCycle => {
            debug!(id = %model.fs.id, conflict = %conflict, "undoing invalid move");

            let synced = trees
                .synced
                .node(model.fs.id)
                .ok_or_else(|| ReconciliationError::MissingSyncedNode(model.fs.id.to_string()))?;
            model.fs.copy_link_from(&synced.fs);

            let restored_invalid = structure::nearest_ancestor_deleted(
                &trees.synced,
                &trees.propagation,
                model.fs.parent_id,
            )? || structure::cyclic_move_exists(trees, model.fs.id, model.fs.parent_id)
                || structure::name_clash_exists(
                    &trees.propagation,
                    model.fs.parent_id,
                    &model.fs.name,
                    model.fs.id,
                );

            if restored_invalid {
                return move_to_sync_root(trees, model, names);
            }

            Ok(model)
        }

        ConflictType::CreateParentDelete => {
            debug!(id = %model.fs.id, "created node's parent deleted: relocating to sync root");
            move_to_sync_root(trees, model, names)
        }

        other => Err(unhandled(other, "indirect")),
    }
}

/// Relocate a model to its nearest sync root under a disambiguated name.
/// Sync roots have fixed unique names and the tree root as parent, so the
/// relocation is guaranteed terminal.
fn move_to_sync_root<Id: NodeKey>(
    trees: &TreeSet<Id>,
    mut model: UpdateNodeModel<Id>,
    names: &dyn NameFactory<Id>,
) -> Result<UpdateNodeModel<Id>, ReconciliationError> {
    let root = structure::sync_root_id(&trees.synced, &trees.propagation, model.fs.parent_id)?;
    model.fs.parent_id = root;
    model.fs.name = disambiguated_name(trees, root, &model.fs, names);
    Ok(model)
}

/// The first factory candidate free under `parent_id` in both the
/// Propagation and Synced Trees.
pub fn disambiguated_name<Id: NodeKey>(
    trees: &TreeSet<Id>,
    parent_id: Id,
    fs: &crate::models::FsNodeModel<Id>,
    names: &dyn NameFactory<Id>,
) -> String {
    for attempt in 1.. {
        let candidate = names.candidate(fs, attempt);

        let clashes = structure::name_clash_exists(&trees.propagation, parent_id, &candidate, fs.id)
            || trees
                .synced
                .children_by_name(parent_id, &candidate)
                .any(|sibling| sibling.fs.id != fs.id && !trees.propagation.contains(sibling.fs.id));

        if !clashes {
            return candidate;
        }
    }

    unreachable!("name factory candidates are unbounded")
}

// ---------------------------------------------------------------------------
// Delete conflicts (edit/move vs delete)
// ---------------------------------------------------------------------------

/// `EditDelete` / `MoveDelete`: the surviving change wins and the deleted
/// direction becomes a restoration. `EditParentDelete`: as above, then
/// relocate to the nearest sync root (the original path no longer
/// exists).
pub fn resolve_delete_conflict<Id: NodeKey>(
    trees: &TreeSet<Id>,
    model: PropagationNodeModel<Id>,
    conflict: ConflictType,
    names: &dyn NameFactory<Id>,
) -> Result<PropagationNodeModel<Id>, ReconciliationError> {
    match conflict {
        ConflictType::None => Ok(model),

        ConflictType::EditDelete | ConflictType::MoveDelete => {
            debug!(id = %model.fs.id, conflict = %conflict, "delete conflict: change wins, deletion reverted");
            Ok(restored(model))
        }

        ConflictType::EditParentDelete => {
            debug!(id = %model.fs.id, "edit under deleted ancestor: restoring at sync root");
            let mut model = restored(model);

            let root =
                structure::sync_root_id(&trees.synced, &trees.propagation, model.fs.parent_id)?;
            model.fs.parent_id = root;
            model.fs.name = disambiguated_name(trees, root, &model.fs, names);

            Ok(model)
        }

        other => Err(unhandled(other, "delete")),
    }
}

/// The deleted direction is rewritten to recreate the node; the surviving
/// direction needs no operation (its replica already holds the change).
fn restored<Id: NodeKey>(mut model: PropagationNodeModel<Id>) -> PropagationNodeModel<Id> {
    let remote_deleted = model.local_status.contains(UpdateStatus::DELETED);
    let local_deleted = model.remote_status.contains(UpdateStatus::DELETED);

    model.remote_status = if remote_deleted {
        UpdateStatus::CREATED.insert(UpdateStatus::RESTORE)
    } else {
        UpdateStatus::UNCHANGED
    };
    model.local_status = if local_deleted {
        UpdateStatus::CREATED.insert(UpdateStatus::RESTORE)
    } else {
        UpdateStatus::UNCHANGED
    };

    model
}

// ---------------------------------------------------------------------------
// Name clash conflicts
// ---------------------------------------------------------------------------

/// `CreateCreate` / `MoveCreate` / `MoveMoveDest`: pick the winner; the
/// loser is renamed through the name factory and both of its status masks
/// gain `Renamed`.
pub fn resolve_name_clash<Id: NodeKey>(
    trees: &mut TreeSet<Id>,
    model: PropagationNodeModel<Id>,
    other: PropagationNodeModel<Id>,
    conflict: ConflictType,
    names: &dyn NameFactory<Id>,
) -> Result<PropagationNodeModel<Id>, ReconciliationError> {
    match conflict {
        ConflictType::None => Ok(model),

        ConflictType::CreateCreate | ConflictType::MoveCreate | ConflictType::MoveMoveDest => {
            if !beats(&model, &other) {
                debug!(id = %model.fs.id, conflict = %conflict, "name clash: incoming node renamed");
                // Status gains Renamed in the adjustment stage.
                let mut model = model;
                model.fs.name = disambiguated_name(trees, model.fs.parent_id, &model.fs, names);
                return Ok(model);
            }

            debug!(id = %other.fs.id, conflict = %conflict, "name clash: existing node renamed");

            let mut loser = other;
            loser.fs.name = disambiguated_name(trees, loser.fs.parent_id, &loser.fs, names);
            loser.local_status = loser.local_status.union(UpdateStatus::RENAMED);
            loser.remote_status = loser.remote_status.union(UpdateStatus::RENAMED);

            if trees.propagation.contains(loser.fs.id) {
                trees
                    .propagation
                    .execute(Operation::mv(loser))
                    .map_err(ReconciliationError::Tree)?;
            } else {
                // A clashing node known only to the Synced Tree enters the
                // plan through its rename.
                trees
                    .propagation
                    .execute(Operation::create(loser))
                    .map_err(ReconciliationError::Tree)?;
            }

            Ok(model)
        }

        other_type => Err(unhandled(other_type, "name-clash")),
    }
}

/// Winner selection. The change on the remote replica always wins;
/// `local_status` reflects changes made by the remote replica and
/// `remote_status` changes made by the local replica.
fn beats<Id: NodeKey>(
    model: &PropagationNodeModel<Id>,
    other: &PropagationNodeModel<Id>,
) -> bool {
    let unchanged = |m: &PropagationNodeModel<Id>| {
        m.local_status.is_unchanged() && m.remote_status.is_unchanged()
    };
    let changed_by_remote = |s: UpdateStatus| {
        s.contains(UpdateStatus::CREATED)
            || s.contains(UpdateStatus::RENAMED)
            || s.contains(UpdateStatus::MOVED)
    };

    // The existing node without changes wins over any incoming change.
    if unchanged(other) {
        return false;
    }

    // An incoming node without changes wins over a changed existing one.
    if unchanged(model) {
        return true;
    }

    // The incoming node created on the remote replica wins.
    if model.local_status.contains(UpdateStatus::CREATED) {
        return true;
    }

    // The incoming node created on the local replica loses.
    if model.remote_status.contains(UpdateStatus::CREATED) {
        return false;
    }

    // The existing node changed on the remote replica wins.
    if changed_by_remote(other.local_status) {
        return false;
    }

    // The incoming node renamed or moved on the remote replica wins.
    if model.local_status.contains(UpdateStatus::RENAMED)
        || model.local_status.contains(UpdateStatus::MOVED)
    {
        return true;
    }

    // Otherwise the existing node wins.
    false
}

fn unhandled(conflict: ConflictType, pipeline: &str) -> ReconciliationError {
    ReconciliationError::UnhandledConflict {
        conflict_type: conflict.to_string(),
        pipeline: pipeline.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FsNodeModel, NodeType};
    use crate::name::NumberedNameFactory;
    use crate::status::UpdateStatus;
    use crate::tree::{PropagationTree, SyncedNodeModel, SyncedTree, UpdateTree};

    fn tree_set() -> TreeSet<u64> {
        let mut synced = SyncedTree::in_memory(
            "synced",
            SyncedNodeModel::new(FsNodeModel::directory(0u64, 0, ""), 0),
        );
        synced
            .execute(Operation::create(SyncedNodeModel::new(
                FsNodeModel::directory(1, 0, "root-a"),
                101,
            )))
            .unwrap();
        synced
            .execute(Operation::create(SyncedNodeModel::new(
                FsNodeModel::file(2, 1, "a.txt").with_size(5),
                102,
            )))
            .unwrap();

        TreeSet {
            synced,
            remote_updates: UpdateTree::in_memory(
                "remote-updates",
                UpdateNodeModel::new(FsNodeModel::directory(0u64, 0, ""), UpdateStatus::UNCHANGED),
            ),
            local_updates: UpdateTree::in_memory(
                "local-updates",
                UpdateNodeModel::new(FsNodeModel::directory(0u64, 0, ""), UpdateStatus::UNCHANGED),
            ),
            propagation: PropagationTree::in_memory(
                "propagation",
                PropagationNodeModel::new(FsNodeModel::directory(0u64, 0, ""), 0),
            ),
        }
    }

    #[test]
    fn test_move_conflict_remote_destination_wins() {
        let remote = UpdateNodeModel::new(
            FsNodeModel::file(2, 5, "remote-name.txt"),
            UpdateStatus::RENAMED.union(UpdateStatus::MOVED),
        );
        let mut local = UpdateNodeModel::new(
            FsNodeModel::file(2, 6, "local-name.txt"),
            UpdateStatus::RENAMED.union(UpdateStatus::MOVED),
        );

        resolve_move_conflict(&remote, &mut local, ConflictType::MoveMoveSource).unwrap();
        assert_eq!(local.fs.parent_id, 5);
        assert_eq!(local.fs.name, "remote-name.txt");
    }

    #[test]
    fn test_edit_conflict_flags_backup_and_drops_local_edit() {
        let remote = UpdateNodeModel::new(
            FsNodeModel::file(2, 1, "a.txt").with_size(9).with_content_version(3),
            UpdateStatus::EDITED,
        );
        let mut local = UpdateNodeModel::new(
            FsNodeModel::file(2, 1, "a.txt").with_size(7),
            UpdateStatus::EDITED.union(UpdateStatus::RENAMED),
        );

        let backup =
            resolve_edit_conflict(&remote, &mut local, ConflictType::EditEdit).unwrap();
        assert!(backup);
        assert!(!local.status.contains(UpdateStatus::EDITED));
        assert!(local.status.contains(UpdateStatus::RENAMED));
        assert_eq!(local.fs.size, 9);
        assert_eq!(local.fs.content_version, 3);
    }

    #[test]
    fn test_undo_move_restores_synced_link() {
        let trees = tree_set();
        let model = UpdateNodeModel::new(
            FsNodeModel::file(2, 0, "a.txt"),
            UpdateStatus::MOVED,
        );

        let resolved = resolve_indirect_conflict(
            &trees,
            model,
            ConflictType::MoveParentDeleteDest,
            &NumberedNameFactory,
        )
        .unwrap();

        assert_eq!(resolved.fs.parent_id, 1);
        assert_eq!(resolved.fs.name, "a.txt");
    }

    #[test]
    fn test_create_parent_delete_relocates_to_sync_root() {
        let trees = tree_set();
        let model = UpdateNodeModel::new(
            FsNodeModel::file(9, 2, "new.txt"),
            UpdateStatus::CREATED,
        );

        let resolved = resolve_indirect_conflict(
            &trees,
            model,
            ConflictType::CreateParentDelete,
            &NumberedNameFactory,
        )
        .unwrap();

        assert_eq!(resolved.fs.parent_id, 1, "nearest sync root");
        assert_eq!(resolved.fs.name, "new (1).txt");
    }

    #[test]
    fn test_restore_rewrites_deleted_direction() {
        let trees = tree_set();

        // Local renamed (remote_status), remote deleted (local_status).
        let model = PropagationNodeModel::new(FsNodeModel::file(2, 1, "b.txt"), 102)
            .with_remote_status(UpdateStatus::RENAMED)
            .with_local_status(UpdateStatus::DELETED);

        let resolved = resolve_delete_conflict(
            &trees,
            model,
            ConflictType::MoveDelete,
            &NumberedNameFactory,
        )
        .unwrap();

        assert_eq!(
            resolved.remote_status,
            UpdateStatus::CREATED.insert(UpdateStatus::RESTORE)
        );
        assert!(resolved.local_status.is_unchanged());
        assert_eq!(resolved.fs.name, "b.txt");
    }

    #[test]
    fn test_name_clash_remote_created_beats_local_created() {
        let mut trees = tree_set();

        // Existing node: created locally (remote_status = Created).
        let other = PropagationNodeModel::new(FsNodeModel::directory(7, 1, "Docs"), 7)
            .with_remote_status(UpdateStatus::CREATED);
        trees
            .propagation
            .execute(Operation::create(PropagationNodeModel::new(
                FsNodeModel::directory(1, 0, "root-a"),
                101,
            )))
            .unwrap();
        trees
            .propagation
            .execute(Operation::create(other.clone()))
            .unwrap();

        // Incoming node: created remotely (local_status = Created).
        let model = PropagationNodeModel::new(FsNodeModel::directory(107, 1, "Docs"), 107)
            .with_local_status(UpdateStatus::CREATED);

        let resolved = resolve_name_clash(
            &mut trees,
            model,
            other,
            ConflictType::CreateCreate,
            &NumberedNameFactory,
        )
        .unwrap();

        // The incoming remote creation kept its name; the existing local
        // creation was renamed. Its created direction absorbs the rename
        // (the creation carries the new name), the other direction gains
        // the explicit Renamed.
        assert_eq!(resolved.fs.name, "Docs");
        let renamed = trees.propagation.node(7).unwrap();
        assert_eq!(renamed.fs.name, "Docs (1)");
        assert_eq!(renamed.remote_status, UpdateStatus::CREATED);
        assert!(renamed.local_status.contains(UpdateStatus::RENAMED));
    }

    #[test]
    fn test_name_clash_unchanged_existing_wins() {
        let mut trees = tree_set();
        trees
            .propagation
            .execute(Operation::create(PropagationNodeModel::new(
                FsNodeModel::directory(1, 0, "root-a"),
                101,
            )))
            .unwrap();

        let other = PropagationNodeModel::new(FsNodeModel::file(2, 1, "a.txt"), 102);
        let model = PropagationNodeModel::new(FsNodeModel::file(9, 1, "a.txt"), 9)
            .with_remote_status(UpdateStatus::CREATED);

        let resolved = resolve_name_clash(
            &mut trees,
            model,
            other,
            ConflictType::MoveCreate,
            &NumberedNameFactory,
        )
        .unwrap();

        assert_eq!(resolved.fs.name, "a (1).txt");
        assert_eq!(resolved.fs.node_type, NodeType::File);
    }
}
