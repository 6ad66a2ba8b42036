//! Structural probes shared by conflict detection and resolution.
//!
//! All probes work in the local id space. Where a node is missing from the
//! Propagation Tree, the walk falls back to the Synced Tree baseline.

use std::collections::HashSet;

use crate::errors::ReconciliationError;
use crate::models::{NodeKey, Replica};
use crate::status::UpdateStatus;
use crate::tree::{
    PropagationNodeModel, PropagationTree, SyncedTree, TreeSet, UpdateNodeModel,
};

/// Whether the nearest Propagation Tree ancestor of `parent_id` (falling
/// back through Synced Tree links) carries a deleted status.
pub fn nearest_ancestor_deleted<Id: NodeKey>(
    synced: &SyncedTree<Id>,
    propagation: &PropagationTree<Id>,
    parent_id: Id,
) -> Result<bool, ReconciliationError> {
    let mut current = nearest_propagation_ancestor(synced, propagation, parent_id)?;

    while !propagation.is_root(current) {
        let model = propagation
            .get(current)
            .map_err(ReconciliationError::Tree)?;

        if model.is_deleted() {
            return Ok(true);
        }

        current = model.fs.parent_id;
    }

    Ok(false)
}

/// The nearest ancestor of `parent_id` (inclusive) present in the
/// Propagation Tree, found through Synced Tree links when needed.
fn nearest_propagation_ancestor<Id: NodeKey>(
    synced: &SyncedTree<Id>,
    propagation: &PropagationTree<Id>,
    parent_id: Id,
) -> Result<Id, ReconciliationError> {
    if propagation.contains(parent_id) {
        return Ok(parent_id);
    }

    let mut synced_node = synced
        .node(parent_id)
        .ok_or_else(|| ReconciliationError::MissingSyncedNode(parent_id.to_string()))?;

    while !synced.is_root(synced_node.fs.id) {
        let parent_id = synced_node.fs.parent_id;
        if propagation.contains(parent_id) {
            return Ok(parent_id);
        }

        synced_node = synced
            .node(parent_id)
            .ok_or_else(|| ReconciliationError::MissingSyncedNode(parent_id.to_string()))?;
    }

    Ok(propagation.root_id())
}

/// Whether moving `node_id` under `dest_parent_id` would make the node its
/// own ancestor, judged against each node's *intended* parent: the link a
/// replica moved it to, or the Synced Tree link otherwise. Judging intent
/// rather than the partially merged Propagation Tree makes the check
/// symmetric, so every participant of a cross-replica move cycle detects
/// it during its own merge.
pub fn cyclic_move_exists<Id: NodeKey>(
    trees: &TreeSet<Id>,
    node_id: Id,
    dest_parent_id: Id,
) -> bool {
    let mut visited = HashSet::new();
    let mut current = dest_parent_id;

    while !trees.synced.is_root(current) && current != trees.propagation.root_id() {
        if current == node_id {
            return true;
        }

        // A cycle among other nodes: their own merges resolve it.
        if !visited.insert(current) {
            return false;
        }

        match intended_parent(trees, current) {
            Some(parent) => current = parent,
            None => return false,
        }
    }

    false
}

/// The parent a node is headed for: the remote replica's move destination,
/// else the local replica's, else the Synced Tree parent. Ids are local
/// space.
fn intended_parent<Id: NodeKey>(trees: &TreeSet<Id>, id: Id) -> Option<Id> {
    let synced = trees.synced.node(id);

    if let Some(remote_node) = remote_node_of(trees, id, synced) {
        if remote_node.status.contains(UpdateStatus::MOVED)
            || remote_node.status.contains(UpdateStatus::CREATED)
        {
            let parent = remote_node.fs.parent_id;
            return Some(
                trees
                    .synced
                    .node_by_alt_id(parent)
                    .map_or(parent, |n| n.fs.id),
            );
        }
    }

    if let Some(local_node) = trees.local_updates.node(id) {
        if local_node.status.contains(UpdateStatus::MOVED)
            || local_node.status.contains(UpdateStatus::CREATED)
        {
            return Some(local_node.fs.parent_id);
        }
    }

    synced.map(|n| n.fs.parent_id)
}

fn remote_node_of<'a, Id: NodeKey>(
    trees: &'a TreeSet<Id>,
    id: Id,
    synced: Option<&crate::tree::SyncedNodeModel<Id>>,
) -> Option<&'a UpdateNodeModel<Id>> {
    let remote_id = synced.map_or(id, |n| n.alt_id);
    trees.remote_updates.node(remote_id)
}

/// A non-deleted Propagation Tree sibling clashing with the node's link,
/// or, when the node was renamed on one replica and moved on the other, an
/// untouched Synced Tree sibling not yet present in the Propagation Tree.
pub fn name_clash<Id: NodeKey>(
    synced: &SyncedTree<Id>,
    propagation: &PropagationTree<Id>,
    model: &PropagationNodeModel<Id>,
) -> Option<PropagationNodeModel<Id>> {
    if let Some(conflicting) = clashing_propagation_sibling(propagation, model.fs.parent_id, &model.fs.name, model.fs.id)
    {
        return Some(conflicting.clone());
    }

    let renamed_and_moved_split = model.local_status.contains(UpdateStatus::RENAMED)
        && model.remote_status.contains(UpdateStatus::MOVED)
        || model.local_status.contains(UpdateStatus::MOVED)
            && model.remote_status.contains(UpdateStatus::RENAMED);

    if renamed_and_moved_split {
        let conflicting = synced
            .children_by_name(model.fs.parent_id, &model.fs.name)
            .find(|sibling| sibling.fs.id != model.fs.id && !propagation.contains(sibling.fs.id));

        if let Some(synced_sibling) = conflicting {
            return Some(PropagationNodeModel::new(
                synced_sibling.fs.clone(),
                synced_sibling.alt_id,
            ));
        }
    }

    None
}

/// Whether any sibling clashes with the given link.
pub fn name_clash_exists<Id: NodeKey>(
    propagation: &PropagationTree<Id>,
    parent_id: Id,
    name: &str,
    own_id: Id,
) -> bool {
    clashing_propagation_sibling(propagation, parent_id, name, own_id).is_some()
}

fn clashing_propagation_sibling<'a, Id: NodeKey>(
    propagation: &'a PropagationTree<Id>,
    parent_id: Id,
    name: &'a str,
    own_id: Id,
) -> Option<&'a PropagationNodeModel<Id>> {
    propagation
        .children_by_name(parent_id, name)
        .find(|sibling| sibling.fs.id != own_id && !sibling.is_deleted())
}

/// The id of the sync root enclosing the node's current position: the
/// first-level ancestor on its parent chain (Propagation Tree links first,
/// Synced Tree fallback). Sync roots have fixed unique names and the tree
/// root as parent, so they are structurally incapable of conflicting.
pub fn sync_root_id<Id: NodeKey>(
    synced: &SyncedTree<Id>,
    propagation: &PropagationTree<Id>,
    parent_id: Id,
) -> Result<Id, ReconciliationError> {
    let root = propagation.root_id();
    let mut current = parent_id;

    loop {
        if current == root {
            return Ok(root);
        }

        let next = if let Some(node) = propagation.node(current) {
            node.fs.parent_id
        } else if let Some(node) = synced.node(current) {
            node.fs.parent_id
        } else {
            return Err(ReconciliationError::MissingSyncedNode(current.to_string()));
        };

        if next == root {
            return Ok(current);
        }

        current = next;
    }
}

/// Walk ancestors of a Synced Tree node through the given replica's Update
/// Tree: whether the nearest tracked ancestor is deleted.
pub fn update_tree_parent_deleted<Id: NodeKey>(
    trees: &TreeSet<Id>,
    synced_id: Id,
    replica: Replica,
) -> Result<bool, ReconciliationError> {
    let updates = match replica {
        Replica::Remote => &trees.remote_updates,
        Replica::Local => &trees.local_updates,
    };

    let mut current = trees
        .synced
        .node(synced_id)
        .ok_or_else(|| ReconciliationError::MissingSyncedNode(synced_id.to_string()))?;

    while !trees.synced.is_root(current.fs.id) {
        let parent = trees
            .synced
            .get(current.fs.parent_id)
            .map_err(ReconciliationError::Tree)?;

        if let Some(tracked) = updates.node(parent.own_id(replica)) {
            return Ok(tracked.status.contains(UpdateStatus::DELETED));
        }

        current = parent;
    }

    Ok(false)
}
