//! Applying a merged model to the Propagation Tree.
//!
//! The tree is rewritten with the minimal operation set (equalize),
//! missing ancestors are synthesized from the Synced Tree as unchanged
//! placeholders, unchanged leaves are pruned, and nodes that entered the
//! tree under both id spaces (a created pair matched late) are coalesced.

use crate::errors::{ReconciliationError, TreeError};
use crate::models::{NodeKey, Operation, OperationType};
use crate::status::UpdateStatus;
use crate::tree::{
    PropagationNodeModel, PropagationTree, SyncedTree, TreeModel, TreeSet,
};

// ---------------------------------------------------------------------------
// Equalize
// ---------------------------------------------------------------------------

/// The minimal operation set rewriting `current` into `incoming`.
pub fn equalize_operations<Id: NodeKey, M: TreeModel<Id>>(
    current: Option<&M>,
    incoming: Option<&M>,
) -> Result<Vec<Operation<M>>, TreeError> {
    match (current, incoming) {
        (None, None) => Ok(Vec::new()),

        (None, Some(incoming)) => Ok(vec![Operation::create(incoming.clone())]),

        (Some(current), None) => Ok(vec![Operation::delete(current.clone())]),

        (Some(current), Some(incoming)) => {
            if current.node_type() != incoming.node_type() {
                return Err(TreeError::UnexpectedState(format!(
                    "node {} changed type during equalization",
                    incoming.id()
                )));
            }

            let mut operations = Vec::new();
            let mut metadata_updated = false;

            if !current.fs().link_eq(incoming.fs()) {
                operations.push(Operation::mv(incoming.clone()));
                metadata_updated = true;
            }

            if !current.fs().attributes_eq(incoming.fs()) {
                operations.push(Operation::edit(incoming.clone()));
                metadata_updated = true;
            }

            if !metadata_updated && !current.metadata_eq(incoming) {
                operations.push(Operation::update(incoming.clone()));
            }

            Ok(operations)
        }
    }
}

// ---------------------------------------------------------------------------
// Missing ancestors
// ---------------------------------------------------------------------------

/// Wrap `operation` with creates for Propagation Tree ancestors missing
/// between the target parent and the nearest tracked ancestor, copied from
/// the Synced Tree as unchanged placeholders.
fn with_missing_ancestors<Id: NodeKey>(
    synced: &SyncedTree<Id>,
    propagation: &PropagationTree<Id>,
    operation: Operation<PropagationNodeModel<Id>>,
) -> Result<Vec<Operation<PropagationNodeModel<Id>>>, TreeError> {
    if !matches!(
        operation.op_type,
        OperationType::Create | OperationType::Move
    ) {
        return Ok(vec![operation]);
    }

    let parent_id = operation.model.fs.parent_id;
    if propagation.contains(parent_id) {
        return Ok(vec![operation]);
    }

    let mut synced_node = synced
        .node(parent_id)
        .ok_or_else(|| TreeError::NodeNotFound(parent_id.to_string()))?;

    let mut gap = Vec::new();
    loop {
        if synced.is_root(synced_node.fs.id) {
            break;
        }

        gap.push(synced_node.clone());

        let parent = synced.get(synced_node.fs.parent_id)?;
        if propagation.contains(parent.fs.id) {
            break;
        }

        synced_node = parent;
    }

    let mut operations: Vec<Operation<PropagationNodeModel<Id>>> = gap
        .into_iter()
        .rev()
        .map(|synced_model| {
            Operation::create(PropagationNodeModel::new(
                synced_model.fs.clone(),
                synced_model.alt_id,
            ))
        })
        .collect();

    operations.push(operation);
    Ok(operations)
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Equalize the Propagation Tree node with the merged model.
pub fn apply_to_propagation<Id: NodeKey>(
    trees: &mut TreeSet<Id>,
    model: &PropagationNodeModel<Id>,
) -> Result<(), ReconciliationError> {
    let current = trees.propagation.node(model.fs.id).cloned();

    // Skip creating an unchanged placeholder whose parent is absent or
    // deleted; nothing would ever consume it.
    if current.is_none() && !model.is_changed() {
        match trees.propagation.node(model.fs.parent_id) {
            None => return Ok(()),
            Some(parent) => {
                if !trees.propagation.is_root(parent.fs.id) && parent.is_deleted() {
                    return Ok(());
                }
            }
        }
    }

    // A node merged from two independent creations may already exist in
    // the tree under its remote id; coalesce the pair.
    let mut duplicate = None;
    if model.fs.id != model.alt_id {
        if let Some(other) = trees.propagation.node_by_alt_id(model.alt_id).cloned() {
            if other.fs.id != model.fs.id {
                if other.fs.id == other.alt_id {
                    // Free the alt id so the merged node can claim it.
                    let refreshed = other.clone().with_alt_id(model.fs.id);
                    trees
                        .propagation
                        .execute(Operation::update(refreshed.clone()))
                        .map_err(ReconciliationError::Tree)?;
                    duplicate = Some(refreshed);
                } else {
                    return Err(ReconciliationError::Tree(TreeError::DuplicateAltId {
                        alt_id: model.alt_id.to_string(),
                        id: other.fs.id.to_string(),
                    }));
                }
            }
        }
    }

    let prev_parent = current.as_ref().map(|node| node.fs.parent_id);

    for operation in equalize_operations(current.as_ref(), Some(model))
        .map_err(ReconciliationError::Tree)?
    {
        let operations = with_missing_ancestors(&trees.synced, &trees.propagation, operation)
            .map_err(ReconciliationError::Tree)?;
        trees
            .propagation
            .execute_all(operations)
            .map_err(ReconciliationError::Tree)?;
    }

    if let Some(duplicate) = duplicate {
        // Move the stale twin's children under the merged node, then drop
        // it.
        let children: Vec<Id> = trees.propagation.children_ids(duplicate.fs.id).collect();
        for child_id in children {
            let mut child = trees
                .propagation
                .get(child_id)
                .map_err(ReconciliationError::Tree)?
                .clone();
            child.fs.parent_id = model.fs.id;
            trees
                .propagation
                .execute(Operation::mv(child))
                .map_err(ReconciliationError::Tree)?;
        }

        trees
            .propagation
            .execute(Operation::delete(duplicate))
            .map_err(ReconciliationError::Tree)?;
    }

    prune(&mut trees.propagation, Some(model.fs.id))?;
    prune(&mut trees.propagation, prev_parent)?;

    Ok(())
}

/// Remove unchanged leaves starting at `start`, walking up as removals
/// unblock ancestors.
pub fn prune<Id: NodeKey>(
    propagation: &mut PropagationTree<Id>,
    start: Option<Id>,
) -> Result<(), ReconciliationError> {
    propagation
        .prune_upward(start, |model| {
            model.remote_status == UpdateStatus::UNCHANGED
                && model.local_status == UpdateStatus::UNCHANGED
        })
        .map_err(ReconciliationError::Tree)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FsNodeModel;
    use crate::tree::{SyncedNodeModel, UpdateNodeModel, UpdateTree};

    fn tree_set() -> TreeSet<u64> {
        let mut synced = SyncedTree::in_memory(
            "synced",
            SyncedNodeModel::new(FsNodeModel::directory(0u64, 0, ""), 0),
        );
        synced
            .execute(Operation::create(SyncedNodeModel::new(
                FsNodeModel::directory(1, 0, "docs"),
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
    fn test_apply_creates_node_with_ancestors() {
        let mut trees = tree_set();

        let model = PropagationNodeModel::new(FsNodeModel::file(2, 1, "a.txt").with_size(9), 102)
            .with_local_status(UpdateStatus::EDITED);

        apply_to_propagation(&mut trees, &model).unwrap();

        let docs = trees.propagation.node(1).unwrap();
        assert!(docs.remote_status.is_unchanged());
        assert_eq!(docs.alt_id, 101);
        assert_eq!(trees.propagation.node(2).unwrap().fs.size, 9);
    }

    #[test]
    fn test_apply_is_minimal() {
        let mut trees = tree_set();

        let model = PropagationNodeModel::new(FsNodeModel::file(2, 1, "a.txt").with_size(9), 102)
            .with_local_status(UpdateStatus::EDITED);
        apply_to_propagation(&mut trees, &model).unwrap();

        // Re-applying the identical model produces no new state.
        apply_to_propagation(&mut trees, &model).unwrap();
        assert_eq!(trees.propagation.len(), 2);
    }

    #[test]
    fn test_apply_unchanged_model_prunes_node() {
        let mut trees = tree_set();

        let changed = PropagationNodeModel::new(FsNodeModel::file(2, 1, "a.txt").with_size(9), 102)
            .with_local_status(UpdateStatus::EDITED);
        apply_to_propagation(&mut trees, &changed).unwrap();

        let unchanged = PropagationNodeModel::new(FsNodeModel::file(2, 1, "a.txt").with_size(5), 102);
        apply_to_propagation(&mut trees, &unchanged).unwrap();

        // Both the node and its placeholder ancestor are gone.
        assert!(trees.propagation.is_empty());
    }

    #[test]
    fn test_apply_skips_unchanged_node_without_parent() {
        let mut trees = tree_set();

        let model = PropagationNodeModel::new(FsNodeModel::file(2, 1, "a.txt").with_size(5), 102);
        apply_to_propagation(&mut trees, &model).unwrap();
        assert!(trees.propagation.is_empty());
    }

    #[test]
    fn test_apply_coalesces_created_pair() {
        let mut trees = tree_set();

        // The raw remote copy entered under its remote id (900), with a
        // child.
        trees
            .propagation
            .execute(Operation::create(
                PropagationNodeModel::new(FsNodeModel::directory(900, 0, "fresh"), 900)
                    .with_local_status(UpdateStatus::CREATED),
            ))
            .unwrap();
        trees
            .propagation
            .execute(Operation::create(
                PropagationNodeModel::new(FsNodeModel::file(901, 900, "inner.txt"), 901)
                    .with_local_status(UpdateStatus::CREATED),
            ))
            .unwrap();

        // The merge later matched it with a local twin (id 9).
        let merged = PropagationNodeModel::new(FsNodeModel::directory(9, 0, "fresh"), 900)
            .with_remote_status(UpdateStatus::CREATED)
            .with_local_status(UpdateStatus::CREATED);

        apply_to_propagation(&mut trees, &merged).unwrap();

        assert!(trees.propagation.node(900).is_none(), "stale twin dropped");
        let node = trees.propagation.node(9).unwrap();
        assert_eq!(node.alt_id, 900);
        assert_eq!(
            trees.propagation.node(901).unwrap().fs.parent_id,
            9,
            "children follow the merged node"
        );
    }

    #[test]
    fn test_equalize_type_change_is_invariant_violation() {
        let current = PropagationNodeModel::new(FsNodeModel::file(1u64, 0, "x"), 1);
        let incoming = PropagationNodeModel::new(FsNodeModel::directory(1u64, 0, "x"), 1);

        let err = equalize_operations(Some(&current), Some(&incoming)).unwrap_err();
        assert!(matches!(err, TreeError::UnexpectedState(_)));
    }
}
