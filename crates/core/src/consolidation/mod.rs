//! Per-replica consolidation of detected changes into an Update Tree.
//!
//! Each detected operation passes through a consistency guard (stale items
//! are logged and dropped), status consolidation against the Synced Tree,
//! an effectiveness filter, and finally lands in the Update Tree with any
//! missing ancestors synthesized and unchanged leaves pruned. A transition
//! into the deleted state triggers the subtree deletion cascade instead.

mod ancestors;
mod deletion;
mod operation;

pub use ancestors::with_missing_ancestors;

use tracing::{debug, warn};

use crate::errors::ConsolidationError;
use crate::models::{FsNodeModel, NodeKey, Operation, OperationType, Replica};
use crate::status::UpdateStatus;
use crate::tree::{SyncedNodeModel, SyncedTree, UpdateNodeModel, UpdateTree};

/// Folds one replica's detected operations into its Update Tree.
pub struct Consolidator<'a, Id: NodeKey> {
    replica: Replica,
    synced: &'a SyncedTree<Id>,
    updates: &'a mut UpdateTree<Id>,
}

impl<'a, Id: NodeKey> Consolidator<'a, Id> {
    pub fn new(
        replica: Replica,
        synced: &'a SyncedTree<Id>,
        updates: &'a mut UpdateTree<Id>,
    ) -> Self {
        Self {
            replica,
            synced,
            updates,
        }
    }

    /// Fold one detected operation into the Update Tree.
    ///
    /// Inconsistent items are dropped (a later full re-enumeration heals
    /// any missed state); tree errors are invariant violations and abort
    /// the pass.
    pub fn consolidate(
        &mut self,
        detected: &Operation<FsNodeModel<Id>>,
    ) -> Result<(), ConsolidationError> {
        debug!(
            replica = %self.replica,
            op = %detected.op_type,
            id = %detected.model.id,
            parent_id = %detected.model.parent_id,
            "consolidating detected operation"
        );

        let synced_node = self
            .synced
            .node_by_own_id(detected.model.id, self.replica)
            .cloned();
        let node = self.updates.node(detected.model.id).cloned();

        if !self.is_consistent(detected, node.as_ref(), synced_node.as_ref()) {
            return Ok(());
        }

        let Some(operation) = operation::consolidation_operation(
            self.replica,
            self.synced,
            detected,
            node.as_ref(),
            synced_node.as_ref(),
        )?
        else {
            return Ok(());
        };

        if !operation::has_effect(&operation, node.as_ref()) {
            debug!(
                replica = %self.replica,
                id = %detected.model.id,
                "detected operation has no effect"
            );
            return Ok(());
        }

        let prev_parent = node.as_ref().map(|n| n.fs.parent_id);

        if is_deletion(&operation, node.as_ref()) {
            deletion::run_cascade(self.replica, self.synced, self.updates, detected.model.id)?;
        } else {
            let ops =
                with_missing_ancestors(self.replica, self.synced, self.updates, operation)?;
            self.updates
                .execute_all(ops)
                .map_err(ConsolidationError::Tree)?;

            self.prune(Some(detected.model.id))?;
        }

        self.prune(prev_parent)?;

        debug!(
            replica = %self.replica,
            id = %detected.model.id,
            "finished consolidating detected operation"
        );

        Ok(())
    }

    /// Filter out operations referring to branches already known to be
    /// deleted or not yet known at all.
    fn is_consistent(
        &self,
        detected: &Operation<FsNodeModel<Id>>,
        node: Option<&UpdateNodeModel<Id>>,
        synced_node: Option<&SyncedNodeModel<Id>>,
    ) -> bool {
        let node_exists = node.is_some() || synced_node.is_some();

        let parent_exists = !matches!(
            detected.op_type,
            OperationType::Create | OperationType::Move
        ) || self.updates.contains(detected.model.parent_id)
            || self
                .synced
                .node_by_own_id(detected.model.parent_id, self.replica)
                .is_some();

        let consistent = match detected.op_type {
            // Creation at a non-existing parent.
            OperationType::Create => parent_exists,

            // Editing or deleting in a deleted branch.
            OperationType::Edit | OperationType::Delete => node_exists,

            // Move inside, into, or out of a deleted branch.
            OperationType::Move => node_exists && parent_exists,

            OperationType::Update => true,
        };

        if !consistent {
            warn!(
                replica = %self.replica,
                op = %detected.op_type,
                id = %detected.model.id,
                parent_id = %detected.model.parent_id,
                "inconsistent detected update dropped"
            );
        }

        consistent
    }

    fn prune(&mut self, start: Option<Id>) -> Result<(), ConsolidationError> {
        self.updates
            .prune_upward(start, |model| model.status.is_unchanged())
            .map_err(ConsolidationError::Tree)?;
        Ok(())
    }
}

fn is_deletion<Id: NodeKey>(
    operation: &Operation<UpdateNodeModel<Id>>,
    node: Option<&UpdateNodeModel<Id>>,
) -> bool {
    operation.model.status.contains(UpdateStatus::DELETED)
        && node.is_some_and(|n| !n.status.contains(UpdateStatus::DELETED))
}
