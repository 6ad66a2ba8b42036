//! Reconciliation: merging both Update Trees into the Propagation Tree.
//!
//! A pass clears the Propagation Tree, copies the remote updates in as the
//! baseline plan, then merges every changed node from either Update Tree
//! through the conflict pipelines. Directory deletions fan out into their
//! Synced Tree children so survivors (nodes moved out of a deleted branch)
//! are decided before the branch disappears; deletions both replicas agree
//! on are committed to the Synced Tree in a terminal sweep.

mod adjust;
mod apply;
mod merge;
mod prepare;

pub use apply::equalize_operations;

use std::collections::HashSet;

use tracing::{debug, info};

use crate::conflict::{detector, pseudo, resolve, ConflictType};
use crate::consolidation::with_missing_ancestors;
use crate::errors::ReconciliationError;
use crate::models::{NodeKey, NodeType, Operation, Replica};
use crate::name::NameFactory;
use crate::status::UpdateStatus;
use crate::tree::{
    pre_order_ids, post_order_ids, PropagationNodeModel, TreeSet, UpdateNodeModel,
};

/// Merges the two Update Trees against the Synced Tree into the
/// Propagation Tree, resolving every conflict on the way.
pub struct Reconciler<'a, Id: NodeKey> {
    trees: &'a mut TreeSet<Id>,
    clash_names: &'a dyn NameFactory<Id>,
    delete_names: &'a dyn NameFactory<Id>,
    /// Local-space ids merged in this pass; used to find remote-only
    /// leftovers.
    merged: HashSet<Id>,
    in_deletion_fanout: bool,
}

impl<'a, Id: NodeKey> Reconciler<'a, Id> {
    pub fn new(
        trees: &'a mut TreeSet<Id>,
        clash_names: &'a dyn NameFactory<Id>,
        delete_names: &'a dyn NameFactory<Id>,
    ) -> Self {
        Self {
            trees,
            clash_names,
            delete_names,
            merged: HashSet::new(),
            in_deletion_fanout: false,
        }
    }

    /// Run one full reconciliation pass.
    pub fn execute(&mut self) -> Result<(), ReconciliationError> {
        info!("started reconciliation");

        self.trees
            .propagation
            .clear()
            .map_err(ReconciliationError::Tree)?;

        self.copy_remote_updates()?;
        self.merge_local_updates()?;
        self.merge_remaining_remote_updates()?;
        self.sweep_agreed_deletions()?;

        info!("finished reconciliation");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pass stages
    // -----------------------------------------------------------------------

    fn copy_remote_updates(&mut self) -> Result<(), ReconciliationError> {
        debug!("copying remote updates into the propagation tree");

        let root = self.trees.remote_updates.root_id();
        for id in pre_order_ids(&self.trees.remote_updates, root, false) {
            let Some(node) = self.trees.remote_updates.node(id) else {
                continue;
            };

            let mapped = prepare::mapped_from_remote(&self.trees.synced, node);
            let model = PropagationNodeModel::new(mapped.fs, id).with_local_status(node.status);

            self.trees
                .propagation
                .execute(Operation::create(model))
                .map_err(ReconciliationError::Tree)?;
        }

        Ok(())
    }

    fn merge_local_updates(&mut self) -> Result<(), ReconciliationError> {
        debug!("merging local updates");

        // Directory deletions go last: their fan-out may re-reconcile
        // children that must land under parents processed in the first
        // pass.
        let root = self.trees.local_updates.root_id();
        let mut cached = Vec::new();

        for dir_deletions in [false, true] {
            for id in pre_order_ids(&self.trees.local_updates, root, false) {
                let Some(node) = self.trees.local_updates.node(id) else {
                    continue;
                };

                if node.status.is_unchanged() {
                    continue;
                }

                let is_dir_deletion = node.fs.node_type == NodeType::Directory
                    && node.status.contains(UpdateStatus::DELETED);
                if is_dir_deletion == dir_deletions {
                    cached.push(node.clone());
                }
            }
        }

        self.trees
            .local_updates
            .clear()
            .map_err(ReconciliationError::Tree)?;

        for model in cached {
            // Ancestors may be gone if a pseudo conflict was resolved
            // earlier in the pass.
            let ops = with_missing_ancestors(
                Replica::Local,
                &self.trees.synced,
                &self.trees.local_updates,
                Operation::create(model.clone()),
            )
            .map_err(ReconciliationError::Tree)?;
            self.trees
                .local_updates
                .execute_all(ops)
                .map_err(ReconciliationError::Tree)?;

            let node = self
                .trees
                .local_updates
                .get(model.fs.id)
                .map_err(ReconciliationError::Tree)?
                .clone();

            debug!(
                id = %node.fs.id,
                status = %node.status,
                name = %node.fs.name,
                "merging local update"
            );

            self.execute_merge(None, Some(node))?;
        }

        Ok(())
    }

    /// Remote-only changes that no local merge touched still classify and
    /// resolve against the local structure.
    fn merge_remaining_remote_updates(&mut self) -> Result<(), ReconciliationError> {
        debug!("merging remaining remote updates");

        let root = self.trees.remote_updates.root_id();
        for id in pre_order_ids(&self.trees.remote_updates, root, false) {
            let Some(node) = self.trees.remote_updates.node(id).cloned() else {
                continue;
            };

            if node.status.is_unchanged() {
                continue;
            }

            let local_id = self
                .trees
                .synced
                .node_by_alt_id(id)
                .map_or(id, |synced| synced.fs.id);

            if self.merged.contains(&local_id) {
                continue;
            }

            let local_node = self.trees.local_updates.node(local_id).cloned();
            self.execute_merge(Some(node), local_node)?;
        }

        Ok(())
    }

    /// Deletions both replicas agreed on are terminal: commit them to the
    /// Synced Tree, clear both Update Trees, and drop the plan node,
    /// children before parents.
    fn sweep_agreed_deletions(&mut self) -> Result<(), ReconciliationError> {
        debug!("sweeping agreed deletions");

        let root = self.trees.propagation.root_id();
        for id in post_order_ids(&self.trees.propagation, root, false) {
            let Some(model) = self.trees.propagation.node(id).cloned() else {
                continue;
            };

            if !model.remote_status.contains(UpdateStatus::DELETED)
                || !model.local_status.contains(UpdateStatus::DELETED)
            {
                continue;
            }

            debug!(id = %id, name = %model.fs.name, "both replicas deleted the node");

            let mut remote = UpdateNodeModel::new(model.fs.clone(), UpdateStatus::DELETED);
            let mut local = UpdateNodeModel::new(model.fs.clone(), UpdateStatus::DELETED);
            pseudo::resolve_pseudo_conflict(
                self.trees,
                &mut remote,
                &mut local,
                ConflictType::DeleteDeletePseudo,
                UpdateStatus::DELETED,
            )?;

            let parent_id = model.fs.parent_id;
            self.trees
                .propagation
                .execute(Operation::delete(model))
                .map_err(ReconciliationError::Tree)?;
            apply::prune(&mut self.trees.propagation, Some(parent_id))?;
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Per-node merge
    // -----------------------------------------------------------------------

    /// Entry point for one merge; fan-outs triggered by it share one
    /// processed-node set so no node is resolved twice.
    fn execute_merge(
        &mut self,
        remote_node: Option<UpdateNodeModel<Id>>,
        local_node: Option<UpdateNodeModel<Id>>,
    ) -> Result<(), ReconciliationError> {
        let mut processed = HashSet::new();
        self.reconcile_nodes(remote_node, local_node, &mut processed)
    }

    fn reconcile_nodes(
        &mut self,
        remote_node: Option<UpdateNodeModel<Id>>,
        local_node: Option<UpdateNodeModel<Id>>,
        processed: &mut HashSet<Id>,
    ) -> Result<(), ReconciliationError> {
        let unchanged = |node: &Option<UpdateNodeModel<Id>>| {
            node.as_ref().map_or(true, |n| n.status.is_unchanged())
        };
        if unchanged(&remote_node) && unchanged(&local_node) {
            return Ok(());
        }

        let (remote_model, local_model) =
            prepare::prepared_models(self.trees, remote_node.as_ref(), local_node.as_ref())?;

        if !processed.insert(local_model.fs.id) {
            return Ok(());
        }
        self.merged.insert(local_model.fs.id);

        let prev_propagation = self.trees.propagation.node(local_model.fs.id).cloned();
        let remote_id = remote_node.map(|n| n.fs.id);
        let local_id = local_node.map(|n| n.fs.id);

        self.reconcile_models(remote_model, local_model)?;

        self.process_directory_deletion(remote_id, local_id, prev_propagation, processed)
    }

    /// The resolution ladder for one node pair.
    fn reconcile_models(
        &mut self,
        mut remote: UpdateNodeModel<Id>,
        mut local: UpdateNodeModel<Id>,
    ) -> Result<(), ReconciliationError> {
        // Independent creations of the same node collapse first; they
        // change which models the rest of the ladder sees.
        if let Some((conflict, counterpart)) =
            detector::create_create_pseudo(self.trees, &remote, &local)
        {
            let counterpart = if local.status == UpdateStatus::CREATED {
                prepare::mapped_from_remote(&self.trees.synced, &counterpart)
            } else {
                counterpart
            };

            let mut paired_remote = if remote.status == UpdateStatus::CREATED {
                remote.clone()
            } else {
                counterpart.clone()
            };
            let mut paired_local = if local.status == UpdateStatus::CREATED {
                local.clone()
            } else {
                counterpart
            };

            pseudo::resolve_pseudo_conflict(
                self.trees,
                &mut paired_remote,
                &mut paired_local,
                conflict,
                UpdateStatus::CREATED,
            )?;

            remote = paired_remote;
            local = paired_local;
        }

        for (conflict, status) in detector::pseudo_conflicts(&remote, &local) {
            match conflict {
                // Terminal: handled by the agreed-deletion sweep once all
                // descendants are decided.
                ConflictType::DeleteDeletePseudo => continue,

                // An agreed move under a parent both replicas created is
                // only expressible once the parent itself is synced; until
                // then the agreement stays recorded in both trees.
                ConflictType::MoveMovePseudo
                    if status.contains(UpdateStatus::MOVED)
                        && !self.trees.synced.contains(local.fs.parent_id) =>
                {
                    continue
                }

                _ => {}
            }

            pseudo::resolve_pseudo_conflict(self.trees, &mut remote, &mut local, conflict, status)?;
        }

        let conflict = detector::indirect_conflict(self.trees, &remote)?;
        remote = resolve::resolve_indirect_conflict(self.trees, remote, conflict, self.delete_names)?;

        let conflict = detector::indirect_conflict(self.trees, &local)?;
        local = resolve::resolve_indirect_conflict(self.trees, local, conflict, self.delete_names)?;

        let conflict = detector::move_conflict(&remote, &local);
        resolve::resolve_move_conflict(&remote, &mut local, conflict)?;

        let conflict = detector::edit_conflict(&remote, &local);
        let backup = resolve::resolve_edit_conflict(&remote, &mut local, conflict)?;

        let mut merged = merge::merged_model(&self.trees.synced, &remote, &local, backup);

        let conflict = detector::delete_conflict(self.trees, &merged);
        merged = resolve::resolve_delete_conflict(self.trees, merged, conflict, self.delete_names)?;

        if let Some((conflict, other)) = detector::name_clash_conflict(self.trees, &merged) {
            merged = resolve::resolve_name_clash(self.trees, merged, other, conflict, self.clash_names)?;
        }

        merged = adjust::adjusted_status(self.trees, merged)?;

        apply::apply_to_propagation(self.trees, &merged)
    }

    // -----------------------------------------------------------------------
    // Directory-deletion fan-out
    // -----------------------------------------------------------------------

    fn process_directory_deletion(
        &mut self,
        remote_id: Option<Id>,
        local_id: Option<Id>,
        prev_propagation: Option<PropagationNodeModel<Id>>,
        processed: &mut HashSet<Id>,
    ) -> Result<(), ReconciliationError> {
        if self.in_deletion_fanout {
            return Ok(());
        }

        self.in_deletion_fanout = true;
        let result = self.directory_deletion_fanout(remote_id, local_id, prev_propagation, processed);
        self.in_deletion_fanout = false;
        result
    }

    fn directory_deletion_fanout(
        &mut self,
        remote_id: Option<Id>,
        local_id: Option<Id>,
        prev_propagation: Option<PropagationNodeModel<Id>>,
        processed: &mut HashSet<Id>,
    ) -> Result<(), ReconciliationError> {
        // A deleted plan node must end up with no children: when the merge
        // turned the node deleted, every child is re-reconciled.
        if let Some(prev) = prev_propagation {
            if !prev.is_deleted() {
                let turned_deleted = self
                    .trees
                    .propagation
                    .node(prev.fs.id)
                    .map_or(false, |now| now.is_deleted());

                if turned_deleted {
                    for child_id in pre_order_ids(&self.trees.propagation, prev.fs.id, false) {
                        let Some(child) = self.trees.propagation.node(child_id).cloned() else {
                            continue;
                        };
                        self.reconcile_by_ids(child.fs.id, child.alt_id, processed)?;
                    }
                }
            }
        }

        // Only a directly deleted directory re-reconciles its Synced Tree
        // children. The deleted node survives pseudo resolution only if it
        // is still in its Update Tree.
        let deleted_on = |node: Option<&UpdateNodeModel<Id>>| {
            node.map_or(false, |n| n.status.contains(UpdateStatus::DELETED))
        };

        if deleted_on(remote_id.and_then(|id| self.trees.remote_updates.node(id))) {
            let synced_id = remote_id.and_then(|id| {
                self.trees
                    .synced
                    .node_by_own_id(id, Replica::Remote)
                    .map(|n| n.fs.id)
            });
            if let Some(synced_id) = synced_id {
                self.process_deleted_directory_children(synced_id, Replica::Remote, processed)?;
            }
        } else if deleted_on(local_id.and_then(|id| self.trees.local_updates.node(id))) {
            let synced_id = local_id.filter(|id| self.trees.synced.contains(*id));
            if let Some(synced_id) = synced_id {
                self.process_deleted_directory_children(synced_id, Replica::Local, processed)?;
            }
        }

        Ok(())
    }

    /// Re-reconcile everything the deleted directory used to contain:
    /// the other replica's children of the directory, and the Synced Tree
    /// subtree, skipping descendants of nodes that survived the deletion
    /// by being moved out on the deleting replica.
    fn process_deleted_directory_children(
        &mut self,
        start_synced_id: Id,
        replica: Replica,
        processed: &mut HashSet<Id>,
    ) -> Result<(), ReconciliationError> {
        self.reconcile_other_children(start_synced_id, replica, processed)?;

        let mut stack: Vec<Id> = self
            .trees
            .synced
            .children_ids(start_synced_id)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        while let Some(id) = stack.pop() {
            let Some(synced_node) = self.trees.synced.node(id).cloned() else {
                continue;
            };

            let own_updates = match replica {
                Replica::Remote => &self.trees.remote_updates,
                Replica::Local => &self.trees.local_updates,
            };
            let survived = own_updates.contains(synced_node.own_id(replica));

            self.reconcile_by_ids(synced_node.fs.id, synced_node.alt_id, processed)?;
            self.reconcile_other_children(synced_node.fs.id, replica, processed)?;

            // A node still tracked by the deleting replica's Update Tree
            // was moved out of the branch; its children went with it.
            if !survived {
                let children: Vec<Id> = self.trees.synced.children_ids(id).collect();
                stack.extend(children.into_iter().rev());
            }
        }

        Ok(())
    }

    /// Children the *other* replica's Update Tree holds under the deleted
    /// directory (creations and move-ins the deleting replica never saw).
    fn reconcile_other_children(
        &mut self,
        synced_id: Id,
        replica: Replica,
        processed: &mut HashSet<Id>,
    ) -> Result<(), ReconciliationError> {
        let Some(synced_node) = self.trees.synced.node(synced_id).cloned() else {
            return Ok(());
        };

        if synced_node.fs.node_type != NodeType::Directory {
            return Ok(());
        }

        let other_replica = replica.other();
        let other_own_id = synced_node.own_id(other_replica);

        let children: Vec<UpdateNodeModel<Id>> = match other_replica {
            Replica::Remote => self
                .trees
                .remote_updates
                .child_models(other_own_id)
                .cloned()
                .collect(),
            Replica::Local => self
                .trees
                .local_updates
                .child_models(other_own_id)
                .cloned()
                .collect(),
        };

        for child in children {
            match other_replica {
                Replica::Remote => self.reconcile_nodes(Some(child), None, processed)?,
                Replica::Local => self.reconcile_nodes(None, Some(child), processed)?,
            }
        }

        Ok(())
    }

    /// Re-reconcile a node given its ids in both spaces, if either side
    /// still tracks a change for it.
    fn reconcile_by_ids(
        &mut self,
        local_id: Id,
        alt_id: Id,
        processed: &mut HashSet<Id>,
    ) -> Result<(), ReconciliationError> {
        let remote_node = self.trees.remote_updates.node(alt_id).cloned();
        let local_node = self.trees.local_updates.node(local_id).cloned();

        if remote_node.is_none() && local_node.is_none() {
            return Ok(());
        }

        let changed = remote_node
            .as_ref()
            .map_or(false, |n| !n.status.is_unchanged())
            || local_node.as_ref().map_or(false, |n| !n.status.is_unchanged());

        if changed {
            self.reconcile_nodes(remote_node, local_node, processed)?;
        }

        Ok(())
    }
}
