//! The synchronization engine.
//!
//! [`SyncEngine`] owns the four trees and both detected-change queues. A
//! synchronization pass drains the remote queue, then the local queue,
//! then reconciles the Update Trees into the Propagation Tree, all under
//! one lock, so the three stages form a single serial execution context
//! and never interleave their tree mutations. Cancellation is cooperative
//! and checked between queue items, never mid-mutation.
//!
//! Identity requirements: node ids must be globally unique across both
//! replicas (one shared allocator), the Synced, local Update and
//! Propagation trees share the local-space root id, and the remote Update
//! Tree's root id is the Synced root's alt id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::changes::ChangeQueue;
use crate::config::EngineConfig;
use crate::consolidation::Consolidator;
use crate::errors::EngineError;
use crate::models::{NodeKey, Operation, Replica};
use crate::name::{NameFactory, PatternNameFactory};
use crate::reconcile::Reconciler;
use crate::tree::{pre_order_ids, PropagationNodeModel, TreeSet};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared with the caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Statistics from a single synchronization pass.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub remote_consolidated: usize,
    pub local_consolidated: usize,
    pub started_at: String,
    pub completed_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The reconciliation engine for one synchronized replica pair.
pub struct SyncEngine<Id: NodeKey> {
    trees: tokio::sync::Mutex<TreeSet<Id>>,
    remote_changes: Arc<ChangeQueue<Id>>,
    local_changes: Arc<ChangeQueue<Id>>,
    clash_names: Box<dyn NameFactory<Id>>,
    delete_names: Box<dyn NameFactory<Id>>,
}

impl<Id: NodeKey> SyncEngine<Id> {
    pub fn new(
        trees: TreeSet<Id>,
        remote_changes: Arc<ChangeQueue<Id>>,
        local_changes: Arc<ChangeQueue<Id>>,
        clash_names: Box<dyn NameFactory<Id>>,
        delete_names: Box<dyn NameFactory<Id>>,
    ) -> Self {
        let synced_root = trees.synced.root().clone();
        assert_eq!(
            trees.local_updates.root_id(),
            synced_root.fs.id,
            "local update tree must share the synced root id"
        );
        assert_eq!(
            trees.propagation.root_id(),
            synced_root.fs.id,
            "propagation tree must share the synced root id"
        );
        assert_eq!(
            trees.remote_updates.root_id(),
            synced_root.alt_id,
            "remote update tree root must be the synced root's alt id"
        );

        info!("initializing sync engine");

        Self {
            trees: tokio::sync::Mutex::new(trees),
            remote_changes,
            local_changes,
            clash_names,
            delete_names,
        }
    }

    /// An engine whose conflict-rename factories come from configuration.
    pub fn with_config(
        config: &EngineConfig,
        trees: TreeSet<Id>,
        remote_changes: Arc<ChangeQueue<Id>>,
        local_changes: Arc<ChangeQueue<Id>>,
    ) -> Self {
        Self::new(
            trees,
            remote_changes,
            local_changes,
            Box::new(PatternNameFactory::new(
                &config.conflict_names.name_clash_pattern,
            )),
            Box::new(PatternNameFactory::new(
                &config.conflict_names.delete_conflict_pattern,
            )),
        )
    }

    /// Whether either replica has detected changes waiting in its queue.
    pub fn has_new_updates(&self) -> bool {
        !self.remote_changes.is_empty() || !self.local_changes.is_empty()
    }

    /// Whether either Update Tree still records divergence to propagate.
    pub async fn has_updates_to_synchronize(&self) -> bool {
        let trees = self.trees.lock().await;
        !trees.remote_updates.is_empty() || !trees.local_updates.is_empty()
    }

    /// Run one synchronization pass: consolidate both replicas' detected
    /// changes, then reconcile.
    ///
    /// Returns [`EngineError::AlreadyRunning`] if a pass holds the lock,
    /// and [`EngineError::Cancelled`] when the token fires between queue
    /// items; the unacknowledged remainder replays on the next pass.
    pub async fn synchronize(&self, cancel: &CancellationToken) -> Result<SyncStats, EngineError> {
        let mut trees = self
            .trees
            .try_lock()
            .map_err(|_| EngineError::AlreadyRunning)?;

        let pass = Uuid::new_v4();
        let span = tracing::info_span!("synchronize", %pass);
        let _entered = span.enter();

        info!("started synchronization");
        let mut stats = SyncStats {
            started_at: Utc::now().to_rfc3339(),
            ..Default::default()
        };

        stats.remote_consolidated =
            self.consolidate(Replica::Remote, &self.remote_changes, &mut trees, cancel)?;
        stats.local_consolidated =
            self.consolidate(Replica::Local, &self.local_changes, &mut trees, cancel)?;

        if cancel.is_cancelled() {
            info!("cancelled synchronization");
            return Err(EngineError::Cancelled);
        }

        Reconciler::new(&mut trees, self.clash_names.as_ref(), self.delete_names.as_ref())
            .execute()?;

        stats.completed_at = Some(Utc::now().to_rfc3339());
        info!(
            remote = stats.remote_consolidated,
            local = stats.local_consolidated,
            "finished synchronization"
        );

        Ok(stats)
    }

    fn consolidate(
        &self,
        replica: Replica,
        queue: &ChangeQueue<Id>,
        trees: &mut TreeSet<Id>,
        cancel: &CancellationToken,
    ) -> Result<usize, EngineError> {
        info!(%replica, "started consolidation");
        let mut consumed = 0;

        loop {
            if cancel.is_cancelled() {
                info!(%replica, consumed, "cancelled consolidation");
                return Err(EngineError::Cancelled);
            }

            let Some(change) = queue.front() else {
                break;
            };

            let updates = match replica {
                Replica::Remote => &mut trees.remote_updates,
                Replica::Local => &mut trees.local_updates,
            };

            Consolidator::new(replica, &trees.synced, updates)
                .consolidate(&change.operation)?;

            // Acknowledged only after the mutation landed; a crash before
            // this point replays the item.
            queue.acknowledge(&change)?;
            consumed += 1;
        }

        info!(%replica, consumed, "finished consolidation");
        Ok(consumed)
    }

    /// Read access to the trees for inspection and for the downstream
    /// executor.
    pub async fn read_trees<R>(&self, f: impl FnOnce(&TreeSet<Id>) -> R) -> R {
        let trees = self.trees.lock().await;
        f(&trees)
    }

    /// The finalized propagation plan as create operations in pre-order,
    /// parents before children.
    pub async fn propagation_plan(&self) -> Vec<Operation<PropagationNodeModel<Id>>> {
        let trees = self.trees.lock().await;
        let root = trees.propagation.root_id();

        pre_order_ids(&trees.propagation, root, false)
            .into_iter()
            .filter_map(|id| trees.propagation.node(id).cloned())
            .map(Operation::create)
            .collect()
    }
}

impl<Id: NodeKey> std::fmt::Debug for SyncEngine<Id> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("remote_queue", &self.remote_changes.len())
            .field("local_queue", &self.local_changes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FsNodeModel, Operation};
    use crate::name::NumberedNameFactory;
    use crate::status::UpdateStatus;
    use crate::tree::{
        PropagationTree, SyncedNodeModel, SyncedTree, UpdateNodeModel, UpdateTree,
    };

    fn engine() -> SyncEngine<u64> {
        let mut synced = SyncedTree::in_memory(
            "synced",
            SyncedNodeModel::new(FsNodeModel::directory(0u64, 0, ""), 1000),
        );
        synced
            .execute(Operation::create(SyncedNodeModel::new(
                FsNodeModel::directory(1, 0, "docs"),
                1001,
            )))
            .unwrap();
        synced
            .execute(Operation::create(SyncedNodeModel::new(
                FsNodeModel::file(2, 1, "a.txt").with_size(5),
                1002,
            )))
            .unwrap();

        let trees = TreeSet {
            synced,
            remote_updates: UpdateTree::in_memory(
                "remote-updates",
                UpdateNodeModel::new(
                    FsNodeModel::directory(1000u64, 1000, ""),
                    UpdateStatus::UNCHANGED,
                ),
            ),
            local_updates: UpdateTree::in_memory(
                "local-updates",
                UpdateNodeModel::new(FsNodeModel::directory(0u64, 0, ""), UpdateStatus::UNCHANGED),
            ),
            propagation: PropagationTree::in_memory(
                "propagation",
                PropagationNodeModel::new(FsNodeModel::directory(0u64, 0, ""), 1000),
            ),
        };

        SyncEngine::new(
            trees,
            Arc::new(ChangeQueue::new("remote")),
            Arc::new(ChangeQueue::new("local")),
            Box::new(NumberedNameFactory),
            Box::new(NumberedNameFactory),
        )
    }

    #[tokio::test]
    async fn test_empty_pass_is_a_no_op() {
        let engine = engine();
        let stats = engine.synchronize(&CancellationToken::new()).await.unwrap();

        assert_eq!(stats.remote_consolidated, 0);
        assert_eq!(stats.local_consolidated, 0);
        assert!(stats.completed_at.is_some());
        assert!(!engine.has_updates_to_synchronize().await);
    }

    #[tokio::test]
    async fn test_pass_consolidates_and_reconciles() {
        let engine = engine();

        engine
            .local_changes
            .push(Operation::edit(FsNodeModel::file(2, 1, "a.txt").with_size(9)));

        let stats = engine.synchronize(&CancellationToken::new()).await.unwrap();
        assert_eq!(stats.local_consolidated, 1);
        assert!(engine.has_updates_to_synchronize().await);

        let plan = engine.propagation_plan().await;
        assert_eq!(plan.len(), 2, "placeholder ancestor plus the edit");
        let edited = plan.iter().find(|op| op.model.fs.id == 2).unwrap();
        assert_eq!(edited.model.remote_status, UpdateStatus::EDITED);
    }

    #[tokio::test]
    async fn test_cancelled_pass_preserves_queue() {
        let engine = engine();
        let cancel = CancellationToken::new();
        cancel.cancel();

        engine
            .local_changes
            .push(Operation::edit(FsNodeModel::file(2, 1, "a.txt").with_size(9)));

        let err = engine.synchronize(&cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(engine.has_new_updates(), "unacknowledged item replays");

        // The next pass picks it up.
        let stats = engine.synchronize(&CancellationToken::new()).await.unwrap();
        assert_eq!(stats.local_consolidated, 1);
        assert!(!engine.has_new_updates());
    }

    #[tokio::test]
    async fn test_with_config_renames_by_pattern() {
        let config = EngineConfig::default();
        let base = engine();

        // Rebuild with configured factories over the same kind of layout.
        let trees = base.trees.into_inner();
        let engine = SyncEngine::with_config(
            &config,
            trees,
            Arc::new(ChangeQueue::new("remote")),
            Arc::new(ChangeQueue::new("local")),
        );

        // Both replicas create a directory "Docs" under docs' parent; the
        // loser gets the configured " (n)" suffix.
        engine
            .local_changes
            .push(Operation::create(FsNodeModel::directory(50, 1, "Docs")));
        engine
            .remote_changes
            .push(Operation::create(FsNodeModel::directory(1950, 1001, "Docs")));

        engine.synchronize(&CancellationToken::new()).await.unwrap();

        engine
            .read_trees(|trees| {
                let loser = trees.propagation.node(50).unwrap();
                assert_eq!(loser.fs.name, "Docs (1)");
            })
            .await;
    }

    #[tokio::test]
    async fn test_queue_notification_signals_work() {
        let engine = Arc::new(engine());

        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine.local_changes.added().await;
                engine.has_new_updates()
            })
        };

        tokio::task::yield_now().await;
        engine
            .local_changes
            .push(Operation::edit(FsNodeModel::file(2, 1, "a.txt").with_size(9)));

        assert!(waiter.await.unwrap());
    }
}
