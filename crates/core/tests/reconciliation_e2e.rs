//! End-to-end reconciliation tests.
//!
//! These tests exercise the real `SyncEngine` over in-memory trees: both
//! replicas' detected changes go through their queues, one `synchronize`
//! pass runs consolidation and reconciliation, and the resulting trees are
//! checked against the convergence guarantees: ancestor completeness,
//! minimality, name uniqueness, acyclicity, and the canonical conflict
//! scenarios.
//!
//! Id convention: local ids below 500, remote ids from 500 up; the two
//! spaces never collide.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use twinsync_core::changes::ChangeQueue;
use twinsync_core::engine::{CancellationToken, SyncEngine};
use twinsync_core::models::{FsNodeModel, Operation};
use twinsync_core::name::NumberedNameFactory;
use twinsync_core::status::UpdateStatus;
use twinsync_core::tree::{
    pre_order_ids, PropagationNodeModel, PropagationTree, SyncedNodeModel, SyncedTree, TreeSet,
    UpdateNodeModel, UpdateTree,
};

// ===========================================================================
// Helpers
// ===========================================================================

const LOCAL_ROOT: u64 = 0;
const REMOTE_ROOT: u64 = 500;

/// Baseline layout, local/remote id pairs:
///
/// ```text
/// <root>                    0 / 500
/// └── home                  1 / 501
///     ├── projects          2 / 502
///     │   └── notes.txt     3 / 503   (size 10)
///     └── archive           4 / 504
///         └── old.txt       5 / 505   (size 20)
/// ```
fn baseline_synced() -> SyncedTree<u64> {
    let mut tree = SyncedTree::in_memory(
        "synced",
        SyncedNodeModel::new(FsNodeModel::directory(LOCAL_ROOT, LOCAL_ROOT, ""), REMOTE_ROOT),
    );

    let nodes = [
        (1u64, 0u64, "home", None),
        (2, 1, "projects", None),
        (3, 2, "notes.txt", Some(10)),
        (4, 1, "archive", None),
        (5, 4, "old.txt", Some(20)),
    ];

    for (id, parent, name, size) in nodes {
        let fs = match size {
            Some(size) => FsNodeModel::file(id, parent, name).with_size(size),
            None => FsNodeModel::directory(id, parent, name),
        };
        tree.execute(Operation::create(SyncedNodeModel::new(fs, id + 500)))
            .unwrap();
    }

    tree
}

struct Fixture {
    engine: SyncEngine<u64>,
    local: Arc<ChangeQueue<u64>>,
    remote: Arc<ChangeQueue<u64>>,
}

fn fixture() -> Fixture {
    // Run with RUST_LOG=debug to trace the pipelines.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let trees = TreeSet {
        synced: baseline_synced(),
        remote_updates: UpdateTree::in_memory(
            "remote-updates",
            UpdateNodeModel::new(
                FsNodeModel::directory(REMOTE_ROOT, REMOTE_ROOT, ""),
                UpdateStatus::UNCHANGED,
            ),
        ),
        local_updates: UpdateTree::in_memory(
            "local-updates",
            UpdateNodeModel::new(
                FsNodeModel::directory(LOCAL_ROOT, LOCAL_ROOT, ""),
                UpdateStatus::UNCHANGED,
            ),
        ),
        propagation: PropagationTree::in_memory(
            "propagation",
            PropagationNodeModel::new(
                FsNodeModel::directory(LOCAL_ROOT, LOCAL_ROOT, ""),
                REMOTE_ROOT,
            ),
        ),
    };

    let local = Arc::new(ChangeQueue::new("local"));
    let remote = Arc::new(ChangeQueue::new("remote"));
    let engine = SyncEngine::new(
        trees,
        Arc::clone(&remote),
        Arc::clone(&local),
        Box::new(NumberedNameFactory),
        Box::new(NumberedNameFactory),
    );

    Fixture {
        engine,
        local,
        remote,
    }
}

async fn synchronize(fixture: &Fixture) {
    fixture
        .engine
        .synchronize(&CancellationToken::new())
        .await
        .expect("synchronization pass failed");

    assert_invariants(fixture).await;
}

/// Tree-wide guarantees that must hold after every pass.
async fn assert_invariants(fixture: &Fixture) {
    fixture
        .engine
        .read_trees(|trees| {
            // Ancestor completeness: every node's parent chain exists in
            // its own tree.
            assert_parent_chains(&trees.local_updates, LOCAL_ROOT);
            assert_parent_chains(&trees.remote_updates, REMOTE_ROOT);

            // Minimality: no unchanged node with zero children.
            for id in pre_order_ids(&trees.local_updates, LOCAL_ROOT, false) {
                let node = trees.local_updates.node(id).unwrap();
                assert!(
                    !node.status.is_unchanged() || !trees.local_updates.is_leaf(id),
                    "local update tree keeps an unchanged leaf {id}"
                );
            }
            for id in pre_order_ids(&trees.propagation, LOCAL_ROOT, false) {
                let node = trees.propagation.node(id).unwrap();
                let unchanged = node.remote_status.is_unchanged() && node.local_status.is_unchanged();
                assert!(
                    !unchanged || !trees.propagation.is_leaf(id),
                    "propagation tree keeps an unchanged leaf {id}"
                );
            }

            // Name uniqueness among live propagation siblings.
            for id in pre_order_ids(&trees.propagation, LOCAL_ROOT, true) {
                let mut seen = HashSet::new();
                for child in trees.propagation.child_models(id) {
                    if child.is_deleted() {
                        continue;
                    }
                    assert!(
                        seen.insert(child.fs.name.to_ascii_lowercase()),
                        "siblings under {id} share the name {}",
                        child.fs.name
                    );
                }
            }

            // Acyclicity: walking up from any propagation node reaches the
            // root without revisiting.
            for id in pre_order_ids(&trees.propagation, LOCAL_ROOT, false) {
                let mut visited = HashSet::new();
                let mut current = id;
                while current != LOCAL_ROOT {
                    assert!(visited.insert(current), "cycle through node {current}");
                    current = trees.propagation.node(current).unwrap().fs.parent_id;
                }
            }
        })
        .await;
}

fn assert_parent_chains(tree: &UpdateTree<u64>, root: u64) {
    for id in pre_order_ids(tree, root, false) {
        let mut current = id;
        while current != root {
            let node = tree
                .node(current)
                .unwrap_or_else(|| panic!("node {current} lost its parent chain"));
            current = node.fs.parent_id;
        }
    }
}

// ===========================================================================
// Scenario A: rename vs delete
// ===========================================================================

#[tokio::test]
async fn scenario_a_rename_vs_delete_keeps_the_rename() {
    let fx = fixture();

    // Local renames notes.txt -> journal.txt; remote deletes it.
    fx.local
        .push(Operation::mv(FsNodeModel::file(3, 2, "journal.txt").with_size(10)));
    fx.remote
        .push(Operation::delete(FsNodeModel::file(503, 502, "notes.txt")));

    synchronize(&fx).await;

    fx.engine
        .read_trees(|trees| {
            let node = trees.propagation.node(3).expect("the renamed file survives");
            assert_eq!(node.fs.name, "journal.txt");
            assert_eq!(
                node.remote_status,
                UpdateStatus::CREATED.insert(UpdateStatus::RESTORE),
                "the deleting replica recreates it"
            );
            assert!(node.local_status.is_unchanged());
        })
        .await;
}

// ===========================================================================
// Scenario B: independent directory creations clash
// ===========================================================================

#[tokio::test]
async fn scenario_b_create_create_renames_the_loser() {
    let fx = fixture();

    // Both replicas create a folder "Docs" under home.
    fx.local
        .push(Operation::create(FsNodeModel::directory(50, 1, "Docs")));
    fx.remote
        .push(Operation::create(FsNodeModel::directory(950, 501, "Docs")));

    synchronize(&fx).await;

    fx.engine
        .read_trees(|trees| {
            // The remote creation wins and keeps the name.
            let winner = trees.propagation.node(950).expect("remote creation present");
            assert_eq!(winner.fs.name, "Docs");
            assert_eq!(winner.local_status, UpdateStatus::CREATED);

            // The local creation was renamed; the rename also applies to
            // the local replica's own copy.
            let loser = trees.propagation.node(50).expect("local creation present");
            assert_eq!(loser.fs.name, "Docs (1)");
            assert_eq!(loser.remote_status, UpdateStatus::CREATED);
            assert!(loser.local_status.contains(UpdateStatus::RENAMED));
        })
        .await;
}

// ===========================================================================
// Scenario C: deletion of a folder holding a moved-in child
// ===========================================================================

#[tokio::test]
async fn scenario_c_moved_in_child_is_moved_back_not_discarded() {
    let fx = fixture();

    // Local moves old.txt from archive into projects, then deletes
    // projects. The child's original branch (archive) is untouched.
    fx.local
        .push(Operation::mv(FsNodeModel::file(5, 2, "old.txt").with_size(20)));
    fx.local
        .push(Operation::delete(FsNodeModel::directory(2, 1, "projects")));

    synchronize(&fx).await;

    fx.engine
        .read_trees(|trees| {
            let child = trees
                .propagation
                .node(5)
                .expect("the moved-in child is preserved in the plan");
            assert_eq!(child.fs.parent_id, 4, "back at its synced parent");
            assert_eq!(child.fs.name, "old.txt");
            assert!(
                child.remote_status.contains(UpdateStatus::DELETED),
                "its deletion still propagates to the remote replica"
            );

            let dir = trees.propagation.node(2).expect("deleted directory in plan");
            assert!(dir.remote_status.contains(UpdateStatus::DELETED));
            assert!(trees.propagation.is_leaf(2), "deleted nodes have no children");
        })
        .await;
}

// ===========================================================================
// Scenario D: crossing moves form a cycle
// ===========================================================================

#[tokio::test]
async fn scenario_d_crossing_moves_are_both_undone() {
    let fx = fixture();

    // Remote moves projects under archive; local moves archive under
    // projects. Together the moves would form a cycle.
    fx.remote
        .push(Operation::mv(FsNodeModel::directory(502, 504, "projects")));
    fx.local
        .push(Operation::mv(FsNodeModel::directory(4, 2, "archive")));

    synchronize(&fx).await;

    fx.engine
        .read_trees(|trees| {
            let projects = trees.propagation.node(2).expect("projects in plan");
            assert_eq!(projects.fs.parent_id, 1, "remote move undone");
            assert_eq!(
                projects.remote_status,
                UpdateStatus::MOVED,
                "the remote replica moves it back"
            );
            assert!(projects.local_status.is_unchanged());

            let archive = trees.propagation.node(4).expect("archive in plan");
            assert_eq!(archive.fs.parent_id, 1, "local move undone");
            assert_eq!(
                archive.local_status,
                UpdateStatus::MOVED,
                "the local replica moves it back"
            );
            assert!(archive.remote_status.is_unchanged());
        })
        .await;
}

// ===========================================================================
// Edit conflicts
// ===========================================================================

#[tokio::test]
async fn edit_edit_remote_wins_and_local_content_is_backed_up() {
    let fx = fixture();

    let local_time = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    let remote_time = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();

    fx.local.push(Operation::edit(
        FsNodeModel::file(3, 2, "notes.txt")
            .with_size(11)
            .with_content_version(2)
            .with_modified_at(local_time),
    ));
    fx.remote.push(Operation::edit(
        FsNodeModel::file(503, 502, "notes.txt")
            .with_size(12)
            .with_content_version(3)
            .with_modified_at(remote_time),
    ));

    synchronize(&fx).await;

    fx.engine
        .read_trees(|trees| {
            let node = trees.propagation.node(3).unwrap();
            assert_eq!(node.fs.size, 12, "remote content wins");
            assert_eq!(node.local_status, UpdateStatus::EDITED, "local replica overwritten");
            assert!(node.remote_status.is_unchanged(), "nothing to do on remote");
            assert!(node.backup, "overwritten local content is preserved first");
        })
        .await;
}

#[tokio::test]
async fn edit_parent_delete_restores_at_the_sync_root() {
    let fx = fixture();

    // Local edits notes.txt; remote deletes its parent directory.
    fx.local.push(Operation::edit(
        FsNodeModel::file(3, 2, "notes.txt").with_size(11),
    ));
    fx.remote
        .push(Operation::delete(FsNodeModel::directory(502, 501, "projects")));

    synchronize(&fx).await;

    fx.engine
        .read_trees(|trees| {
            let node = trees.propagation.node(3).expect("the edited file survives");
            assert_eq!(node.fs.parent_id, 1, "relocated to the enclosing sync root");
            assert_eq!(node.fs.name, "notes (1).txt");
            assert_eq!(
                node.remote_status,
                UpdateStatus::CREATED.insert(UpdateStatus::RESTORE)
            );

            let dir = trees.propagation.node(2).expect("directory deletion in plan");
            assert!(dir.local_status.contains(UpdateStatus::DELETED));
        })
        .await;
}

// ===========================================================================
// Pseudo conflicts
// ===========================================================================

#[tokio::test]
async fn edit_edit_pseudo_conflict_resolves_to_nothing() {
    let fx = fixture();

    let stamp = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

    fx.local.push(Operation::edit(
        FsNodeModel::file(3, 2, "notes.txt").with_size(33).with_modified_at(stamp),
    ));
    fx.remote.push(Operation::edit(
        FsNodeModel::file(503, 502, "notes.txt").with_size(33).with_modified_at(stamp),
    ));

    synchronize(&fx).await;

    fx.engine
        .read_trees(|trees| {
            // Pseudo-conflict closure: the edited bit is gone on both
            // sides, the trees are minimal again, and the synced baseline
            // absorbed the agreed content.
            assert!(trees.local_updates.is_empty());
            assert!(trees.remote_updates.is_empty());
            assert!(trees.propagation.is_empty());
            assert_eq!(trees.synced.node(3).unwrap().fs.size, 33);
        })
        .await;
}

#[tokio::test]
async fn create_create_pseudo_links_identical_files() {
    let fx = fixture();

    let stamp = Utc.with_ymd_and_hms(2024, 6, 2, 9, 0, 0).unwrap();

    fx.local.push(Operation::create(
        FsNodeModel::file(50, 1, "shared.bin").with_size(7).with_modified_at(stamp),
    ));
    fx.remote.push(Operation::create(
        FsNodeModel::file(950, 501, "shared.bin").with_size(7).with_modified_at(stamp),
    ));

    synchronize(&fx).await;

    fx.engine
        .read_trees(|trees| {
            assert!(trees.local_updates.is_empty());
            assert!(trees.remote_updates.is_empty());
            assert!(trees.propagation.is_empty());

            let linked = trees.synced.node(50).expect("linked in the synced tree");
            assert_eq!(linked.alt_id, 950);
            assert_eq!(linked.fs.parent_id, 1);
        })
        .await;
}

#[tokio::test]
async fn delete_delete_pseudo_commits_the_agreed_deletion() {
    let fx = fixture();

    fx.local
        .push(Operation::delete(FsNodeModel::file(5, 4, "old.txt")));
    fx.remote
        .push(Operation::delete(FsNodeModel::file(505, 504, "old.txt")));

    synchronize(&fx).await;

    fx.engine
        .read_trees(|trees| {
            assert!(trees.synced.node(5).is_none(), "agreed deletion committed");
            assert!(trees.local_updates.is_empty());
            assert!(trees.remote_updates.is_empty());
            assert!(trees.propagation.is_empty());
        })
        .await;
}

// ===========================================================================
// Move conflicts
// ===========================================================================

#[tokio::test]
async fn move_move_source_remote_destination_wins() {
    let fx = fixture();

    // Remote moves old.txt into projects; local moves it under home.
    fx.remote
        .push(Operation::mv(FsNodeModel::file(505, 502, "old.txt").with_size(20)));
    fx.local
        .push(Operation::mv(FsNodeModel::file(5, 1, "old.txt").with_size(20)));

    synchronize(&fx).await;

    fx.engine
        .read_trees(|trees| {
            let node = trees.propagation.node(5).unwrap();
            assert_eq!(node.fs.parent_id, 2, "remote destination wins");
            assert_eq!(node.local_status, UpdateStatus::MOVED, "local follows");
            assert!(node.remote_status.is_unchanged());
        })
        .await;
}

// ===========================================================================
// Consolidation robustness
// ===========================================================================

#[tokio::test]
async fn replayed_changes_do_not_reapply() {
    let fx = fixture();

    let edit = Operation::edit(FsNodeModel::file(3, 2, "notes.txt").with_size(11));
    let sequence_id = fx.local.push(edit.clone());

    synchronize(&fx).await;

    // The producer replays its log after a restart; consumed items are
    // dropped and a second pass changes nothing.
    assert!(!fx.local.push_replayed(sequence_id, edit));

    let before = fx
        .engine
        .read_trees(|trees| trees.propagation.node(3).cloned())
        .await;
    synchronize(&fx).await;
    let after = fx
        .engine
        .read_trees(|trees| trees.propagation.node(3).cloned())
        .await;

    assert_eq!(before, after);
}

#[tokio::test]
async fn stale_updates_are_dropped_without_failing_the_pass() {
    let fx = fixture();

    // An edit for a node no tree knows, and a create under an unknown
    // parent: both are logged and skipped.
    fx.local
        .push(Operation::edit(FsNodeModel::file(77, 2, "ghost.txt")));
    fx.local
        .push(Operation::create(FsNodeModel::file(78, 66, "orphan.txt")));
    fx.local
        .push(Operation::edit(FsNodeModel::file(3, 2, "notes.txt").with_size(11)));

    synchronize(&fx).await;

    fx.engine
        .read_trees(|trees| {
            assert!(trees.local_updates.node(77).is_none());
            assert!(trees.local_updates.node(78).is_none());
            assert!(trees.local_updates.node(3).is_some(), "the valid edit landed");
        })
        .await;
}

#[tokio::test]
async fn repeated_synchronization_is_stable() {
    let fx = fixture();

    fx.local
        .push(Operation::mv(FsNodeModel::file(3, 2, "journal.txt").with_size(10)));
    fx.remote
        .push(Operation::delete(FsNodeModel::file(503, 502, "notes.txt")));

    synchronize(&fx).await;
    let first = fx
        .engine
        .read_trees(|trees| {
            pre_order_ids(&trees.propagation, LOCAL_ROOT, false)
                .into_iter()
                .filter_map(|id| trees.propagation.node(id).cloned())
                .collect::<Vec<_>>()
        })
        .await;

    // Nothing new arrived; re-running the pass rebuilds the same plan.
    synchronize(&fx).await;
    let second = fx
        .engine
        .read_trees(|trees| {
            pre_order_ids(&trees.propagation, LOCAL_ROOT, false)
                .into_iter()
                .filter_map(|id| trees.propagation.node(id).cloned())
                .collect::<Vec<_>>()
        })
        .await;

    assert_eq!(first, second);
}
