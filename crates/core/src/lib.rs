//! TwinSync core library.
//!
//! The reconciliation core of a two-replica file-synchronization client:
//! detected changes from the local and remote replicas are consolidated
//! into per-replica Update Trees against the last-agreed Synced Tree, then
//! merged into a single conflict-free Propagation Tree with every conflict
//! classified and deterministically resolved.

pub mod changes;
pub mod config;
pub mod conflict;
pub mod consolidation;
pub mod engine;
pub mod errors;
pub mod models;
pub mod name;
pub mod reconcile;
pub mod status;
pub mod store;
pub mod tree;

// Re-exports for convenience.
pub use changes::{ChangeQueue, DetectedChange};
pub use config::EngineConfig;
pub use engine::{CancellationToken, SyncEngine, SyncStats};
pub use errors::CoreError;
pub use models::{FsNodeModel, NodeType, Operation, OperationType, Replica};
pub use status::UpdateStatus;
pub use store::Database;
pub use tree::{PropagationTree, SyncedTree, TreeSet, UpdateTree};
