//! Error types for the TwinSync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that want a single
//! error type.
//!
//! Tree errors are invariant violations: they indicate a logic defect in
//! this core, abort the current pass, and require external recovery (a full
//! tree rebuild). Expected inconsistencies in detected updates never become
//! errors; they are logged and dropped by the consistency guard.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Consolidation(#[from] ConsolidationError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Tree errors
// ---------------------------------------------------------------------------

/// Structural errors reported by a tree. All of these are invariant
/// violations.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A referenced node does not exist in the tree.
    #[error("tree node {0} does not exist")]
    NodeNotFound(String),

    /// A create targeted an id that is already present.
    #[error("tree node {0} already exists")]
    NodeAlreadyExists(String),

    /// A create or move targeted a parent that does not exist.
    #[error("parent node {parent_id} of node {id} does not exist")]
    MissingParent { id: String, parent_id: String },

    /// A create or move targeted a non-directory parent.
    #[error("parent node {0} is not a directory")]
    ParentNotDirectory(String),

    /// A move would make a node its own ancestor.
    #[error("moving node {id} under {parent_id} creates a cycle")]
    CyclicMove { id: String, parent_id: String },

    /// The root node cannot be created, renamed, moved or deleted.
    #[error("operation not allowed on the tree root")]
    RootMutation,

    /// An alt id is already mapped to a different node.
    #[error("alt id {alt_id} already maps to node {id}")]
    DuplicateAltId { alt_id: String, id: String },

    /// A node expected to carry the deleted status did not, or vice versa.
    #[error("unexpected node state: {0}")]
    UnexpectedState(String),

    /// Write-through to the backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors from the durable tree / property store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying rusqlite error.
    #[error("store database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Model (de)serialization failure.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error (e.g. database file permissions).
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Consolidation errors
// ---------------------------------------------------------------------------

/// Errors from the per-replica consolidation pipeline.
#[derive(Debug, Error)]
pub enum ConsolidationError {
    /// Tree invariant violated while folding a detected update.
    #[error("consolidation tree error: {0}")]
    Tree(#[from] TreeError),

    /// A consolidated status reached an impossible combination.
    #[error("inconsistent update status for node {id}: {detail}")]
    InvalidStatus { id: String, detail: String },
}

// ---------------------------------------------------------------------------
// Reconciliation errors
// ---------------------------------------------------------------------------

/// Errors from the reconciliation / conflict-resolution stage.
#[derive(Debug, Error)]
pub enum ReconciliationError {
    /// Tree invariant violated while rewriting the trees.
    #[error("reconciliation tree error: {0}")]
    Tree(#[from] TreeError),

    /// A node referenced by a resolution step is missing from the Synced
    /// Tree even though its status implies it must exist.
    #[error("synced tree node {0} does not exist")]
    MissingSyncedNode(String),

    /// A conflict type reached a resolution pipeline that does not handle
    /// it.
    #[error("conflict type {conflict_type} is not handled by the {pipeline} pipeline")]
    UnhandledConflict {
        conflict_type: String,
        pipeline: String,
    },
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

/// Errors from the synchronization engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another synchronization pass is already running.
    #[error("synchronization already in progress")]
    AlreadyRunning,

    /// The pass was cancelled between queue items.
    #[error("synchronization cancelled")]
    Cancelled,

    /// Consolidation failed.
    #[error(transparent)]
    Consolidation(#[from] ConsolidationError),

    /// Reconciliation failed.
    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    /// Store failure outside a tree operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}
