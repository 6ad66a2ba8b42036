//! Domain model types shared by every tree in the reconciliation core.
//!
//! A [`FsNodeModel`] is the minimal shape common to the Synced, Update and
//! Propagation trees: identity, link (parent + name) and attributes
//! (type, content version, size, modification time). Tree-specific models
//! wrap it with their own metadata.

use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

/// Bound for node identifiers: an opaque, totally ordered, hashable key.
///
/// Each replica has its own id space; the Synced Tree links the two spaces
/// through its `alt_id` field.
pub trait NodeKey:
    Copy + Clone + Eq + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

impl<T> NodeKey for T where
    T: Copy + Clone + Eq + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

// ---------------------------------------------------------------------------
// Replica
// ---------------------------------------------------------------------------

/// One side of the synchronized pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Replica {
    /// The local filesystem replica.
    Local,
    /// The remote storage replica.
    Remote,
}

impl Replica {
    /// The opposite replica.
    pub fn other(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

// ---------------------------------------------------------------------------
// Node type
// ---------------------------------------------------------------------------

/// Kind of a file system node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    File,
    Directory,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

// ---------------------------------------------------------------------------
// File system node model
// ---------------------------------------------------------------------------

/// Minimal node shape shared by all trees.
///
/// The *link* is `(parent_id, name)`; the *attributes* are
/// `(node_type, content_version, size, modified_at)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FsNodeModel<Id> {
    pub id: Id,
    pub parent_id: Id,
    pub name: String,
    pub node_type: NodeType,
    /// Monotonic version of the node content; bumped on every edit.
    pub content_version: u64,
    /// Content size in bytes; zero for directories.
    pub size: u64,
    /// Last write time. `None` is the "unset" sentinel and is ignored in
    /// content comparisons.
    pub modified_at: Option<DateTime<Utc>>,
}

impl<Id: NodeKey> FsNodeModel<Id> {
    /// Create a directory model with empty attributes.
    pub fn directory(id: Id, parent_id: Id, name: impl Into<String>) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            node_type: NodeType::Directory,
            content_version: 0,
            size: 0,
            modified_at: None,
        }
    }

    /// Create a file model with empty attributes.
    pub fn file(id: Id, parent_id: Id, name: impl Into<String>) -> Self {
        Self {
            node_type: NodeType::File,
            ..Self::directory(id, parent_id, name)
        }
    }

    pub fn with_parent(mut self, parent_id: Id) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_content_version(mut self, version: u64) -> Self {
        self.content_version = version;
        self
    }

    pub fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    /// Copy the link (parent + name) from another model.
    pub fn copy_link_from(&mut self, other: &Self) {
        self.parent_id = other.parent_id;
        self.name = other.name.clone();
    }

    /// Copy the attributes (type, content version, size, modification time)
    /// from another model.
    pub fn copy_attributes_from(&mut self, other: &Self) {
        self.node_type = other.node_type;
        self.content_version = other.content_version;
        self.size = other.size;
        self.modified_at = other.modified_at;
    }

    /// Whether the link of this model equals the link of another.
    pub fn link_eq(&self, other: &Self) -> bool {
        self.parent_id == other.parent_id && names_eq(&self.name, &other.name)
    }

    /// Whether the attributes of this model equal those of another.
    pub fn attributes_eq(&self, other: &Self) -> bool {
        self.node_type == other.node_type
            && self.content_version == other.content_version
            && self.size == other.size
            && self.modified_at == other.modified_at
    }

    /// File content equality: equal size and equal last write time, except
    /// that an unset write time on either side is excluded from the
    /// comparison.
    pub fn content_eq(&self, other: &Self) -> bool {
        if self.size != other.size {
            return false;
        }

        match (self.modified_at, other.modified_at) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Name equality as used for sibling comparisons (case-insensitive, matching
/// the common-denominator file system semantics of the two replicas).
pub fn names_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Kind of a tree or detected-change operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    /// Metadata-only change (statuses, flags).
    Update,
    /// Attribute change (content version, size, modification time).
    Edit,
    /// Link change (rename and/or reparent).
    Move,
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Edit => write!(f, "edit"),
            Self::Move => write!(f, "move"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// An operation over a node model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation<M> {
    pub op_type: OperationType,
    pub model: M,
}

impl<M> Operation<M> {
    pub fn new(op_type: OperationType, model: M) -> Self {
        Self { op_type, model }
    }

    pub fn create(model: M) -> Self {
        Self::new(OperationType::Create, model)
    }

    pub fn update(model: M) -> Self {
        Self::new(OperationType::Update, model)
    }

    pub fn edit(model: M) -> Self {
        Self::new(OperationType::Edit, model)
    }

    pub fn mv(model: M) -> Self {
        Self::new(OperationType::Move, model)
    }

    pub fn delete(model: M) -> Self {
        Self::new(OperationType::Delete, model)
    }
}
