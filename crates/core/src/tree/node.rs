//! Node models for the three tree kinds.
//!
//! Every model embeds an [`FsNodeModel`] (identity, link, attributes) and
//! adds its tree-specific metadata: the Synced Tree links the two id
//! spaces, the Update Tree carries a divergence status, the Propagation
//! Tree carries one status per propagation direction plus a backup flag.

use serde::{Deserialize, Serialize};

use crate::models::{FsNodeModel, NodeKey, NodeType, Replica};
use crate::status::UpdateStatus;

// ---------------------------------------------------------------------------
// Model trait
// ---------------------------------------------------------------------------

/// Common surface of all tree node models.
///
/// "Metadata" is whatever the concrete tree adds on top of the shared file
/// system shape; `Update` operations replace only metadata, `Edit` replaces
/// attributes plus metadata, `Move` replaces link plus metadata.
pub trait TreeModel<Id: NodeKey>: Clone + std::fmt::Debug + Send + 'static {
    fn fs(&self) -> &FsNodeModel<Id>;

    fn fs_mut(&mut self) -> &mut FsNodeModel<Id>;

    fn copy_metadata_from(&mut self, other: &Self);

    fn metadata_eq(&self, other: &Self) -> bool;

    fn id(&self) -> Id {
        self.fs().id
    }

    fn parent_id(&self) -> Id {
        self.fs().parent_id
    }

    fn name(&self) -> &str {
        &self.fs().name
    }

    fn node_type(&self) -> NodeType {
        self.fs().node_type
    }
}

/// Models that carry the opposite replica's id.
pub trait AltIdentifiable<Id: NodeKey> {
    fn alt_id(&self) -> Id;

    fn set_alt_id(&mut self, alt_id: Id);
}

// ---------------------------------------------------------------------------
// Synced Tree
// ---------------------------------------------------------------------------

/// A Synced Tree node: the last state both replicas agreed on.
///
/// `fs.id` is the local replica's id, `alt_id` the remote replica's id.
/// This is the only place where the two id spaces are linked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncedNodeModel<Id> {
    #[serde(flatten)]
    pub fs: FsNodeModel<Id>,
    pub alt_id: Id,
}

impl<Id: NodeKey> SyncedNodeModel<Id> {
    pub fn new(fs: FsNodeModel<Id>, alt_id: Id) -> Self {
        Self { fs, alt_id }
    }

    /// The node's id in the given replica's id space.
    pub fn own_id(&self, replica: Replica) -> Id {
        match replica {
            Replica::Local => self.fs.id,
            Replica::Remote => self.alt_id,
        }
    }

    /// The node's id in the opposite replica's id space.
    pub fn other_id(&self, replica: Replica) -> Id {
        self.own_id(replica.other())
    }

    pub fn with_alt_id(mut self, alt_id: Id) -> Self {
        self.alt_id = alt_id;
        self
    }
}

impl<Id: NodeKey> TreeModel<Id> for SyncedNodeModel<Id> {
    fn fs(&self) -> &FsNodeModel<Id> {
        &self.fs
    }

    fn fs_mut(&mut self) -> &mut FsNodeModel<Id> {
        &mut self.fs
    }

    fn copy_metadata_from(&mut self, other: &Self) {
        self.alt_id = other.alt_id;
    }

    fn metadata_eq(&self, other: &Self) -> bool {
        self.alt_id == other.alt_id
    }
}

impl<Id: NodeKey> AltIdentifiable<Id> for SyncedNodeModel<Id> {
    fn alt_id(&self) -> Id {
        self.alt_id
    }

    fn set_alt_id(&mut self, alt_id: Id) {
        self.alt_id = alt_id;
    }
}

// ---------------------------------------------------------------------------
// Update Tree
// ---------------------------------------------------------------------------

/// An Update Tree node: a divergence of one replica from the Synced Tree.
///
/// A node absent from the Update Tree is implicitly unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateNodeModel<Id> {
    #[serde(flatten)]
    pub fs: FsNodeModel<Id>,
    pub status: UpdateStatus,
}

impl<Id: NodeKey> UpdateNodeModel<Id> {
    pub fn new(fs: FsNodeModel<Id>, status: UpdateStatus) -> Self {
        Self { fs, status }
    }

    /// An `Unchanged` copy of a Synced Tree node, translated into the given
    /// replica's id space.
    pub fn unchanged_from_synced(synced: &SyncedNodeModel<Id>, replica: Replica, parent_own_id: Id) -> Self {
        let mut fs = synced.fs.clone();
        fs.id = synced.own_id(replica);
        fs.parent_id = parent_own_id;

        Self::new(fs, UpdateStatus::UNCHANGED)
    }

    pub fn with_status(mut self, status: UpdateStatus) -> Self {
        self.status = status;
        self
    }
}

impl<Id: NodeKey> TreeModel<Id> for UpdateNodeModel<Id> {
    fn fs(&self) -> &FsNodeModel<Id> {
        &self.fs
    }

    fn fs_mut(&mut self) -> &mut FsNodeModel<Id> {
        &mut self.fs
    }

    fn copy_metadata_from(&mut self, other: &Self) {
        self.status = other.status;
        self.fs.size = other.fs.size;
        self.fs.modified_at = other.fs.modified_at;
    }

    fn metadata_eq(&self, other: &Self) -> bool {
        self.status == other.status
    }
}

// ---------------------------------------------------------------------------
// Propagation Tree
// ---------------------------------------------------------------------------

/// A Propagation Tree node: a merged divergence requiring action on at
/// least one replica.
///
/// `remote_status` holds the operations to apply **to the remote replica**
/// (derived from local changes); `local_status` the operations to apply to
/// the local replica (derived from remote changes). Ids are in the local
/// id space where a Synced Tree counterpart exists; `alt_id` is the remote
/// id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropagationNodeModel<Id> {
    #[serde(flatten)]
    pub fs: FsNodeModel<Id>,
    pub alt_id: Id,
    pub remote_status: UpdateStatus,
    pub local_status: UpdateStatus,
    /// The overwritten content must be preserved before propagation.
    pub backup: bool,
}

impl<Id: NodeKey> PropagationNodeModel<Id> {
    pub fn new(fs: FsNodeModel<Id>, alt_id: Id) -> Self {
        Self {
            fs,
            alt_id,
            remote_status: UpdateStatus::UNCHANGED,
            local_status: UpdateStatus::UNCHANGED,
            backup: false,
        }
    }

    pub fn with_remote_status(mut self, status: UpdateStatus) -> Self {
        self.remote_status = status;
        self
    }

    pub fn with_local_status(mut self, status: UpdateStatus) -> Self {
        self.local_status = status;
        self
    }

    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    pub fn with_alt_id(mut self, alt_id: Id) -> Self {
        self.alt_id = alt_id;
        self
    }

    /// The status describing operations toward the given replica.
    pub fn status_toward(&self, replica: Replica) -> UpdateStatus {
        match replica {
            Replica::Remote => self.remote_status,
            Replica::Local => self.local_status,
        }
    }

    /// Whether either direction still carries a change.
    pub fn is_changed(&self) -> bool {
        !self.remote_status.is_unchanged() || !self.local_status.is_unchanged()
    }

    /// Whether either direction deletes the node.
    pub fn is_deleted(&self) -> bool {
        self.remote_status.contains(UpdateStatus::DELETED)
            || self.local_status.contains(UpdateStatus::DELETED)
    }
}

impl<Id: NodeKey> TreeModel<Id> for PropagationNodeModel<Id> {
    fn fs(&self) -> &FsNodeModel<Id> {
        &self.fs
    }

    fn fs_mut(&mut self) -> &mut FsNodeModel<Id> {
        &mut self.fs
    }

    fn copy_metadata_from(&mut self, other: &Self) {
        self.alt_id = other.alt_id;
        self.remote_status = other.remote_status;
        self.local_status = other.local_status;
        self.backup = other.backup;
        self.fs.size = other.fs.size;
        self.fs.modified_at = other.fs.modified_at;
    }

    fn metadata_eq(&self, other: &Self) -> bool {
        self.alt_id == other.alt_id
            && self.remote_status == other.remote_status
            && self.local_status == other.local_status
            && self.backup == other.backup
    }
}

impl<Id: NodeKey> AltIdentifiable<Id> for PropagationNodeModel<Id> {
    fn alt_id(&self) -> Id {
        self.alt_id
    }

    fn set_alt_id(&mut self, alt_id: Id) {
        self.alt_id = alt_id;
    }
}
