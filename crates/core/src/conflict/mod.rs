//! Conflict classification and deterministic resolution.
//!
//! Detection is a pure function of the prepared node models and current
//! tree state; resolution rewrites models (and, for pseudo conflicts, the
//! Update and Synced Trees) so that no conflicting bit remains. Every
//! conflict class has exactly one deterministic outcome; none surfaces as
//! an error.

pub mod detector;
pub mod pseudo;
pub mod resolve;
mod structure;
mod types;

pub use structure::{
    cyclic_move_exists, name_clash_exists, nearest_ancestor_deleted, sync_root_id,
    update_tree_parent_deleted,
};
pub use types::ConflictType;
