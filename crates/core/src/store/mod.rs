//! Durable persistence for trees and engine properties.
//!
//! The core treats every tree as an in-memory navigable graph; the store is
//! a write-through mirror with immediate-commit semantics. Two
//! implementations are provided: [`MemoryTreeStore`] for tests and
//! ephemeral engines, and [`SqliteTreeStore`] backed by SQLite for
//! durability across restarts.

mod memory;
mod schema;
mod sqlite;

pub use memory::{MemoryPropertyStore, MemoryTreeStore};
pub use sqlite::{Database, SqlitePropertyStore, SqliteTreeStore};

use crate::errors::StoreError;
use crate::models::NodeKey;

/// Write-through mirror of a single tree.
///
/// Keys are the node ids rendered through `Display`, which is stable for
/// every id type the engine is instantiated with.
pub trait TreeStore<Id: NodeKey, M>: Send {
    /// Load every persisted node model, in unspecified order.
    fn load_all(&self) -> Result<Vec<M>, StoreError>;

    fn insert(&self, id: Id, model: &M) -> Result<(), StoreError>;

    fn update(&self, id: Id, model: &M) -> Result<(), StoreError>;

    fn delete(&self, id: Id) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;
}

/// Small key/value store for engine properties (queue watermarks).
pub trait PropertyStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}
