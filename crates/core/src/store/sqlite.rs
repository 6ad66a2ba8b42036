//! SQLite-backed tree and property stores.
//!
//! A single [`Database`] handle is shared by the stores of all four trees;
//! node models are persisted as JSON in a per-tree namespace.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::StoreError;
use crate::models::NodeKey;

use super::{schema, PropertyStore, TreeStore};

// ---------------------------------------------------------------------------
// Database handle
// ---------------------------------------------------------------------------

/// Main database handle wrapping a SQLite connection.
///
/// The connection is opened in WAL mode and wrapped in a `Mutex` so that
/// the handle is `Send + Sync`; every tree store created from it shares the
/// same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening tree store database");

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run all schema migrations to bring the database up to date.
    pub fn initialize(&self) -> Result<(), StoreError> {
        schema::run_migrations(&self.conn())?;
        Ok(())
    }

    /// A write-through store for the tree named `tree`.
    pub fn tree_store<Id, M>(&self, tree: &str) -> SqliteTreeStore<Id, M> {
        SqliteTreeStore {
            conn: Arc::clone(&self.conn),
            tree: tree.to_string(),
            _marker: PhantomData,
        }
    }

    /// The shared key/value property store.
    pub fn property_store(&self) -> SqlitePropertyStore {
        SqlitePropertyStore {
            conn: Arc::clone(&self.conn),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

// ---------------------------------------------------------------------------
// Tree store
// ---------------------------------------------------------------------------

/// SQLite-backed [`TreeStore`] for one named tree.
pub struct SqliteTreeStore<Id, M> {
    conn: Arc<Mutex<Connection>>,
    tree: String,
    _marker: PhantomData<fn() -> (Id, M)>,
}

impl<Id, M> SqliteTreeStore<Id, M> {
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl<Id, M> TreeStore<Id, M> for SqliteTreeStore<Id, M>
where
    Id: NodeKey,
    M: Serialize + DeserializeOwned + Send,
{
    fn load_all(&self) -> Result<Vec<M>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT model FROM tree_nodes WHERE tree = ?1")?;

        let rows = stmt.query_map(params![self.tree], |row| row.get::<_, String>(0))?;

        let mut models = Vec::new();
        for row in rows {
            models.push(serde_json::from_str(&row?)?);
        }

        debug!(tree = %self.tree, count = models.len(), "loaded tree nodes");
        Ok(models)
    }

    fn insert(&self, id: Id, model: &M) -> Result<(), StoreError> {
        let payload = serde_json::to_string(model)?;
        self.conn().execute(
            "INSERT INTO tree_nodes (tree, id, model) VALUES (?1, ?2, ?3)",
            params![self.tree, id.to_string(), payload],
        )?;
        Ok(())
    }

    fn update(&self, id: Id, model: &M) -> Result<(), StoreError> {
        let payload = serde_json::to_string(model)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO tree_nodes (tree, id, model) VALUES (?1, ?2, ?3)",
            params![self.tree, id.to_string(), payload],
        )?;
        Ok(())
    }

    fn delete(&self, id: Id) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM tree_nodes WHERE tree = ?1 AND id = ?2",
            params![self.tree, id.to_string()],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM tree_nodes WHERE tree = ?1",
            params![self.tree],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Property store
// ---------------------------------------------------------------------------

/// SQLite-backed [`PropertyStore`].
pub struct SqlitePropertyStore {
    conn: Arc<Mutex<Connection>>,
}

impl PropertyStore for SqlitePropertyStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let value = conn
            .query_row(
                "SELECT value FROM properties WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT OR REPLACE INTO properties (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}
