//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::StoreError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[(
    1,
    "initial schema",
    r#"
    CREATE TABLE IF NOT EXISTS tree_nodes (
        tree    TEXT NOT NULL,
        id      TEXT NOT NULL,
        model   TEXT NOT NULL,
        PRIMARY KEY (tree, id)
    );

    CREATE TABLE IF NOT EXISTS properties (
        key     TEXT PRIMARY KEY,
        value   TEXT NOT NULL
    );
    "#,
)];

/// Apply any migrations newer than the database's current version.
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (version, description, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        info!(version, description, "applying store migration");
        conn.execute_batch(sql)?;
        conn.pragma_update(None, "user_version", version)?;
    }

    debug!("store schema is up to date");
    Ok(())
}
