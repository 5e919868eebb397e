//!
//! qpoints store module
//! --------------------
//! Embedded SQLite store holding the three relations the service operates on:
//! accounts (balances plus optional platform handles), ledger entries (the
//! append-only transaction log) and credentials (hashed secrets plus
//! permission bitmasks). Table names carry a configurable prefix so several
//! deployments can share one database file.
//!
//! Key responsibilities:
//! - Idempotent schema creation at open ("create table if missing").
//! - Seeding of the reserved counterparty account (id = 1).
//! - Serialized access to the single connection, with a transaction helper so
//!   every read-then-write sequence commits as one atomic unit.
//!
//! The public API centers around the `Store` type, which is usually wrapped in
//! a thread-safe `SharedStore` (`Arc<Store>`) elsewhere in the codebase.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::AppResult;

pub mod schema;
#[cfg(test)]
mod store_tests;

/// Serialized handle to the SQLite database behind all core operations.
pub struct Store {
    conn: Mutex<Connection>,
    prefix: String,
}

/// Thread-safe shared handle used by the HTTP layer.
pub type SharedStore = Arc<Store>;

impl Store {
    /// Open (or create) the database file under the given folder and make sure
    /// the schema and the reserved account exist.
    pub fn open<P: AsRef<Path>>(folder: P, prefix: &str) -> AppResult<Self> {
        let folder = folder.as_ref();
        std::fs::create_dir_all(folder)
            .map_err(|e| crate::error::AppError::store("io", format!("failed to create store folder: {}", e)))?;
        let db_path = folder.join("qpoints.db");
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        // WAL keeps concurrent readers cheap while writes stay serialized.
        // Foreign keys stay unenforced (the bundled build defaults them on) so
        // ledger entries survive the deletion of a merged-away account.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=OFF;",
        )?;

        let store = Self { conn: Mutex::new(conn), prefix: prefix.to_string() };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(prefix: &str) -> AppResult<Self> {
        debug!("Opening in-memory SQLite database");
        let conn = Connection::open_in_memory()?;
        // Match the file-backed store: keep foreign keys unenforced so merged
        // accounts can be deleted without orphaning their ledger entries.
        conn.execute_batch("PRAGMA foreign_keys=OFF;")?;
        let store = Self { conn: Mutex::new(conn), prefix: prefix.to_string() };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> AppResult<()> {
        let conn = self.conn.lock();
        schema::init_schema(&conn, &self.prefix)
    }

    /// Render a logical table name with the configured prefix applied.
    pub fn table(&self, name: &str) -> String { format!("{}{}", self.prefix, name) }

    /// Run a read (or single-statement write) against the connection.
    pub fn with_conn<F, T>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a closure inside one immediate transaction. The transaction commits
    /// only when the closure returns Ok; any error rolls the whole unit back,
    /// leaving no partial balance mutation or orphaned ledger entry.
    pub fn with_tx<F, T>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Transaction) -> AppResult<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}
