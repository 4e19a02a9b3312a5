//! `SQLite`-backed stores.
//!
//! Three databases live under the data directory: `signatures.db`
//! (signatures, modules, nodes), `projects.db` (projects, studies), and
//! `cosmos.db` (hosts, fingerprints, labels, scans, hooks). Source rows are
//! transient and live in an in-memory connection owned by the cosmos store.
//!
//! Connections are shared as `Arc<Mutex<Connection>>`. The engine itself is
//! single-threaded, but node handlers re-enter the stores through nested
//! adds, so no store method may hold the lock while dispatching events.

pub mod cosmos;
pub mod projects;
pub mod signatures;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use dice_core::error::{Error, Result};
use rusqlite::Connection;

pub use cosmos::CosmosStore;
pub use projects::ProjectStore;
pub use signatures::SignatureStore;

/// Opens (and creates) a database file with foreign keys enabled.
pub fn open(path: &Path) -> Result<Arc<Mutex<Connection>>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path).map_err(|e| Error::store("open", e))?;
    conn.execute_batch("PRAGMA foreign_keys = ON")
        .map_err(|e| Error::store("open", e))?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// An in-memory database for transient tables.
pub fn open_in_memory() -> Result<Arc<Mutex<Connection>>> {
    let conn = Connection::open_in_memory().map_err(|e| Error::store("open", e))?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Locks a shared connection, mapping poisoning into a store error.
pub(crate) fn lock<'a>(
    conn: &'a Arc<Mutex<Connection>>,
    op: &'static str,
) -> Result<MutexGuard<'a, Connection>> {
    conn.lock().map_err(|_| Error::Store {
        op,
        message: "connection lock poisoned".to_string(),
    })
}
