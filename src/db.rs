//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations and the shared
//! connection handle every other module goes through. The store+queue
//! combined write in `store::create_order` relies on this being one
//! transactional database rather than two separate stores.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Result, SyncError};
use crate::queue;

/// Shared handle to the terminal's local database.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/dinewire.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// runs pending migrations, and resets any operation left `syncing` by a
/// previous process (that sync attempt is dead by definition).
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| SyncError::Storage(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("dinewire.db");
    info!("Opening database at {}", db_path.display());

    let conn = open_and_configure(&db_path)?;
    run_migrations(&conn)?;

    let recovered = queue::recover_interrupted(&conn)?;
    if recovered > 0 {
        warn!(recovered, "reset operations stuck in syncing from a previous run");
    }

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn =
        Connection::open(path).map_err(|e| SyncError::Storage(format!("sqlite open: {e}")))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| SyncError::Storage(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| SyncError::Storage(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: orders and the pending-operation queue.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- locally created orders (never deleted; doubles as order history)
        CREATE TABLE IF NOT EXISTS orders (
            local_id TEXT PRIMARY KEY,
            server_id INTEGER,
            order_number INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            order_type TEXT NOT NULL DEFAULT 'dine-in',
            table_id TEXT,
            customer_name TEXT,
            customer_phone TEXT,
            notes TEXT,
            items TEXT NOT NULL DEFAULT '[]',
            subtotal REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            synced_at TEXT
        );

        -- pending sync operations (deleted on confirmed acceptance only)
        CREATE TABLE IF NOT EXISTS pending_operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            op_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_server_id ON orders(server_id);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_pending_ops_status ON pending_operations(sync_status);
        CREATE INDEX IF NOT EXISTS idx_pending_ops_created_at ON pending_operations(created_at);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        SyncError::Storage(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: menu snapshot cache.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS menu_cache (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            cache_key TEXT UNIQUE NOT NULL,
            data TEXT NOT NULL,
            version TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        SyncError::Storage(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2");
    Ok(())
}

/// Build a fully migrated in-memory `DbState` for unit tests.
#[cfg(test)]
pub(crate) fn test_db() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations(&conn).expect("migrations");
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_migrations_are_idempotent() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        run_migrations(&conn).unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_init_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = init(dir.path()).unwrap();
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO orders (local_id, order_type, items, created_at)
                 VALUES ('ord-1', 'dine-in', '[]', '2026-08-01T10:00:00Z')",
                [],
            )
            .unwrap();
        }
        let db = init(dir.path()).unwrap();
        let conn = db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM orders", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_reopen_resets_interrupted_syncing_rows() {
        let dir = tempdir().unwrap();
        {
            let db = init(dir.path()).unwrap();
            let conn = db.conn.lock().unwrap();
            let id = queue::enqueue(
                &conn,
                queue::OperationType::CreateOrder,
                &serde_json::json!({ "local_id": "ord-1" }),
            )
            .unwrap();
            queue::mark_syncing(&conn, id).unwrap();
            // Process dies here with the submission on the wire.
        }

        let db = init(dir.path()).unwrap();
        let conn = db.conn.lock().unwrap();
        let ops = queue::list_pending(&conn).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].sync_status, queue::SyncStatus::Pending);
    }
}
