//! Menu snapshot cache.
//!
//! The terminal keeps one denormalized menu payload in the `menu_cache`
//! table so carts can be built and validated while offline. Functions take
//! `&Connection` rather than `DbState` because `store::create_order`
//! validates drafts while already holding the connection lock (the mutex is
//! not reentrant).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, trace};

use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::order::OrderItem;

const SNAPSHOT_KEY: &str = "menu_items";

/// A cached menu payload plus its version tag.
#[derive(Debug, Clone)]
pub struct MenuSnapshot {
    pub data: Value,
    pub version: Option<String>,
    pub updated_at: String,
}

/// Upsert the menu snapshot. Skips the write when the version already
/// matches the cache (server timestamps are not version changes).
pub fn save_snapshot(conn: &Connection, data: &Value, version: &str) -> Result<bool> {
    let cached_version: Option<String> = conn
        .query_row(
            "SELECT version FROM menu_cache WHERE cache_key = ?1",
            params![SNAPSHOT_KEY],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("read cached menu version: {e}")))?
        .flatten();

    if cached_version.as_deref() == Some(version) {
        trace!(version, "menu snapshot already at latest version");
        return Ok(false);
    }

    let json_str = serde_json::to_string(data)?;
    conn.execute(
        "INSERT INTO menu_cache (cache_key, data, version, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(cache_key) DO UPDATE SET
            data = excluded.data,
            version = excluded.version,
            updated_at = excluded.updated_at",
        params![SNAPSHOT_KEY, json_str, version, Utc::now().to_rfc3339()],
    )
    .map_err(|e| SyncError::Storage(format!("upsert menu snapshot: {e}")))?;

    debug!(version, "menu snapshot updated");
    Ok(true)
}

/// Read the cached snapshot, if any.
pub fn read_snapshot(db: &DbState) -> Result<Option<MenuSnapshot>> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| SyncError::Storage(format!("connection lock: {e}")))?;
    let row: Option<(String, Option<String>, String)> = conn
        .query_row(
            "SELECT data, version, updated_at FROM menu_cache WHERE cache_key = ?1",
            params![SNAPSHOT_KEY],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("read menu snapshot: {e}")))?;

    match row {
        Some((data_raw, version, updated_at)) => {
            let data = serde_json::from_str(&data_raw)
                .map_err(|e| SyncError::Storage(format!("menu snapshot parse: {e}")))?;
            Ok(Some(MenuSnapshot {
                data,
                version,
                updated_at,
            }))
        }
        None => Ok(None),
    }
}

/// Check draft line items against the snapshot and return the ids missing
/// from it (empty means the draft is valid). An absent or empty snapshot
/// passes everything (a fresh terminal must still be able to take orders),
/// but an unreadable or unparseable one is a storage error, not a pass.
pub fn validate_items(conn: &Connection, items: &[OrderItem]) -> Result<Vec<i64>> {
    let data_raw: Option<String> = conn
        .query_row(
            "SELECT data FROM menu_cache WHERE cache_key = ?1",
            params![SNAPSHOT_KEY],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("read menu snapshot: {e}")))?;

    let Some(raw) = data_raw else {
        return Ok(Vec::new());
    };
    let data: Value = serde_json::from_str(&raw)
        .map_err(|e| SyncError::Storage(format!("menu snapshot parse: {e}")))?;

    let known: Vec<i64> = data
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|entry| entry.get("id").and_then(Value::as_i64))
                .collect()
        })
        .unwrap_or_default();

    if known.is_empty() {
        return Ok(Vec::new());
    }

    Ok(items
        .iter()
        .map(|item| item.menu_item_id)
        .filter(|id| !known.contains(id))
        .collect())
}
