//! Pending-operation queue: the durable list of not-yet-confirmed mutations.
//!
//! Every function here takes a `&Connection` so `store::create_order` can
//! call `enqueue` inside its own transaction; callers outside a transaction
//! lock `DbState::conn` first. Rows are deleted only on confirmed server
//! acceptance; a `failed` row stays for operator attention.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// Automatic retry ceiling. The 3rd consecutive failure parks the operation
/// in `failed`; a 4th automatic attempt never happens.
pub const MAX_RETRIES: i64 = 3;

/// Closed set of queued mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    CreateOrder,
    UpdateStatus,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::CreateOrder => "create_order",
            OperationType::UpdateStatus => "update_status",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create_order" => Some(OperationType::CreateOrder),
            "update_status" => Some(OperationType::UpdateStatus),
            _ => None,
        }
    }
}

/// Queue row lifecycle: `pending -> syncing -> {deleted | pending | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Failed => "failed",
        }
    }
}

/// One queued mutation intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: i64,
    pub op_type: OperationType,
    /// Structured data sufficient to retry the operation: the `local_id` it
    /// reconciles against plus the exact remote request body.
    pub payload: Value,
    pub created_at: String,
    pub sync_status: SyncStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
}

/// Counts behind the UI badge: operations still being retried vs. ones that
/// need operator attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub failed: i64,
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// Append an operation. Runs inside the caller's transaction when invoked
/// from `store::create_order`.
pub fn enqueue(conn: &Connection, op_type: OperationType, payload: &Value) -> Result<i64> {
    let created_at = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO pending_operations (op_type, payload, created_at, sync_status)
         VALUES (?1, ?2, ?3, 'pending')",
        params![op_type.as_str(), payload.to_string(), created_at],
    )
    .map_err(|e| SyncError::Storage(format!("enqueue operation: {e}")))?;
    Ok(conn.last_insert_rowid())
}

/// Claim an operation for an in-flight submission.
pub fn mark_syncing(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE pending_operations SET sync_status = 'syncing' WHERE id = ?1",
        params![id],
    )
    .map_err(|e| SyncError::Storage(format!("mark syncing: {e}")))?;
    Ok(())
}

/// Confirmed server acceptance: the operation has served its purpose and is
/// removed. Idempotent: deleting an already-deleted row is a no-op.
pub fn mark_synced(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM pending_operations WHERE id = ?1",
        params![id],
    )
    .map_err(|e| SyncError::Storage(format!("mark synced: {e}")))?;
    Ok(())
}

/// Record a transient failure. Increments `retry_count`; the operation goes
/// back to `pending` until the ceiling, then parks in `failed`.
pub fn mark_failed(conn: &Connection, id: i64, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE pending_operations
         SET retry_count = retry_count + 1,
             last_error = ?2,
             sync_status = CASE WHEN retry_count + 1 >= ?3 THEN 'failed' ELSE 'pending' END
         WHERE id = ?1",
        params![id, error, MAX_RETRIES],
    )
    .map_err(|e| SyncError::Storage(format!("mark failed: {e}")))?;

    let status: Option<String> = conn
        .query_row(
            "SELECT sync_status FROM pending_operations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("read status after failure: {e}")))?;
    if status.as_deref() == Some("failed") {
        warn!(operation_id = id, error, "operation reached retry ceiling, needs attention");
    }
    Ok(())
}

/// Record a terminal rejection (non-auth 4xx, or 401 after a refresh
/// attempt). No retry benefit, so the operation parks in `failed` directly.
pub fn mark_rejected(conn: &Connection, id: i64, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE pending_operations
         SET sync_status = 'failed', retry_count = retry_count + 1, last_error = ?2
         WHERE id = ?1",
        params![id, error],
    )
    .map_err(|e| SyncError::Storage(format!("mark rejected: {e}")))?;
    warn!(operation_id = id, error, "operation rejected by server");
    Ok(())
}

/// Operator-driven resubmission of a `failed` operation: back to `pending`
/// with `retry_count` reset to zero.
pub fn resubmit(conn: &Connection, id: i64) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE pending_operations
             SET sync_status = 'pending', retry_count = 0, last_error = NULL
             WHERE id = ?1 AND sync_status = 'failed'",
            params![id],
        )
        .map_err(|e| SyncError::Storage(format!("resubmit operation: {e}")))?;
    Ok(changed > 0)
}

/// Startup recovery: a row found `syncing` means the process died mid-flight.
/// The attempt is dead, so the row returns to `pending`.
pub fn recover_interrupted(conn: &Connection) -> Result<usize> {
    let recovered = conn
        .execute(
            "UPDATE pending_operations SET sync_status = 'pending' WHERE sync_status = 'syncing'",
            [],
        )
        .map_err(|e| SyncError::Storage(format!("recover interrupted: {e}")))?;
    if recovered > 0 {
        debug!(recovered, "recovered interrupted operations");
    }
    Ok(recovered)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingOperation> {
    let op_type_raw: String = row.get("op_type")?;
    let status_raw: String = row.get("sync_status")?;
    let payload_raw: String = row.get("payload")?;
    Ok(PendingOperation {
        id: row.get("id")?,
        op_type: OperationType::parse(&op_type_raw).unwrap_or(OperationType::CreateOrder),
        payload: serde_json::from_str(&payload_raw).unwrap_or(Value::Null),
        created_at: row.get("created_at")?,
        sync_status: match status_raw.as_str() {
            "syncing" => SyncStatus::Syncing,
            "failed" => SyncStatus::Failed,
            _ => SyncStatus::Pending,
        },
        retry_count: row.get("retry_count")?,
        last_error: row.get("last_error")?,
    })
}

/// All operations eligible for the next drain pass, in strict enqueue order.
/// `failed` rows are excluded so one bad order never blocks the head of the
/// queue.
pub fn list_pending(conn: &Connection) -> Result<Vec<PendingOperation>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, op_type, payload, created_at, sync_status, retry_count, last_error
             FROM pending_operations
             WHERE sync_status = 'pending'
             ORDER BY created_at ASC, id ASC",
        )
        .map_err(|e| SyncError::Storage(format!("prepare list_pending: {e}")))?;
    let ops = stmt
        .query_map([], row_to_operation)
        .map_err(|e| SyncError::Storage(format!("query list_pending: {e}")))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| SyncError::Storage(format!("read pending row: {e}")))?;
    Ok(ops)
}

/// Operations parked in `failed`, oldest first, for the attention list.
pub fn list_failed(conn: &Connection) -> Result<Vec<PendingOperation>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, op_type, payload, created_at, sync_status, retry_count, last_error
             FROM pending_operations
             WHERE sync_status = 'failed'
             ORDER BY created_at ASC, id ASC",
        )
        .map_err(|e| SyncError::Storage(format!("prepare list_failed: {e}")))?;
    let ops = stmt
        .query_map([], row_to_operation)
        .map_err(|e| SyncError::Storage(format!("query list_failed: {e}")))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| SyncError::Storage(format!("read failed row: {e}")))?;
    Ok(ops)
}

pub fn get_operation(conn: &Connection, id: i64) -> Result<Option<PendingOperation>> {
    conn.query_row(
        "SELECT id, op_type, payload, created_at, sync_status, retry_count, last_error
         FROM pending_operations WHERE id = ?1",
        params![id],
        row_to_operation,
    )
    .optional()
    .map_err(|e| SyncError::Storage(format!("get operation: {e}")))
}

/// Pending (still retryable, including in-flight) vs. failed counts.
pub fn status_counts(conn: &Connection) -> Result<QueueCounts> {
    let pending: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM pending_operations WHERE sync_status IN ('pending', 'syncing')",
            [],
            |row| row.get(0),
        )
        .map_err(|e| SyncError::Storage(format!("count pending: {e}")))?;
    let failed: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM pending_operations WHERE sync_status = 'failed'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| SyncError::Storage(format!("count failed: {e}")))?;
    Ok(QueueCounts { pending, failed })
}
