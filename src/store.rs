//! Durable local store: transactional, crash-durable order writes plus the
//! read accessors the terminal UI binds to.
//!
//! `create_order` is the cart builder's hand-off point: the order row and
//! its `create_order` queue entry commit in one transaction, so a crash can
//! never leave one without the other. Storage failures surface to the caller
//! as `SyncError::Storage`; the cart must not be cleared until this returns.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::menu;
use crate::order::{CreateOrderRequest, LocalOrder, OrderAck, OrderDraft, OrderStatus};
use crate::queue::{self, OperationType};

/// Write a new local order and atomically enqueue its sync operation.
///
/// The draft is validated against the menu snapshot first (a stale cart must
/// not produce an order the server is guaranteed to reject). Returns the
/// durably committed record.
pub fn create_order(db: &DbState, draft: &OrderDraft) -> Result<LocalOrder> {
    let mut conn = db
        .conn
        .lock()
        .map_err(|e| SyncError::Storage(format!("connection lock: {e}")))?;

    let missing = menu::validate_items(&conn, &draft.items)?;
    if !missing.is_empty() {
        warn!(missing = ?missing, "order creation blocked: items not in menu snapshot");
        return Err(SyncError::Storage(format!(
            "menu items not found in local snapshot: {}",
            missing
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let local_id = Uuid::new_v4().to_string();
    let created_at = Utc::now();
    let items_json = serde_json::to_string(&draft.items)?;
    let request = CreateOrderRequest::from_draft(draft);
    let op_payload = json!({
        "local_id": local_id,
        "request": request,
    });

    let tx = conn
        .transaction()
        .map_err(|e| SyncError::Storage(format!("begin transaction: {e}")))?;

    tx.execute(
        "INSERT INTO orders (
            local_id, status, order_type, table_id, customer_name,
            customer_phone, notes, items, subtotal, total, created_at
        ) VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            &local_id,
            &draft.order_type,
            &draft.table_id,
            &draft.customer_name,
            &draft.customer_phone,
            &draft.notes,
            &items_json,
            draft.subtotal,
            draft.total,
            created_at.to_rfc3339(),
        ],
    )
    .map_err(|e| SyncError::Storage(format!("insert order: {e}")))?;

    queue::enqueue(&tx, OperationType::CreateOrder, &op_payload)?;

    tx.commit()
        .map_err(|e| SyncError::Storage(format!("commit order: {e}")))?;

    info!(local_id = %local_id, total = draft.total, "order created and queued for sync");

    Ok(LocalOrder {
        local_id,
        server_id: None,
        order_number: None,
        status: OrderStatus::Pending,
        order_type: draft.order_type.clone(),
        table_id: draft.table_id.clone(),
        customer_name: draft.customer_name.clone(),
        customer_phone: draft.customer_phone.clone(),
        notes: draft.notes.clone(),
        items: draft.items.clone(),
        subtotal: draft.subtotal,
        total: draft.total,
        created_at,
        synced_at: None,
    })
}

/// Reconciliation patch applied by the sync engine after server acceptance.
///
/// Idempotent: re-applying the same ack keeps the original `synced_at` and
/// leaves the identifiers unchanged.
pub fn attach_server_identity(db: &DbState, local_id: &str, ack: &OrderAck) -> Result<()> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| SyncError::Storage(format!("connection lock: {e}")))?;

    let changed = conn
        .execute(
            "UPDATE orders
             SET server_id = ?2,
                 order_number = ?3,
                 status = ?4,
                 synced_at = COALESCE(synced_at, ?5)
             WHERE local_id = ?1",
            params![
                local_id,
                ack.id,
                ack.order_number,
                ack.status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| SyncError::Storage(format!("attach server identity: {e}")))?;

    if changed == 0 {
        return Err(SyncError::Storage(format!(
            "no local order with id {local_id}"
        )));
    }

    info!(
        local_id,
        server_id = ack.id,
        order_number = ack.order_number,
        "order reconciled with server identity"
    );
    Ok(())
}

/// Apply a push-delivered status transition to the local record, keyed by
/// the server id. Unknown ids are ignored (the order may predate this
/// terminal's history).
pub fn apply_status_update(db: &DbState, server_id: i64, status: OrderStatus) -> Result<()> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| SyncError::Storage(format!("connection lock: {e}")))?;
    conn.execute(
        "UPDATE orders SET status = ?2 WHERE server_id = ?1",
        params![server_id, status.as_str()],
    )
    .map_err(|e| SyncError::Storage(format!("apply status update: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalOrder> {
    let status_raw: String = row.get("status")?;
    let items_raw: String = row.get("items")?;
    let created_raw: String = row.get("created_at")?;
    let synced_raw: Option<String> = row.get("synced_at")?;
    Ok(LocalOrder {
        local_id: row.get("local_id")?,
        server_id: row.get("server_id")?,
        order_number: row.get("order_number")?,
        status: OrderStatus::parse(&status_raw).unwrap_or(OrderStatus::Pending),
        order_type: row.get("order_type")?,
        table_id: row.get("table_id")?,
        customer_name: row.get("customer_name")?,
        customer_phone: row.get("customer_phone")?,
        notes: row.get("notes")?,
        items: serde_json::from_str(&items_raw).unwrap_or_default(),
        subtotal: row.get("subtotal")?,
        total: row.get("total")?,
        created_at: parse_timestamp(&created_raw),
        synced_at: synced_raw.as_deref().map(parse_timestamp),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// All local orders, most recent first.
pub fn list_orders(db: &DbState) -> Result<Vec<LocalOrder>> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| SyncError::Storage(format!("connection lock: {e}")))?;
    let mut stmt = conn
        .prepare(
            "SELECT local_id, server_id, order_number, status, order_type, table_id,
                    customer_name, customer_phone, notes, items, subtotal, total,
                    created_at, synced_at
             FROM orders ORDER BY created_at DESC, local_id DESC",
        )
        .map_err(|e| SyncError::Storage(format!("prepare list_orders: {e}")))?;
    let orders = stmt
        .query_map([], row_to_order)
        .map_err(|e| SyncError::Storage(format!("query list_orders: {e}")))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| SyncError::Storage(format!("read order row: {e}")))?;
    Ok(orders)
}

pub fn get_order(db: &DbState, local_id: &str) -> Result<Option<LocalOrder>> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| SyncError::Storage(format!("connection lock: {e}")))?;
    conn.query_row(
        "SELECT local_id, server_id, order_number, status, order_type, table_id,
                customer_name, customer_phone, notes, items, subtotal, total,
                created_at, synced_at
         FROM orders WHERE local_id = ?1",
        params![local_id],
        row_to_order,
    )
    .optional()
    .map_err(|e| SyncError::Storage(format!("get order: {e}")))
}
