//! Sync engine: drives the pending-operation queue to empty whenever
//! connectivity allows.
//!
//! One drain pass submits eligible operations sequentially in enqueue order.
//! A transient failure stops the pass (a later order must never reach the
//! server before an earlier one that is still retryable); a terminal
//! rejection parks the operation in `failed` and the pass continues, so one
//! bad order cannot block the head of the queue.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::OrderService;
use crate::backoff;
use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::order::{CreateOrderRequest, OrderAck, OrderStatus};
use crate::queue::{self, OperationType, PendingOperation};
use crate::store;

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    /// Operations confirmed by the server and removed from the queue.
    pub submitted: usize,
    /// Operations terminally rejected during this pass.
    pub rejected: usize,
    /// Operations left pending because a transient failure stopped the pass.
    pub deferred: usize,
    /// True when another drain was already in flight; this call only
    /// scheduled a rerun on that pass.
    pub skipped: bool,
}

/// Queue state surfaced to the UI badge and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusReport {
    pub pending_count: i64,
    pub failed_count: i64,
    pub is_draining: bool,
    pub last_drain: Option<String>,
}

pub struct SyncEngine {
    db: Arc<DbState>,
    service: Arc<dyn OrderService>,
    /// Periodic safety-net loop control.
    is_running: Arc<AtomicBool>,
    /// Single-flight drain guard; reconnect and timer triggers may race.
    pub(crate) draining: Arc<AtomicBool>,
    /// Set when a drain call found a pass already in flight; the holder runs
    /// one more pass before releasing so that trigger is not lost.
    rerun_requested: Arc<AtomicBool>,
    last_drain: Arc<Mutex<Option<String>>>,
}

impl SyncEngine {
    pub fn new(db: Arc<DbState>, service: Arc<dyn OrderService>) -> Self {
        Self {
            db,
            service,
            is_running: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
            rerun_requested: Arc::new(AtomicBool::new(false)),
            last_drain: Arc::new(Mutex::new(None)),
        }
    }

    /// Drain the pending queue. Concurrent calls return immediately with
    /// `skipped = true`, but their trigger is not lost: the in-flight call
    /// runs one more pass before releasing, so an order created during a
    /// slow submission is still picked up. The connectivity monitor, the
    /// post-create trigger, and the periodic loop may all fire close
    /// together.
    pub async fn drain(&self) -> Result<DrainSummary> {
        let mut total = DrainSummary::default();
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                self.rerun_requested.store(true, Ordering::SeqCst);
                debug!("drain already in flight, rerun scheduled");
                return Ok(DrainSummary {
                    skipped: true,
                    ..DrainSummary::default()
                });
            }

            let failure = loop {
                match self.drain_inner().await {
                    Ok(pass) => {
                        total.submitted += pass.submitted;
                        total.rejected += pass.rejected;
                        total.deferred = pass.deferred;
                    }
                    Err(e) => break Some(e),
                }
                if !self.rerun_requested.swap(false, Ordering::SeqCst) {
                    break None;
                }
            };

            self.draining.store(false, Ordering::SeqCst);
            if let Some(e) = failure {
                return Err(e);
            }
            // A request that arrived between the last flag check and the
            // release above re-acquires here instead of being dropped.
            if !self.rerun_requested.swap(false, Ordering::SeqCst) {
                return Ok(total);
            }
        }
    }

    async fn drain_inner(&self) -> Result<DrainSummary> {
        let ops = {
            let conn = self
                .db
                .conn
                .lock()
                .map_err(|e| SyncError::Storage(format!("connection lock: {e}")))?;
            queue::list_pending(&conn)?
        };

        let total = ops.len();
        if total == 0 {
            return Ok(DrainSummary::default());
        }
        debug!(total, "drain pass started");

        let mut summary = DrainSummary::default();
        for (index, op) in ops.iter().enumerate() {
            self.with_conn(|conn| queue::mark_syncing(conn, op.id))?;

            match self.submit_operation(op).await {
                Ok(()) => {
                    summary.submitted += 1;
                }
                Err(e) if e.is_terminal() => {
                    self.with_conn(|conn| queue::mark_rejected(conn, op.id, &e.to_string()))?;
                    summary.rejected += 1;
                }
                Err(e) => {
                    // Transient: record the failure and stop the pass so
                    // later operations are not submitted out of order.
                    self.with_conn(|conn| queue::mark_failed(conn, op.id, &e.to_string()))?;
                    summary.deferred = total - index;
                    warn!(
                        operation_id = op.id,
                        remaining = summary.deferred,
                        error = %e,
                        "transient failure, deferring rest of drain pass"
                    );
                    break;
                }
            }
        }

        if let Ok(mut guard) = self.last_drain.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
        info!(
            submitted = summary.submitted,
            rejected = summary.rejected,
            deferred = summary.deferred,
            "drain pass complete"
        );
        Ok(summary)
    }

    /// Submit one operation. Malformed payloads are terminal; retrying
    /// cannot fix them.
    async fn submit_operation(&self, op: &PendingOperation) -> Result<()> {
        match op.op_type {
            OperationType::CreateOrder => {
                let local_id = op
                    .payload
                    .get("local_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        SyncError::ServerRejection("malformed payload: missing local_id".into())
                    })?
                    .to_string();
                let request: CreateOrderRequest =
                    serde_json::from_value(op.payload["request"].clone()).map_err(|e| {
                        SyncError::ServerRejection(format!("malformed payload: {e}"))
                    })?;

                let ack = self.service.submit_order(&local_id, &request).await?;
                self.apply_create_success(op.id, &local_id, &ack)
            }
            OperationType::UpdateStatus => {
                let server_id = op
                    .payload
                    .get("server_id")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        SyncError::ServerRejection("malformed payload: missing server_id".into())
                    })?;
                let status = op
                    .payload
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(OrderStatus::parse)
                    .ok_or_else(|| {
                        SyncError::ServerRejection("malformed payload: bad status".into())
                    })?;

                self.service.update_status(server_id, status).await?;
                self.with_conn(|conn| queue::mark_synced(conn, op.id))
            }
        }
    }

    /// Reconcile a confirmed creation: patch the local order, then delete
    /// the queue entry. Idempotent end to end: a duplicated success
    /// callback re-applies the same identifiers and re-deletes nothing.
    pub(crate) fn apply_create_success(
        &self,
        op_id: i64,
        local_id: &str,
        ack: &OrderAck,
    ) -> Result<()> {
        store::attach_server_identity(&self.db, local_id, ack)?;
        self.with_conn(|conn| queue::mark_synced(conn, op_id))
    }

    /// Whole-drain retry loop for reconnection events: keeps draining with
    /// backoff between passes while transient work remains. The per-op
    /// retry ceiling guarantees this terminates.
    pub async fn drive(&self) {
        let mut attempt: u32 = 0;
        loop {
            match self.drain().await {
                Ok(summary) => {
                    if summary.skipped || summary.deferred == 0 {
                        break;
                    }
                    if summary.submitted > 0 {
                        attempt = 0;
                    }
                    let delay = backoff::reconnect_delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "drain retry scheduled");
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    warn!(error = %e, "drain pass errored, abandoning drive");
                    break;
                }
            }
        }
    }

    /// Periodic safety-net loop: every `interval`, drain when online. The
    /// event-driven triggers (post-create, reconnect edge) do the real work;
    /// this catches anything they missed.
    pub fn start_periodic(
        engine: Arc<SyncEngine>,
        monitor: Arc<ConnectivityMonitor>,
        interval: Duration,
    ) {
        if engine.is_running.swap(true, Ordering::SeqCst) {
            return;
        }

        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "periodic sync loop started");
            loop {
                tokio::time::sleep(interval).await;
                if !engine.is_running.load(Ordering::SeqCst) {
                    info!("periodic sync loop stopped");
                    break;
                }
                if !monitor.is_online() {
                    continue;
                }
                if let Err(e) = engine.drain().await {
                    warn!(error = %e, "periodic drain failed");
                }
            }
        });
    }

    /// Stop the periodic loop after its current sleep.
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }

    /// Queue counts plus engine state for the UI badge: the pending count
    /// feeds the "waiting to sync" indicator, the failed count the
    /// needs-attention one.
    pub fn status_report(&self) -> Result<SyncStatusReport> {
        let counts = self.with_conn(queue::status_counts)?;
        Ok(SyncStatusReport {
            pending_count: counts.pending,
            failed_count: counts.failed,
            is_draining: self.draining.load(Ordering::SeqCst),
            last_drain: self.last_drain.lock().ok().and_then(|g| g.clone()),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| SyncError::Storage(format!("connection lock: {e}")))?;
        f(&conn)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;
    use crate::order::{OrderDraft, OrderItem};
    use crate::queue::SyncStatus;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Scripted replies for the mock service. Once the script is exhausted,
    /// every submission succeeds with an auto-assigned id.
    pub(crate) enum MockReply {
        Ok,
        /// Succeeds after a long submission delay (timeout-length call).
        Slow,
        Network,
        Reject,
        AuthFail,
    }

    pub(crate) struct MockService {
        pub calls: Mutex<Vec<String>>,
        pub status_calls: Mutex<Vec<(i64, OrderStatus)>>,
        script: Mutex<VecDeque<MockReply>>,
        next_id: Mutex<i64>,
    }

    impl MockService {
        pub fn new(script: Vec<MockReply>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                status_calls: Mutex::new(Vec::new()),
                script: Mutex::new(script.into_iter().collect()),
                next_id: Mutex::new(100),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl OrderService for MockService {
        async fn submit_order(
            &self,
            local_id: &str,
            _request: &CreateOrderRequest,
        ) -> Result<OrderAck> {
            self.calls.lock().unwrap().push(local_id.to_string());
            let reply = self.script.lock().unwrap().pop_front();
            if matches!(reply, Some(MockReply::Slow)) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            match reply {
                Some(MockReply::Network) => Err(SyncError::Network("connection refused".into())),
                Some(MockReply::Reject) => {
                    Err(SyncError::ServerRejection("invalid items".into()))
                }
                Some(MockReply::AuthFail) => Err(SyncError::Auth("401 after refresh".into())),
                Some(MockReply::Ok) | Some(MockReply::Slow) | None => {
                    let mut id = self.next_id.lock().unwrap();
                    *id += 1;
                    Ok(OrderAck {
                        id: *id,
                        order_number: *id - 100,
                        status: OrderStatus::Pending,
                        total: 12.0,
                    })
                }
            }
        }

        async fn update_status(&self, server_id: i64, status: OrderStatus) -> Result<()> {
            self.status_calls.lock().unwrap().push((server_id, status));
            Ok(())
        }
    }

    fn draft(n: i64) -> OrderDraft {
        OrderDraft {
            order_type: "takeaway".into(),
            table_id: None,
            customer_name: Some(format!("Customer {n}")),
            customer_phone: None,
            notes: None,
            items: vec![OrderItem {
                menu_item_id: n,
                quantity: 1,
                unit_price: 10.0,
                notes: None,
                modifiers: vec![],
            }],
            subtotal: 10.0,
            total: 10.0,
        }
    }

    pub(crate) fn engine_with(
        script: Vec<MockReply>,
    ) -> (Arc<DbState>, Arc<MockService>, SyncEngine) {
        let db = Arc::new(db::test_db());
        let service = Arc::new(MockService::new(script));
        let engine = SyncEngine::new(db.clone(), service.clone());
        (db, service, engine)
    }

    #[tokio::test]
    async fn test_drain_submits_in_enqueue_order() {
        let (db, service, engine) = engine_with(vec![]);
        let first = store::create_order(&db, &draft(1)).unwrap();
        let second = store::create_order(&db, &draft(2)).unwrap();

        let summary = engine.drain().await.unwrap();
        assert_eq!(summary.submitted, 2);
        assert_eq!(summary.deferred, 0);

        let calls = service.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![first.local_id.clone(), second.local_id.clone()]);

        // Both reconciled, queue empty.
        let a = store::get_order(&db, &first.local_id).unwrap().unwrap();
        let b = store::get_order(&db, &second.local_id).unwrap().unwrap();
        assert!(a.is_synced() && b.is_synced());
        assert_ne!(a.server_id, b.server_id);
        let conn = db.conn.lock().unwrap();
        assert!(queue::list_pending(&conn).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_stops_pass_preserving_order() {
        let (db, service, engine) = engine_with(vec![MockReply::Network]);
        store::create_order(&db, &draft(1)).unwrap();
        store::create_order(&db, &draft(2)).unwrap();

        let summary = engine.drain().await.unwrap();
        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.deferred, 2);
        // The second operation was never attempted ahead of the first.
        assert_eq!(service.call_count(), 1);

        let conn = db.conn.lock().unwrap();
        let ops = queue::list_pending(&conn).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].retry_count, 1);
        assert_eq!(ops[1].retry_count, 0);
    }

    #[tokio::test]
    async fn test_rejected_operation_does_not_block_later_ones() {
        let (db, service, engine) = engine_with(vec![MockReply::Reject]);
        let bad = store::create_order(&db, &draft(1)).unwrap();
        let good = store::create_order(&db, &draft(2)).unwrap();

        let summary = engine.drain().await.unwrap();
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.submitted, 1);
        assert_eq!(service.call_count(), 2);

        assert!(!store::get_order(&db, &bad.local_id).unwrap().unwrap().is_synced());
        assert!(store::get_order(&db, &good.local_id).unwrap().unwrap().is_synced());

        let conn = db.conn.lock().unwrap();
        let failed = queue::list_failed(&conn).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("server rejected request: invalid items"));
    }

    #[tokio::test]
    async fn test_drain_submits_queued_status_updates() {
        let (db, service, engine) = engine_with(vec![]);
        {
            let conn = db.conn.lock().unwrap();
            queue::enqueue(
                &conn,
                OperationType::UpdateStatus,
                &serde_json::json!({ "server_id": 42, "status": "ready" }),
            )
            .unwrap();
        }

        let summary = engine.drain().await.unwrap();
        assert_eq!(summary.submitted, 1);
        assert_eq!(
            service.status_calls.lock().unwrap().as_slice(),
            &[(42, OrderStatus::Ready)]
        );
        let conn = db.conn.lock().unwrap();
        assert!(queue::list_pending(&conn).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_terminal() {
        let (db, service, engine) = engine_with(vec![]);
        {
            let conn = db.conn.lock().unwrap();
            queue::enqueue(
                &conn,
                OperationType::CreateOrder,
                &serde_json::json!({ "request": {} }),
            )
            .unwrap();
        }

        let summary = engine.drain().await.unwrap();
        assert_eq!(summary.rejected, 1);
        // Nothing reached the service; the payload could not be built.
        assert_eq!(service.call_count(), 0);
        let conn = db.conn.lock().unwrap();
        let failed = queue::list_failed(&conn).unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.as_deref().unwrap().contains("local_id"));
    }

    #[tokio::test]
    async fn test_auth_failure_is_terminal() {
        let (db, _service, engine) = engine_with(vec![MockReply::AuthFail]);
        store::create_order(&db, &draft(1)).unwrap();

        let summary = engine.drain().await.unwrap();
        assert_eq!(summary.rejected, 1);

        let conn = db.conn.lock().unwrap();
        assert!(queue::list_pending(&conn).unwrap().is_empty());
        assert_eq!(queue::list_failed(&conn).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling_no_fourth_attempt() {
        let (db, service, engine) = engine_with(vec![
            MockReply::Network,
            MockReply::Network,
            MockReply::Network,
        ]);
        store::create_order(&db, &draft(1)).unwrap();

        for _ in 0..3 {
            engine.drain().await.unwrap();
        }
        assert_eq!(service.call_count(), 3);
        {
            let conn = db.conn.lock().unwrap();
            let failed = queue::list_failed(&conn).unwrap();
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].retry_count, queue::MAX_RETRIES);
            assert_eq!(failed[0].sync_status, SyncStatus::Failed);
        }

        // A further drain finds nothing eligible.
        let summary = engine.drain().await.unwrap();
        assert_eq!(summary, DrainSummary::default());
        assert_eq!(service.call_count(), 3);
    }

    #[tokio::test]
    async fn test_reconciliation_is_idempotent() {
        let (db, _service, engine) = engine_with(vec![]);
        let order = store::create_order(&db, &draft(1)).unwrap();
        let op_id = {
            let conn = db.conn.lock().unwrap();
            queue::list_pending(&conn).unwrap()[0].id
        };
        let ack = OrderAck {
            id: 300,
            order_number: 12,
            status: OrderStatus::Preparing,
            total: 10.0,
        };

        engine.apply_create_success(op_id, &order.local_id, &ack).unwrap();
        // Duplicated success callback (e.g. a response replay).
        engine.apply_create_success(op_id, &order.local_id, &ack).unwrap();

        let synced = store::get_order(&db, &order.local_id).unwrap().unwrap();
        assert_eq!(synced.server_id, Some(300));
        let conn = db.conn.lock().unwrap();
        assert!(queue::list_pending(&conn).unwrap().is_empty());
        assert!(queue::list_failed(&conn).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_during_inflight_pass_is_not_lost() {
        let (db, service, engine) = engine_with(vec![MockReply::Slow]);
        let engine = Arc::new(engine);
        let first = store::create_order(&db, &draft(1)).unwrap();

        let running = engine.clone();
        let inflight = tokio::spawn(async move { running.drain().await.unwrap() });
        while !engine.draining.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        // A second order lands while the first submission is still on the
        // wire; its drain call can only skip.
        let second = store::create_order(&db, &draft(2)).unwrap();
        let summary = engine.drain().await.unwrap();
        assert!(summary.skipped);
        assert_eq!(service.call_count(), 1);

        // The in-flight pass finishes and immediately runs again, so the
        // second order does not sit pending until some later trigger.
        let total = inflight.await.unwrap();
        assert_eq!(total.submitted, 2);
        let calls = service.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![first.local_id, second.local_id]);
        let conn = db.conn.lock().unwrap();
        assert!(queue::list_pending(&conn).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_is_single_flight() {
        let (db, service, engine) = engine_with(vec![]);
        store::create_order(&db, &draft(1)).unwrap();

        engine.draining.store(true, Ordering::SeqCst);
        let summary = engine.drain().await.unwrap();
        assert!(summary.skipped);
        assert_eq!(service.call_count(), 0);

        engine.draining.store(false, Ordering::SeqCst);
        let summary = engine.drain().await.unwrap();
        assert_eq!(summary.submitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_retries_with_backoff_until_idle() {
        let (db, service, engine) = engine_with(vec![MockReply::Network, MockReply::Ok]);
        store::create_order(&db, &draft(1)).unwrap();

        let started = tokio::time::Instant::now();
        engine.drive().await;

        // First pass fails, second (after the 1s attempt-0 delay) succeeds.
        assert_eq!(service.call_count(), 2);
        assert!(started.elapsed() >= Duration::from_millis(1_000));
        let conn = db.conn.lock().unwrap();
        assert!(queue::list_pending(&conn).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_report_reflects_queue() {
        let (db, _service, engine) = engine_with(vec![MockReply::Reject]);
        store::create_order(&db, &draft(1)).unwrap();
        store::create_order(&db, &draft(2)).unwrap();

        let report = engine.status_report().unwrap();
        assert_eq!(report.pending_count, 2);
        assert_eq!(report.failed_count, 0);
        assert!(report.last_drain.is_none());

        engine.drain().await.unwrap();
        let report = engine.status_report().unwrap();
        assert_eq!(report.pending_count, 0);
        assert_eq!(report.failed_count, 1);
        assert!(report.last_drain.is_some());
    }
}
