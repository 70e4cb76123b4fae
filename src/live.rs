//! Live order board: the reactive state behind the kitchen queue and
//! delivery tracking views, fed by the push channel.
//!
//! Merge rules: snapshots replace the board, creations insert in
//! `created_at` order deduplicated by id, status changes update in place.
//! A terminal status (`completed`/`cancelled`) flips the order immediately
//! but keeps it rendered for a short confirmation window before removal, so
//! kitchen staff see the transition instead of a vanishing ticket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::order::OrderStatus;

/// How long a terminal order stays on the active display.
pub const REMOVAL_DELAY: Duration = Duration::from_millis(2_000);

/// Server-authoritative order as shown on the kitchen/tracking views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveOrder {
    pub id: i64,
    #[serde(default)]
    pub order_number: Option<i64>,
    pub status: OrderStatus,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub total: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriverLocation {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryInfo {
    #[serde(default)]
    pub driver_name: Option<String>,
    #[serde(default)]
    pub eta_minutes: Option<i64>,
}

struct BoardInner {
    orders: Vec<LiveOrder>,
    drivers: HashMap<i64, DriverLocation>,
    deliveries: HashMap<i64, DeliveryInfo>,
    /// Pending removal generation per order; a newer status change bumps the
    /// board generation and strands the scheduled removal.
    pending_removals: HashMap<i64, u64>,
    generation: u64,
}

#[derive(Clone)]
pub struct LiveOrderBoard {
    inner: Arc<Mutex<BoardInner>>,
    removal_delay: Duration,
    /// Bumped on every change; UI layers watch this for re-render.
    revision_tx: watch::Sender<u64>,
}

impl LiveOrderBoard {
    pub fn new() -> Self {
        Self::with_removal_delay(REMOVAL_DELAY)
    }

    /// Tests shrink the confirmation window.
    pub fn with_removal_delay(removal_delay: Duration) -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(BoardInner {
                orders: Vec::new(),
                drivers: HashMap::new(),
                deliveries: HashMap::new(),
                pending_removals: HashMap::new(),
                generation: 0,
            })),
            removal_delay,
            revision_tx,
        }
    }

    /// Observe board revisions for reactive binding.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    fn bump(&self) {
        self.revision_tx.send_modify(|rev| *rev += 1);
    }

    /// Full-state snapshot from the server (sent on each fresh connection).
    /// Replaces the board; pending removals from the old state are stranded.
    pub fn replace_all(&self, mut orders: Vec<LiveOrder>) {
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1;
            inner.pending_removals.clear();
            inner.orders = orders;
        }
        self.bump();
        // Terminal orders in a snapshot still get their confirmation window.
        let terminal: Vec<i64> = {
            let inner = self.inner.lock().unwrap();
            inner
                .orders
                .iter()
                .filter(|o| o.status.is_terminal())
                .map(|o| o.id)
                .collect()
        };
        for id in terminal {
            self.schedule_removal(id);
        }
    }

    /// Insert a newly created order in `created_at` position. A message for
    /// an already-present id is not a duplicate insert; it falls through to
    /// the update path.
    pub fn upsert(&self, order: LiveOrder) {
        let terminal = order.status.is_terminal();
        let id = order.id;
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(existing) = inner.orders.iter_mut().find(|o| o.id == id) {
                *existing = order;
            } else {
                let pos = inner
                    .orders
                    .partition_point(|o| (o.created_at, o.id) <= (order.created_at, order.id));
                inner.orders.insert(pos, order);
            }
            if !terminal {
                inner.pending_removals.remove(&id);
            }
        }
        self.bump();
        if terminal {
            self.schedule_removal(id);
        }
    }

    /// In-place status transition. Unknown ids are ignored (the snapshot on
    /// the next reconnect resynchronizes).
    pub fn apply_status(&self, order_id: i64, status: OrderStatus) {
        let known = {
            let mut inner = self.inner.lock().unwrap();
            match inner.orders.iter_mut().find(|o| o.id == order_id) {
                Some(order) => {
                    order.status = status;
                    if !status.is_terminal() {
                        // A live transition cancels any scheduled removal.
                        inner.pending_removals.remove(&order_id);
                    }
                    true
                }
                None => false,
            }
        };
        if !known {
            debug!(order_id, "status update for unknown order ignored");
            return;
        }
        self.bump();
        if status.is_terminal() {
            self.schedule_removal(order_id);
        }
    }

    /// Keep the order visible for the confirmation window, then drop it from
    /// the active list unless something non-terminal happened meanwhile.
    fn schedule_removal(&self, order_id: i64) {
        let ticket = {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1;
            let ticket = inner.generation;
            inner.pending_removals.insert(order_id, ticket);
            ticket
        };

        let board = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(board.removal_delay).await;
            let removed = {
                let mut inner = board.inner.lock().unwrap();
                if inner.pending_removals.get(&order_id) != Some(&ticket) {
                    false
                } else {
                    inner.pending_removals.remove(&order_id);
                    inner.drivers.remove(&order_id);
                    inner.deliveries.remove(&order_id);
                    let before = inner.orders.len();
                    inner.orders.retain(|o| o.id != order_id);
                    inner.orders.len() != before
                }
            };
            if removed {
                debug!(order_id, "terminal order removed from live board");
                board.bump();
            }
        });
    }

    pub fn set_driver_location(&self, order_id: i64, location: DriverLocation) {
        self.inner
            .lock()
            .unwrap()
            .drivers
            .insert(order_id, location);
        self.bump();
    }

    pub fn set_delivery_info(&self, order_id: i64, info: DeliveryInfo) {
        self.inner
            .lock()
            .unwrap()
            .deliveries
            .insert(order_id, info);
        self.bump();
    }

    /// Current active list, oldest first (kitchen ticket order).
    pub fn snapshot(&self) -> Vec<LiveOrder> {
        self.inner.lock().unwrap().orders.clone()
    }

    pub fn driver_location(&self, order_id: i64) -> Option<DriverLocation> {
        self.inner.lock().unwrap().drivers.get(&order_id).copied()
    }

    pub fn delivery_info(&self, order_id: i64) -> Option<DeliveryInfo> {
        self.inner
            .lock()
            .unwrap()
            .deliveries
            .get(&order_id)
            .cloned()
    }
}

impl Default for LiveOrderBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DELAY: Duration = Duration::from_millis(200);

    fn order(id: i64, minute: u32, status: OrderStatus) -> LiveOrder {
        LiveOrder {
            id,
            order_number: Some(id),
            status,
            order_type: Some("dine-in".into()),
            customer_name: None,
            total: Some(20.0),
            created_at: Utc.with_ymd_and_hms(2026, 8, 1, 12, minute, 0).unwrap(),
        }
    }

    fn board() -> LiveOrderBoard {
        LiveOrderBoard::with_removal_delay(DELAY)
    }

    #[tokio::test]
    async fn test_upsert_inserts_in_created_at_order() {
        let board = board();
        board.upsert(order(2, 10, OrderStatus::Pending));
        board.upsert(order(1, 5, OrderStatus::Pending));
        board.upsert(order(3, 15, OrderStatus::Pending));

        let ids: Vec<i64> = board.snapshot().iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_creation_dedupes_by_id() {
        let board = board();
        board.upsert(order(7, 10, OrderStatus::Pending));
        // Race with REST polling: the same order arrives again, newer status.
        board.upsert(order(7, 10, OrderStatus::Preparing));

        let snapshot = board.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, OrderStatus::Preparing);
    }

    #[tokio::test]
    async fn test_status_update_in_place_and_unknown_ignored() {
        let board = board();
        board.upsert(order(1, 5, OrderStatus::Pending));
        board.apply_status(1, OrderStatus::Ready);
        assert_eq!(board.snapshot()[0].status, OrderStatus::Ready);

        board.apply_status(999, OrderStatus::Ready);
        assert_eq!(board.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_status_visible_for_grace_window() {
        let board = board();
        board.upsert(order(1, 5, OrderStatus::Ready));
        board.apply_status(1, OrderStatus::Completed);

        // Logically terminal immediately, still rendered.
        let snapshot = board.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, OrderStatus::Completed);

        tokio::time::sleep(DELAY / 2).await;
        assert_eq!(board.snapshot().len(), 1);

        tokio::time::sleep(DELAY).await;
        assert!(board.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonterminal_update_cancels_scheduled_removal() {
        let board = board();
        board.upsert(order(1, 5, OrderStatus::Ready));
        board.apply_status(1, OrderStatus::Completed);
        tokio::time::sleep(DELAY / 4).await;
        // Operator reopened the ticket inside the confirmation window.
        board.apply_status(1, OrderStatus::Preparing);

        tokio::time::sleep(DELAY * 2).await;
        let snapshot = board.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, OrderStatus::Preparing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_all_resets_board() {
        let board = board();
        board.upsert(order(1, 5, OrderStatus::Pending));
        board.set_driver_location(1, DriverLocation { lat: 3.0, lng: 4.0 });

        board.replace_all(vec![order(4, 2, OrderStatus::Preparing), order(2, 1, OrderStatus::Pending)]);
        let ids: Vec<i64> = board.snapshot().iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![2, 4]);
        // Driver state for order 1 is still readable until its order's
        // removal path clears it; the snapshot itself replaced the list.
        assert_eq!(board.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_driver_and_delivery_state() {
        let board = board();
        board.upsert(order(9, 1, OrderStatus::Ready));
        board.set_driver_location(9, DriverLocation { lat: 52.1, lng: 4.9 });
        board.set_delivery_info(
            9,
            DeliveryInfo {
                driver_name: Some("Sam".into()),
                eta_minutes: Some(12),
            },
        );

        assert_eq!(
            board.driver_location(9),
            Some(DriverLocation { lat: 52.1, lng: 4.9 })
        );
        assert_eq!(board.delivery_info(9).unwrap().eta_minutes, Some(12));
    }

    #[tokio::test]
    async fn test_revision_bumps_on_change() {
        let board = board();
        let rx = board.subscribe();
        let before = *rx.borrow();
        board.upsert(order(1, 1, OrderStatus::Pending));
        board.apply_status(1, OrderStatus::Ready);
        assert!(*rx.borrow() > before);
    }
}
