//! Real-time push client: a reconnecting WebSocket channel delivering
//! server-authoritative state (kitchen queue, order status transitions,
//! driver locations) into the live order board.
//!
//! Independent of the sync engine but sharing its backoff policy. Channel
//! failures are never user-facing errors; they surface only through the
//! connection-state watch. Outbound messages are fire-and-forget: when the
//! channel is not open they are dropped, and durable mutations take the
//! REST queue instead.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AccessTokenProvider;
use crate::backoff;
use crate::db::DbState;
use crate::live::{DeliveryInfo, DriverLocation, LiveOrder, LiveOrderBoard};
use crate::order::OrderStatus;
use crate::store;

/// Channel lifecycle, exposed for the connection indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Inbound message taxonomy, discriminated by the required `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// Full-state snapshot, sent by the server on each fresh connection
    /// (and in reply to `request_snapshot`).
    InitialQueue { orders: Vec<LiveOrder> },
    OrderCreated { order: LiveOrder },
    OrderUpdated { order: LiveOrder },
    StatusUpdate { order_id: i64, status: OrderStatus },
    DriverLocation { order_id: i64, lat: f64, lng: f64 },
    DeliveryInfo {
        order_id: i64,
        #[serde(default)]
        driver_name: Option<String>,
        #[serde(default)]
        eta_minutes: Option<i64>,
    },
}

/// Outbound messages. `update_status` here is the non-durable kitchen
/// shortcut; the offline-guaranteed path is the REST queue.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    RequestSnapshot,
    UpdateStatus { order_id: i64, status: OrderStatus },
}

/// Parse one frame. Unknown types and malformed payloads are ignored, not
/// fatal; the channel keeps running.
pub fn parse_message(text: &str) -> Option<PushMessage> {
    match serde_json::from_str::<PushMessage>(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!(error = %e, "ignoring unrecognized push message");
            None
        }
    }
}

pub struct PushClient {
    url: String,
    tokens: Arc<dyn AccessTokenProvider>,
    board: LiveOrderBoard,
    /// When present, authoritative status transitions are also written
    /// through to the durable order history.
    db: Option<Arc<DbState>>,
    state_tx: watch::Sender<ChannelState>,
    outbound_tx: mpsc::UnboundedSender<WsMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<WsMessage>>>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl PushClient {
    pub fn new(
        url: &str,
        tokens: Arc<dyn AccessTokenProvider>,
        board: LiveOrderBoard,
        db: Option<Arc<DbState>>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            url: url.to_string(),
            tokens,
            board,
            db,
            state_tx,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Observe connection state for the UI indicator.
    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ChannelState::Connected
    }

    /// Start the connect/reconnect loop. Idempotent; the loop runs until
    /// `disconnect`.
    pub fn connect(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = self.clone();
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap()
            .take()
            .expect("outbound receiver already taken");

        tokio::spawn(async move {
            let mut attempts: u32 = 0;
            loop {
                if client.shutdown.is_cancelled() {
                    break;
                }
                client.state_tx.send_replace(ChannelState::Connecting);

                match client.run_session(&mut outbound_rx).await {
                    Ok(()) => {
                        // Clean shutdown requested.
                        break;
                    }
                    Err(opened) => {
                        if opened {
                            attempts = 0;
                        }
                    }
                }

                client.state_tx.send_replace(ChannelState::Disconnected);
                let delay = backoff::reconnect_delay(attempts);
                attempts = attempts.saturating_add(1);
                debug!(
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "push channel reconnect scheduled"
                );
                tokio::select! {
                    _ = client.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            client.state_tx.send_replace(ChannelState::Disconnected);
            info!("push client stopped");
        });
    }

    /// One connection attempt plus its read/write session.
    ///
    /// `Ok(())` means shutdown was requested; `Err(opened)` reports whether
    /// the socket opened successfully before failing, which resets the
    /// reconnect backoff.
    async fn run_session(
        &self,
        outbound_rx: &mut mpsc::UnboundedReceiver<WsMessage>,
    ) -> std::result::Result<(), bool> {
        let token = match self.tokens.access_token().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "push connect skipped: no access token");
                return Err(false);
            }
        };
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}token={}", self.url, separator, token);

        let ws_stream = match connect_async(&url).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                debug!(error = %e, "push channel connect failed");
                return Err(false);
            }
        };

        info!("push channel connected");
        self.state_tx.send_replace(ChannelState::Connected);
        let (mut write, mut read) = ws_stream.split();

        // Do not rely on the server to resend state unprompted; ask for the
        // snapshot explicitly on every fresh connection.
        let snapshot_req = serde_json::to_string(&ClientMessage::RequestSnapshot)
            .expect("static message serializes");
        if write.send(WsMessage::Text(snapshot_req)).await.is_err() {
            return Err(true);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(msg) => {
                            if write.send(msg).await.is_err() {
                                return Err(true);
                            }
                        }
                        None => return Ok(()),
                    }
                }
                inbound = read.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(msg) = parse_message(&text) {
                                self.dispatch(msg);
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            debug!("push channel closed by server");
                            return Err(true);
                        }
                        Some(Ok(_)) => {
                            // Ping/pong/binary frames need no handling here.
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "push channel read error");
                            return Err(true);
                        }
                    }
                }
            }
        }
    }

    /// Merge one inbound message into local reactive state (and, for status
    /// transitions, into the durable order history).
    fn dispatch(&self, msg: PushMessage) {
        match msg {
            PushMessage::InitialQueue { orders } => {
                debug!(count = orders.len(), "applying queue snapshot");
                self.board.replace_all(orders);
            }
            PushMessage::OrderCreated { order } | PushMessage::OrderUpdated { order } => {
                self.write_through_status(order.id, order.status);
                self.board.upsert(order);
            }
            PushMessage::StatusUpdate { order_id, status } => {
                self.write_through_status(order_id, status);
                self.board.apply_status(order_id, status);
            }
            PushMessage::DriverLocation { order_id, lat, lng } => {
                self.board
                    .set_driver_location(order_id, DriverLocation { lat, lng });
            }
            PushMessage::DeliveryInfo {
                order_id,
                driver_name,
                eta_minutes,
            } => {
                self.board.set_delivery_info(
                    order_id,
                    DeliveryInfo {
                        driver_name,
                        eta_minutes,
                    },
                );
            }
        }
    }

    fn write_through_status(&self, server_id: i64, status: OrderStatus) {
        if let Some(db) = &self.db {
            if let Err(e) = store::apply_status_update(db, server_id, status) {
                warn!(server_id, error = %e, "durable status write-through failed");
            }
        }
    }

    /// Fire-and-forget status update over the open channel. Returns false
    /// when the channel is not open and the message was dropped; durable
    /// state changes belong on the REST queue, not here.
    pub fn send_status_update(&self, order_id: i64, status: OrderStatus) -> bool {
        if !self.is_connected() {
            debug!(order_id, "push channel not open, status update dropped");
            return false;
        }
        let msg = ClientMessage::UpdateStatus { order_id, status };
        let text = serde_json::to_string(&msg).expect("static message serializes");
        self.outbound_tx.send(WsMessage::Text(text)).is_ok()
    }

    /// Stop the client. Cancels any pending reconnect timer and closes the
    /// socket if open.
    pub fn disconnect(&self) {
        self.shutdown.cancel();
    }
}
