//! DineWire offline-first order sync core.
//!
//! Wires the durable local store, pending-operation queue, sync engine,
//! connectivity monitor, and real-time push client into one owned [`Core`]
//! instance. The host shell (terminal UI) constructs a `Core` per terminal
//! and talks to it through the narrow operation set; tests construct
//! isolated instances the same way; there are no module-level singletons.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod auth;
pub mod backoff;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod live;
pub mod menu;
pub mod order;
pub mod push;
pub mod queue;
pub mod store;
pub mod sync;

pub use error::{Result, SyncError};
pub use order::{LocalOrder, OrderDraft, OrderStatus};

use api::{HttpOrderService, OrderService};
use auth::AccessTokenProvider;
use connectivity::ConnectivityMonitor;
use db::DbState;
use live::LiveOrderBoard;
use push::PushClient;
use sync::{SyncEngine, SyncStatusReport};

/// Initialize tracing with an env-filter (RUST_LOG), defaulting to `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// Terminal configuration for [`Core::open`].
pub struct CoreConfig {
    /// Directory holding the terminal's SQLite database.
    pub data_dir: PathBuf,
    /// Order service base URL, e.g. `https://orders.dinewire.app`.
    pub api_base_url: String,
    /// Push channel URL, e.g. `wss://orders.dinewire.app/ws/kitchen/`.
    pub push_url: String,
    /// Connectivity settle delay; `None` uses the default.
    pub settle: Option<Duration>,
    /// Safety-net drain interval; `None` disables the periodic loop.
    pub periodic_interval: Option<Duration>,
    /// Health-probe interval; `None` means the host reports connectivity
    /// itself via [`Core::report_connectivity`].
    pub probe_interval: Option<Duration>,
}

/// One terminal's sync core: the single owned instance UI layers share.
pub struct Core {
    pub db: Arc<DbState>,
    service: Arc<dyn OrderService>,
    engine: Arc<SyncEngine>,
    monitor: Arc<ConnectivityMonitor>,
    board: LiveOrderBoard,
    push: Arc<PushClient>,
    periodic_interval: Option<Duration>,
    probe_interval: Option<Duration>,
    health_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl Core {
    /// Open the durable store and assemble the engine, monitor, and push
    /// client. Nothing touches the network until [`Core::start`].
    pub fn open(config: CoreConfig, tokens: Arc<dyn AccessTokenProvider>) -> Result<Self> {
        let db = Arc::new(db::init(&config.data_dir)?);
        let service = HttpOrderService::new(&config.api_base_url, tokens.clone())?;
        let health_url = service.health_url();
        let settle = config.settle.unwrap_or(connectivity::DEFAULT_SETTLE);
        let core = Self::assemble(
            db,
            Arc::new(service),
            tokens,
            &config.push_url,
            settle,
            health_url,
        );
        Ok(Self {
            periodic_interval: config.periodic_interval,
            probe_interval: config.probe_interval,
            ..core
        })
    }

    fn assemble(
        db: Arc<DbState>,
        service: Arc<dyn OrderService>,
        tokens: Arc<dyn AccessTokenProvider>,
        push_url: &str,
        settle: Duration,
        health_url: String,
    ) -> Self {
        let engine = Arc::new(SyncEngine::new(db.clone(), service.clone()));

        // The offline→online edge triggers exactly one whole-drain drive,
        // no matter how many UI components observe connectivity.
        let drive_engine = engine.clone();
        let monitor = ConnectivityMonitor::new(
            settle,
            Arc::new(move || {
                let engine = drive_engine.clone();
                tokio::spawn(async move { engine.drive().await });
            }),
        );

        let board = LiveOrderBoard::new();
        let push = PushClient::new(push_url, tokens.clone(), board.clone(), Some(db.clone()));

        Self {
            db,
            service,
            engine,
            monitor,
            board,
            push,
            periodic_interval: None,
            probe_interval: None,
            health_url,
            tokens,
        }
    }

    /// Bring the background machinery up: push channel, health probing, and
    /// the periodic safety-net drain.
    pub fn start(&self) {
        self.push.connect();
        if let Some(interval) = self.probe_interval {
            self.monitor
                .start_probing(self.health_url.clone(), self.tokens.clone(), interval);
        }
        if let Some(interval) = self.periodic_interval {
            SyncEngine::start_periodic(self.engine.clone(), self.monitor.clone(), interval);
        }
    }

    /// Stop background loops and close the push channel.
    pub fn shutdown(&self) {
        self.engine.stop();
        self.push.disconnect();
    }

    // -----------------------------------------------------------------------
    // Cart hand-off and order access
    // -----------------------------------------------------------------------

    /// Durably commit a finished cart. Once this returns the order and its
    /// queue entry exist; when online, a drain is kicked off immediately.
    pub fn create_order(&self, draft: &OrderDraft) -> Result<LocalOrder> {
        let order = store::create_order(&self.db, draft)?;
        if self.monitor.is_online() {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.drain().await {
                    warn!(error = %e, "post-create drain failed");
                }
            });
        }
        Ok(order)
    }

    pub fn list_orders(&self) -> Result<Vec<LocalOrder>> {
        store::list_orders(&self.db)
    }

    pub fn get_order(&self, local_id: &str) -> Result<Option<LocalOrder>> {
        store::get_order(&self.db, local_id)
    }

    /// Replace the cached menu snapshot when `version` is newer. Returns
    /// whether a write happened.
    pub fn save_menu_snapshot(&self, data: &serde_json::Value, version: &str) -> Result<bool> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| SyncError::Storage(format!("connection lock: {e}")))?;
        menu::save_snapshot(&conn, data, version)
    }

    pub fn menu_snapshot(&self) -> Result<Option<menu::MenuSnapshot>> {
        menu::read_snapshot(&self.db)
    }

    // -----------------------------------------------------------------------
    // Sync state and operator actions
    // -----------------------------------------------------------------------

    pub fn sync_status(&self) -> Result<SyncStatusReport> {
        self.engine.status_report()
    }

    /// Put a `failed` operation back in the queue and, when online, drain.
    pub fn resubmit_operation(&self, operation_id: i64) -> Result<bool> {
        let resubmitted = {
            let conn = self
                .db
                .conn
                .lock()
                .map_err(|e| SyncError::Storage(format!("connection lock: {e}")))?;
            queue::resubmit(&conn, operation_id)?
        };
        if resubmitted && self.monitor.is_online() {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                let _ = engine.drain().await;
            });
        }
        Ok(resubmitted)
    }

    /// Kitchen-flow status change: a direct REST call that also updates the
    /// local record on success. Deliberately not routed through the durable
    /// queue; a failure surfaces to the caller instead of being retried.
    pub async fn update_order_status(&self, server_id: i64, status: OrderStatus) -> Result<()> {
        self.service.update_status(server_id, status).await?;
        store::apply_status_update(&self.db, server_id, status)?;
        self.board.apply_status(server_id, status);
        Ok(())
    }

    /// Host-reported connectivity observation (e.g. from the shell's own
    /// network events) when probing is disabled.
    pub fn report_connectivity(&self, online: bool) {
        self.monitor.report(online);
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    // -----------------------------------------------------------------------
    // Live state
    // -----------------------------------------------------------------------

    pub fn live_board(&self) -> &LiveOrderBoard {
        &self.board
    }

    pub fn push_client(&self) -> &Arc<PushClient> {
        &self.push
    }
}
