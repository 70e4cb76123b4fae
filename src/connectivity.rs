//! Connectivity monitor: a debounced online/offline signal with an
//! edge-triggered hook on offline→online transitions.
//!
//! Raw reports (from a probe loop or the host environment) settle for a
//! short delay before they become the monitor's state, so a momentary blip
//! does not trigger a wasted drain. The hook fires once per settled edge no
//! matter how many UI components observe connectivity.

use reqwest::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::PROBE_TIMEOUT;
use crate::auth::AccessTokenProvider;

/// Invoked once per settled offline→online transition.
pub type OnlineCallback = Arc<dyn Fn() + Send + Sync>;

/// Default settle delay. The contract allows 1–2 s; the exact value is an
/// implementation choice.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(1_500);

pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    /// Settled state the rest of the system reads.
    online: AtomicBool,
    /// Most recent raw report, not yet settled.
    reported: AtomicBool,
    /// Invalidates in-flight settle timers when a newer report arrives.
    generation: AtomicU64,
    settle: Duration,
    on_online: OnlineCallback,
    probing: AtomicBool,
}

impl ConnectivityMonitor {
    /// Starts offline; the first successful probe (or report) brings the
    /// terminal online and triggers an initial drain.
    pub fn new(settle: Duration, on_online: OnlineCallback) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(MonitorInner {
                online: AtomicBool::new(false),
                reported: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                settle,
                on_online,
                probing: AtomicBool::new(false),
            }),
        })
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Feed a raw connectivity observation. The observation becomes the
    /// settled state only if no newer report supersedes it within the
    /// settle delay.
    pub fn report(&self, online: bool) {
        let inner = self.inner.clone();
        inner.reported.store(online, Ordering::SeqCst);
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(async move {
            tokio::time::sleep(inner.settle).await;
            if inner.generation.load(Ordering::SeqCst) != generation {
                // A newer report took over; this one never settles.
                return;
            }
            let settled = inner.reported.load(Ordering::SeqCst);
            let was_online = inner.online.swap(settled, Ordering::SeqCst);
            if !was_online && settled {
                info!("network restored, triggering sync drain");
                (inner.on_online)();
            } else if was_online && !settled {
                info!("network offline; orders keep queueing locally");
            }
        });
    }

    /// Lightweight HEAD health check against the order service.
    pub async fn probe(client: &Client, health_url: &str, token: &str) -> bool {
        match client
            .head(health_url)
            .bearer_auth(token)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "connectivity probe failed");
                false
            }
        }
    }

    /// Poll the health endpoint every `interval` and feed the result into
    /// `report`. One loop per monitor; repeat calls are ignored.
    pub fn start_probing(
        self: &Arc<Self>,
        health_url: String,
        tokens: Arc<dyn AccessTokenProvider>,
        interval: Duration,
    ) {
        if self.inner.probing.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitor = self.clone();
        tokio::spawn(async move {
            let client = match Client::builder().timeout(PROBE_TIMEOUT).build() {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "probe client build failed, connectivity stays manual");
                    return;
                }
            };
            info!(interval_secs = interval.as_secs(), "connectivity probing started");
            loop {
                let token = tokens.access_token().await.unwrap_or_default();
                let online = Self::probe(&client, &health_url, &token).await;
                monitor.report(online);
                tokio::time::sleep(interval).await;
            }
        });
    }
}
