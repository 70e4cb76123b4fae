//! Remote order service HTTP client.
//!
//! Wraps the two REST calls the core consumes: order creation (driven by the
//! sync engine through the durable queue) and the fire-and-forget status
//! patch used by the kitchen flow. Every call carries a bearer token; a 401
//! gets exactly one token refresh and retry before failing as `Auth`.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::auth::AccessTokenProvider;
use crate::error::{Result, SyncError};
use crate::order::{CreateOrderRequest, OrderAck, OrderStatus};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the order service base URL:
/// - strip trailing slashes
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach order service at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid order service URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Access token is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Order service endpoint not found".to_string(),
        s if s >= 500 => format!("Order service error (HTTP {s})"),
        s => format!("Unexpected response from order service (HTTP {s})"),
    }
}

/// Pull the server's own error message out of a failure body when present.
fn extract_error_detail(status: StatusCode, body_text: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .or_else(|| json.get("detail"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| status_error(status));
        if let Some(details) = json.get("details").or_else(|| json.get("errors")) {
            return format!("{message} (HTTP {}): {details}", status.as_u16());
        }
        return format!("{message} (HTTP {})", status.as_u16());
    }
    if !body_text.trim().is_empty() {
        return format!(
            "{} (HTTP {}): {}",
            status_error(status),
            status.as_u16(),
            body_text.trim()
        );
    }
    format!("{} (HTTP {})", status_error(status), status.as_u16())
}

// ---------------------------------------------------------------------------
// Service trait
// ---------------------------------------------------------------------------

/// The remote calls the sync engine and kitchen flow depend on. A trait so
/// drain/retry behavior is testable against a scripted mock.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// `POST /api/v1/orders/`. `local_id` doubles as the client-supplied
    /// idempotency key; the crate still documents at-least-once semantics
    /// because server-side dedup is not a verified contract.
    async fn submit_order(&self, local_id: &str, request: &CreateOrderRequest)
        -> Result<OrderAck>;

    /// `PATCH /api/v1/orders/{id}/status/`. Direct call, not routed through
    /// the durable queue.
    async fn update_status(&self, server_id: i64, status: OrderStatus) -> Result<()>;
}

/// reqwest-backed implementation against the order service.
pub struct HttpOrderService {
    client: Client,
    base_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl HttpOrderService {
    pub fn new(base_url: &str, tokens: Arc<dyn AccessTokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Network(format!("build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL for the connectivity monitor's HEAD probe.
    pub fn health_url(&self) -> String {
        format!("{}/api/v1/health/", self.base_url)
    }

    /// Send a request with the current token; on 401, refresh once and
    /// retry once. A second 401 (or a failed refresh) is a hard `Auth`
    /// failure; the queue must not loop on a bad token.
    async fn send_authorized<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let token = self.tokens.access_token().await?;
        let resp = build(&self.client, &token)
            .send()
            .await
            .map_err(|e| SyncError::Network(friendly_error(&self.base_url, &e)))?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        debug!("401 from order service, attempting one token refresh");
        let refreshed = self
            .tokens
            .refresh()
            .await
            .map_err(|e| SyncError::Auth(format!("token refresh failed: {e}")))?;
        let retry = build(&self.client, &refreshed)
            .send()
            .await
            .map_err(|e| SyncError::Network(friendly_error(&self.base_url, &e)))?;

        if retry.status() == StatusCode::UNAUTHORIZED {
            return Err(SyncError::Auth(status_error(StatusCode::UNAUTHORIZED)));
        }
        Ok(retry)
    }

    /// Map a non-success response to the error taxonomy: 5xx is retryable
    /// `Network`, remaining 4xx is terminal `ServerRejection`.
    async fn fail_from_response(&self, resp: Response) -> SyncError {
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        if status.is_server_error() {
            SyncError::Network(extract_error_detail(status, &body_text))
        } else {
            SyncError::ServerRejection(extract_error_detail(status, &body_text))
        }
    }
}

#[async_trait]
impl OrderService for HttpOrderService {
    async fn submit_order(
        &self,
        local_id: &str,
        request: &CreateOrderRequest,
    ) -> Result<OrderAck> {
        let url = format!("{}/api/v1/orders/", self.base_url);
        let resp = self
            .send_authorized(|client, token| {
                client
                    .post(&url)
                    .bearer_auth(token)
                    .header("Idempotency-Key", local_id)
                    .json(request)
            })
            .await?;

        if !resp.status().is_success() {
            return Err(self.fail_from_response(resp).await);
        }

        let ack: OrderAck = resp
            .json()
            .await
            .map_err(|e| SyncError::Network(format!("invalid order response: {e}")))?;
        info!(local_id, server_id = ack.id, order_number = ack.order_number, "order accepted");
        Ok(ack)
    }

    async fn update_status(&self, server_id: i64, status: OrderStatus) -> Result<()> {
        let url = format!("{}/api/v1/orders/{server_id}/status/", self.base_url);
        let body = serde_json::json!({ "status": status.as_str() });
        let resp = self
            .send_authorized(|client, token| client.patch(&url).bearer_auth(token).json(&body))
            .await?;

        if !resp.status().is_success() {
            return Err(self.fail_from_response(resp).await);
        }
        Ok(())
    }
}
