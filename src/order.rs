//! Order domain types shared across the store, queue, sync engine, and push
//! client: the cart hand-off draft, the locally durable order record, and
//! the wire request/ack shapes for the remote order service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed status set. `pending` is the only status the terminal assigns
/// itself; everything after that arrives from the server (ack or push).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Preparing,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(OrderStatus::Pending),
            "preparing" => Some(OrderStatus::Preparing),
            "ready" => Some(OrderStatus::Ready),
            "completed" => Some(OrderStatus::Completed),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses leave the active kitchen/tracking display (after
    /// the visual-confirmation delay, see `live.rs`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

/// A selected modifier option on a line item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModifierSelection {
    pub modifier_option_id: i64,
}

/// One cart line item, captured at creation and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub menu_item_id: i64,
    pub quantity: u32,
    pub unit_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub modifiers: Vec<ModifierSelection>,
}

/// The cart builder's hand-off contract. Once `store::create_order` returns,
/// the draft is durably committed and the cart may be cleared; if it errors,
/// the caller must surface the failure instead of clearing the cart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDraft {
    pub order_type: String,
    #[serde(default)]
    pub table_id: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub total: f64,
}

/// Locally durable order record (`orders` table row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalOrder {
    pub local_id: String,
    pub server_id: Option<i64>,
    pub order_number: Option<i64>,
    pub status: OrderStatus,
    pub order_type: String,
    pub table_id: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub notes: Option<String>,
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub total: f64,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl LocalOrder {
    /// `server_id`, `order_number`, and `synced_at` are set together by the
    /// sync engine, so any one of them answers "has this order synced".
    pub fn is_synced(&self) -> bool {
        self.server_id.is_some()
    }
}

// ---------------------------------------------------------------------------
// Wire shapes (remote order service, /api/v1/orders/)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireOrderItem {
    pub menu_item_id: i64,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub modifiers: Vec<ModifierSelection>,
}

/// Request body for `POST /api/v1/orders/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub order_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub items: Vec<WireOrderItem>,
}

impl CreateOrderRequest {
    pub fn from_draft(draft: &OrderDraft) -> Self {
        CreateOrderRequest {
            order_type: draft.order_type.clone(),
            table: draft.table_id.clone(),
            customer_name: draft.customer_name.clone(),
            customer_phone: draft.customer_phone.clone(),
            notes: draft.notes.clone(),
            items: draft
                .items
                .iter()
                .map(|item| WireOrderItem {
                    menu_item_id: item.menu_item_id,
                    quantity: item.quantity,
                    notes: item.notes.clone(),
                    modifiers: item.modifiers.clone(),
                })
                .collect(),
        }
    }
}

/// Server acknowledgement of a created order: the identifiers the sync
/// engine reconciles back onto the `LocalOrder`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub id: i64,
    pub order_number: i64,
    pub status: OrderStatus,
    pub total: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            OrderStatus::Pending,
            OrderStatus::Preparing,
            OrderStatus::Ready,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(OrderStatus::parse("PREPARING"), Some(OrderStatus::Preparing));
        assert_eq!(OrderStatus::parse("refunded"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Ready.is_terminal());
    }

    #[test]
    fn test_wire_request_from_draft_strips_prices() {
        let draft = OrderDraft {
            order_type: "dine-in".into(),
            table_id: Some("12".into()),
            customer_name: None,
            customer_phone: None,
            notes: None,
            items: vec![OrderItem {
                menu_item_id: 7,
                quantity: 2,
                unit_price: 4.5,
                notes: Some("no onions".into()),
                modifiers: vec![ModifierSelection {
                    modifier_option_id: 31,
                }],
            }],
            subtotal: 9.0,
            total: 9.0,
        };

        let req = CreateOrderRequest::from_draft(&draft);
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["table"], "12");
        assert_eq!(body["items"][0]["menu_item_id"], 7);
        assert_eq!(body["items"][0]["modifiers"][0]["modifier_option_id"], 31);
        // Unit prices are local bookkeeping; the server prices from its menu.
        assert!(body["items"][0].get("unit_price").is_none());
        // Absent optionals are omitted, not null.
        assert!(body.get("customer_name").is_none());
    }

    #[test]
    fn test_ack_parses_server_response() {
        let ack: OrderAck = serde_json::from_str(
            r#"{"id": 931, "order_number": 54, "status": "preparing", "total": 23.5, "extra": true}"#,
        )
        .unwrap();
        assert_eq!(ack.id, 931);
        assert_eq!(ack.order_number, 54);
        assert_eq!(ack.status, OrderStatus::Preparing);
    }
}
