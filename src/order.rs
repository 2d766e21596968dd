//! Canonical order record and status vocabulary.
//!
//! Every order-producing path in this crate emits this one shape; loose
//! upstream spellings are translated at the boundary by
//! [`OrderStatus::parse`] and never stored raw.

use serde::{Deserialize, Serialize};

use crate::cart::{LineItem, Totals};
use crate::tables::CustomerContext;

/// Canonical order lifecycle states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    InProgress,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    /// Translate a loosely-spelled status into the canonical enum. Unknown
    /// spellings fall back to `Pending`.
    pub fn parse(raw: &str) -> OrderStatus {
        match raw.trim().to_lowercase().as_str() {
            "pending" | "new" | "placed" | "received" => OrderStatus::Pending,
            "in_progress" | "inprogress" | "in-progress" | "preparing" | "confirmed"
            | "approved" | "accepted" | "cooking" => OrderStatus::InProgress,
            "ready" | "prepared" => OrderStatus::Ready,
            "completed" | "complete" | "done" | "delivered" | "served" | "paid" => {
                OrderStatus::Completed
            }
            "cancelled" | "canceled" | "declined" | "rejected" | "void" | "voided" => {
                OrderStatus::Cancelled
            }
            _ => OrderStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

/// Checkout entry points. Each flow carries its own customer requirements
/// (see `config::CheckoutPolicy`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderFlow {
    #[default]
    DineIn,
    Takeaway,
    Delivery,
}

impl OrderFlow {
    pub fn parse(raw: &str) -> OrderFlow {
        match raw.trim().to_lowercase().as_str() {
            "takeaway" | "take_away" | "take-away" | "pickup" | "walk_in" | "walk-in" => {
                OrderFlow::Takeaway
            }
            "delivery" => OrderFlow::Delivery,
            _ => OrderFlow::DineIn,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderFlow::DineIn => "dine_in",
            OrderFlow::Takeaway => "takeaway",
            OrderFlow::Delivery => "delivery",
        }
    }
}

/// Where an order's sync with the server stands. `Pending` rows are the
/// retry queue for the background loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn parse(raw: &str) -> SyncStatus {
        match raw.trim().to_lowercase().as_str() {
            "synced" => SyncStatus::Synced,
            "failed" => SyncStatus::Failed,
            _ => SyncStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

/// A materialized order. `items` and `bills` are a snapshot taken at
/// checkout; later cart mutations never reach them. Only `status` and the
/// payment confirmation fields transition after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Locally-generated identity, stable across sync.
    pub id: String,
    /// Human-readable sequential number, e.g. `ORD-06082026-00017`.
    pub order_number: String,
    pub flow: OrderFlow,
    pub items: Vec<LineItem>,
    pub customer: CustomerContext,
    pub bills: Totals,
    /// Tax rate in effect when the snapshot was taken.
    pub tax_rate: f64,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    /// Server-assigned identity, present once submission succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub sync_status: SyncStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_translates_loose_spellings() {
        assert_eq!(OrderStatus::parse("Pending"), OrderStatus::Pending);
        assert_eq!(OrderStatus::parse("preparing"), OrderStatus::InProgress);
        assert_eq!(OrderStatus::parse("confirmed"), OrderStatus::InProgress);
        assert_eq!(OrderStatus::parse("READY"), OrderStatus::Ready);
        assert_eq!(OrderStatus::parse("delivered"), OrderStatus::Completed);
        assert_eq!(OrderStatus::parse("canceled"), OrderStatus::Cancelled);
        assert_eq!(OrderStatus::parse("declined"), OrderStatus::Cancelled);
    }

    #[test]
    fn status_parse_defaults_unknown_to_pending() {
        assert_eq!(OrderStatus::parse(""), OrderStatus::Pending);
        assert_eq!(OrderStatus::parse("garbage"), OrderStatus::Pending);
    }

    #[test]
    fn status_round_trips_through_as_str() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::InProgress,
            OrderStatus::Ready,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn flow_parse_accepts_legacy_spellings() {
        assert_eq!(OrderFlow::parse("pickup"), OrderFlow::Takeaway);
        assert_eq!(OrderFlow::parse("walk-in"), OrderFlow::Takeaway);
        assert_eq!(OrderFlow::parse("delivery"), OrderFlow::Delivery);
        assert_eq!(OrderFlow::parse("dine-in"), OrderFlow::DineIn);
        assert_eq!(OrderFlow::parse(""), OrderFlow::DineIn);
    }
}
