//! Error taxonomy for the cart and checkout core.
//!
//! Storage and HTTP glue keep the plain `Result<_, String>` style used
//! everywhere else in this crate; the typed variants below exist for the
//! operations a UI has to branch on.

use thiserror::Error;

/// Rejected cart mutations. The cart is left untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CartError {
    /// Malformed line item input: missing name, or a price that is not a
    /// finite non-negative number.
    #[error("invalid line item: {0}")]
    InvalidItem(String),
}

/// Rejected `place_order` calls. The cart is left untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckoutError {
    #[error("cannot place an order with an empty cart")]
    EmptyCart,

    /// The active checkout flow requires customer details that are absent.
    #[error("missing customer details: {}", missing.join(", "))]
    MissingCustomerContext { missing: Vec<&'static str> },

    /// A previous `place_order` call has not finished yet (double-click
    /// protection).
    #[error("an order submission is already in progress")]
    CheckoutInProgress,

    /// Cart references item ids the cached menu no longer carries.
    #[error("menu items not found in local cache: {}", missing.join(", "))]
    UnknownMenuItems { missing: Vec<String> },

    /// Local persistence failed before the order could be recorded.
    #[error("order storage failed: {0}")]
    Storage(String),
}

/// Warning attached to a `PlacedLocally` outcome: the order is committed to
/// local storage but the server has not acknowledged it yet. Surfaced to the
/// caller exactly once per placement; the background loop keeps retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("order {order_id} kept locally, server sync failed: {reason}")]
pub struct RemoteSubmissionFailed {
    pub order_id: String,
    pub reason: String,
}
