//! DinePOS - restaurant point-of-sale terminal core.
//!
//! The state-management layer a POS frontend embeds: cart building with
//! derived totals, order materialization with a local-first fallback when
//! the server is unreachable, a normalizer that absorbs the many order
//! shapes older producers emit, a SQLite mirror of orders and the menu,
//! and a background loop that retries unsynced orders and refreshes the
//! order list.
//!
//! Typical wiring:
//!
//! ```no_run
//! use std::sync::Arc;
//! use dinepos::{api::ServerClient, config, db, session::PosSession, sync};
//!
//! # async fn run() -> Result<(), String> {
//! let data_dir = std::path::Path::new("/var/lib/dinepos");
//! dinepos::logging::init(&data_dir.join("logs"));
//!
//! let db = Arc::new(db::init(data_dir)?);
//! let client = config::terminal_config(&db)
//!     .map(|cfg| ServerClient::new(&cfg))
//!     .transpose()?
//!     .map(Arc::new);
//!
//! let session = PosSession::new(db, client, config::CheckoutPolicy::default());
//! session.start_background_sync(sync::DEFAULT_POLL_INTERVAL_SECS);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cart;
pub mod checkout;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod menu;
pub mod normalize;
pub mod order;
pub mod session;
pub mod store;
pub mod sync;
pub mod tables;

pub use cart::{Cart, ItemInput, LineItem, Totals};
pub use checkout::{Placement, PlacementOutcome};
pub use error::{CartError, CheckoutError, RemoteSubmissionFailed};
pub use normalize::{normalize_order, unwrap_order_list, NormalizedItem, NormalizedOrder};
pub use order::{Order, OrderFlow, OrderStatus, SyncStatus};
pub use session::{PosEvent, PosSession};
pub use tables::{CustomerContext, TableRef, TableStatus};

/// First non-empty string among `keys`, trimmed.
pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// First numeric value among `keys`.
pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_f64()) {
            return Some(n);
        }
    }
    None
}

/// First integer value among `keys`.
pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_i64()) {
            return Some(n);
        }
    }
    None
}
