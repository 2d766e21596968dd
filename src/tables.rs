//! Customer context and table occupancy.
//!
//! The customer context has a lifecycle independent of the cart: it is set
//! when a table is chosen or a walk-in registers, and cleared when the order
//! is finalized. Table status changes after a placed order are fire-and-forget
//! against the server; their failure never rolls an order back.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::api::RemoteBackend;

/// The table a dine-in party occupies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub id: String,
    pub table_number: String,
}

/// Who the order is for. All fields optional; per-flow checkout policy
/// decides which are required (see `config::CheckoutPolicy`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<TableRef>,
}

impl CustomerContext {
    pub fn has_name(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.trim().is_empty())
    }

    pub fn has_phone(&self) -> bool {
        self.phone.as_deref().is_some_and(|p| !p.trim().is_empty())
    }

    pub fn has_table(&self) -> bool {
        self.table
            .as_ref()
            .is_some_and(|t| !t.id.trim().is_empty())
    }

    pub fn has_guest_count(&self) -> bool {
        self.guest_count.is_some_and(|g| g > 0)
    }
}

/// Server-side table occupancy states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Available,
    Booked,
    Occupied,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Available => "available",
            TableStatus::Booked => "booked",
            TableStatus::Occupied => "occupied",
        }
    }
}

/// Attempts per fire-and-forget table update before giving up.
const TABLE_UPDATE_ATTEMPTS: u32 = 3;
/// Pause between attempts.
const TABLE_UPDATE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Push a table status change to the server in the background. Failures are
/// logged and retried a few times; the caller never waits on the result.
pub fn spawn_table_update<C: RemoteBackend>(
    tracker: &TaskTracker,
    client: Arc<C>,
    table: TableRef,
    status: TableStatus,
) {
    tracker.spawn(async move {
        for attempt in 1..=TABLE_UPDATE_ATTEMPTS {
            match client.update_table(&table.id, status).await {
                Ok(()) => {
                    info!(
                        table_id = %table.id,
                        table_number = %table.table_number,
                        status = status.as_str(),
                        "Table status updated"
                    );
                    return;
                }
                Err(error) if attempt < TABLE_UPDATE_ATTEMPTS => {
                    warn!(
                        table_id = %table.id,
                        attempt,
                        error = %error,
                        "Table status update failed, retrying"
                    );
                    tokio::time::sleep(TABLE_UPDATE_RETRY_DELAY).await;
                }
                Err(error) => {
                    warn!(
                        table_id = %table.id,
                        status = status.as_str(),
                        error = %error,
                        "Table status update abandoned"
                    );
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_fields_do_not_count_as_present() {
        let ctx = CustomerContext {
            name: Some("   ".into()),
            phone: Some(String::new()),
            guest_count: Some(0),
            table: Some(TableRef {
                id: "  ".into(),
                table_number: "4".into(),
            }),
        };
        assert!(!ctx.has_name());
        assert!(!ctx.has_phone());
        assert!(!ctx.has_guest_count());
        assert!(!ctx.has_table());
    }

    #[test]
    fn populated_fields_count_as_present() {
        let ctx = CustomerContext {
            name: Some("Jane".into()),
            phone: Some("5550001".into()),
            guest_count: Some(2),
            table: Some(TableRef {
                id: "tbl-9".into(),
                table_number: "9".into(),
            }),
        };
        assert!(ctx.has_name());
        assert!(ctx.has_phone());
        assert!(ctx.has_guest_count());
        assert!(ctx.has_table());
    }
}
