//! Order materialization: turn the active cart plus customer context into
//! an immutable order, persist it locally, and attempt server submission.
//!
//! The terminal never blocks a checkout on the network. A failed or
//! unconfigured submission still commits the order locally
//! (`PlacedLocally`) and the background loop retries it; the caller gets
//! the warning exactly once so the UI can surface it.

use chrono::Utc;
use rusqlite::params;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::RemoteBackend;
use crate::cart::Cart;
use crate::config::{self, CheckoutPolicy};
use crate::db::DbState;
use crate::error::{CheckoutError, RemoteSubmissionFailed};
use crate::menu::{self, MenuCatalog};
use crate::order::{Order, OrderFlow, OrderStatus, SyncStatus};
use crate::store;
use crate::sync::is_permanent_submission_error;
use crate::tables::CustomerContext;

/// How a successful `place_order` call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementOutcome {
    /// The server acknowledged the order.
    Placed { remote_id: String },
    /// The order is committed locally; server sync is outstanding.
    PlacedLocally { warning: RemoteSubmissionFailed },
}

/// Result of a checkout: the materialized order and how far it got.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub order: Order,
    pub outcome: PlacementOutcome,
    /// True when an earlier attempt with the same client request id already
    /// created this order.
    pub deduplicated: bool,
}

/// Generate a sequential order number in format ORD-DDMMYYYY-NNNNN.
///
/// Uses `local_settings` (category='orders', key='order_counter') as a
/// persistent counter.
fn next_order_number(conn: &rusqlite::Connection) -> String {
    let today = chrono::Local::now();
    let date_display = today.format("%d%m%Y").to_string();

    let current: i64 = conn
        .query_row(
            "SELECT setting_value FROM local_settings \
             WHERE setting_category = 'orders' AND setting_key = 'order_counter'",
            [],
            |row| {
                row.get::<_, String>(0)
                    .map(|v| v.parse::<i64>().unwrap_or(0))
            },
        )
        .unwrap_or(0);

    let next = current + 1;
    let _ = conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at) \
         VALUES ('orders', 'order_counter', ?1, datetime('now')) \
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET \
            setting_value = excluded.setting_value, updated_at = excluded.updated_at",
        params![next.to_string()],
    );

    format!("ORD-{}-{:05}", date_display, next)
}

fn placement_for_existing(order: Order) -> Placement {
    let outcome = match (&order.remote_id, order.sync_status) {
        (Some(remote_id), SyncStatus::Synced) => PlacementOutcome::Placed {
            remote_id: remote_id.clone(),
        },
        _ => PlacementOutcome::PlacedLocally {
            warning: RemoteSubmissionFailed {
                order_id: order.id.clone(),
                reason: "order was already placed and is awaiting server sync".into(),
            },
        },
    };
    Placement {
        order,
        outcome,
        deduplicated: true,
    }
}

/// Materialize the cart into an order.
///
/// Preconditions (cart untouched on rejection):
/// - the cart must not be empty,
/// - the flow's checkout policy must be satisfied,
/// - every cart line must exist in the cached menu (when a menu is cached).
///
/// Afterwards the order snapshot is inserted with `sync_status = 'pending'`
/// and submission is attempted once; the call resolves to `Placed` or
/// `PlacedLocally`, never a silent drop.
pub(crate) async fn place_order<C: RemoteBackend>(
    db: &DbState,
    client: Option<&C>,
    flow: OrderFlow,
    cart: &Cart,
    customer: &CustomerContext,
    policy: &CheckoutPolicy,
    payment_method: Option<String>,
    client_request_id: Option<&str>,
) -> Result<Placement, CheckoutError> {
    if cart.is_empty() {
        return Err(CheckoutError::EmptyCart);
    }

    let missing = policy.requirements(flow).missing_fields(customer);
    if !missing.is_empty() {
        return Err(CheckoutError::MissingCustomerContext { missing });
    }

    let catalog = MenuCatalog::load(db);
    if let Err(missing) = menu::validate_items(&catalog, cart.items()) {
        warn!(
            invalid_ids = ?missing,
            "Order creation blocked: menu items not in local cache"
        );
        return Err(CheckoutError::UnknownMenuItems { missing });
    }

    // Idempotency guard: a retried checkout request returns the order the
    // first attempt created instead of inserting a duplicate.
    let client_request_id = client_request_id.map(str::trim).filter(|s| !s.is_empty());
    if let Some(req_id) = client_request_id {
        if let Some(existing) = store::find_by_client_request_id(db, req_id)
            .map_err(CheckoutError::Storage)?
        {
            info!(
                order_id = %existing.id,
                client_request_id = %req_id,
                "Order create deduplicated via client request id"
            );
            return Ok(placement_for_existing(existing));
        }
    }

    let tax_rate = config::tax_rate(db);
    let now = Utc::now().to_rfc3339();
    let order_number = {
        let conn = db
            .conn
            .lock()
            .map_err(|e| CheckoutError::Storage(e.to_string()))?;
        next_order_number(&conn)
    };

    let mut order = Order {
        id: Uuid::new_v4().to_string(),
        order_number,
        flow,
        items: cart.items().to_vec(),
        customer: customer.clone(),
        bills: cart.totals(tax_rate),
        tax_rate,
        status: OrderStatus::Pending,
        payment_method,
        payment_reference: None,
        remote_id: None,
        sync_status: SyncStatus::Pending,
        created_at: now.clone(),
        updated_at: now,
    };

    store::insert_order(db, &order, client_request_id).map_err(CheckoutError::Storage)?;
    info!(
        order_id = %order.id,
        order_number = %order.order_number,
        total = order.bills.total,
        "Order created locally"
    );

    let submission = match client {
        Some(client) => client.submit_order(&order).await,
        None => Err("POS server connection is not configured".to_string()),
    };

    let outcome = match submission {
        Ok(ack) => {
            if let Err(e) = store::mark_synced(db, &order.id, &ack.remote_id) {
                warn!(order_id = %order.id, error = %e, "Failed to record server ack");
            }
            order.remote_id = Some(ack.remote_id.clone());
            order.sync_status = SyncStatus::Synced;
            PlacementOutcome::Placed {
                remote_id: ack.remote_id,
            }
        }
        Err(reason) => {
            let permanent = is_permanent_submission_error(&reason);
            match store::record_sync_failure(db, &order.id, &reason, permanent) {
                Ok(status) => order.sync_status = status,
                Err(e) => warn!(order_id = %order.id, error = %e, "Failed to record sync failure"),
            }
            warn!(
                order_id = %order.id,
                error = %reason,
                "Order submission failed, keeping order locally"
            );
            PlacementOutcome::PlacedLocally {
                warning: RemoteSubmissionFailed {
                    order_id: order.id.clone(),
                    reason,
                },
            }
        }
    };

    Ok(Placement {
        order,
        outcome,
        deduplicated: false,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::order::SyncStatus;

    #[tokio::test]
    async fn empty_cart_is_rejected() {
        let db = test_db();
        let backend = MockBackend::default();
        let result = place_order(
            &db,
            Some(&backend),
            OrderFlow::Takeaway,
            &Cart::new(),
            &CustomerContext::default(),
            &CheckoutPolicy::default(),
            None,
            None,
        )
        .await;

        assert_eq!(result.unwrap_err(), CheckoutError::EmptyCart);
        assert!(store::list_orders(&db).expect("list").is_empty());
    }

    #[tokio::test]
    async fn policy_violations_are_rejected_per_flow() {
        let db = test_db();
        let backend = MockBackend::default();
        let cart = cart_with_chai(1);

        let err = place_order(
            &db,
            Some(&backend),
            OrderFlow::DineIn,
            &cart,
            &CustomerContext::default(),
            &CheckoutPolicy::default(),
            None,
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            CheckoutError::MissingCustomerContext {
                missing: vec!["table", "guest count"]
            }
        );

        // The same anonymous customer is fine for takeaway
        let placement = place_order(
            &db,
            Some(&backend),
            OrderFlow::Takeaway,
            &cart,
            &CustomerContext::default(),
            &CheckoutPolicy::default(),
            None,
            None,
        )
        .await
        .expect("takeaway placement");
        assert!(matches!(
            placement.outcome,
            PlacementOutcome::Placed { .. }
        ));
    }

    #[tokio::test]
    async fn successful_submission_marks_order_synced() {
        let db = test_db();
        let backend = MockBackend::default();
        let cart = cart_with_chai(2);

        let placement = place_order(
            &db,
            Some(&backend),
            OrderFlow::DineIn,
            &cart,
            &seated_customer(),
            &CheckoutPolicy::default(),
            Some("cash".into()),
            None,
        )
        .await
        .expect("placement");

        let PlacementOutcome::Placed { remote_id } = &placement.outcome else {
            panic!("expected Placed, got {:?}", placement.outcome);
        };
        assert_eq!(placement.order.remote_id.as_deref(), Some(remote_id.as_str()));
        assert!(placement.order.order_number.starts_with("ORD-"));

        let stored = store::get_order(&db, &placement.order.id)
            .expect("query")
            .expect("present");
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.remote_id.as_deref(), Some(remote_id.as_str()));
        assert_eq!(stored.bills.subtotal, 150.0);
    }

    #[tokio::test]
    async fn server_failure_falls_back_to_placed_locally() {
        let db = test_db();
        let backend = MockBackend::failing_with("POS server error (HTTP 500)");
        let cart = cart_with_chai(1);

        let placement = place_order(
            &db,
            Some(&backend),
            OrderFlow::DineIn,
            &cart,
            &seated_customer(),
            &CheckoutPolicy::default(),
            None,
            None,
        )
        .await
        .expect("placement");

        let PlacementOutcome::PlacedLocally { warning } = &placement.outcome else {
            panic!("expected PlacedLocally, got {:?}", placement.outcome);
        };
        assert_eq!(warning.order_id, placement.order.id);
        assert!(warning.reason.contains("HTTP 500"));

        // The order survived locally and stays queued for retry
        let stored = store::get_order(&db, &placement.order.id)
            .expect("query")
            .expect("present");
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert!(stored.remote_id.is_none());
        assert_eq!(store::pending_orders(&db).expect("pending").len(), 1);
    }

    #[tokio::test]
    async fn unconfigured_terminal_still_places_locally() {
        let db = test_db();
        let cart = cart_with_chai(1);

        let placement = place_order(
            &db,
            Option::<&MockBackend>::None,
            OrderFlow::Takeaway,
            &cart,
            &CustomerContext::default(),
            &CheckoutPolicy::default(),
            None,
            None,
        )
        .await
        .expect("placement");

        assert!(matches!(
            placement.outcome,
            PlacementOutcome::PlacedLocally { .. }
        ));
    }

    #[tokio::test]
    async fn snapshot_is_isolated_from_later_cart_mutations() {
        let db = test_db();
        let backend = MockBackend::default();
        let mut cart = cart_with_chai(2);

        let placement = place_order(
            &db,
            Some(&backend),
            OrderFlow::DineIn,
            &cart,
            &seated_customer(),
            &CheckoutPolicy::default(),
            None,
            None,
        )
        .await
        .expect("placement");
        let snapshot_items = placement.order.items.clone();
        let snapshot_bills = placement.order.bills;

        // Mutate the cart after materialization
        cart.increment("dish-1", "");
        cart.increment("dish-1", "");

        let stored = store::get_order(&db, &placement.order.id)
            .expect("query")
            .expect("present");
        assert_eq!(stored.items, snapshot_items);
        assert_eq!(stored.bills, snapshot_bills);
        assert_eq!(stored.items[0].quantity, 2, "snapshot keeps quantity 2");
    }

    #[tokio::test]
    async fn client_request_id_deduplicates_resubmission() {
        let db = test_db();
        let backend = MockBackend::default();
        let cart = cart_with_chai(1);

        let first = place_order(
            &db,
            Some(&backend),
            OrderFlow::Takeaway,
            &cart,
            &CustomerContext::default(),
            &CheckoutPolicy::default(),
            None,
            Some("req-1"),
        )
        .await
        .expect("first placement");
        assert!(!first.deduplicated);

        let second = place_order(
            &db,
            Some(&backend),
            OrderFlow::Takeaway,
            &cart,
            &CustomerContext::default(),
            &CheckoutPolicy::default(),
            None,
            Some("req-1"),
        )
        .await
        .expect("second placement");

        assert!(second.deduplicated);
        assert_eq!(second.order.id, first.order.id);
        assert_eq!(store::list_orders(&db).expect("list").len(), 1);
        assert_eq!(
            backend.submit_calls.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "dedup must not resubmit"
        );
    }

    #[tokio::test]
    async fn stale_cart_items_are_rejected_when_menu_is_cached() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO menu_cache (cache_key, data, version)
                 VALUES ('items', '[{\"id\": \"other\", \"name\": \"Other\", \"price\": 1.0}]', 'v1')",
                [],
            )
            .unwrap();
        }
        let backend = MockBackend::default();
        let cart = cart_with_chai(1);

        let err = place_order(
            &db,
            Some(&backend),
            OrderFlow::Takeaway,
            &cart,
            &CustomerContext::default(),
            &CheckoutPolicy::default(),
            None,
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            CheckoutError::UnknownMenuItems {
                missing: vec!["dish-1".to_string()]
            }
        );
    }
}
