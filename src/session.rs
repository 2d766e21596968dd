//! The session state container: one per terminal process.
//!
//! `PosSession` owns the active cart, the customer context, the checkout
//! in-flight guard, and the broadcast channel UI layers subscribe to. The
//! cart is mirrored into `local_settings` on every mutation (schema
//! versioned, so a stale malformed mirror from an older build is discarded
//! instead of resurrected) and rehydrated at startup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::api::RemoteBackend;
use crate::cart::{Cart, ItemInput, Totals};
use crate::checkout::{self, Placement, PlacementOutcome};
use crate::config::{self, CheckoutPolicy};
use crate::db::{self, DbState};
use crate::error::{CartError, CheckoutError};
use crate::menu;
use crate::order::{Order, OrderFlow, OrderStatus};
use crate::store;
use crate::sync::{self, SyncReport, SyncState};
use crate::tables::{self, CustomerContext, TableStatus};

/// Bump when the persisted cart mirror changes shape.
const CART_MIRROR_SCHEMA: u32 = 1;
const CART_MIRROR_KEY: &str = "cart";

/// Events pushed to subscribed UI layers.
#[derive(Debug, Clone, PartialEq)]
pub enum PosEvent {
    OrderPlaced {
        order_id: String,
        remote_id: String,
    },
    /// The order is committed locally; the warning says why the server
    /// does not know about it yet.
    OrderPlacedLocally {
        order_id: String,
        warning: String,
    },
    OrdersRefreshed {
        fetched: usize,
        merged: usize,
    },
    NetworkStatus {
        online: bool,
    },
    SyncRetry {
        order_id: String,
        synced: bool,
        error: Option<String>,
    },
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_local_json(db: &DbState, key: &str) -> Value {
    let Ok(conn) = db.conn.lock() else {
        return Value::Null;
    };
    match db::get_setting(&conn, config::CATEGORY_LOCAL, key) {
        Some(raw) => serde_json::from_str(&raw).unwrap_or(Value::Null),
        None => Value::Null,
    }
}

fn write_local_json(db: &DbState, key: &str, value: &Value) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::set_setting(&conn, config::CATEGORY_LOCAL, key, &value.to_string())
}

fn load_cart_mirror(db: &DbState) -> Cart {
    let raw = read_local_json(db, CART_MIRROR_KEY);
    if raw.is_null() {
        return Cart::new();
    }
    let schema = raw.get("schema").and_then(Value::as_u64).unwrap_or(0);
    if schema != CART_MIRROR_SCHEMA as u64 {
        warn!(schema, "Discarding cart mirror with unknown schema version");
        return Cart::new();
    }
    match raw.get("cart") {
        Some(cart_value) => serde_json::from_value(cart_value.clone()).unwrap_or_else(|e| {
            warn!("Discarding unparseable cart mirror: {e}");
            Cart::new()
        }),
        None => Cart::new(),
    }
}

/// Resets the checkout in-flight flag when a placement attempt ends,
/// whichever way it ends.
struct InFlightReset<'a>(&'a AtomicBool);

impl Drop for InFlightReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Process-wide POS state. One instance per terminal.
pub struct PosSession<C: RemoteBackend> {
    db: Arc<DbState>,
    client: Option<Arc<C>>,
    policy: CheckoutPolicy,
    cart: Mutex<Cart>,
    customer: Mutex<CustomerContext>,
    checkout_in_flight: AtomicBool,
    events: broadcast::Sender<PosEvent>,
    sync_state: Arc<SyncState>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl<C: RemoteBackend> PosSession<C> {
    /// Create a session, rehydrating the cart mirror from local storage.
    /// `client` is `None` on terminals that have not been connected yet;
    /// everything still works, orders just stay local until configured.
    pub fn new(db: Arc<DbState>, client: Option<Arc<C>>, policy: CheckoutPolicy) -> Self {
        let cart = load_cart_mirror(&db);
        if !cart.is_empty() {
            info!(lines = cart.len(), "Rehydrated cart from local storage");
        }
        let (events, _) = broadcast::channel(64);
        Self {
            db,
            client,
            policy,
            cart: Mutex::new(cart),
            customer: Mutex::new(CustomerContext::default()),
            checkout_in_flight: AtomicBool::new(false),
            events,
            sync_state: Arc::new(SyncState::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PosEvent> {
        self.events.subscribe()
    }

    pub fn db(&self) -> &DbState {
        &self.db
    }

    // -- Cart ---------------------------------------------------------------

    fn persist_cart(&self, cart: &Cart) {
        let mirror = serde_json::json!({
            "schema": CART_MIRROR_SCHEMA,
            "cart": cart,
        });
        if let Err(e) = write_local_json(&self.db, CART_MIRROR_KEY, &mirror) {
            warn!("Failed to persist cart mirror: {e}");
        }
    }

    /// Merge `quantity` units of a selection into the cart and return the
    /// refreshed totals.
    pub fn add_to_cart(&self, input: &ItemInput, quantity: u32) -> Result<Totals, CartError> {
        let mut cart = lock_unpoisoned(&self.cart);
        cart.upsert(input, quantity)?;
        self.persist_cart(&cart);
        Ok(cart.totals(config::tax_rate(&self.db)))
    }

    pub fn increment(&self, id: &str, customizations: &str) -> bool {
        let mut cart = lock_unpoisoned(&self.cart);
        let changed = cart.increment(id, customizations);
        if changed {
            self.persist_cart(&cart);
        }
        changed
    }

    pub fn decrement(&self, id: &str, customizations: &str) -> bool {
        let mut cart = lock_unpoisoned(&self.cart);
        let changed = cart.decrement(id, customizations);
        if changed {
            self.persist_cart(&cart);
        }
        changed
    }

    pub fn set_quantity(&self, id: &str, customizations: &str, quantity: u32) {
        let mut cart = lock_unpoisoned(&self.cart);
        cart.set_quantity(id, customizations, quantity);
        self.persist_cart(&cart);
    }

    pub fn remove_from_cart(&self, id: &str, customizations: &str) {
        let mut cart = lock_unpoisoned(&self.cart);
        cart.remove(id, customizations);
        self.persist_cart(&cart);
    }

    pub fn clear_cart(&self) {
        let mut cart = lock_unpoisoned(&self.cart);
        cart.clear();
        self.persist_cart(&cart);
    }

    pub fn cart_items(&self) -> Vec<crate::cart::LineItem> {
        lock_unpoisoned(&self.cart).items().to_vec()
    }

    /// Totals for the current cart at the configured tax rate.
    pub fn totals(&self) -> Totals {
        lock_unpoisoned(&self.cart).totals(config::tax_rate(&self.db))
    }

    // -- Customer context ---------------------------------------------------

    pub fn set_customer(&self, customer: CustomerContext) {
        *lock_unpoisoned(&self.customer) = customer;
    }

    pub fn customer(&self) -> CustomerContext {
        lock_unpoisoned(&self.customer).clone()
    }

    pub fn clear_customer(&self) {
        *lock_unpoisoned(&self.customer) = CustomerContext::default();
    }

    // -- Checkout -----------------------------------------------------------

    /// Materialize the cart into an order (see `checkout::place_order`).
    ///
    /// Guarded against overlapping calls: a double-click submits once, the
    /// second call gets `CheckoutInProgress` and no state changes. On
    /// success the cart is cleared, the customer context resets, the
    /// table (if any) is marked occupied fire-and-forget, and one event is
    /// emitted.
    pub async fn place_order(
        &self,
        flow: OrderFlow,
        payment_method: Option<String>,
        client_request_id: Option<&str>,
    ) -> Result<Placement, CheckoutError> {
        if self
            .checkout_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CheckoutError::CheckoutInProgress);
        }
        let _reset = InFlightReset(&self.checkout_in_flight);

        let cart_snapshot = lock_unpoisoned(&self.cart).clone();
        let customer_snapshot = self.customer();

        let placement = checkout::place_order(
            &self.db,
            self.client.as_deref(),
            flow,
            &cart_snapshot,
            &customer_snapshot,
            &self.policy,
            payment_method,
            client_request_id,
        )
        .await?;

        if !placement.deduplicated {
            self.clear_cart();
            self.clear_customer();

            if let (Some(client), Some(table)) =
                (self.client.clone(), customer_snapshot.table.clone())
            {
                tables::spawn_table_update(&self.tracker, client, table, TableStatus::Occupied);
            }

            let event = match &placement.outcome {
                PlacementOutcome::Placed { remote_id } => PosEvent::OrderPlaced {
                    order_id: placement.order.id.clone(),
                    remote_id: remote_id.clone(),
                },
                PlacementOutcome::PlacedLocally { warning } => PosEvent::OrderPlacedLocally {
                    order_id: placement.order.id.clone(),
                    warning: warning.reason.clone(),
                },
            };
            let _ = self.events.send(event);
        }

        Ok(placement)
    }

    // -- Orders -------------------------------------------------------------

    pub fn orders(&self) -> Result<Vec<Order>, String> {
        store::list_orders(&self.db)
    }

    pub fn order(&self, order_id: &str) -> Result<Option<Order>, String> {
        store::get_order(&self.db, order_id)
    }

    pub fn update_order_status(
        &self,
        order_id: &str,
        raw_status: &str,
    ) -> Result<OrderStatus, String> {
        store::update_status(&self.db, order_id, raw_status)
    }

    pub fn record_payment(
        &self,
        order_id: &str,
        method: &str,
        reference: Option<&str>,
    ) -> Result<(), String> {
        store::record_payment(&self.db, order_id, method, reference)
    }

    // -- Menu ---------------------------------------------------------------

    /// Refresh the menu cache from the server.
    pub async fn sync_menu(&self) -> Result<Value, String> {
        let client = self
            .client
            .as_ref()
            .ok_or("Terminal not configured")?;
        menu::sync_menu(&self.db, client.as_ref()).await
    }

    // -- Background sync ----------------------------------------------------

    /// Start the periodic sync loop. No-op on unconfigured terminals.
    pub fn start_background_sync(&self, interval_secs: u64) {
        let Some(client) = self.client.clone() else {
            info!("Terminal not configured; background sync not started");
            return;
        };
        sync::start_sync_loop(
            &self.tracker,
            self.db.clone(),
            client,
            self.events.clone(),
            self.sync_state.clone(),
            interval_secs,
            self.cancel.child_token(),
        );
    }

    /// Run one sync cycle immediately.
    pub async fn sync_now(&self) -> Result<SyncReport, String> {
        let client = self
            .client
            .as_ref()
            .ok_or("Terminal not configured")?;
        sync::run_sync_cycle(&self.db, client.as_ref(), &self.events).await
    }

    pub fn is_sync_running(&self) -> bool {
        self.sync_state.is_running.load(Ordering::SeqCst)
    }

    pub fn last_sync(&self) -> Option<String> {
        lock_unpoisoned(&self.sync_state.last_sync).clone()
    }

    /// Stop background work and wait for in-flight tasks to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
