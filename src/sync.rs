//! Background sync loop.
//!
//! One periodic task per session: probes connectivity, retries orders the
//! server has not acknowledged, and refreshes the local order mirror from
//! `GET /orders`. Refresh merges are last-write-wins by timestamp: a stale
//! poll response never overwrites a fresher local mutation (the merge rule
//! lives in `store::materialize_remote_order`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::api::RemoteBackend;
use crate::db::DbState;
use crate::menu::MenuCatalog;
use crate::normalize;
use crate::order::SyncStatus;
use crate::session::PosEvent;
use crate::store::{self, MergeOutcome};

/// Default cadence for the background loop.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Shared flags describing the loop, readable from the UI layer.
pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub last_sync: Arc<Mutex<Option<String>>>,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            last_sync: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors the server will keep rejecting no matter how often we retry:
/// payload validation failures. Connectivity problems and 5xx responses
/// stay retryable.
pub(crate) fn is_permanent_submission_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("menu items not found")
        || lower.contains("invalid menu items")
        || lower.contains("(http 400")
        || lower.contains("(http 409")
        || lower.contains("(http 422")
}

/// Counters from one sync cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub retried: usize,
    pub synced: usize,
    pub fetched: usize,
    pub merged: usize,
}

/// Re-submit every order still waiting for a server ack.
async fn retry_pending_orders<C: RemoteBackend>(
    db: &DbState,
    client: &C,
    events: &broadcast::Sender<PosEvent>,
) -> Result<(usize, usize), String> {
    let pending = store::pending_orders(db)?;
    let retried = pending.len();
    let mut synced = 0usize;

    for order in pending {
        match client.submit_order(&order).await {
            Ok(ack) => {
                store::mark_synced(db, &order.id, &ack.remote_id)?;
                synced += 1;
                info!(order_id = %order.id, remote_id = %ack.remote_id, "Queued order synced");
                let _ = events.send(PosEvent::SyncRetry {
                    order_id: order.id,
                    synced: true,
                    error: None,
                });
            }
            Err(error) => {
                let permanent = is_permanent_submission_error(&error);
                let disposition = store::record_sync_failure(db, &order.id, &error, permanent)?;
                if disposition == SyncStatus::Failed {
                    warn!(order_id = %order.id, error = %error, "Queued order abandoned");
                }
                let _ = events.send(PosEvent::SyncRetry {
                    order_id: order.id,
                    synced: false,
                    error: Some(error),
                });
            }
        }
    }
    Ok((retried, synced))
}

/// Pull the server's order list and merge it into the local mirror.
async fn refresh_orders<C: RemoteBackend>(
    db: &DbState,
    client: &C,
    events: &broadcast::Sender<PosEvent>,
) -> Result<(usize, usize), String> {
    let resp = client.fetch_orders().await?;
    let records = normalize::unwrap_order_list(&resp);
    let fetched = records.len();
    let catalog = MenuCatalog::load(db);

    let mut merged = 0usize;
    for record in &records {
        match store::materialize_remote_order(db, record, &catalog) {
            Ok(MergeOutcome::Inserted) | Ok(MergeOutcome::Updated) => merged += 1,
            Ok(_) => {}
            Err(e) => warn!("skipping unmergeable remote order: {e}"),
        }
    }

    if fetched > 0 {
        let _ = events.send(PosEvent::OrdersRefreshed { fetched, merged });
    }
    Ok((fetched, merged))
}

/// One full pass: retry queue first, then list refresh.
pub async fn run_sync_cycle<C: RemoteBackend>(
    db: &DbState,
    client: &C,
    events: &broadcast::Sender<PosEvent>,
) -> Result<SyncReport, String> {
    let (retried, synced) = retry_pending_orders(db, client, events).await?;
    let (fetched, merged) = refresh_orders(db, client, events).await?;
    Ok(SyncReport {
        retried,
        synced,
        fetched,
        merged,
    })
}

/// Start the background sync loop on `tracker`. The task runs every
/// `interval_secs` until `cancel` fires; cancellation mid-sleep takes
/// effect immediately and never errors.
pub fn start_sync_loop<C: RemoteBackend>(
    tracker: &TaskTracker,
    db: Arc<DbState>,
    client: Arc<C>,
    events: broadcast::Sender<PosEvent>,
    sync_state: Arc<SyncState>,
    interval_secs: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let is_running = sync_state.is_running.clone();
    let last_sync = sync_state.last_sync.clone();
    is_running.store(true, Ordering::SeqCst);

    tracker.spawn(async move {
        info!("Sync loop started (interval: {interval_secs}s)");
        let mut previous_online: Option<bool> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
            }

            // Emit network status every cycle so UI indicators stay
            // event-driven without polling.
            let online = client.health_check().await;
            let _ = events.send(PosEvent::NetworkStatus { online });

            if !online {
                if previous_online != Some(false) {
                    info!("Network offline; deferring sync and keeping queue pending");
                }
                previous_online = Some(false);
                continue;
            }
            if previous_online == Some(false) {
                info!("Network restored; resuming queued sync");
            }
            previous_online = Some(true);

            match run_sync_cycle(&db, client.as_ref(), &events).await {
                Ok(report) => {
                    if report.synced > 0 || report.merged > 0 {
                        info!(
                            synced = report.synced,
                            merged = report.merged,
                            "Sync cycle complete"
                        );
                    }
                    if let Ok(mut guard) = last_sync.lock() {
                        *guard = Some(Utc::now().to_rfc3339());
                    }
                }
                Err(e) => warn!("Sync cycle failed: {e}"),
            }
        }

        is_running.store(false, Ordering::SeqCst);
        info!("Sync loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::test_support::{cart_with_chai, test_db, MockBackend};
    use crate::checkout::{self, PlacementOutcome};
    use crate::config::CheckoutPolicy;
    use crate::order::{OrderFlow, OrderStatus};
    use crate::tables::CustomerContext;

    async fn place_locally(db: &DbState, backend: &MockBackend) -> String {
        backend
            .submit_script
            .lock()
            .unwrap()
            .push(Err("POS server error (HTTP 503)".to_string()));
        let placement = checkout::place_order(
            db,
            Some(backend),
            OrderFlow::Takeaway,
            &cart_with_chai(1),
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
        placement.order.id
    }

    #[test]
    fn permanent_error_classification() {
        assert!(is_permanent_submission_error(
            "menu items not found in local cache: abc"
        ));
        assert!(is_permanent_submission_error(
            "Validation failed (HTTP 422): {\"items\": \"bad\"}"
        ));
        assert!(!is_permanent_submission_error("POS server error (HTTP 503)"));
        assert!(!is_permanent_submission_error(
            "Cannot reach POS server at https://pos.example.com"
        ));
        assert!(!is_permanent_submission_error(
            "Connection to https://pos.example.com timed out"
        ));
    }

    #[tokio::test]
    async fn cycle_retries_pending_orders_until_acked() {
        let db = test_db();
        let backend = MockBackend::default();
        let (events, mut rx) = broadcast::channel(16);

        let order_id = place_locally(&db, &backend).await;

        // Next submission succeeds (script exhausted -> default ack)
        let report = run_sync_cycle(&db, &backend, &events).await.expect("cycle");
        assert_eq!(report.retried, 1);
        assert_eq!(report.synced, 1);

        let stored = store::get_order(&db, &order_id)
            .expect("query")
            .expect("present");
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(stored.remote_id.is_some());

        // The retry emitted an event
        let mut saw_retry = false;
        while let Ok(event) = rx.try_recv() {
            if let PosEvent::SyncRetry { synced: true, .. } = event {
                saw_retry = true;
            }
        }
        assert!(saw_retry);

        // Nothing left to retry
        let report = run_sync_cycle(&db, &backend, &events).await.expect("cycle");
        assert_eq!(report.retried, 0);
    }

    #[tokio::test]
    async fn transient_failures_keep_orders_queued() {
        let db = test_db();
        let backend = MockBackend::default();
        let (events, _rx) = broadcast::channel(16);

        let order_id = place_locally(&db, &backend).await;

        backend
            .submit_script
            .lock()
            .unwrap()
            .push(Err("POS server error (HTTP 502)".to_string()));
        let report = run_sync_cycle(&db, &backend, &events).await.expect("cycle");
        assert_eq!(report.retried, 1);
        assert_eq!(report.synced, 0);

        let stored = store::get_order(&db, &order_id)
            .expect("query")
            .expect("present");
        assert_eq!(stored.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn permanent_failures_abandon_the_order() {
        let db = test_db();
        let backend = MockBackend::default();
        let (events, _rx) = broadcast::channel(16);

        let order_id = place_locally(&db, &backend).await;

        backend
            .submit_script
            .lock()
            .unwrap()
            .push(Err("Invalid menu items (HTTP 422)".to_string()));
        run_sync_cycle(&db, &backend, &events).await.expect("cycle");

        let stored = store::get_order(&db, &order_id)
            .expect("query")
            .expect("present");
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert!(store::pending_orders(&db).expect("pending").is_empty());
    }

    #[tokio::test]
    async fn cycle_merges_fetched_orders_into_local_mirror() {
        let db = test_db();
        let backend = MockBackend::default();
        let (events, mut rx) = broadcast::channel(16);

        *backend.orders_response.lock().unwrap() = serde_json::json!({
            "data": {
                "orders": [
                    {
                        "id": "srv-77",
                        "customerDetails": { "name": "Remote Guest" },
                        "status": "preparing",
                        "items": [{ "name": "Toast", "price": 30.0, "quantity": 1 }],
                        "total": 30.0,
                        "updated_at": "2026-08-01T09:00:00+00:00"
                    }
                ]
            }
        });

        let report = run_sync_cycle(&db, &backend, &events).await.expect("cycle");
        assert_eq!(report.fetched, 1);
        assert_eq!(report.merged, 1);

        let stored = store::get_order(&db, "srv-77")
            .expect("query")
            .expect("mirrored");
        assert_eq!(stored.customer.name.as_deref(), Some("Remote Guest"));
        assert_eq!(stored.status, OrderStatus::InProgress);

        let mut saw_refresh = false;
        while let Ok(event) = rx.try_recv() {
            if let PosEvent::OrdersRefreshed { fetched: 1, merged: 1 } = event {
                saw_refresh = true;
            }
        }
        assert!(saw_refresh);

        // Second cycle with the same payload merges nothing new
        let report = run_sync_cycle(&db, &backend, &events).await.expect("cycle");
        assert_eq!(report.merged, 0);
    }

    #[tokio::test]
    async fn stale_poll_does_not_resurrect_newer_local_state() {
        let db = test_db();
        let backend = MockBackend::default();
        let (events, _rx) = broadcast::channel(16);

        // Place and sync an order, then cancel it locally (updated_at = now)
        let placement = checkout::place_order(
            &db,
            Some(&backend),
            OrderFlow::Takeaway,
            &cart_with_chai(1),
            &CustomerContext::default(),
            &CheckoutPolicy::default(),
            None,
            None,
        )
        .await
        .expect("placement");
        let order_id = placement.order.id.clone();
        let remote_id = placement.order.remote_id.clone().expect("remote id");
        store::update_status(&db, &order_id, "cancelled").expect("cancel");

        // The server still reports the pre-cancellation snapshot
        *backend.orders_response.lock().unwrap() = serde_json::json!([{
            "id": remote_id,
            "status": "pending",
            "updated_at": "2000-01-01T00:00:00+00:00"
        }]);

        run_sync_cycle(&db, &backend, &events).await.expect("cycle");

        let stored = store::get_order(&db, &order_id)
            .expect("query")
            .expect("present");
        assert_eq!(
            stored.status,
            OrderStatus::Cancelled,
            "stale server snapshot must not undo a newer local cancel"
        );
    }

    #[tokio::test]
    async fn loop_stops_promptly_on_cancellation() {
        let db = Arc::new(test_db());
        let backend = Arc::new(MockBackend::default());
        let (events, _rx) = broadcast::channel(16);
        let state = Arc::new(SyncState::new());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let handle = start_sync_loop(
            &tracker,
            db,
            backend,
            events,
            state.clone(),
            3600, // would sleep an hour without cancellation
            cancel.clone(),
        );
        assert!(state.is_running.load(Ordering::SeqCst));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop must stop before the interval elapses")
            .expect("join");
        assert!(!state.is_running.load(Ordering::SeqCst));
    }
}
