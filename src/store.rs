//! Order persistence: the local `orders` table is the source of truth for
//! everything this terminal has placed, and rows with
//! `sync_status = 'pending'` double as the retry queue for the background
//! loop.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cart::{LineItem, Totals};
use crate::db::DbState;
use crate::menu::MenuCatalog;
use crate::normalize::{self, NormalizedItem};
use crate::order::{Order, OrderFlow, OrderStatus, SyncStatus};
use crate::tables::{CustomerContext, TableRef};
use crate::{value_f64, value_i64, value_str};

/// Submission attempts before a pending order is marked failed.
pub const MAX_SYNC_ATTEMPTS: i64 = 5;

const ORDER_COLUMNS: &str = "id, order_number, flow, customer_name, customer_phone, guest_count,
     table_id, table_number, items, subtotal, tax_amount, total_amount,
     tax_rate, status, payment_method, payment_reference, remote_id,
     sync_status, created_at, updated_at";

fn row_to_order(row: &Row) -> rusqlite::Result<Order> {
    let items_json: String = row.get(8)?;
    let items: Vec<LineItem> = serde_json::from_str(&items_json).unwrap_or_default();

    let table_id: Option<String> = row.get(6)?;
    let table_number: Option<String> = row.get(7)?;
    let table = table_id.map(|id| TableRef {
        id,
        table_number: table_number.unwrap_or_default(),
    });

    let status: String = row.get(13)?;
    let flow: String = row.get(2)?;
    let sync_status: String = row.get(17)?;

    Ok(Order {
        id: row.get(0)?,
        order_number: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        flow: OrderFlow::parse(&flow),
        items,
        customer: CustomerContext {
            name: row.get(3)?,
            phone: row.get(4)?,
            guest_count: row.get::<_, Option<i64>>(5)?.map(|g| g.max(0) as u32),
            table,
        },
        bills: Totals {
            subtotal: row.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
            tax: row.get::<_, Option<f64>>(10)?.unwrap_or(0.0),
            total: row.get::<_, Option<f64>>(11)?.unwrap_or(0.0),
        },
        tax_rate: row.get::<_, Option<f64>>(12)?.unwrap_or(0.0),
        status: OrderStatus::parse(&status),
        payment_method: row.get(14)?,
        payment_reference: row.get(15)?,
        remote_id: row.get(16)?,
        sync_status: SyncStatus::parse(&sync_status),
        created_at: row.get::<_, Option<String>>(18)?.unwrap_or_default(),
        updated_at: row.get::<_, Option<String>>(19)?.unwrap_or_default(),
    })
}

/// Insert a freshly materialized order. `client_request_id` is the checkout
/// idempotency key; a duplicate insert fails on its unique index.
pub fn insert_order(
    db: &DbState,
    order: &Order,
    client_request_id: Option<&str>,
) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let items_json =
        serde_json::to_string(&order.items).map_err(|e| format!("serialize items: {e}"))?;
    let table = order.customer.table.as_ref();

    conn.execute(
        &format!(
            "INSERT INTO orders ({ORDER_COLUMNS}, client_request_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
        ),
        params![
            order.id,
            order.order_number,
            order.flow.as_str(),
            order.customer.name,
            order.customer.phone,
            order.customer.guest_count.map(|g| g as i64),
            table.map(|t| t.id.clone()),
            table.map(|t| t.table_number.clone()),
            items_json,
            order.bills.subtotal,
            order.bills.tax,
            order.bills.total,
            order.tax_rate,
            order.status.as_str(),
            order.payment_method,
            order.payment_reference,
            order.remote_id,
            order.sync_status.as_str(),
            order.created_at,
            order.updated_at,
            client_request_id,
        ],
    )
    .map_err(|e| format!("insert order: {e}"))?;
    Ok(())
}

/// Resolve a local id from either a local or a server-assigned id.
pub fn resolve_order_id(db: &DbState, order_id: &str) -> Result<Option<String>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        "SELECT id FROM orders WHERE id = ?1 OR remote_id = ?1 LIMIT 1",
        params![order_id],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(|e| format!("resolve order id: {e}"))
}

/// Look up an order created by a previous attempt of the same checkout
/// request.
pub fn find_by_client_request_id(
    db: &DbState,
    request_id: &str,
) -> Result<Option<Order>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE client_request_id = ?1 LIMIT 1"),
        params![request_id],
        row_to_order,
    )
    .optional()
    .map_err(|e| format!("query idempotent order: {e}"))
}

/// Get a single order by local or server-assigned id.
pub fn get_order(db: &DbState, order_id: &str) -> Result<Option<Order>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1 OR remote_id = ?1 LIMIT 1"),
        params![order_id],
        row_to_order,
    )
    .optional()
    .map_err(|e| format!("get order: {e}"))
}

/// All orders, most recent first.
pub fn list_orders(db: &DbState) -> Result<Vec<Order>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC, id DESC"
        ))
        .map_err(|e| e.to_string())?;
    let rows = stmt.query_map([], row_to_order).map_err(|e| e.to_string())?;

    let mut orders = Vec::new();
    for row in rows {
        match row {
            Ok(order) => orders.push(order),
            Err(e) => warn!("skipping malformed order row: {e}"),
        }
    }
    Ok(orders)
}

/// Orders still waiting for server acknowledgement, oldest first.
pub fn pending_orders(db: &DbState) -> Result<Vec<Order>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE sync_status = 'pending' AND retry_count < ?1
             ORDER BY created_at ASC"
        ))
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map(params![MAX_SYNC_ATTEMPTS], row_to_order)
        .map_err(|e| e.to_string())?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Transition an order's status. The loose spelling is translated before
/// storage; items and bills stay frozen.
pub fn update_status(db: &DbState, order_id: &str, raw_status: &str) -> Result<OrderStatus, String> {
    let status = OrderStatus::parse(raw_status);
    let local_id = resolve_order_id(db, order_id)?.ok_or("Order not found")?;
    let now = Utc::now().to_rfc3339();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), now, local_id],
    )
    .map_err(|e| format!("update order status: {e}"))?;
    Ok(status)
}

/// Record payment confirmation fields once the gateway settles.
pub fn record_payment(
    db: &DbState,
    order_id: &str,
    method: &str,
    reference: Option<&str>,
) -> Result<(), String> {
    let local_id = resolve_order_id(db, order_id)?.ok_or("Order not found")?;
    let now = Utc::now().to_rfc3339();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE orders
         SET payment_method = ?1, payment_reference = ?2, updated_at = ?3
         WHERE id = ?4",
        params![method, reference, now, local_id],
    )
    .map_err(|e| format!("record payment: {e}"))?;
    Ok(())
}

/// Mark an order acknowledged by the server.
pub fn mark_synced(db: &DbState, order_id: &str, remote_id: &str) -> Result<(), String> {
    let now = Utc::now().to_rfc3339();
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE orders
         SET remote_id = ?1, sync_status = 'synced', last_error = NULL,
             last_synced_at = ?2, updated_at = ?2
         WHERE id = ?3",
        params![remote_id, now, order_id],
    )
    .map_err(|e| format!("mark order synced: {e}"))?;
    Ok(())
}

/// Record a failed submission attempt. Permanent errors and exhausted
/// retries move the row to `failed`; everything else stays `pending` for
/// the next cycle.
pub fn record_sync_failure(
    db: &DbState,
    order_id: &str,
    error: &str,
    permanent: bool,
) -> Result<SyncStatus, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE orders
         SET retry_count = retry_count + 1, last_error = ?1, updated_at = datetime('now')
         WHERE id = ?2",
        params![error, order_id],
    )
    .map_err(|e| format!("record sync failure: {e}"))?;

    let retry_count: i64 = conn
        .query_row(
            "SELECT retry_count FROM orders WHERE id = ?1",
            params![order_id],
            |row| row.get(0),
        )
        .map_err(|e| format!("read retry count: {e}"))?;

    if permanent || retry_count >= MAX_SYNC_ATTEMPTS {
        conn.execute(
            "UPDATE orders SET sync_status = 'failed' WHERE id = ?1",
            params![order_id],
        )
        .map_err(|e| format!("mark order failed: {e}"))?;
        warn!(
            order_id,
            retry_count, permanent, "Order submission abandoned"
        );
        return Ok(SyncStatus::Failed);
    }
    Ok(SyncStatus::Pending)
}

// ---------------------------------------------------------------------------
// Remote order materialization
// ---------------------------------------------------------------------------

/// Outcome of merging one server-fetched order into the local mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Unknown remote order, inserted locally.
    Inserted,
    /// Known order, server snapshot was newer: status refreshed.
    Updated,
    /// Known order, local state is as new or newer: left untouched.
    KeptLocal,
    /// Record carried no usable remote id.
    Skipped,
}

/// Parse the timestamp formats this crate writes (RFC 3339) and SQLite
/// emits (`datetime('now')`).
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn normalized_items_to_lines(items: &[NormalizedItem]) -> Vec<LineItem> {
    items
        .iter()
        .map(|item| LineItem {
            id: item.id.clone().unwrap_or_default(),
            name: item.name.clone(),
            unit_price: item.unit_price,
            quantity: (item.quantity.round().max(1.0)) as u32,
            description: None,
            customizations: String::new(),
        })
        .collect()
}

/// Merge one order of unknown shape fetched from the server.
///
/// Unknown remote ids are inserted as already-synced rows. Known rows only
/// take the server's status, and only when the server snapshot is strictly
/// newer than the local one; a stale poll response must never clobber a
/// fresher local mutation.
pub fn materialize_remote_order(
    db: &DbState,
    raw: &Value,
    catalog: &MenuCatalog,
) -> Result<MergeOutcome, String> {
    let normalized = normalize::normalize_order(raw, catalog);
    let Some(remote_id) = normalized.remote_id.clone() else {
        return Ok(MergeOutcome::Skipped);
    };

    let existing: Option<(String, Option<String>)> = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        conn.query_row(
            "SELECT id, updated_at FROM orders WHERE remote_id = ?1 OR id = ?1 LIMIT 1",
            params![remote_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| format!("lookup remote order: {e}"))?
    };

    if let Some((local_id, local_updated_at)) = existing {
        let remote_ts = normalized.updated_at.as_deref().and_then(parse_timestamp);
        let local_ts = local_updated_at.as_deref().and_then(parse_timestamp);
        let remote_is_newer = match (remote_ts, local_ts) {
            (Some(remote), Some(local)) => remote > local,
            // Without both timestamps there is no basis to overwrite.
            _ => false,
        };
        if !remote_is_newer {
            return Ok(MergeOutcome::KeptLocal);
        }

        let remote_updated_at = normalized.updated_at.clone().unwrap_or_default();
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![normalized.status.as_str(), remote_updated_at, local_id],
        )
        .map_err(|e| format!("refresh remote order: {e}"))?;
        return Ok(MergeOutcome::Updated);
    }

    // Unknown to this terminal: mirror it locally.
    let local_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let items = normalized_items_to_lines(&normalized.items);
    let items_json =
        serde_json::to_string(&items).map_err(|e| format!("serialize items: {e}"))?;

    let subtotal = value_f64(raw, &["subtotal"]).unwrap_or(normalized.total);
    let tax = value_f64(raw, &["tax", "taxAmount", "tax_amount"]).unwrap_or(0.0);
    let flow = value_str(raw, &["flow", "orderType", "order_type"])
        .map(|f| OrderFlow::parse(&f))
        .unwrap_or_default();
    let created_at = normalized.created_at.clone().unwrap_or_else(|| now.clone());
    let updated_at = normalized.updated_at.clone().unwrap_or_else(|| created_at.clone());
    let order_number = value_str(raw, &["orderNumber", "order_number"]);
    let guest_count = value_i64(raw, &["guestCount", "guest_count"]).filter(|g| *g > 0);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        &format!(
            "INSERT INTO orders ({ORDER_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, 'synced', ?18, ?19)"
        ),
        params![
            local_id,
            order_number,
            flow.as_str(),
            normalized.customer_name,
            normalized.customer_phone,
            guest_count,
            Option::<String>::None,
            normalized.table_number,
            items_json,
            subtotal,
            tax,
            normalized.total,
            Option::<f64>::None,
            normalized.status.as_str(),
            value_str(raw, &["paymentMethod", "payment_method"]),
            value_str(raw, &["paymentReference", "payment_reference"]),
            remote_id,
            created_at,
            updated_at,
        ],
    )
    .map_err(|e| format!("materialize remote order: {e}"))?;

    info!(remote_id = %remote_id, local_id = %local_id, "Mirrored remote order locally");
    Ok(MergeOutcome::Inserted)
}
