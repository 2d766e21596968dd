//! Order shape normalization.
//!
//! Order records reach list views from two origins with diverging field
//! names: locally-placed orders and server-fetched ones (plus historical
//! rows written by older producers). Everything funnels through
//! [`normalize_order`], which is total: any input, including garbage,
//! produces a renderable record with every canonical field populated.
//!
//! Producers inside this crate emit the canonical shape directly; only
//! ingestion of foreign data belongs here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::menu::MenuCatalog;
use crate::order::OrderStatus;
use crate::{value_f64, value_str};

/// Keys probed, in order, for the line-item collection.
const ITEM_KEYS: [&str; 6] = [
    "items",
    "orderItems",
    "order_items",
    "cart",
    "products",
    "itemsList",
];

/// One normalized line: always has a display name, a non-negative price,
/// and a quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub unit_price: f64,
    pub quantity: f64,
}

impl NormalizedItem {
    pub fn line_total(&self) -> f64 {
        self.unit_price * self.quantity
    }
}

/// The canonical read-side order record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOrder {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub customer_name: String,
    pub customer_phone: String,
    pub table_number: String,
    pub status: OrderStatus,
    pub items: Vec<NormalizedItem>,
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Set when several required fields fell through to defaults, a sign
    /// of upstream shape drift worth investigating. Not an error.
    #[serde(skip)]
    pub ambiguous: bool,
}

/// Read a string at a nested path, trimming and dropping empties.
fn path_str(v: &Value, path: &[&str]) -> Option<String> {
    let mut cur = v;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn path_f64(v: &Value, path: &[&str]) -> Option<f64> {
    let mut cur = v;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_f64()
}

/// Read a scalar as a display string: strings pass through, numbers are
/// stringified (table numbers and ids arrive both ways).
fn scalar_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn scalar_at(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| v.get(*key).and_then(scalar_str))
}

fn customer_name(raw: &Value) -> Option<String> {
    raw.get("customer")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .or_else(|| path_str(raw, &["customer", "name"]))
        .or_else(|| path_str(raw, &["customerDetails", "name"]))
        .or_else(|| value_str(raw, &["customerName"]))
}

fn customer_phone(raw: &Value) -> Option<String> {
    value_str(raw, &["customerPhone"])
        .or_else(|| path_str(raw, &["customerDetails", "phone"]))
        .or_else(|| path_str(raw, &["customer", "phone"]))
}

fn table_number(raw: &Value) -> Option<String> {
    raw.get("tableNo")
        .and_then(scalar_str)
        .or_else(|| raw.get("table").and_then(|t| t.get("tableNo")).and_then(scalar_str))
        .or_else(|| raw.get("tableNumber").and_then(scalar_str))
}

fn raw_status(raw: &Value) -> Option<String> {
    value_str(raw, &["status", "orderStatus", "paymentStatus"])
}

/// Pull out the line-item collection. Returns `(values, found)` where
/// `found` is false only when no candidate key carried anything usable.
fn extract_item_values(raw: &Value) -> (Vec<Value>, bool) {
    for key in ITEM_KEYS {
        match raw.get(key) {
            Some(Value::Array(arr)) if !arr.is_empty() => return (arr.clone(), true),
            Some(Value::Object(map)) => return (map.values().cloned().collect(), true),
            // A numeric "items" field is an item count, not a collection.
            Some(Value::Number(_)) => return (Vec::new(), true),
            _ => continue,
        }
    }
    (Vec::new(), false)
}

/// Resolve one raw item into a renderable line. Items lacking both a name
/// and a price are bare references and go through the catalog.
fn resolve_item(item: &Value, catalog: &MenuCatalog) -> NormalizedItem {
    // A bare string (or number) is an id reference on its own.
    if let Some(id) = scalar_str(item) {
        let (name, unit_price) = match catalog.resolve(&id) {
            Some(entry) => (entry.name.clone(), entry.price),
            None => ("Item".to_string(), 0.0),
        };
        return NormalizedItem {
            id: Some(id),
            name,
            unit_price,
            quantity: 1.0,
        };
    }

    let id = scalar_at(item, &["id", "itemId", "menuId", "menu_item_id"]);
    let name = value_str(item, &["name", "item_name", "title"]);
    let price = value_f64(item, &["price", "unit_price", "unitPrice"]).filter(|p| p.is_finite());
    let quantity = value_f64(item, &["quantity", "qty"])
        .filter(|q| q.is_finite() && *q >= 0.0)
        .unwrap_or(1.0);

    let (name, unit_price) = match (name, price) {
        (None, None) => match id.as_deref().and_then(|i| catalog.resolve(i)) {
            Some(entry) => (entry.name.clone(), entry.price),
            None => ("Item".to_string(), 0.0),
        },
        (name, price) => (
            name.unwrap_or_else(|| "Item".to_string()),
            price.unwrap_or(0.0).max(0.0),
        ),
    };

    NormalizedItem {
        id,
        name,
        unit_price,
        quantity,
    }
}

/// Normalize an order-shaped value of unknown origin into the canonical
/// record. Total: never panics, every field has a defined fallback.
pub fn normalize_order(raw: &Value, catalog: &MenuCatalog) -> NormalizedOrder {
    let mut defaulted: Vec<&'static str> = Vec::new();

    let customer_name = customer_name(raw).unwrap_or_else(|| {
        defaulted.push("customerName");
        "Customer".to_string()
    });
    let customer_phone = customer_phone(raw).unwrap_or_default();
    let table_number = table_number(raw).unwrap_or_else(|| {
        defaulted.push("tableNumber");
        "N/A".to_string()
    });
    let status = match raw_status(raw) {
        Some(s) => OrderStatus::parse(&s),
        None => {
            defaulted.push("status");
            OrderStatus::Pending
        }
    };

    let (item_values, items_found) = extract_item_values(raw);
    if !items_found {
        defaulted.push("items");
    }
    let items: Vec<NormalizedItem> = item_values
        .iter()
        .map(|item| resolve_item(item, catalog))
        .collect();

    let declared_total = value_f64(raw, &["total"])
        .or_else(|| path_f64(raw, &["bills", "totalWithTax"]))
        .or_else(|| value_f64(raw, &["grandTotal"]))
        .filter(|t| t.is_finite());
    let total = match declared_total {
        Some(t) if t != 0.0 => t,
        declared => {
            // Absent or zero: recompute from the resolved lines.
            let recomputed: f64 = items.iter().map(NormalizedItem::line_total).sum();
            if declared.is_none() && recomputed == 0.0 {
                defaulted.push("total");
            }
            recomputed
        }
    };

    let ambiguous = defaulted.len() >= 2;
    if ambiguous {
        warn!(
            fields = ?defaulted,
            "order normalization fell back to defaults for multiple fields"
        );
    }

    NormalizedOrder {
        remote_id: scalar_at(raw, &["id", "_id", "orderId", "order_id", "remoteId", "remote_id"]),
        customer_name,
        customer_phone,
        table_number,
        status,
        items,
        total,
        created_at: value_str(raw, &["created_at", "createdAt"]),
        updated_at: value_str(raw, &["updated_at", "updatedAt"]),
        ambiguous,
    }
}

/// Unwrap the order list from any of the envelope shapes the server has
/// been observed to return.
pub fn unwrap_order_list(resp: &Value) -> Vec<Value> {
    if let Some(arr) = resp.as_array() {
        return arr.clone();
    }
    let candidates: [&[&str]; 4] = [&["data", "data"], &["data", "orders"], &["orders"], &["data"]];
    for path in candidates {
        let mut cur = resp;
        let mut ok = true;
        for key in path {
            match cur.get(*key) {
                Some(next) => cur = next,
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            if let Some(arr) = cur.as_array() {
                return arr.clone();
            }
        }
    }
    Vec::new()
}
