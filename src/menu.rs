//! Menu cache layer for DinePOS.
//!
//! Reads cached menu data (categories and items) from the local SQLite
//! `menu_cache` table, syncs fresh data from the POS server, and builds the
//! id-indexed [`MenuCatalog`] the normalizer uses to resolve bare item
//! references.

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::{error, trace, warn};

use crate::api::RemoteBackend;
use crate::cart::LineItem;
use crate::db::DbState;

const SECTIONS: [&str; 2] = ["categories", "items"];

// ---------------------------------------------------------------------------
// Cache readers
// ---------------------------------------------------------------------------

/// Read a cached menu array by key. Returns an empty array on miss or error.
fn read_cache(db: &DbState, cache_key: &str) -> Vec<Value> {
    let conn = match db.conn.lock() {
        Ok(c) => c,
        Err(e) => {
            error!("menu cache lock failed: {e}");
            return vec![];
        }
    };

    let json_str: Option<String> = conn
        .query_row(
            "SELECT data FROM menu_cache WHERE cache_key = ?1",
            params![cache_key],
            |row| row.get(0),
        )
        .ok();

    match json_str {
        Some(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Array(arr)) => arr,
            Ok(other) => {
                warn!("menu_cache[{cache_key}] is not an array, wrapping");
                vec![other]
            }
            Err(e) => {
                error!("menu_cache[{cache_key}] JSON parse error: {e}");
                vec![]
            }
        },
        None => vec![],
    }
}

/// Get cached categories.
pub fn get_categories(db: &DbState) -> Vec<Value> {
    read_cache(db, "categories")
}

/// Get cached menu items.
pub fn get_items(db: &DbState) -> Vec<Value> {
    read_cache(db, "items")
}

fn section_count(data: &Value, key: &str) -> usize {
    data.get(key)
        .and_then(Value::as_array)
        .map(|arr| arr.len())
        .unwrap_or(0)
}

fn section_or_empty(data: &Value, key: &str) -> Value {
    data.get(key)
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()))
}

/// Compute a stable local version from the actual menu sections we cache.
/// This avoids treating response timestamps as menu-version changes.
fn compute_menu_payload_version(data: &Value) -> String {
    let snapshot = serde_json::json!({
        "categories": section_or_empty(data, "categories"),
        "items": section_or_empty(data, "items"),
    });

    let serialized = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
    let mut hasher = DefaultHasher::new();
    serialized.hash(&mut hasher);
    format!("digest:{:016x}", hasher.finish())
}

fn explicit_menu_version(data: &Value, resp: &Value) -> Option<String> {
    data.get("version")
        .or_else(|| resp.get("version"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

// ---------------------------------------------------------------------------
// Catalog index
// ---------------------------------------------------------------------------

/// A resolved menu entry: display name and unit price.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub name: String,
    pub price: f64,
}

/// Id-indexed view over the cached menu items. Used by the normalizer to
/// resolve bare item references and by checkout to validate cart contents.
#[derive(Debug, Default, Clone)]
pub struct MenuCatalog {
    by_id: HashMap<String, CatalogEntry>,
}

impl MenuCatalog {
    /// Build the index from the cached `items` section.
    pub fn load(db: &DbState) -> MenuCatalog {
        let mut by_id = HashMap::new();
        for item in get_items(db) {
            let Some(id) = crate::value_str(&item, &["id", "itemId", "menuId", "menu_item_id"])
            else {
                continue;
            };
            let name = crate::value_str(&item, &["name", "title", "item_name"])
                .unwrap_or_else(|| "Item".to_string());
            let price = crate::value_f64(&item, &["price", "unitPrice", "unit_price"])
                .filter(|p| p.is_finite() && *p >= 0.0)
                .unwrap_or(0.0);
            by_id.insert(id, CatalogEntry { name, price });
        }
        MenuCatalog { by_id }
    }

    /// Build a catalog directly from entries, bypassing the cache.
    pub fn from_entries<I>(entries: I) -> MenuCatalog
    where
        I: IntoIterator<Item = (String, CatalogEntry)>,
    {
        MenuCatalog {
            by_id: entries.into_iter().collect(),
        }
    }

    pub fn resolve(&self, id: &str) -> Option<&CatalogEntry> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}

/// Check cart lines against the cached menu. An empty catalog skips the
/// check (first run before any menu sync must stay usable offline).
pub fn validate_items(catalog: &MenuCatalog, items: &[LineItem]) -> Result<(), Vec<String>> {
    if catalog.is_empty() {
        return Ok(());
    }
    let missing: Vec<String> = items
        .iter()
        .filter(|line| !catalog.contains(&line.id))
        .map(|line| line.id.clone())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing)
    }
}

// ---------------------------------------------------------------------------
// Sync from the POS server
// ---------------------------------------------------------------------------

/// Fetch menu data from the POS server and update the local cache.
///
/// Calls `GET /api/pos/menu-sync`, then upserts each menu section into the
/// `menu_cache` table. Skips the write when the payload digest matches the
/// cached version.
pub async fn sync_menu<C: RemoteBackend>(db: &DbState, client: &C) -> Result<Value, String> {
    let resp = client.fetch_menu().await?;

    // Server contract shape:
    // { success, menu_data: { categories, items, ... }, timestamp, ... }
    // Keep compatibility with legacy wrappers that returned { data: ... }.
    let data = resp
        .get("menu_data")
        .or_else(|| resp.get("data").and_then(|d| d.get("menu_data")))
        .or_else(|| resp.get("data"))
        .or_else(|| {
            if resp.get("categories").is_some() || resp.get("items").is_some() {
                Some(&resp)
            } else {
                None
            }
        })
        .ok_or("Menu sync response missing menu payload")?;

    if data.get("categories").is_none() && data.get("items").is_none() {
        return Err("Menu sync payload is missing all menu sections".to_string());
    }

    let category_count = section_count(data, "categories");
    let item_count = section_count(data, "items");
    let counts = serde_json::json!({
        "categories": category_count,
        "items": item_count,
    });

    let version =
        explicit_menu_version(data, &resp).unwrap_or_else(|| compute_menu_payload_version(data));
    let timestamp = resp
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    // Check if version matches current cache to skip unnecessary writes
    {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let cached_version: Option<String> = conn
            .query_row(
                "SELECT version FROM menu_cache WHERE cache_key = 'items'",
                [],
                |row| row.get(0),
            )
            .ok()
            .flatten();

        if cached_version.as_deref() == Some(version.as_str()) {
            trace!(
                version = %version,
                categories = category_count,
                items = item_count,
                "menu sync: cache already at latest version"
            );
            return Ok(serde_json::json!({
                "success": true,
                "updated": false,
                "version": version,
                "counts": counts,
                "timestamp": timestamp
            }));
        }
    }

    // Upsert each section
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    for section in &SECTIONS {
        let empty = Value::Array(vec![]);
        let section_data = data.get(*section).unwrap_or(&empty);
        let json_str =
            serde_json::to_string(section_data).map_err(|e| format!("serialize {section}: {e}"))?;

        conn.execute(
            "INSERT INTO menu_cache (id, cache_key, data, version, updated_at)
             VALUES (lower(hex(randomblob(16))), ?1, ?2, ?3, datetime('now'))
             ON CONFLICT(cache_key) DO UPDATE SET
                data = excluded.data,
                version = excluded.version,
                updated_at = excluded.updated_at",
            params![*section, json_str, version],
        )
        .map_err(|e| format!("upsert menu_cache[{section}]: {e}"))?;
    }

    trace!(
        version = %version,
        categories = category_count,
        items = item_count,
        "menu sync: cache updated"
    );

    Ok(serde_json::json!({
        "success": true,
        "updated": true,
        "version": version,
        "counts": counts,
        "timestamp": timestamp
    }))
}
