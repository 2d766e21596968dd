//! POS server API client.
//!
//! Provides authenticated HTTP communication with the POS server, used for
//! order submission, order-list refresh, table status updates, menu sync,
//! and connectivity probes. The [`RemoteBackend`] trait is the seam the
//! checkout and sync paths depend on, so tests can run against a mock
//! instead of a network.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::info;

use crate::order::Order;
use crate::tables::TableStatus;
use crate::config::TerminalConfig;

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the POS server URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_server_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.is_empty() && !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Strip trailing slashes again (in case "/api/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Connect-code decoding
// ---------------------------------------------------------------------------

fn decode_connect_code_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_api_key_from_connect_code(raw: &str) -> Option<String> {
    decode_connect_code_payload(raw)
        .and_then(|v| {
            v.get("key")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_server_url_from_connect_code(raw: &str) -> Option<String> {
    decode_connect_code_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(normalize_server_url)
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_terminal_id_from_connect_code(raw: &str) -> Option<String> {
    decode_connect_code_payload(raw)
        .and_then(|v| {
            v.get("tid")
                .or_else(|| v.get("terminalId"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach POS server at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid POS server URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "POS server endpoint not found".to_string(),
        s if s >= 500 => format!("POS server error (HTTP {s})"),
        s => format!("Unexpected response from POS server (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Remote seam
// ---------------------------------------------------------------------------

/// Server acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAck {
    pub remote_id: String,
    pub status: Option<String>,
}

/// The remote operations the core depends on. Implemented by
/// [`ServerClient`] for production and by mocks in tests.
pub trait RemoteBackend: Send + Sync + 'static {
    /// `POST /api/pos/orders`: submit an order, returning the
    /// server-assigned id.
    fn submit_order(
        &self,
        order: &Order,
    ) -> impl Future<Output = Result<RemoteAck, String>> + Send;

    /// `GET /api/pos/orders`: fetch the order list in whatever envelope
    /// the server wraps it in (the normalizer absorbs the shape).
    fn fetch_orders(&self) -> impl Future<Output = Result<Value, String>> + Send;

    /// `PUT /api/pos/tables/:id`: update table occupancy.
    fn update_table(
        &self,
        table_id: &str,
        status: TableStatus,
    ) -> impl Future<Output = Result<(), String>> + Send;

    /// `GET /api/pos/menu-sync`: fetch the menu payload.
    fn fetch_menu(&self) -> impl Future<Output = Result<Value, String>> + Send;

    /// `HEAD /api/health`: lightweight connectivity probe.
    fn health_check(&self) -> impl Future<Output = bool> + Send;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Authenticated HTTP client for the POS server.
pub struct ServerClient {
    base_url: String,
    api_key: String,
    terminal_id: String,
    http: Client,
}

impl ServerClient {
    pub fn new(config: &TerminalConfig) -> Result<Self, String> {
        let base_url = normalize_server_url(&config.server_url);
        if base_url.is_empty() {
            return Err("POS server URL is not configured".into());
        }
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            base_url,
            api_key: config.api_key.trim().to_string(),
            terminal_id: config.terminal_id.trim().to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform an authenticated request against the server.
    ///
    /// `path` includes the leading slash, e.g. `/api/pos/orders`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, String> {
        let full_url = format!("{}{path}", self.base_url);

        let mut req = self
            .http
            .request(method, &full_url)
            .header("X-POS-API-Key", &self.api_key)
            .header("Content-Type", "application/json");
        if !self.terminal_id.is_empty() {
            req = req.header("x-terminal-id", &self.terminal_id);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();

        if !status.is_success() {
            // Preserve validation details for diagnostics and retry
            // classification.
            let body_text = resp.text().await.unwrap_or_default();
            let detail = if let Ok(json) = serde_json::from_str::<Value>(&body_text) {
                let message = json
                    .get("error")
                    .or_else(|| json.get("message"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| status_error(status));
                let details = json.get("details").or_else(|| json.get("errors")).cloned();
                if let Some(details) = details {
                    format!("{message} (HTTP {}): {}", status.as_u16(), details)
                } else {
                    format!("{message} (HTTP {})", status.as_u16())
                }
            } else if !body_text.trim().is_empty() {
                format!(
                    "{} (HTTP {}): {}",
                    status_error(status),
                    status.as_u16(),
                    body_text.trim()
                )
            } else {
                format!("{} (HTTP {})", status_error(status), status.as_u16())
            };
            return Err(detail);
        }

        // Return the JSON body, or null for empty 204 responses.
        let body_text = resp.text().await.unwrap_or_default();
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| format!("Invalid JSON from POS server: {e}"))
    }
}

/// Serialize an order into the canonical submission payload. New producers
/// emit this one shape; only foreign data goes through the normalizer.
fn order_payload(order: &Order) -> Value {
    let table = order.customer.table.as_ref();
    serde_json::json!({
        "clientRequestId": order.id,
        "orderNumber": order.order_number,
        "flow": order.flow.as_str(),
        "customerName": order.customer.name,
        "customerPhone": order.customer.phone,
        "guestCount": order.customer.guest_count,
        "tableId": table.map(|t| t.id.clone()),
        "tableNumber": table.map(|t| t.table_number.clone()),
        "items": order.items,
        "subtotal": order.bills.subtotal,
        "tax": order.bills.tax,
        "total": order.bills.total,
        "taxRate": order.tax_rate,
        "status": order.status.as_str(),
        "paymentMethod": order.payment_method,
        "paymentReference": order.payment_reference,
        "createdAt": order.created_at,
    })
}

impl RemoteBackend for ServerClient {
    fn submit_order(
        &self,
        order: &Order,
    ) -> impl Future<Output = Result<RemoteAck, String>> + Send {
        async move {
            let resp = self
                .request(Method::POST, "/api/pos/orders", Some(order_payload(order)))
                .await?;

            let remote_id = crate::value_str(&resp, &["id", "orderId", "order_id"])
                .or_else(|| {
                    resp.get("data")
                        .map(|d| crate::value_str(d, &["id", "orderId", "order_id"]))
                        .unwrap_or(None)
                })
                .or_else(|| {
                    resp.get("order")
                        .map(|o| crate::value_str(o, &["id"]))
                        .unwrap_or(None)
                })
                .ok_or("POS server response is missing the order id")?;

            let status = crate::value_str(&resp, &["status"]);
            info!(remote_id = %remote_id, "Order accepted by POS server");
            Ok(RemoteAck { remote_id, status })
        }
    }

    fn fetch_orders(&self) -> impl Future<Output = Result<Value, String>> + Send {
        self.request(Method::GET, "/api/pos/orders", None)
    }

    fn update_table(
        &self,
        table_id: &str,
        status: TableStatus,
    ) -> impl Future<Output = Result<(), String>> + Send {
        async move {
            let path = format!("/api/pos/tables/{table_id}");
            let body = serde_json::json!({ "status": status.as_str() });
            self.request(Method::PUT, &path, Some(body)).await?;
            Ok(())
        }
    }

    fn fetch_menu(&self) -> impl Future<Output = Result<Value, String>> + Send {
        self.request(Method::GET, "/api/pos/menu-sync", None)
    }

    fn health_check(&self) -> impl Future<Output = bool> + Send {
        async move {
            let health_url = format!("{}/api/health", self.base_url);
            match self
                .http
                .head(&health_url)
                .header("X-POS-API-Key", &self.api_key)
                .timeout(HEALTH_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) => resp.status().is_success(),
                Err(_) => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_server_url_handles_common_inputs() {
        assert_eq!(
            normalize_server_url("pos.example.com"),
            "https://pos.example.com"
        );
        assert_eq!(
            normalize_server_url("https://pos.example.com/"),
            "https://pos.example.com"
        );
        assert_eq!(
            normalize_server_url("https://pos.example.com/api/"),
            "https://pos.example.com"
        );
        assert_eq!(
            normalize_server_url("localhost:3000"),
            "http://localhost:3000"
        );
        assert_eq!(normalize_server_url("   "), "");
    }

    #[test]
    fn connect_code_round_trips_base64url() {
        let payload = serde_json::json!({
            "url": "pos.example.com",
            "key": "key-abc123",
            "tid": "terminal-7"
        });
        let encoded = BASE64_STANDARD
            .encode(payload.to_string())
            .replace('+', "-")
            .replace('/', "_")
            .replace('=', "");

        assert_eq!(
            extract_server_url_from_connect_code(&encoded).as_deref(),
            Some("https://pos.example.com")
        );
        assert_eq!(
            extract_api_key_from_connect_code(&encoded).as_deref(),
            Some("key-abc123")
        );
        assert_eq!(
            extract_terminal_id_from_connect_code(&encoded).as_deref(),
            Some("terminal-7")
        );
    }

    #[test]
    fn connect_code_accepts_plain_json() {
        let raw = r#"{"url": "https://pos.example.com", "key": "k1"}"#;
        assert_eq!(
            extract_api_key_from_connect_code(raw).as_deref(),
            Some("k1")
        );
        assert_eq!(extract_terminal_id_from_connect_code(raw), None);
    }

    #[test]
    fn connect_code_rejects_garbage() {
        assert_eq!(extract_api_key_from_connect_code(""), None);
        assert_eq!(extract_api_key_from_connect_code("short"), None);
        assert_eq!(
            extract_api_key_from_connect_code("definitely-not-base64!!!"),
            None
        );
    }

    #[test]
    fn status_error_maps_auth_and_server_codes() {
        assert!(status_error(StatusCode::UNAUTHORIZED).contains("API key"));
        assert!(status_error(StatusCode::FORBIDDEN).contains("not authorized"));
        assert!(status_error(StatusCode::INTERNAL_SERVER_ERROR).contains("HTTP 500"));
        assert!(status_error(StatusCode::IM_A_TEAPOT).contains("HTTP 418"));
    }

    #[test]
    fn order_payload_carries_snapshot_fields() {
        let order = crate::checkout::test_support::sample_order();
        let payload = order_payload(&order);

        assert_eq!(
            payload.get("clientRequestId").and_then(Value::as_str),
            Some(order.id.as_str())
        );
        assert_eq!(
            payload.get("total").and_then(Value::as_f64),
            Some(order.bills.total)
        );
        assert_eq!(
            payload
                .get("items")
                .and_then(Value::as_array)
                .map(|a| a.len()),
            Some(order.items.len())
        );
        assert_eq!(
            payload.get("status").and_then(Value::as_str),
            Some("pending")
        );
    }
}
