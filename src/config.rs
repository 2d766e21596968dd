//! Terminal configuration: server credentials, tax rate, checkout policy.
//!
//! Everything lives in the `local_settings` table so a terminal keeps its
//! setup across restarts. The tax rate is deliberately one knob: upstream
//! deployments disagree on the value (5.25% vs 8%), so the default is a
//! constant here and operators override it per terminal.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api;
use crate::db::{self, DbState};
use crate::order::OrderFlow;
use crate::tables::CustomerContext;

/// Settings category for terminal credentials and operator knobs.
pub const CATEGORY_TERMINAL: &str = "terminal";
/// Settings category for client-side mirrors (cart, counters).
pub const CATEGORY_LOCAL: &str = "local";
/// Settings category for order bookkeeping (sequential counter).
pub const CATEGORY_ORDERS: &str = "orders";

/// Tax rate applied when no override is stored.
pub const DEFAULT_TAX_RATE: f64 = 0.0525;

/// Read the effective tax rate. Falls back to [`DEFAULT_TAX_RATE`] when the
/// stored value is absent or unparseable.
pub fn tax_rate(db: &DbState) -> f64 {
    let stored = db
        .conn
        .lock()
        .ok()
        .and_then(|conn| db::get_setting(&conn, CATEGORY_TERMINAL, "tax_rate"));
    stored
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|rate| rate.is_finite() && (0.0..1.0).contains(rate))
        .unwrap_or(DEFAULT_TAX_RATE)
}

/// Persist a tax-rate override. Rates are fractions, not percentages.
pub fn set_tax_rate(db: &DbState, rate: f64) -> Result<(), String> {
    if !rate.is_finite() || !(0.0..1.0).contains(&rate) {
        return Err(format!("tax rate must be in [0, 1), got {rate}"));
    }
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::set_setting(&conn, CATEGORY_TERMINAL, "tax_rate", &rate.to_string())
}

/// Credentials for the POS server API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalConfig {
    pub server_url: String,
    pub api_key: String,
    pub terminal_id: String,
}

/// Load the stored terminal credentials. `None` until both the server URL
/// and API key are present.
pub fn terminal_config(db: &DbState) -> Option<TerminalConfig> {
    let conn = db.conn.lock().ok()?;
    let server_url = db::get_setting(&conn, CATEGORY_TERMINAL, "server_url")?;
    let api_key = db::get_setting(&conn, CATEGORY_TERMINAL, "api_key")?;
    if server_url.trim().is_empty() || api_key.trim().is_empty() {
        return None;
    }
    let terminal_id =
        db::get_setting(&conn, CATEGORY_TERMINAL, "terminal_id").unwrap_or_default();
    Some(TerminalConfig {
        server_url: api::normalize_server_url(&server_url),
        api_key: api_key.trim().to_string(),
        terminal_id: terminal_id.trim().to_string(),
    })
}

/// The terminal is considered configured once credentials are stored.
pub fn is_configured(db: &DbState) -> bool {
    terminal_config(db).is_some()
}

/// Persist terminal credentials received during onboarding.
pub fn store_terminal_config(db: &DbState, config: &TerminalConfig) -> Result<(), String> {
    let normalized = api::normalize_server_url(&config.server_url);
    if normalized.trim().is_empty() {
        return Err("server URL cannot be empty".into());
    }
    if config.api_key.trim().is_empty() {
        return Err("API key cannot be empty".into());
    }
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::set_setting(&conn, CATEGORY_TERMINAL, "server_url", &normalized)?;
    db::set_setting(&conn, CATEGORY_TERMINAL, "api_key", config.api_key.trim())?;
    db::set_setting(
        &conn,
        CATEGORY_TERMINAL,
        "terminal_id",
        config.terminal_id.trim(),
    )?;
    info!("Terminal credentials stored");
    Ok(())
}

/// Decode a pasted connect code (base64url JSON `{url, key, tid}`) and
/// persist the credentials it carries.
pub fn store_connect_code(db: &DbState, raw: &str) -> Result<TerminalConfig, String> {
    let server_url = api::extract_server_url_from_connect_code(raw)
        .ok_or("Connect code is missing the server URL")?;
    let api_key =
        api::extract_api_key_from_connect_code(raw).ok_or("Connect code is missing the API key")?;
    let terminal_id = api::extract_terminal_id_from_connect_code(raw).unwrap_or_default();

    let config = TerminalConfig {
        server_url,
        api_key,
        terminal_id,
    };
    store_terminal_config(db, &config)?;
    Ok(config)
}

/// Wipe terminal credentials (factory reset of the connection).
pub fn clear_terminal_config(db: &DbState) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::delete_settings(&conn, CATEGORY_TERMINAL)
}

// ---------------------------------------------------------------------------
// Checkout policy
// ---------------------------------------------------------------------------

/// Which customer fields a checkout flow insists on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRequirements {
    pub require_name: bool,
    pub require_phone: bool,
    pub require_table: bool,
    pub require_guest_count: bool,
}

impl CustomerRequirements {
    /// Names of the required fields absent from `customer`, in a stable
    /// order for user-facing messages.
    pub fn missing_fields(&self, customer: &CustomerContext) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.require_name && !customer.has_name() {
            missing.push("name");
        }
        if self.require_phone && !customer.has_phone() {
            missing.push("phone");
        }
        if self.require_table && !customer.has_table() {
            missing.push("table");
        }
        if self.require_guest_count && !customer.has_guest_count() {
            missing.push("guest count");
        }
        missing
    }
}

/// Per-flow customer requirements. Defaults: dine-in needs a table and a
/// guest count, delivery needs a name and phone, takeaway serves anonymous
/// walk-ins. All overridable; the policy is data, not logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutPolicy {
    pub dine_in: CustomerRequirements,
    pub takeaway: CustomerRequirements,
    pub delivery: CustomerRequirements,
}

impl Default for CheckoutPolicy {
    fn default() -> Self {
        Self {
            dine_in: CustomerRequirements {
                require_table: true,
                require_guest_count: true,
                ..CustomerRequirements::default()
            },
            takeaway: CustomerRequirements::default(),
            delivery: CustomerRequirements {
                require_name: true,
                require_phone: true,
                ..CustomerRequirements::default()
            },
        }
    }
}

impl CheckoutPolicy {
    pub fn requirements(&self, flow: OrderFlow) -> &CustomerRequirements {
        match flow {
            OrderFlow::DineIn => &self.dine_in,
            OrderFlow::Takeaway => &self.takeaway,
            OrderFlow::Delivery => &self.delivery,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::TableRef;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    #[test]
    fn tax_rate_defaults_then_honors_override() {
        let db = test_db();
        assert_eq!(tax_rate(&db), DEFAULT_TAX_RATE);

        set_tax_rate(&db, 0.08).expect("set tax rate");
        assert_eq!(tax_rate(&db), 0.08);
    }

    #[test]
    fn tax_rate_rejects_out_of_range_values() {
        let db = test_db();
        assert!(set_tax_rate(&db, -0.01).is_err());
        assert!(set_tax_rate(&db, 1.0).is_err());
        assert!(set_tax_rate(&db, f64::NAN).is_err());
        assert_eq!(tax_rate(&db), DEFAULT_TAX_RATE);
    }

    #[test]
    fn tax_rate_ignores_garbage_stored_value() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            crate::db::set_setting(&conn, CATEGORY_TERMINAL, "tax_rate", "lots").unwrap();
        }
        assert_eq!(tax_rate(&db), DEFAULT_TAX_RATE);
    }

    #[test]
    fn terminal_config_requires_url_and_key() {
        let db = test_db();
        assert!(terminal_config(&db).is_none());
        assert!(!is_configured(&db));

        store_terminal_config(
            &db,
            &TerminalConfig {
                server_url: "pos.example.com".into(),
                api_key: "key-123".into(),
                terminal_id: "t-1".into(),
            },
        )
        .expect("store config");

        let loaded = terminal_config(&db).expect("config present");
        assert_eq!(loaded.server_url, "https://pos.example.com");
        assert_eq!(loaded.api_key, "key-123");
        assert!(is_configured(&db));

        clear_terminal_config(&db).expect("clear");
        assert!(!is_configured(&db));
    }

    #[test]
    fn connect_code_onboards_terminal() {
        let db = test_db();
        let raw = r#"{"url": "pos.example.com", "key": "key-1", "tid": "t-9"}"#;

        let config = store_connect_code(&db, raw).expect("store connect code");
        assert_eq!(config.server_url, "https://pos.example.com");
        assert_eq!(config.terminal_id, "t-9");
        assert_eq!(terminal_config(&db), Some(config));

        assert!(store_connect_code(&db, "not a connect code").is_err());
    }

    #[test]
    fn default_policy_matches_flows() {
        let policy = CheckoutPolicy::default();
        let anonymous = CustomerContext::default();

        assert_eq!(
            policy
                .requirements(OrderFlow::DineIn)
                .missing_fields(&anonymous),
            vec!["table", "guest count"]
        );
        assert!(policy
            .requirements(OrderFlow::Takeaway)
            .missing_fields(&anonymous)
            .is_empty());
        assert_eq!(
            policy
                .requirements(OrderFlow::Delivery)
                .missing_fields(&anonymous),
            vec!["name", "phone"]
        );

        let seated = CustomerContext {
            guest_count: Some(3),
            table: Some(TableRef {
                id: "tbl-2".into(),
                table_number: "2".into(),
            }),
            ..CustomerContext::default()
        };
        assert!(policy
            .requirements(OrderFlow::DineIn)
            .missing_fields(&seated)
            .is_empty());
    }
}
