//! Local SQLite database layer for DinePOS.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the
//! `local_settings` key/value helpers, and the shared connection state used
//! across the session, checkout, and sync modules.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/pos.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("pos.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: core tables.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- orders
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_number TEXT,
            flow TEXT NOT NULL DEFAULT 'dine_in',
            customer_name TEXT,
            customer_phone TEXT,
            guest_count INTEGER,
            table_id TEXT,
            table_number TEXT,
            items TEXT NOT NULL DEFAULT '[]',
            subtotal REAL NOT NULL DEFAULT 0,
            tax_amount REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            tax_rate REAL,
            status TEXT NOT NULL DEFAULT 'pending',
            payment_method TEXT,
            remote_id TEXT,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- menu_cache
        CREATE TABLE IF NOT EXISTS menu_cache (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            cache_key TEXT UNIQUE NOT NULL,
            data TEXT NOT NULL,
            version TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_sync_status ON orders(sync_status);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: checkout idempotency and sync retry bookkeeping.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    if !column_exists(conn, "orders", "client_request_id")? {
        conn.execute("ALTER TABLE orders ADD COLUMN client_request_id TEXT", [])
            .map_err(|e| format!("migration v2 (client_request_id): {e}"))?;
    }
    if !column_exists(conn, "orders", "retry_count")? {
        conn.execute(
            "ALTER TABLE orders ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 0",
            [],
        )
        .map_err(|e| format!("migration v2 (retry_count): {e}"))?;
    }
    if !column_exists(conn, "orders", "last_error")? {
        conn.execute("ALTER TABLE orders ADD COLUMN last_error TEXT", [])
            .map_err(|e| format!("migration v2 (last_error): {e}"))?;
    }
    if !column_exists(conn, "orders", "last_synced_at")? {
        conn.execute("ALTER TABLE orders ADD COLUMN last_synced_at TEXT", [])
            .map_err(|e| format!("migration v2 (last_synced_at): {e}"))?;
    }

    conn.execute_batch(
        "
        CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_client_request_id
            ON orders(client_request_id) WHERE client_request_id IS NOT NULL;

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2");
    Ok(())
}

/// Migration v3: payment confirmation reference and remote lookup index.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    if !column_exists(conn, "orders", "payment_reference")? {
        conn.execute("ALTER TABLE orders ADD COLUMN payment_reference TEXT", [])
            .map_err(|e| format!("migration v3 (payment_reference): {e}"))?;
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_orders_remote_id ON orders(remote_id);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| format!("table_info {table}: {e}"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| format!("table_info {table}: {e}"))?;
    for name in names {
        if name.map_err(|e| e.to_string())? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read a single setting value. Returns `None` when absent.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings
         WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Upsert a single setting value.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set setting {category}/{key}: {e}"))?;
    Ok(())
}

/// Delete every setting in a category. Used by factory reset.
pub fn delete_settings(conn: &Connection, category: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )
    .map_err(|e| format!("delete settings {category}: {e}"))?;
    Ok(())
}

#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("test migrations");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        run_migrations(&conn).expect("migrations");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_db();
        let tables = table_names(&conn);
        for expected in ["local_settings", "orders", "menu_cache", "schema_version"] {
            assert!(
                tables.iter().any(|t| t == expected),
                "missing table {expected}"
            );
        }

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);

        // v2/v3 columns present
        assert!(column_exists(&conn, "orders", "client_request_id").unwrap());
        assert!(column_exists(&conn, "orders", "retry_count").unwrap());
        assert!(column_exists(&conn, "orders", "payment_reference").unwrap());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("second run");
        run_migrations(&conn).expect("third run");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_client_request_id_unique() {
        let conn = test_db();
        conn.execute(
            "INSERT INTO orders (id, client_request_id) VALUES ('a', 'req-1')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO orders (id, client_request_id) VALUES ('b', 'req-1')",
            [],
        );
        assert!(
            dup.is_err(),
            "duplicate client_request_id should be rejected"
        );

        // NULL request ids do not collide
        conn.execute("INSERT INTO orders (id) VALUES ('c')", [])
            .unwrap();
        conn.execute("INSERT INTO orders (id) VALUES ('d')", [])
            .unwrap();
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();

        assert_eq!(get_setting(&conn, "terminal", "tax_rate"), None);

        set_setting(&conn, "terminal", "tax_rate", "0.0525").expect("set");
        assert_eq!(
            get_setting(&conn, "terminal", "tax_rate").as_deref(),
            Some("0.0525")
        );

        set_setting(&conn, "terminal", "tax_rate", "0.08").expect("overwrite");
        assert_eq!(
            get_setting(&conn, "terminal", "tax_rate").as_deref(),
            Some("0.08")
        );

        delete_settings(&conn, "terminal").expect("delete");
        assert_eq!(get_setting(&conn, "terminal", "tax_rate"), None);
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = std::env::temp_dir().join(format!("dinepos-test-{}", std::process::id()));
        let state = init(&dir).expect("init file db");
        {
            let conn = state.conn.lock().unwrap();
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .unwrap();
            assert_eq!(mode.to_lowercase(), "wal");
        }
        drop(state);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
