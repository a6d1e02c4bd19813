//! Local SQLite database layer for the POS engine.
//!
//! Uses rusqlite with WAL mode so readers never block the writer. Provides
//! schema migrations, settings helpers, and the shared [`DbState`] handle
//! that every other module borrows.

use rusqlite::{params, Connection, ErrorCode};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{PosError, PosResult};

/// Shared database handle. One connection per `DbState`; several states may
/// point at the same file (each write path takes an IMMEDIATE transaction).
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/pos.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. Only a file SQLite reports as corrupt
/// or not a database is deleted and recreated; every other open failure
/// (a busy or locked file included) is returned to the caller.
pub fn init(data_dir: &Path) -> PosResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| PosError::Config(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("pos.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) if is_corruption(&first_err) => {
            warn!(
                "Database file is unreadable ({}), deleting and recreating",
                first_err
            );
            remove_db_files(&db_path);
            open_and_configure(&db_path)?
        }
        Err(e) => {
            error!("Database open failed: {e}");
            return Err(e);
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open another connection to a store that [`init`] already prepared.
/// Never deletes or migrates anything.
pub fn open(data_dir: &Path) -> PosResult<DbState> {
    let db_path = data_dir.join("pos.db");
    let conn = open_and_configure(&db_path)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

fn is_corruption(err: &PosError) -> bool {
    matches!(
        err,
        PosError::Storage(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

fn remove_db_files(db_path: &Path) {
    for path in [
        db_path.to_path_buf(),
        db_path.with_extension("db-wal"),
        db_path.with_extension("db-shm"),
    ] {
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {e}", path.display());
            }
        }
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> PosResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA busy_timeout = 5000;
         PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

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

/// Migration v1: settings, catalog and recipes.
fn migrate_v1(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- Raw materials (id >= 10000) and menu items share one table.
        CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT '',
            cost REAL NOT NULL DEFAULT 0,
            price REAL NOT NULL DEFAULT 0,
            quantity REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'IN_STOCK'
                CHECK (status IN ('IN_STOCK', 'LOW_STOCK', 'OUT_OF_STOCK')),
            version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_products_name ON products(name);

        -- One row per size variant; the recipe body is a JSON document.
        CREATE TABLE IF NOT EXISTS recipes (
            menu_item_id INTEGER NOT NULL,
            recipe_name TEXT NOT NULL,
            document TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (menu_item_id, recipe_name)
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("migrate_v1 failed: {e}");
        PosError::Storage(e)
    })?;

    info!("Applied migration v1 (settings, products, recipes)");
    Ok(())
}

/// Migration v2: sales, sale items and the deduction audit trail.
fn migrate_v2(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            cashier_id INTEGER NOT NULL,
            sale_date TEXT NOT NULL,
            total_amount REAL NOT NULL,
            customer_name TEXT NOT NULL DEFAULT '',
            order_number TEXT NOT NULL,
            payment_method TEXT NOT NULL DEFAULT 'cash',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        -- Not UNIQUE: a fallback number may repeat and must not abort a sale.
        CREATE INDEX IF NOT EXISTS idx_sales_order_number ON sales(order_number);
        CREATE INDEX IF NOT EXISTS idx_sales_date ON sales(sale_date);

        CREATE TABLE IF NOT EXISTS sale_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sale_id TEXT NOT NULL REFERENCES sales(id) ON DELETE CASCADE,
            product_id INTEGER NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            price REAL NOT NULL,
            subtotal REAL NOT NULL,
            size TEXT,
            product_name TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sale_items_sale ON sale_items(sale_id);

        -- Append-only. Rows are never updated.
        CREATE TABLE IF NOT EXISTS ingredient_deductions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sale_id TEXT NOT NULL,
            sale_item_id INTEGER NOT NULL,
            raw_material_id INTEGER NOT NULL,
            raw_material_name TEXT NOT NULL,
            quantity_deducted REAL NOT NULL,
            unit TEXT NOT NULL,
            menu_item_id INTEGER NOT NULL,
            menu_item_name TEXT NOT NULL,
            size_variant TEXT,
            add_ons TEXT,
            deducted_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE INDEX IF NOT EXISTS idx_deductions_sale ON ingredient_deductions(sale_id);
        CREATE INDEX IF NOT EXISTS idx_deductions_raw ON ingredient_deductions(raw_material_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("migrate_v2 failed: {e}");
        PosError::Storage(e)
    })?;

    info!("Applied migration v2 (sales, sale_items, ingredient_deductions)");
    Ok(())
}

/// Migration v3: durable outbound sync queue.
fn migrate_v3(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pending_sync (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("migrate_v3 failed: {e}");
        PosError::Storage(e)
    })?;

    info!("Applied migration v3 (pending_sync)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> PosResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Delete all settings in a category.
pub fn delete_all_settings(conn: &Connection, category: &str) -> PosResult<()> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory, fully migrated state for unit tests across modules.
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
