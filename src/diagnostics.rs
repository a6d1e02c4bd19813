//! Logging setup and health snapshot.
//!
//! Provides:
//! - **Tracing setup**: console plus daily rolling file under `<data_dir>/logs`
//! - **Log rotation helpers**: prune old `pos.*` files at startup
//! - **Health snapshot**: schema version, sync backlog, database size, stock bands

use rusqlite::Connection;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::db::DbState;
use crate::error::PosResult;
use crate::ledger;
use crate::queue;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

const LOG_FILE_PREFIX: &str = "pos";
const DEFAULT_FILTER: &str = "info,cafe_pos_lib=debug";

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
/// Returns how many files were removed.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| entry.path().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with("pos.") || n == "pos.log")
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(data_dir: &Path) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let dir = log_dir(data_dir);
    if let Err(e) = fs::create_dir_all(&dir) {
        eprintln!("Failed to create log directory {}: {e}", dir.display());
    }
    let pruned = prune_old_logs(&dir);

    let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if installed.is_ok() {
        // Dropping the guard flushes and stops the writer; the daemon runs
        // until process exit.
        std::mem::forget(guard);
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned old log files");
        }
    }
}

// ---------------------------------------------------------------------------
// Health snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub version: &'static str,
    pub schema_version: i32,
    pub pending_sync: i64,
    pub db_size_bytes: u64,
    pub out_of_stock: usize,
    pub low_stock: usize,
    pub stock_message: String,
}

fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

pub fn health_report(db: &DbState) -> PosResult<HealthReport> {
    let conn = db.conn.lock()?;
    let summary = ledger::stock_summary(&conn)?;
    Ok(HealthReport {
        version: env!("CARGO_PKG_VERSION"),
        schema_version: schema_version(&conn),
        pending_sync: queue::pending_count(&conn)?,
        db_size_bytes: fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0),
        out_of_stock: summary.out_of_stock,
        low_stock: summary.low_stock,
        stock_message: summary.message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::import_catalog;
    use crate::catalog::tests::milk_tea_seed;

    #[test]
    fn test_log_dir_lives_under_data_dir() {
        let data = Path::new("/var/lib/cafe-pos");
        assert_eq!(log_dir(data), PathBuf::from("/var/lib/cafe-pos/logs"));
    }

    #[test]
    fn test_prune_keeps_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=(MAX_LOG_FILES + 3) {
            fs::write(dir.path().join(format!("pos.2026-01-{day:02}")), "x").unwrap();
        }
        fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        assert_eq!(prune_old_logs(dir.path()), 3);
        let remaining = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, MAX_LOG_FILES + 1);
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(prune_old_logs(&dir.path().join("nope")), 0);
    }

    #[test]
    fn test_health_report_on_seeded_db() {
        let dir = tempfile::tempdir().unwrap();
        let state = crate::db::init(dir.path()).unwrap();
        import_catalog(&state, &milk_tea_seed(0.0, 3.0, 500.0)).unwrap();

        let report = health_report(&state).unwrap();
        assert_eq!(report.schema_version, crate::db::CURRENT_SCHEMA_VERSION);
        assert_eq!(report.pending_sync, 0);
        assert_eq!(report.out_of_stock, 1);
        assert_eq!(report.low_stock, 1);
        assert_eq!(report.stock_message, "1 items out of stock");
    }
}
