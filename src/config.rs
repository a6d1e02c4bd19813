//! Engine tunables persisted in `local_settings` under the `engine` category.
//!
//! Missing or malformed keys fall back to their defaults with a warning, so a
//! damaged settings row never prevents the engine from starting.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::db::{self, DbState};
use crate::error::PosResult;
use crate::models::LOW_STOCK_THRESHOLD;

const CATEGORY: &str = "engine";

/// Liquids are approximated at 1 ml per gram unless overridden.
pub const DEFAULT_ML_PER_GRAM: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub sync_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_sync_retries: u32,
    pub sync_batch_size: u32,
    /// Upper bound (inclusive) of the LOW_STOCK band.
    pub low_stock_threshold: f64,
    /// An ingredient with fewer than this many servings on hand is flagged.
    pub low_stock_servings: f64,
    pub ml_per_gram: f64,
    pub default_size: String,
    pub cashier_id: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 15,
            request_timeout_secs: 10,
            max_sync_retries: 5,
            sync_batch_size: 50,
            low_stock_threshold: LOW_STOCK_THRESHOLD,
            low_stock_servings: 10.0,
            ml_per_gram: DEFAULT_ML_PER_GRAM,
            default_size: "Regular".to_string(),
            cashier_id: 1,
        }
    }
}

fn read_or<T: FromStr>(conn: &Connection, key: &str, default: T) -> T {
    match db::get_setting(conn, CATEGORY, key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "Malformed engine setting, using default");
                default
            }
        },
    }
}

impl EngineConfig {
    pub fn load(conn: &Connection) -> Self {
        let d = Self::default();
        let mut cfg = Self {
            sync_interval_secs: read_or(conn, "sync_interval_secs", d.sync_interval_secs),
            request_timeout_secs: read_or(conn, "request_timeout_secs", d.request_timeout_secs),
            max_sync_retries: read_or(conn, "max_sync_retries", d.max_sync_retries),
            sync_batch_size: read_or(conn, "sync_batch_size", d.sync_batch_size),
            low_stock_threshold: read_or(conn, "low_stock_threshold", d.low_stock_threshold),
            low_stock_servings: read_or(conn, "low_stock_servings", d.low_stock_servings),
            ml_per_gram: read_or(conn, "ml_per_gram", d.ml_per_gram),
            default_size: read_or(conn, "default_size", d.default_size.clone()),
            cashier_id: read_or(conn, "cashier_id", d.cashier_id),
        };

        // Values that would stall the loop or divide by zero.
        if cfg.sync_interval_secs == 0 {
            warn!("sync_interval_secs must be positive, using default");
            cfg.sync_interval_secs = d.sync_interval_secs;
        }
        if cfg.request_timeout_secs == 0 {
            warn!("request_timeout_secs must be positive, using default");
            cfg.request_timeout_secs = d.request_timeout_secs;
        }
        if cfg.sync_batch_size == 0 {
            cfg.sync_batch_size = d.sync_batch_size;
        }
        if cfg.max_sync_retries == 0 {
            cfg.max_sync_retries = d.max_sync_retries;
        }
        if !(cfg.ml_per_gram.is_finite() && cfg.ml_per_gram > 0.0) {
            warn!(value = cfg.ml_per_gram, "ml_per_gram must be positive, using default");
            cfg.ml_per_gram = d.ml_per_gram;
        }
        if cfg.default_size.trim().is_empty() {
            cfg.default_size = d.default_size;
        }
        cfg
    }

    pub fn load_from(db: &DbState) -> PosResult<Self> {
        let conn = db.conn.lock()?;
        Ok(Self::load(&conn))
    }

    pub fn save(&self, conn: &Connection) -> PosResult<()> {
        let pairs: [(&str, String); 9] = [
            ("sync_interval_secs", self.sync_interval_secs.to_string()),
            ("request_timeout_secs", self.request_timeout_secs.to_string()),
            ("max_sync_retries", self.max_sync_retries.to_string()),
            ("sync_batch_size", self.sync_batch_size.to_string()),
            ("low_stock_threshold", self.low_stock_threshold.to_string()),
            ("low_stock_servings", self.low_stock_servings.to_string()),
            ("ml_per_gram", self.ml_per_gram.to_string()),
            ("default_size", self.default_size.clone()),
            ("cashier_id", self.cashier_id.to_string()),
        ];
        for (key, value) in pairs.iter() {
            db::set_setting(conn, CATEGORY, key, value)?;
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
