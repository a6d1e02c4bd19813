use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use cafe_pos_lib::api::HttpBackend;
use cafe_pos_lib::catalog::CatalogSeed;
use cafe_pos_lib::config::EngineConfig;
use cafe_pos_lib::storage::BackendCredentials;
use cafe_pos_lib::sync::{OfflineBackend, RemoteBackend};
use cafe_pos_lib::{db, diagnostics, storage, Engine};

const DEFAULT_DATA_DIR: &str = "./pos-data";

fn data_dir() -> PathBuf {
    std::env::var_os("CAFE_POS_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Engine settings as persisted in the store, read before anything that
/// depends on them is built.
fn load_config(data_dir: &Path) -> anyhow::Result<EngineConfig> {
    let store = db::init(data_dir).context("opening store")?;
    EngineConfig::load_from(&store).context("loading engine settings")
}

fn http_backend(creds: &BackendCredentials, config: &EngineConfig) -> anyhow::Result<HttpBackend> {
    HttpBackend::new(&creds.backend_url, &creds.api_key, config.request_timeout())
        .context("building backend client")
}

fn backend(config: &EngineConfig) -> anyhow::Result<Arc<dyn RemoteBackend>> {
    match storage::backend_credentials() {
        Some(creds) => {
            let http = http_backend(&creds, config)?;
            info!(
                backend_url = %http.base_url(),
                timeout_secs = config.request_timeout_secs,
                "Using backend"
            );
            Ok(Arc::new(http))
        }
        None => {
            warn!("No backend credentials stored; running offline, sales stay queued");
            Ok(Arc::new(OfflineBackend))
        }
    }
}

fn load_seed(path: &Path) -> anyhow::Result<CatalogSeed> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading catalog seed {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing catalog seed {}", path.display()))
}

/// One-shot credential commands. Returns `true` when a command ran.
fn run_credential_command(args: &[String]) -> anyhow::Result<bool> {
    match args.first().map(String::as_str) {
        Some("configure") => {
            let (Some(url), Some(key)) = (args.get(1), args.get(2)) else {
                anyhow::bail!("usage: cafe-pos configure <backend-url> <api-key>");
            };
            storage::store_backend_credentials(url, key).context("storing credentials")?;
            info!("Backend credentials stored");
            Ok(true)
        }
        Some("reset-credentials") => {
            storage::clear_credentials().context("clearing credentials")?;
            info!("Backend credentials cleared");
            Ok(true)
        }
        Some(other) => anyhow::bail!("unknown command: {other}"),
        None => Ok(false),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = data_dir();
    diagnostics::init_tracing(&data_dir);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if run_credential_command(&args)? {
        return Ok(());
    }

    info!("Starting Cafe POS v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&data_dir)?;
    let engine = Engine::start(&data_dir, backend(&config)?).context("starting engine")?;

    if let Some(seed_path) = std::env::var_os("CAFE_POS_CATALOG").map(PathBuf::from) {
        let seed = load_seed(&seed_path)?;
        let report = engine.import_catalog(&seed).context("importing catalog")?;
        info!(
            version = report.version,
            skipped = report.skipped,
            inserted = report.products_inserted,
            updated = report.products_updated,
            recipes = report.recipes_saved,
            "Catalog import finished"
        );
    }

    let summary = engine.stock_summary().context("reading stock summary")?;
    info!("{}", summary.message);

    let mut board = engine.subscribe();
    let watcher = tokio::spawn(async move {
        while board.changed().await.is_ok() {
            let unavailable: Vec<i64> = board
                .borrow_and_update()
                .iter()
                .filter(|(_, a)| !a.available)
                .map(|(id, _)| *id)
                .collect();
            if !unavailable.is_empty() {
                warn!(?unavailable, "Menu items unavailable");
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    watcher.abort();
    engine.shutdown().await;
    info!("Cafe POS stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_client_uses_persisted_timeout() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = db::init(dir.path()).unwrap();
            let cfg = EngineConfig {
                request_timeout_secs: 3,
                ..EngineConfig::default()
            };
            cfg.save(&store.conn.lock().unwrap()).unwrap();
        }

        let config = load_config(dir.path()).unwrap();
        let creds = BackendCredentials {
            backend_url: "https://pos.example.com".into(),
            api_key: "secret".into(),
        };
        let http = http_backend(&creds, &config).unwrap();
        assert_eq!(http.timeout(), std::time::Duration::from_secs(3));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(run_credential_command(&["frobnicate".to_string()]).is_err());
        assert!(!run_credential_command(&[]).unwrap());
    }
}
