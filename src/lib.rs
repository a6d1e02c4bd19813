//! Cafe POS engine: offline-first order fulfillment with recipe-based
//! inventory deduction.
//!
//! Every foreground operation (placing an order, adjusting stock, checking
//! availability) runs against the local SQLite store and never waits on the
//! network. Two background tasks run next to it: the sync loop drains the
//! pending-sync queue to the backend, and the change propagator keeps the
//! menu availability board current as stock moves.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod api;
pub mod availability;
pub mod catalog;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod ledger;
pub mod models;
pub mod orders;
pub mod propagator;
pub mod queue;
pub mod recipes;
pub mod storage;
pub mod sync;
pub mod units;

use availability::{AvailabilityEvaluator, AvailabilityReport};
use catalog::{CatalogSeed, ImportReport};
use config::EngineConfig;
use db::DbState;
use error::PosResult;
use ledger::{StockChange, StockSummary};
use models::{OrderRequest, PlacedOrder};
use propagator::{AvailabilityBoard, ChangePropagator, StockChangeNotifier};
use sync::{DrainReport, RemoteBackend, SyncPolicy, SyncState, SyncStatus};

/// Handle to a running engine. Dropping it without [`Engine::shutdown`]
/// leaves the background tasks running until the runtime stops.
pub struct Engine {
    db: Arc<DbState>,
    sync_db: Arc<DbState>,
    config: EngineConfig,
    notifier: StockChangeNotifier,
    board: watch::Receiver<AvailabilityBoard>,
    catalog_signal: Arc<Notify>,
    backend: Arc<dyn RemoteBackend>,
    sync_state: Arc<SyncState>,
    policy: SyncPolicy,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Open the store under `data_dir` and spawn the background tasks.
    /// Must be called from inside a Tokio runtime.
    pub fn start(data_dir: &Path, backend: Arc<dyn RemoteBackend>) -> PosResult<Self> {
        let db = Arc::new(db::init(data_dir)?);
        let config = EngineConfig::load_from(&db)?;
        // The background actors get their own connections to the same file.
        let sync_db = Arc::new(db::open(data_dir)?);
        let propagator_db = Arc::new(db::open(data_dir)?);

        let cancel = CancellationToken::new();
        let (notifier, changes) = propagator::stock_channel();

        let mut propagator = ChangePropagator::new(propagator_db, &config);
        let items = propagator.refresh_all()?;
        let board = propagator.subscribe();
        let catalog_signal = propagator.catalog_signal();
        let propagator_task = tokio::spawn(propagator.run(changes, cancel.clone()));

        let policy = SyncPolicy::from_config(&config);
        let sync_state = Arc::new(SyncState::default());
        let sync_task = sync::start_sync_loop(
            Arc::clone(&sync_db),
            Arc::clone(&backend),
            Arc::clone(&sync_state),
            policy,
            cancel.clone(),
        );

        info!(
            data_dir = %data_dir.display(),
            menu_items = items,
            "Engine started"
        );

        Ok(Self {
            db,
            sync_db,
            config,
            notifier,
            board,
            catalog_signal,
            backend,
            sync_state,
            policy,
            cancel,
            tasks: vec![propagator_task, sync_task],
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn db(&self) -> &DbState {
        &self.db
    }

    /// Record a sale, deduct its ingredients and queue it for the backend.
    pub fn place_order(&self, request: &OrderRequest) -> PosResult<PlacedOrder> {
        let placed = orders::process_order(&self.db, &self.config, &self.notifier, request)?;
        self.sync_state.wake();
        Ok(placed)
    }

    pub fn adjust_stock(&self, product_id: i64, delta: f64) -> PosResult<StockChange> {
        let change = ledger::adjust_stock(
            &self.db,
            &self.notifier,
            product_id,
            delta,
            self.config.low_stock_threshold,
        )?;
        self.sync_state.wake();
        Ok(change)
    }

    /// On-demand availability check. `None` uses the configured default size.
    pub fn evaluate(&self, menu_item_id: i64, size: Option<&str>) -> PosResult<AvailabilityReport> {
        let size = size.unwrap_or(self.config.default_size.as_str());
        let conn = self.db.conn.lock()?;
        AvailabilityEvaluator::from_config(&self.config).evaluate(&conn, menu_item_id, size)
    }

    pub fn evaluate_add_on(
        &self,
        menu_item_id: i64,
        size: Option<&str>,
        add_on_name: &str,
    ) -> PosResult<AvailabilityReport> {
        let size = size.unwrap_or(self.config.default_size.as_str());
        let conn = self.db.conn.lock()?;
        AvailabilityEvaluator::from_config(&self.config).evaluate_add_on(
            &conn,
            menu_item_id,
            size,
            add_on_name,
        )
    }

    /// Import a catalog seed and have the propagator rebuild its index.
    pub fn import_catalog(&self, seed: &CatalogSeed) -> PosResult<ImportReport> {
        let report = catalog::import_catalog(&self.db, seed)?;
        if !report.skipped {
            self.catalog_signal.notify_one();
        }
        Ok(report)
    }

    pub fn stock_summary(&self) -> PosResult<StockSummary> {
        let conn = self.db.conn.lock()?;
        ledger::stock_summary(&conn)
    }

    /// Live availability board, updated by the propagator task.
    pub fn subscribe(&self) -> watch::Receiver<AvailabilityBoard> {
        self.board.clone()
    }

    pub async fn force_sync(&self) -> PosResult<DrainReport> {
        sync::force_sync(
            &self.sync_db,
            self.backend.as_ref(),
            &self.sync_state,
            &self.policy,
        )
        .await
    }

    pub fn sync_status(&self) -> PosResult<SyncStatus> {
        sync::sync_status(&self.sync_db, &self.sync_state)
    }

    pub fn health(&self) -> PosResult<diagnostics::HealthReport> {
        diagnostics::health_report(&self.db)
    }

    /// Stop both background tasks and wait for them to finish.
    pub async fn shutdown(self) {
        info!("Shutting down engine");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::milk_tea_seed;
    use crate::error::RemoteError;
    use crate::models::{CreateSaleRequest, LineItem, StockAdjustmentRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingBackend {
        reachable: AtomicBool,
        sales: AtomicUsize,
        adjustments: AtomicUsize,
    }

    #[async_trait]
    impl RemoteBackend for RecordingBackend {
        async fn is_reachable(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }

        async fn create_sale(&self, _sale: &CreateSaleRequest) -> Result<(), RemoteError> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(RemoteError::Network("offline".into()));
            }
            self.sales.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn adjust_stock(&self, _adj: &StockAdjustmentRequest) -> Result<(), RemoteError> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(RemoteError::Network("offline".into()));
            }
            self.adjustments.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn milk_tea_order() -> OrderRequest {
        OrderRequest {
            customer_name: "Walk-in".into(),
            payment_method: "cash".into(),
            items: vec![LineItem {
                product_id: 1,
                product_name: "Classic Milk Tea".into(),
                quantity: 2,
                unit_price: 120.0,
                subtotal: 240.0,
                size: None,
                add_ons: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn test_offline_order_flow_then_sync() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let engine = Engine::start(dir.path(), backend.clone()).unwrap();
        let mut board = engine.subscribe();

        engine.import_catalog(&milk_tea_seed(300.0, 200.0, 200.0)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), board.changed())
            .await
            .expect("catalog refresh in time")
            .unwrap();
        assert!(board.borrow_and_update()[&1].available);

        // Offline: the sale still completes locally.
        let placed = engine.place_order(&milk_tea_order()).unwrap();
        assert_eq!(placed.deductions_applied, 3);
        assert_eq!(placed.deductions_failed, 0);

        // Two cups use all 300 ml of Tea.
        tokio::time::timeout(Duration::from_secs(5), board.changed())
            .await
            .expect("board update in time")
            .unwrap();
        let current = board.borrow_and_update()[&1].clone();
        assert!(!current.available);
        assert_eq!(current.missing_ingredients_text, "Tea");

        let report = engine.force_sync().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(engine.sync_status().unwrap().pending, 1);

        backend.reachable.store(true, Ordering::SeqCst);
        let report = engine.force_sync().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(backend.sales.load(Ordering::SeqCst), 1);
        assert_eq!(engine.sync_status().unwrap().pending, 0);

        let health = engine.health().unwrap();
        assert_eq!(health.pending_sync, 0);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_adjust_stock_and_evaluate_through_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::start(dir.path(), Arc::new(sync::OfflineBackend)).unwrap();
        engine.import_catalog(&milk_tea_seed(100.0, 200.0, 200.0)).unwrap();

        let report = engine.evaluate(1, None).unwrap();
        assert_eq!(report.size, "Regular");
        assert!(!report.available);

        let change = engine.adjust_stock(10001, 400.0).unwrap();
        assert_eq!(change.new_quantity, 500.0);
        assert!(engine.evaluate(1, Some("Large")).unwrap().available);
        assert_eq!(
            engine.stock_summary().unwrap().message,
            "All stocks are in good condition."
        );
        assert_eq!(engine.sync_status().unwrap().pending, 1);

        engine.shutdown().await;
    }
}
