//! Sync coordinator: drains the pending-sync queue to the backend in the
//! background.
//!
//! Foreground writers only ever touch the local queue. This module owns every
//! remote call, each one bounded by a timeout. Network-class failures leave
//! the entry untouched; anything else counts against the retry ceiling.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::DbState;
use crate::error::{PosResult, RemoteError};
use crate::models::{
    CreateSaleRequest, PendingSyncOperation, StockAdjustmentRequest, SyncOperationKind,
};
use crate::queue::{self, FailureOutcome};

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// The remote system of record, one call per operation kind.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Cheap reachability probe.
    async fn is_reachable(&self) -> bool;

    async fn create_sale(&self, sale: &CreateSaleRequest) -> Result<(), RemoteError>;

    async fn adjust_stock(&self, adjustment: &StockAdjustmentRequest) -> Result<(), RemoteError>;
}

/// Used when no backend is configured. Every call is a network failure, so
/// the queue is kept intact until credentials appear.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineBackend;

#[async_trait]
impl RemoteBackend for OfflineBackend {
    async fn is_reachable(&self) -> bool {
        false
    }

    async fn create_sale(&self, _sale: &CreateSaleRequest) -> Result<(), RemoteError> {
        Err(RemoteError::Network("no backend configured".into()))
    }

    async fn adjust_stock(&self, _adjustment: &StockAdjustmentRequest) -> Result<(), RemoteError> {
        Err(RemoteError::Network("no backend configured".into()))
    }
}

// ---------------------------------------------------------------------------
// Sync engine state
// ---------------------------------------------------------------------------

const NETWORK_UNKNOWN: u8 = 0;
const NETWORK_DOWN: u8 = 1;
const NETWORK_UP: u8 = 2;

/// Shared state for the background sync loop.
pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub last_sync: Arc<std::sync::Mutex<Option<String>>>,
    network: AtomicU8,
    wake: Notify,
    /// Serializes drain passes from the loop and `force_sync`.
    drain_lock: tokio::sync::Mutex<()>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            last_sync: Arc::new(std::sync::Mutex::new(None)),
            network: AtomicU8::new(NETWORK_UNKNOWN),
            wake: Notify::new(),
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }
}

impl SyncState {
    /// Ask the loop to run a pass now instead of waiting for the interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn network_online(&self) -> Option<bool> {
        match self.network.load(Ordering::SeqCst) {
            NETWORK_UP => Some(true),
            NETWORK_DOWN => Some(false),
            _ => None,
        }
    }

    fn set_network_online(&self, online: bool) {
        let v = if online { NETWORK_UP } else { NETWORK_DOWN };
        self.network.store(v, Ordering::SeqCst);
    }

    fn mark_synced(&self) {
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
    }
}

/// Timing and retry knobs for the coordinator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPolicy {
    pub interval: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub batch_size: u32,
}

impl SyncPolicy {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            interval: cfg.sync_interval(),
            request_timeout: cfg.request_timeout(),
            max_retries: cfg.max_sync_retries,
            batch_size: cfg.sync_batch_size,
        }
    }
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: usize,
    /// Network failures; left in place without penalty.
    pub deferred: usize,
    /// Non-network failures still under the ceiling.
    pub failed: usize,
    pub dropped: usize,
}

async fn dispatch(
    backend: &dyn RemoteBackend,
    op: &PendingSyncOperation,
) -> Result<(), RemoteError> {
    let kind = op.parsed_kind().map_err(RemoteError::InvalidPayload)?;
    match kind {
        SyncOperationKind::CreateSale => {
            let sale: CreateSaleRequest = serde_json::from_str(&op.payload)
                .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
            backend.create_sale(&sale).await
        }
        SyncOperationKind::AdjustStock => {
            let adjustment: StockAdjustmentRequest = serde_json::from_str(&op.payload)
                .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
            backend.adjust_stock(&adjustment).await
        }
    }
}

/// One pass over the whole queue in FIFO order. Every entry is attempted
/// once, whatever happened to the entries before it.
pub async fn drain(
    db: &DbState,
    backend: &dyn RemoteBackend,
    policy: &SyncPolicy,
) -> PosResult<DrainReport> {
    let mut report = DrainReport::default();
    let mut cursor = 0;

    loop {
        let batch = {
            let conn = db.conn.lock()?;
            queue::pending_after(&conn, cursor, policy.batch_size)?
        };
        let Some(last) = batch.last() else {
            break;
        };
        cursor = last.id;

        for op in &batch {
            report.attempted += 1;
            let result = match tokio::time::timeout(policy.request_timeout, dispatch(backend, op))
                .await
            {
                Ok(r) => r,
                Err(_) => Err(RemoteError::Network(format!(
                    "timed out after {}ms",
                    policy.request_timeout.as_millis()
                ))),
            };

            match result {
                Ok(()) => {
                    let conn = db.conn.lock()?;
                    queue::remove(&conn, op.id)?;
                    report.synced += 1;
                    debug!(queue_id = op.id, kind = %op.kind, "Synced operation");
                }
                Err(e) if e.is_network() => {
                    report.deferred += 1;
                    debug!(queue_id = op.id, "Deferred sync operation: {e}");
                }
                Err(e) => {
                    let conn = db.conn.lock()?;
                    match queue::record_failure(&conn, op.id, &e.to_string(), policy.max_retries)? {
                        FailureOutcome::Retrying(n) => {
                            report.failed += 1;
                            warn!(queue_id = op.id, kind = %op.kind, retry = n, "Sync operation failed: {e}");
                        }
                        FailureOutcome::Dropped => report.dropped += 1,
                    }
                }
            }
        }
    }

    Ok(report)
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

async fn probe(backend: &dyn RemoteBackend, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, backend.is_reachable())
        .await
        .unwrap_or(false)
}

/// Start the background sync loop. Runs a pass every `policy.interval`, on
/// [`SyncState::wake`], and right away when the backend comes back.
pub fn start_sync_loop(
    db: Arc<DbState>,
    backend: Arc<dyn RemoteBackend>,
    sync_state: Arc<SyncState>,
    policy: SyncPolicy,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    sync_state.is_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!("Sync loop started (interval: {}s)", policy.interval.as_secs_f64());
        let mut previous_network_online: Option<bool> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(policy.interval) => {}
                _ = sync_state.wake.notified() => {}
            }

            if !sync_state.is_running.load(Ordering::SeqCst) {
                break;
            }

            let online = probe(backend.as_ref(), policy.request_timeout).await;
            sync_state.set_network_online(online);

            if !online {
                if previous_network_online != Some(false) {
                    info!("Network offline; deferring remote sync and keeping queue pending");
                }
                previous_network_online = Some(false);
                continue;
            }

            if previous_network_online == Some(false) {
                info!("Network restored; resuming queued sync");
            }
            previous_network_online = Some(true);

            let _guard = sync_state.drain_lock.lock().await;
            match drain(&db, backend.as_ref(), &policy).await {
                Ok(report) => {
                    if report.attempted > 0 {
                        info!(
                            synced = report.synced,
                            deferred = report.deferred,
                            failed = report.failed,
                            dropped = report.dropped,
                            "Sync cycle complete"
                        );
                    }
                    sync_state.mark_synced();
                }
                Err(e) => warn!("Sync cycle failed: {e}"),
            }
        }

        sync_state.is_running.store(false, Ordering::SeqCst);
        info!("Sync loop stopped");
    })
}

/// Run a pass immediately, regardless of the loop's schedule.
pub async fn force_sync(
    db: &DbState,
    backend: &dyn RemoteBackend,
    sync_state: &SyncState,
    policy: &SyncPolicy,
) -> PosResult<DrainReport> {
    let _guard = sync_state.drain_lock.lock().await;
    let report = drain(db, backend, policy).await?;
    info!(
        synced = report.synced,
        deferred = report.deferred,
        "Force sync complete"
    );
    if report.deferred == 0 {
        sync_state.mark_synced();
    }
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending: i64,
    pub last_sync: Option<String>,
    pub is_running: bool,
    pub network_online: Option<bool>,
}

pub fn sync_status(db: &DbState, sync_state: &SyncState) -> PosResult<SyncStatus> {
    let pending = {
        let conn = db.conn.lock()?;
        queue::pending_count(&conn)?
    };
    let last_sync = sync_state.last_sync.lock()?.clone();
    Ok(SyncStatus {
        pending,
        last_sync,
        is_running: sync_state.is_running.load(Ordering::SeqCst),
        network_online: sync_state.network_online(),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
