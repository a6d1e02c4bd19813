//! Reverse index from raw materials to the menu items that use them, and the
//! background task that republishes availability when stock moves.
//!
//! Writers push [`StockChange`]s through a [`StockChangeNotifier`]; the
//! propagator task recomputes only the menu items touched by those raw
//! materials and publishes the whole board on a `watch` channel.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::availability::{AvailabilityEvaluator, AvailabilityReport};
use crate::catalog;
use crate::config::EngineConfig;
use crate::db::DbState;
use crate::error::PosResult;
use crate::ledger::StockChange;
use crate::models::Recipe;
use crate::recipes;

// ---------------------------------------------------------------------------
// Notification channel
// ---------------------------------------------------------------------------

/// Sending half handed to every stock writer. Sending never blocks and never
/// fails the writer.
#[derive(Debug, Clone)]
pub struct StockChangeNotifier {
    tx: mpsc::UnboundedSender<StockChange>,
}

impl StockChangeNotifier {
    pub fn notify(&self, change: StockChange) {
        let product_id = change.product_id;
        if self.tx.send(change).is_err() {
            debug!(product_id, "No availability listener, stock change not published");
        }
    }

    pub fn notify_all(&self, changes: impl IntoIterator<Item = StockChange>) {
        for change in changes {
            self.notify(change);
        }
    }

    /// A notifier with nobody listening.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

pub fn stock_channel() -> (StockChangeNotifier, mpsc::UnboundedReceiver<StockChange>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StockChangeNotifier { tx }, rx)
}

// ---------------------------------------------------------------------------
// Reverse index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReverseIndex {
    by_raw_material: HashMap<i64, BTreeSet<i64>>,
    menu_items: BTreeSet<i64>,
}

impl ReverseIndex {
    /// Index every raw material each recipe can touch, across all sizes and
    /// add-ons.
    pub fn build(recipes: &[Recipe]) -> Self {
        let mut index = Self::default();
        for recipe in recipes {
            index.menu_items.insert(recipe.menu_item_id);
            for raw_id in recipe.referenced_raw_materials() {
                index
                    .by_raw_material
                    .entry(raw_id)
                    .or_default()
                    .insert(recipe.menu_item_id);
            }
        }
        index
    }

    pub fn affected_by(&self, raw_material_id: i64) -> impl Iterator<Item = i64> + '_ {
        self.by_raw_material
            .get(&raw_material_id)
            .into_iter()
            .flat_map(|items| items.iter().copied())
    }

    /// Union of menu items touched by any of the given raw materials.
    pub fn affected_by_all(&self, raw_material_ids: impl IntoIterator<Item = i64>) -> BTreeSet<i64> {
        raw_material_ids
            .into_iter()
            .flat_map(|id| self.affected_by(id).collect::<Vec<_>>())
            .collect()
    }

    pub fn menu_items(&self) -> &BTreeSet<i64> {
        &self.menu_items
    }

    pub fn raw_material_count(&self) -> usize {
        self.by_raw_material.len()
    }
}

// ---------------------------------------------------------------------------
// Availability board
// ---------------------------------------------------------------------------

/// What subscribers see per menu item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuAvailability {
    pub available: bool,
    pub missing_ingredients_text: String,
    pub has_low_stock: bool,
}

impl From<&AvailabilityReport> for MenuAvailability {
    fn from(report: &AvailabilityReport) -> Self {
        Self {
            available: report.available,
            missing_ingredients_text: report.missing_ingredients_text(),
            has_low_stock: report.has_low_stock(),
        }
    }
}

pub type AvailabilityBoard = BTreeMap<i64, MenuAvailability>;

pub struct ChangePropagator {
    db: Arc<DbState>,
    evaluator: AvailabilityEvaluator,
    default_size: String,
    index: ReverseIndex,
    board: watch::Sender<AvailabilityBoard>,
    catalog_changed: Arc<Notify>,
}

impl ChangePropagator {
    pub fn new(db: Arc<DbState>, cfg: &EngineConfig) -> Self {
        let (board, _) = watch::channel(AvailabilityBoard::new());
        Self {
            db,
            evaluator: AvailabilityEvaluator::from_config(cfg),
            default_size: cfg.default_size.clone(),
            index: ReverseIndex::default(),
            board,
            catalog_changed: Arc::new(Notify::new()),
        }
    }

    /// Notify this after recipes or products are imported; the running task
    /// then rebuilds the index and recomputes every item.
    pub fn catalog_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.catalog_changed)
    }

    pub fn subscribe(&self) -> watch::Receiver<AvailabilityBoard> {
        self.board.subscribe()
    }

    pub fn index(&self) -> &ReverseIndex {
        &self.index
    }

    /// Reload every recipe and rebuild the reverse index.
    pub fn rebuild_index(&mut self) -> PosResult<()> {
        let all = {
            let conn = self.db.conn.lock()?;
            recipes::all_recipes(&conn)?
        };
        self.index = ReverseIndex::build(&all);
        info!(
            raw_materials = self.index.raw_material_count(),
            menu_items = self.index.menu_items().len(),
            "Availability index rebuilt"
        );
        Ok(())
    }

    /// Recompute every menu item (catalog rows plus anything with a recipe).
    pub fn refresh_all(&mut self) -> PosResult<usize> {
        self.rebuild_index()?;
        let mut targets: BTreeSet<i64> = self.index.menu_items().clone();
        {
            let conn = self.db.conn.lock()?;
            targets.extend(catalog::list_menu_items(&conn)?.into_iter().map(|p| p.id));
        }
        self.recompute(&targets)
    }

    /// Recompute only the menu items touched by `changes`.
    pub fn apply(&mut self, changes: &[StockChange]) -> PosResult<usize> {
        let affected = self
            .index
            .affected_by_all(changes.iter().map(|c| c.product_id));
        if affected.is_empty() {
            return Ok(0);
        }
        self.recompute(&affected)
    }

    fn recompute(&mut self, menu_item_ids: &BTreeSet<i64>) -> PosResult<usize> {
        let mut updates = Vec::with_capacity(menu_item_ids.len());
        {
            let conn = self.db.conn.lock()?;
            for &menu_item_id in menu_item_ids {
                match self.evaluator.evaluate(&conn, menu_item_id, &self.default_size) {
                    Ok(report) => updates.push((menu_item_id, MenuAvailability::from(&report))),
                    Err(e) => warn!(menu_item_id, "Availability recompute failed: {e}"),
                }
            }
        }

        let mut changed = 0;
        self.board.send_if_modified(|board| {
            for (id, availability) in updates {
                if board.get(&id) != Some(&availability) {
                    board.insert(id, availability);
                    changed += 1;
                }
            }
            changed > 0
        });
        if changed > 0 {
            debug!(recomputed = menu_item_ids.len(), changed, "Availability board updated");
        }
        Ok(changed)
    }

    /// Consume stock changes until cancelled. Changes that arrive together
    /// are folded into one recompute.
    pub async fn run(
        mut self,
        mut changes: mpsc::UnboundedReceiver<StockChange>,
        cancel: CancellationToken,
    ) {
        info!("Change propagator started");
        let catalog_changed = Arc::clone(&self.catalog_changed);
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = catalog_changed.notified() => {
                    if let Err(e) = self.refresh_all() {
                        warn!("Failed to refresh availability after catalog change: {e}");
                    }
                    continue;
                }
                next = changes.recv() => match next {
                    Some(change) => change,
                    None => break,
                },
            };

            let mut batch = vec![first];
            while let Ok(more) = changes.try_recv() {
                batch.push(more);
            }

            if let Err(e) = self.apply(&batch) {
                warn!("Failed to propagate {} stock changes: {e}", batch.len());
            }
        }
        info!("Change propagator stopped");
    }
}
