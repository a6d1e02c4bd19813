//! Order processing: commit the sale, charge its ingredients to the stock
//! ledger and queue it for the backend.
//!
//! Only the sale and its items are atomic. Once they are committed the sale
//! exists; ingredient deductions and the sync enqueue are best effort and
//! only logged on failure.

use chrono::{Datelike, Local, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::ledger::{self, DeductOutcome, SaleContext};
use crate::models::{
    CreateSaleRequest, LineItem, OrderRequest, PlacedOrder, Sale, SaleItem, SaleItemRequest,
    SaleWithItems, SyncOperationKind,
};
use crate::propagator::StockChangeNotifier;
use crate::queue;
use crate::recipes;

// ---------------------------------------------------------------------------
// Order numbers
// ---------------------------------------------------------------------------

/// Next `YYYYNNN` number for `year`: highest sequence already used that year
/// plus one. Must run inside the transaction that inserts the sale.
pub fn next_order_number(conn: &Connection, year: i32) -> PosResult<String> {
    let prefix = year.to_string();
    let max_seq: Option<i64> = conn.query_row(
        "SELECT MAX(CAST(substr(order_number, 5) AS INTEGER))
         FROM sales
         WHERE substr(order_number, 1, 4) = ?1 AND length(order_number) > 4",
        params![prefix],
        |row| row.get(0),
    )?;
    let next = max_seq.unwrap_or(0) + 1;
    Ok(format!("{prefix}{next:03}"))
}

/// Time-derived number used when the sequence query fails. May collide.
pub fn fallback_order_number(year: i32, unix_millis: i64) -> String {
    format!("{year}{:03}", unix_millis.rem_euclid(1000))
}

/// How the next order number is looked up inside the sale transaction.
pub type OrderSequence = fn(&Connection, i32) -> PosResult<String>;

fn allocate_order_number(conn: &Connection, sequence: OrderSequence) -> String {
    let year = Local::now().year();
    match sequence(conn, year) {
        Ok(number) => number,
        Err(e) => {
            let number = fallback_order_number(year, Utc::now().timestamp_millis());
            warn!(order_number = %number, "Order number query failed, using degraded fallback: {e}");
            number
        }
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

struct CommittedSale {
    sale_id: String,
    order_number: String,
    total_amount: f64,
    item_ids: Vec<i64>,
}

fn validate(request: &OrderRequest) -> PosResult<()> {
    if request.items.is_empty() {
        return Err(PosError::OrderFailed("order has no line items".into()));
    }
    if let Some(bad) = request.items.iter().find(|l| l.quantity == 0) {
        return Err(PosError::OrderFailed(format!(
            "line for {} has zero quantity",
            bad.product_name
        )));
    }
    if let Some(bad) = request.items.iter().find(|l| !l.subtotal.is_finite()) {
        return Err(PosError::OrderFailed(format!(
            "line for {} has an invalid subtotal",
            bad.product_name
        )));
    }
    Ok(())
}

fn commit_sale(
    db: &DbState,
    cashier_id: i64,
    request: &OrderRequest,
    sequence: OrderSequence,
) -> PosResult<CommittedSale> {
    let total_amount: f64 = request.items.iter().map(|l| l.subtotal).sum();
    let sale_id = Uuid::now_v7().to_string();
    let sale_date = Utc::now().to_rfc3339();

    let mut conn = db.conn.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let order_number = allocate_order_number(&tx, sequence);

    tx.execute(
        "INSERT INTO sales (id, cashier_id, sale_date, total_amount, customer_name, order_number, payment_method)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            sale_id,
            cashier_id,
            sale_date,
            total_amount,
            request.customer_name,
            order_number,
            request.payment_method,
        ],
    )?;

    let mut item_ids = Vec::with_capacity(request.items.len());
    for line in &request.items {
        tx.execute(
            "INSERT INTO sale_items (sale_id, product_id, quantity, price, subtotal, size, product_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sale_id,
                line.product_id,
                line.quantity,
                line.unit_price,
                line.subtotal,
                line.size,
                line.product_name,
            ],
        )?;
        item_ids.push(tx.last_insert_rowid());
    }

    tx.commit()?;

    Ok(CommittedSale {
        sale_id,
        order_number,
        total_amount,
        item_ids,
    })
}

/// Charge one line's ingredients, or the item's own stock row when it has
/// no recipe. Returns `(applied, failed)`.
fn deduct_line(
    db: &DbState,
    cfg: &EngineConfig,
    sale_id: &str,
    sale_item_id: i64,
    line: &LineItem,
    changes: &mut Vec<ledger::StockChange>,
) -> (usize, usize) {
    let size = line
        .size
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(cfg.default_size.as_str());

    let recipe = match db
        .conn
        .lock()
        .map_err(PosError::from)
        .and_then(|conn| recipes::resolve(&conn, line.product_id, size))
    {
        Ok(recipe) => recipe,
        Err(e) => {
            warn!(
                sale_id,
                product_id = line.product_id,
                "Recipe lookup failed, line not deducted: {e}"
            );
            return (0, 1);
        }
    };

    let ctx = SaleContext {
        sale_id,
        sale_item_id,
        menu_item_id: line.product_id,
        menu_item_name: &line.product_name,
        size_variant: Some(size),
        add_ons: &line.add_ons,
    };

    let Some(recipe) = recipe else {
        return deduct_item_line(db, cfg, line, &ctx, changes);
    };

    let (mut applied, mut failed) = (0, 0);
    for need in recipe.requirements(size, &line.add_ons) {
        let quantity = need.quantity * f64::from(line.quantity);
        match ledger::deduct(
            db,
            need.raw_material_id,
            quantity,
            &need.unit,
            &ctx,
            cfg.low_stock_threshold,
        ) {
            Ok(DeductOutcome::Applied(change)) => {
                applied += 1;
                changes.push(change);
            }
            Ok(DeductOutcome::Skipped) => failed += 1,
            Err(e) => {
                failed += 1;
                warn!(
                    sale_id,
                    raw_material_id = need.raw_material_id,
                    "Ingredient deduction failed, continuing: {e}"
                );
            }
        }
    }
    (applied, failed)
}

/// Recipe-less item: sell from its own stock row. An item with no row at
/// all only records the sale.
fn deduct_item_line(
    db: &DbState,
    cfg: &EngineConfig,
    line: &LineItem,
    ctx: &SaleContext<'_>,
    changes: &mut Vec<ledger::StockChange>,
) -> (usize, usize) {
    debug!(
        sale_id = %ctx.sale_id,
        product_id = line.product_id,
        "No recipe, drawing down item stock"
    );
    match ledger::deduct_item_stock(
        db,
        line.product_id,
        f64::from(line.quantity),
        ctx,
        cfg.low_stock_threshold,
    ) {
        Ok(DeductOutcome::Applied(change)) => {
            changes.push(change);
            (1, 0)
        }
        Ok(DeductOutcome::Skipped) => (0, 0),
        Err(e) => {
            warn!(
                sale_id = %ctx.sale_id,
                product_id = line.product_id,
                "Item stock deduction failed, continuing: {e}"
            );
            (0, 1)
        }
    }
}

/// Record a completed sale.
///
/// Fails only if the sale and its items cannot be committed. Deduction and
/// queue problems are logged and reflected in the returned counters.
pub fn process_order(
    db: &DbState,
    cfg: &EngineConfig,
    notifier: &StockChangeNotifier,
    request: &OrderRequest,
) -> PosResult<PlacedOrder> {
    process_order_with(db, cfg, notifier, request, next_order_number)
}

/// [`process_order`] with the order-number lookup supplied by the caller.
pub fn process_order_with(
    db: &DbState,
    cfg: &EngineConfig,
    notifier: &StockChangeNotifier,
    request: &OrderRequest,
    sequence: OrderSequence,
) -> PosResult<PlacedOrder> {
    validate(request)?;

    let sale = commit_sale(db, cfg.cashier_id, request, sequence).map_err(|e| {
        error!("Failed to commit sale: {e}");
        match e {
            PosError::OrderFailed(_) => e,
            other => PosError::OrderFailed(other.to_string()),
        }
    })?;

    let mut changes = Vec::new();
    let (mut applied, mut failed) = (0, 0);
    for (line, &item_id) in request.items.iter().zip(&sale.item_ids) {
        let (a, f) = deduct_line(db, cfg, &sale.sale_id, item_id, line, &mut changes);
        applied += a;
        failed += f;
    }
    if failed > 0 {
        warn!(
            sale_id = %sale.sale_id,
            failed,
            applied,
            "Sale committed with partial ingredient deduction"
        );
    }

    let payload = CreateSaleRequest {
        cashier_id: cfg.cashier_id,
        items: request
            .items
            .iter()
            .map(|l| SaleItemRequest {
                product_id: l.product_id,
                quantity: l.quantity,
            })
            .collect(),
        sale_id: Some(sale.sale_id.clone()),
        order_number: Some(sale.order_number.clone()),
    };
    match db.conn.lock() {
        Ok(conn) => {
            queue::enqueue(&conn, SyncOperationKind::CreateSale, &payload);
        }
        Err(e) => error!(sale_id = %sale.sale_id, "Could not queue sale for sync: {e}"),
    }

    notifier.notify_all(changes);

    info!(
        sale_id = %sale.sale_id,
        order_number = %sale.order_number,
        total = sale.total_amount,
        lines = request.items.len(),
        "Order placed"
    );

    Ok(PlacedOrder {
        sale_id: sale.sale_id,
        order_number: sale.order_number,
        total_amount: sale.total_amount,
        deductions_applied: applied,
        deductions_failed: failed,
    })
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn sale_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sale> {
    Ok(Sale {
        id: row.get(0)?,
        cashier_id: row.get(1)?,
        sale_date: row.get(2)?,
        total_amount: row.get(3)?,
        customer_name: row.get(4)?,
        order_number: row.get(5)?,
        payment_method: row.get(6)?,
    })
}

const SALE_COLUMNS: &str =
    "id, cashier_id, sale_date, total_amount, customer_name, order_number, payment_method";

pub fn get_sale(conn: &Connection, sale_id: &str) -> PosResult<Option<SaleWithItems>> {
    let sale = conn
        .query_row(
            &format!("SELECT {SALE_COLUMNS} FROM sales WHERE id = ?1"),
            params![sale_id],
            sale_from_row,
        )
        .optional()?;
    let Some(sale) = sale else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, sale_id, product_id, quantity, price, subtotal, size, product_name
         FROM sale_items WHERE sale_id = ?1 ORDER BY id",
    )?;
    let items = stmt
        .query_map(params![sale_id], |row| {
            Ok(SaleItem {
                id: row.get(0)?,
                sale_id: row.get(1)?,
                product_id: row.get(2)?,
                quantity: row.get(3)?,
                price: row.get(4)?,
                subtotal: row.get(5)?,
                size: row.get(6)?,
                product_name: row.get(7)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(SaleWithItems { sale, items }))
}

/// Most recent sales first.
pub fn recent_sales(conn: &Connection, limit: u32) -> PosResult<Vec<Sale>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SALE_COLUMNS} FROM sales ORDER BY sale_date DESC, id DESC LIMIT ?1"
    ))?;
    let sales = stmt
        .query_map(params![limit], sale_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(sales)
}
