//! Stock ledger: the only writer of raw-material quantity and status.
//!
//! Every mutation runs inside a `BEGIN IMMEDIATE` transaction, so the
//! read-modify-write of a quantity holds the database write lock from the
//! read until the commit. Concurrent deductions from other connections wait
//! on `busy_timeout` instead of interleaving. The `version` column is bumped
//! on every write and checked by the UPDATE as well.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::models::{
    is_menu_item, is_raw_material, IngredientDeduction, StockAdjustmentRequest, StockStatus,
    SyncOperationKind,
};
use crate::propagator::StockChangeNotifier;
use crate::queue;

/// Result of one committed quantity mutation, published to the change
/// propagator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockChange {
    pub product_id: i64,
    pub previous_quantity: f64,
    pub new_quantity: f64,
    pub status: StockStatus,
    pub version: i64,
}

/// The sale line a deduction is charged to.
#[derive(Debug, Clone)]
pub struct SaleContext<'a> {
    pub sale_id: &'a str,
    pub sale_item_id: i64,
    pub menu_item_id: i64,
    pub menu_item_name: &'a str,
    pub size_variant: Option<&'a str>,
    pub add_ons: &'a [String],
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeductOutcome {
    Applied(StockChange),
    /// The target is outside its id range or has no row. Logged and skipped.
    Skipped,
}

/// Subtract `quantity` of `raw_material_id` (in recipe units) and append the
/// audit entry, atomically. Stock may go negative; it is never clamped.
pub fn deduct(
    db: &DbState,
    raw_material_id: i64,
    quantity: f64,
    unit: &str,
    ctx: &SaleContext<'_>,
    low_threshold: f64,
) -> PosResult<DeductOutcome> {
    check_finite(quantity)?;
    if !is_raw_material(raw_material_id) {
        warn!(
            raw_material_id,
            sale_id = %ctx.sale_id,
            "Deduction target is not a raw material id, skipping"
        );
        return Ok(DeductOutcome::Skipped);
    }
    charge(db, raw_material_id, quantity, unit, ctx, low_threshold)
}

/// Unit recorded on audit entries for menu items sold without a recipe.
pub const ITEM_UNIT: &str = "pcs";

/// Draw down a menu item's own stock row. Used for items sold without a
/// recipe (bottled drinks, pastries). Same transaction, audit entry and
/// no-clamp rule as [`deduct`]; the audit row names the menu item itself.
pub fn deduct_item_stock(
    db: &DbState,
    menu_item_id: i64,
    quantity: f64,
    ctx: &SaleContext<'_>,
    low_threshold: f64,
) -> PosResult<DeductOutcome> {
    check_finite(quantity)?;
    if !is_menu_item(menu_item_id) {
        warn!(
            menu_item_id,
            sale_id = %ctx.sale_id,
            "Item stock target is not a menu item id, skipping"
        );
        return Ok(DeductOutcome::Skipped);
    }
    charge(db, menu_item_id, quantity, ITEM_UNIT, ctx, low_threshold)
}

fn check_finite(quantity: f64) -> PosResult<()> {
    if quantity.is_finite() {
        Ok(())
    } else {
        Err(PosError::InvalidInput(format!(
            "deduction quantity must be finite, got {quantity}"
        )))
    }
}

fn charge(
    db: &DbState,
    product_id: i64,
    quantity: f64,
    unit: &str,
    ctx: &SaleContext<'_>,
    low_threshold: f64,
) -> PosResult<DeductOutcome> {
    let mut conn = db.conn.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some((name, current, version)) = read_stock(&tx, product_id)? else {
        warn!(
            product_id,
            sale_id = %ctx.sale_id,
            "Stock row not found, skipping deduction"
        );
        return Ok(DeductOutcome::Skipped);
    };

    let new_quantity = current - quantity;
    let change = write_stock(&tx, product_id, current, new_quantity, version, low_threshold)?;

    let add_ons = if ctx.add_ons.is_empty() {
        None
    } else {
        Some(ctx.add_ons.join(", "))
    };
    tx.execute(
        "INSERT INTO ingredient_deductions (
            sale_id, sale_item_id, raw_material_id, raw_material_name,
            quantity_deducted, unit, menu_item_id, menu_item_name, size_variant, add_ons
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            ctx.sale_id,
            ctx.sale_item_id,
            product_id,
            name,
            quantity,
            unit,
            ctx.menu_item_id,
            ctx.menu_item_name,
            ctx.size_variant,
            add_ons,
        ],
    )?;
    tx.commit()?;

    match change.status {
        StockStatus::OutOfStock => warn!(
            product_id,
            name = %name,
            was = current,
            deducted = quantity,
            "Out of stock"
        ),
        StockStatus::LowStock => warn!(
            product_id,
            name = %name,
            remaining = new_quantity,
            "Running low"
        ),
        StockStatus::InStock => {}
    }
    debug!(
        product_id,
        sale_id = %ctx.sale_id,
        deducted = quantity,
        remaining = new_quantity,
        "Deducted {name}"
    );

    Ok(DeductOutcome::Applied(change))
}

/// Add a signed delta to a product's stock (replenishment or correction),
/// then publish the change and queue it for the backend.
pub fn adjust_stock(
    db: &DbState,
    notifier: &StockChangeNotifier,
    product_id: i64,
    delta: f64,
    low_threshold: f64,
) -> PosResult<StockChange> {
    if !delta.is_finite() {
        return Err(PosError::InvalidInput(format!(
            "stock adjustment must be finite, got {delta}"
        )));
    }

    let mut conn = db.conn.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let Some((name, current, version)) = read_stock(&tx, product_id)? else {
        return Err(PosError::NotFound {
            entity: "product",
            id: product_id.to_string(),
        });
    };
    let change = write_stock(&tx, product_id, current, current + delta, version, low_threshold)?;
    tx.commit()?;

    info!(
        product_id,
        name = %name,
        delta,
        quantity = change.new_quantity,
        status = %change.status,
        "Stock adjusted"
    );

    queue::enqueue(
        &conn,
        SyncOperationKind::AdjustStock,
        &StockAdjustmentRequest {
            product_id,
            quantity_change: delta,
        },
    );
    drop(conn);

    notifier.notify(change.clone());
    Ok(change)
}

fn read_stock(conn: &Connection, product_id: i64) -> PosResult<Option<(String, f64, i64)>> {
    let row = conn
        .query_row(
            "SELECT name, quantity, version FROM products WHERE id = ?1",
            params![product_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    Ok(row)
}

fn write_stock(
    conn: &Connection,
    product_id: i64,
    previous: f64,
    new_quantity: f64,
    version: i64,
    low_threshold: f64,
) -> PosResult<StockChange> {
    let status = StockStatus::classify(new_quantity, low_threshold);
    let updated = conn.execute(
        "UPDATE products
         SET quantity = ?2, status = ?3, version = version + 1,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?1 AND version = ?4",
        params![product_id, new_quantity, status.as_str(), version],
    )?;
    if updated != 1 {
        return Err(PosError::Conflict(format!(
            "stock row {product_id} changed underneath the ledger (version {version})"
        )));
    }
    Ok(StockChange {
        product_id,
        previous_quantity: previous,
        new_quantity,
        status,
        version: version + 1,
    })
}

// ---------------------------------------------------------------------------
// Summary and audit queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockSummary {
    pub out_of_stock: usize,
    pub low_stock: usize,
    pub message: String,
}

/// Count raw materials by status band.
pub fn stock_summary(conn: &Connection) -> PosResult<StockSummary> {
    let (out_of_stock, low_stock): (i64, i64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN status = 'OUT_OF_STOCK' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'LOW_STOCK' THEN 1 ELSE 0 END), 0)
         FROM products WHERE id >= ?1",
        params![crate::models::RAW_MATERIAL_ID_FLOOR],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let message = if out_of_stock > 0 {
        format!("{out_of_stock} items out of stock")
    } else if low_stock > 0 {
        format!("{low_stock} items running low")
    } else {
        "All stocks are in good condition.".to_string()
    };

    Ok(StockSummary {
        out_of_stock: out_of_stock as usize,
        low_stock: low_stock as usize,
        message,
    })
}

fn deduction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IngredientDeduction> {
    Ok(IngredientDeduction {
        id: row.get(0)?,
        sale_id: row.get(1)?,
        sale_item_id: row.get(2)?,
        raw_material_id: row.get(3)?,
        raw_material_name: row.get(4)?,
        quantity_deducted: row.get(5)?,
        unit: row.get(6)?,
        menu_item_id: row.get(7)?,
        menu_item_name: row.get(8)?,
        size_variant: row.get(9)?,
        add_ons: row.get(10)?,
        deducted_at: row.get(11)?,
    })
}

const DEDUCTION_COLUMNS: &str = "id, sale_id, sale_item_id, raw_material_id, raw_material_name,
    quantity_deducted, unit, menu_item_id, menu_item_name, size_variant, add_ons, deducted_at";

/// Audit entries for one sale, in write order.
pub fn deductions_for_sale(conn: &Connection, sale_id: &str) -> PosResult<Vec<IngredientDeduction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DEDUCTION_COLUMNS} FROM ingredient_deductions WHERE sale_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt
        .query_map(params![sale_id], deduction_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Audit entries for one raw material, newest first.
pub fn deductions_for_raw_material(
    conn: &Connection,
    raw_material_id: i64,
) -> PosResult<Vec<IngredientDeduction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DEDUCTION_COLUMNS} FROM ingredient_deductions
         WHERE raw_material_id = ?1 ORDER BY id DESC"
    ))?;
    let rows = stmt
        .query_map(params![raw_material_id], deduction_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
