//! Catalog access: raw materials and menu items, plus the versioned seed
//! import that builds the id mapping recipes rely on.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::db::{self, DbState};
use crate::error::PosResult;
use crate::models::{Product, Recipe, StockStatus, RAW_MATERIAL_ID_FLOOR};
use crate::recipes;

pub use crate::models::{is_menu_item, is_raw_material};

const PRODUCT_COLUMNS: &str =
    "id, name, category, cost, price, quantity, status, created_at, updated_at";

pub(crate) fn product_from_row(row: &Row<'_>) -> rusqlite::Result<Product> {
    let status: String = row.get(6)?;
    Ok(Product {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        cost: row.get(3)?,
        price: row.get(4)?,
        quantity: row.get(5)?,
        status: status.parse().unwrap_or(StockStatus::InStock),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub fn get_product(conn: &Connection, id: i64) -> PosResult<Option<Product>> {
    let product = conn
        .query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
            params![id],
            product_from_row,
        )
        .optional()?;
    Ok(product)
}

fn query_products(conn: &Connection, filter: &str, floor: i64) -> PosResult<Vec<Product>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products {filter} ORDER BY id"
    ))?;
    let rows = if filter.is_empty() {
        stmt.query_map([], product_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map(params![floor], product_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };
    Ok(rows)
}

pub fn list_products(conn: &Connection) -> PosResult<Vec<Product>> {
    query_products(conn, "", RAW_MATERIAL_ID_FLOOR)
}

pub fn list_raw_materials(conn: &Connection) -> PosResult<Vec<Product>> {
    query_products(conn, "WHERE id >= ?1", RAW_MATERIAL_ID_FLOOR)
}

pub fn list_menu_items(conn: &Connection) -> PosResult<Vec<Product>> {
    query_products(conn, "WHERE id < ?1", RAW_MATERIAL_ID_FLOOR)
}

// ---------------------------------------------------------------------------
// Seed import
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedProduct {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub quantity: f64,
    /// Menu items carry an explicit status; raw materials are classified
    /// from their quantity.
    #[serde(default)]
    pub status: Option<StockStatus>,
}

/// A catalog snapshot with explicit ids. Recipes reference raw materials by
/// id only; no name matching happens at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSeed {
    pub version: u32,
    #[serde(default)]
    pub products: Vec<SeedProduct>,
    #[serde(default)]
    pub recipes: Vec<Recipe>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub version: u32,
    pub skipped: bool,
    pub products_inserted: usize,
    pub products_updated: usize,
    pub recipes_saved: usize,
    /// `(menu_item_id, raw_material_id)` pairs whose raw material is unknown.
    pub unmapped_ingredients: Vec<(i64, i64)>,
}

pub fn catalog_version(conn: &Connection) -> u32 {
    db::get_setting(conn, "catalog", "version")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Import a seed. Importing the same or an older version is a no-op.
///
/// New products are inserted with the seed quantity. Existing rows keep their
/// live quantity and only have their descriptive fields refreshed. Raw
/// materials are classified with the configured low-stock threshold.
pub fn import_catalog(db: &DbState, seed: &CatalogSeed) -> PosResult<ImportReport> {
    let mut conn = db.conn.lock()?;

    let current = catalog_version(&conn);
    if seed.version <= current {
        info!(
            current,
            seed = seed.version,
            "Catalog seed not newer than installed version, skipping"
        );
        return Ok(ImportReport {
            version: current,
            skipped: true,
            ..ImportReport::default()
        });
    }

    let tx = conn.transaction()?;
    let low_threshold = EngineConfig::load(&tx).low_stock_threshold;
    let mut report = ImportReport {
        version: seed.version,
        ..ImportReport::default()
    };

    for p in &seed.products {
        let status = match (p.status, is_raw_material(p.id)) {
            (Some(s), false) => s,
            (None, false) => StockStatus::InStock,
            (_, true) => StockStatus::classify(p.quantity, low_threshold),
        };
        let updated = tx.execute(
            "UPDATE products SET name = ?2, category = ?3, cost = ?4, price = ?5,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE id = ?1",
            params![p.id, p.name, p.category, p.cost, p.price],
        )?;
        if updated > 0 {
            report.products_updated += 1;
            continue;
        }
        tx.execute(
            "INSERT INTO products (id, name, category, cost, price, quantity, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
                strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
            params![p.id, p.name, p.category, p.cost, p.price, p.quantity, status.as_str()],
        )?;
        report.products_inserted += 1;
    }

    let known: HashSet<i64> = {
        let mut stmt = tx.prepare("SELECT id FROM products WHERE id >= ?1")?;
        let ids = stmt
            .query_map(params![RAW_MATERIAL_ID_FLOOR], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        ids
    };

    for recipe in &seed.recipes {
        if !is_menu_item(recipe.menu_item_id) {
            warn!(
                menu_item_id = recipe.menu_item_id,
                "Recipe owner is not a menu item id, skipping"
            );
            continue;
        }
        // Ids below the raw-material floor are reported too: they name menu
        // items and are never deducted.
        let references = recipe
            .ingredients
            .iter()
            .chain(recipe.add_ons.iter().flat_map(|a| a.ingredients.iter()))
            .map(|i| i.raw_material_id)
            .filter(|&id| id > 0);
        for raw_id in references {
            if !known.contains(&raw_id) {
                warn!(
                    menu_item_id = recipe.menu_item_id,
                    raw_material_id = raw_id,
                    "Recipe references an unknown raw material"
                );
                report.unmapped_ingredients.push((recipe.menu_item_id, raw_id));
            }
        }
        recipes::save_recipe(&tx, recipe)?;
        report.recipes_saved += 1;
    }

    db::set_setting(&tx, "catalog", "version", &seed.version.to_string())?;
    tx.commit()?;

    info!(
        version = seed.version,
        inserted = report.products_inserted,
        updated = report.products_updated,
        recipes = report.recipes_saved,
        unmapped = report.unmapped_ingredients.len(),
        "Catalog seed imported"
    );
    Ok(report)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::RecipeIngredient;

    pub(crate) fn seed_product(id: i64, name: &str, quantity: f64) -> SeedProduct {
        SeedProduct {
            id,
            name: name.to_string(),
            category: (if is_raw_material(id) { "Ingredients" } else { "Milk Tea" }).to_string(),
            cost: 0.0,
            price: if is_raw_material(id) { 0.0 } else { 120.0 },
            quantity,
            status: None,
        }
    }

    /// Milk tea (id 1) made of Tea, Creamer and Pearls.
    pub(crate) fn milk_tea_seed(tea: f64, creamer: f64, pearls: f64) -> CatalogSeed {
        CatalogSeed {
            version: 1,
            products: vec![
                seed_product(1, "Classic Milk Tea", 0.0),
                seed_product(10001, "Tea", tea),
                seed_product(10002, "Creamer", creamer),
                seed_product(10003, "Pearls", pearls),
            ],
            recipes: vec![Recipe {
                menu_item_id: 1,
                recipe_name: "Default".to_string(),
                ingredients: vec![
                    RecipeIngredient::new(10001, "Tea", 150.0, "ml"),
                    RecipeIngredient::new(10002, "Creamer", 30.0, "g"),
                    RecipeIngredient::new(10003, "Pearls", 50.0, "g"),
                ],
                add_ons: vec![],
            }],
        }
    }

    #[test]
    fn test_import_and_partition() {
        let state = db::test_state();
        let report = import_catalog(&state, &milk_tea_seed(100.0, 200.0, 3.0)).unwrap();
        assert_eq!(report.products_inserted, 4);
        assert_eq!(report.recipes_saved, 1);
        assert!(report.unmapped_ingredients.is_empty());

        let conn = state.conn.lock().unwrap();
        assert_eq!(list_products(&conn).unwrap().len(), 4);
        assert_eq!(list_menu_items(&conn).unwrap().len(), 1);
        let raws = list_raw_materials(&conn).unwrap();
        assert_eq!(raws.len(), 3);
        assert!(raws.iter().all(|p| p.is_raw_material()));

        let pearls = get_product(&conn, 10003).unwrap().unwrap();
        assert_eq!(pearls.status, StockStatus::LowStock);
        let tea_item = get_product(&conn, 1).unwrap().unwrap();
        assert_eq!(tea_item.status, StockStatus::InStock);
        assert!(get_product(&conn, 42).unwrap().is_none());
    }

    #[test]
    fn test_reimport_is_versioned_and_keeps_live_stock() {
        let state = db::test_state();
        import_catalog(&state, &milk_tea_seed(100.0, 200.0, 200.0)).unwrap();

        let same = import_catalog(&state, &milk_tea_seed(999.0, 999.0, 999.0)).unwrap();
        assert!(same.skipped);

        let mut newer = milk_tea_seed(999.0, 999.0, 999.0);
        newer.version = 2;
        newer.products[1].name = "Black Tea Base | 6 L".into();
        let report = import_catalog(&state, &newer).unwrap();
        assert!(!report.skipped);
        assert_eq!(report.products_updated, 4);

        let conn = state.conn.lock().unwrap();
        let tea = get_product(&conn, 10001).unwrap().unwrap();
        assert_eq!(tea.name, "Black Tea Base | 6 L");
        assert_eq!(tea.quantity, 100.0);
        assert_eq!(catalog_version(&conn), 2);
    }

    #[test]
    fn test_import_reports_unknown_raw_materials() {
        let state = db::test_state();
        let mut seed = milk_tea_seed(100.0, 200.0, 200.0);
        seed.recipes[0]
            .ingredients
            .push(RecipeIngredient::new(10099, "Ghost Syrup", 10.0, "ml"));
        let report = import_catalog(&state, &seed).unwrap();
        assert_eq!(report.unmapped_ingredients, vec![(1, 10099)]);
        // The recipe is still stored; the ledger skips the unknown row later.
        assert_eq!(report.recipes_saved, 1);
    }

    #[test]
    fn test_import_reports_menu_item_used_as_ingredient() {
        let state = db::test_state();
        let mut seed = milk_tea_seed(100.0, 200.0, 200.0);
        seed.products.push(seed_product(2, "Bottled Water", 24.0));
        seed.recipes[0]
            .ingredients
            .push(RecipeIngredient::new(2, "Bottled Water", 1.0, "pcs"));
        let report = import_catalog(&state, &seed).unwrap();
        assert_eq!(report.unmapped_ingredients, vec![(1, 2)]);
    }

    #[test]
    fn test_seed_status_uses_configured_threshold() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            let cfg = EngineConfig {
                low_stock_threshold: 250.0,
                ..EngineConfig::default()
            };
            cfg.save(&conn).unwrap();
        }
        import_catalog(&state, &milk_tea_seed(100.0, 300.0, 0.0)).unwrap();

        let conn = state.conn.lock().unwrap();
        let status = |id| get_product(&conn, id).unwrap().unwrap().status;
        assert_eq!(status(10001), StockStatus::LowStock);
        assert_eq!(status(10002), StockStatus::InStock);
        assert_eq!(status(10003), StockStatus::OutOfStock);
    }
}
