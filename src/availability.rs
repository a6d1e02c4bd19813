//! Sellability of menu items against current raw-material stock.

use rusqlite::Connection;
use serde::Serialize;
use tracing::warn;

use crate::catalog;
use crate::config::EngineConfig;
use crate::error::PosResult;
use crate::models::{Recipe, RecipeIngredient};
use crate::recipes::{self, size_applies};
use crate::units::UnitConverter;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityReport {
    pub menu_item_id: i64,
    pub size: String,
    /// `None` when the item has no recipe (always sellable).
    pub recipe_name: Option<String>,
    pub available: bool,
    pub missing: Vec<String>,
    pub low_stock: Vec<String>,
}

impl AvailabilityReport {
    fn unconditional(menu_item_id: i64, size: &str) -> Self {
        Self {
            menu_item_id,
            size: size.to_string(),
            recipe_name: None,
            available: true,
            missing: Vec::new(),
            low_stock: Vec::new(),
        }
    }

    pub fn missing_ingredients_text(&self) -> String {
        self.missing.join(", ")
    }

    pub fn has_low_stock(&self) -> bool {
        !self.low_stock.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AvailabilityEvaluator {
    converter: UnitConverter,
    low_stock_servings: f64,
}

impl AvailabilityEvaluator {
    pub fn new(converter: UnitConverter, low_stock_servings: f64) -> Self {
        Self {
            converter,
            low_stock_servings,
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(UnitConverter::new(cfg.ml_per_gram), cfg.low_stock_servings)
    }

    /// Resolve the recipe for `size` and check its base ingredients.
    pub fn evaluate(
        &self,
        conn: &Connection,
        menu_item_id: i64,
        size: &str,
    ) -> PosResult<AvailabilityReport> {
        let recipe = recipes::resolve(conn, menu_item_id, size)?;
        self.evaluate_recipe(conn, menu_item_id, recipe.as_ref(), size)
    }

    pub fn evaluate_recipe(
        &self,
        conn: &Connection,
        menu_item_id: i64,
        recipe: Option<&Recipe>,
        size: &str,
    ) -> PosResult<AvailabilityReport> {
        let Some(recipe) = recipe else {
            return Ok(AvailabilityReport::unconditional(menu_item_id, size));
        };

        let base = recipe
            .ingredients
            .iter()
            .filter(|i| !i.is_add_on && size_applies(i.size_variant.as_deref(), size))
            .map(|i| (i, i.quantity));

        let mut report = self.check(conn, menu_item_id, size, base)?;
        report.recipe_name = Some(recipe.recipe_name.clone());
        Ok(report)
    }

    /// Check only what a selected add-on consumes: its own ingredient list
    /// plus recipe ingredients flagged for it.
    pub fn evaluate_add_on(
        &self,
        conn: &Connection,
        menu_item_id: i64,
        size: &str,
        add_on_name: &str,
    ) -> PosResult<AvailabilityReport> {
        let Some(recipe) = recipes::resolve(conn, menu_item_id, size)? else {
            return Ok(AvailabilityReport::unconditional(menu_item_id, size));
        };

        let flagged = recipe
            .ingredients
            .iter()
            .filter(|i| {
                i.is_add_on
                    && i.add_on_name
                        .as_deref()
                        .is_some_and(|n| n.eq_ignore_ascii_case(add_on_name.trim()))
                    && size_applies(i.size_variant.as_deref(), size)
            })
            .map(|i| (i, i.quantity + i.add_on_extra_quantity));

        let standalone = recipe
            .add_on(add_on_name)
            .into_iter()
            .flat_map(|a| a.ingredients.iter())
            .filter(|i| size_applies(i.size_variant.as_deref(), size))
            .map(|i| {
                let extra = if i.is_add_on { i.add_on_extra_quantity } else { 0.0 };
                (i, i.quantity + extra)
            });

        let mut report = self.check(conn, menu_item_id, size, flagged.chain(standalone))?;
        report.recipe_name = Some(recipe.recipe_name.clone());
        Ok(report)
    }

    fn check<'r>(
        &self,
        conn: &Connection,
        menu_item_id: i64,
        size: &str,
        ingredients: impl Iterator<Item = (&'r RecipeIngredient, f64)>,
    ) -> PosResult<AvailabilityReport> {
        let mut report = AvailabilityReport::unconditional(menu_item_id, size);

        for (ingredient, required) in ingredients {
            if !ingredient.is_mapped() {
                warn!(
                    menu_item_id,
                    ingredient = %ingredient.raw_material_name,
                    "Unmapped recipe ingredient ignored for availability"
                );
                continue;
            }

            let Some(product) = catalog::get_product(conn, ingredient.raw_material_id)? else {
                if ingredient.required {
                    warn!(
                        menu_item_id,
                        raw_material_id = ingredient.raw_material_id,
                        "Required raw material missing from catalog"
                    );
                    report.missing.push(ingredient.raw_material_name.clone());
                }
                continue;
            };

            let on_hand =
                self.converter
                    .convert_logged(product.quantity, &product.name, &ingredient.unit);
            if on_hand < required {
                report.missing.push(ingredient.raw_material_name.clone());
            } else if on_hand < required * self.low_stock_servings {
                report.low_stock.push(ingredient.raw_material_name.clone());
            }
        }

        report.available = report.missing.is_empty();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{milk_tea_seed, seed_product};
    use crate::catalog::{import_catalog, CatalogSeed};
    use crate::db;
    use crate::ledger;
    use crate::models::AddOn;
    use crate::propagator::StockChangeNotifier;

    fn evaluator() -> AvailabilityEvaluator {
        AvailabilityEvaluator::from_config(&EngineConfig::default())
    }

    #[test]
    fn test_tea_shortage_then_replenish() {
        let state = db::test_state();
        import_catalog(&state, &milk_tea_seed(100.0, 200.0, 200.0)).unwrap();

        {
            let conn = state.conn.lock().unwrap();
            let report = evaluator().evaluate(&conn, 1, "Regular").unwrap();
            assert!(!report.available);
            assert_eq!(report.missing, vec!["Tea".to_string()]);
            assert_eq!(report.missing_ingredients_text(), "Tea");
        }

        ledger::adjust_stock(&state, &StockChangeNotifier::detached(), 10001, 200.0, 5.0)
            .unwrap();

        let conn = state.conn.lock().unwrap();
        let report = evaluator().evaluate(&conn, 1, "Regular").unwrap();
        assert!(report.available);
        assert!(report.missing.is_empty());
    }

    #[test]
    fn test_low_stock_band_uses_ten_servings() {
        let state = db::test_state();
        // Tea covers 2 servings, Creamer exactly 10, Pearls 9.
        import_catalog(&state, &milk_tea_seed(300.0, 300.0, 450.0)).unwrap();

        let conn = state.conn.lock().unwrap();
        let report = evaluator().evaluate(&conn, 1, "Regular").unwrap();
        assert!(report.available);
        assert_eq!(report.low_stock, vec!["Tea".to_string(), "Pearls".to_string()]);
        assert!(report.has_low_stock());
    }

    #[test]
    fn test_item_without_recipe_is_available() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let report = evaluator().evaluate(&conn, 7, "Large").unwrap();
        assert!(report.available);
        assert_eq!(report.recipe_name, None);
    }

    #[test]
    fn test_packaged_stock_is_converted() {
        let state = db::test_state();
        let mut seed = milk_tea_seed(0.05, 1000.0, 1000.0);
        // 0.05 packages of 6 L = 300 ml.
        seed.products[1].name = "Black Tea Base | 6 L".into();
        import_catalog(&state, &seed).unwrap();

        let conn = state.conn.lock().unwrap();
        let report = evaluator().evaluate(&conn, 1, "Regular").unwrap();
        assert!(report.available, "missing: {:?}", report.missing);
        // 300 ml covers two servings, so it is flagged under the recipe name.
        assert_eq!(report.low_stock, vec!["Tea".to_string()]);
    }

    #[test]
    fn test_unmapped_and_optional_missing_rows() {
        let state = db::test_state();
        let mut optional_missing = RecipeIngredient::new(10050, "Garnish", 1.0, "g");
        optional_missing.required = false;
        let seed = CatalogSeed {
            version: 1,
            products: vec![seed_product(2, "Lemonade", 0.0), seed_product(10001, "Lemon", 500.0)],
            recipes: vec![Recipe {
                menu_item_id: 2,
                recipe_name: "Default".into(),
                ingredients: vec![
                    RecipeIngredient::new(10001, "Lemon", 20.0, "g"),
                    RecipeIngredient::new(-1, "Unknown Syrup", 10.0, "ml"),
                    optional_missing,
                ],
                add_ons: vec![],
            }],
        };
        import_catalog(&state, &seed).unwrap();

        let conn = state.conn.lock().unwrap();
        let report = evaluator().evaluate(&conn, 2, "Regular").unwrap();
        assert!(report.available);
        assert!(report.missing.is_empty());

        let mut required_missing = seed.recipes[0].clone();
        required_missing.ingredients[2].required = true;
        let report = evaluator()
            .evaluate_recipe(&conn, 2, Some(&required_missing), "Regular")
            .unwrap();
        assert_eq!(report.missing, vec!["Garnish".to_string()]);
    }

    #[test]
    fn test_menu_item_reference_does_not_gate_availability() {
        let state = db::test_state();
        let mut seed = milk_tea_seed(1000.0, 1000.0, 1000.0);
        seed.products.push(seed_product(2, "Bottled Water", 0.0));
        seed.recipes[0]
            .ingredients
            .push(RecipeIngredient::new(2, "Bottled Water", 1.0, "pcs"));
        import_catalog(&state, &seed).unwrap();

        let conn = state.conn.lock().unwrap();
        let report = evaluator().evaluate(&conn, 1, "Regular").unwrap();
        assert!(report.available, "missing: {:?}", report.missing);
        assert!(report.missing.is_empty());
    }

    #[test]
    fn test_size_specific_ingredients_and_add_ons() {
        let state = db::test_state();
        let mut seed = milk_tea_seed(1000.0, 1000.0, 1000.0);
        seed.products.push(seed_product(10004, "Cream Cheese", 10.0));
        let mut large_only = RecipeIngredient::new(10002, "Creamer", 5000.0, "g");
        large_only.size_variant = Some("Large".into());
        seed.recipes[0].ingredients.push(large_only);
        seed.recipes[0].add_ons.push(AddOn {
            name: "Cheese Foam".into(),
            extra_cost: 25.0,
            ingredients: vec![RecipeIngredient::new(10004, "Cream Cheese", 15.0, "g")],
        });
        import_catalog(&state, &seed).unwrap();

        let conn = state.conn.lock().unwrap();
        assert!(evaluator().evaluate(&conn, 1, "Tall").unwrap().available);
        let venti = evaluator().evaluate(&conn, 1, "Venti").unwrap();
        assert_eq!(venti.missing, vec!["Creamer".to_string()]);

        // Add-ons never block the base drink; they are checked on their own.
        let foam = evaluator()
            .evaluate_add_on(&conn, 1, "Regular", "cheese foam")
            .unwrap();
        assert!(!foam.available);
        assert_eq!(foam.missing, vec!["Cream Cheese".to_string()]);
    }
}
