//! Recipe store and resolver.
//!
//! A menu item owns one recipe per size variant. Each recipe row holds a JSON
//! document (ingredients + add-ons) that is decoded into a [`Recipe`] once
//! per lookup.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PosResult;
use crate::models::{AddOn, Recipe, RecipeIngredient};

pub const DEFAULT_RECIPE_NAME: &str = "Default";

/// Map the size labels used at the counter onto recipe names.
pub fn normalize_size(size: &str) -> String {
    let trimmed = size.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "tall" | "small" | "regular" => "Regular".to_string(),
        "grande" | "medium" => "Medium".to_string(),
        "venti" | "large" => "Large".to_string(),
        _ => trimmed.to_string(),
    }
}

/// Whether an ingredient labelled `variant` is used at `size`.
pub fn size_applies(variant: Option<&str>, size: &str) -> bool {
    let Some(label) = variant.map(str::trim) else {
        return true;
    };
    if label.is_empty() || label.eq_ignore_ascii_case("all") {
        return true;
    }
    label.eq_ignore_ascii_case(size.trim()) || label.eq_ignore_ascii_case(&normalize_size(size))
}

/// Per-raw-material quantity required to make one unit of a line.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    pub raw_material_id: i64,
    pub raw_material_name: String,
    pub quantity: f64,
    pub unit: String,
}

fn accumulate(needs: &mut Vec<Requirement>, ingredient: &RecipeIngredient, quantity: f64) {
    if quantity <= 0.0 {
        return;
    }
    match needs
        .iter_mut()
        .find(|n| n.raw_material_id == ingredient.raw_material_id)
    {
        Some(existing) => existing.quantity += quantity,
        None => needs.push(Requirement {
            raw_material_id: ingredient.raw_material_id,
            raw_material_name: ingredient.raw_material_name.clone(),
            quantity,
            unit: ingredient.unit.clone(),
        }),
    }
}

fn selected(add_ons: &[String], name: &str) -> bool {
    add_ons.iter().any(|a| a.trim().eq_ignore_ascii_case(name.trim()))
}

impl Recipe {
    /// Raw materials consumed by one unit at `size` with `add_ons` selected,
    /// merged per raw material in first-seen order.
    pub fn requirements(&self, size: &str, add_ons: &[String]) -> Vec<Requirement> {
        let mut needs = Vec::new();

        for ingredient in self.ingredients.iter().filter(|i| !i.is_add_on) {
            if !size_applies(ingredient.size_variant.as_deref(), size) {
                continue;
            }
            if !ingredient.is_mapped() {
                warn!(
                    menu_item_id = self.menu_item_id,
                    ingredient = %ingredient.raw_material_name,
                    "Unmapped recipe ingredient, skipping"
                );
                continue;
            }
            accumulate(&mut needs, ingredient, ingredient.quantity);
        }

        for ingredient in self.ingredients.iter().filter(|i| i.is_add_on) {
            let Some(name) = ingredient.add_on_name.as_deref() else {
                continue;
            };
            if !selected(add_ons, name) || !size_applies(ingredient.size_variant.as_deref(), size) {
                continue;
            }
            if !ingredient.is_mapped() {
                warn!(
                    menu_item_id = self.menu_item_id,
                    add_on = name,
                    "Unmapped add-on ingredient, skipping"
                );
                continue;
            }
            accumulate(
                &mut needs,
                ingredient,
                ingredient.quantity + ingredient.add_on_extra_quantity,
            );
        }

        for add_on in self.add_ons.iter().filter(|a| selected(add_ons, &a.name)) {
            for ingredient in &add_on.ingredients {
                if !size_applies(ingredient.size_variant.as_deref(), size) {
                    continue;
                }
                if !ingredient.is_mapped() {
                    warn!(
                        menu_item_id = self.menu_item_id,
                        add_on = %add_on.name,
                        "Unmapped add-on ingredient, skipping"
                    );
                    continue;
                }
                let extra = if ingredient.is_add_on {
                    ingredient.add_on_extra_quantity
                } else {
                    0.0
                };
                accumulate(&mut needs, ingredient, ingredient.quantity + extra);
            }
        }

        needs
    }

    pub fn add_on(&self, name: &str) -> Option<&AddOn> {
        self.add_ons.iter().find(|a| a.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Every raw material this recipe can ever touch, across sizes and
    /// add-ons.
    pub fn referenced_raw_materials(&self) -> impl Iterator<Item = i64> + '_ {
        self.ingredients
            .iter()
            .chain(self.add_ons.iter().flat_map(|a| a.ingredients.iter()))
            .filter(|i| i.is_mapped())
            .map(|i| i.raw_material_id)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecipeDocument {
    #[serde(default)]
    ingredients: Vec<RecipeIngredient>,
    #[serde(default)]
    add_ons: Vec<AddOn>,
}

fn decode(menu_item_id: i64, recipe_name: String, document: &str) -> PosResult<Recipe> {
    let doc: RecipeDocument = serde_json::from_str(document)?;
    Ok(Recipe {
        menu_item_id,
        recipe_name,
        ingredients: doc.ingredients,
        add_ons: doc.add_ons,
    })
}

/// Insert or replace the recipe for `(menu_item_id, recipe_name)`.
pub fn save_recipe(conn: &Connection, recipe: &Recipe) -> PosResult<()> {
    let document = serde_json::to_string(&RecipeDocument {
        ingredients: recipe.ingredients.clone(),
        add_ons: recipe.add_ons.clone(),
    })?;
    conn.execute(
        "INSERT INTO recipes (menu_item_id, recipe_name, document, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(menu_item_id, recipe_name) DO UPDATE SET
            document = excluded.document,
            updated_at = excluded.updated_at",
        params![recipe.menu_item_id, recipe.recipe_name, document],
    )?;
    Ok(())
}

/// All recipes owned by a menu item, in stored order.
pub fn recipes_for(conn: &Connection, menu_item_id: i64) -> PosResult<Vec<Recipe>> {
    let mut stmt = conn.prepare(
        "SELECT recipe_name, document FROM recipes WHERE menu_item_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt.query_map(params![menu_item_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut recipes = Vec::new();
    for row in rows {
        let (name, document) = row?;
        recipes.push(decode(menu_item_id, name, &document)?);
    }
    Ok(recipes)
}

/// Every stored recipe. Rows that fail to decode are logged and skipped so a
/// single bad document cannot hide the rest of the menu.
pub fn all_recipes(conn: &Connection) -> PosResult<Vec<Recipe>> {
    let mut stmt = conn.prepare(
        "SELECT menu_item_id, recipe_name, document FROM recipes ORDER BY menu_item_id, rowid",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut recipes = Vec::new();
    for row in rows {
        let (menu_item_id, name, document) = row?;
        match decode(menu_item_id, name, &document) {
            Ok(recipe) => recipes.push(recipe),
            Err(e) => warn!(menu_item_id, "Skipping undecodable recipe: {e}"),
        }
    }
    Ok(recipes)
}

pub fn has_recipes(conn: &Connection, menu_item_id: i64) -> PosResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM recipes WHERE menu_item_id = ?1 LIMIT 1",
            params![menu_item_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Pick the recipe for a size: exact normalized name, then `Default`, then
/// the first stored. `None` means the item has no bill of materials.
pub fn resolve(conn: &Connection, menu_item_id: i64, size: &str) -> PosResult<Option<Recipe>> {
    let recipes = recipes_for(conn, menu_item_id)?;
    Ok(pick(recipes, size))
}

fn pick(mut recipes: Vec<Recipe>, size: &str) -> Option<Recipe> {
    if recipes.is_empty() {
        return None;
    }
    let normalized = normalize_size(size);
    let index = recipes
        .iter()
        .position(|r| r.recipe_name.eq_ignore_ascii_case(&normalized))
        .or_else(|| {
            recipes
                .iter()
                .position(|r| r.recipe_name == DEFAULT_RECIPE_NAME)
        })
        .unwrap_or(0);
    let recipe = recipes.swap_remove(index);
    debug!(
        menu_item_id = recipe.menu_item_id,
        size, recipe = %recipe.recipe_name, "Resolved recipe"
    );
    Some(recipe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn ingredient(id: i64, name: &str, qty: f64, unit: &str) -> RecipeIngredient {
        RecipeIngredient::new(id, name, qty, unit)
    }

    fn recipe(menu_item_id: i64, name: &str, ingredients: Vec<RecipeIngredient>) -> Recipe {
        Recipe {
            menu_item_id,
            recipe_name: name.to_string(),
            ingredients,
            add_ons: vec![],
        }
    }

    #[test]
    fn test_normalize_size_mapping() {
        assert_eq!(normalize_size("Tall"), "Regular");
        assert_eq!(normalize_size("small"), "Regular");
        assert_eq!(normalize_size("GRANDE"), "Medium");
        assert_eq!(normalize_size("Medium"), "Medium");
        assert_eq!(normalize_size("venti"), "Large");
        assert_eq!(normalize_size(" Large "), "Large");
        assert_eq!(normalize_size("Jumbo"), "Jumbo");
    }

    #[test]
    fn test_size_applies() {
        assert!(size_applies(None, "Large"));
        assert!(size_applies(Some(""), "Large"));
        assert!(size_applies(Some("All"), "Large"));
        assert!(size_applies(Some("Venti"), "venti"));
        assert!(size_applies(Some("Large"), "Venti"));
        assert!(!size_applies(Some("Regular"), "Large"));
    }

    #[test]
    fn test_resolution_order() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        save_recipe(&conn, &recipe(1, "Large", vec![])).unwrap();
        save_recipe(&conn, &recipe(1, "Default", vec![])).unwrap();
        save_recipe(&conn, &recipe(2, "Medium", vec![])).unwrap();
        save_recipe(&conn, &recipe(2, "Large", vec![])).unwrap();

        assert_eq!(resolve(&conn, 1, "Venti").unwrap().unwrap().recipe_name, "Large");
        assert_eq!(resolve(&conn, 1, "Tall").unwrap().unwrap().recipe_name, "Default");
        // No exact match, no Default: first stored.
        assert_eq!(resolve(&conn, 2, "Small").unwrap().unwrap().recipe_name, "Medium");
        assert!(resolve(&conn, 3, "Regular").unwrap().is_none());
    }

    #[test]
    fn test_save_replaces_document() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        save_recipe(&conn, &recipe(1, "Default", vec![ingredient(10001, "Tea", 150.0, "ml")]))
            .unwrap();
        save_recipe(&conn, &recipe(1, "Default", vec![ingredient(10001, "Tea", 120.0, "ml")]))
            .unwrap();

        let stored = recipes_for(&conn, 1).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].ingredients[0].quantity, 120.0);
        assert!(has_recipes(&conn, 1).unwrap());
        assert!(!has_recipes(&conn, 2).unwrap());
    }

    #[test]
    fn test_requirements_merge_sizes_and_add_ons() {
        let mut large_tea = ingredient(10001, "Tea", 50.0, "ml");
        large_tea.size_variant = Some("Large".into());
        let mut pearls_flag = ingredient(10003, "Pearls", 30.0, "g");
        pearls_flag.is_add_on = true;
        pearls_flag.add_on_name = Some("Extra Pearls".into());
        pearls_flag.add_on_extra_quantity = 20.0;
        let mut unmapped = ingredient(0, "Mystery", 5.0, "g");
        unmapped.size_variant = Some("All".into());

        let mut r = recipe(
            1,
            "Default",
            vec![
                ingredient(10001, "Tea", 150.0, "ml"),
                large_tea,
                ingredient(10002, "Creamer", 30.0, "g"),
                pearls_flag,
                unmapped,
            ],
        );
        r.add_ons.push(AddOn {
            name: "Cheese Foam".into(),
            extra_cost: 25.0,
            ingredients: vec![
                ingredient(10004, "Cream Cheese", 15.0, "g"),
                ingredient(10002, "Creamer", 10.0, "g"),
            ],
        });

        let plain = r.requirements("Regular", &[]);
        assert_eq!(plain.len(), 2);
        assert_eq!(plain[0].quantity, 150.0);
        assert_eq!(plain[1].quantity, 30.0);

        let loaded = r.requirements(
            "Venti",
            &["extra pearls".to_string(), "Cheese Foam".to_string()],
        );
        let qty = |id: i64| loaded.iter().find(|n| n.raw_material_id == id).unwrap().quantity;
        assert_eq!(qty(10001), 200.0);
        assert_eq!(qty(10002), 40.0);
        assert_eq!(qty(10003), 50.0);
        assert_eq!(qty(10004), 15.0);
        assert!(loaded.iter().all(|n| n.raw_material_id > 0));
    }

    #[test]
    fn test_all_recipes_skips_bad_documents() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        save_recipe(&conn, &recipe(1, "Default", vec![])).unwrap();
        conn.execute(
            "INSERT INTO recipes (menu_item_id, recipe_name, document) VALUES (2, 'Default', 'not json')",
            [],
        )
        .unwrap();

        let all = all_recipes(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert!(recipes_for(&conn, 2).is_err());
    }
}
