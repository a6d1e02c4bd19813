//! Shared data model: catalog products, recipes, sales, audit records and
//! pending sync operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifiers at or above this value are raw materials; anything below is a
/// sellable menu item.
pub const RAW_MATERIAL_ID_FLOOR: i64 = 10_000;

/// Quantities at or below this (and above zero) are LOW_STOCK.
pub const LOW_STOCK_THRESHOLD: f64 = 5.0;

pub fn is_raw_material(product_id: i64) -> bool {
    product_id >= RAW_MATERIAL_ID_FLOOR
}

pub fn is_menu_item(product_id: i64) -> bool {
    product_id < RAW_MATERIAL_ID_FLOOR
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockStatus {
    InStock,
    LowStock,
    OutOfStock,
}

impl StockStatus {
    /// Classify a quantity: `<= 0` is out of stock, `(0, low_threshold]` is
    /// low stock, everything else is in stock.
    pub fn classify(quantity: f64, low_threshold: f64) -> Self {
        if quantity <= 0.0 {
            StockStatus::OutOfStock
        } else if quantity <= low_threshold {
            StockStatus::LowStock
        } else {
            StockStatus::InStock
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::InStock => "IN_STOCK",
            StockStatus::LowStock => "LOW_STOCK",
            StockStatus::OutOfStock => "OUT_OF_STOCK",
        }
    }
}

impl fmt::Display for StockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IN_STOCK" => Ok(StockStatus::InStock),
            // Older catalogs used RUNNING_LOW for the same band.
            "LOW_STOCK" | "RUNNING_LOW" => Ok(StockStatus::LowStock),
            "OUT_OF_STOCK" => Ok(StockStatus::OutOfStock),
            other => Err(format!("unknown stock status: {other}")),
        }
    }
}

/// A catalog row. Raw materials and menu items share this shape and are told
/// apart only by their id range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub price: f64,
    pub quantity: f64,
    pub status: StockStatus,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Product {
    pub fn is_raw_material(&self) -> bool {
        is_raw_material(self.id)
    }
}

// ---------------------------------------------------------------------------
// Recipes (bill of materials)
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeIngredient {
    pub raw_material_id: i64,
    pub raw_material_name: String,
    pub quantity: f64,
    pub unit: String,
    /// `"All"`, a specific size label, or absent (applies to every size).
    #[serde(default)]
    pub size_variant: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub is_add_on: bool,
    #[serde(default)]
    pub add_on_name: Option<String>,
    #[serde(default)]
    pub add_on_extra_quantity: f64,
}

impl RecipeIngredient {
    pub fn new(raw_material_id: i64, name: &str, quantity: f64, unit: &str) -> Self {
        Self {
            raw_material_id,
            raw_material_name: name.to_string(),
            quantity,
            unit: unit.to_string(),
            size_variant: None,
            required: true,
            is_add_on: false,
            add_on_name: None,
            add_on_extra_quantity: 0.0,
        }
    }

    /// Only references into the raw-material id range count. A
    /// non-positive id was never mapped; an id below the floor names a menu
    /// item, which the ledger never deducts.
    pub fn is_mapped(&self) -> bool {
        is_raw_material(self.raw_material_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOn {
    pub name: String,
    #[serde(default)]
    pub extra_cost: f64,
    #[serde(default)]
    pub ingredients: Vec<RecipeIngredient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub menu_item_id: i64,
    /// Size-variant label: `Regular`, `Medium`, `Large` or `Default`.
    pub recipe_name: String,
    #[serde(default)]
    pub ingredients: Vec<RecipeIngredient>,
    #[serde(default)]
    pub add_ons: Vec<AddOn>,
}

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

/// One cart line as submitted by the checkout flow. The subtotal is trusted
/// as computed by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: i64,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub subtotal: f64,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub add_ons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub customer_name: String,
    pub payment_method: String,
    pub items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub id: String,
    pub cashier_id: i64,
    pub sale_date: String,
    pub total_amount: f64,
    pub customer_name: String,
    pub order_number: String,
    pub payment_method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleItem {
    pub id: i64,
    pub sale_id: String,
    pub product_id: i64,
    pub quantity: u32,
    pub price: f64,
    pub subtotal: f64,
    pub size: Option<String>,
    pub product_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleWithItems {
    pub sale: Sale,
    pub items: Vec<SaleItem>,
}

/// Result returned to the checkout flow once the sale is committed locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub sale_id: String,
    pub order_number: String,
    pub total_amount: f64,
    pub deductions_applied: usize,
    pub deductions_failed: usize,
}

/// Immutable audit entry for one raw-material deduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngredientDeduction {
    pub id: i64,
    pub sale_id: String,
    pub sale_item_id: i64,
    pub raw_material_id: i64,
    pub raw_material_name: String,
    pub quantity_deducted: f64,
    pub unit: String,
    pub menu_item_id: i64,
    pub menu_item_name: String,
    pub size_variant: Option<String>,
    pub add_ons: Option<String>,
    pub deducted_at: String,
}

// ---------------------------------------------------------------------------
// Sync queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncOperationKind {
    CreateSale,
    AdjustStock,
}

impl SyncOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperationKind::CreateSale => "CREATE_SALE",
            SyncOperationKind::AdjustStock => "ADJUST_STOCK",
        }
    }
}

impl fmt::Display for SyncOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncOperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE_SALE" => Ok(SyncOperationKind::CreateSale),
            "ADJUST_STOCK" => Ok(SyncOperationKind::AdjustStock),
            other => Err(format!("unknown sync operation kind: {other}")),
        }
    }
}

/// A queued write awaiting acknowledgement by the backend. `kind` is kept as
/// the raw stored string so rows written by a newer build still load.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSyncOperation {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub retry_count: u32,
    pub created_at: String,
}

impl PendingSyncOperation {
    pub fn parsed_kind(&self) -> Result<SyncOperationKind, String> {
        self.kind.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleItemRequest {
    pub product_id: i64,
    pub quantity: u32,
}

/// Body of `POST /api/sales`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSaleRequest {
    pub cashier_id: i64,
    pub items: Vec<SaleItemRequest>,
    #[serde(default)]
    pub sale_id: Option<String>,
    #[serde(default)]
    pub order_number: Option<String>,
}

/// Body of `POST /api/inventory/adjust-stock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockAdjustmentRequest {
    pub product_id: i64,
    pub quantity_change: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_partition_boundary() {
        assert!(is_menu_item(9_999));
        assert!(!is_raw_material(9_999));
        assert!(is_raw_material(10_000));
        assert!(!is_menu_item(10_000));
    }

    #[test]
    fn test_status_classification_bands() {
        assert_eq!(StockStatus::classify(-3.0, 5.0), StockStatus::OutOfStock);
        assert_eq!(StockStatus::classify(0.0, 5.0), StockStatus::OutOfStock);
        assert_eq!(StockStatus::classify(0.5, 5.0), StockStatus::LowStock);
        assert_eq!(StockStatus::classify(5.0, 5.0), StockStatus::LowStock);
        assert_eq!(StockStatus::classify(5.01, 5.0), StockStatus::InStock);
    }

    #[test]
    fn test_status_parses_legacy_running_low() {
        assert_eq!(
            "running_low".parse::<StockStatus>().unwrap(),
            StockStatus::LowStock
        );
        assert!("sold_out".parse::<StockStatus>().is_err());
    }

    #[test]
    fn test_recipe_ingredient_defaults_when_decoding() {
        let ingredient: RecipeIngredient = serde_json::from_value(serde_json::json!({
            "rawMaterialId": 10001,
            "rawMaterialName": "Tea",
            "quantity": 150.0,
            "unit": "ml"
        }))
        .unwrap();
        assert!(ingredient.required);
        assert!(!ingredient.is_add_on);
        assert_eq!(ingredient.size_variant, None);
        assert_eq!(ingredient.add_on_extra_quantity, 0.0);
    }

    #[test]
    fn test_sync_kind_rejects_unknown_labels() {
        assert_eq!(
            "CREATE_SALE".parse::<SyncOperationKind>().unwrap(),
            SyncOperationKind::CreateSale
        );
        assert!("DELETE_PRODUCT".parse::<SyncOperationKind>().is_err());
    }
}
