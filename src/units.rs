//! Package-size parsing and unit conversion.
//!
//! Stock for a packaged raw material is counted in packages; the package size
//! lives in the display name as `"Black Tea Base | 6 L"`. Recipes ask for
//! millilitres or grams, so availability checks convert the package count to
//! the recipe's unit before comparing.

use tracing::warn;

use crate::config::DEFAULT_ML_PER_GRAM;

#[derive(Debug, Clone, PartialEq)]
pub enum Unit {
    Milliliter,
    Liter,
    Gram,
    Kilogram,
    Other(String),
}

impl Unit {
    pub fn parse(raw: &str) -> Self {
        let lower = raw.trim().to_ascii_lowercase();
        match lower.as_str() {
            "ml" | "milliliter" | "millilitre" | "milliliters" | "millilitres" => Unit::Milliliter,
            "l" | "liter" | "litre" | "liters" | "litres" => Unit::Liter,
            "g" | "gram" | "grams" => Unit::Gram,
            "kg" | "kilogram" | "kilograms" => Unit::Kilogram,
            _ => Unit::Other(lower),
        }
    }

    /// Volume expressed in ml, weight in g.
    fn to_base_factor(&self) -> Option<(Dimension, f64)> {
        match self {
            Unit::Milliliter => Some((Dimension::Volume, 1.0)),
            Unit::Liter => Some((Dimension::Volume, 1000.0)),
            Unit::Gram => Some((Dimension::Weight, 1.0)),
            Unit::Kilogram => Some((Dimension::Weight, 1000.0)),
            Unit::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Volume,
    Weight,
}

/// The `size unit` half of a `name | size unit` display name.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageDescriptor {
    pub size: f64,
    pub unit: Unit,
}

impl PackageDescriptor {
    /// Parse the descriptor out of a product display name. Returns `None`
    /// when the name carries no `|` or the size part is unreadable.
    pub fn from_display_name(display_name: &str) -> Option<Self> {
        let (_, size_part) = display_name.split_once('|')?;
        let size_part = size_part.trim();

        // Accept both "6 L" and "6L".
        let split_at = size_part
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(size_part.len());
        let (number, unit) = size_part.split_at(split_at);
        let size: f64 = number.trim().parse().ok()?;
        let unit = unit.trim();
        if unit.is_empty() || !size.is_finite() {
            return None;
        }
        Some(Self {
            size,
            unit: Unit::parse(unit.split_whitespace().next().unwrap_or(unit)),
        })
    }
}

/// Outcome of a conversion. Every variant carries a usable number so callers
/// never have to fail an operation over catalog data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Conversion {
    Converted(f64),
    /// The name has no package descriptor; stock is already in recipe units.
    Unpackaged(f64),
    /// Descriptor unreadable or no path between the units. Holds the raw
    /// package count.
    Unconvertible(f64),
}

impl Conversion {
    pub fn value(&self) -> f64 {
        match *self {
            Conversion::Converted(v) | Conversion::Unpackaged(v) | Conversion::Unconvertible(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConverter {
    ml_per_gram: f64,
}

impl Default for UnitConverter {
    fn default() -> Self {
        Self::new(DEFAULT_ML_PER_GRAM)
    }
}

impl UnitConverter {
    pub fn new(ml_per_gram: f64) -> Self {
        Self { ml_per_gram }
    }

    /// Convert `packages` of the product named `display_name` into
    /// `target_unit`.
    pub fn convert(&self, packages: f64, display_name: &str, target_unit: &str) -> Conversion {
        if !display_name.contains('|') {
            return Conversion::Unpackaged(packages);
        }
        let Some(descriptor) = PackageDescriptor::from_display_name(display_name) else {
            return Conversion::Unconvertible(packages);
        };
        let total = packages * descriptor.size;
        match self.convert_amount(total, &descriptor.unit, &Unit::parse(target_unit)) {
            Some(v) => Conversion::Converted(v),
            None => Conversion::Unconvertible(packages),
        }
    }

    /// Convert, logging a data-quality warning when the catalog entry could
    /// not be interpreted.
    pub fn convert_logged(&self, packages: f64, display_name: &str, target_unit: &str) -> f64 {
        let conversion = self.convert(packages, display_name, target_unit);
        if let Conversion::Unconvertible(raw) = conversion {
            warn!(
                product = display_name,
                target_unit, "No unit conversion path, using raw package count {raw}"
            );
        }
        conversion.value()
    }

    pub fn convert_amount(&self, amount: f64, from: &Unit, to: &Unit) -> Option<f64> {
        if from == to {
            return Some(amount);
        }
        let (from_dim, from_factor) = from.to_base_factor()?;
        let (to_dim, to_factor) = to.to_base_factor()?;
        let base = amount * from_factor;
        let base = match (from_dim, to_dim) {
            (a, b) if a == b => base,
            (Dimension::Weight, Dimension::Volume) => base * self.ml_per_gram,
            (Dimension::Volume, Dimension::Weight) => base / self.ml_per_gram,
            _ => return None,
        };
        Some(base / to_factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converted(c: Conversion) -> f64 {
        match c {
            Conversion::Converted(v) => v,
            other => panic!("expected a conversion, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_descriptor_forms() {
        let d = PackageDescriptor::from_display_name("Black Tea Base | 6 L").unwrap();
        assert_eq!(d.size, 6.0);
        assert_eq!(d.unit, Unit::Liter);

        let d = PackageDescriptor::from_display_name("Creamer |545g").unwrap();
        assert_eq!(d.size, 545.0);
        assert_eq!(d.unit, Unit::Gram);

        let d = PackageDescriptor::from_display_name("Syrup | 750 Millilitre bottle").unwrap();
        assert_eq!(d.unit, Unit::Milliliter);

        assert!(PackageDescriptor::from_display_name("Cups | large").is_none());
        assert!(PackageDescriptor::from_display_name("Cups | 12").is_none());
        assert!(PackageDescriptor::from_display_name("Plain Cups").is_none());
    }

    #[test]
    fn test_volume_and_weight_scaling() {
        let c = UnitConverter::default();
        assert_eq!(converted(c.convert(100.0, "Black Tea Base | 6 L", "ml")), 600_000.0);
        assert_eq!(converted(c.convert(2.0, "Milk | 750 ml", "L")), 1.5);
        assert_eq!(converted(c.convert(3.0, "Sugar | 1 kg", "g")), 3000.0);
        assert_eq!(converted(c.convert(4.0, "Pearls | 250 g", "kg")), 1.0);
        assert_eq!(converted(c.convert(2.0, "Milk | 750 ml", "milliliter")), 1500.0);
    }

    #[test]
    fn test_liquid_density_approximation_is_overridable() {
        let c = UnitConverter::default();
        assert_eq!(converted(c.convert(1.0, "Milk | 1 L", "g")), 1000.0);
        assert_eq!(converted(c.convert(2.0, "Condensed | 1 kg", "ml")), 2000.0);

        let dense = UnitConverter::new(2.0);
        assert_eq!(converted(dense.convert(1.0, "Honey | 500 g", "ml")), 1000.0);
        assert_eq!(converted(dense.convert(1.0, "Honey | 1 L", "g")), 500.0);
    }

    #[test]
    fn test_fallbacks_keep_raw_count() {
        let c = UnitConverter::default();
        assert_eq!(c.convert(200.0, "Tea", "ml"), Conversion::Unpackaged(200.0));
        assert_eq!(c.convert(7.0, "Cups | 50 pcs", "ml"), Conversion::Unconvertible(7.0));
        assert_eq!(c.convert(7.0, "Lids | ??", "pcs"), Conversion::Unconvertible(7.0));
        assert_eq!(c.convert_logged(7.0, "Cups | 50 pcs", "g"), 7.0);
    }

    #[test]
    fn test_same_unknown_unit_passes_through() {
        let c = UnitConverter::default();
        assert_eq!(converted(c.convert(3.0, "Cups | 50 pcs", "PCS")), 150.0);
    }
}
