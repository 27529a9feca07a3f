//! Record types flowing through the pipeline
//!
//! Row-level types ([`RawRecord`], [`ValidatedRecord`], [`EnrichedRecord`])
//! deliberately do not implement `Serialize`: they stay inside a dataset's
//! processing scope. Only [`QuarantinedRow`] (line number and reason, no cell
//! values) is reported outward.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Canonical columns of a sales export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Sku,
    Description,
    Category,
    Lab,
    Quantity,
    UnitCost,
    UnitPrice,
    Date,
    Stock,
}

impl Column {
    /// Every canonical column, in index order
    pub const ALL: [Column; 9] = [
        Column::Sku,
        Column::Description,
        Column::Category,
        Column::Lab,
        Column::Quantity,
        Column::UnitCost,
        Column::UnitPrice,
        Column::Date,
        Column::Stock,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Column::Sku => "sku",
            Column::Description => "description",
            Column::Category => "category",
            Column::Lab => "lab",
            Column::Quantity => "quantity",
            Column::UnitCost => "unit_cost",
            Column::UnitPrice => "unit_price",
            Column::Date => "date",
            Column::Stock => "stock",
        }
    }

    /// Whether a dataset without this column is structurally invalid
    pub fn is_required(&self) -> bool {
        !matches!(self, Column::Stock)
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One parsed row
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub sku: String,
    pub description: String,
    pub category: String,
    pub lab: String,
    pub quantity: f64,
    pub unit_cost: f64,
    pub unit_price: f64,
    pub date: NaiveDate,
    pub stock: Option<f64>,

    /// Columns outside the canonical schema, by header name
    pub attributes: BTreeMap<String, String>,
}

/// A row that passed schema, type and range checks
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    /// 1-based line in the source payload
    pub line: u64,
    pub record: RawRecord,
}

/// Why a row was set aside
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "column")]
pub enum QuarantineReason {
    /// Required cell is empty or absent
    MissingValue(Column),

    /// Numeric cell does not parse as a number
    InvalidNumber(Column),

    /// Date cell is not a valid calendar date
    InvalidDate(Column),

    /// Numeric cell is negative
    OutOfRange(Column),

    /// Zero units sold while the policy forbids it
    ZeroQuantity,

    /// System placeholder product
    Placeholder,

    /// Row could not be read as delimited fields
    Malformed,
}

impl QuarantineReason {
    /// Stable label used for counting
    pub fn label(&self) -> String {
        match self {
            QuarantineReason::MissingValue(column) => format!("missing_value:{}", column),
            QuarantineReason::InvalidNumber(column) => format!("invalid_number:{}", column),
            QuarantineReason::InvalidDate(column) => format!("invalid_date:{}", column),
            QuarantineReason::OutOfRange(column) => format!("out_of_range:{}", column),
            QuarantineReason::ZeroQuantity => "zero_quantity".to_string(),
            QuarantineReason::Placeholder => "placeholder".to_string(),
            QuarantineReason::Malformed => "malformed".to_string(),
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// A quarantined row: where it was and why, never what it contained
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedRow {
    pub line: u64,
    pub reason: QuarantineReason,
}

/// Per-row extraction result
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Valid(ValidatedRecord),
    Quarantined(QuarantinedRow),
}

/// Price band of a product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceBand {
    Low,
    Medium,
    High,
    Premium,
    Luxury,
}

impl PriceBand {
    pub const ALL: [PriceBand; 5] = [
        PriceBand::Low,
        PriceBand::Medium,
        PriceBand::High,
        PriceBand::Premium,
        PriceBand::Luxury,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PriceBand::Low => "low",
            PriceBand::Medium => "medium",
            PriceBand::High => "high",
            PriceBand::Premium => "premium",
            PriceBand::Luxury => "luxury",
        }
    }
}

/// Sales rotation band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    None,
    Low,
    Medium,
    High,
}

impl Rotation {
    pub const ALL: [Rotation; 4] = [Rotation::None, Rotation::Low, Rotation::Medium, Rotation::High];

    pub fn name(&self) -> &'static str {
        match self {
            Rotation::None => "none",
            Rotation::Low => "low",
            Rotation::Medium => "medium",
            Rotation::High => "high",
        }
    }
}

/// Stock level band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockLevel {
    Out,
    Low,
    Medium,
    High,
}

impl StockLevel {
    pub const ALL: [StockLevel; 4] = [StockLevel::Out, StockLevel::Low, StockLevel::Medium, StockLevel::High];

    pub fn name(&self) -> &'static str {
        match self {
            StockLevel::Out => "out",
            StockLevel::Low => "low",
            StockLevel::Medium => "medium",
            StockLevel::High => "high",
        }
    }

    /// Whether a product at this level needs restocking
    pub fn is_alert(&self) -> bool {
        matches!(self, StockLevel::Out | StockLevel::Low)
    }
}

/// Revenue contribution class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AbcClass {
    A,
    B,
    C,
}

impl AbcClass {
    pub const ALL: [AbcClass; 3] = [AbcClass::A, AbcClass::B, AbcClass::C];

    pub fn name(&self) -> &'static str {
        match self {
            AbcClass::A => "a",
            AbcClass::B => "b",
            AbcClass::C => "c",
        }
    }
}

/// A validated record plus derived business fields
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    /// Dataset the row came from
    pub source: String,
    pub line: u64,

    pub sku: String,
    pub description: String,
    pub category: String,
    pub lab: String,
    pub quantity: f64,
    pub unit_cost: f64,
    pub unit_price: f64,
    pub date: NaiveDate,
    pub stock: Option<f64>,

    pub revenue: f64,
    pub cost_total: f64,
    pub profit: f64,
    pub unit_margin: f64,
    pub margin_pct: f64,
    pub profit_pct: f64,

    pub price_band: PriceBand,
    pub rotation: Rotation,
    pub stock_level: Option<StockLevel>,
    pub abc_class: AbcClass,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_columns() {
        let required: Vec<&str> = Column::ALL
            .iter()
            .filter(|c| c.is_required())
            .map(|c| c.name())
            .collect();
        assert_eq!(
            required,
            vec!["sku", "description", "category", "lab", "quantity", "unit_cost", "unit_price", "date"]
        );
        assert_eq!(Column::Stock.index(), 8);
    }

    #[test]
    fn test_quarantine_reason_serialization() {
        let row = QuarantinedRow { line: 4, reason: QuarantineReason::OutOfRange(Column::UnitPrice) };
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"line":4,"reason":{"kind":"out_of_range","column":"unit_price"}}"#);

        let parsed: QuarantinedRow = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, row);
        assert_eq!(QuarantineReason::ZeroQuantity.label(), "zero_quantity");
    }

    #[test]
    fn test_band_names_match_serialized_form() {
        for band in PriceBand::ALL {
            assert_eq!(serde_json::to_string(&band).unwrap(), format!("\"{}\"", band.name()));
        }
        for rotation in Rotation::ALL {
            assert_eq!(serde_json::to_string(&rotation).unwrap(), format!("\"{}\"", rotation.name()));
        }
        for level in StockLevel::ALL {
            assert_eq!(serde_json::to_string(&level).unwrap(), format!("\"{}\"", level.name()));
        }
        assert!(StockLevel::Out.is_alert());
        assert!(StockLevel::Low.is_alert());
        assert!(!StockLevel::Medium.is_alert());
        assert_eq!(AbcClass::ALL.map(|c| c.name()), ["a", "b", "c"]);
    }
}
