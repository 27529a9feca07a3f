//! Business rules over validated rows
//!
//! Four passes: normalisation and deduplication (keyed by sku, date and
//! source dataset), per-row derived metrics and bands, and a single
//! revenue-sorted pass assigning ABC classes. The ABC pass needs the whole
//! dataset, so the transformer works on a materialised `Vec`.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::TransformConfig;
use crate::model::{AbcClass, EnrichedRecord, PriceBand, Rotation, StockLevel, ValidatedRecord};

/// Result of transforming one dataset
#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub records: Vec<EnrichedRecord>,
    pub stats: TransformStats,
}

/// Data-quality counters of one transform run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformStats {
    pub duplicates_collapsed: u64,
    pub negative_margin_rows: u64,
    pub zero_price_rows: u64,
}

/// Applies normalisation, deduplication and derived metrics
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    config: TransformConfig,
}

impl Transformer {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }

    /// Transform the validated rows of dataset `source`
    pub fn transform(&self, source: &str, records: Vec<ValidatedRecord>) -> TransformOutput {
        let normalized = records.into_iter().map(normalize).collect();
        let (deduplicated, duplicates_collapsed) = deduplicate(normalized);

        let mut stats = TransformStats { duplicates_collapsed, ..TransformStats::default() };
        let mut enriched: Vec<EnrichedRecord> = deduplicated
            .into_iter()
            .map(|row| self.enrich(source, row))
            .collect();

        for record in &enriched {
            if record.unit_price == 0.0 {
                stats.zero_price_rows += 1;
            }
            if record.unit_margin < 0.0 {
                stats.negative_margin_rows += 1;
            }
        }

        self.assign_abc(&mut enriched);

        if stats.duplicates_collapsed > 0 {
            tracing::info!(dataset = %source, duplicates = stats.duplicates_collapsed, "Collapsed duplicate rows");
        }
        if stats.negative_margin_rows > 0 {
            tracing::warn!(dataset = %source, rows = stats.negative_margin_rows, "Rows priced below cost");
        }

        TransformOutput { records: enriched, stats }
    }

    fn enrich(&self, source: &str, row: ValidatedRecord) -> EnrichedRecord {
        let ValidatedRecord { line, record } = row;

        let revenue = round_cents(record.unit_price * record.quantity);
        let cost_total = round_cents(record.unit_cost * record.quantity);
        let profit = round_cents(revenue - cost_total);
        let unit_margin = round_cents(record.unit_price - record.unit_cost);

        let margin_pct = if record.unit_price > 0.0 {
            unit_margin / record.unit_price * 100.0
        } else {
            0.0
        };
        let profit_pct = if revenue > 0.0 { profit / revenue * 100.0 } else { 0.0 };

        EnrichedRecord {
            source: source.to_string(),
            line,
            price_band: self.price_band(record.unit_price),
            rotation: self.rotation(record.quantity),
            stock_level: record.stock.map(|stock| self.stock_level(stock)),
            abc_class: AbcClass::C,
            sku: record.sku,
            description: record.description,
            category: record.category,
            lab: record.lab,
            quantity: record.quantity,
            unit_cost: record.unit_cost,
            unit_price: record.unit_price,
            date: record.date,
            stock: record.stock,
            revenue,
            cost_total,
            profit,
            unit_margin,
            margin_pct,
            profit_pct,
        }
    }

    /// Price band of a unit price
    pub fn price_band(&self, price: f64) -> PriceBand {
        let [low, medium, high, premium] = self.config.price_band_limits;
        if price <= low {
            PriceBand::Low
        } else if price <= medium {
            PriceBand::Medium
        } else if price <= high {
            PriceBand::High
        } else if price <= premium {
            PriceBand::Premium
        } else {
            PriceBand::Luxury
        }
    }

    /// Rotation band of a sold quantity
    pub fn rotation(&self, quantity: f64) -> Rotation {
        let [none, low, medium] = self.config.rotation_limits;
        if quantity <= none {
            Rotation::None
        } else if quantity <= low {
            Rotation::Low
        } else if quantity <= medium {
            Rotation::Medium
        } else {
            Rotation::High
        }
    }

    /// Stock level band of a stock count
    pub fn stock_level(&self, stock: f64) -> StockLevel {
        let [out, low, medium] = self.config.stock_limits;
        if stock <= out {
            StockLevel::Out
        } else if stock <= low {
            StockLevel::Low
        } else if stock <= medium {
            StockLevel::Medium
        } else {
            StockLevel::High
        }
    }

    /// Classify products by cumulative revenue share. A product belongs to
    /// the class whose threshold the share accumulated before it has not
    /// yet reached, so the top product is always A when revenue exists.
    fn assign_abc(&self, records: &mut [EnrichedRecord]) {
        let classes: HashMap<String, AbcClass> = abc_classes(
            records.iter().map(|r| (r.sku.as_str(), r.revenue)),
            self.config.abc_a_share,
            self.config.abc_b_share,
        )
        .into_iter()
        .map(|(sku, class)| (sku.to_string(), class))
        .collect();

        for record in records.iter_mut() {
            record.abc_class = classes.get(record.sku.as_str()).copied().unwrap_or(AbcClass::C);
        }
    }
}

/// ABC class per sku from `(sku, revenue)` pairs. Products are ranked by
/// revenue descending, ties by sku ascending.
pub fn abc_classes<'a>(
    revenues: impl Iterator<Item = (&'a str, f64)>,
    a_share: f64,
    b_share: f64,
) -> BTreeMap<&'a str, AbcClass> {
    let mut per_product: BTreeMap<&str, f64> = BTreeMap::new();
    for (sku, revenue) in revenues {
        *per_product.entry(sku).or_insert(0.0) += revenue;
    }

    let total: f64 = per_product.values().sum();
    let mut ranked: Vec<(&str, f64)> = per_product.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut classes = BTreeMap::new();
    let mut cumulative = 0.0;
    for (sku, revenue) in ranked {
        let class = if total <= 0.0 {
            AbcClass::C
        } else {
            let share_before = cumulative / total;
            if share_before < a_share {
                AbcClass::A
            } else if share_before < b_share {
                AbcClass::B
            } else {
                AbcClass::C
            }
        };
        cumulative += revenue;
        classes.insert(sku, class);
    }
    classes
}

/// Canonical text and cent-rounded amounts
pub fn normalize(mut row: ValidatedRecord) -> ValidatedRecord {
    row.record.sku = row.record.sku.trim().to_string();
    row.record.category = normalize_code(&row.record.category);
    row.record.lab = normalize_code(&row.record.lab);
    row.record.unit_cost = round_cents(row.record.unit_cost);
    row.record.unit_price = round_cents(row.record.unit_price);
    row
}

/// Collapse rows sharing sku and date, keeping the latest-seen values in
/// the position of the first occurrence. Returns the rows and the number
/// of rows collapsed.
pub fn deduplicate(rows: Vec<ValidatedRecord>) -> (Vec<ValidatedRecord>, u64) {
    let mut positions: HashMap<(String, NaiveDate), usize> = HashMap::with_capacity(rows.len());
    let mut kept: Vec<ValidatedRecord> = Vec::with_capacity(rows.len());
    let mut collapsed = 0u64;

    for row in rows {
        let key = (row.record.sku.clone(), row.record.date);
        match positions.get(&key) {
            Some(&index) => {
                kept[index] = row;
                collapsed += 1;
            }
            None => {
                positions.insert(key, kept.len());
                kept.push(row);
            }
        }
    }

    (kept, collapsed)
}

/// Trim, collapse inner whitespace and uppercase a category or lab code
pub fn normalize_code(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase()
}

/// Round a currency amount to cents
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawRecord;

    fn row(line: u64, sku: &str, quantity: f64, cost: f64, price: f64, day: u32) -> ValidatedRecord {
        ValidatedRecord {
            line,
            record: RawRecord {
                sku: sku.to_string(),
                description: format!("Producto {}", sku),
                category: "  analgesicos   orales ".to_string(),
                lab: "bago".to_string(),
                quantity,
                unit_cost: cost,
                unit_price: price,
                date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
                stock: Some(4.0),
                attributes: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_derived_fields() {
        let output = Transformer::default().transform("enero", vec![row(2, "A1", 10.0, 5.0, 8.0, 15)]);
        let record = &output.records[0];

        assert_eq!(record.source, "enero");
        assert_eq!(record.category, "ANALGESICOS ORALES");
        assert_eq!(record.lab, "BAGO");
        assert_eq!(record.revenue, 80.0);
        assert_eq!(record.cost_total, 50.0);
        assert_eq!(record.profit, 30.0);
        assert_eq!(record.unit_margin, 3.0);
        assert!((record.margin_pct - 37.5).abs() < 1e-9);
        assert!((record.profit_pct - 37.5).abs() < 1e-9);
        assert_eq!(record.price_band, PriceBand::Low);
        assert_eq!(record.rotation, Rotation::High);
        assert_eq!(record.stock_level, Some(StockLevel::Low));
        assert_eq!(record.abc_class, AbcClass::A);
    }

    #[test]
    fn test_quality_counters() {
        let rows = vec![row(2, "A1", 1.0, 5.0, 0.0, 1), row(3, "A2", 1.0, 9.0, 8.0, 1)];
        let output = Transformer::default().transform("enero", rows);

        assert_eq!(output.stats.zero_price_rows, 1);
        assert_eq!(output.stats.negative_margin_rows, 2);
        assert_eq!(output.records[0].margin_pct, 0.0);
    }

    #[test]
    fn test_deduplicate_keeps_latest_in_first_position() {
        let rows = vec![
            row(2, "A1", 10.0, 5.0, 8.0, 15),
            row(3, "B1", 1.0, 5.0, 8.0, 15),
            row(4, "A1", 12.0, 5.0, 8.0, 15),
            row(5, "A1", 10.0, 5.0, 8.0, 16),
        ];
        let (kept, collapsed) = deduplicate(rows);

        assert_eq!(collapsed, 1);
        let summary: Vec<(&str, u64, f64)> = kept
            .iter()
            .map(|r| (r.record.sku.as_str(), r.line, r.record.quantity))
            .collect();
        assert_eq!(summary, vec![("A1", 4, 12.0), ("B1", 3, 1.0), ("A1", 5, 10.0)]);
    }

    #[test]
    fn test_transform_is_idempotent_on_deduplicated_input() {
        let rows = vec![
            row(2, "A1", 10.0, 5.0, 8.0, 15),
            row(3, "A1", 10.0, 5.0, 8.0, 15),
            row(4, "C3", 2.0, 1.333, 2.499, 15),
        ];
        let transformer = Transformer::default();

        let (once, _) = deduplicate(rows.into_iter().map(normalize).collect());
        let (twice, collapsed) = deduplicate(once.clone().into_iter().map(normalize).collect());
        assert_eq!(collapsed, 0);
        assert_eq!(once, twice);

        let first = transformer.transform("enero", once);
        let second = transformer.transform("enero", twice);
        assert_eq!(first.records, second.records);
    }

    #[test]
    fn test_abc_classes() {
        let revenues = vec![("A", 50.0), ("B", 30.0), ("C", 15.0), ("D", 5.0), ("A", 0.0)];
        let classes = abc_classes(revenues.into_iter(), 0.80, 0.95);

        assert_eq!(classes["A"], AbcClass::A);
        assert_eq!(classes["B"], AbcClass::A);
        assert_eq!(classes["C"], AbcClass::B);
        assert_eq!(classes["D"], AbcClass::C);
    }

    #[test]
    fn test_abc_ties_and_zero_revenue() {
        let tied = abc_classes(vec![("Z", 10.0), ("Y", 10.0)].into_iter(), 0.5, 0.9);
        assert_eq!(tied["Y"], AbcClass::A);
        assert_eq!(tied["Z"], AbcClass::B);

        let zero = abc_classes(vec![("A", 0.0), ("B", 0.0)].into_iter(), 0.8, 0.95);
        assert!(zero.values().all(|c| *c == AbcClass::C));
    }

    #[test]
    fn test_bands() {
        let transformer = Transformer::default();
        assert_eq!(transformer.price_band(4_999.99), PriceBand::Low);
        assert_eq!(transformer.price_band(5_000.0), PriceBand::Low);
        assert_eq!(transformer.price_band(5_000.01), PriceBand::Medium);
        assert_eq!(transformer.price_band(10_000.0), PriceBand::Medium);
        assert_eq!(transformer.price_band(10_000.01), PriceBand::High);
        assert_eq!(transformer.price_band(20_000.0), PriceBand::High);
        assert_eq!(transformer.price_band(50_000.0), PriceBand::Premium);
        assert_eq!(transformer.price_band(50_000.01), PriceBand::Luxury);

        assert_eq!(transformer.rotation(0.0), Rotation::None);
        assert_eq!(transformer.rotation(1.0), Rotation::Low);
        assert_eq!(transformer.rotation(5.0), Rotation::Medium);
        assert_eq!(transformer.rotation(6.0), Rotation::High);

        assert_eq!(transformer.stock_level(0.0), StockLevel::Out);
        assert_eq!(transformer.stock_level(20.0), StockLevel::Medium);
        assert_eq!(transformer.stock_level(21.0), StockLevel::High);
    }

    #[test]
    fn test_round_cents() {
        assert_eq!(round_cents(10.0 / 3.0), 3.33);
        assert_eq!(round_cents(2.499), 2.5);
        assert_eq!(round_cents(round_cents(1.337)), round_cents(1.337));
    }
}
