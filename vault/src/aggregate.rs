//! Aggregator: enriched rows to presentation-safe summaries
//!
//! Records are first reduced into a [`Rollup`] (product, lab, category,
//! per-day and per-band totals). Rollups merge associatively, so a batch result is the
//! merge of per-dataset rollups finalised once, which keeps cross-dataset
//! KPIs such as unique products and ABC counts exact. [`AggregateResult`]
//! is the only type that leaves the pipeline; it names products by sku and
//! carries no row-level values.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::config::{AggregationConfig, TransformConfig};
use crate::model::{AbcClass, EnrichedRecord, PriceBand, Rotation, StockLevel};
use crate::transform::{abc_classes, round_cents};

/// Calendar bucket of the revenue time series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    #[default]
    Month,
    /// ISO week
    Week,
    Day,
}

impl Period {
    /// Sortable label of the bucket containing `date`
    pub fn label(&self, date: NaiveDate) -> String {
        match self {
            Period::Month => format!("{:04}-{:02}", date.year(), date.month()),
            Period::Week => {
                let week = date.iso_week();
                format!("{:04}-W{:02}", week.year(), week.week())
            }
            Period::Day => date.format("%Y-%m-%d").to_string(),
        }
    }
}

/// One point of the sales time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    pub period: String,

    /// Revenue of the period
    pub value: f64,
    pub profit: f64,
    pub units: f64,

    /// Revenue change against the previous point, absent for the first
    /// point or when the previous revenue is zero
    pub growth_pct: Option<f64>,

    /// Units change against the previous point, same rules
    pub units_growth_pct: Option<f64>,
}

/// One entry of a ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub entity: String,
    pub value: f64,
}

/// Summary handed to the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub kpis: BTreeMap<String, f64>,
    pub time_series: Vec<TimePoint>,
    pub rankings: BTreeMap<String, Vec<RankEntry>>,
}

impl AggregateResult {
    pub fn kpi(&self, name: &str) -> Option<f64> {
        self.kpis.get(name).copied()
    }

    pub fn ranking(&self, name: &str) -> &[RankEntry] {
        self.rankings.get(name).map(Vec::as_slice).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ProductTotals {
    units: f64,
    revenue: f64,
    profit: f64,

    /// Units sold in rows whose stock level calls for restocking
    alert_units: f64,
    has_zero_sales_row: bool,
}

impl ProductTotals {
    fn absorb(&mut self, other: &ProductTotals) {
        self.units += other.units;
        self.revenue += other.revenue;
        self.profit += other.profit;
        self.alert_units += other.alert_units;
        self.has_zero_sales_row |= other.has_zero_sales_row;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct PeriodTotals {
    revenue: f64,
    profit: f64,
    units: f64,
}

impl PeriodTotals {
    fn absorb(&mut self, other: &PeriodTotals) {
        self.revenue += other.revenue;
        self.profit += other.profit;
        self.units += other.units;
    }
}

/// Mergeable partial aggregate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rollup {
    record_count: u64,
    units: f64,
    revenue: f64,
    cost: f64,
    profit: f64,
    margin_pct_sum: f64,
    sold_rows: u64,
    sold_price_sum: f64,
    stock_units: f64,
    stock_value: f64,
    products: BTreeMap<String, ProductTotals>,
    labs: BTreeMap<String, f64>,
    categories: BTreeMap<String, f64>,
    daily: BTreeMap<NaiveDate, PeriodTotals>,

    /// Row counts keyed by band KPI name
    band_rows: BTreeMap<String, u64>,
}

impl Rollup {
    /// Reduce records in order
    pub fn from_records(records: &[EnrichedRecord]) -> Self {
        let mut rollup = Rollup::default();
        for record in records {
            rollup.add(record);
        }
        rollup
    }

    /// Fold one record in
    pub fn add(&mut self, record: &EnrichedRecord) {
        self.record_count += 1;
        self.units += record.quantity;
        self.revenue += record.revenue;
        self.cost += record.cost_total;
        self.profit += record.profit;
        self.margin_pct_sum += record.profit_pct;

        if let Some(stock) = record.stock {
            self.stock_units += stock;
            self.stock_value += stock * record.unit_cost;
        }

        let product = self.products.entry(record.sku.clone()).or_default();
        product.units += record.quantity;
        product.revenue += record.revenue;
        product.profit += record.profit;

        if record.quantity > 0.0 {
            self.sold_rows += 1;
            self.sold_price_sum += record.unit_price;
            *self.labs.entry(record.lab.clone()).or_insert(0.0) += record.revenue;
            *self.categories.entry(record.category.clone()).or_insert(0.0) += record.revenue;
            if matches!(record.stock_level, Some(level) if level.is_alert()) {
                product.alert_units += record.quantity;
            }
        } else {
            product.has_zero_sales_row = true;
        }

        let day = self.daily.entry(record.date).or_default();
        day.revenue += record.revenue;
        day.profit += record.profit;
        day.units += record.quantity;

        self.count_band(price_band_key(record.price_band));
        self.count_band(rotation_key(record.rotation));
        if let Some(level) = record.stock_level {
            self.count_band(stock_level_key(level));
        }
        self.count_band(abc_rows_key(record.abc_class));
    }

    fn count_band(&mut self, key: String) {
        *self.band_rows.entry(key).or_insert(0) += 1;
    }

    /// Fold another rollup in
    pub fn merge(&mut self, other: &Rollup) {
        self.record_count += other.record_count;
        self.units += other.units;
        self.revenue += other.revenue;
        self.cost += other.cost;
        self.profit += other.profit;
        self.margin_pct_sum += other.margin_pct_sum;
        self.sold_rows += other.sold_rows;
        self.sold_price_sum += other.sold_price_sum;
        self.stock_units += other.stock_units;
        self.stock_value += other.stock_value;

        for (sku, totals) in &other.products {
            self.products.entry(sku.clone()).or_default().absorb(totals);
        }
        for (lab, revenue) in &other.labs {
            *self.labs.entry(lab.clone()).or_insert(0.0) += revenue;
        }
        for (category, revenue) in &other.categories {
            *self.categories.entry(category.clone()).or_insert(0.0) += revenue;
        }
        for (date, totals) in &other.daily {
            self.daily.entry(*date).or_default().absorb(totals);
        }
        for (key, count) in &other.band_rows {
            *self.band_rows.entry(key.clone()).or_insert(0) += count;
        }
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }
}

/// Reduces enriched records to [`AggregateResult`]s
#[derive(Debug, Clone)]
pub struct Aggregator {
    period: Period,
    top_n: usize,
    abc_a_share: f64,
    abc_b_share: f64,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(&AggregationConfig::default(), &TransformConfig::default())
    }
}

impl Aggregator {
    pub fn new(config: &AggregationConfig, transform: &TransformConfig) -> Self {
        Self {
            period: config.period,
            top_n: config.top_n,
            abc_a_share: transform.abc_a_share,
            abc_b_share: transform.abc_b_share,
        }
    }

    /// Aggregate one sequence of records
    pub fn aggregate(&self, records: &[EnrichedRecord]) -> AggregateResult {
        self.finalize(&Rollup::from_records(records))
    }

    /// Merge rollups in the order given and finalise once
    pub fn combine<'a>(&self, rollups: impl IntoIterator<Item = &'a Rollup>) -> AggregateResult {
        let mut combined = Rollup::default();
        for rollup in rollups {
            combined.merge(rollup);
        }
        self.finalize(&combined)
    }

    /// Turn a rollup into the presentation summary
    pub fn finalize(&self, rollup: &Rollup) -> AggregateResult {
        let mut result = AggregateResult {
            kpis: self.kpis(rollup),
            time_series: self.time_series(rollup),
            rankings: BTreeMap::new(),
        };

        let product_revenue = rollup.products.iter().map(|(sku, t)| (sku.as_str(), t.revenue));
        let product_units = rollup.products.iter().map(|(sku, t)| (sku.as_str(), t.units));
        let product_profit = rollup.products.iter().map(|(sku, t)| (sku.as_str(), t.profit));
        let stock_alerts = rollup
            .products
            .iter()
            .filter(|(_, t)| t.alert_units > 0.0)
            .map(|(sku, t)| (sku.as_str(), t.alert_units));

        result.rankings.insert("products_by_revenue".to_string(), self.rank(product_revenue, true));
        result.rankings.insert("products_by_units".to_string(), self.rank(product_units, false));
        result.rankings.insert("products_by_profit".to_string(), self.rank(product_profit, true));
        result.rankings.insert("stock_alerts".to_string(), self.rank(stock_alerts, false));
        result.rankings.insert(
            "labs_by_revenue".to_string(),
            self.rank(rollup.labs.iter().map(|(k, v)| (k.as_str(), *v)), true),
        );
        result.rankings.insert(
            "categories_by_revenue".to_string(),
            self.rank(rollup.categories.iter().map(|(k, v)| (k.as_str(), *v)), true),
        );

        result
    }

    fn kpis(&self, rollup: &Rollup) -> BTreeMap<String, f64> {
        let classes = abc_classes(
            rollup.products.iter().map(|(sku, t)| (sku.as_str(), t.revenue)),
            self.abc_a_share,
            self.abc_b_share,
        );
        let count_class = |class: AbcClass| classes.values().filter(|c| **c == class).count() as f64;

        let products_sold = rollup.products.values().filter(|t| t.units > 0.0).count();
        let products_without_sales = rollup.products.values().filter(|t| t.has_zero_sales_row).count();

        let avg_margin_pct = ratio(rollup.margin_pct_sum, rollup.record_count as f64);
        let avg_ticket = ratio(rollup.sold_price_sum, rollup.sold_rows as f64);

        let entries: [(&str, f64); 17] = [
            ("record_count", rollup.record_count as f64),
            ("units_sold", rollup.units),
            ("revenue", round_cents(rollup.revenue)),
            ("cost", round_cents(rollup.cost)),
            ("profit", round_cents(rollup.profit)),
            ("avg_margin_pct", avg_margin_pct),
            ("unique_products", rollup.products.len() as f64),
            ("products_sold", products_sold as f64),
            ("products_without_sales", products_without_sales as f64),
            ("active_labs", rollup.labs.len() as f64),
            ("active_categories", rollup.categories.len() as f64),
            ("avg_ticket", round_cents(avg_ticket)),
            ("stock_units", rollup.stock_units),
            ("stock_value", round_cents(rollup.stock_value)),
            ("abc_a_products", count_class(AbcClass::A)),
            ("abc_b_products", count_class(AbcClass::B)),
            ("abc_c_products", count_class(AbcClass::C)),
        ];

        let mut kpis: BTreeMap<String, f64> =
            entries.iter().map(|(name, value)| (name.to_string(), *value)).collect();

        // Every band is reported, zero when no row fell into it.
        let band_keys = PriceBand::ALL
            .into_iter()
            .map(price_band_key)
            .chain(Rotation::ALL.into_iter().map(rotation_key))
            .chain(StockLevel::ALL.into_iter().map(stock_level_key))
            .chain(AbcClass::ALL.into_iter().map(abc_rows_key));
        for key in band_keys {
            let rows = rollup.band_rows.get(&key).copied().unwrap_or(0);
            kpis.insert(key, rows as f64);
        }

        kpis
    }

    fn time_series(&self, rollup: &Rollup) -> Vec<TimePoint> {
        let mut buckets: BTreeMap<String, PeriodTotals> = BTreeMap::new();
        for (date, totals) in &rollup.daily {
            buckets.entry(self.period.label(*date)).or_default().absorb(totals);
        }

        let mut previous: Option<(f64, f64)> = None;
        buckets
            .into_iter()
            .map(|(period, totals)| {
                let value = round_cents(totals.revenue);
                let units = totals.units;
                let point = TimePoint {
                    period,
                    value,
                    profit: round_cents(totals.profit),
                    units,
                    growth_pct: previous.and_then(|(prev, _)| growth(prev, value)),
                    units_growth_pct: previous.and_then(|(_, prev)| growth(prev, units)),
                };
                previous = Some((value, units));
                point
            })
            .collect()
    }

    /// Value descending, entity ascending on ties, truncated to `top_n`
    fn rank<'a>(&self, values: impl Iterator<Item = (&'a str, f64)>, currency: bool) -> Vec<RankEntry> {
        let mut entries: Vec<RankEntry> = values
            .map(|(entity, value)| RankEntry {
                entity: entity.to_string(),
                value: if currency { round_cents(value) } else { value },
            })
            .collect();

        entries.sort_by(|a, b| b.value.total_cmp(&a.value).then_with(|| a.entity.cmp(&b.entity)));
        entries.truncate(self.top_n);
        entries
    }
}

fn growth(previous: f64, current: f64) -> Option<f64> {
    (previous > 0.0).then(|| (current - previous) * 100.0 / previous)
}

fn price_band_key(band: PriceBand) -> String {
    format!("price_band_{}", band.name())
}

fn rotation_key(rotation: Rotation) -> String {
    format!("rotation_{}", rotation.name())
}

fn stock_level_key(level: StockLevel) -> String {
    format!("stock_level_{}", level.name())
}

/// Rows by the class assigned within their own dataset
fn abc_rows_key(class: AbcClass) -> String {
    format!("abc_{}_rows", class.name())
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}
