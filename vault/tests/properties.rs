//! Property tests for sealing, deduplication and aggregation

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use proptest::prelude::*;

use botica_vault::{
    config::TransformConfig,
    error::CipherError,
    model::{RawRecord, ValidatedRecord},
    transform::{deduplicate, normalize},
    Aggregator, CipherEngine, EncryptionKey, Rollup, Transformer,
};

fn test_key() -> EncryptionKey {
    EncryptionKey::from_bytes(&[42u8; 32]).unwrap()
}

/// Rows with integer amounts so that sums are exact in any order
fn row_strategy() -> impl Strategy<Value = ValidatedRecord> {
    (
        0u8..6,
        0u8..3,
        0u8..3,
        0u32..20,
        1u32..50,
        1u32..80,
        1u32..28,
        proptest::option::of(0u32..30),
    )
        .prop_map(|(sku, lab, category, quantity, cost, price, day, stock)| ValidatedRecord {
            line: 0,
            record: RawRecord {
                sku: format!("P{}", sku),
                description: format!("producto {}", sku),
                category: format!("cat {}", category),
                lab: format!("lab{}", lab),
                quantity: quantity as f64,
                unit_cost: cost as f64,
                unit_price: price as f64,
                date: NaiveDate::from_ymd_opt(2024, 1 + day % 3, day).unwrap(),
                stock: stock.map(|s| s as f64),
                attributes: BTreeMap::new(),
            },
        })
}

fn rows_strategy() -> impl Strategy<Value = Vec<ValidatedRecord>> {
    prop::collection::vec(row_strategy(), 0..40).prop_map(|mut rows| {
        for (index, row) in rows.iter_mut().enumerate() {
            row.line = index as u64 + 2;
        }
        rows
    })
}

proptest! {
    #[test]
    fn prop_seal_unseal_roundtrip(plaintext in prop::collection::vec(any::<u8>(), 0..2048)) {
        let engine = CipherEngine::new();
        let key = test_key();

        let sealed = engine.seal(&key, "enero", &plaintext).unwrap();
        let decoded = botica_vault::SealedRecord::decode(&sealed.encode()).unwrap();
        let buffer = engine.unseal(&key, &decoded).unwrap();

        prop_assert_eq!(buffer.as_bytes(), plaintext.as_slice());
        prop_assert_eq!(buffer.dataset_id(), "enero");
    }

    #[test]
    fn prop_ciphertext_bit_flip_rejected(
        plaintext in prop::collection::vec(any::<u8>(), 1..512),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let engine = CipherEngine::new();
        let key = test_key();

        let mut sealed = engine.seal(&key, "enero", &plaintext).unwrap();
        let index = position.index(sealed.ciphertext.len());
        sealed.ciphertext[index] ^= 1 << bit;

        prop_assert!(matches!(engine.unseal(&key, &sealed), Err(CipherError::AuthenticationFailed)));
    }

    #[test]
    fn prop_tag_bit_flip_rejected(
        plaintext in prop::collection::vec(any::<u8>(), 0..256),
        index in 0usize..16,
        bit in 0u8..8,
    ) {
        let engine = CipherEngine::new();
        let key = test_key();

        let mut sealed = engine.seal(&key, "enero", &plaintext).unwrap();
        sealed.tag[index] ^= 1 << bit;

        prop_assert!(matches!(engine.unseal(&key, &sealed), Err(CipherError::AuthenticationFailed)));
    }

    #[test]
    fn prop_deduplicate_is_idempotent(rows in rows_strategy()) {
        let normalized: Vec<ValidatedRecord> = rows.into_iter().map(normalize).collect();
        let (once, _) = deduplicate(normalized);
        let (twice, collapsed) = deduplicate(once.clone());

        prop_assert_eq!(collapsed, 0);
        prop_assert_eq!(twice, once.clone());

        let keys: HashSet<(String, NaiveDate)> =
            once.iter().map(|row| (row.record.sku.clone(), row.record.date)).collect();
        prop_assert_eq!(keys.len(), once.len());
    }

    #[test]
    fn prop_aggregation_is_deterministic(rows in rows_strategy()) {
        let transformer = Transformer::new(TransformConfig::default());
        let aggregator = Aggregator::default();

        let first = aggregator.aggregate(&transformer.transform("enero", rows.clone()).records);
        let second = aggregator.aggregate(&transformer.transform("enero", rows).records);

        prop_assert_eq!(serde_json::to_vec(&first).unwrap(), serde_json::to_vec(&second).unwrap());
    }

    #[test]
    fn prop_combine_matches_single_pass(rows in rows_strategy(), split in any::<prop::sample::Index>()) {
        let transformer = Transformer::new(TransformConfig::default());
        let aggregator = Aggregator::default();

        let records = transformer.transform("enero", rows).records;
        let cut = if records.is_empty() { 0 } else { split.index(records.len() + 1) };
        let (left, right) = records.split_at(cut);

        let single = aggregator.aggregate(&records);
        let combined = aggregator.combine([&Rollup::from_records(left), &Rollup::from_records(right)]);

        prop_assert_eq!(single.kpis.len(), combined.kpis.len());
        for (name, value) in &single.kpis {
            let other = combined.kpis[name];
            prop_assert!((value - other).abs() < 1e-6, "{}: {} != {}", name, value, other);
        }
        prop_assert_eq!(&single.time_series.len(), &combined.time_series.len());
        prop_assert_eq!(single.ranking("products_by_revenue"), combined.ranking("products_by_revenue"));
        prop_assert_eq!(single.ranking("labs_by_revenue"), combined.ranking("labs_by_revenue"));
        prop_assert_eq!(single.ranking("products_by_profit"), combined.ranking("products_by_profit"));
        prop_assert_eq!(single.ranking("stock_alerts"), combined.ranking("stock_alerts"));
    }
}

#[test]
fn test_nonces_are_unique() {
    let engine = CipherEngine::new();
    let key = test_key();

    let mut nonces = HashSet::new();
    for _ in 0..2000 {
        let sealed = engine.seal(&key, "enero", b"sku;description\n").unwrap();
        assert!(nonces.insert(sealed.nonce));
    }
}
