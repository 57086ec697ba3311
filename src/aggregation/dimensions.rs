//! Dimension tuple merging.
//!
//! Observations carry a list of dimension elements, each tagged with an
//! ordered list of `(key, value)` detail pairs. Two elements describe the
//! same dimension combination iff their detail lists are equal once sorted
//! by key; merging a group sums their quantities and keeps the first-seen
//! descriptive fields.

use std::collections::HashMap;

use serde_json::json;

use crate::models::{safe_int_value, DimensionDetail, DimensionEntry};

/// Canonical signature for a detail list: the pairs sorted by key.
fn signature(details: &[DimensionDetail]) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = details
        .iter()
        .map(|d| (d.key.clone(), d.value.clone()))
        .collect();
    pairs.sort();
    pairs
}

/// Merge dimension elements across a group of records.
///
/// Elements without detail pairs are dropped; the output keeps the order in
/// which each signature first appeared.
pub fn merge_dimensions(entries: &[DimensionEntry]) -> Vec<DimensionEntry> {
    let mut order: Vec<Vec<(String, String)>> = Vec::new();
    let mut merged: HashMap<Vec<(String, String)>, DimensionEntry> = HashMap::new();

    for entry in entries {
        if entry.details.is_empty() {
            continue;
        }
        let sig = signature(&entry.details);
        let slot = merged.entry(sig.clone()).or_insert_with(|| {
            order.push(sig);
            DimensionEntry {
                details: entry.details.clone(),
                qty: json!(0),
                value: json!(0),
                unit: entry.unit.clone(),
                currency: entry.currency.clone(),
                key: entry.key.clone(),
                value1: entry.value1.clone(),
            }
        });
        let qty = safe_int_value(&slot.qty) + safe_int_value(&entry.qty);
        let value = safe_int_value(&slot.value) + safe_int_value(&entry.value);
        slot.qty = json!(qty);
        slot.value = json!(value);
    }

    order
        .into_iter()
        .filter_map(|sig| merged.remove(&sig))
        .collect()
}
