//! Cross-source comparison.
//!
//! Joins an aggregator snapshot on canonical match identity and measures how
//! far the platforms disagree. Output is a pure function of the snapshot:
//! same input, same records, same order.

use std::collections::BTreeMap;

use crate::identity::MatchKey;
use crate::model::{ComparisonRecord, NormalizedMarket};

/// One record per fixture present in the snapshot, sorted by match key.
pub fn compare(snapshot: &[NormalizedMarket]) -> Vec<ComparisonRecord> {
    let mut by_key: BTreeMap<&MatchKey, Vec<&NormalizedMarket>> = BTreeMap::new();
    for market in snapshot {
        by_key.entry(&market.match_key).or_default().push(market);
    }
    by_key
        .into_iter()
        .map(|(key, group)| build_record(key, group))
        .collect()
}

/// Comparison for a single fixture, or `None` once no source carries it.
pub fn compare_one(snapshot: &[NormalizedMarket], key: &MatchKey) -> Option<ComparisonRecord> {
    let group: Vec<&NormalizedMarket> = snapshot
        .iter()
        .filter(|m| &m.match_key == key)
        .collect();
    if group.is_empty() {
        None
    } else {
        Some(build_record(key, group))
    }
}

fn build_record(key: &MatchKey, mut group: Vec<&NormalizedMarket>) -> ComparisonRecord {
    group.sort_by_key(|m| m.source);

    let mut probabilities = BTreeMap::new();
    for market in &group {
        probabilities.insert(market.source, market.probability);
    }

    // Largest pairwise gap. A single source has nothing to disagree with:
    // that is insufficient data, not an anomaly, so the record stays at 0.
    let values: Vec<f64> = probabilities.values().copied().collect();
    let mut max_discrepancy = 0.0f64;
    for i in 0..values.len() {
        for j in (i + 1)..values.len() {
            max_discrepancy = max_discrepancy.max((values[i] - values[j]).abs());
        }
    }

    let lead = group[0];
    ComparisonRecord {
        match_key: key.clone(),
        team1: lead.team1.clone(),
        team2: lead.team2.clone(),
        event_date: lead.event_date,
        probabilities,
        max_discrepancy,
    }
}
