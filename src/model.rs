use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::MatchKey;

/// The platforms this dashboard reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    /// Internal probability model feed.
    Model,
    /// Kalshi-style exchange (cents-quoted contracts, ticker-coded fixtures).
    Kalshi,
    /// Manifold-style platform (probability-quoted, free-text fixtures).
    Manifold,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::Model, SourceId::Kalshi, SourceId::Manifold];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Model => "model",
            SourceId::Kalshi => "kalshi",
            SourceId::Manifold => "manifold",
        }
    }

    /// Price convention the producer declares for this platform. The
    /// normalizer branches on this; it never guesses units from the value.
    pub fn price_unit(&self) -> PriceUnit {
        match self {
            SourceId::Kalshi => PriceUnit::Cents,
            SourceId::Model | SourceId::Manifold => PriceUnit::Probability,
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a producer expresses prices on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceUnit {
    /// 0–100 price-in-cents convention (dollar-quoted sub-1.0 values also
    /// appear on the same feeds and are taken as-is).
    Cents,
    /// Already a probability in [0, 1].
    Probability,
}

/// One market's best-known state for a single source, always in common units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMarket {
    pub source: SourceId,
    pub match_key: MatchKey,
    pub team1: String,
    pub team2: String,
    /// Fixture date truncated to the UTC calendar day.
    pub event_date: NaiveDate,
    /// Implied probability of the tracked outcome, always in [0, 1].
    pub probability: f64,
    /// Traded volume in source-native units, when reported.
    pub volume: Option<f64>,
    /// Platform-native market identifier (ticker, market id, ...).
    pub ticker: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl NormalizedMarket {
    /// True when `other` carries the same observable quote. Receipt time is
    /// ignored so a re-delivered update is recognised as a duplicate.
    pub fn same_quote(&self, other: &NormalizedMarket) -> bool {
        self.source == other.source
            && self.match_key == other.match_key
            && self.team1 == other.team1
            && self.team2 == other.team2
            && self.event_date == other.event_date
            && self.probability == other.probability
            && self.volume == other.volume
            && self.ticker == other.ticker
    }
}

/// Per-fixture comparison across sources, derived from an aggregator
/// snapshot and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRecord {
    pub match_key: MatchKey,
    pub team1: String,
    pub team2: String,
    pub event_date: NaiveDate,
    /// Probability per source. BTreeMap so serialization order is stable.
    pub probabilities: std::collections::BTreeMap<SourceId, f64>,
    /// Largest pairwise probability gap; 0.0 with fewer than two sources.
    pub max_discrepancy: f64,
}

/// Connection lifecycle of a producer feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    /// Attempting to attach to the producer.
    Connecting,
    /// Attached and draining events.
    Streaming,
    /// Lost the producer; retrying with backoff, last data retained.
    Degraded,
    /// Shut down on purpose; no further reconnects.
    Closed,
}

/// Observable health of one source feed, as served by the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source: SourceId,
    pub state: FeedState,
    pub last_event_at: Option<DateTime<Utc>>,
    pub messages: u64,
    pub parse_errors: u64,
    pub unresolved_aliases: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::match_key;

    fn market(prob: f64) -> NormalizedMarket {
        NormalizedMarket {
            source: SourceId::Kalshi,
            match_key: match_key("Arsenal", "Chelsea", NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
            team1: "Arsenal".into(),
            team2: "Chelsea".into(),
            event_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            probability: prob,
            volume: Some(1200.0),
            ticker: Some("KXEPLGAME-24MAR01ARSCHE-ARS".into()),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_same_quote_ignores_receipt_time() {
        let a = market(0.55);
        let mut b = a.clone();
        b.last_updated = a.last_updated + chrono::Duration::seconds(30);
        assert!(a.same_quote(&b));
    }

    #[test]
    fn test_same_quote_detects_price_move() {
        let a = market(0.55);
        let b = market(0.56);
        assert!(!a.same_quote(&b));
    }

    #[test]
    fn test_price_unit_per_source() {
        assert_eq!(SourceId::Kalshi.price_unit(), PriceUnit::Cents);
        assert_eq!(SourceId::Manifold.price_unit(), PriceUnit::Probability);
        assert_eq!(SourceId::Model.price_unit(), PriceUnit::Probability);
    }
}
