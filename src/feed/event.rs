//! Producer line contract.
//!
//! Every producer, whatever its transport, emits newline-delimited JSON
//! objects tagged with a `type` field: individual `market_update`s, batch
//! forms that carry a `markets` array, connection-lifecycle `status` lines,
//! and `error` lines. Anything that fails to parse is wrapped as a raw line
//! and ignored downstream — a junk line from one producer must never stall
//! the stream.

use serde::Deserialize;

/// A single decoded producer line.
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerEvent {
    /// One market/price update.
    Update(RawMarket),
    /// A batch of updates (sent by streaming producers on startup/shutdown);
    /// unpacked into individual ingests by the feed task.
    Batch(Vec<RawMarket>),
    /// Connection lifecycle message (open/close/inactivity). Not data.
    Status(String),
    /// Producer-side failure report. Not data.
    Error(String),
    /// Unparseable or unrecognised line; logged at debug and dropped.
    Raw(String),
}

/// Decode one producer line. Never fails: junk becomes `Raw`.
pub fn parse_line(line: &str) -> ProducerEvent {
    match serde_json::from_str::<WireEvent>(line) {
        Ok(WireEvent::MarketUpdate { data }) => ProducerEvent::Update(data),
        Ok(WireEvent::InitialBatch { markets }) | Ok(WireEvent::FinalBatch { markets }) => {
            ProducerEvent::Batch(markets)
        }
        Ok(WireEvent::Status { message }) => ProducerEvent::Status(message),
        Ok(WireEvent::Error { message }) => ProducerEvent::Error(message),
        Ok(WireEvent::Raw { message }) => ProducerEvent::Raw(message),
        Err(_) => ProducerEvent::Raw(line.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MarketUpdate {
        /// Streaming producers nest the payload under "market"; the batch
        /// fetchers use "data".
        #[serde(alias = "market")]
        data: RawMarket,
    },
    InitialBatch {
        markets: Vec<RawMarket>,
    },
    FinalBatch {
        markets: Vec<RawMarket>,
    },
    Status {
        message: String,
    },
    Error {
        message: String,
    },
    Raw {
        message: String,
    },
}

/// Loosely-structured market payload. Producers disagree on field names and
/// on which fields are present at all, so everything is optional here and
/// the normalizer decides what is usable per source.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawMarket {
    #[serde(alias = "market_id", alias = "unique_id")]
    pub id: Option<String>,
    pub ticker: Option<String>,
    #[serde(alias = "question")]
    pub title: Option<String>,
    /// Free-text fixture description, e.g. "Arsenal vs Liverpool".
    pub match_text: Option<String>,
    #[serde(alias = "home", alias = "home_team")]
    pub team1: Option<String>,
    #[serde(alias = "away", alias = "away_team")]
    pub team2: Option<String>,
    /// ISO 8601 date or datetime of the fixture.
    #[serde(alias = "commence_time", alias = "event_date")]
    pub date: Option<String>,
    /// Epoch milliseconds; market close, used as the fixture-day fallback.
    pub close_time: Option<f64>,
    /// Market lifecycle on the platform: "open" | "active" | "closed" | ...
    pub status: Option<String>,
    pub yes_price: Option<f64>,
    pub probability: Option<f64>,
    pub pricing: Option<Pricing>,
    pub volume: Option<f64>,
    pub trading_stats: Option<TradingStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Pricing {
    #[serde(alias = "yes_price")]
    pub current_price: Option<f64>,
    pub implied_probability: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TradingStats {
    pub volume: Option<f64>,
    /// Part of the producer contract; not consumed downstream.
    #[allow(dead_code)]
    pub open_interest: Option<f64>,
}

impl RawMarket {
    /// Source-native price field, wherever the producer put it.
    pub fn price_value(&self) -> Option<f64> {
        self.pricing
            .as_ref()
            .and_then(|p| p.current_price)
            .or(self.yes_price)
    }

    /// Explicit probability field, when the producer sent one.
    pub fn probability_value(&self) -> Option<f64> {
        self.probability
            .or_else(|| self.pricing.as_ref().and_then(|p| p.implied_probability))
    }

    pub fn traded_volume(&self) -> Option<f64> {
        self.volume
            .or_else(|| self.trading_stats.as_ref().and_then(|t| t.volume))
    }
}
