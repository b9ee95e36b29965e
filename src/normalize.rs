//! Event normalizer: one raw producer payload in, zero or one
//! `NormalizedMarket` out.
//!
//! "Zero" covers two very different cases and they are kept apart in the
//! types: payloads filtered by policy (closed markets, prop/sub-markets,
//! non-home-side outcomes) return `Ok(None)`, while genuinely malformed
//! payloads return a typed error. Either way a bad record only ever costs
//! itself — the feed task moves on to the next line.

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::feed::event::RawMarket;
use crate::identity::match_key;
use crate::model::{NormalizedMarket, PriceUnit, SourceId};
use crate::teams::TeamAliases;

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("no team identifiers in payload")]
    MissingTeams,
    #[error("no usable event date in payload")]
    MissingDate,
    #[error("no price field for declared unit")]
    MissingPrice,
    #[error("probability {0} outside [0,1] after unit conversion")]
    ProbabilityRange(f64),
}

/// A successfully normalized update, with the alias misses that occurred
/// while resolving it so the caller can log and count them.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedUpdate {
    pub market: NormalizedMarket,
    /// Raw team names that fell back verbatim because no alias matched.
    pub unresolved: Vec<String>,
}

pub struct Normalizer {
    aliases: Arc<TeamAliases>,
}

impl Normalizer {
    pub fn new(aliases: Arc<TeamAliases>) -> Self {
        Normalizer { aliases }
    }

    /// Pure transform; no side effects, no I/O.
    pub fn normalize(
        &self,
        source: SourceId,
        raw: &RawMarket,
        received_at: DateTime<Utc>,
    ) -> Result<Option<NormalizedUpdate>, NormalizeError> {
        // Markets the platform itself considers finished are not tracked.
        if let Some(status) = raw.status.as_deref() {
            if matches!(
                status.to_ascii_lowercase().as_str(),
                "closed" | "resolved" | "finalized" | "settled"
            ) {
                return Ok(None);
            }
        }

        let ticker_info = raw.ticker.as_deref().and_then(parse_epl_ticker);

        // Policy filter: only the match-result (moneyline) market survives.
        // Totals, first-goal, cards and the rest are sub-markets.
        if is_prop_market(raw, ticker_info.as_ref()) {
            return Ok(None);
        }

        // Exchange tickers carry one market per outcome. Track the home-side
        // win market only, so the per-(source, fixture) slot is not fought
        // over by draw and away quotes.
        if let Some(info) = &ticker_info {
            match info.prop.as_deref() {
                Some(prop) if prop.eq_ignore_ascii_case(&info.team1) => {}
                _ => return Ok(None),
            }
        }

        let (raw_team1, raw_team2) =
            extract_teams(raw, ticker_info.as_ref()).ok_or(NormalizeError::MissingTeams)?;

        let event_date =
            extract_date(raw, ticker_info.as_ref()).ok_or(NormalizeError::MissingDate)?;

        // Branch on the unit the source declares; never sniff it from the
        // value. Cents feeds also quote dollars below 1.0.
        let probability = match source.price_unit() {
            PriceUnit::Cents => {
                let v = raw.price_value().ok_or(NormalizeError::MissingPrice)?;
                if v > 1.0 {
                    v / 100.0
                } else {
                    v
                }
            }
            PriceUnit::Probability => {
                raw.probability_value().ok_or(NormalizeError::MissingPrice)?
            }
        };
        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            return Err(NormalizeError::ProbabilityRange(probability));
        }

        let mut unresolved = Vec::new();
        let team1 = self.resolve_team(&raw_team1, &mut unresolved);
        let team2 = self.resolve_team(&raw_team2, &mut unresolved);

        let market = NormalizedMarket {
            source,
            match_key: match_key(&team1, &team2, event_date),
            team1,
            team2,
            event_date,
            probability,
            volume: raw.traded_volume(),
            ticker: raw.ticker.clone().or_else(|| raw.id.clone()),
            last_updated: received_at,
        };
        Ok(Some(NormalizedUpdate { market, unresolved }))
    }

    /// Falls back to the raw string verbatim on a miss: a record with a
    /// half-identified team is still worth more than a dropped one.
    fn resolve_team(&self, raw: &str, unresolved: &mut Vec<String>) -> String {
        match self.aliases.resolve(raw) {
            Some(canonical) => canonical.to_string(),
            None => {
                unresolved.push(raw.to_string());
                raw.trim().to_string()
            }
        }
    }
}

// ── Field extraction ─────────────────────────────────────────────────────────

fn extract_teams(raw: &RawMarket, ticker_info: Option<&TickerInfo>) -> Option<(String, String)> {
    if let (Some(t1), Some(t2)) = (raw.team1.as_deref(), raw.team2.as_deref()) {
        if !t1.trim().is_empty() && !t2.trim().is_empty() {
            return Some((t1.to_string(), t2.to_string()));
        }
    }
    if let Some(info) = ticker_info {
        return Some((info.team1.clone(), info.team2.clone()));
    }
    let text = raw.match_text.as_deref().or(raw.title.as_deref())?;
    split_fixture_text(text)
}

/// Split "Arsenal vs Liverpool"-style free text on the separators the
/// platforms actually use.
fn split_fixture_text(text: &str) -> Option<(String, String)> {
    for sep in [" vs. ", " vs ", " v ", " @ ", " - ", " – "] {
        if let Some((left, right)) = text.split_once(sep) {
            let (left, right) = (left.trim(), right.trim());
            if !left.is_empty() && !right.is_empty() {
                return Some((left.to_string(), right.to_string()));
            }
        }
    }
    None
}

fn extract_date(raw: &RawMarket, ticker_info: Option<&TickerInfo>) -> Option<NaiveDate> {
    if let Some(s) = raw.date.as_deref() {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc).date_naive());
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Some(d);
        }
    }
    if let Some(d) = ticker_info.and_then(|i| i.date) {
        return Some(d);
    }
    // Close time is the coarsest signal, but for a single fixture market it
    // lands on the match day.
    if let Some(ms) = raw.close_time {
        if ms.is_finite() && ms > 0.0 {
            return DateTime::<Utc>::from_timestamp_millis(ms as i64).map(|dt| dt.date_naive());
        }
    }
    None
}

// ── Prop-market policy ───────────────────────────────────────────────────────

/// Keywords that mark a sub-market rather than the match result.
const PROP_KEYWORDS: &[&str] = &[
    "OVER", "UNDER", "TOTAL", "GOALS", "FIRST", "LAST", "SCORE", "CLEAN", "SHUTOUT", "CARD",
    "CORNER", "PENALTY", "HALF", "MINUTE",
];

fn is_prop_market(raw: &RawMarket, ticker_info: Option<&TickerInfo>) -> bool {
    if let Some(prop) = ticker_info.and_then(|i| i.prop.as_deref()) {
        let prop = prop.to_ascii_uppercase();
        if PROP_KEYWORDS.iter().any(|k| prop.contains(k)) {
            return true;
        }
    }
    if let Some(title) = raw.title.as_deref() {
        let title = title.to_ascii_uppercase();
        if PROP_KEYWORDS.iter().any(|k| title.contains(k)) {
            return true;
        }
    }
    false
}

// ── Exchange ticker recovery ─────────────────────────────────────────────────

/// Fields recovered from a `KXEPLGAME-25NOV08CFCWOL-CFC` style ticker.
#[derive(Debug, Clone)]
struct TickerInfo {
    date: Option<NaiveDate>,
    team1: String,
    team2: String,
    /// Outcome segment: a team code, "TIE"/"DRAW", or absent for the
    /// generic event container.
    prop: Option<String>,
}

fn parse_epl_ticker(ticker: &str) -> Option<TickerInfo> {
    let mut parts = ticker.split('-');
    let prefix = parts.next()?;
    if !prefix.to_ascii_uppercase().contains("EPL") {
        return None;
    }
    // Second segment is date + team codes: "25NOV08CFCWOL".
    let date_teams = parts.next()?;
    if !date_teams.is_ascii() || date_teams.len() < 13 {
        return None;
    }
    let (date_str, teams_str) = date_teams.split_at(7);
    Some(TickerInfo {
        date: parse_ticker_date(date_str),
        team1: teams_str[..3].to_string(),
        team2: teams_str[3..6].to_string(),
        prop: parts.next().map(str::to_string),
    })
}

/// "25NOV08" -> 2025-11-08. Two-digit years at or below 30 are taken as
/// 2000s, matching the exchange's convention.
fn parse_ticker_date(s: &str) -> Option<NaiveDate> {
    if s.len() != 7 {
        return None;
    }
    let year: i32 = s[..2].parse().ok()?;
    let year = if year <= 30 { 2000 + year } else { 1900 + year };
    let month = match &s[2..5].to_ascii_uppercase()[..] {
        "JAN" => 1,
        "FEB" => 2,
        "MAR" => 3,
        "APR" => 4,
        "MAY" => 5,
        "JUN" => 6,
        "JUL" => 7,
        "AUG" => 8,
        "SEP" => 9,
        "OCT" => 10,
        "NOV" => 11,
        "DEC" => 12,
        _ => return None,
    };
    let day: u32 = s[5..7].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn normalizer() -> Normalizer {
        Normalizer::new(Arc::new(TeamAliases::premier_league()))
    }

    fn kalshi_raw(ticker: &str, yes_price: f64) -> RawMarket {
        RawMarket {
            ticker: Some(ticker.to_string()),
            yes_price: Some(yes_price),
            volume: Some(1500.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_cents_normalize_to_probability() {
        let n = normalizer();
        let raw = kalshi_raw("KXEPLGAME-24MAR01ARSCHE-ARS", 42.0);
        let update = n
            .normalize(SourceId::Kalshi, &raw, Utc::now())
            .unwrap()
            .unwrap();
        assert_relative_eq!(update.market.probability, 0.42);
        assert_eq!(update.market.team1, "Arsenal");
        assert_eq!(update.market.team2, "Chelsea");
        assert_eq!(
            update.market.event_date,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
        assert!(update.unresolved.is_empty());
    }

    #[test]
    fn test_dollar_quoted_cents_feed_passes_through() {
        let n = normalizer();
        let raw = kalshi_raw("KXEPLGAME-24MAR01ARSCHE-ARS", 0.55);
        let update = n
            .normalize(SourceId::Kalshi, &raw, Utc::now())
            .unwrap()
            .unwrap();
        assert_relative_eq!(update.market.probability, 0.55);
    }

    #[test]
    fn test_probability_source_passes_through() {
        let n = normalizer();
        let raw = RawMarket {
            team1: Some("Chelsea".into()),
            team2: Some("Arsenal".into()),
            date: Some("2024-03-01T23:50:00Z".into()),
            probability: Some(0.42),
            ..Default::default()
        };
        let update = n
            .normalize(SourceId::Manifold, &raw, Utc::now())
            .unwrap()
            .unwrap();
        assert_relative_eq!(update.market.probability, 0.42);
        // Near-midnight UTC timestamp still lands on the fixture day.
        assert_eq!(
            update.market.event_date,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
    }

    #[test]
    fn test_probability_out_of_range_is_error() {
        let n = normalizer();
        let raw = RawMarket {
            team1: Some("Arsenal".into()),
            team2: Some("Chelsea".into()),
            date: Some("2024-03-01".into()),
            probability: Some(1.4),
            ..Default::default()
        };
        assert_eq!(
            n.normalize(SourceId::Model, &raw, Utc::now()),
            Err(NormalizeError::ProbabilityRange(1.4))
        );
    }

    #[test]
    fn test_missing_price_is_error() {
        let n = normalizer();
        let raw = RawMarket {
            team1: Some("Arsenal".into()),
            team2: Some("Chelsea".into()),
            date: Some("2024-03-01".into()),
            ..Default::default()
        };
        assert_eq!(
            n.normalize(SourceId::Model, &raw, Utc::now()),
            Err(NormalizeError::MissingPrice)
        );
    }

    #[test]
    fn test_missing_teams_is_error() {
        let n = normalizer();
        let raw = RawMarket {
            probability: Some(0.5),
            date: Some("2024-03-01".into()),
            ..Default::default()
        };
        assert_eq!(
            n.normalize(SourceId::Model, &raw, Utc::now()),
            Err(NormalizeError::MissingTeams)
        );
    }

    #[test]
    fn test_closed_market_filtered_not_error() {
        let n = normalizer();
        let mut raw = kalshi_raw("KXEPLGAME-24MAR01ARSCHE-ARS", 42.0);
        raw.status = Some("closed".into());
        assert_eq!(n.normalize(SourceId::Kalshi, &raw, Utc::now()), Ok(None));
    }

    #[test]
    fn test_draw_and_away_outcomes_filtered() {
        let n = normalizer();
        for ticker in [
            "KXEPLGAME-24MAR01ARSCHE-TIE",
            "KXEPLGAME-24MAR01ARSCHE-CHE",
            // Generic event container without an outcome segment.
            "KXEPLGAME-24MAR01ARSCHE",
        ] {
            let raw = kalshi_raw(ticker, 42.0);
            assert_eq!(
                n.normalize(SourceId::Kalshi, &raw, Utc::now()),
                Ok(None),
                "{} should be filtered",
                ticker
            );
        }
    }

    #[test]
    fn test_prop_markets_filtered_by_title() {
        let n = normalizer();
        let raw = RawMarket {
            team1: Some("Arsenal".into()),
            team2: Some("Chelsea".into()),
            date: Some("2024-03-01".into()),
            probability: Some(0.6),
            title: Some("Total goals over 2.5 (Arsenal vs Chelsea)".into()),
            ..Default::default()
        };
        assert_eq!(n.normalize(SourceId::Model, &raw, Utc::now()), Ok(None));
    }

    #[test]
    fn test_unresolved_alias_falls_back_verbatim() {
        let n = normalizer();
        let raw = RawMarket {
            team1: Some("Real Madrid".into()),
            team2: Some("Barcelona".into()),
            date: Some("2024-03-01".into()),
            probability: Some(0.5),
            ..Default::default()
        };
        let update = n
            .normalize(SourceId::Model, &raw, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(update.market.team1, "Real Madrid");
        assert_eq!(update.market.team2, "Barcelona");
        assert_eq!(update.unresolved.len(), 2);
        // Same raw input, same key: stability even when it will never merge.
        let again = n
            .normalize(SourceId::Model, &raw, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(update.market.match_key, again.market.match_key);
    }

    #[test]
    fn test_free_text_fixture_split() {
        let n = normalizer();
        let raw = RawMarket {
            match_text: Some("Nottingham Forest vs Man City".into()),
            close_time: Some(1_709_337_000_000.0),
            probability: Some(0.31),
            ..Default::default()
        };
        let update = n
            .normalize(SourceId::Manifold, &raw, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(update.market.team1, "Nottingham Forest");
        assert_eq!(update.market.team2, "Manchester City");
    }

    #[test]
    fn test_parse_epl_ticker() {
        let info = parse_epl_ticker("KXEPLGAME-25NOV08CFCWOL-CFC").unwrap();
        assert_eq!(info.team1, "CFC");
        assert_eq!(info.team2, "WOL");
        assert_eq!(info.prop.as_deref(), Some("CFC"));
        assert_eq!(info.date, NaiveDate::from_ymd_opt(2025, 11, 8));
        assert!(parse_epl_ticker("SOMETHING-ELSE").is_none());
        assert!(parse_epl_ticker("KXNBA-25NOV08LALBOS-LAL").is_none());
    }

    #[test]
    fn test_parse_ticker_date() {
        assert_eq!(
            parse_ticker_date("24MAR01"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(parse_ticker_date("25XXX08"), None);
        assert_eq!(parse_ticker_date("short"), None);
    }
}
