//! Canonical match identity.
//!
//! Records from different platforms describe the same fixture with different
//! team spellings and timestamps minutes apart. The key built here is what
//! lets them land in the same bucket: normalized team tokens sorted
//! lexicographically (so home/away order never matters) plus the event date
//! truncated to the UTC calendar day.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Deterministic identifier grouping records about the same real-world
/// fixture across sources. A lookup key, never an ownership relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchKey(String);

impl MatchKey {
    #[allow(dead_code)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the canonical key for a fixture.
///
/// Team identifiers are canonicalized (case-folded, punctuation stripped)
/// and sorted before joining, so `match_key(a, b, d) == match_key(b, a, d)`
/// holds for all inputs. Unresolvable raw names still produce a stable key:
/// the same raw input always maps to the same key even when it will never
/// merge with anything.
pub fn match_key(team1: &str, team2: &str, date: NaiveDate) -> MatchKey {
    let mut a = canonical_token(team1);
    let mut b = canonical_token(team2);
    if b < a {
        std::mem::swap(&mut a, &mut b);
    }
    MatchKey(format!("{}|{}|{}", a, b, date.format("%Y-%m-%d")))
}

/// Lowercase a team name and strip everything but letters and digits, so
/// "Nott'm Forest" and "nottm forest" agree. Words are joined with '-' to
/// keep keys readable in logs and URLs.
pub fn canonical_token(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}
