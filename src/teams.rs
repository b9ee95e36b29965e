//! Team alias resolution.
//!
//! Producers name the same club three different ways: exchange tickers use
//! 3-letter codes ("CFC", "WOL"), model feeds use Football-Data spellings
//! ("Man United", "Nott'm Forest"), and market titles embed the club in free
//! text. The table here maps all of those onto one display name per club so
//! the identity resolver can merge records across sources.
//!
//! The built-in table covers the Premier League plus recently promoted and
//! relegated sides; `--team-aliases` merges a JSON file over it so squad
//! churn is a data update, not a code change.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

/// Alias table with the lookup order the normalizer relies on: exact hit,
/// then case-insensitive exact, then substring containment either way.
pub struct TeamAliases {
    /// Alias exactly as written -> canonical display name.
    exact: HashMap<String, String>,
    /// Alias lowercased -> canonical display name.
    folded: HashMap<String, String>,
    /// (display, lowercased) canonical names, sorted for deterministic scans.
    canonical: Vec<(String, String)>,
}

impl TeamAliases {
    /// Built-in Premier League table. Codes follow the exchange ticker
    /// conventions; spellings follow the common data-feed variants.
    pub fn premier_league() -> Self {
        let mut table = TeamAliases {
            exact: HashMap::new(),
            folded: HashMap::new(),
            canonical: Vec::new(),
        };
        for (canonical, aliases) in DEFAULT_TABLE {
            table.insert(canonical, aliases);
        }
        table.canonical.sort();
        table
    }

    /// Merge a JSON file of `{"Canonical Name": ["alias", ...]}` entries over
    /// the built-in table.
    pub fn premier_league_with_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read alias file {}", path.display()))?;
        let extra: HashMap<String, Vec<String>> = serde_json::from_str(&body)
            .with_context(|| format!("invalid alias file {}", path.display()))?;

        let mut table = Self::premier_league();
        for (canonical, aliases) in &extra {
            let aliases: Vec<&str> = aliases.iter().map(String::as_str).collect();
            table.insert(canonical, &aliases);
        }
        table.canonical.sort();
        table.canonical.dedup();
        Ok(table)
    }

    fn insert(&mut self, canonical: &str, aliases: &[&str]) {
        self.canonical
            .push((canonical.to_string(), canonical.to_lowercase()));
        for name in std::iter::once(&canonical).chain(aliases.iter()) {
            self.exact.insert(name.to_string(), canonical.to_string());
            self.folded.insert(name.to_lowercase(), canonical.to_string());
        }
    }

    /// Resolve a raw team identifier to its canonical display name.
    ///
    /// Returns `None` when no alias matches; callers fall back to the raw
    /// string so partial identification beats silent loss, and flag the miss
    /// for observability.
    pub fn resolve(&self, raw: &str) -> Option<&str> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(canonical) = self.exact.get(raw) {
            return Some(canonical);
        }
        let folded = raw.to_lowercase();
        if let Some(canonical) = self.folded.get(&folded) {
            return Some(canonical);
        }
        // Containment both ways handles "Will Chelsea win at home?" as well
        // as truncated fragments. Short fragments are skipped: two- and
        // three-letter substrings hit half the league by accident.
        if folded.len() >= 4 {
            for (display, canonical_folded) in &self.canonical {
                if folded.contains(canonical_folded.as_str())
                    || canonical_folded.contains(&folded)
                {
                    return Some(display);
                }
            }
        }
        None
    }

    /// Number of distinct clubs in the table.
    pub fn len(&self) -> usize {
        self.canonical.len()
    }
}

const DEFAULT_TABLE: &[(&str, &[&str])] = &[
    ("Arsenal", &["ARS"]),
    ("Aston Villa", &["AVL"]),
    ("Bournemouth", &["BOU", "AFC Bournemouth"]),
    ("Brentford", &["BRE"]),
    (
        "Brighton",
        &["BHA", "BRI", "Brighton & Hove Albion", "Brighton and Hove Albion"],
    ),
    ("Burnley", &["BUR"]),
    ("Chelsea", &["CHE", "CFC"]),
    ("Crystal Palace", &["CRY", "PAL"]),
    ("Everton", &["EVE"]),
    ("Fulham", &["FUL"]),
    ("Leeds", &["LEE", "Leeds Utd", "Leeds United"]),
    ("Leicester", &["LEI", "Leicester City"]),
    ("Liverpool", &["LIV", "LFC"]),
    ("Luton", &["LUT", "Luton Town"]),
    ("Manchester City", &["MCI", "Man City"]),
    (
        "Manchester United",
        &["MUN", "Man United", "Man Utd", "Manchester Utd"],
    ),
    ("Newcastle", &["NEW", "Newcastle Utd", "Newcastle United"]),
    (
        "Nottingham Forest",
        &["NFO", "Nott'm Forest", "Nott Forest"],
    ),
    ("Sheffield United", &["SHU", "Sheffield Utd"]),
    ("Southampton", &["SOU"]),
    ("Sunderland", &["SUN"]),
    ("Tottenham", &["TOT", "Spurs", "Tottenham Hotspur"]),
    ("West Ham", &["WHU", "West Ham United"]),
    ("Wolves", &["WOL", "Wolverhampton", "Wolverhampton Wanderers"]),
];
