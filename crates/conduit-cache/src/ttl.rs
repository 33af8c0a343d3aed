use chrono::{Datelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

static VOLATILE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(today|tonight|now|right now|current(ly)?|latest|live|real[- ]?time|yesterday|this (week|month|quarter|year)|so far)\b",
    )
    .ok()
});

static CLOSED_PERIOD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\b(last (year|quarter)|previous (year|quarter))\b").ok());

static YEAR: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\b(19|20)\d{2}\b").ok());

/// How quickly the answer to a request is expected to go stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Mentions a moving time window; the answer changes soon.
    Volatile,
    /// Only refers to periods that have already closed.
    Historical,
    /// Neither volatile nor historical.
    Default,
}

impl std::fmt::Display for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Freshness::Volatile => write!(f, "volatile"),
            Freshness::Historical => write!(f, "historical"),
            Freshness::Default => write!(f, "default"),
        }
    }
}

/// Picks a TTL from the wording of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlPolicy {
    /// TTL for [`Freshness::Default`].
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// TTL for [`Freshness::Volatile`].
    #[serde(default = "default_volatile_ttl_secs")]
    pub volatile_ttl_secs: u64,
    /// TTL for [`Freshness::Historical`].
    #[serde(default = "default_historical_ttl_secs")]
    pub historical_ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    3_600
}
fn default_volatile_ttl_secs() -> u64 {
    300
}
fn default_historical_ttl_secs() -> u64 {
    86_400
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            volatile_ttl_secs: default_volatile_ttl_secs(),
            historical_ttl_secs: default_historical_ttl_secs(),
        }
    }
}

impl TtlPolicy {
    /// Volatile wording wins over historical references.
    pub fn classify(&self, text: &str) -> Freshness {
        if matches(&VOLATILE, text) {
            return Freshness::Volatile;
        }
        if matches(&CLOSED_PERIOD, text) || mentions_only_past_years(text) {
            return Freshness::Historical;
        }
        Freshness::Default
    }

    /// TTL for a freshness class.
    pub fn ttl_for(&self, freshness: Freshness) -> Duration {
        Duration::from_secs(match freshness {
            Freshness::Volatile => self.volatile_ttl_secs,
            Freshness::Historical => self.historical_ttl_secs,
            Freshness::Default => self.default_ttl_secs,
        })
    }
}

fn matches(re: &LazyLock<Option<Regex>>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

/// At least one four-digit year, and all of them before the current one.
fn mentions_only_past_years(text: &str) -> bool {
    let Some(re) = YEAR.as_ref() else {
        return false;
    };
    let current = Utc::now().year();
    let mut years = re
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<i32>().ok())
        .peekable();
    years.peek().is_some() && years.all(|y| y < current)
}
