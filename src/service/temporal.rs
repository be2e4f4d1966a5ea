//! Temporal consistency checking.
//!
//! Compares the dates a claim references against the last-update date of
//! the page backing it, and applies a trust decay to stale sources.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;

/// Staleness below this many days attracts no decay.
const STALE_GRACE_DAYS: i64 = 30;
/// Staleness at or beyond this many days attracts the maximal decay.
const STALE_MAX_DAYS: i64 = 365;
/// Trust multiplier floor for maximally stale pages.
const MAX_STALE_DECAY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyLevel {
    /// Page is at least as new as the claim's referenced date.
    Consistent,
    /// Page is much older than today.
    Stale,
    /// Page predates the event the claim references.
    Impossible,
    /// Claim references a future date.
    Suspicious,
    /// No dates to compare.
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyResult {
    pub level: ConsistencyLevel,
    pub claim_date: Option<NaiveDate>,
    pub page_date: Option<NaiveDate>,
    /// Multiplier in (0, 1] applied to source trust.
    pub trust_factor: f64,
}

/// Extract candidate dates from free text: ISO, slash form, Japanese
/// 年月日 form and bare years.
pub fn extract_dates(text: &str) -> Vec<NaiveDate> {
    let mut dates = Vec::new();

    let iso = Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("static regex");
    for cap in iso.captures_iter(text) {
        if let Some(date) = ymd(&cap[1], &cap[2], &cap[3]) {
            dates.push(date);
        }
    }

    let slash = Regex::new(r"\b(\d{4})/(\d{1,2})/(\d{1,2})\b").expect("static regex");
    for cap in slash.captures_iter(text) {
        if let Some(date) = ymd(&cap[1], &cap[2], &cap[3]) {
            dates.push(date);
        }
    }

    let japanese = Regex::new(r"(\d{4})年(?:(\d{1,2})月)?(?:(\d{1,2})日)?").expect("static regex");
    for cap in japanese.captures_iter(text) {
        let month = cap.get(2).map(|m| m.as_str()).unwrap_or("1");
        let day = cap.get(3).map(|m| m.as_str()).unwrap_or("1");
        if let Some(date) = ymd(&cap[1], month, day) {
            dates.push(date);
        }
    }

    let year_only = Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("static regex");
    for cap in year_only.captures_iter(text) {
        if let Some(date) = ymd(&cap[1], "1", "1") {
            // Bare years only count when no precise form captured them.
            if !dates.iter().any(|d| d.year().to_string() == cap[1].to_string()) {
                dates.push(date);
            }
        }
    }

    dates.sort();
    dates.dedup();
    dates
}

fn ymd(y: &str, m: &str, d: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
}

/// Check a (claim, page) pair.
///
/// The claim date is the latest date the claim text references; `page_date`
/// is the page's last-update date when known.
pub fn check_consistency(
    claim_text: &str,
    page_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ConsistencyResult {
    let claim_dates = extract_dates(claim_text);
    let claim_date = claim_dates.last().copied();
    let page_naive = page_date.map(|dt| dt.date_naive());
    let today = now.date_naive();

    let level = match (claim_date, page_naive) {
        (Some(claim), _) if claim > today => ConsistencyLevel::Suspicious,
        (Some(claim), Some(page)) if page < claim => ConsistencyLevel::Impossible,
        (_, Some(page)) if (today - page).num_days() > STALE_MAX_DAYS => ConsistencyLevel::Stale,
        (Some(_), Some(_)) => ConsistencyLevel::Consistent,
        (None, Some(_)) => ConsistencyLevel::Consistent,
        _ => ConsistencyLevel::Unknown,
    };

    let trust_factor = match page_naive {
        Some(page) if level != ConsistencyLevel::Impossible => {
            staleness_decay((today - page).num_days())
        }
        Some(_) => MAX_STALE_DECAY,
        None => 1.0,
    };

    ConsistencyResult {
        level,
        claim_date,
        page_date: page_naive,
        trust_factor,
    }
}

/// Linear trust decay over staleness days: 1.0 below 30 days, falling to
/// the floor at 365 days and beyond.
pub fn staleness_decay(stale_days: i64) -> f64 {
    if stale_days <= STALE_GRACE_DAYS {
        return 1.0;
    }
    let span = (STALE_MAX_DAYS - STALE_GRACE_DAYS) as f64;
    let progress = ((stale_days - STALE_GRACE_DAYS) as f64 / span).min(1.0);
    1.0 - progress * (1.0 - MAX_STALE_DECAY)
}

/// Convenience wrapper returning the decayed confidence.
pub fn apply_temporal_decay(confidence: f64, page_date: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    confidence * staleness_decay((now.date_naive() - page_date.date_naive()).num_days())
}
