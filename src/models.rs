use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::identity;

/// Width of the time buckets that window-based alarm fingerprints are truncated to.
pub const BUCKET_SECS: i64 = 600;

/// Maximum number of prior triggers kept on a refreshable alarm record.
pub const TRIGGER_HISTORY_CAP: usize = 10;

/// Truncate a timestamp to the start of its fingerprint bucket (unix seconds).
#[inline]
pub fn time_bucket(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(BUCKET_SECS) * BUCKET_SECS
}

/// Market types quoted per fixture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    /// Home / draw / away
    ThreeWay,
    /// Over / under 2.5 goals
    OverUnder,
    /// Both teams to score
    BothTeamsScore,
}

impl MarketType {
    pub const ALL: [MarketType; 3] = [
        MarketType::ThreeWay,
        MarketType::OverUnder,
        MarketType::BothTeamsScore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::ThreeWay => "1x2",
            MarketType::OverUnder => "ou25",
            MarketType::BothTeamsScore => "btts",
        }
    }

    /// Name of the snapshot history table for this market
    pub fn history_table(&self) -> &'static str {
        match self {
            MarketType::ThreeWay => "moneyway_1x2",
            MarketType::OverUnder => "moneyway_ou25",
            MarketType::BothTeamsScore => "moneyway_btts",
        }
    }

    pub fn selections(&self) -> &'static [Selection] {
        match self {
            MarketType::ThreeWay => &[Selection::Home, Selection::Draw, Selection::Away],
            MarketType::OverUnder => &[Selection::Over, Selection::Under],
            MarketType::BothTeamsScore => &[Selection::Yes, Selection::No],
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1x2" => Ok(MarketType::ThreeWay),
            "ou25" => Ok(MarketType::OverUnder),
            "btts" => Ok(MarketType::BothTeamsScore),
            other => Err(anyhow!("unknown market type: {other}")),
        }
    }
}

/// One answer within a market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    Home,
    Draw,
    Away,
    Over,
    Under,
    Yes,
    No,
}

impl Selection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Selection::Home => "1",
            Selection::Draw => "X",
            Selection::Away => "2",
            Selection::Over => "over",
            Selection::Under => "under",
            Selection::Yes => "yes",
            Selection::No => "no",
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Selection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "1" => Ok(Selection::Home),
            "X" | "x" => Ok(Selection::Draw),
            "2" => Ok(Selection::Away),
            "over" | "Over" => Ok(Selection::Over),
            "under" | "Under" => Ok(Selection::Under),
            "yes" | "Yes" => Ok(Selection::Yes),
            "no" | "No" => Ok(Selection::No),
            other => Err(anyhow!("unknown selection: {other}")),
        }
    }
}

/// The event a market is quoted on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixtureKey {
    pub home: String,
    pub away: String,
    pub league: String,
    /// Display only; never part of the fingerprint.
    #[serde(default)]
    pub kickoff: Option<String>,
}

impl FixtureKey {
    pub fn new(home: impl Into<String>, away: impl Into<String>, league: impl Into<String>) -> Self {
        Self {
            home: home.into(),
            away: away.into(),
            league: league.into(),
            kickoff: None,
        }
    }

    /// Match fingerprint; empty when the fixture can't be identified.
    pub fn fingerprint(&self) -> String {
        identity::fingerprint(&self.home, &self.away, &self.league)
    }
}

impl fmt::Display for FixtureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vs {} ({})", self.home, self.away, self.league)
    }
}

/// Per-selection quote inside a snapshot. Missing or malformed values are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionQuote {
    pub selection: Selection,
    pub price: Option<f64>,
    pub amount: Option<f64>,
    pub share_pct: Option<f64>,
}

impl SelectionQuote {
    #[inline]
    pub fn usable_price(&self) -> Option<f64> {
        positive(self.price)
    }

    #[inline]
    pub fn usable_amount(&self) -> Option<f64> {
        positive(self.amount)
    }

    #[inline]
    pub fn usable_share(&self) -> Option<f64> {
        positive(self.share_pct)
    }
}

#[inline]
fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x > 0.0)
}

/// One timestamped observation of a fixture's market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub fixture: FixtureKey,
    pub market: MarketType,
    pub captured_at: DateTime<Utc>,
    pub quotes: Vec<SelectionQuote>,
}

impl Snapshot {
    pub fn quote(&self, selection: Selection) -> Option<&SelectionQuote> {
        self.quotes.iter().find(|q| q.selection == selection)
    }

    pub fn price(&self, selection: Selection) -> Option<f64> {
        self.quote(selection).and_then(SelectionQuote::usable_price)
    }

    pub fn amount(&self, selection: Selection) -> Option<f64> {
        self.quote(selection).and_then(SelectionQuote::usable_amount)
    }

    pub fn share(&self, selection: Selection) -> Option<f64> {
        self.quote(selection).and_then(SelectionQuote::usable_share)
    }

    /// Sum of usable staked amounts across the market
    pub fn market_total(&self) -> f64 {
        self.quotes.iter().filter_map(SelectionQuote::usable_amount).sum()
    }
}

/// Raw, unparsed snapshot row as written by the collector (one row per selection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub market: MarketType,
    pub home: String,
    pub away: String,
    pub league: String,
    pub kickoff: Option<String>,
    pub captured_at: String,
    pub selection: String,
    pub price: Option<String>,
    pub amount: Option<String>,
    pub share: Option<String>,
}

impl SnapshotRow {
    pub fn fixture(&self) -> FixtureKey {
        FixtureKey {
            home: self.home.clone(),
            away: self.away.clone(),
            league: self.league.clone(),
            kickoff: self.kickoff.clone(),
        }
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.captured_at)
    }

    /// Parse into a quote. `None` when the selection label itself is unknown.
    pub fn quote(&self) -> Option<SelectionQuote> {
        let selection = self.selection.parse::<Selection>().ok()?;
        Some(SelectionQuote {
            selection,
            price: self.price.as_deref().and_then(parse_decimal),
            amount: self.amount.as_deref().and_then(parse_decimal),
            share_pct: self.share.as_deref().and_then(parse_decimal),
        })
    }
}

/// Parse a scraped numeric field: tolerates currency symbols, thousands separators and `%`.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or unix seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Alarm families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmFamily {
    BigMoney,
    VolumeShock,
    Dropping,
    LineFreeze,
    VolumeShift,
    Sharp,
    ReversalMove,
    Mim,
}

impl AlarmFamily {
    pub const ALL: [AlarmFamily; 8] = [
        AlarmFamily::BigMoney,
        AlarmFamily::VolumeShock,
        AlarmFamily::Dropping,
        AlarmFamily::LineFreeze,
        AlarmFamily::VolumeShift,
        AlarmFamily::Sharp,
        AlarmFamily::ReversalMove,
        AlarmFamily::Mim,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmFamily::BigMoney => "big_money",
            AlarmFamily::VolumeShock => "volume_shock",
            AlarmFamily::Dropping => "dropping",
            AlarmFamily::LineFreeze => "line_freeze",
            AlarmFamily::VolumeShift => "volume_shift",
            AlarmFamily::Sharp => "sharp",
            AlarmFamily::ReversalMove => "reversal_move",
            AlarmFamily::Mim => "mim",
        }
    }

    /// Refreshable families update their record in place as new inflow accumulates.
    pub fn is_refreshable(&self) -> bool {
        matches!(self, AlarmFamily::BigMoney | AlarmFamily::VolumeShock)
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        if self.is_refreshable() {
            ConflictPolicy::Refresh
        } else {
            ConflictPolicy::Preserve
        }
    }
}

impl fmt::Display for AlarmFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        AlarmFamily::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| anyhow!("unknown alarm family: {s}"))
    }
}

/// What the gateway does when a record with the same fingerprint already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Keep the stored record untouched (trigger timestamp is immutable)
    Preserve,
    /// Replace with a strictly newer trigger and push the old one into history
    Refresh,
}

/// Family-specific computed metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum AlarmDetails {
    BigMoney {
        inflow: f64,
        amount_before: f64,
        amount_after: f64,
        streak: u32,
        huge: bool,
    },
    VolumeShock {
        inflow: f64,
        baseline_avg: f64,
        shock: f64,
    },
    Dropping {
        opening: f64,
        current: f64,
        drop_pct: f64,
        level: u8,
        held_minutes: i64,
    },
    LineFreeze {
        price: f64,
        frozen_minutes: i64,
        inflow: f64,
        share_gain: f64,
        level: u8,
        others_moving: bool,
    },
    VolumeShift {
        from: Selection,
        to: Selection,
        new_money: f64,
        share_before: f64,
        share_after: f64,
    },
    Sharp {
        score: f64,
        volume_contrib: f64,
        odds_contrib: f64,
        share_contrib: f64,
        amount_change: f64,
        drop_pct: f64,
        share_gain: f64,
    },
    ReversalMove {
        opening: f64,
        trough: f64,
        current: f64,
        retracement_pct: f64,
        opposite_inflow: f64,
        own_inflow: f64,
    },
    Mim {
        inflow: f64,
        market_total: f64,
        impact: f64,
    },
}

impl AlarmDetails {
    pub fn family(&self) -> AlarmFamily {
        match self {
            AlarmDetails::BigMoney { .. } => AlarmFamily::BigMoney,
            AlarmDetails::VolumeShock { .. } => AlarmFamily::VolumeShock,
            AlarmDetails::Dropping { .. } => AlarmFamily::Dropping,
            AlarmDetails::LineFreeze { .. } => AlarmFamily::LineFreeze,
            AlarmDetails::VolumeShift { .. } => AlarmFamily::VolumeShift,
            AlarmDetails::Sharp { .. } => AlarmFamily::Sharp,
            AlarmDetails::ReversalMove { .. } => AlarmFamily::ReversalMove,
            AlarmDetails::Mim { .. } => AlarmFamily::Mim,
        }
    }
}

/// Output of a detector before dedup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub market: MarketType,
    pub selection: Selection,
    /// Snapshot timestamp that triggered the candidate
    pub triggered_at: DateTime<Utc>,
    /// Anchor of the movement; truncated into the fingerprint bucket
    pub window_start: DateTime<Utc>,
    /// Primary metric, used as the dedup baseline
    pub value: f64,
    pub details: AlarmDetails,
}

impl Candidate {
    #[inline]
    pub fn family(&self) -> AlarmFamily {
        self.details.family()
    }
}

/// Composite alarm identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlarmKey {
    pub match_fp: String,
    pub family: AlarmFamily,
    pub market: MarketType,
    pub selection: Selection,
    /// Bucket start (unix seconds); `None` for refreshable families
    pub bucket: Option<i64>,
}

impl AlarmKey {
    pub fn for_candidate(match_fp: &str, candidate: &Candidate) -> Self {
        let family = candidate.family();
        let bucket = if family.is_refreshable() {
            None
        } else {
            Some(time_bucket(candidate.window_start))
        };
        Self {
            match_fp: match_fp.to_string(),
            family,
            market: candidate.market,
            selection: candidate.selection,
            bucket,
        }
    }

    /// `match_fp|family|market|selection|bucket`, the persisted conflict key.
    pub fn fingerprint(&self) -> String {
        let bucket = self
            .bucket
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{}|{}|{}|{}|{}",
            self.match_fp,
            self.family.as_str(),
            self.market.as_str(),
            self.selection.as_str(),
            bucket
        )
    }
}

/// A prior trigger kept on a refreshable record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerEntry {
    pub triggered_at: DateTime<Utc>,
    pub value: f64,
}

/// Persisted alarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub key: AlarmKey,
    pub fixture: FixtureKey,
    pub triggered_at: DateTime<Utc>,
    pub value: f64,
    pub details: AlarmDetails,
    #[serde(default)]
    pub history: Vec<TriggerEntry>,
}

impl AlarmRecord {
    pub fn from_candidate(fixture: &FixtureKey, match_fp: &str, candidate: &Candidate) -> Self {
        Self {
            key: AlarmKey::for_candidate(match_fp, candidate),
            fixture: fixture.clone(),
            triggered_at: candidate.triggered_at,
            value: candidate.value,
            details: candidate.details.clone(),
            history: Vec::new(),
        }
    }

    #[inline]
    pub fn fingerprint(&self) -> String {
        self.key.fingerprint()
    }

    #[inline]
    pub fn family(&self) -> AlarmFamily {
        self.key.family
    }

    /// Fold a newer trigger into this record. Returns false (and leaves the record
    /// untouched) unless `newer` is strictly later.
    pub fn refresh_with(&mut self, newer: &AlarmRecord, cap: usize) -> bool {
        if newer.triggered_at <= self.triggered_at {
            return false;
        }
        self.history.push(TriggerEntry {
            triggered_at: self.triggered_at,
            value: self.value,
        });
        if self.history.len() > cap {
            let overflow = self.history.len() - cap;
            self.history.drain(..overflow);
        }
        self.triggered_at = newer.triggered_at;
        self.value = newer.value;
        self.details = newer.details.clone();
        true
    }
}

/// Per-identity dedup state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DedupState {
    pub last_fired_at: DateTime<Utc>,
    pub baseline: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn bucket_truncates_to_ten_minutes() {
        assert_eq!(time_bucket(ts(1_700_000_123)), 1_699_999_800);
        assert_eq!(time_bucket(ts(1_699_999_800)), 1_699_999_800);
    }

    #[test]
    fn parses_scraped_numbers() {
        assert_eq!(parse_decimal("£15,200"), Some(15200.0));
        assert_eq!(parse_decimal(" 45.2% "), Some(45.2));
        assert_eq!(parse_decimal("1.85"), Some(1.85));
        assert_eq!(parse_decimal("-"), None);
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("1.2.3"), None);
    }

    #[test]
    fn parses_timestamps_in_collector_formats() {
        let a = parse_timestamp("2025-03-01T12:00:00Z").unwrap();
        let b = parse_timestamp("2025-03-01 12:00:00").unwrap();
        let c = parse_timestamp(&a.timestamp().to_string()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn refreshable_keys_have_no_bucket() {
        let candidate = Candidate {
            market: MarketType::ThreeWay,
            selection: Selection::Home,
            triggered_at: ts(1_700_000_123),
            window_start: ts(1_700_000_000),
            value: 16_000.0,
            details: AlarmDetails::BigMoney {
                inflow: 16_000.0,
                amount_before: 1_000.0,
                amount_after: 17_000.0,
                streak: 1,
                huge: false,
            },
        };
        let key = AlarmKey::for_candidate("abc", &candidate);
        assert_eq!(key.fingerprint(), "abc|big_money|1x2|1|-");

        let mut mim = candidate.clone();
        mim.details = AlarmDetails::Mim {
            inflow: 1.0,
            market_total: 2.0,
            impact: 0.5,
        };
        let key = AlarmKey::for_candidate("abc", &mim);
        assert_eq!(key.fingerprint(), "abc|mim|1x2|1|1699999800");
    }

    #[test]
    fn refresh_keeps_bounded_history() {
        let fixture = FixtureKey::new("A", "B", "L");
        let base = AlarmRecord {
            key: AlarmKey {
                match_fp: "fp".into(),
                family: AlarmFamily::BigMoney,
                market: MarketType::ThreeWay,
                selection: Selection::Home,
                bucket: None,
            },
            fixture,
            triggered_at: ts(0),
            value: 0.0,
            details: AlarmDetails::BigMoney {
                inflow: 0.0,
                amount_before: 0.0,
                amount_after: 0.0,
                streak: 1,
                huge: false,
            },
            history: Vec::new(),
        };

        let mut record = base.clone();
        for i in 1..=5 {
            let mut newer = base.clone();
            newer.triggered_at = ts(i * 60);
            newer.value = i as f64;
            assert!(record.refresh_with(&newer, 3));
        }
        assert_eq!(record.value, 5.0);
        let kept: Vec<f64> = record.history.iter().map(|h| h.value).collect();
        assert_eq!(kept, vec![2.0, 3.0, 4.0]);

        // Replays of an older trigger leave the record untouched
        let stale = base.clone();
        assert!(!record.refresh_with(&stale, 3));
        assert_eq!(record.value, 5.0);
    }
}
