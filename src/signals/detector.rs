//! Detector set.
//!
//! Every alarm family implements [`AlarmDetector`]: a pure function of a fixture's
//! market history and the family's thresholds. [`Detector`] is the tagged union the
//! pipeline dispatches over, built from a family's parameter table.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{AlarmFamily, Candidate, MarketType, Selection, Snapshot};
use crate::signals::{
    big_money::BigMoneyDetector,
    dedup::RetriggerPolicy,
    dropping::DroppingDetector,
    line_freeze::LineFreezeDetector,
    mim::MimDetector,
    reversal::ReversalDetector,
    sharp::SharpDetector,
    thresholds::ParamMap,
    volume_shift::VolumeShiftDetector,
    volume_shock::VolumeShockDetector,
};

pub trait AlarmDetector {
    fn family(&self) -> AlarmFamily;

    /// Fewer usable snapshots than this yields no candidates.
    fn min_snapshots(&self) -> usize;

    /// Candidates for one fixture's market history (time-ordered, oldest first).
    fn detect(&self, market: MarketType, history: &[Snapshot]) -> Vec<Candidate>;

    /// Cooldown / delta rule for refreshable families
    fn retrigger_policy(&self) -> Option<RetriggerPolicy> {
        None
    }
}

#[derive(Debug, Clone)]
pub enum Detector {
    BigMoney(BigMoneyDetector),
    VolumeShock(VolumeShockDetector),
    Dropping(DroppingDetector),
    LineFreeze(LineFreezeDetector),
    VolumeShift(VolumeShiftDetector),
    Sharp(SharpDetector),
    ReversalMove(ReversalDetector),
    Mim(MimDetector),
}

impl Detector {
    pub fn from_params(params: &ParamMap<'_>) -> Result<Self> {
        let detector = match params.family() {
            AlarmFamily::BigMoney => Detector::BigMoney(BigMoneyDetector::from_params(params)?),
            AlarmFamily::VolumeShock => {
                Detector::VolumeShock(VolumeShockDetector::from_params(params)?)
            }
            AlarmFamily::Dropping => Detector::Dropping(DroppingDetector::from_params(params)?),
            AlarmFamily::LineFreeze => {
                Detector::LineFreeze(LineFreezeDetector::from_params(params)?)
            }
            AlarmFamily::VolumeShift => {
                Detector::VolumeShift(VolumeShiftDetector::from_params(params)?)
            }
            AlarmFamily::Sharp => Detector::Sharp(SharpDetector::from_params(params)?),
            AlarmFamily::ReversalMove => {
                Detector::ReversalMove(ReversalDetector::from_params(params)?)
            }
            AlarmFamily::Mim => Detector::Mim(MimDetector::from_params(params)?),
        };
        Ok(detector)
    }

    fn inner(&self) -> &dyn AlarmDetector {
        match self {
            Detector::BigMoney(d) => d,
            Detector::VolumeShock(d) => d,
            Detector::Dropping(d) => d,
            Detector::LineFreeze(d) => d,
            Detector::VolumeShift(d) => d,
            Detector::Sharp(d) => d,
            Detector::ReversalMove(d) => d,
            Detector::Mim(d) => d,
        }
    }
}

impl AlarmDetector for Detector {
    fn family(&self) -> AlarmFamily {
        self.inner().family()
    }

    fn min_snapshots(&self) -> usize {
        self.inner().min_snapshots()
    }

    fn detect(&self, market: MarketType, history: &[Snapshot]) -> Vec<Candidate> {
        if history.len() < self.min_snapshots() {
            return Vec::new();
        }
        self.inner().detect(market, history)
    }

    fn retrigger_policy(&self) -> Option<RetriggerPolicy> {
        self.inner().retrigger_policy()
    }
}

/// Run every detector over one history; candidates come back ordered by trigger time.
pub fn detect_all(detectors: &[Detector], market: MarketType, history: &[Snapshot]) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = detectors
        .iter()
        .flat_map(|d| d.detect(market, history))
        .collect();
    candidates.sort_by(|a, b| {
        a.triggered_at
            .cmp(&b.triggered_at)
            .then_with(|| a.family().cmp(&b.family()))
            .then_with(|| a.selection.cmp(&b.selection))
    });
    candidates
}

/// One selection's fields at one snapshot (`idx` indexes the history slice).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Point {
    pub idx: usize,
    pub at: DateTime<Utc>,
    pub price: Option<f64>,
    pub amount: Option<f64>,
    pub share: Option<f64>,
}

/// Usable (positive) fields of `selection` across the history.
pub(crate) fn series(history: &[Snapshot], selection: Selection) -> Vec<Point> {
    history
        .iter()
        .enumerate()
        .map(|(idx, s)| Point {
            idx,
            at: s.captured_at,
            price: s.price(selection),
            amount: s.amount(selection),
            share: s.share(selection),
        })
        .collect()
}

/// `(opening − current) / opening · 100`
#[inline]
pub(crate) fn drop_pct(opening: f64, current: f64) -> f64 {
    (opening - current) / opening * 100.0
}
