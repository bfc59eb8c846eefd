//! Dropping odds: a sustained price decline from the opening price.
//!
//! A level counts only once it has held for the whole persistence window ending at
//! the latest snapshot: every point in that window (starting from the last point at
//! or before the window start) must be below the opening price and at least L1 down.
//! The reported level is that of the smallest drop inside the window.

use anyhow::{bail, Result};
use chrono::Duration as ChronoDuration;

use crate::models::{AlarmDetails, AlarmFamily, Candidate, MarketType, Snapshot};
use crate::signals::detector::{drop_pct, series, AlarmDetector};
use crate::signals::thresholds::ParamMap;

#[derive(Debug, Clone)]
pub struct DroppingDetector {
    pub l1_pct: f64,
    pub l2_pct: f64,
    pub l3_pct: f64,
    pub persistence: ChronoDuration,
    pub min_snapshots: usize,
}

impl DroppingDetector {
    pub fn from_params(p: &ParamMap<'_>) -> Result<Self> {
        let l1_pct = p.required_positive("l1_pct")?;
        let l2_pct = p.required_positive("l2_pct")?;
        let l3_pct = p.required_positive("l3_pct")?;
        if !(l1_pct < l2_pct && l2_pct < l3_pct) {
            bail!("dropping levels must increase: l1 {l1_pct} < l2 {l2_pct} < l3 {l3_pct}");
        }
        Ok(Self {
            l1_pct,
            l2_pct,
            l3_pct,
            persistence: p.minutes("persistence_minutes")?,
            min_snapshots: p.count("min_snapshots", Some(2))?,
        })
    }

    fn level(&self, drop: f64) -> u8 {
        if drop >= self.l3_pct {
            3
        } else if drop >= self.l2_pct {
            2
        } else {
            1
        }
    }
}

impl AlarmDetector for DroppingDetector {
    fn family(&self) -> AlarmFamily {
        AlarmFamily::Dropping
    }

    fn min_snapshots(&self) -> usize {
        self.min_snapshots
    }

    fn detect(&self, market: MarketType, history: &[Snapshot]) -> Vec<Candidate> {
        let mut out = Vec::new();

        for &selection in market.selections() {
            let points: Vec<_> = series(history, selection)
                .into_iter()
                .filter_map(|p| p.price.map(|price| (p.at, price)))
                .collect();
            let Some(&(_, opening)) = points.first() else {
                continue;
            };
            let Some(&(latest_at, current)) = points.last() else {
                continue;
            };
            if points.len() < 2 {
                continue;
            }

            let holds = |price: f64| price < opening && drop_pct(opening, price) >= self.l1_pct;

            // The window must be fully covered by history.
            let window_start = latest_at - self.persistence;
            let Some(anchor) = points.iter().rposition(|(at, _)| *at <= window_start) else {
                continue;
            };
            let window = &points[anchor..];
            if !window.iter().all(|&(_, price)| holds(price)) {
                continue;
            }

            let min_drop = window
                .iter()
                .map(|&(_, price)| drop_pct(opening, price))
                .fold(f64::INFINITY, f64::min);

            // Start of the continuous run the window belongs to; anchors the fingerprint
            // so later runs over a longer history map onto the same alarm.
            let mut run_start = anchor;
            while run_start > 0 && holds(points[run_start - 1].1) {
                run_start -= 1;
            }
            let run_start_at = points[run_start].0;
            let first_held = points[run_start..]
                .iter()
                .find(|(at, _)| *at >= run_start_at + self.persistence)
                .map(|(at, _)| *at)
                .unwrap_or(latest_at);

            out.push(Candidate {
                market,
                selection,
                triggered_at: first_held,
                window_start: run_start_at,
                value: min_drop,
                details: AlarmDetails::Dropping {
                    opening,
                    current,
                    drop_pct: min_drop,
                    level: self.level(min_drop),
                    held_minutes: (latest_at - run_start_at).num_minutes(),
                },
            });
        }

        out
    }
}
