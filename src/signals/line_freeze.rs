//! Line freeze: the price stays put while money keeps coming in.
//!
//! The frozen run is the longest suffix of the history whose prices all sit within
//! `max_change` of the latest price. Its length, the inflow over it and the share
//! gained over it decide the level (L1..L3). When another selection of the same
//! market moved meanwhile, the level is raised by one.

use anyhow::{bail, Result};
use chrono::Duration as ChronoDuration;

use crate::models::{AlarmDetails, AlarmFamily, Candidate, MarketType, Selection, Snapshot};
use crate::signals::detector::{drop_pct, series, AlarmDetector, Point};
use crate::signals::thresholds::ParamMap;

/// Duration + inflow/share combination for one level
#[derive(Debug, Clone, Copy)]
pub struct FreezeLevel {
    pub min_duration: ChronoDuration,
    pub min_amount: f64,
    pub min_share_gain: f64,
}

impl FreezeLevel {
    fn met(&self, duration: ChronoDuration, inflow: f64, share_gain: f64) -> bool {
        duration >= self.min_duration
            && (inflow >= self.min_amount || share_gain >= self.min_share_gain)
    }
}

#[derive(Debug, Clone)]
pub struct LineFreezeDetector {
    /// Largest absolute price change still counted as frozen
    pub max_change: f64,
    pub other_move_pct: f64,
    /// L1..L3, in order
    pub levels: [FreezeLevel; 3],
    pub min_snapshots: usize,
}

impl LineFreezeDetector {
    pub fn from_params(p: &ParamMap<'_>) -> Result<Self> {
        let level = |k: u8| -> Result<FreezeLevel> {
            Ok(FreezeLevel {
                min_duration: p.minutes(&format!("l{k}_minutes"))?,
                min_amount: p.required_non_negative(&format!("l{k}_amount"))?,
                min_share_gain: p.required_non_negative(&format!("l{k}_share"))?,
            })
        };
        let levels = [level(1)?, level(2)?, level(3)?];
        if !(levels[0].min_duration < levels[1].min_duration
            && levels[1].min_duration < levels[2].min_duration)
        {
            bail!("line_freeze level durations must increase");
        }

        Ok(Self {
            max_change: p.required_non_negative("max_change")?,
            other_move_pct: p.required_positive("other_move_pct")?,
            levels,
            min_snapshots: p.count("min_snapshots", Some(3))?,
        })
    }

    /// Any other selection whose price moved by `other_move_pct` or more across `run`.
    fn others_moving(&self, market: MarketType, run: &[Snapshot], frozen: Selection) -> bool {
        market
            .selections()
            .iter()
            .filter(|s| **s != frozen)
            .any(|&other| {
                let prices: Vec<f64> = series(run, other).into_iter().filter_map(|p| p.price).collect();
                match (prices.first(), prices.last()) {
                    (Some(&first), Some(&last)) if prices.len() >= 2 => {
                        drop_pct(first, last).abs() >= self.other_move_pct
                    }
                    _ => false,
                }
            })
    }
}

/// `last − first` over the usable values of a run, 0 when fewer than two exist
fn gain(values: impl Iterator<Item = Option<f64>>) -> f64 {
    let usable: Vec<f64> = values.flatten().collect();
    match (usable.first(), usable.last()) {
        (Some(first), Some(last)) if usable.len() >= 2 => last - first,
        _ => 0.0,
    }
}

impl AlarmDetector for LineFreezeDetector {
    fn family(&self) -> AlarmFamily {
        AlarmFamily::LineFreeze
    }

    fn min_snapshots(&self) -> usize {
        self.min_snapshots
    }

    fn detect(&self, market: MarketType, history: &[Snapshot]) -> Vec<Candidate> {
        let mut out = Vec::new();

        for &selection in market.selections() {
            let points: Vec<_> = series(history, selection)
                .into_iter()
                .filter(|p| p.price.is_some())
                .collect();
            let Some(latest) = points.last().copied() else {
                continue;
            };
            let latest_price = latest.price.unwrap_or_default();

            let frozen = |p: &Point| {
                p.price
                    .map(|price| (price - latest_price).abs() <= self.max_change + f64::EPSILON)
                    .unwrap_or(false)
            };
            let run_len = points.iter().rev().take_while(|p| frozen(*p)).count();
            if run_len < 2 {
                continue;
            }
            let run = &points[points.len() - run_len..];
            let start = run[0];
            let duration = latest.at - start.at;

            let inflow = gain(run.iter().map(|p| p.amount)).max(0.0);
            let share_gain = gain(run.iter().map(|p| p.share));

            let Some(base_level) = self
                .levels
                .iter()
                .rposition(|lvl| lvl.met(duration, inflow, share_gain))
                .map(|i| i as u8 + 1)
            else {
                continue;
            };

            let others_moving =
                self.others_moving(market, &history[start.idx..=latest.idx], selection);
            let level = if others_moving {
                (base_level + 1).min(3)
            } else {
                base_level
            };

            out.push(Candidate {
                market,
                selection,
                triggered_at: latest.at,
                window_start: start.at,
                value: inflow,
                details: AlarmDetails::LineFreeze {
                    price: latest_price,
                    frozen_minutes: duration.num_minutes(),
                    inflow,
                    share_gain,
                    level,
                    others_moving,
                },
            });
        }

        out
    }
}
