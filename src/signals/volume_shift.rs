//! Volume shift: market leadership (the selection holding the majority of the
//! stake share) changes hands on fresh money.

use anyhow::{bail, Result};

use crate::models::{AlarmDetails, AlarmFamily, Candidate, MarketType, Selection, Snapshot};
use crate::signals::detector::AlarmDetector;
use crate::signals::thresholds::ParamMap;

#[derive(Debug, Clone)]
pub struct VolumeShiftDetector {
    pub min_new_money: f64,
    pub min_share_gain: f64,
    /// Share (%) a selection must exceed to count as dominant
    pub dominance_pct: f64,
    pub min_snapshots: usize,
}

impl VolumeShiftDetector {
    pub fn from_params(p: &ParamMap<'_>) -> Result<Self> {
        let dominance_pct = p.optional("dominance_pct", 50.0)?;
        if !(50.0..100.0).contains(&dominance_pct) {
            bail!("volume_shift.dominance_pct must be in [50, 100) (got {dominance_pct})");
        }
        Ok(Self {
            min_new_money: p.required_non_negative("min_new_money")?,
            min_share_gain: p.required_non_negative("min_share_gain")?,
            dominance_pct,
            min_snapshots: p.count("min_snapshots", Some(2))?,
        })
    }

    fn dominant(&self, market: MarketType, snapshot: &Snapshot) -> Option<(Selection, f64)> {
        market.selections().iter().find_map(|&s| {
            snapshot
                .share(s)
                .filter(|share| *share > self.dominance_pct)
                .map(|share| (s, share))
        })
    }
}

impl AlarmDetector for VolumeShiftDetector {
    fn family(&self) -> AlarmFamily {
        AlarmFamily::VolumeShift
    }

    fn min_snapshots(&self) -> usize {
        self.min_snapshots
    }

    fn detect(&self, market: MarketType, history: &[Snapshot]) -> Vec<Candidate> {
        let mut out = Vec::new();

        for step in history.windows(2) {
            let (prev, curr) = (&step[0], &step[1]);
            let (Some((from, _)), Some((to, share_after))) =
                (self.dominant(market, prev), self.dominant(market, curr))
            else {
                continue;
            };
            if from == to {
                continue;
            }

            let new_money = curr.market_total() - prev.market_total();
            let share_before = prev.share(to).unwrap_or(0.0);
            let share_gain = share_after - share_before;
            if new_money < self.min_new_money && share_gain < self.min_share_gain {
                continue;
            }
            // Leadership bought with withdrawn money is noise.
            if new_money <= 0.0 && share_gain < self.min_share_gain {
                continue;
            }

            out.push(Candidate {
                market,
                selection: to,
                triggered_at: curr.captured_at,
                window_start: curr.captured_at,
                value: new_money.max(0.0),
                details: AlarmDetails::VolumeShift {
                    from,
                    to,
                    new_money,
                    share_before,
                    share_after,
                },
            });
        }

        out
    }
}
