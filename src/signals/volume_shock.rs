//! Volume shock: a step's inflow dwarfs the selection's recent step-delta baseline.

use anyhow::Result;

use crate::models::{AlarmDetails, AlarmFamily, Candidate, MarketType, Snapshot};
use crate::signals::dedup::RetriggerPolicy;
use crate::signals::detector::{series, AlarmDetector};
use crate::signals::thresholds::ParamMap;

#[derive(Debug, Clone)]
pub struct VolumeShockDetector {
    pub multiplier: f64,
    pub min_last_step: f64,
    /// Number of preceding step deltas averaged into the baseline
    pub baseline_steps: usize,
    pub min_snapshots: usize,
    pub retrigger: RetriggerPolicy,
}

impl VolumeShockDetector {
    pub fn from_params(p: &ParamMap<'_>) -> Result<Self> {
        let baseline_steps = p.count("baseline_steps", None)?;
        Ok(Self {
            multiplier: p.required_positive("multiplier")?,
            min_last_step: p.required_non_negative("min_last_step")?,
            baseline_steps,
            // baseline deltas + the shocked step itself
            min_snapshots: p.count("min_snapshots", Some(baseline_steps + 2))?,
            retrigger: p.retrigger_policy()?,
        })
    }
}

impl AlarmDetector for VolumeShockDetector {
    fn family(&self) -> AlarmFamily {
        AlarmFamily::VolumeShock
    }

    fn min_snapshots(&self) -> usize {
        self.min_snapshots
    }

    fn retrigger_policy(&self) -> Option<RetriggerPolicy> {
        Some(self.retrigger)
    }

    fn detect(&self, market: MarketType, history: &[Snapshot]) -> Vec<Candidate> {
        let mut out = Vec::new();
        let n = self.baseline_steps;

        for &selection in market.selections() {
            let points: Vec<_> = series(history, selection)
                .into_iter()
                .filter_map(|p| p.amount.map(|a| (p.at, a)))
                .collect();

            // (step start, step end, delta)
            let deltas: Vec<_> = points
                .windows(2)
                .map(|w| (w[0].0, w[1].0, w[1].1 - w[0].1))
                .collect();

            for i in n..deltas.len() {
                let (start, at, inflow) = deltas[i];
                if inflow <= 0.0 || inflow < self.min_last_step {
                    continue;
                }

                let baseline_avg = deltas[i - n..i].iter().map(|d| d.2).sum::<f64>() / n as f64;
                if baseline_avg <= 0.0 {
                    continue;
                }

                let shock = inflow / baseline_avg;
                if shock < self.multiplier {
                    continue;
                }

                out.push(Candidate {
                    market,
                    selection,
                    triggered_at: at,
                    window_start: start,
                    value: inflow,
                    details: AlarmDetails::VolumeShock {
                        inflow,
                        baseline_avg,
                        shock,
                    },
                });
            }
        }

        out
    }
}
