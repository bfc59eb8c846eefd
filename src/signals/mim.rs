//! Market impact (MIM): one step's inflow is a large slice of the whole market.

use anyhow::{bail, Result};

use crate::models::{AlarmDetails, AlarmFamily, Candidate, MarketType, Snapshot};
use crate::signals::detector::AlarmDetector;
use crate::signals::thresholds::ParamMap;

#[derive(Debug, Clone)]
pub struct MimDetector {
    pub min_market_total: f64,
    /// Ratio in (0, 1]
    pub impact_threshold: f64,
    pub min_snapshots: usize,
}

impl MimDetector {
    pub fn from_params(p: &ParamMap<'_>) -> Result<Self> {
        let impact_threshold = p.required_positive("impact_threshold")?;
        if impact_threshold > 1.0 {
            bail!("mim.impact_threshold is a ratio, must be <= 1 (got {impact_threshold})");
        }
        Ok(Self {
            min_market_total: p.required_non_negative("min_market_total")?,
            impact_threshold,
            min_snapshots: p.count("min_snapshots", Some(2))?,
        })
    }
}

impl AlarmDetector for MimDetector {
    fn family(&self) -> AlarmFamily {
        AlarmFamily::Mim
    }

    fn min_snapshots(&self) -> usize {
        self.min_snapshots
    }

    fn detect(&self, market: MarketType, history: &[Snapshot]) -> Vec<Candidate> {
        let mut out = Vec::new();

        for step in history.windows(2) {
            let (prev, curr) = (&step[0], &step[1]);
            let market_total = curr.market_total();
            if market_total <= 0.0 || market_total < self.min_market_total {
                continue;
            }

            let best = market
                .selections()
                .iter()
                .filter_map(|&s| match (prev.amount(s), curr.amount(s)) {
                    (Some(before), Some(after)) if after > before => Some((s, after - before)),
                    _ => None,
                })
                .filter(|(_, inflow)| inflow / market_total >= self.impact_threshold)
                .max_by(|a, b| a.1.total_cmp(&b.1));

            let Some((selection, inflow)) = best else {
                continue;
            };
            let impact = inflow / market_total;

            out.push(Candidate {
                market,
                selection,
                triggered_at: curr.captured_at,
                window_start: curr.captured_at,
                value: impact,
                details: AlarmDetails::Mim {
                    inflow,
                    market_total,
                    impact,
                },
            });
        }

        out
    }
}
