//! Big money: a single step's stake inflow on a selection reaches the limit.

use anyhow::Result;

use crate::models::{AlarmDetails, AlarmFamily, Candidate, MarketType, Snapshot};
use crate::signals::dedup::RetriggerPolicy;
use crate::signals::detector::{series, AlarmDetector};
use crate::signals::thresholds::ParamMap;

#[derive(Debug, Clone)]
pub struct BigMoneyDetector {
    pub limit: f64,
    /// Consecutive qualifying steps needed for the "huge" variant
    pub huge_streak: u32,
    pub min_snapshots: usize,
    pub retrigger: RetriggerPolicy,
}

impl BigMoneyDetector {
    pub fn from_params(p: &ParamMap<'_>) -> Result<Self> {
        Ok(Self {
            limit: p.required_positive("limit")?,
            huge_streak: p.count("huge_streak", Some(2))? as u32,
            min_snapshots: p.count("min_snapshots", Some(2))?,
            retrigger: p.retrigger_policy()?,
        })
    }
}

impl AlarmDetector for BigMoneyDetector {
    fn family(&self) -> AlarmFamily {
        AlarmFamily::BigMoney
    }

    fn min_snapshots(&self) -> usize {
        self.min_snapshots
    }

    fn retrigger_policy(&self) -> Option<RetriggerPolicy> {
        Some(self.retrigger)
    }

    fn detect(&self, market: MarketType, history: &[Snapshot]) -> Vec<Candidate> {
        let mut out = Vec::new();

        for &selection in market.selections() {
            let points: Vec<_> = series(history, selection)
                .into_iter()
                .filter_map(|p| p.amount.map(|a| (p.at, a)))
                .collect();

            let mut streak = 0u32;
            for step in points.windows(2) {
                let (prev_at, before) = step[0];
                let (at, after) = step[1];
                let inflow = after - before;

                if inflow < self.limit {
                    streak = 0;
                    continue;
                }
                streak += 1;

                out.push(Candidate {
                    market,
                    selection,
                    triggered_at: at,
                    window_start: prev_at,
                    value: inflow,
                    details: AlarmDetails::BigMoney {
                        inflow,
                        amount_before: before,
                        amount_after: after,
                        streak,
                        huge: streak >= self.huge_streak,
                    },
                });
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Selection;
    use crate::signals::detector::test_support::*;

    fn detector() -> BigMoneyDetector {
        let table = params(
            AlarmFamily::BigMoney,
            r#"
            [big_money]
            limit = 15000
            huge_streak = 2
            retrigger_cooldown_minutes = 10
            retrigger_min_delta = 3000
            "#,
        );
        BigMoneyDetector::from_params(&ParamMap::new(AlarmFamily::BigMoney, &table)).unwrap()
    }

    fn history(amounts: &[f64]) -> Vec<Snapshot> {
        amounts
            .iter()
            .enumerate()
            .map(|(i, &a)| {
                snap(
                    MarketType::BothTeamsScore,
                    i as i64 * 5,
                    &[(Selection::Yes, 1.8, a, 50.0), (Selection::No, 2.0, 10_000.0, 50.0)],
                )
            })
            .collect()
    }

    #[test]
    fn inflow_at_or_above_limit_fires() {
        let d = detector();
        let fired = d.detect(MarketType::BothTeamsScore, &history(&[10_000.0, 26_200.0]));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].selection, Selection::Yes);
        assert_eq!(fired[0].value, 16_200.0);
        assert_eq!(fired[0].triggered_at, at(5));

        let quiet = d.detect(MarketType::BothTeamsScore, &history(&[10_000.0, 24_999.0]));
        assert!(quiet.is_empty());
    }

    #[test]
    fn consecutive_steps_escalate_to_huge() {
        let d = detector();
        let fired = d.detect(
            MarketType::BothTeamsScore,
            &history(&[1.0, 20_000.0, 40_000.0, 41_000.0, 60_000.0]),
        );
        let flags: Vec<(u32, bool)> = fired
            .iter()
            .map(|c| match c.details {
                AlarmDetails::BigMoney { streak, huge, .. } => (streak, huge),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(flags, vec![(1, false), (2, true), (1, false)]);
    }

    #[test]
    fn missing_amounts_are_skipped_not_zeroed() {
        let d = detector();
        let mut h = history(&[10_000.0, 10_000.0, 12_000.0]);
        // A missing amount must not read as a 0 -> 12,000 inflow.
        h[1].quotes[0].amount = None;
        h[0].quotes[0].amount = Some(0.0);
        assert!(d.detect(MarketType::BothTeamsScore, &h).is_empty());
    }
}
