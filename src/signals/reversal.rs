//! Reversal move: a price that dropped is bouncing back, and the money agrees.
//!
//! Three criteria must all hold on the latest state:
//! 1. the price retraced at least `retracement_pct` of its largest drop from the
//!    opening (which itself must be at least `min_drop_pct`);
//! 2. the local trend flipped: falling over the `trend_window` points into the trough,
//!    rising over the last `trend_window` points;
//! 3. since the trough, the other selections took at least `min_opposite_inflow`
//!    and more than the selection itself.

use anyhow::Result;
use tracing::debug;

use crate::models::{AlarmDetails, AlarmFamily, Candidate, MarketType, Selection, Snapshot};
use crate::signals::detector::{drop_pct, series, AlarmDetector};
use crate::signals::thresholds::ParamMap;

#[derive(Debug, Clone)]
pub struct ReversalDetector {
    pub min_drop_pct: f64,
    pub retracement_pct: f64,
    pub trend_window: usize,
    pub min_opposite_inflow: f64,
    pub min_snapshots: usize,
}

impl ReversalDetector {
    pub fn from_params(p: &ParamMap<'_>) -> Result<Self> {
        let trend_window = p.count("trend_window", Some(2))?;
        Ok(Self {
            min_drop_pct: p.required_positive("min_drop_pct")?,
            retracement_pct: p.required_positive("retracement_pct")?,
            trend_window,
            min_opposite_inflow: p.required_non_negative("min_opposite_inflow")?,
            // falling leg + trough + rising leg
            min_snapshots: p.count("min_snapshots", Some(2 * trend_window + 1))?,
        })
    }
}

/// Amount gained by `selection` between two history indices, 0 when unknown
fn inflow_between(history: &[Snapshot], selection: Selection, from: usize, to: usize) -> f64 {
    match (history[from].amount(selection), history[to].amount(selection)) {
        (Some(a), Some(b)) => (b - a).max(0.0),
        _ => 0.0,
    }
}

impl AlarmDetector for ReversalDetector {
    fn family(&self) -> AlarmFamily {
        AlarmFamily::ReversalMove
    }

    fn min_snapshots(&self) -> usize {
        self.min_snapshots
    }

    fn detect(&self, market: MarketType, history: &[Snapshot]) -> Vec<Candidate> {
        let mut out = Vec::new();
        let w = self.trend_window;

        for &selection in market.selections() {
            let points: Vec<_> = series(history, selection)
                .into_iter()
                .filter_map(|p| p.price.map(|price| (p.idx, p.at, price)))
                .collect();
            let (Some(&(_, _, opening)), Some(&(last_idx, _, current))) =
                (points.first(), points.last())
            else {
                continue;
            };

            let Some(trough_pos) = points
                .iter()
                .enumerate()
                .min_by(|a, b| a.1 .2.total_cmp(&b.1 .2))
                .map(|(pos, _)| pos)
            else {
                continue;
            };
            let (trough_idx, trough_at, trough) = points[trough_pos];
            let max_drop = drop_pct(opening, trough);
            if max_drop < self.min_drop_pct || trough_pos + 1 == points.len() {
                continue;
            }

            let retracement_pct = (current - trough) / (opening - trough) * 100.0;
            let retraced = retracement_pct >= self.retracement_pct;

            let last_pos = points.len() - 1;
            let trend_flipped = trough_pos >= w
                && last_pos >= trough_pos + w
                && points[trough_pos - w].2 > trough
                && current > points[last_pos - w].2;

            let own_inflow = inflow_between(history, selection, trough_idx, last_idx);
            let opposite_inflow: f64 = market
                .selections()
                .iter()
                .filter(|s| **s != selection)
                .map(|&s| inflow_between(history, s, trough_idx, last_idx))
                .sum();
            let money_switched =
                opposite_inflow >= self.min_opposite_inflow && opposite_inflow > own_inflow;

            if !(retraced && trend_flipped && money_switched) {
                if retraced || trend_flipped || money_switched {
                    debug!(
                        selection = %selection,
                        market = %market,
                        retraced,
                        trend_flipped,
                        money_switched,
                        "Partial reversal, not raised"
                    );
                }
                continue;
            }

            out.push(Candidate {
                market,
                selection,
                triggered_at: points[last_pos].1,
                window_start: trough_at,
                value: retracement_pct,
                details: AlarmDetails::ReversalMove {
                    opening,
                    trough,
                    current,
                    retracement_pct,
                    opposite_inflow,
                    own_inflow,
                },
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::detector::test_support::*;

    fn detector() -> ReversalDetector {
        let table = params(
            AlarmFamily::ReversalMove,
            r#"
            [reversal_move]
            min_drop_pct = 8
            retracement_pct = 50
            trend_window = 2
            min_opposite_inflow = 5000
            "#,
        );
        ReversalDetector::from_params(&ParamMap::new(AlarmFamily::ReversalMove, &table)).unwrap()
    }

    /// (minute, home price, home amount, away amount)
    fn history(rows: &[(i64, f64, f64, f64)]) -> Vec<Snapshot> {
        rows.iter()
            .map(|&(minute, price, home, away)| {
                snap(
                    MarketType::ThreeWay,
                    minute,
                    &[
                        (Selection::Home, price, home, 50.0),
                        (Selection::Draw, 3.4, 3_000.0, 15.0),
                        (Selection::Away, 3.5, away, 35.0),
                    ],
                )
            })
            .collect()
    }

    #[test]
    fn full_reversal_fires_anchored_at_trough() {
        let h = history(&[
            (0, 2.20, 10_000.0, 5_000.0),
            (10, 2.10, 10_500.0, 5_000.0),
            (20, 2.00, 11_000.0, 5_000.0),
            (30, 2.06, 11_500.0, 9_000.0),
            (40, 2.12, 12_000.0, 12_000.0),
        ]);
        let fired = detector().detect(MarketType::ThreeWay, &h);
        assert_eq!(fired.len(), 1);
        let c = &fired[0];
        assert_eq!(c.selection, Selection::Home);
        assert_eq!(c.window_start, at(20));
        match c.details {
            AlarmDetails::ReversalMove { retracement_pct, opposite_inflow, own_inflow, .. } => {
                assert!((retracement_pct - 60.0).abs() < 1e-6);
                assert_eq!(opposite_inflow, 7_000.0);
                assert_eq!(own_inflow, 1_000.0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn price_bounce_without_money_is_only_partial() {
        let h = history(&[
            (0, 2.20, 10_000.0, 5_000.0),
            (10, 2.10, 10_500.0, 5_000.0),
            (20, 2.00, 11_000.0, 5_000.0),
            (30, 2.06, 14_000.0, 5_500.0),
            (40, 2.12, 18_000.0, 6_000.0),
        ]);
        assert!(detector().detect(MarketType::ThreeWay, &h).is_empty());
    }

    #[test]
    fn shallow_drop_is_ignored() {
        let h = history(&[
            (0, 2.00, 10_000.0, 5_000.0),
            (10, 1.98, 10_000.0, 5_000.0),
            (20, 1.95, 10_000.0, 5_000.0),
            (30, 1.98, 10_000.0, 12_000.0),
            (40, 2.00, 10_000.0, 20_000.0),
        ]);
        assert!(detector().detect(MarketType::ThreeWay, &h).is_empty());
    }

    #[test]
    fn trough_at_latest_point_is_not_a_reversal() {
        let h = history(&[
            (0, 2.20, 10_000.0, 5_000.0),
            (10, 2.10, 10_000.0, 6_000.0),
            (20, 2.05, 10_000.0, 9_000.0),
            (30, 2.02, 10_000.0, 12_000.0),
            (40, 2.00, 10_000.0, 15_000.0),
        ]);
        assert!(detector().detect(MarketType::ThreeWay, &h).is_empty());
    }
}
