//! Sharp money: a weighted score over inflow, price drop and share gain on one step.
//!
//! Each factor contributes `min(max(raw, 0) * weight, cap)`:
//! - volume: step amount change over the average of the previous `avg_window` changes
//! - odds: step price drop in percent, weighted by the bucket of the new price
//! - share: share points gained on the step

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::models::{AlarmDetails, AlarmFamily, Candidate, MarketType, Snapshot};
use crate::signals::detector::{drop_pct, series, AlarmDetector};
use crate::signals::thresholds::ParamMap;

/// Odds weight applied when the new price is at or below `max_price`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct OddsBucket {
    pub max_price: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Factor {
    pub weight: f64,
    pub cap: f64,
}

impl Factor {
    #[inline]
    fn contribution(&self, raw: f64, weight: f64) -> f64 {
        (raw.max(0.0) * weight).min(self.cap)
    }
}

/// Per-factor contributions of one step
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SharpScore {
    pub volume: f64,
    pub odds: f64,
    pub share: f64,
}

impl SharpScore {
    #[inline]
    pub fn total(&self) -> f64 {
        self.volume + self.odds + self.share
    }

    /// Inclusive: a score equal to the threshold passes.
    #[inline]
    pub fn passes(&self, min_score: f64) -> bool {
        self.total() >= min_score
    }
}

#[derive(Debug, Clone)]
pub struct SharpDetector {
    pub min_score: f64,
    pub avg_window: usize,
    pub min_amount_change: f64,
    pub volume: Factor,
    pub odds: Factor,
    pub share: Factor,
    /// Sorted by `max_price`; prices above the last bucket use `odds.weight`
    pub odds_buckets: Vec<OddsBucket>,
    pub min_snapshots: usize,
}

impl SharpDetector {
    pub fn from_params(p: &ParamMap<'_>) -> Result<Self> {
        let factor = |name: &str| -> Result<Factor> {
            Ok(Factor {
                weight: p.required_non_negative(&format!("{name}_weight"))?,
                cap: p.required_non_negative(&format!("{name}_cap"))?,
            })
        };

        let mut odds_buckets: Vec<OddsBucket> = match p.table().get("odds_buckets") {
            None => Vec::new(),
            Some(raw) => raw
                .clone()
                .try_into()
                .context("sharp.odds_buckets must be an array of { max_price, weight }")?,
        };
        if odds_buckets
            .iter()
            .any(|b| !(b.max_price > 1.0 && b.weight >= 0.0 && b.weight.is_finite()))
        {
            bail!("sharp.odds_buckets need max_price > 1 and weight >= 0");
        }
        odds_buckets.sort_by(|a, b| a.max_price.total_cmp(&b.max_price));

        Ok(Self {
            min_score: p.required_positive("min_score")?,
            avg_window: p.count("avg_window", Some(5))?,
            min_amount_change: p.optional("min_amount_change", 0.0)?.max(0.0),
            volume: factor("volume")?,
            odds: factor("odds")?,
            share: factor("share")?,
            odds_buckets,
            min_snapshots: p.count("min_snapshots", Some(2))?,
        })
    }

    fn odds_weight(&self, price: f64) -> f64 {
        self.odds_buckets
            .iter()
            .find(|b| price <= b.max_price)
            .map(|b| b.weight)
            .unwrap_or(self.odds.weight)
    }

    pub fn score(&self, volume_raw: f64, drop: f64, price: f64, share_gain: f64) -> SharpScore {
        SharpScore {
            volume: self.volume.contribution(volume_raw, self.volume.weight),
            odds: self.odds.contribution(drop, self.odds_weight(price)),
            share: self.share.contribution(share_gain, self.share.weight),
        }
    }
}

impl AlarmDetector for SharpDetector {
    fn family(&self) -> AlarmFamily {
        AlarmFamily::Sharp
    }

    fn min_snapshots(&self) -> usize {
        self.min_snapshots
    }

    fn detect(&self, market: MarketType, history: &[Snapshot]) -> Vec<Candidate> {
        let mut out = Vec::new();

        for &selection in market.selections() {
            let points = series(history, selection);
            let mut changes: Vec<f64> = Vec::new();

            for step in points.windows(2) {
                let (prev, curr) = (step[0], step[1]);
                let (Some(before), Some(after)) = (prev.amount, curr.amount) else {
                    continue;
                };
                let amount_change = after - before;

                let recent = &changes[changes.len().saturating_sub(self.avg_window)..];
                let avg = if recent.is_empty() {
                    0.0
                } else {
                    recent.iter().sum::<f64>() / recent.len() as f64
                };
                changes.push(amount_change);

                if amount_change < self.min_amount_change || amount_change <= 0.0 {
                    continue;
                }
                let (Some(price_before), Some(price)) = (prev.price, curr.price) else {
                    continue;
                };

                let volume_raw = if avg > 0.0 { amount_change / avg } else { 0.0 };
                let drop = drop_pct(price_before, price);
                let share_gain = match (prev.share, curr.share) {
                    (Some(a), Some(b)) => b - a,
                    _ => 0.0,
                };

                let score = self.score(volume_raw, drop, price, share_gain);
                if !score.passes(self.min_score) {
                    continue;
                }

                out.push(Candidate {
                    market,
                    selection,
                    triggered_at: curr.at,
                    window_start: curr.at,
                    value: score.total(),
                    details: AlarmDetails::Sharp {
                        score: score.total(),
                        volume_contrib: score.volume,
                        odds_contrib: score.odds,
                        share_contrib: score.share,
                        amount_change,
                        drop_pct: drop,
                        share_gain,
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

    fn detector() -> SharpDetector {
        let table = params(
            AlarmFamily::Sharp,
            r#"
            [sharp]
            min_score = 40
            avg_window = 5
            volume_weight = 4
            volume_cap = 30
            odds_weight = 2
            odds_cap = 30
            share_weight = 2
            share_cap = 20
            min_amount_change = 1000
            odds_buckets = [
                { max_price = 1.60, weight = 2.5 },
                { max_price = 2.50, weight = 2.0 },
                { max_price = 4.00, weight = 1.5 },
            ]
            "#,
        );
        SharpDetector::from_params(&ParamMap::new(AlarmFamily::Sharp, &table)).unwrap()
    }

    #[test]
    fn threshold_is_inclusive() {
        let exact = SharpScore { volume: 20.0, odds: 10.0, share: 10.0 };
        assert!(exact.passes(40.0));
        let above = SharpScore { volume: 20.0, odds: 18.0, share: 10.0 };
        assert_eq!(above.total(), 48.0);
        assert!(above.passes(40.0));
        assert!(!SharpScore { volume: 20.0, odds: 9.9, share: 10.0 }.passes(40.0));
    }

    #[test]
    fn contributions_are_capped_and_floored() {
        let d = detector();
        let s = d.score(100.0, -5.0, 2.0, -3.0);
        assert_eq!(s.volume, 30.0);
        assert_eq!(s.odds, 0.0);
        assert_eq!(s.share, 0.0);
    }

    #[test]
    fn odds_weight_follows_price_bucket() {
        let d = detector();
        assert_eq!(d.odds_weight(1.50), 2.5);
        assert_eq!(d.odds_weight(1.60), 2.5);
        assert_eq!(d.odds_weight(2.10), 2.0);
        assert_eq!(d.odds_weight(3.00), 1.5);
        assert_eq!(d.odds_weight(7.00), 2.0);
    }

    #[test]
    fn combined_move_fires() {
        // (minute, home price, home amount, home share)
        let rows = [
            (0, 2.00, 10_000.0, 40.0),
            (10, 2.00, 11_000.0, 40.0),
            (20, 2.00, 12_000.0, 40.0),
            (30, 2.00, 13_000.0, 40.0),
            (40, 1.82, 18_000.0, 45.0),
        ];
        let h: Vec<Snapshot> = rows
            .iter()
            .map(|&(minute, price, amount, share)| {
                snap(
                    MarketType::ThreeWay,
                    minute,
                    &[
                        (Selection::Home, price, amount, share),
                        (Selection::Draw, 3.3, 5_000.0, 25.0),
                        (Selection::Away, 3.8, 7_000.0, 35.0),
                    ],
                )
            })
            .collect();

        let fired = detector().detect(MarketType::ThreeWay, &h);
        assert_eq!(fired.len(), 1);
        let c = &fired[0];
        assert_eq!(c.selection, Selection::Home);
        assert_eq!(c.triggered_at, at(40));
        match c.details {
            AlarmDetails::Sharp { volume_contrib, odds_contrib, share_contrib, score, .. } => {
                assert!((volume_contrib - 20.0).abs() < 1e-9);
                assert!((odds_contrib - 18.0).abs() < 1e-9);
                assert!((share_contrib - 10.0).abs() < 1e-9);
                assert!((score - 48.0).abs() < 1e-9);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn malformed_buckets_disable_the_family() {
        let table = params(
            AlarmFamily::Sharp,
            r#"
            [sharp]
            min_score = 40
            volume_weight = 4
            volume_cap = 30
            odds_weight = 2
            odds_cap = 30
            share_weight = 2
            share_cap = 20
            odds_buckets = [{ max_price = "low", weight = 2.5 }]
            "#,
        );
        assert!(SharpDetector::from_params(&ParamMap::new(AlarmFamily::Sharp, &table)).is_err());
    }
}
