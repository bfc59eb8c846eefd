//! Reconciliation: recompute the alarms the detectors would have produced over the
//! lookback window and insert any that never reached the store.
//!
//! Expected alarms come from the full history of each active fixture, run through a
//! fresh in-memory tracker, so this pass neither reads nor disturbs the live dedup
//! state. It only ever inserts; stored alarms are never deleted or rewritten here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::models::{AlarmKey, AlarmRecord, TRIGGER_HISTORY_CAP};
use crate::signals::dedup::DedupTracker;
use crate::signals::detector::detect_all;
use crate::signals::failure_log::{upsert_or_queue, FailureLog};
use crate::signals::pipeline::RunConfig;
use crate::signals::repository::{
    active_fixtures, ActiveFixture, AlarmGateway, AlarmScope, SnapshotRepository, UpsertOutcome,
};
use crate::signals::thresholds::{LiveThresholds, ThresholdSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub fixtures: usize,
    /// Markets or fixtures whose snapshots could not be read
    pub fetch_failures: usize,
    pub expected: usize,
    pub found: usize,
    pub missing: usize,
    pub inserted: usize,
    /// Missing at listing time, stored by a concurrent run before our write
    pub written_concurrently: usize,
    pub failed: usize,
}

pub struct Reconciler {
    repo: Arc<dyn SnapshotRepository>,
    gateway: Arc<dyn AlarmGateway>,
    thresholds: Arc<LiveThresholds>,
    failures: Arc<FailureLog>,
    clock: Arc<dyn Clock>,
    config: RunConfig,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn SnapshotRepository>,
        gateway: Arc<dyn AlarmGateway>,
        thresholds: Arc<LiveThresholds>,
        failures: Arc<FailureLog>,
        clock: Arc<dyn Clock>,
        config: RunConfig,
    ) -> Self {
        Self {
            repo,
            gateway,
            thresholds,
            failures,
            clock,
            config,
        }
    }

    /// One reconciliation pass. Fails only when the stored alarms can't be listed.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let now = self.clock.now();
        let thresholds = self.thresholds.reload();
        let mut report = ReconcileReport::default();

        let (targets, failed_markets) = active_fixtures(
            self.repo.as_ref(),
            &self.config.markets,
            now - self.config.lookback,
            self.config.io_timeout,
        )
        .await;
        report.fixtures = targets.len();
        report.fetch_failures = failed_markets;

        if targets.is_empty() {
            info!("🔍 Reconciliation: no active fixtures in window");
            return Ok(report);
        }

        let scope = AlarmScope::fixtures(
            targets
                .iter()
                .map(|t| t.match_fp.clone())
                .collect::<HashSet<_>>(),
        );

        let per_fixture: Vec<Option<Vec<AlarmRecord>>> = stream::iter(targets)
            .map(|target| self.expected_for(target, thresholds.clone()))
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        let mut expected: Vec<AlarmRecord> = Vec::new();
        for records in per_fixture {
            match records {
                Some(records) => expected.extend(records),
                None => report.fetch_failures += 1,
            }
        }
        report.expected = expected.len();

        let stored = tokio::time::timeout(self.config.io_timeout, self.gateway.list_by_scope(&scope))
            .await
            .map_err(|_| anyhow!("alarm listing timed out after {:?}", self.config.io_timeout))??;
        let stored: HashSet<String> = stored.iter().map(AlarmRecord::fingerprint).collect();

        let missing: Vec<&AlarmRecord> = expected
            .iter()
            .filter(|r| !stored.contains(&r.fingerprint()))
            .collect();
        report.found = report.expected - missing.len();
        report.missing = missing.len();

        for record in missing {
            warn!(
                fingerprint = %record.fingerprint(),
                family = %record.family(),
                fixture = %record.fixture,
                "🔧 Missing alarm, inserting"
            );
            match upsert_or_queue(
                self.gateway.as_ref(),
                &self.failures,
                record,
                None,
                self.config.io_timeout,
                now,
            )
            .await
            {
                Some(UpsertOutcome::Inserted) => {
                    report.inserted += 1;
                    metrics::increment_counter!("smartmoney_reconcile_inserted_total");
                }
                Some(_) => report.written_concurrently += 1,
                None => report.failed += 1,
            }
        }

        info!(
            fixtures = report.fixtures,
            expected = report.expected,
            found = report.found,
            missing = report.missing,
            inserted = report.inserted,
            written_concurrently = report.written_concurrently,
            failed = report.failed,
            fetch_failures = report.fetch_failures,
            "✅ Reconciliation complete"
        );
        Ok(report)
    }

    /// Alarms the detectors would have recorded for one fixture, one record per
    /// fingerprint. `None` when its history could not be read.
    async fn expected_for(
        &self,
        target: ActiveFixture,
        thresholds: Arc<ThresholdSet>,
    ) -> Option<Vec<AlarmRecord>> {
        let history = match tokio::time::timeout(
            self.config.io_timeout,
            self.repo.fetch_history(target.market, &target.fixture, None),
        )
        .await
        .map_err(|_| anyhow!("history read timed out after {:?}", self.config.io_timeout))
        .and_then(|r| r)
        {
            Ok(history) => history,
            Err(e) => {
                warn!(
                    fixture = %target.fixture,
                    market = %target.market,
                    error = %format!("{e:#}"),
                    "⚠️ Reconciliation skipped fixture"
                );
                return None;
            }
        };

        let tracker = DedupTracker::new();
        let mut records: Vec<AlarmRecord> = Vec::new();
        let mut by_fingerprint: HashMap<String, usize> = HashMap::new();

        for candidate in detect_all(&thresholds.detectors, target.market, &history) {
            let key = AlarmKey::for_candidate(&target.match_fp, &candidate);
            let policy = thresholds.retrigger_policy(candidate.family());
            if !tracker.decide_and_record(&key, &candidate, policy).should_notify() {
                continue;
            }

            let record = AlarmRecord::from_candidate(&target.fixture, &target.match_fp, &candidate);
            match by_fingerprint.get(&record.fingerprint()) {
                Some(&i) => {
                    records[i].refresh_with(&record, TRIGGER_HISTORY_CAP);
                }
                None => {
                    by_fingerprint.insert(record.fingerprint(), records.len());
                    records.push(record);
                }
            }
        }

        Some(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{AlarmFamily, MarketType, Selection};
    use crate::signals::db_storage::DbAlarmStorage;
    use crate::signals::detector::test_support::*;
    use crate::signals::snapshot_store::DbSnapshotRepository;
    use crate::signals::thresholds::{StaticThresholds, ThresholdSet};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    const THRESHOLDS: &str = r#"
        [big_money]
        limit = 15000
        retrigger_cooldown_minutes = 10
        retrigger_min_delta = 3000

        [mim]
        min_market_total = 20000
        impact_threshold = 0.10
    "#;

    /// Home money lands at +5 and +20 minutes; draw and away sit still.
    fn seeded_repo() -> Arc<DbSnapshotRepository> {
        let repo = DbSnapshotRepository::new(":memory:").unwrap();
        for (minute, home) in [(0, 10_000.0), (5, 26_200.0), (10, 26_500.0), (20, 47_500.0)] {
            repo.insert_rows(&rows(
                MarketType::ThreeWay,
                minute,
                &[
                    (Selection::Home, 2.0, home, 50.0),
                    (Selection::Draw, 3.3, 4_000.0, 25.0),
                    (Selection::Away, 3.6, 4_000.0, 25.0),
                ],
            ))
            .unwrap();
        }
        Arc::new(repo)
    }

    fn reconciler(
        repo: Arc<DbSnapshotRepository>,
        gateway: Arc<dyn AlarmGateway>,
        failures: Arc<FailureLog>,
        now_minute: i64,
    ) -> Reconciler {
        let set = ThresholdSet::from_toml_str(THRESHOLDS).unwrap();
        Reconciler::new(
            repo,
            gateway,
            Arc::new(LiveThresholds::new(StaticThresholds(set))),
            failures,
            Arc::new(ManualClock::new(at(now_minute))),
            RunConfig::default(),
        )
    }

    #[tokio::test]
    async fn inserts_missing_alarms_once() {
        let store = Arc::new(DbAlarmStorage::new(":memory:").unwrap());
        let rec = reconciler(seeded_repo(), store.clone(), Arc::new(FailureLog::new(10)), 30);

        // big money (one refreshed record) + two bucketed MIM alarms
        let first = rec.run_once().await.unwrap();
        assert_eq!(first.fixtures, 1);
        assert_eq!(first.expected, 3);
        assert_eq!(first.missing, 3);
        assert_eq!(first.inserted, 3);
        assert_eq!(store.len(), 3);

        let big = store
            .get_recent(10)
            .unwrap()
            .into_iter()
            .find(|r| r.family() == AlarmFamily::BigMoney)
            .unwrap();
        assert_eq!(big.triggered_at, at(20));
        assert_eq!(big.history.len(), 1);

        let second = rec.run_once().await.unwrap();
        assert_eq!(second.expected, 3);
        assert_eq!(second.found + second.missing, second.expected);
        assert_eq!(second.found, 3);
        assert_eq!(second.missing, 0);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn pass_runs_on_a_spawned_task() {
        let store = Arc::new(DbAlarmStorage::new(":memory:").unwrap());
        let rec = Arc::new(reconciler(seeded_repo(), store.clone(), Arc::new(FailureLog::new(10)), 30));

        let task = tokio::spawn({
            let rec = rec.clone();
            async move { rec.run_once().await }
        });
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn fixtures_outside_lookback_are_ignored() {
        let store = Arc::new(DbAlarmStorage::new(":memory:").unwrap());
        let rec = reconciler(
            seeded_repo(),
            store.clone(),
            Arc::new(FailureLog::new(10)),
            ChronoDuration::days(2).num_minutes(),
        );
        let report = rec.run_once().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert!(store.is_empty());
    }

    struct ReadOnlyGateway;

    #[async_trait]
    impl AlarmGateway for ReadOnlyGateway {
        async fn upsert(&self, _record: &AlarmRecord) -> Result<UpsertOutcome> {
            Err(anyhow!("attempt to write a readonly database"))
        }

        async fn list_by_scope(&self, _scope: &AlarmScope) -> Result<Vec<AlarmRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn failed_inserts_are_queued() {
        let failures = Arc::new(FailureLog::new(10));
        let rec = reconciler(seeded_repo(), Arc::new(ReadOnlyGateway), failures.clone(), 30);

        let report = rec.run_once().await.unwrap();
        assert_eq!(report.missing, 3);
        assert_eq!(report.inserted, 0);
        assert_eq!(report.failed, 3);
        assert_eq!(failures.len(), 3);
    }

    /// Lists nothing while the store already holds every record, as when another
    /// run writes between the listing and the insert.
    struct StaleListing(Arc<DbAlarmStorage>);

    #[async_trait]
    impl AlarmGateway for StaleListing {
        async fn upsert(&self, record: &AlarmRecord) -> Result<UpsertOutcome> {
            self.0.upsert(record).await
        }

        async fn list_by_scope(&self, _scope: &AlarmScope) -> Result<Vec<AlarmRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn concurrent_writes_are_counted_apart_from_found() {
        let store = Arc::new(DbAlarmStorage::new(":memory:").unwrap());
        let failures = Arc::new(FailureLog::new(10));
        reconciler(seeded_repo(), store.clone(), failures.clone(), 30)
            .run_once()
            .await
            .unwrap();
        assert_eq!(store.len(), 3);

        let rec = reconciler(seeded_repo(), Arc::new(StaleListing(store.clone())), failures, 30);
        let report = rec.run_once().await.unwrap();
        assert_eq!(report.expected, 3);
        assert_eq!(report.missing, 3);
        assert_eq!(report.found, 0);
        assert_eq!(report.found + report.missing, report.expected);
        assert_eq!(report.inserted, 0);
        assert_eq!(report.written_concurrently, 3);
        assert_eq!(store.len(), 3);
    }
}
