//! Detection run orchestration.
//!
//! A run retries the failure log, reloads thresholds, lists the fixtures active in
//! the lookback window and processes them on a bounded worker pool. Each fixture
//! commits independently: history from the cache, detectors, dedup decision,
//! gateway upsert, notification. Changed dedup states are persisted at the end.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Duration as ChronoDuration;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::models::{AlarmKey, AlarmRecord, MarketType};
use crate::signals::cache::{CacheConfig, HistoryCache};
use crate::signals::dedup::{Decision, DedupTracker};
use crate::signals::detector::detect_all;
use crate::signals::failure_log::{upsert_or_queue, FailureLog, RetryReport};
use crate::signals::notify::{AlarmMessage, LogNotifier, Notifier};
use crate::signals::repository::{
    active_fixtures, ActiveFixture, AlarmGateway, DedupStateStore, SnapshotRepository,
    UpsertOutcome,
};
use crate::signals::thresholds::{LiveThresholds, ThresholdSet};

/// Knobs shared by detection and reconciliation runs
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Fixtures whose latest snapshot is older than this are ignored
    pub lookback: ChronoDuration,
    /// Fixtures processed concurrently
    pub workers: usize,
    /// Bound on every repository / gateway / notifier call
    pub io_timeout: Duration,
    pub markets: Vec<MarketType>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lookback: ChronoDuration::hours(6),
            workers: 8,
            io_timeout: Duration::from_secs(5),
            markets: MarketType::ALL.to_vec(),
        }
    }
}

/// Counts for one detection run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub fixtures: usize,
    pub fetch_failures: usize,
    pub candidates: usize,
    pub fired: usize,
    pub retriggered: usize,
    pub suppressed: usize,
    pub inserted: usize,
    pub refreshed: usize,
    /// Fired by the tracker but already stored (e.g. after a restart)
    pub already_stored: usize,
    pub write_failures: usize,
    pub notified: usize,
    pub states_saved: usize,
    pub retried: usize,
    pub retry_succeeded: usize,
}

impl RunReport {
    fn absorb(&mut self, other: FixtureReport) {
        self.candidates += other.candidates;
        self.fired += other.fired;
        self.retriggered += other.retriggered;
        self.suppressed += other.suppressed;
        self.inserted += other.inserted;
        self.refreshed += other.refreshed;
        self.already_stored += other.already_stored;
        self.write_failures += other.write_failures;
        self.notified += other.notified;
        if other.fetch_failed {
            self.fetch_failures += 1;
        }
    }
}

#[derive(Debug, Default)]
struct FixtureReport {
    fetch_failed: bool,
    candidates: usize,
    fired: usize,
    retriggered: usize,
    suppressed: usize,
    inserted: usize,
    refreshed: usize,
    already_stored: usize,
    write_failures: usize,
    notified: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub tracker_removed: usize,
    pub store_removed: usize,
}

pub struct DetectionPipeline {
    repo: Arc<dyn SnapshotRepository>,
    cache: HistoryCache,
    gateway: Arc<dyn AlarmGateway>,
    states: Option<Arc<dyn DedupStateStore>>,
    thresholds: Arc<LiveThresholds>,
    tracker: DedupTracker,
    failures: Arc<FailureLog>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: RunConfig,
}

impl DetectionPipeline {
    pub fn new(
        repo: Arc<dyn SnapshotRepository>,
        gateway: Arc<dyn AlarmGateway>,
        thresholds: Arc<LiveThresholds>,
        failures: Arc<FailureLog>,
        clock: Arc<dyn Clock>,
        config: RunConfig,
    ) -> Self {
        let cache_config = CacheConfig {
            fetch_timeout: config.io_timeout,
            ..Default::default()
        };
        Self {
            cache: HistoryCache::new(repo.clone(), clock.clone(), cache_config),
            repo,
            gateway,
            states: None,
            thresholds,
            tracker: DedupTracker::new(),
            failures,
            notifier: Arc::new(LogNotifier),
            clock,
            config,
        }
    }

    pub fn with_cache_config(mut self, cache_config: CacheConfig) -> Self {
        self.cache = HistoryCache::new(self.repo.clone(), self.clock.clone(), cache_config);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_state_store(mut self, states: Arc<dyn DedupStateStore>) -> Self {
        self.states = Some(states);
        self
    }

    pub fn tracker(&self) -> &DedupTracker {
        &self.tracker
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    /// Seed the tracker from the state store, so cooldowns survive a restart.
    pub async fn hydrate(&self) -> Result<usize> {
        let Some(store) = &self.states else {
            return Ok(0);
        };
        let states = tokio::time::timeout(self.config.io_timeout, store.load_states())
            .await
            .map_err(|_| anyhow!("dedup state load timed out after {:?}", self.config.io_timeout))??;
        let loaded = self.tracker.hydrate(states);
        info!("📥 Hydrated {} dedup states", loaded);
        Ok(loaded)
    }

    /// One detection run over every active fixture.
    pub async fn run_once(&self) -> Result<RunReport> {
        let now = self.clock.now();
        let mut report = RunReport::default();

        let (
            RetryReport {
                retried, succeeded, ..
            },
            recovered,
        ) = self
            .failures
            .retry_all(self.gateway.as_ref(), self.config.io_timeout, now)
            .await;
        report.retried = retried;
        report.retry_succeeded = succeeded;
        // Alarms whose first write failed are announced once they are stored.
        for entry in recovered {
            let Some(decision) = entry.decision else {
                continue;
            };
            metrics::increment_counter!("smartmoney_alarms_fired_total");
            if self.notify(&entry.record, &decision).await {
                report.notified += 1;
            }
        }

        let thresholds = self.thresholds.reload();
        if thresholds.detectors.is_empty() {
            warn!("⚠️ No detectors active, skipping detection");
            return Ok(report);
        }

        let (targets, failed_markets) = active_fixtures(
            self.repo.as_ref(),
            &self.config.markets,
            now - self.config.lookback,
            self.config.io_timeout,
        )
        .await;
        report.fixtures = targets.len();
        report.fetch_failures = failed_markets;

        let per_fixture: Vec<FixtureReport> = stream::iter(targets)
            .map(|target| self.process_fixture(target, thresholds.clone()))
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;
        for fixture_report in per_fixture {
            report.absorb(fixture_report);
        }

        report.states_saved = self.persist_states().await;

        info!(
            fixtures = report.fixtures,
            candidates = report.candidates,
            fired = report.fired,
            retriggered = report.retriggered,
            suppressed = report.suppressed,
            inserted = report.inserted,
            refreshed = report.refreshed,
            write_failures = report.write_failures,
            fetch_failures = report.fetch_failures,
            "✅ Detection run complete"
        );
        Ok(report)
    }

    async fn process_fixture(
        &self,
        target: ActiveFixture,
        thresholds: Arc<ThresholdSet>,
    ) -> FixtureReport {
        let mut report = FixtureReport::default();

        let history = match self.cache.get(target.market, &target.fixture).await {
            Ok(history) => history,
            Err(_) => {
                report.fetch_failed = true;
                return report;
            }
        };

        let candidates = detect_all(&thresholds.detectors, target.market, &history);
        report.candidates = candidates.len();

        for candidate in candidates {
            let key = AlarmKey::for_candidate(&target.match_fp, &candidate);
            let policy = thresholds.retrigger_policy(candidate.family());
            let decision = self.tracker.decide_and_record(&key, &candidate, policy);
            match decision {
                Decision::Suppress => {
                    report.suppressed += 1;
                    continue;
                }
                Decision::Fire => report.fired += 1,
                Decision::Retrigger { .. } => report.retriggered += 1,
            }

            let record = AlarmRecord::from_candidate(&target.fixture, &target.match_fp, &candidate);
            let outcome = upsert_or_queue(
                self.gateway.as_ref(),
                &self.failures,
                &record,
                Some(decision),
                self.config.io_timeout,
                self.clock.now(),
            )
            .await;

            match outcome {
                Some(UpsertOutcome::Inserted) => report.inserted += 1,
                Some(UpsertOutcome::Refreshed) => report.refreshed += 1,
                Some(UpsertOutcome::Unchanged) => {
                    // Already delivered by an earlier process; don't announce it twice.
                    report.already_stored += 1;
                    debug!(fingerprint = %record.fingerprint(), "Alarm already stored");
                    continue;
                }
                None => {
                    // Queued; announced by the retry that stores it.
                    report.write_failures += 1;
                    continue;
                }
            }

            metrics::increment_counter!("smartmoney_alarms_fired_total");
            if self.notify(&record, &decision).await {
                report.notified += 1;
            }
        }

        report
    }

    async fn notify(&self, record: &AlarmRecord, decision: &Decision) -> bool {
        let message = AlarmMessage::new(record, decision);
        match tokio::time::timeout(self.config.io_timeout, self.notifier.send(&message)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(fingerprint = %message.fingerprint, error = %format!("{e:#}"), "⚠️ Notification failed");
                false
            }
            Err(_) => {
                warn!(fingerprint = %message.fingerprint, "⚠️ Notification timed out");
                false
            }
        }
    }

    /// Save states changed this run; on failure they stay dirty for the next one.
    async fn persist_states(&self) -> usize {
        let Some(store) = &self.states else {
            return 0;
        };
        let dirty = self.tracker.take_dirty();
        if dirty.is_empty() {
            return 0;
        }

        match tokio::time::timeout(self.config.io_timeout, store.save_states(&dirty))
            .await
            .map_err(|_| anyhow!("dedup state save timed out after {:?}", self.config.io_timeout))
            .and_then(|r| r)
        {
            Ok(saved) => saved,
            Err(e) => {
                warn!(states = dirty.len(), error = %format!("{e:#}"), "⚠️ Failed to persist dedup states");
                self.tracker.mark_dirty(dirty.into_iter().map(|(key, _)| key));
                0
            }
        }
    }

    /// Drop dedup states last fired more than `retention` ago, in memory and in the store.
    pub async fn sweep(&self, retention: ChronoDuration) -> Result<SweepReport> {
        let cutoff = self.clock.now() - retention;
        let mut report = SweepReport {
            tracker_removed: self.tracker.sweep(cutoff),
            ..Default::default()
        };
        if let Some(store) = &self.states {
            report.store_removed = tokio::time::timeout(self.config.io_timeout, store.purge_states(cutoff))
                .await
                .map_err(|_| anyhow!("dedup state purge timed out after {:?}", self.config.io_timeout))??;
        }
        info!(
            tracker_removed = report.tracker_removed,
            store_removed = report.store_removed,
            "🧹 Retention sweep complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{AlarmFamily, Selection};
    use crate::signals::db_storage::DbAlarmStorage;
    use crate::signals::detector::test_support::*;
    use crate::signals::snapshot_store::DbSnapshotRepository;
    use crate::signals::thresholds::StaticThresholds;
    use crate::signals::repository::AlarmScope;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    const THRESHOLDS: &str = r#"
        [big_money]
        limit = 15000
        retrigger_cooldown_minutes = 10
        retrigger_min_delta = 3000

        [mim]
        min_market_total = 20000
        impact_threshold = 0.10
    "#;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<AlarmMessage>>);

    #[async_trait]
    impl Notifier for Collecting {
        async fn send(&self, message: &AlarmMessage) -> Result<()> {
            self.0.lock().push(message.clone());
            Ok(())
        }
    }

    fn push_step(repo: &DbSnapshotRepository, minute: i64, home: f64) {
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

    struct Harness {
        repo: Arc<DbSnapshotRepository>,
        store: Arc<DbAlarmStorage>,
        clock: Arc<ManualClock>,
        sent: Arc<Collecting>,
        pipeline: DetectionPipeline,
    }

    fn harness() -> Harness {
        let repo = Arc::new(DbSnapshotRepository::new(":memory:").unwrap());
        let store = Arc::new(DbAlarmStorage::new(":memory:").unwrap());
        let clock = Arc::new(ManualClock::new(at(0)));
        let sent = Arc::new(Collecting::default());
        let set = ThresholdSet::from_toml_str(THRESHOLDS).unwrap();
        let pipeline = DetectionPipeline::new(
            repo.clone(),
            store.clone(),
            Arc::new(LiveThresholds::new(StaticThresholds(set))),
            Arc::new(FailureLog::new(100)),
            clock.clone(),
            RunConfig::default(),
        )
        .with_notifier(sent.clone())
        .with_state_store(store.clone())
        .with_cache_config(CacheConfig {
            ttl: Duration::from_secs(1),
            ..Default::default()
        });
        Harness {
            repo,
            store,
            clock,
            sent,
            pipeline,
        }
    }

    #[tokio::test]
    async fn rerun_over_unchanged_data_is_idempotent() {
        let h = harness();
        push_step(&h.repo, 0, 10_000.0);
        push_step(&h.repo, 5, 26_200.0);
        h.clock.set(at(6));

        let first = h.pipeline.run_once().await.unwrap();
        assert_eq!(first.fixtures, 1);
        // big money + MIM on the same step
        assert_eq!(first.fired, 2);
        assert_eq!(first.inserted, 2);
        assert_eq!(h.sent.0.lock().len(), 2);
        assert_eq!(first.states_saved, 2);

        h.clock.set(at(8));
        let second = h.pipeline.run_once().await.unwrap();
        assert_eq!(second.fired, 0);
        assert_eq!(second.suppressed, 2);
        assert_eq!(h.store.len(), 2);
        assert_eq!(h.sent.0.lock().len(), 2);
    }

    #[tokio::test]
    async fn run_is_spawnable() {
        let h = harness();
        push_step(&h.repo, 0, 10_000.0);
        push_step(&h.repo, 5, 26_200.0);
        h.clock.set(at(6));

        let pipeline = Arc::new(h.pipeline);
        let report = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.run_once().await }
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(h.store.len(), 2);
    }

    #[tokio::test]
    async fn refreshable_alarm_retriggers_after_cooldown() {
        let h = harness();
        push_step(&h.repo, 0, 10_000.0);
        push_step(&h.repo, 5, 25_000.0);
        h.clock.set(at(6));
        h.pipeline.run_once().await.unwrap();

        // +9 minutes, 15,300: inside the cooldown
        push_step(&h.repo, 14, 40_300.0);
        h.clock.set(at(15));
        let report = h.pipeline.run_once().await.unwrap();
        assert_eq!(report.retriggered, 0);

        // +10 minutes from the first firing, 21,000 beats 15,000 + 3,000
        push_step(&h.repo, 15, 61_300.0);
        h.clock.set(at(16));
        let report = h.pipeline.run_once().await.unwrap();
        assert_eq!(report.retriggered, 1);
        assert_eq!(report.refreshed, 1);

        let big: Vec<AlarmRecord> = h
            .store
            .get_recent(10)
            .unwrap()
            .into_iter()
            .filter(|r| r.family() == AlarmFamily::BigMoney)
            .collect();
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].triggered_at, at(15));
        assert_eq!(big[0].value, 21_000.0);
        assert_eq!(big[0].history.len(), 1);
        assert!(h.sent.0.lock().iter().any(|m| m.retrigger));
    }

    #[tokio::test]
    async fn restart_does_not_renotify() {
        let h = harness();
        push_step(&h.repo, 0, 10_000.0);
        push_step(&h.repo, 5, 26_200.0);
        h.clock.set(at(6));
        h.pipeline.run_once().await.unwrap();
        assert_eq!(h.sent.0.lock().len(), 2);

        // Fresh process without hydration: the store's conflict keys still hold.
        let sent = Arc::new(Collecting::default());
        let restarted = DetectionPipeline::new(
            h.repo.clone(),
            h.store.clone(),
            Arc::new(LiveThresholds::new(StaticThresholds(
                ThresholdSet::from_toml_str(THRESHOLDS).unwrap(),
            ))),
            Arc::new(FailureLog::new(100)),
            h.clock.clone(),
            RunConfig::default(),
        )
        .with_notifier(sent.clone());
        let report = restarted.run_once().await.unwrap();
        assert_eq!(report.fired, 2);
        assert_eq!(report.already_stored, 2);
        assert!(sent.0.lock().is_empty());

        // Hydrated from the state store, the tracker suppresses outright.
        let hydrated = DetectionPipeline::new(
            h.repo.clone(),
            h.store.clone(),
            Arc::new(LiveThresholds::new(StaticThresholds(
                ThresholdSet::from_toml_str(THRESHOLDS).unwrap(),
            ))),
            Arc::new(FailureLog::new(100)),
            h.clock.clone(),
            RunConfig::default(),
        )
        .with_state_store(h.store.clone());
        assert_eq!(hydrated.hydrate().await.unwrap(), 2);
        let report = hydrated.run_once().await.unwrap();
        assert_eq!(report.fired, 0);
        assert_eq!(report.suppressed, 2);
    }

    #[tokio::test]
    async fn big_money_fires_across_collector_name_drift() {
        let h = harness();
        push_step(&h.repo, 0, 10_000.0);
        let mut drifted = rows(
            MarketType::ThreeWay,
            5,
            &[
                (Selection::Home, 2.0, 26_200.0, 50.0),
                (Selection::Draw, 3.3, 4_000.0, 25.0),
                (Selection::Away, 3.6, 4_000.0, 25.0),
            ],
        );
        for row in &mut drifted {
            row.away = "Fenerbahce SK".into();
        }
        h.repo.insert_rows(&drifted).unwrap();
        h.clock.set(at(6));

        let report = h.pipeline.run_once().await.unwrap();
        assert_eq!(report.fixtures, 1);
        assert_eq!(report.fetch_failures, 0);
        let big: Vec<AlarmRecord> = h
            .store
            .get_recent(10)
            .unwrap()
            .into_iter()
            .filter(|r| r.family() == AlarmFamily::BigMoney)
            .collect();
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].value, 16_200.0);
        assert_eq!(big[0].key.match_fp, fixture().fingerprint());
    }

    /// Delegates to the store unless switched off.
    struct SwitchableGateway {
        inner: Arc<DbAlarmStorage>,
        down: AtomicBool,
    }

    #[async_trait]
    impl AlarmGateway for SwitchableGateway {
        async fn upsert(&self, record: &AlarmRecord) -> Result<UpsertOutcome> {
            if self.down.load(Ordering::SeqCst) {
                return Err(anyhow!("database is locked"));
            }
            self.inner.upsert(record).await
        }

        async fn list_by_scope(&self, scope: &AlarmScope) -> Result<Vec<AlarmRecord>> {
            self.inner.list_by_scope(scope).await
        }
    }

    #[tokio::test]
    async fn failed_write_is_announced_only_once_stored() {
        let h = harness();
        let gateway = Arc::new(SwitchableGateway {
            inner: h.store.clone(),
            down: AtomicBool::new(true),
        });
        let failures = Arc::new(FailureLog::new(100));
        let sent = Arc::new(Collecting::default());
        let pipeline = DetectionPipeline::new(
            h.repo.clone(),
            gateway.clone(),
            Arc::new(LiveThresholds::new(StaticThresholds(
                ThresholdSet::from_toml_str(THRESHOLDS).unwrap(),
            ))),
            failures.clone(),
            h.clock.clone(),
            RunConfig::default(),
        )
        .with_notifier(sent.clone());

        push_step(&h.repo, 0, 10_000.0);
        push_step(&h.repo, 5, 26_200.0);
        h.clock.set(at(6));
        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.fired, 2);
        assert_eq!(report.write_failures, 2);
        assert_eq!(report.notified, 0);
        assert!(sent.0.lock().is_empty());
        assert_eq!(failures.len(), 2);
        assert!(h.store.is_empty());

        gateway.down.store(false, Ordering::SeqCst);
        h.clock.set(at(8));
        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.retry_succeeded, 2);
        assert_eq!(report.suppressed, 2);
        assert_eq!(report.notified, 2);
        assert_eq!(sent.0.lock().len(), 2);
        assert!(failures.is_empty());
        assert_eq!(h.store.len(), 2);

        h.clock.set(at(9));
        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.notified, 0);
        assert_eq!(sent.0.lock().len(), 2);
    }

    #[tokio::test]
    async fn sweep_drops_old_states() {
        let h = harness();
        push_step(&h.repo, 0, 10_000.0);
        push_step(&h.repo, 5, 26_200.0);
        h.clock.set(at(6));
        h.pipeline.run_once().await.unwrap();
        assert_eq!(h.pipeline.tracker().len(), 2);

        h.clock.advance(ChronoDuration::hours(49));
        let report = h.pipeline.sweep(ChronoDuration::hours(48)).await.unwrap();
        assert_eq!(report, SweepReport { tracker_removed: 2, store_removed: 2 });
        assert!(h.pipeline.tracker().is_empty());
        // alarms themselves are never swept
        assert_eq!(h.store.len(), 2);
    }
}
