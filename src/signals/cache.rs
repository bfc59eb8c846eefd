//! Per-fixture history cache.
//!
//! Entries are keyed by (market, match fingerprint, TTL bucket of "now"), so a new
//! bucket naturally starts a fresh read. Concurrent misses on one key share a single
//! in-flight fetch through a per-key `OnceCell`. Cleanup runs inline, at most once
//! per `cleanup_interval`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::models::{FixtureKey, MarketType, Snapshot};
use crate::signals::repository::SnapshotRepository;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    pub cleanup_interval: Duration,
    /// Upper bound on one history read
    pub fetch_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_entries: 2_000,
            cleanup_interval: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

type CacheKey = (MarketType, String, i64);
type History = Arc<Vec<Snapshot>>;

struct CacheEntry {
    cell: Arc<OnceCell<History>>,
    bucket: i64,
    seq: u64,
}

pub struct HistoryCache {
    repo: Arc<dyn SnapshotRepository>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    last_cleanup: Mutex<Option<DateTime<Utc>>>,
    seq: AtomicU64,
}

impl HistoryCache {
    pub fn new(repo: Arc<dyn SnapshotRepository>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            repo,
            clock,
            config,
            entries: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(None),
            seq: AtomicU64::new(0),
        }
    }

    fn ttl_secs(&self) -> i64 {
        (self.config.ttl.as_secs() as i64).max(1)
    }

    fn bucket(&self, now: DateTime<Utc>) -> i64 {
        let ttl = self.ttl_secs();
        now.timestamp().div_euclid(ttl) * ttl
    }

    /// Full history of `fixture` on `market`, served from cache within the TTL bucket.
    pub async fn get(&self, market: MarketType, fixture: &FixtureKey) -> Result<History> {
        let now = self.clock.now();
        self.maybe_cleanup(now);

        let bucket = self.bucket(now);
        let key: CacheKey = (market, fixture.fingerprint(), bucket);
        let cell = {
            let mut entries = self.entries.lock();
            entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry {
                    cell: Arc::new(OnceCell::new()),
                    bucket,
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                })
                .cell
                .clone()
        };

        if let Some(history) = cell.get() {
            metrics::increment_counter!("smartmoney_cache_hits_total");
            return Ok(history.clone());
        }
        metrics::increment_counter!("smartmoney_cache_misses_total");

        let fetched = cell
            .get_or_try_init(|| async {
                let history = tokio::time::timeout(
                    self.config.fetch_timeout,
                    self.repo.fetch_history(market, fixture, None),
                )
                .await
                .map_err(|_| {
                    anyhow!(
                        "history read timed out after {:?} for {} ({})",
                        self.config.fetch_timeout,
                        fixture,
                        market
                    )
                })??;
                Ok::<_, anyhow::Error>(Arc::new(history))
            })
            .await;

        match fetched {
            Ok(history) => Ok(history.clone()),
            Err(e) => {
                // Failed reads are never cached.
                let mut entries = self.entries.lock();
                if entries
                    .get(&key)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.cell, &cell) && !cell.initialized())
                {
                    entries.remove(&key);
                }
                warn!(fixture = %fixture, market = %market, error = %e, "⚠️ History fetch failed");
                Err(e)
            }
        }
    }

    fn maybe_cleanup(&self, now: DateTime<Utc>) {
        {
            let mut last = self.last_cleanup.lock();
            let due = match *last {
                None => true,
                Some(at) => (now - at).to_std().unwrap_or_default() >= self.config.cleanup_interval,
            };
            if !due {
                return;
            }
            *last = Some(now);
        }
        let (expired, evicted) = self.cleanup(now);
        if expired + evicted > 0 {
            debug!(expired, evicted, "🧹 History cache cleanup");
        }
    }

    /// Drop expired entries, then the oldest-inserted ones above `max_entries`.
    pub fn cleanup(&self, now: DateTime<Utc>) -> (usize, usize) {
        let current = self.bucket(now);
        let mut entries = self.entries.lock();

        let before = entries.len();
        entries.retain(|_, e| e.bucket >= current);
        let expired = before - entries.len();

        let mut evicted = 0;
        if entries.len() > self.config.max_entries {
            let mut by_age: Vec<(u64, CacheKey)> =
                entries.iter().map(|(k, e)| (e.seq, k.clone())).collect();
            by_age.sort_unstable_by_key(|(seq, _)| *seq);
            let excess = entries.len() - self.config.max_entries;
            for (_, key) in by_age.into_iter().take(excess) {
                entries.remove(&key);
                evicted += 1;
            }
        }

        (expired, evicted)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::SnapshotRow;
    use crate::signals::detector::test_support::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicUsize;

    /// Counts page reads; optionally slow or failing.
    #[derive(Default)]
    struct CountingRepo {
        reads: AtomicUsize,
        delay_ms: u64,
        fail: bool,
    }

    #[async_trait]
    impl SnapshotRepository for CountingRepo {
        async fn fetch_history_page(
            &self,
            market: MarketType,
            fixture: &FixtureKey,
            _since: Option<DateTime<Utc>>,
            offset: usize,
            _limit: usize,
        ) -> Result<Vec<SnapshotRow>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Err(anyhow!("connection reset"));
            }
            if offset > 0 {
                return Ok(Vec::new());
            }
            Ok(vec![SnapshotRow {
                market,
                home: fixture.home.clone(),
                away: fixture.away.clone(),
                league: fixture.league.clone(),
                kickoff: None,
                captured_at: "2025-03-01T12:00:00Z".into(),
                selection: "1".into(),
                price: Some("2.0".into()),
                amount: Some("1000".into()),
                share: Some("50".into()),
            }])
        }

        async fn fetch_latest_per_fixture(&self, _market: MarketType) -> Result<Vec<Snapshot>> {
            Ok(Vec::new())
        }
    }

    fn cache(repo: Arc<CountingRepo>, clock: Arc<ManualClock>, config: CacheConfig) -> HistoryCache {
        HistoryCache::new(repo, clock, config)
    }

    #[tokio::test]
    async fn hit_within_bucket_then_refetch_after_ttl() {
        let repo = Arc::new(CountingRepo::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = cache(repo.clone(), clock.clone(), CacheConfig::default());

        let a = cache.get(MarketType::ThreeWay, &fixture()).await.unwrap();
        let b = cache.get(MarketType::ThreeWay, &fixture()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(repo.reads.load(Ordering::SeqCst), 1);

        clock.advance(ChronoDuration::seconds(61));
        cache.get(MarketType::ThreeWay, &fixture()).await.unwrap();
        assert_eq!(repo.reads.load(Ordering::SeqCst), 2);
        // the stale bucket was dropped by the inline cleanup
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let repo = Arc::new(CountingRepo { delay_ms: 50, ..Default::default() });
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = Arc::new(cache(repo.clone(), clock, CacheConfig::default()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(MarketType::ThreeWay, &fixture()).await })
            })
            .collect();
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap().len(), 1);
        }
        assert_eq!(repo.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let repo = Arc::new(CountingRepo { fail: true, ..Default::default() });
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = cache(repo.clone(), clock, CacheConfig::default());

        assert!(cache.get(MarketType::ThreeWay, &fixture()).await.is_err());
        assert!(cache.is_empty());
        assert!(cache.get(MarketType::ThreeWay, &fixture()).await.is_err());
        assert_eq!(repo.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let repo = Arc::new(CountingRepo { delay_ms: 200, ..Default::default() });
        let clock = Arc::new(ManualClock::new(t0()));
        let config = CacheConfig {
            fetch_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let cache = cache(repo, clock, config);
        let err = cache.get(MarketType::ThreeWay, &fixture()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn oldest_entries_evicted_above_max() {
        let repo = Arc::new(CountingRepo::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let config = CacheConfig { max_entries: 2, ..Default::default() };
        let cache = cache(repo, clock.clone(), config);

        for home in ["A", "B", "C"] {
            let f = FixtureKey::new(home, "Z", "League");
            cache.get(MarketType::ThreeWay, &f).await.unwrap();
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.cleanup(clock.now()), (0, 1));
        assert_eq!(cache.len(), 2);
    }
}
