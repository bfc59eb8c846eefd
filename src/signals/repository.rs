//! Storage seams: where snapshots come from and where alarms go.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::models::{
    AlarmKey, AlarmRecord, DedupState, FixtureKey, MarketType, Snapshot, SnapshotRow,
};

/// Rows per page when reading a fixture's history
pub const HISTORY_PAGE_SIZE: usize = 500;

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// One page of raw rows for a fixture, ordered by capture time then selection.
    async fn fetch_history_page(
        &self,
        market: MarketType,
        fixture: &FixtureKey,
        since: Option<DateTime<Utc>>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SnapshotRow>>;

    /// Latest snapshot of every fixture quoted on `market`.
    async fn fetch_latest_per_fixture(&self, market: MarketType) -> Result<Vec<Snapshot>>;

    /// Full (or `since`-bounded) history, read page by page until a short page.
    async fn fetch_history(
        &self,
        market: MarketType,
        fixture: &FixtureKey,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>> {
        let mut rows = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .fetch_history_page(market, fixture, since, offset, HISTORY_PAGE_SIZE)
                .await?;
            let n = page.len();
            rows.extend(page);
            if n < HISTORY_PAGE_SIZE {
                break;
            }
            offset += n;
        }
        Ok(assemble_snapshots(market, rows))
    }
}

/// Group per-selection rows into snapshots (one per match fingerprint + capture
/// time), oldest first. Rows with an unreadable timestamp or selection are dropped.
pub fn assemble_snapshots(market: MarketType, rows: Vec<SnapshotRow>) -> Vec<Snapshot> {
    let mut snapshots: Vec<Snapshot> = Vec::new();
    let mut index: HashMap<(String, DateTime<Utc>), usize> = HashMap::new();
    let mut skipped = 0usize;

    for row in rows {
        let (Some(captured_at), Some(quote)) = (row.captured_at(), row.quote()) else {
            skipped += 1;
            continue;
        };
        let fixture = row.fixture();
        let slot = (fixture.fingerprint(), captured_at);
        match index.get(&slot) {
            Some(&i) => {
                let snapshot = &mut snapshots[i];
                if snapshot.quote(quote.selection).is_none() {
                    snapshot.quotes.push(quote);
                }
            }
            None => {
                index.insert(slot, snapshots.len());
                snapshots.push(Snapshot {
                    fixture,
                    market,
                    captured_at,
                    quotes: vec![quote],
                });
            }
        }
    }

    if skipped > 0 {
        debug!(market = %market, skipped, "Dropped unreadable snapshot rows");
    }
    snapshots.sort_by_key(|s| s.captured_at);
    snapshots
}

/// One fixture to scan on one market
#[derive(Debug, Clone)]
pub struct ActiveFixture {
    pub market: MarketType,
    pub fixture: FixtureKey,
    pub match_fp: String,
}

/// Fixtures whose latest snapshot is at or after `since`, across `markets`.
///
/// A market whose listing fails or times out is skipped and counted in the second
/// return value. Fixtures without a usable identity are skipped with a warning.
pub async fn active_fixtures(
    repo: &dyn SnapshotRepository,
    markets: &[MarketType],
    since: DateTime<Utc>,
    io_timeout: Duration,
) -> (Vec<ActiveFixture>, usize) {
    let mut active = Vec::new();
    let mut failed_markets = 0usize;

    for &market in markets {
        let latest = match tokio::time::timeout(io_timeout, repo.fetch_latest_per_fixture(market))
            .await
            .map_err(|_| anyhow!("listing timed out after {:?}", io_timeout))
            .and_then(|r| r)
        {
            Ok(latest) => latest,
            Err(e) => {
                failed_markets += 1;
                warn!(market = %market, error = %format!("{e:#}"), "⚠️ Failed to list fixtures");
                continue;
            }
        };

        for snapshot in latest {
            if snapshot.captured_at < since {
                continue;
            }
            let match_fp = snapshot.fixture.fingerprint();
            if match_fp.is_empty() {
                warn!(fixture = %snapshot.fixture, market = %market, "⚠️ Unidentifiable fixture skipped");
                continue;
            }
            active.push(ActiveFixture {
                market,
                fixture: snapshot.fixture,
                match_fp,
            });
        }
    }

    (active, failed_markets)
}

/// Result of writing one alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Refreshable record replaced by a strictly newer trigger
    Refreshed,
    /// Existing record kept as is
    Unchanged,
}

/// Which stored alarms a listing covers
#[derive(Debug, Clone, Default)]
pub struct AlarmScope {
    /// Match fingerprints; empty means every fixture
    pub match_fps: Vec<String>,
    /// Only records triggered at or after this instant
    pub since: Option<DateTime<Utc>>,
}

impl AlarmScope {
    pub fn fixtures(match_fps: impl IntoIterator<Item = String>) -> Self {
        Self {
            match_fps: match_fps.into_iter().collect(),
            since: None,
        }
    }
}

/// Alarm persistence. Writes are idempotent upserts keyed by fingerprint; there is
/// no delete.
#[async_trait]
pub trait AlarmGateway: Send + Sync {
    async fn upsert(&self, record: &AlarmRecord) -> Result<UpsertOutcome>;

    async fn list_by_scope(&self, scope: &AlarmScope) -> Result<Vec<AlarmRecord>>;
}

/// Persisted dedup state, so cooldowns survive restarts
#[async_trait]
pub trait DedupStateStore: Send + Sync {
    async fn load_states(&self) -> Result<Vec<(AlarmKey, DedupState)>>;

    async fn save_states(&self, states: &[(AlarmKey, DedupState)]) -> Result<usize>;

    /// Delete states last fired before `cutoff`; returns how many.
    async fn purge_states(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Selection;

    fn row(at: &str, selection: &str, price: &str) -> SnapshotRow {
        SnapshotRow {
            market: MarketType::BothTeamsScore,
            home: "Ajax".into(),
            away: "PSV".into(),
            league: "Eredivisie".into(),
            kickoff: None,
            captured_at: at.into(),
            selection: selection.into(),
            price: Some(price.into()),
            amount: Some("£1,200".into()),
            share: Some("55%".into()),
        }
    }

    #[test]
    fn rows_group_into_ordered_snapshots() {
        let rows = vec![
            row("2025-03-01 12:10:00", "yes", "1.80"),
            row("2025-03-01 12:00:00", "yes", "1.85"),
            row("2025-03-01 12:00:00", "no", "2.00"),
            row("2025-03-01 12:10:00", "no", "2.05"),
            row("not a time", "no", "2.05"),
            row("2025-03-01 12:10:00", "maybe", "9.0"),
        ];
        let snaps = assemble_snapshots(MarketType::BothTeamsScore, rows);
        assert_eq!(snaps.len(), 2);
        assert!(snaps[0].captured_at < snaps[1].captured_at);
        assert_eq!(snaps[0].price(Selection::Yes), Some(1.85));
        assert_eq!(snaps[1].price(Selection::No), Some(2.05));
        assert_eq!(snaps[1].amount(Selection::No), Some(1200.0));
        assert_eq!(snaps[1].quotes.len(), 2);
    }

    struct Paged(Vec<SnapshotRow>);

    #[async_trait]
    impl SnapshotRepository for Paged {
        async fn fetch_history_page(
            &self,
            _market: MarketType,
            _fixture: &FixtureKey,
            _since: Option<DateTime<Utc>>,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<SnapshotRow>> {
            Ok(self.0.iter().skip(offset).take(limit).cloned().collect())
        }

        async fn fetch_latest_per_fixture(&self, _market: MarketType) -> Result<Vec<Snapshot>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn history_reads_past_the_first_page() {
        let rows: Vec<SnapshotRow> = (0..HISTORY_PAGE_SIZE + 20)
            .map(|i| row(&(1_740_830_400 + i as i64 * 60).to_string(), "yes", "1.9"))
            .collect();
        let repo = Paged(rows);
        let fixture = FixtureKey::new("Ajax", "PSV", "Eredivisie");
        let history = repo
            .fetch_history(MarketType::BothTeamsScore, &fixture, None)
            .await
            .unwrap();
        assert_eq!(history.len(), HISTORY_PAGE_SIZE + 20);
    }
}
