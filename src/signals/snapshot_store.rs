//! SQLite-backed snapshot history.
//!
//! One table per market type, one row per selection per capture. Scraped values are
//! stored as the collector wrote them and parsed on read, so a malformed field costs
//! one value, never the row. Rows carry the match fingerprint computed at ingest;
//! history is read by fingerprint, so spelling drift in names doesn't split a fixture.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{debug, info};

use crate::identity::fingerprint;
use crate::models::{FixtureKey, MarketType, Snapshot, SnapshotRow};
use crate::signals::repository::{assemble_snapshots, SnapshotRepository};

const PRAGMAS_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;
"#;

fn table_sql(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    match_fp TEXT NOT NULL,
    home TEXT NOT NULL,
    away TEXT NOT NULL,
    league TEXT NOT NULL,
    kickoff TEXT,
    captured_at TEXT NOT NULL,
    captured_ts INTEGER,
    selection TEXT NOT NULL,
    price TEXT,
    amount TEXT,
    share TEXT
);

CREATE INDEX IF NOT EXISTS idx_{table}_match_ts
    ON {table}(match_fp, captured_ts);
"#
    )
}

pub struct DbSnapshotRepository {
    conn: Arc<Mutex<Connection>>,
}

impl DbSnapshotRepository {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open snapshot database at {}", db_path))?;

        conn.execute_batch(PRAGMAS_SQL)
            .context("Failed to apply snapshot database pragmas")?;
        for market in MarketType::ALL {
            conn.execute_batch(&table_sql(market.history_table()))
                .with_context(|| format!("Failed to create {}", market.history_table()))?;
        }

        info!("📊 Snapshot store initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append raw collector rows in one transaction; returns rows written.
    pub fn insert_rows(&self, rows: &[SnapshotRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0usize;

        for row in rows {
            let sql = format!(
                "INSERT INTO {} (match_fp, home, away, league, kickoff, captured_at, captured_ts, selection, price, amount, share)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                row.market.history_table()
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            inserted += stmt.execute(params![
                fingerprint(&row.home, &row.away, &row.league),
                &row.home,
                &row.away,
                &row.league,
                &row.kickoff,
                &row.captured_at,
                row.captured_at().map(|t| t.timestamp()),
                &row.selection,
                &row.price,
                &row.amount,
                &row.share,
            ])?;
        }

        tx.commit()?;
        debug!("📦 Inserted {} snapshot rows", inserted);
        Ok(inserted)
    }

    /// Row count for one market table
    pub fn len(&self, market: MarketType) -> usize {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", market.history_table()),
            [],
            |row| row.get::<_, i64>(0),
        )
        .unwrap_or(0) as usize
    }

    fn row_to_snapshot_row(market: MarketType, row: &rusqlite::Row) -> rusqlite::Result<SnapshotRow> {
        Ok(SnapshotRow {
            market,
            home: row.get(0)?,
            away: row.get(1)?,
            league: row.get(2)?,
            kickoff: row.get(3)?,
            captured_at: row.get(4)?,
            selection: row.get(5)?,
            price: row.get(6)?,
            amount: row.get(7)?,
            share: row.get(8)?,
        })
    }
}

#[async_trait]
impl SnapshotRepository for DbSnapshotRepository {
    async fn fetch_history_page(
        &self,
        market: MarketType,
        fixture: &FixtureKey,
        since: Option<DateTime<Utc>>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT home, away, league, kickoff, captured_at, selection, price, amount, share
             FROM {}
             WHERE match_fp = ?1
               AND captured_ts IS NOT NULL
               AND (?2 IS NULL OR captured_ts >= ?2)
             ORDER BY captured_ts, id
             LIMIT ?3 OFFSET ?4",
            market.history_table()
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    fixture.fingerprint(),
                    since.map(|t| t.timestamp()),
                    limit as i64,
                    offset as i64,
                ],
                |row| Self::row_to_snapshot_row(market, row),
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn fetch_latest_per_fixture(&self, market: MarketType) -> Result<Vec<Snapshot>> {
        let rows = {
            let conn = self.conn.lock();
            let table = market.history_table();
            let sql = format!(
                "SELECT t.home, t.away, t.league, t.kickoff, t.captured_at, t.selection,
                        t.price, t.amount, t.share
                 FROM {table} t
                 JOIN (SELECT match_fp, MAX(captured_ts) AS ts
                       FROM {table} WHERE captured_ts IS NOT NULL
                       GROUP BY match_fp) latest
                   ON t.match_fp = latest.match_fp AND t.captured_ts = latest.ts
                 ORDER BY t.captured_ts, t.id"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows: Vec<SnapshotRow> = stmt
                .query_map([], |row| Self::row_to_snapshot_row(market, row))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };
        Ok(assemble_snapshots(market, rows))
    }
}
