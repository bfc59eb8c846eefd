//! Database-backed alarm storage
//!
//! - WAL mode so detection writes don't block readers
//! - `fingerprint` is the conflict key: every write is an idempotent upsert
//! - Window families keep their first trigger; refreshable families are replaced
//!   only by a strictly newer trigger, the old one pushed into `history_json`
//! - Dedup state lives next to the alarms so cooldowns survive restarts

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{
    parse_timestamp, AlarmFamily, AlarmKey, AlarmRecord, ConflictPolicy, DedupState, FixtureKey,
    MarketType, Selection, TRIGGER_HISTORY_CAP,
};
use crate::signals::repository::{AlarmGateway, AlarmScope, DedupStateStore, UpsertOutcome};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;  -- 64MB cache
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS alarms (
    fingerprint TEXT PRIMARY KEY,
    match_fp TEXT NOT NULL,
    family TEXT NOT NULL,
    market TEXT NOT NULL,
    selection TEXT NOT NULL,
    bucket INTEGER,
    home TEXT NOT NULL,
    away TEXT NOT NULL,
    league TEXT NOT NULL,
    kickoff TEXT,
    triggered_at TEXT NOT NULL,
    triggered_ts INTEGER NOT NULL,
    value REAL NOT NULL,
    details_json TEXT NOT NULL,
    history_json TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_alarms_match
    ON alarms(match_fp, triggered_ts DESC);

CREATE INDEX IF NOT EXISTS idx_alarms_recent
    ON alarms(triggered_ts DESC, fingerprint);

CREATE INDEX IF NOT EXISTS idx_alarms_family
    ON alarms(family, triggered_ts DESC);

CREATE TABLE IF NOT EXISTS dedup_state (
    fingerprint TEXT PRIMARY KEY,
    key_json TEXT NOT NULL,
    last_fired_at TEXT NOT NULL,
    last_fired_ts INTEGER NOT NULL,
    baseline REAL NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_dedup_state_fired
    ON dedup_state(last_fired_ts);
"#;

const ALARM_COLUMNS: &str = "fingerprint, match_fp, family, market, selection, bucket, \
     home, away, league, kickoff, triggered_at, value, details_json, history_json";

/// Alarm and dedup-state storage
pub struct DbAlarmStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DbAlarmStorage {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" && db_path != ":memory:" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM alarms", [], |row| row.get(0))
            .unwrap_or(0);

        info!("📊 Alarm database initialized at: {}", db_path);
        info!("📈 Existing alarms in database: {}", count);

        conn.execute(
            "INSERT OR IGNORE INTO metadata (key, value) VALUES ('total_alarms_ever', ?1)",
            params![count.to_string()],
        )
        .ok();

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn insert_new(conn: &Connection, record: &AlarmRecord) -> Result<usize> {
        let details_json = serde_json::to_string(&record.details)?;
        let history_json = serde_json::to_string(&record.history)?;
        let key = &record.key;

        let changes = conn.execute(
            "INSERT INTO alarms
             (fingerprint, match_fp, family, market, selection, bucket, home, away, league,
              kickoff, triggered_at, triggered_ts, value, details_json, history_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(fingerprint) DO NOTHING",
            params![
                record.fingerprint(),
                &key.match_fp,
                key.family.as_str(),
                key.market.as_str(),
                key.selection.as_str(),
                key.bucket,
                &record.fixture.home,
                &record.fixture.away,
                &record.fixture.league,
                &record.fixture.kickoff,
                record.triggered_at.to_rfc3339(),
                record.triggered_at.timestamp(),
                record.value,
                details_json,
                history_json,
            ],
        )?;

        if changes > 0 {
            conn.execute(
                "UPDATE metadata SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)
                 WHERE key = 'total_alarms_ever'",
                [],
            )
            .ok();
        }
        Ok(changes)
    }

    fn get_locked(conn: &Connection, fingerprint: &str) -> Result<Option<AlarmRecord>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ALARM_COLUMNS} FROM alarms WHERE fingerprint = ?1"
        ))?;
        let record = stmt
            .query_row([fingerprint], Self::row_to_alarm)
            .optional()?;
        Ok(record)
    }

    /// Fetch one alarm by fingerprint
    pub fn get(&self, fingerprint: &str) -> Result<Option<AlarmRecord>> {
        let conn = self.conn.lock();
        Self::get_locked(&conn, fingerprint)
    }

    /// Most recently triggered alarms
    pub fn get_recent(&self, limit: usize) -> Result<Vec<AlarmRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ALARM_COLUMNS} FROM alarms ORDER BY triggered_ts DESC, fingerprint LIMIT ?1"
        ))?;
        let alarms = stmt
            .query_map([limit as i64], Self::row_to_alarm)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(alarms)
    }

    /// Convert a database row to AlarmRecord
    fn row_to_alarm(row: &rusqlite::Row) -> rusqlite::Result<AlarmRecord> {
        fn bad<E: std::error::Error + Send + Sync + 'static>(e: E) -> rusqlite::Error {
            rusqlite::Error::ToSqlConversionFailure(Box::new(e))
        }
        fn bad_text(msg: String) -> rusqlite::Error {
            rusqlite::Error::ToSqlConversionFailure(msg.into())
        }

        let family: String = row.get(2)?;
        let market: String = row.get(3)?;
        let selection: String = row.get(4)?;
        let triggered_at: String = row.get(10)?;
        let details_json: String = row.get(12)?;
        let history_json: String = row.get(13)?;

        let key = AlarmKey {
            match_fp: row.get(1)?,
            family: family.parse::<AlarmFamily>().map_err(|e| bad_text(format!("{e}")))?,
            market: market.parse::<MarketType>().map_err(|e| bad_text(format!("{e}")))?,
            selection: selection.parse::<Selection>().map_err(|e| bad_text(format!("{e}")))?,
            bucket: row.get(5)?,
        };

        Ok(AlarmRecord {
            key,
            fixture: FixtureKey {
                home: row.get(6)?,
                away: row.get(7)?,
                league: row.get(8)?,
                kickoff: row.get(9)?,
            },
            triggered_at: parse_timestamp(&triggered_at)
                .ok_or_else(|| bad_text(format!("bad triggered_at {triggered_at}")))?,
            value: row.get(11)?,
            details: serde_json::from_str(&details_json).map_err(bad)?,
            history: serde_json::from_str(&history_json).map_err(bad)?,
        })
    }

    /// Get current alarm count in database
    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM alarms", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get database statistics
    pub fn get_stats(&self) -> Result<AlarmStats> {
        let conn = self.conn.lock();

        let total_alarms: i64 =
            conn.query_row("SELECT COUNT(*) FROM alarms", [], |row| row.get(0))?;

        let total_ever: i64 = conn
            .query_row(
                "SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'total_alarms_ever'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(total_alarms);

        let families: Vec<(String, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT family, COUNT(*) as count
                 FROM alarms
                 GROUP BY family
                 ORDER BY count DESC, family",
            )?;
            let results: Vec<_> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            results
        };

        let dedup_states: i64 = conn
            .query_row("SELECT COUNT(*) FROM dedup_state", [], |row| row.get(0))
            .unwrap_or(0);

        Ok(AlarmStats {
            total_alarms: total_alarms as usize,
            total_alarms_ever: total_ever as usize,
            alarms_by_family: families.into_iter().map(|(f, c)| (f, c as usize)).collect(),
            dedup_states: dedup_states as usize,
        })
    }

    /// Optimize database (run periodically)
    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA optimize;")?;
        debug!("Database optimized");
        Ok(())
    }
}

#[async_trait]
impl AlarmGateway for DbAlarmStorage {
    async fn upsert(&self, record: &AlarmRecord) -> Result<UpsertOutcome> {
        let fingerprint = record.fingerprint();
        let mut conn = self.conn.lock();

        match record.family().conflict_policy() {
            ConflictPolicy::Preserve => {
                let changes = Self::insert_new(&conn, record)?;
                Ok(if changes > 0 {
                    UpsertOutcome::Inserted
                } else {
                    UpsertOutcome::Unchanged
                })
            }
            ConflictPolicy::Refresh => {
                let tx = conn.transaction()?;
                let outcome = match Self::get_locked(&tx, &fingerprint)? {
                    None => {
                        Self::insert_new(&tx, record)?;
                        UpsertOutcome::Inserted
                    }
                    Some(mut stored) => {
                        if stored.refresh_with(record, TRIGGER_HISTORY_CAP) {
                            tx.execute(
                                "UPDATE alarms SET triggered_at = ?2, triggered_ts = ?3, value = ?4,
                                        details_json = ?5, history_json = ?6,
                                        updated_at = strftime('%s', 'now')
                                 WHERE fingerprint = ?1",
                                params![
                                    &fingerprint,
                                    stored.triggered_at.to_rfc3339(),
                                    stored.triggered_at.timestamp(),
                                    stored.value,
                                    serde_json::to_string(&stored.details)?,
                                    serde_json::to_string(&stored.history)?,
                                ],
                            )?;
                            UpsertOutcome::Refreshed
                        } else {
                            UpsertOutcome::Unchanged
                        }
                    }
                };
                tx.commit()?;
                Ok(outcome)
            }
        }
    }

    async fn list_by_scope(&self, scope: &AlarmScope) -> Result<Vec<AlarmRecord>> {
        let conn = self.conn.lock();
        let since = scope.since.map(|t| t.timestamp()).unwrap_or(0);

        let alarms = if scope.match_fps.is_empty() {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ALARM_COLUMNS} FROM alarms WHERE triggered_ts >= ?1
                 ORDER BY triggered_ts, fingerprint"
            ))?;
            let alarms: Vec<AlarmRecord> = stmt
                .query_map([since], Self::row_to_alarm)?
                .filter_map(|r| r.ok())
                .collect();
            alarms
        } else {
            let placeholders = std::iter::repeat("?")
                .take(scope.match_fps.len())
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "SELECT {ALARM_COLUMNS} FROM alarms
                 WHERE match_fp IN ({placeholders}) AND triggered_ts >= {since}
                 ORDER BY triggered_ts, fingerprint"
            );
            let mut stmt = conn.prepare(&sql)?;
            let alarms: Vec<AlarmRecord> = stmt
                .query_map(params_from_iter(scope.match_fps.iter()), Self::row_to_alarm)?
                .filter_map(|r| r.ok())
                .collect();
            alarms
        };

        Ok(alarms)
    }
}

#[async_trait]
impl DedupStateStore for DbAlarmStorage {
    async fn load_states(&self) -> Result<Vec<(AlarmKey, DedupState)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT key_json, last_fired_at, baseline FROM dedup_state")?;
        let mut rows = stmt.query([])?;

        let mut states = Vec::new();
        while let Some(row) = rows.next()? {
            let key_json: String = row.get(0)?;
            let last_fired_at: String = row.get(1)?;
            let baseline: f64 = row.get(2)?;

            let (Ok(key), Some(last_fired_at)) = (
                serde_json::from_str::<AlarmKey>(&key_json),
                parse_timestamp(&last_fired_at),
            ) else {
                warn!("Skipping unreadable dedup state row");
                continue;
            };
            states.push((key, DedupState { last_fired_at, baseline }));
        }
        Ok(states)
    }

    async fn save_states(&self, states: &[(AlarmKey, DedupState)]) -> Result<usize> {
        if states.is_empty() {
            return Ok(0);
        }
        let serialized: Vec<_> = states
            .iter()
            .map(|(key, state)| -> Result<_> {
                Ok((key.fingerprint(), serde_json::to_string(key)?, state))
            })
            .collect::<Result<_>>()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO dedup_state (fingerprint, key_json, last_fired_at, last_fired_ts, baseline)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    last_fired_at = excluded.last_fired_at,
                    last_fired_ts = excluded.last_fired_ts,
                    baseline = excluded.baseline",
            )?;
            for (fingerprint, key_json, state) in &serialized {
                written += stmt.execute(params![
                    fingerprint,
                    key_json,
                    state.last_fired_at.to_rfc3339(),
                    state.last_fired_at.timestamp(),
                    state.baseline,
                ])?;
            }
        }
        tx.commit()?;
        debug!("📦 Saved {} dedup states", written);
        Ok(written)
    }

    async fn purge_states(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM dedup_state WHERE last_fired_ts < ?1",
            params![cutoff.timestamp()],
        )?;
        Ok(deleted)
    }
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct AlarmStats {
    pub total_alarms: usize,
    pub total_alarms_ever: usize,
    pub alarms_by_family: Vec<(String, usize)>,
    pub dedup_states: usize,
}
