//! Failed alarm writes, kept for retry at the start of the next run.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::models::AlarmRecord;
use crate::signals::dedup::Decision;
use crate::signals::repository::{AlarmGateway, UpsertOutcome};

/// One alarm that could not be written
#[derive(Debug, Clone, Serialize)]
pub struct FailedWrite {
    pub fingerprint: String,
    pub record: AlarmRecord,
    /// Tracker decision behind the write; announced once the write lands.
    /// `None` for reconciliation inserts, which are never announced.
    #[serde(skip)]
    pub decision: Option<Decision>,
    pub error: String,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub retried: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Bounded, one entry per fingerprint; the oldest entry goes when full.
pub struct FailureLog {
    capacity: usize,
    entries: Mutex<VecDeque<FailedWrite>>,
}

impl FailureLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_failure(
        &self,
        record: &AlarmRecord,
        decision: Option<Decision>,
        error: &str,
        now: DateTime<Utc>,
    ) {
        let fingerprint = record.fingerprint();
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.iter_mut().find(|e| e.fingerprint == fingerprint) {
            existing.record = record.clone();
            existing.decision = decision.or(existing.decision);
            existing.error = error.to_string();
            existing.attempts += 1;
            existing.last_failed_at = now;
            return;
        }

        entries.push_back(FailedWrite {
            fingerprint,
            record: record.clone(),
            decision,
            error: error.to_string(),
            attempts: 1,
            first_failed_at: now,
            last_failed_at: now,
        });
        while entries.len() > self.capacity {
            if let Some(dropped) = entries.pop_front() {
                warn!(
                    fingerprint = %dropped.fingerprint,
                    attempts = dropped.attempts,
                    "⚠️ Failure log full, dropping oldest failed write"
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<FailedWrite> {
        self.entries.lock().iter().cloned().collect()
    }

    fn take_all(&self) -> Vec<FailedWrite> {
        self.entries.lock().drain(..).collect()
    }

    /// Retry every queued write once. Successes leave the log; failures go back in
    /// with their attempt count bumped. Returns the entries whose write changed the
    /// store, for the caller to announce.
    pub async fn retry_all(
        &self,
        gateway: &dyn AlarmGateway,
        io_timeout: Duration,
        now: DateTime<Utc>,
    ) -> (RetryReport, Vec<FailedWrite>) {
        let pending = self.take_all();
        let mut report = RetryReport {
            retried: pending.len(),
            ..Default::default()
        };
        let mut recovered = Vec::new();

        for entry in pending {
            match upsert_with_timeout(gateway, &entry.record, io_timeout).await {
                Ok(outcome) => {
                    report.succeeded += 1;
                    if outcome != UpsertOutcome::Unchanged {
                        recovered.push(entry);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    let mut entries = self.entries.lock();
                    // A fresh failure for the same alarm may have landed meanwhile.
                    if let Some(newer) = entries.iter_mut().find(|e| e.fingerprint == entry.fingerprint) {
                        newer.attempts += entry.attempts;
                        newer.first_failed_at = entry.first_failed_at;
                        newer.decision = newer.decision.or(entry.decision);
                    } else {
                        entries.push_front(FailedWrite {
                            error: format!("{e:#}"),
                            attempts: entry.attempts + 1,
                            last_failed_at: now,
                            ..entry
                        });
                    }
                    while entries.len() > self.capacity {
                        entries.pop_front();
                    }
                }
            }
        }

        if report.retried > 0 {
            info!(
                retried = report.retried,
                succeeded = report.succeeded,
                failed = report.failed,
                "🔁 Retried failed alarm writes"
            );
        }
        (report, recovered)
    }
}

/// One gateway write under a fixed timeout; a timeout is an error.
pub async fn upsert_with_timeout(
    gateway: &dyn AlarmGateway,
    record: &AlarmRecord,
    io_timeout: Duration,
) -> anyhow::Result<UpsertOutcome> {
    tokio::time::timeout(io_timeout, gateway.upsert(record))
        .await
        .map_err(|_| anyhow!("alarm write timed out after {:?}", io_timeout))?
}

/// Write through the gateway; on failure queue the record and return `None`.
pub async fn upsert_or_queue(
    gateway: &dyn AlarmGateway,
    failures: &FailureLog,
    record: &AlarmRecord,
    decision: Option<Decision>,
    io_timeout: Duration,
    now: DateTime<Utc>,
) -> Option<UpsertOutcome> {
    match upsert_with_timeout(gateway, record, io_timeout).await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            metrics::increment_counter!("smartmoney_alarm_write_failures_total");
            warn!(
                fingerprint = %record.fingerprint(),
                error = %format!("{e:#}"),
                "⚠️ Alarm write failed, queued for retry"
            );
            failures.record_failure(record, decision, &format!("{e:#}"), now);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlarmDetails, Candidate, MarketType, Selection};
    use crate::signals::detector::test_support::*;
    use crate::signals::repository::AlarmScope;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn record(minute: i64, selection: Selection) -> AlarmRecord {
        let candidate = Candidate {
            market: MarketType::ThreeWay,
            selection,
            triggered_at: at(minute),
            window_start: at(minute),
            value: 0.2,
            details: AlarmDetails::Mim { inflow: 4_000.0, market_total: 20_000.0, impact: 0.2 },
        };
        AlarmRecord::from_candidate(&fixture(), &fixture().fingerprint(), &candidate)
    }

    /// Fails while `down` is set; counts successful writes.
    #[derive(Default)]
    struct FlakyGateway {
        down: AtomicBool,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl AlarmGateway for FlakyGateway {
        async fn upsert(&self, _record: &AlarmRecord) -> anyhow::Result<UpsertOutcome> {
            if self.down.load(Ordering::SeqCst) {
                return Err(anyhow!("database is locked"));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(UpsertOutcome::Inserted)
        }

        async fn list_by_scope(&self, _scope: &AlarmScope) -> anyhow::Result<Vec<AlarmRecord>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn one_entry_per_fingerprint_and_bounded() {
        let log = FailureLog::new(2);
        log.record_failure(&record(0, Selection::Home), Some(Decision::Fire), "boom", at(0));
        log.record_failure(&record(0, Selection::Home), None, "boom again", at(1));
        assert_eq!(log.len(), 1);
        let entry = &log.entries()[0];
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.first_failed_at, at(0));
        assert_eq!(entry.last_failed_at, at(1));
        assert_eq!(entry.error, "boom again");
        assert_eq!(entry.decision, Some(Decision::Fire));

        log.record_failure(&record(0, Selection::Draw), None, "x", at(2));
        log.record_failure(&record(0, Selection::Away), None, "x", at(3));
        assert_eq!(log.len(), 2);
        let kept: Vec<Selection> = log.entries().iter().map(|e| e.record.key.selection).collect();
        assert_eq!(kept, vec![Selection::Draw, Selection::Away]);
    }

    #[tokio::test]
    async fn queued_writes_drain_once_the_gateway_recovers() {
        let gateway = FlakyGateway::default();
        gateway.down.store(true, Ordering::SeqCst);
        let log = FailureLog::new(100);
        let timeout = Duration::from_secs(1);

        let out = upsert_or_queue(
            &gateway,
            &log,
            &record(0, Selection::Home),
            Some(Decision::Fire),
            timeout,
            at(0),
        )
        .await;
        assert!(out.is_none());
        assert_eq!(log.len(), 1);

        let (report, recovered) = log.retry_all(&gateway, timeout, at(1)).await;
        assert_eq!(report, RetryReport { retried: 1, succeeded: 0, failed: 1 });
        assert!(recovered.is_empty());
        assert_eq!(log.entries()[0].attempts, 2);

        gateway.down.store(false, Ordering::SeqCst);
        let (report, recovered) = log.retry_all(&gateway, timeout, at(2)).await;
        assert_eq!(report, RetryReport { retried: 1, succeeded: 1, failed: 0 });
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].decision, Some(Decision::Fire));
        assert!(log.is_empty());
        assert_eq!(gateway.writes.load(Ordering::SeqCst), 1);
    }
}
