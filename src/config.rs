//! Process configuration from the environment (`.env` honoured).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;

use crate::models::MarketType;
use crate::signals::cache::CacheConfig;
use crate::signals::pipeline::RunConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite file holding both snapshot tables and alarms
    pub db_path: String,
    pub thresholds_path: PathBuf,
    pub run_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub lookback_hours: i64,
    pub workers: usize,
    pub io_timeout_ms: u64,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub retention_hours: i64,
    pub failure_log_capacity: usize,
    pub webhook_url: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "./smartmoney.db".to_string(),
            thresholds_path: PathBuf::from("config/thresholds.toml"),
            run_interval_secs: 60,
            reconcile_interval_secs: 900,
            sweep_interval_secs: 3600,
            lookback_hours: 6,
            workers: 8,
            io_timeout_ms: 5_000,
            cache_ttl_secs: 60,
            cache_max_entries: 2_000,
            retention_hours: 48,
            failure_log_capacity: 1_000,
            webhook_url: None,
            metrics_port: None,
        }
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or blank keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            db_path: non_blank("SMARTMONEY_DB_PATH").unwrap_or(d.db_path),
            thresholds_path: non_blank("SMARTMONEY_THRESHOLDS_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.thresholds_path),
            run_interval_secs: parsed(&lookup, "SMARTMONEY_RUN_INTERVAL_SECS", d.run_interval_secs)?,
            reconcile_interval_secs: parsed(
                &lookup,
                "SMARTMONEY_RECONCILE_INTERVAL_SECS",
                d.reconcile_interval_secs,
            )?,
            sweep_interval_secs: parsed(&lookup, "SMARTMONEY_SWEEP_INTERVAL_SECS", d.sweep_interval_secs)?,
            lookback_hours: parsed(&lookup, "SMARTMONEY_LOOKBACK_HOURS", d.lookback_hours)?,
            workers: parsed(&lookup, "SMARTMONEY_WORKERS", d.workers)?,
            io_timeout_ms: parsed(&lookup, "SMARTMONEY_IO_TIMEOUT_MS", d.io_timeout_ms)?,
            cache_ttl_secs: parsed(&lookup, "SMARTMONEY_CACHE_TTL_SECS", d.cache_ttl_secs)?,
            cache_max_entries: parsed(&lookup, "SMARTMONEY_CACHE_MAX_ENTRIES", d.cache_max_entries)?,
            retention_hours: parsed(&lookup, "SMARTMONEY_RETENTION_HOURS", d.retention_hours)?,
            failure_log_capacity: parsed(
                &lookup,
                "SMARTMONEY_FAILURE_LOG_CAPACITY",
                d.failure_log_capacity,
            )?,
            webhook_url: non_blank("SMARTMONEY_WEBHOOK_URL"),
            metrics_port: match non_blank("SMARTMONEY_METRICS_PORT") {
                Some(raw) => Some(
                    raw.trim()
                        .parse()
                        .with_context(|| format!("Invalid SMARTMONEY_METRICS_PORT: {raw:?}"))?,
                ),
                None => None,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_interval_secs == 0 || self.reconcile_interval_secs == 0 || self.sweep_interval_secs == 0 {
            bail!("intervals must be positive");
        }
        if self.workers == 0 {
            bail!("SMARTMONEY_WORKERS must be at least 1");
        }
        if self.lookback_hours <= 0 || self.retention_hours <= 0 {
            bail!("lookback and retention must be positive");
        }
        if self.io_timeout_ms == 0 {
            bail!("SMARTMONEY_IO_TIMEOUT_MS must be positive");
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn retention(&self) -> ChronoDuration {
        ChronoDuration::hours(self.retention_hours)
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            lookback: ChronoDuration::hours(self.lookback_hours),
            workers: self.workers,
            io_timeout: self.io_timeout(),
            markets: MarketType::ALL.to_vec(),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.cache_ttl_secs),
            max_entries: self.cache_max_entries,
            fetch_timeout: self.io_timeout(),
            ..Default::default()
        }
    }
}
