//! Threshold configuration.
//!
//! One TOML table per alarm family, e.g.
//!
//! ```toml
//! [big_money]
//! enabled = true
//! limit = 15000
//! retrigger_cooldown_minutes = 10
//! retrigger_min_delta = 3000
//! ```
//!
//! Each table is parsed into the family's typed config at load time. A missing
//! required key or an invalid value disables that family for the run (recorded in
//! [`ThresholdSet::errors`]); the other families are unaffected.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use arc_swap::ArcSwap;
use chrono::Duration as ChronoDuration;
use tracing::{error, info, warn};

use crate::models::AlarmFamily;
use crate::signals::dedup::RetriggerPolicy;
use crate::signals::detector::{AlarmDetector, Detector};

/// Named numeric parameters of one family table
pub struct ParamMap<'a> {
    family: AlarmFamily,
    table: &'a toml::Table,
}

impl<'a> ParamMap<'a> {
    pub fn new(family: AlarmFamily, table: &'a toml::Table) -> Self {
        Self { family, table }
    }

    pub fn family(&self) -> AlarmFamily {
        self.family
    }

    pub fn table(&self) -> &'a toml::Table {
        self.table
    }

    fn number(&self, key: &str) -> Result<Option<f64>> {
        match self.table.get(key) {
            None => Ok(None),
            Some(toml::Value::Integer(i)) => Ok(Some(*i as f64)),
            Some(toml::Value::Float(f)) if f.is_finite() => Ok(Some(*f)),
            Some(other) => bail!(
                "{}.{} must be a number, got {}",
                self.family,
                key,
                other.type_str()
            ),
        }
    }

    pub fn required(&self, key: &str) -> Result<f64> {
        self.number(key)?
            .ok_or_else(|| anyhow!("{}: missing required key `{}`", self.family, key))
    }

    pub fn optional(&self, key: &str, default: f64) -> Result<f64> {
        Ok(self.number(key)?.unwrap_or(default))
    }

    pub fn required_positive(&self, key: &str) -> Result<f64> {
        let v = self.required(key)?;
        if v <= 0.0 {
            bail!("{}.{} must be > 0 (got {})", self.family, key, v);
        }
        Ok(v)
    }

    pub fn required_non_negative(&self, key: &str) -> Result<f64> {
        let v = self.required(key)?;
        if v < 0.0 {
            bail!("{}.{} must be >= 0 (got {})", self.family, key, v);
        }
        Ok(v)
    }

    /// Positive whole count (e.g. snapshot or step counts)
    pub fn count(&self, key: &str, default: Option<usize>) -> Result<usize> {
        let v = match (self.number(key)?, default) {
            (Some(v), _) => v,
            (None, Some(d)) => return Ok(d),
            (None, None) => bail!("{}: missing required key `{}`", self.family, key),
        };
        if v < 1.0 || v.fract() != 0.0 {
            bail!("{}.{} must be a whole number >= 1 (got {})", self.family, key, v);
        }
        Ok(v as usize)
    }

    pub fn minutes(&self, key: &str) -> Result<ChronoDuration> {
        let v = self.required_non_negative(key)?;
        Ok(ChronoDuration::seconds((v * 60.0).round() as i64))
    }

    pub fn retrigger_policy(&self) -> Result<RetriggerPolicy> {
        Ok(RetriggerPolicy {
            cooldown: self.minutes("retrigger_cooldown_minutes")?,
            min_delta: self.required_non_negative("retrigger_min_delta")?,
        })
    }
}

/// Result of loading every family's thresholds
#[derive(Debug, Clone, Default)]
pub struct ThresholdSet {
    pub detectors: Vec<Detector>,
    pub disabled: Vec<AlarmFamily>,
    pub errors: Vec<(AlarmFamily, String)>,
}

impl ThresholdSet {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let doc: toml::Table = toml::from_str(raw).context("Failed to parse thresholds TOML")?;
        Ok(Self::from_table(&doc))
    }

    pub fn from_table(doc: &toml::Table) -> Self {
        let mut set = ThresholdSet::default();

        for family in AlarmFamily::ALL {
            let table = match doc.get(family.as_str()) {
                Some(toml::Value::Table(t)) => t,
                Some(other) => {
                    set.errors.push((
                        family,
                        format!("[{}] must be a table, got {}", family, other.type_str()),
                    ));
                    continue;
                }
                None => {
                    set.errors
                        .push((family, format!("missing [{}] section", family)));
                    continue;
                }
            };

            let enabled = match table.get("enabled") {
                None => true,
                Some(toml::Value::Boolean(b)) => *b,
                Some(other) => {
                    set.errors.push((
                        family,
                        format!("{}.enabled must be a boolean, got {}", family, other.type_str()),
                    ));
                    continue;
                }
            };
            if !enabled {
                set.disabled.push(family);
                continue;
            }

            match Detector::from_params(&ParamMap::new(family, table)) {
                Ok(detector) => set.detectors.push(detector),
                Err(e) => set.errors.push((family, format!("{e:#}"))),
            }
        }

        set
    }

    pub fn detector(&self, family: AlarmFamily) -> Option<&Detector> {
        self.detectors.iter().find(|d| d.family() == family)
    }

    pub fn retrigger_policy(&self, family: AlarmFamily) -> Option<RetriggerPolicy> {
        self.detector(family).and_then(Detector::retrigger_policy)
    }

    /// Log per-family problems; called once per load.
    pub fn log_problems(&self) {
        for (family, reason) in &self.errors {
            warn!(family = %family, reason = %reason, "⚠️ Detector skipped: invalid thresholds");
        }
        if !self.disabled.is_empty() {
            info!(disabled = ?self.disabled, "Detectors disabled by configuration");
        }
    }
}

/// Source of threshold configuration, re-read between runs.
pub trait ThresholdSource: Send + Sync {
    fn load_thresholds(&self) -> Result<ThresholdSet>;
}

/// Thresholds read from a TOML file on every load (live reload).
#[derive(Debug, Clone)]
pub struct TomlThresholdFile {
    path: PathBuf,
}

impl TomlThresholdFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ThresholdSource for TomlThresholdFile {
    fn load_thresholds(&self) -> Result<ThresholdSet> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read thresholds at {}", self.path.display()))?;
        ThresholdSet::from_toml_str(&raw)
            .with_context(|| format!("Invalid thresholds file {}", self.path.display()))
    }
}

/// Fixed thresholds (tests and embedding callers)
#[derive(Debug, Clone)]
pub struct StaticThresholds(pub ThresholdSet);

impl ThresholdSource for StaticThresholds {
    fn load_thresholds(&self) -> Result<ThresholdSet> {
        Ok(self.0.clone())
    }
}

/// Thresholds shared by concurrent runs. Each reload publishes the freshly loaded
/// set; when the whole source fails to load, the last good set stays in place.
pub struct LiveThresholds {
    source: Box<dyn ThresholdSource>,
    current: ArcSwap<ThresholdSet>,
}

impl LiveThresholds {
    pub fn new(source: impl ThresholdSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            current: ArcSwap::from_pointee(ThresholdSet::default()),
        }
    }

    pub fn reload(&self) -> Arc<ThresholdSet> {
        match self.source.load_thresholds() {
            Ok(set) => {
                set.log_problems();
                self.current.store(Arc::new(set));
            }
            Err(e) => {
                let kept = self.current.load();
                if kept.detectors.is_empty() {
                    error!(error = %format!("{e:#}"), "❌ Failed to load thresholds, no detectors active");
                } else {
                    warn!(
                        error = %format!("{e:#}"),
                        detectors = kept.detectors.len(),
                        "⚠️ Failed to reload thresholds, keeping last good set"
                    );
                }
            }
        }
        self.current.load_full()
    }

    pub fn current(&self) -> Arc<ThresholdSet> {
        self.current.load_full()
    }
}
