//! Outbound alarm notifications.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::models::{AlarmDetails, AlarmRecord};
use crate::signals::dedup::Decision;

/// What gets delivered for one fired alarm
#[derive(Debug, Clone, Serialize)]
pub struct AlarmMessage {
    pub fingerprint: String,
    pub family: String,
    pub fixture: String,
    pub market: String,
    pub selection: String,
    pub triggered_at: DateTime<Utc>,
    pub value: f64,
    pub retrigger: bool,
    pub text: String,
}

impl AlarmMessage {
    pub fn new(record: &AlarmRecord, decision: &Decision) -> Self {
        Self {
            fingerprint: record.fingerprint(),
            family: record.family().as_str().to_string(),
            fixture: record.fixture.to_string(),
            market: record.key.market.as_str().to_string(),
            selection: record.key.selection.as_str().to_string(),
            triggered_at: record.triggered_at,
            value: record.value,
            retrigger: matches!(decision, Decision::Retrigger { .. }),
            text: render_plain(record, decision),
        }
    }
}

/// One-line summary, e.g.
/// `[big_money] Galatasaray vs Fenerbahçe (Süper Lig) 1x2/1: +16200 in one step @ 2025-03-01 12:05 UTC`
pub fn render_plain(record: &AlarmRecord, decision: &Decision) -> String {
    let what = match &record.details {
        AlarmDetails::BigMoney { inflow, huge, .. } => {
            format!("+{inflow:.0} in one step{}", if *huge { " (huge)" } else { "" })
        }
        AlarmDetails::VolumeShock { inflow, shock, .. } => {
            format!("+{inflow:.0}, {shock:.1}x recent average")
        }
        AlarmDetails::Dropping { opening, current, drop_pct, level, .. } => {
            format!("L{level} drop {opening:.2} -> {current:.2} ({drop_pct:.1}%)")
        }
        AlarmDetails::LineFreeze { price, frozen_minutes, inflow, level, .. } => {
            format!("L{level} frozen at {price:.2} for {frozen_minutes}m, +{inflow:.0}")
        }
        AlarmDetails::VolumeShift { from, to, new_money, .. } => {
            format!("leader {from} -> {to} on +{new_money:.0}")
        }
        AlarmDetails::Sharp { score, .. } => format!("sharp score {score:.1}"),
        AlarmDetails::ReversalMove { trough, current, retracement_pct, .. } => {
            format!("reversal {trough:.2} -> {current:.2} ({retracement_pct:.0}% retraced)")
        }
        AlarmDetails::Mim { inflow, impact, .. } => {
            format!("+{inflow:.0} = {:.1}% of market", impact * 100.0)
        }
    };
    let tag = match decision {
        Decision::Retrigger { .. } => " (again)",
        _ => "",
    };
    format!(
        "[{}] {} {}/{}: {}{} @ {}",
        record.family(),
        record.fixture,
        record.key.market,
        record.key.selection,
        what,
        tag,
        record.triggered_at.format("%Y-%m-%d %H:%M UTC")
    )
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &AlarmMessage) -> Result<()>;
}

/// Writes alarms to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &AlarmMessage) -> Result<()> {
        info!(fingerprint = %message.fingerprint, "🚨 {}", message.text);
        Ok(())
    }
}

/// POSTs the message as JSON
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, message: &AlarmMessage) -> Result<()> {
        self.client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .with_context(|| format!("webhook POST to {} failed", self.url))?
            .error_for_status()
            .context("webhook rejected alarm")?;
        Ok(())
    }
}
