//! smartmoney: smart-money alarm detection daemon and maintenance commands.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use smartmoney_backend::{
    clock::{Clock, SystemClock},
    config::AppConfig,
    signals::{
        failure_log::FailureLog,
        notify::{LogNotifier, Notifier, WebhookNotifier},
        thresholds::{LiveThresholds, TomlThresholdFile},
        DbAlarmStorage, DbSnapshotRepository, DetectionPipeline, Reconciler,
    },
};

#[derive(Parser, Debug)]
#[command(name = "smartmoney")]
#[command(about = "Smart-money alarm detection over moneyway snapshots")]
struct Cli {
    /// SQLite database (snapshots and alarms)
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Threshold TOML file, re-read before every run
    #[arg(long, global = true)]
    thresholds: Option<PathBuf>,

    /// Only fixtures quoted within this many hours are scanned
    #[arg(long, global = true)]
    lookback_hours: Option<i64>,

    /// Fixtures processed concurrently
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run detection, reconciliation and retention loops until interrupted
    Run {
        /// Seconds between detection runs
        #[arg(long)]
        interval_secs: Option<u64>,

        /// Prometheus exporter port
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// One detection run
    Detect,

    /// One reconciliation pass
    Reconcile,

    /// Drop dedup states older than the retention window
    Sweep {
        #[arg(long)]
        retention_hours: Option<i64>,
    },

    /// Print alarm store statistics
    Stats,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(db_path) = &self.db_path {
            config.db_path = db_path.clone();
        }
        if let Some(path) = &self.thresholds {
            config.thresholds_path = path.clone();
        }
        if let Some(hours) = self.lookback_hours {
            config.lookback_hours = hours;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        match &self.command {
            Commands::Run {
                interval_secs,
                metrics_port,
            } => {
                if let Some(secs) = interval_secs {
                    config.run_interval_secs = *secs;
                }
                if metrics_port.is_some() {
                    config.metrics_port = *metrics_port;
                }
            }
            Commands::Sweep { retention_hours } => {
                if let Some(hours) = retention_hours {
                    config.retention_hours = *hours;
                }
            }
            Commands::Detect | Commands::Reconcile | Commands::Stats => {}
        }
    }
}

/// Everything the commands share, wired once from config
struct Engine {
    alarms: Arc<DbAlarmStorage>,
    pipeline: Arc<DetectionPipeline>,
    reconciler: Arc<Reconciler>,
}

impl Engine {
    fn build(config: &AppConfig) -> Result<Self> {
        let repo = Arc::new(DbSnapshotRepository::new(&config.db_path)?);
        let alarms = Arc::new(DbAlarmStorage::new(&config.db_path)?);
        let threshold_file = TomlThresholdFile::new(&config.thresholds_path);
        info!("🎚️ Thresholds: {}", threshold_file.path().display());
        let thresholds = Arc::new(LiveThresholds::new(threshold_file));
        let failures = Arc::new(FailureLog::new(config.failure_log_capacity));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let notifier: Arc<dyn Notifier> = match &config.webhook_url {
            Some(url) => {
                info!("📣 Delivering alarms to webhook {}", url);
                Arc::new(WebhookNotifier::new(url.clone(), config.io_timeout())?)
            }
            None => Arc::new(LogNotifier),
        };

        let pipeline = DetectionPipeline::new(
            repo.clone(),
            alarms.clone(),
            thresholds.clone(),
            failures.clone(),
            clock.clone(),
            config.run_config(),
        )
        .with_cache_config(config.cache_config())
        .with_notifier(notifier)
        .with_state_store(alarms.clone());

        let reconciler = Reconciler::new(
            repo,
            alarms.clone(),
            thresholds,
            failures,
            clock,
            config.run_config(),
        );

        Ok(Self {
            alarms,
            pipeline: Arc::new(pipeline),
            reconciler: Arc::new(reconciler),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env()?;
    cli.apply(&mut config);
    config.validate()?;

    info!("🚀 Smart-money alarm engine starting");
    info!("📊 Database: {}", config.db_path);

    let engine = Engine::build(&config)?;

    match cli.command {
        Commands::Run { .. } => run_daemon(engine, &config).await,
        Commands::Detect => {
            engine.pipeline.hydrate().await?;
            let report = engine.pipeline.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Reconcile => {
            let report = engine.reconciler.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Sweep { .. } => {
            let report = engine.pipeline.sweep(config.retention()).await?;
            engine.alarms.optimize()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Stats => {
            let stats = engine.alarms.get_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

async fn run_daemon(engine: Engine, config: &AppConfig) -> Result<()> {
    if let Some(port) = config.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to start Prometheus exporter")?;
        info!("📈 Metrics exported on http://{}/metrics", addr);
    }

    if let Err(e) = engine.pipeline.hydrate().await {
        warn!("⚠️ Starting without persisted dedup state: {e:#}");
    }

    let mut detect_tick = interval(Duration::from_secs(config.run_interval_secs));
    detect_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reconcile_tick = interval(Duration::from_secs(config.reconcile_interval_secs));
    reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep_tick = interval(Duration::from_secs(config.sweep_interval_secs));
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let retention = config.retention();
    info!(
        run_interval_secs = config.run_interval_secs,
        reconcile_interval_secs = config.reconcile_interval_secs,
        "⏱️ Detection loop running"
    );

    // Reconciliation runs on its own task so a long pass never delays detection.
    let reconciler = engine.reconciler.clone();
    let reconcile_task = tokio::spawn(async move {
        loop {
            reconcile_tick.tick().await;
            if let Err(e) = reconciler.run_once().await {
                error!("❌ Reconciliation failed: {e:#}");
            }
        }
    });

    loop {
        tokio::select! {
            _ = detect_tick.tick() => {
                if let Err(e) = engine.pipeline.run_once().await {
                    error!("❌ Detection run failed: {e:#}");
                }
            }
            _ = sweep_tick.tick() => {
                if let Err(e) = engine.pipeline.sweep(retention).await {
                    error!("❌ Retention sweep failed: {e:#}");
                }
                if let Err(e) = engine.alarms.optimize() {
                    warn!("⚠️ Database optimize failed: {e:#}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown requested");
                break;
            }
        }
    }

    reconcile_task.abort();
    Ok(())
}

/// Initialize tracing; `RUST_LOG` overrides the default filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smartmoney_backend=info,smartmoney=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory.
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
