pub mod big_money;
pub mod cache;
pub mod db_storage;
pub mod dedup;
pub mod detector;
pub mod dropping;
pub mod failure_log;
pub mod line_freeze;
pub mod mim;
pub mod notify;
pub mod pipeline;
pub mod reconcile;
pub mod repository;
pub mod reversal;
pub mod sharp;
pub mod snapshot_store;
pub mod thresholds;
pub mod volume_shift;
pub mod volume_shock;

pub use db_storage::DbAlarmStorage;
pub use detector::{detect_all, AlarmDetector, Detector};
pub use pipeline::{DetectionPipeline, RunConfig, RunReport};
pub use reconcile::{ReconcileReport, Reconciler};
pub use snapshot_store::DbSnapshotRepository;
