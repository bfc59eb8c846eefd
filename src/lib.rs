//! Smart-money alarm backend library
//!
//! Detects unusual money flow in bookmaker "moneyway" snapshots, records each alarm
//! exactly once, and reconciles the alarm store against a recomputation.

pub mod clock;
pub mod config;
pub mod identity;
pub mod models;
pub mod signals;

pub use config::AppConfig;
pub use identity::fingerprint;
