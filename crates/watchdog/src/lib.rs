//! pgpool watchdog daemon
//!
//! Ties the heartbeat channel, the interface monitor and the delegate IP
//! controller together behind a YAML configuration file.
//!
//! # Components
//!
//! - **Config**: YAML loading, validation and per-component settings
//! - **LifeCheck**: periodic peer classification from heartbeat receipts
//! - **MetricsServer**: Prometheus `/metrics` and JSON `/peers`
//! - **WatchdogServer**: task wiring and signal handling

pub mod config;
pub mod http_server;
pub mod lifecheck;
pub mod metrics;
pub mod server;

pub use config::{Config, ConfigError};
pub use http_server::{AppState, MetricsServer, PeerStatus};
pub use lifecheck::{LifeCheck, LifeCheckSummary};
pub use metrics::MetricsRegistry;
pub use server::WatchdogServer;
