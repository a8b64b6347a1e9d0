//! Delegate IP control
//!
//! Moves the cluster's floating address between nodes by running the
//! operator's interface commands, and probes hosts with `ping` to check
//! whether this node can still reach the network.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vip::{ProcessRunner, VipConfig, VipController};
//!
//! # async fn example() {
//! let config = VipConfig {
//!     delegate_ip: "10.0.0.50".to_string(),
//!     ..Default::default()
//! };
//!
//! let controller = Arc::new(VipController::new(config, Arc::new(ProcessRunner)));
//! if controller.spawn_escalation().await.unwrap_or(false) {
//!     println!("this node now holds the delegate IP");
//! }
//! # }
//! ```

mod command;
mod controller;
mod probe;
mod template;

pub use command::{CommandOutput, CommandRunner, ExitKind, ProcessRunner, shell};
pub use controller::{CacheClearHook, VipConfig, VipController};
pub use probe::{ProbeConfig, TrustedServerProbe, TrustedServers, classify_ping, parse_average_rtt};
pub use template::{IP_PLACEHOLDER, expand_percent, resolve_command, split_command, substitute};
