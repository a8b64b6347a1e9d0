//! Common utilities and types shared across the watchdog crates.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
