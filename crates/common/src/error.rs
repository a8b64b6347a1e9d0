//! Common error types for the watchdog components.

use std::fmt;

/// A specialized Result type for watchdog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for watchdog operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Netlink error: {0}")]
    Netlink(String),

    #[error("Heartbeat error: {0}")]
    Heartbeat(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new netlink (or routing socket) error.
    pub fn netlink(msg: impl fmt::Display) -> Self {
        Error::Netlink(msg.to_string())
    }

    /// Create a new heartbeat transport error.
    pub fn heartbeat(msg: impl fmt::Display) -> Self {
        Error::Heartbeat(msg.to_string())
    }

    /// Create a new external command error.
    pub fn command(msg: impl fmt::Display) -> Self {
        Error::Command(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }
}
