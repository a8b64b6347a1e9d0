//! Configuration loading and validation for the watchdog daemon

use heartbeat::{AuthMethod, DEFAULT_LIFE_POINT, HeartbeatConfig, HeartbeatInterface, PeerNode};
use serde::{Deserialize, Deserializer};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};
use vip::{ProbeConfig, TrustedServers, VipConfig};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub peers: Vec<PeerSettings>,

    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    #[serde(default)]
    pub vip: VipConfig,

    #[serde(default)]
    pub trusted: TrustedSettings,

    #[serde(default)]
    pub monitoring: MonitoringSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationErrors> {
        self.node.validate()?;
        for peer in &self.peers {
            peer.validate()?;
        }
        self.heartbeat.validate()?;
        for destination in &self.heartbeat.destinations {
            destination.validate()?;
        }
        validate_vip(&self.vip)?;
        self.metrics.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// This node's identity
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct NodeSettings {
    #[validate(length(min = 1, max = 255))]
    pub hostname: String,

    #[validate(range(min = 1))]
    pub pgpool_port: u16,

    #[validate(range(min = 1))]
    pub wd_port: u16,
}

/// A remote watchdog node
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PeerSettings {
    #[validate(length(min = 1, max = 255))]
    pub hostname: String,

    #[serde(default = "default_wd_port")]
    #[validate(range(min = 1))]
    pub wd_port: u16,

    #[serde(default = "default_pgpool_port")]
    #[validate(range(min = 1))]
    pub pgpool_port: u16,
}

/// Heartbeat transport settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_heartbeat_timing"))]
pub struct HeartbeatSettings {
    #[validate(range(min = 1))]
    pub bind_port: u16,

    #[serde(with = "humantime_serde")]
    pub keepalive: Duration,

    #[serde(with = "humantime_serde")]
    pub deadtime: Duration,

    /// Pause between two lifecheck passes
    #[serde(with = "humantime_serde")]
    pub lifecheck_interval: Duration,

    #[validate(custom = "validate_auth_method")]
    pub auth_method: String,

    pub auth_key: String,

    #[validate(range(min = 1, max = 100))]
    pub life_point: i32,

    pub destinations: Vec<DestinationSettings>,
}

/// One heartbeat destination and the device its sockets bind to
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DestinationSettings {
    #[validate(length(min = 1, max = 255))]
    pub hostname: String,

    #[serde(default = "default_heartbeat_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    #[serde(default)]
    pub device: String,
}

/// Trusted servers used to tell a dead peer from a dead local network
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrustedSettings {
    /// A list, or a comma separated string
    #[serde(deserialize_with = "deserialize_servers")]
    pub servers: Vec<String>,

    pub trusted_server_command: String,
}

/// Local interface monitoring
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    /// Subscribe to kernel link and address notifications
    pub link_events: bool,

    /// Interfaces that must stay up; empty means any
    pub interfaces: Vec<String>,
}

/// Metrics and status HTTP endpoint
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: Option<String>,

    #[validate(custom = "validate_log_format")]
    pub format: Option<String>,
}

// Default implementations

fn default_wd_port() -> u16 {
    9000
}

fn default_pgpool_port() -> u16 {
    9999
}

fn default_heartbeat_port() -> u16 {
    heartbeat::DEFAULT_HEARTBEAT_PORT
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            pgpool_port: default_pgpool_port(),
            wd_port: default_wd_port(),
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            bind_port: heartbeat::DEFAULT_HEARTBEAT_PORT,
            keepalive: heartbeat::DEFAULT_KEEPALIVE,
            deadtime: heartbeat::DEFAULT_DEADTIME,
            lifecheck_interval: Duration::from_secs(10),
            auth_method: "hmac-sha256".to_string(),
            auth_key: String::new(),
            life_point: DEFAULT_LIFE_POINT,
            destinations: Vec::new(),
        }
    }
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            link_events: true,
            interfaces: Vec::new(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9695".to_string(),
        }
    }
}

// Custom validators

fn validate_heartbeat_timing(settings: &HeartbeatSettings) -> Result<(), ValidationError> {
    if settings.keepalive.is_zero() {
        return Err(ValidationError::new("keepalive_zero"));
    }
    if settings.deadtime <= settings.keepalive {
        return Err(ValidationError::new("deadtime_not_above_keepalive"));
    }
    if settings.lifecheck_interval.is_zero() {
        return Err(ValidationError::new("lifecheck_interval_zero"));
    }
    Ok(())
}

fn validate_auth_method(method: &str) -> Result<(), ValidationError> {
    parse_auth_method(method)
        .map(|_| ())
        .ok_or_else(|| ValidationError::new("auth_method_unknown"))
}

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format {
        "text" | "json" => Ok(()),
        _ => Err(ValidationError::new("log_format_unknown")),
    }
}

fn validate_vip(vip: &VipConfig) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();

    if vip.has_delegate_ip() {
        if vip.delegate_ip.parse::<IpAddr>().is_err() {
            errors.add("delegate_ip", ValidationError::new("delegate_ip_invalid"));
        }
        for (field, cmd) in [
            ("if_up_cmd", &vip.if_up_cmd),
            ("if_down_cmd", &vip.if_down_cmd),
            ("arping_cmd", &vip.arping_cmd),
        ] {
            if cmd.trim().is_empty() {
                errors.add(field, ValidationError::new("command_empty"));
            }
        }
    }

    if vip.ip_poll_attempts == 0 {
        errors.add("ip_poll_attempts", ValidationError::new("poll_attempts_zero"));
    }

    if errors.errors().is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn parse_auth_method(method: &str) -> Option<AuthMethod> {
    match method.to_ascii_lowercase().as_str() {
        "md5" => Some(AuthMethod::Md5),
        "hmac-sha256" | "hmac_sha256" | "sha256" => Some(AuthMethod::HmacSha256),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ServerList {
    List(Vec<String>),
    Csv(String),
}

fn deserialize_servers<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let servers = match ServerList::deserialize(deserializer)? {
        ServerList::List(list) => list,
        ServerList::Csv(csv) => csv.split(',').map(str::to_string).collect(),
    };

    Ok(servers
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/pgpool-watchdog/watchdog.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./watchdog.yaml"));

        paths.into_iter().find(|p| p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/pgpool-watchdog/watchdog.yaml"))
    }

    /// Configured peers, in registry order
    pub fn peer_nodes(&self) -> Vec<PeerNode> {
        self.peers
            .iter()
            .map(|p| PeerNode::new(p.hostname.clone(), p.wd_port, p.pgpool_port))
            .collect()
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        let hb = &self.heartbeat;
        HeartbeatConfig {
            hostname: self.node.hostname.clone(),
            pgpool_port: self.node.pgpool_port,
            bind_port: hb.bind_port,
            keepalive: hb.keepalive,
            deadtime: hb.deadtime,
            auth_key: hb.auth_key.clone(),
            auth_method: parse_auth_method(&hb.auth_method).unwrap_or_default(),
            interfaces: hb
                .destinations
                .iter()
                .map(|d| HeartbeatInterface::new(d.hostname.clone(), d.port, d.device.clone()))
                .collect(),
        }
    }

    pub fn vip_config(&self) -> VipConfig {
        self.vip.clone()
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            ping_path: self.vip.ping_path.clone(),
            trusted_server_command: self.trusted.trusted_server_command.clone(),
        }
    }

    pub fn trusted_servers(&self) -> TrustedServers {
        TrustedServers::new(self.trusted.servers.clone())
    }

    /// Whether logs should be emitted as JSON
    pub fn json_logging(&self) -> bool {
        self.logging.format.as_deref() == Some("json")
    }
}
