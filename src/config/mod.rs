//! Configuration Module
//!
//! Provides TOML-based configuration for keepvip with support for:
//! - Cluster identity (name, interface, VIP, members)
//! - Health checks run on every reconciliation tick
//! - Load balancers and their backends
//! - Consensus and lifecycle timings
//! - Metrics endpoint
//! - Environment variable overrides (KEEPVIP__* prefix)

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use balancer::{BackendConfig, LoadBalancerConfig};
pub use cluster::{CheckConfig, LifecycleConfig, MemberConfig, RaftConfig};
pub use metrics::MetricsConfig;

mod balancer;
mod cluster;
mod metrics;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster name, used as a metrics label
    pub cluster: String,
    /// Network interface the VIP is bound to
    pub interface: String,
    /// Virtual IPv4 address owned by the leader
    pub vip: String,
    /// Reconciliation tick interval in seconds
    pub checks_interval: u64,
    /// Explicit local member id (skips address-based classification)
    pub node_id: Option<String>,
    /// Logging configuration
    pub log: LogConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
    /// Consensus timings
    pub raft: RaftConfig,
    /// Startup and shutdown timings
    pub lifecycle: LifecycleConfig,
    /// Health checks run on every tick
    pub checks: Vec<CheckConfig>,
    /// Cluster members, including this node
    pub members: Vec<MemberConfig>,
    /// Load balancers started with the cluster
    pub load_balancers: Vec<LoadBalancerConfig>,
}

fn default_cluster_name() -> String {
    "keepvip".to_string()
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_checks_interval() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: default_cluster_name(),
            interface: default_interface(),
            vip: String::new(),
            checks_interval: default_checks_interval(),
            node_id: None,
            log: LogConfig::default(),
            metrics: MetricsConfig::default(),
            raft: RaftConfig::default(),
            lifecycle: LifecycleConfig::default(),
            checks: Vec::new(),
            members: Vec::new(),
            load_balancers: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `KEEPVIP__` prefix with double underscores for nesting:
    ///    - `KEEPVIP__VIP=10.0.0.100` overrides `vip`
    ///    - `KEEPVIP__METRICS__ENABLED=true` overrides `metrics.enabled`
    ///    - `KEEPVIP__LOG__LEVEL=debug` overrides `log.level`
    ///
    /// Unlike the optional sections, a missing file is an error: the member
    /// list and VIP cannot be defaulted.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&content);

        let cfg = config::Config::builder()
            .set_default("cluster", default_cluster_name())?
            .set_default("interface", default_interface())?
            .set_default("checks_interval", default_checks_interval() as i64)?
            .set_default("log.level", "info")?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.bind", "0.0.0.0:9090")?
            .add_source(File::from_str(&substituted, FileFormat::Toml))
            // Double underscore separates nested keys, single underscore preserved in field names
            .add_source(
                Environment::with_prefix("KEEPVIP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vip.trim().is_empty() {
            return Err(ConfigError::Validation(
                "vip address config is empty".to_string(),
            ));
        }
        if self.vip_addr().is_none() {
            return Err(ConfigError::Validation(format!(
                "could not parse vip '{}' as an IPv4 address",
                self.vip
            )));
        }

        if self.interface.is_empty() {
            return Err(ConfigError::Validation(
                "interface must not be empty".to_string(),
            ));
        }

        if self.checks_interval == 0 {
            return Err(ConfigError::Validation(
                "checks_interval must be at least 1 second".to_string(),
            ));
        }

        if self.members.is_empty() {
            return Err(ConfigError::Validation(
                "at least one cluster member is required".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for member in &self.members {
            if member.id.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "member with address '{}' has an empty id",
                    member.address
                )));
            }
            if !ids.insert(member.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate member id '{}'",
                    member.id
                )));
            }
        }

        if let Some(ref node_id) = self.node_id {
            if !ids.contains(node_id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "node_id '{}' does not name a configured member",
                    node_id
                )));
            }
        }

        for lb in &self.load_balancers {
            if lb.name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "load balancer bound to '{}' has an empty name",
                    lb.bind_address
                )));
            }
        }

        for check in &self.checks {
            if check.name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "check with address '{}' has an empty name",
                    check.address
                )));
            }
        }

        Ok(())
    }

    /// The VIP as a parsed IPv4 address
    pub fn vip_addr(&self) -> Option<Ipv4Addr> {
        self.vip.trim().parse().ok()
    }

    /// Reconciliation tick interval as Duration
    pub fn checks_interval_duration(&self) -> Duration {
        Duration::from_secs(self.checks_interval)
    }
}
