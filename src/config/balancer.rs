//! Load Balancer Configuration
//!
//! Each `[[load_balancers]]` entry becomes one listening instance that
//! relays connections to its backends in round-robin order.
//!
//! ```toml
//! [[load_balancers]]
//! name = "web"
//! bind_address = "0.0.0.0:8080"
//! type = "tcp"
//!
//! [[load_balancers.backends]]
//! name = "web-1"
//! address = "10.0.0.11:80"
//! ```

use std::time::Duration;

use serde::Deserialize;

/// A backend endpoint
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Backend name, used in logs
    pub name: String,
    /// Backend address ("host:port")
    pub address: String,
}

/// A load balancer instance
#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancerConfig {
    /// Load balancer name
    pub name: String,
    /// Listen address ("host:port")
    pub bind_address: String,
    /// Protocol type; only "tcp" is implemented
    #[serde(rename = "type", default = "default_protocol")]
    pub protocol: String,
    /// Ordered backend set
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Timeout for a single backend dial
    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,
    /// Full passes over the backend set before a client connection is dropped
    #[serde(default = "default_dial_rounds")]
    pub dial_rounds: u32,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_dial_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_dial_rounds() -> u32 {
    3
}
