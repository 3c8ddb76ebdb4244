//! Cluster Configuration
//!
//! Members, health checks, and the timings that drive consensus and the
//! controller lifecycle.

use std::time::Duration;

use serde::Deserialize;

/// A configured cluster member
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MemberConfig {
    /// Identifier, unique within the cluster
    pub id: String,
    /// Consensus transport address ("host:port")
    pub address: String,
}

/// A health check run on every reconciliation tick
#[derive(Debug, Clone, Deserialize)]
pub struct CheckConfig {
    /// Check name, used in logs and as a metrics label
    pub name: String,
    /// Target address ("host:port")
    pub address: String,
    /// Check protocol; only "tcp" is supported
    #[serde(default = "default_check_protocol")]
    pub protocol: String,
    /// Connect timeout in seconds (0 or more than the tick interval = 500ms)
    #[serde(default)]
    pub timeout: i64,
}

fn default_check_protocol() -> String {
    "tcp".to_string()
}

/// Default connect timeout when the configured one is unusable
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

impl CheckConfig {
    /// Effective connect timeout for this check given the tick interval.
    ///
    /// Non-positive timeouts, and timeouts longer than the tick itself, fall
    /// back to [`DEFAULT_CHECK_TIMEOUT`].
    pub fn timeout_duration(&self, checks_interval: u64) -> Duration {
        if self.timeout <= 0 || self.timeout as u64 > checks_interval {
            DEFAULT_CHECK_TIMEOUT
        } else {
            Duration::from_secs(self.timeout as u64)
        }
    }
}

/// Consensus timings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Interval between leader heartbeats
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Base election timeout; each wait is randomized in [t, 2t)
    #[serde(with = "humantime_serde")]
    pub election_timeout: Duration,
    /// Timeout for a single vote or heartbeat round trip
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(250),
            election_timeout: Duration::from_secs(1),
            rpc_timeout: Duration::from_millis(500),
        }
    }
}

/// Startup and shutdown timings of the controller
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Wait after bootstrap for the first election to settle
    #[serde(with = "humantime_serde")]
    pub warmup: Duration,
    /// Wait during shutdown for in-flight connections to close
    #[serde(with = "humantime_serde")]
    pub drain: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(5),
            drain: Duration::from_secs(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(timeout: i64) -> CheckConfig {
        CheckConfig {
            name: "web".to_string(),
            address: "127.0.0.1:80".to_string(),
            protocol: "tcp".to_string(),
            timeout,
        }
    }

    #[test]
    fn test_check_timeout_within_interval() {
        assert_eq!(check(2).timeout_duration(5), Duration::from_secs(2));
        assert_eq!(check(5).timeout_duration(5), Duration::from_secs(5));
    }

    #[test]
    fn test_check_timeout_falls_back_to_default() {
        assert_eq!(check(0).timeout_duration(5), DEFAULT_CHECK_TIMEOUT);
        assert_eq!(check(-3).timeout_duration(5), DEFAULT_CHECK_TIMEOUT);
        assert_eq!(check(10).timeout_duration(5), DEFAULT_CHECK_TIMEOUT);
    }

    #[test]
    fn test_default_timings() {
        let raft = RaftConfig::default();
        assert_eq!(raft.heartbeat_interval, Duration::from_millis(250));
        assert!(raft.heartbeat_interval < raft.election_timeout);

        let lifecycle = LifecycleConfig::default();
        assert_eq!(lifecycle.warmup, Duration::from_secs(5));
        assert_eq!(lifecycle.drain, Duration::from_secs(3));
    }
}
