//! TCP Load Balancer
//!
//! Each configured load balancer owns one listening socket. Accepted
//! connections are relayed to a backend chosen in round-robin order.
//!
//! # Components
//!
//! - **BackendPool**: ordered backend set with its own rotation cursor
//! - **LoadBalancerInstance**: accept loop plus per-connection relay tasks
//! - **LoadBalancerManager**: starts instances and stops them as a group

mod instance;
mod manager;
mod pool;

pub use instance::LoadBalancerInstance;
pub use manager::LoadBalancerManager;
pub use pool::BackendPool;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::LoadBalancerConfig;

/// The only protocol type with an implementation
pub const PROTOCOL_TCP: &str = "tcp";

/// Error type for load balancer operations
#[derive(Debug)]
pub enum BalancerError {
    /// The pool has no backends to choose from
    NoBackends,
    /// Protocol type has no implementation
    UnsupportedProtocol { name: String, protocol: String },
    /// An address in the configuration could not be resolved
    InvalidAddress { address: String, reason: String },
    /// The listener could not be bound
    Bind { address: SocketAddr, source: std::io::Error },
}

impl fmt::Display for BalancerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerError::NoBackends => write!(f, "No Backends configured"),
            BalancerError::UnsupportedProtocol { name, protocol } => write!(
                f,
                "Add LoadBalancer {} the protocol type is not supported: {}",
                name, protocol
            ),
            BalancerError::InvalidAddress { address, reason } => {
                write!(f, "Invalid address '{}': {}", address, reason)
            }
            BalancerError::Bind { address, source } => {
                write!(f, "Failed to bind {}: {}", address, source)
            }
        }
    }
}

impl std::error::Error for BalancerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BalancerError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A resolved backend endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    pub address: SocketAddr,
}

/// A load balancer with all addresses resolved
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    pub name: String,
    pub bind_address: SocketAddr,
    pub protocol: String,
    pub backends: Vec<Backend>,
    /// Timeout for one backend dial
    pub dial_timeout: Duration,
    /// Full passes over the backends before giving up on a connection
    pub dial_rounds: u32,
}

impl LoadBalancer {
    /// Resolve every address in a load balancer configuration
    pub async fn resolve(config: &LoadBalancerConfig) -> Result<Self, BalancerError> {
        let bind_address = resolve_addr(&config.bind_address).await?;

        let mut backends = Vec::with_capacity(config.backends.len());
        for backend in &config.backends {
            backends.push(Backend {
                name: backend.name.clone(),
                address: resolve_addr(&backend.address).await?,
            });
        }

        Ok(Self {
            name: config.name.clone(),
            bind_address,
            protocol: config.protocol.clone(),
            backends,
            dial_timeout: config.dial_timeout,
            dial_rounds: config.dial_rounds,
        })
    }
}

/// Resolve a "host:port" string to its first socket address
pub async fn resolve_addr(address: &str) -> Result<SocketAddr, BalancerError> {
    let mut addrs = tokio::net::lookup_host(address)
        .await
        .map_err(|e| BalancerError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    addrs.next().ok_or_else(|| BalancerError::InvalidAddress {
        address: address.to_string(),
        reason: "no addresses resolved".to_string(),
    })
}
