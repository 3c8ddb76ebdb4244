//! Cluster Module
//!
//! Ties leadership to VIP ownership. One decision loop consumes leadership
//! changes, periodic reconciliation ticks, health-check failures, and the
//! stop request, and is the only place the VIP is mutated.
//!
//! # Lifecycle
//!
//! 1. Classify members into the local peer and remote peers
//! 2. Bootstrap consensus with every member
//! 3. Wait the warm-up interval for the first election to settle
//! 4. Start the configured load balancers
//! 5. Run the decision loop until stopped or a leader health check fails
//!
//! # Usage
//!
//! ```toml
//! vip = "192.168.1.100"
//! interface = "eth0"
//!
//! [[members]]
//! id = "node1"
//! address = "192.168.1.11:7000"
//!
//! [[members]]
//! id = "node2"
//! address = "192.168.1.12:7000"
//! ```

mod controller;
mod health;
mod peers;

pub use controller::Cluster;
pub use health::HealthReport;
pub use peers::{classify_peers, resolve_members};

use std::fmt;

use crate::balancer::BalancerError;
use crate::consensus::ConsensusError;

/// Error type for cluster lifecycle operations
#[derive(Debug)]
pub enum ClusterError {
    /// A member address could not be resolved
    Address { address: String, reason: String },
    /// The local member could not be determined
    Classification(String),
    /// Consensus bootstrap or shutdown failed
    Consensus(ConsensusError),
    /// A load balancer failed to start
    Balancer(BalancerError),
    /// `start` was called on a running cluster
    AlreadyStarted,
    /// `wait` or `stop` was called before `start`
    NotStarted,
    /// The decision loop ended without reporting an exit
    ControllerGone,
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::Address { address, reason } => {
                write!(f, "Invalid member address '{}': {}", address, reason)
            }
            ClusterError::Classification(msg) => write!(f, "Peer classification failed: {}", msg),
            ClusterError::Consensus(e) => write!(f, "Consensus error: {}", e),
            ClusterError::Balancer(e) => write!(f, "{}", e),
            ClusterError::AlreadyStarted => write!(f, "Cluster already started"),
            ClusterError::NotStarted => write!(f, "Cluster not started"),
            ClusterError::ControllerGone => write!(f, "Cluster controller exited unexpectedly"),
        }
    }
}

impl std::error::Error for ClusterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClusterError::Consensus(e) => Some(e),
            ClusterError::Balancer(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConsensusError> for ClusterError {
    fn from(e: ConsensusError) -> Self {
        ClusterError::Consensus(e)
    }
}

impl From<BalancerError> for ClusterError {
    fn from(e: BalancerError) -> Self {
        ClusterError::Balancer(e)
    }
}

/// A health check failed while this node held leadership.
///
/// The node has already released the VIP and shut down; the process is
/// expected to exit with a failure status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalLeaderHealthFailure {
    pub check: String,
    pub address: String,
    pub reason: String,
}

impl fmt::Display for FatalLeaderHealthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "leader health check '{}' ({}) failed: {}",
            self.check, self.address, self.reason
        )
    }
}

impl std::error::Error for FatalLeaderHealthFailure {}

/// How the decision loop finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerExit {
    /// Stopped on request
    Stopped,
    /// Terminated itself after a health check failed while leader
    Fatal(FatalLeaderHealthFailure),
}

impl ControllerExit {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControllerExit::Fatal(_))
    }
}
