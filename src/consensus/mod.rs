//! Consensus
//!
//! Leader election among the configured cluster members. The cluster
//! controller only consumes the capability surface defined by
//! [`ConsensusProvider`]; [`RaftNode`] is the built-in implementation.
//!
//! # Protocol
//!
//! Raft leader election without log replication: randomized election
//! timeouts, one vote per term, majority quorum, and leader heartbeats. A
//! leader that cannot reach a quorum for a full election timeout steps down.
//! Term and vote live in memory only.

mod node;
mod protocol;

pub use node::RaftNode;
pub use protocol::{RaftMessage, ELECTION_PROTOCOL_VERSION};

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub id: String,
    pub address: SocketAddr,
}

impl Peer {
    pub fn new(id: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            id: id.into(),
            address,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Role of the local node in the current term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaftRole {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl RaftRole {
    /// Numeric value exported on the member state gauge
    pub fn as_gauge(self) -> i64 {
        match self {
            RaftRole::Follower => 0,
            RaftRole::Candidate => 1,
            RaftRole::Leader => 2,
        }
    }
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "Follower"),
            RaftRole::Candidate => write!(f, "Candidate"),
            RaftRole::Leader => write!(f, "Leader"),
        }
    }
}

/// Error type for consensus operations
#[derive(Debug)]
pub enum ConsensusError {
    /// I/O error
    Io(std::io::Error),
    /// The election listener could not be bound
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
    /// Malformed or unexpected message
    Protocol(String),
    /// Peer did not answer in time
    Timeout,
    /// `bootstrap` was called twice
    AlreadyBootstrapped,
    /// The local peer is missing from the member list
    LocalNotMember(String),
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusError::Io(e) => write!(f, "I/O error: {}", e),
            ConsensusError::Bind { address, source } => {
                write!(f, "Failed to bind election listener {}: {}", address, source)
            }
            ConsensusError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ConsensusError::Timeout => write!(f, "Request timed out"),
            ConsensusError::AlreadyBootstrapped => write!(f, "Cluster already bootstrapped"),
            ConsensusError::LocalNotMember(id) => {
                write!(f, "Local peer '{}' is not in the member list", id)
            }
        }
    }
}

impl std::error::Error for ConsensusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConsensusError::Io(e) => Some(e),
            ConsensusError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConsensusError {
    fn from(e: std::io::Error) -> Self {
        ConsensusError::Io(e)
    }
}

/// Leadership capabilities consumed by the cluster controller
#[async_trait]
pub trait ConsensusProvider: Send + Sync {
    /// Join the cluster formed by `members` (which includes `local`)
    async fn bootstrap(&self, local: Peer, members: Vec<Peer>) -> Result<(), ConsensusError>;

    /// Stream of leadership transitions; `true` when the local node gains
    /// leadership and `false` when it loses it
    fn subscribe_leadership(&self) -> broadcast::Receiver<bool>;

    /// The member currently recognized as leader, if any
    fn current_leader(&self) -> Option<Peer>;

    fn current_role(&self) -> RaftRole;

    /// Leave the cluster; the local node is no longer leader afterwards
    async fn shutdown(&self) -> Result<(), ConsensusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_gauge_values() {
        assert_eq!(RaftRole::Follower.as_gauge(), 0);
        assert_eq!(RaftRole::Candidate.as_gauge(), 1);
        assert_eq!(RaftRole::Leader.as_gauge(), 2);
        assert_eq!(RaftRole::default(), RaftRole::Follower);
    }

    #[test]
    fn test_peer_equality_uses_id_and_address() {
        let a = Peer::new("node1", "10.0.0.1:7000".parse().unwrap());
        let b = Peer::new("node1", "10.0.0.2:7000".parse().unwrap());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(a.to_string(), "node1@10.0.0.1:7000");
    }
}
