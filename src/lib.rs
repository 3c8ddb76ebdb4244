//! keepvip - leader-owned virtual IP with TCP load balancing
//!
//! Cluster members elect a leader; the leader holds a virtual IPv4 address on
//! a configured interface and announces it with gratuitous ARP. TCP load
//! balancers listening behind the VIP spread connections across backends in
//! round-robin order.

pub mod balancer;
pub mod cluster;
pub mod config;
pub mod consensus;
pub mod metrics;
pub mod network;

pub use balancer::{BalancerError, LoadBalancer, LoadBalancerManager};
pub use cluster::{Cluster, ClusterError, ControllerExit, FatalLeaderHealthFailure};
pub use config::Config;
pub use consensus::{ConsensusProvider, Peer, RaftNode, RaftRole};
pub use metrics::{Metrics, MetricsServer};
pub use network::{Announcer, NetworkError, VipManager};
