//! Prometheus metrics for keepvip
//!
//! Exposes leadership, consensus role, and health-check gauges at the
//! /metrics endpoint. Every series carries the cluster name and the local
//! server identity so that scraping all members gives a cluster-wide view.

use prometheus::{IntGaugeVec, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// Metric namespace shared by all series
pub const NAMESPACE: &str = "keep_vip";

const MEMBER_LABELS: &[&str] = &["keep_vip_cluster", "server_id", "server_address", "vip"];
const CHECK_LABELS: &[&str] = &[
    "keep_vip_cluster",
    "server_id",
    "server_address",
    "name",
    "address",
];

/// Label values identifying the local member
#[derive(Debug, Clone)]
pub struct MemberLabels {
    pub cluster: String,
    pub server_id: String,
    pub server_address: String,
    pub vip: String,
}

/// All keepvip metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    /// 1 while this member holds leadership, 0 otherwise
    pub member_is_leader: IntGaugeVec,
    /// Consensus role: Follower 0, Candidate 1, Leader 2
    pub member_state: IntGaugeVec,
    /// 1 when the last health check succeeded, 0 otherwise
    pub check_port: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let member_is_leader = IntGaugeVec::new(
            Opts::new(
                "member_is_leader",
                "Whether or not this member is a leader. 1 if is, 0 otherwise",
            )
            .namespace(NAMESPACE),
            MEMBER_LABELS,
        )
        .unwrap();

        let member_state = IntGaugeVec::new(
            Opts::new(
                "member_state",
                "Member state, return Follower:0 Candidate:1 Leader:2",
            )
            .namespace(NAMESPACE),
            MEMBER_LABELS,
        )
        .unwrap();

        let check_port = IntGaugeVec::new(
            Opts::new(
                "check_port",
                "Cluster check port. return 1 is success, 0 failure",
            )
            .namespace(NAMESPACE),
            CHECK_LABELS,
        )
        .unwrap();

        registry
            .register(Box::new(member_is_leader.clone()))
            .unwrap();
        registry.register(Box::new(member_state.clone())).unwrap();
        registry.register(Box::new(check_port.clone())).unwrap();

        Metrics {
            registry,
            member_is_leader,
            member_state,
            check_port,
        }
    }

    pub fn set_leader(&self, labels: &MemberLabels, is_leader: bool) {
        self.member_is_leader
            .with_label_values(&[
                labels.cluster.as_str(),
                labels.server_id.as_str(),
                labels.server_address.as_str(),
                labels.vip.as_str(),
            ])
            .set(is_leader as i64);
    }

    pub fn set_state(&self, labels: &MemberLabels, state: i64) {
        self.member_state
            .with_label_values(&[
                labels.cluster.as_str(),
                labels.server_id.as_str(),
                labels.server_address.as_str(),
                labels.vip.as_str(),
            ])
            .set(state);
    }

    pub fn set_check(&self, labels: &MemberLabels, name: &str, address: &str, healthy: bool) {
        self.check_port
            .with_label_values(&[
                labels.cluster.as_str(),
                labels.server_id.as_str(),
                labels.server_address.as_str(),
                name,
                address,
            ])
            .set(healthy as i64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
