//! Integration Tests for the cluster controller
//!
//! The controller runs against in-memory stand-ins for consensus, the VIP
//! interface, and the ARP announcer, so leadership can be scripted and VIP
//! ownership observed directly.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use keepvip::balancer::BalancerError;
use keepvip::config::{
    BackendConfig, CheckConfig, Config, LifecycleConfig, LoadBalancerConfig, MemberConfig,
};
use keepvip::consensus::{ConsensusError, ConsensusProvider, Peer, RaftRole};
use keepvip::metrics::Metrics;
use keepvip::network::{Announcer, NetworkError, VipManager};
use keepvip::{Cluster, ClusterError, ControllerExit};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(24000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const VIP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 100);

/// One broadcast segment shared by every simulated node.
///
/// Each node assigns addresses on its own behalf, so the segment can tell
/// which nodes currently hold the VIP.
#[derive(Default)]
struct FakeInterface {
    assignments: Mutex<HashSet<(String, Ipv4Addr)>>,
    adds: AtomicUsize,
    deletes: AtomicUsize,
    /// Every add call, successful or not
    add_attempts: AtomicUsize,
    /// Number of upcoming add calls that fail
    failing_adds: AtomicUsize,
}

impl FakeInterface {
    fn has(&self, address: Ipv4Addr) -> bool {
        !self.holders(address).is_empty()
    }

    fn holders(&self, address: Ipv4Addr) -> Vec<String> {
        let mut holders: Vec<String> = self
            .assignments
            .lock()
            .iter()
            .filter(|(_, a)| *a == address)
            .map(|(node, _)| node.clone())
            .collect();
        holders.sort();
        holders
    }
}

struct FakeVip {
    interface: Arc<FakeInterface>,
    owner: String,
    address: Ipv4Addr,
}

impl FakeVip {
    fn key(&self) -> (String, Ipv4Addr) {
        (self.owner.clone(), self.address)
    }
}

#[async_trait]
impl VipManager for FakeVip {
    async fn exists(&self) -> Result<bool, NetworkError> {
        Ok(self.interface.assignments.lock().contains(&self.key()))
    }

    async fn add(&self) -> Result<(), NetworkError> {
        self.interface.add_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = &self.interface.failing_adds;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(NetworkError::Command {
                command: "ip addr add".to_string(),
                status: "exit status: 2".to_string(),
                stderr: "RTNETLINK answers: Operation not permitted".to_string(),
            });
        }
        if self.interface.assignments.lock().insert(self.key()) {
            self.interface.adds.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn delete(&self) -> Result<(), NetworkError> {
        if self.interface.assignments.lock().remove(&self.key()) {
            self.interface.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn address(&self) -> Ipv4Addr {
        self.address
    }

    fn interface_name(&self) -> &str {
        "fake0"
    }
}

#[derive(Default)]
struct RecordingAnnouncer {
    sent: Mutex<Vec<(Ipv4Addr, String)>>,
    /// Behave like a platform without packet sockets
    unsupported: AtomicBool,
}

#[async_trait]
impl Announcer for RecordingAnnouncer {
    async fn announce(&self, address: Ipv4Addr, interface: &str) -> Result<(), NetworkError> {
        self.sent.lock().push((address, interface.to_string()));
        if self.unsupported.load(Ordering::SeqCst) {
            return Err(NetworkError::Unsupported("gratuitous ARP"));
        }
        Ok(())
    }
}

/// Consensus whose leadership is set by the test
struct ScriptedConsensus {
    local: Mutex<Option<Peer>>,
    leader: Mutex<Option<Peer>>,
    role: Mutex<RaftRole>,
    leadership: Mutex<Option<broadcast::Sender<bool>>>,
    shutdowns: AtomicUsize,
}

impl ScriptedConsensus {
    fn new() -> Arc<Self> {
        let (leadership, _) = broadcast::channel(16);
        Arc::new(Self {
            local: Mutex::new(None),
            leader: Mutex::new(None),
            role: Mutex::new(RaftRole::Follower),
            leadership: Mutex::new(Some(leadership)),
            shutdowns: AtomicUsize::new(0),
        })
    }

    /// Make the local node leader and publish the change
    fn promote(&self) {
        self.promote_silently();
        self.publish(true);
    }

    /// Make the local node leader without publishing (only a tick will notice)
    fn promote_silently(&self) {
        *self.leader.lock() = self.local.lock().clone();
        *self.role.lock() = RaftRole::Leader;
    }

    /// Hand leadership to `leader` and publish the loss
    fn demote(&self, leader: Option<Peer>) {
        self.demote_silently(leader);
        self.publish(false);
    }

    fn demote_silently(&self, leader: Option<Peer>) {
        *self.leader.lock() = leader;
        *self.role.lock() = RaftRole::Follower;
    }

    /// Send a leadership edge without touching the recorded leader
    fn publish(&self, is_leader: bool) {
        if let Some(sender) = self.leadership.lock().as_ref() {
            let _ = sender.send(is_leader);
        }
    }

    /// Drop the only sender, closing every subscription
    fn close_leadership(&self) {
        self.leadership.lock().take();
    }
}

#[async_trait]
impl ConsensusProvider for ScriptedConsensus {
    async fn bootstrap(&self, local: Peer, members: Vec<Peer>) -> Result<(), ConsensusError> {
        assert!(members.contains(&local));
        *self.local.lock() = Some(local);
        Ok(())
    }

    fn subscribe_leadership(&self) -> broadcast::Receiver<bool> {
        match self.leadership.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    fn current_leader(&self) -> Option<Peer> {
        self.leader.lock().clone()
    }

    fn current_role(&self) -> RaftRole {
        *self.role.lock()
    }

    async fn shutdown(&self) -> Result<(), ConsensusError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        *self.role.lock() = RaftRole::Follower;
        *self.leader.lock() = None;
        Ok(())
    }
}

struct Node {
    cluster: Cluster,
    consensus: Arc<ScriptedConsensus>,
    announcer: Arc<RecordingAnnouncer>,
    metrics: Arc<Metrics>,
}

fn test_config(node_id: &str) -> Config {
    Config {
        vip: VIP.to_string(),
        interface: "fake0".to_string(),
        checks_interval: 1,
        node_id: Some(node_id.to_string()),
        lifecycle: LifecycleConfig {
            warmup: Duration::ZERO,
            drain: Duration::ZERO,
        },
        members: ["node1", "node2"]
            .iter()
            .map(|id| MemberConfig {
                id: id.to_string(),
                address: format!("127.0.0.1:{}", next_port()),
            })
            .collect(),
        ..Config::default()
    }
}

fn node(config: Config, interface: &Arc<FakeInterface>) -> Node {
    let consensus = ScriptedConsensus::new();
    let announcer = Arc::new(RecordingAnnouncer::default());
    let metrics = Arc::new(Metrics::new());
    let vip = Arc::new(FakeVip {
        interface: interface.clone(),
        owner: config.node_id.clone().unwrap_or_default(),
        address: VIP,
    });
    let cluster = Cluster::new(
        config,
        consensus.clone(),
        vip,
        announcer.clone(),
        metrics.clone(),
    );
    Node {
        cluster,
        consensus,
        announcer,
        metrics,
    }
}

fn leader_gauge(node: &Node) -> i64 {
    let local = node.cluster.local_peer().unwrap();
    node.metrics
        .member_is_leader
        .with_label_values(&[
            "keepvip",
            local.id.as_str(),
            local.address.to_string().as_str(),
            VIP.to_string().as_str(),
        ])
        .get()
}

fn state_gauge(node: &Node) -> i64 {
    let local = node.cluster.local_peer().unwrap();
    node.metrics
        .member_state
        .with_label_values(&[
            "keepvip",
            local.id.as_str(),
            local.address.to_string().as_str(),
            VIP.to_string().as_str(),
        ])
        .get()
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// An address with nothing listening on it
async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

#[tokio::test]
async fn test_vip_follows_leadership() {
    let interface = Arc::new(FakeInterface::default());
    let mut node = node(test_config("node1"), &interface);
    node.cluster.start().await.unwrap();

    node.consensus.promote();
    eventually("vip added", || interface.has(VIP)).await;
    eventually("leader gauge", || leader_gauge(&node) == 1).await;
    assert_eq!(
        node.announcer.sent.lock().first().cloned(),
        Some((VIP, "fake0".to_string()))
    );

    node.consensus.demote(None);
    eventually("vip removed", || !interface.has(VIP)).await;
    assert_eq!(leader_gauge(&node), 0);

    assert_eq!(node.cluster.stop().await.unwrap(), ControllerExit::Stopped);
}

#[tokio::test]
async fn test_two_nodes_share_one_interface() {
    let interface = Arc::new(FakeInterface::default());
    let config = test_config("node1");
    let mut node2_config = config.clone();
    node2_config.node_id = Some("node2".to_string());

    let mut node1 = node(config, &interface);
    let mut node2 = node(node2_config, &interface);
    node1.cluster.start().await.unwrap();
    node2.cluster.start().await.unwrap();

    let peer2 = node2.cluster.local_peer().cloned();
    let peer1 = node1.cluster.local_peer().cloned();

    node1.consensus.promote();
    *node2.consensus.leader.lock() = peer1;
    eventually("node1 owns the vip", || interface.has(VIP)).await;

    assert_eq!(interface.holders(VIP), vec!["node1".to_string()]);

    // Failover: node1 releases, node2 takes over
    node1.consensus.demote(peer2);
    eventually("node1 released", || interface.holders(VIP).is_empty()).await;
    node2.consensus.promote();
    eventually("node2 owns the vip", || interface.has(VIP)).await;
    assert_eq!(interface.holders(VIP), vec!["node2".to_string()]);

    // Let reconciliation ticks pass on both nodes; ownership must not flap
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(interface.holders(VIP), vec!["node2".to_string()]);
    assert_eq!(leader_gauge(&node1), 0);
    assert_eq!(leader_gauge(&node2), 1);

    node1.cluster.stop().await.unwrap();
    assert_eq!(interface.holders(VIP), vec!["node2".to_string()]);
    node2.cluster.stop().await.unwrap();
    assert!(!interface.has(VIP));
}

#[tokio::test]
async fn test_tick_reconciles_from_current_leader() {
    let interface = Arc::new(FakeInterface::default());
    let mut node = node(test_config("node1"), &interface);
    node.cluster.start().await.unwrap();

    // No leadership event is published; the periodic check must notice
    node.consensus.promote_silently();
    eventually("vip added by tick", || interface.has(VIP)).await;
    eventually("role gauge", || state_gauge(&node) == 2).await;
    assert_eq!(leader_gauge(&node), 1);

    node.cluster.stop().await.unwrap();
}

#[tokio::test]
async fn test_repeated_ticks_are_idempotent() {
    let interface = Arc::new(FakeInterface::default());
    let mut node = node(test_config("node1"), &interface);
    node.cluster.start().await.unwrap();

    node.consensus.promote();
    eventually("vip added", || interface.has(VIP)).await;
    tokio::time::sleep(Duration::from_millis(2200)).await;

    // Ticks re-assert ownership but never add the address twice
    assert_eq!(interface.adds.load(Ordering::SeqCst), 1);
    assert!(node.announcer.sent.lock().len() >= 2);

    node.cluster.stop().await.unwrap();
    assert_eq!(interface.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_leader_health_failure_is_fatal() {
    let interface = Arc::new(FakeInterface::default());
    let mut config = test_config("node1");
    let address = closed_address().await;
    config.checks = vec![CheckConfig {
        name: "db".to_string(),
        address: address.clone(),
        protocol: "tcp".to_string(),
        timeout: 0,
    }];
    let mut node = node(config, &interface);
    node.cluster.start().await.unwrap();
    node.consensus.promote();

    let exit = tokio::time::timeout(Duration::from_secs(5), node.cluster.wait())
        .await
        .expect("leader kept running after a failed check")
        .unwrap();
    match exit {
        ControllerExit::Fatal(failure) => {
            assert_eq!(failure.check, "db");
            assert_eq!(failure.address, address);
        }
        other => panic!("unexpected exit: {:?}", other),
    }

    assert!(!interface.has(VIP));
    assert_eq!(node.consensus.shutdowns.load(Ordering::SeqCst), 1);

    // stop after a fatal exit reports the same outcome
    assert!(node.cluster.stop().await.unwrap().is_fatal());
}

#[tokio::test]
async fn test_follower_health_failure_is_not_fatal() {
    let interface = Arc::new(FakeInterface::default());
    let mut config = test_config("node1");
    config.checks = vec![CheckConfig {
        name: "db".to_string(),
        address: closed_address().await,
        protocol: "tcp".to_string(),
        timeout: 0,
    }];
    let mut node = node(config, &interface);
    node.cluster.start().await.unwrap();

    let still_running =
        tokio::time::timeout(Duration::from_millis(2500), node.cluster.wait()).await;
    assert!(still_running.is_err(), "follower exited on a failed check");

    assert_eq!(node.cluster.stop().await.unwrap(), ControllerExit::Stopped);
}

#[tokio::test]
async fn test_shutdown_releases_vip_and_closes_listeners() {
    let interface = Arc::new(FakeInterface::default());
    let mut config = test_config("node1");
    let lb_port = next_port();
    config.load_balancers = vec![LoadBalancerConfig {
        name: "web".to_string(),
        bind_address: format!("127.0.0.1:{}", lb_port),
        protocol: "tcp".to_string(),
        backends: vec![BackendConfig {
            name: "a".to_string(),
            address: closed_address().await,
        }],
        dial_timeout: Duration::from_millis(100),
        dial_rounds: 1,
    }];
    let mut node = node(config, &interface);
    node.cluster.start().await.unwrap();

    let lb_addr = SocketAddr::from(([127, 0, 0, 1], lb_port));
    assert!(TcpStream::connect(lb_addr).await.is_ok());

    node.consensus.promote();
    eventually("vip added", || interface.has(VIP)).await;

    assert_eq!(node.cluster.stop().await.unwrap(), ControllerExit::Stopped);
    assert!(!interface.has(VIP));
    assert!(TcpStream::connect(lb_addr).await.is_err());
    assert_eq!(node.consensus.shutdowns.load(Ordering::SeqCst), 1);

    // A second stop is a no-op
    assert_eq!(node.cluster.stop().await.unwrap(), ControllerExit::Stopped);
    assert_eq!(node.consensus.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unsupported_load_balancer_fails_start() {
    let interface = Arc::new(FakeInterface::default());
    let mut config = test_config("node1");
    config.load_balancers = vec![LoadBalancerConfig {
        name: "dns".to_string(),
        bind_address: format!("127.0.0.1:{}", next_port()),
        protocol: "udp".to_string(),
        backends: vec![],
        dial_timeout: Duration::from_millis(100),
        dial_rounds: 1,
    }];
    let mut node = node(config, &interface);

    let err = node.cluster.start().await.unwrap_err();
    assert!(matches!(
        err,
        ClusterError::Balancer(BalancerError::UnsupportedProtocol { .. })
    ));
    assert_eq!(node.consensus.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_node_id_fails_start() {
    let interface = Arc::new(FakeInterface::default());
    let mut node = node(test_config("node9"), &interface);
    assert!(matches!(
        node.cluster.start().await,
        Err(ClusterError::Classification(_))
    ));
}

#[tokio::test]
async fn test_wait_before_start() {
    let interface = Arc::new(FakeInterface::default());
    let node = node(test_config("node1"), &interface);
    assert!(matches!(
        node.cluster.wait().await,
        Err(ClusterError::NotStarted)
    ));
}

#[tokio::test]
async fn test_start_twice_is_error() {
    let interface = Arc::new(FakeInterface::default());
    let mut node = node(test_config("node1"), &interface);
    node.cluster.start().await.unwrap();
    assert!(matches!(
        node.cluster.start().await,
        Err(ClusterError::AlreadyStarted)
    ));
    node.cluster.stop().await.unwrap();
}

#[tokio::test]
async fn test_local_member_found_by_host_address() {
    let interface = Arc::new(FakeInterface::default());
    let mut config = test_config("node2");
    config.node_id = None;
    config.members[1].address = format!("127.0.0.2:{}", next_port());

    let mut node = node(config, &interface);
    node.cluster = node
        .cluster
        .with_local_address_check(|ip| ip == IpAddr::from([127, 0, 0, 2]));
    node.cluster.start().await.unwrap();

    let local = node.cluster.local_peer().cloned().unwrap();
    assert_eq!(local.id, "node2");
    node.cluster.stop().await.unwrap();
}

#[tokio::test]
async fn test_ambiguous_host_address_fails_start() {
    let interface = Arc::new(FakeInterface::default());
    let mut config = test_config("node1");
    config.node_id = None;

    // Both members listen on 127.0.0.1, so both look local
    let mut node = node(config, &interface);
    node.cluster = node.cluster.with_local_address_check(|ip| ip.is_loopback());
    assert!(matches!(
        node.cluster.start().await,
        Err(ClusterError::Classification(_))
    ));
    assert_eq!(node.consensus.shutdowns.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_vip_and_announce_failures_do_not_stop_the_loop() {
    let interface = Arc::new(FakeInterface::default());
    interface.failing_adds.store(2, Ordering::SeqCst);
    let mut node = node(test_config("node1"), &interface);
    node.announcer.unsupported.store(true, Ordering::SeqCst);
    node.cluster.start().await.unwrap();

    node.consensus.promote();
    eventually("leader gauge", || leader_gauge(&node) == 1).await;
    assert!(!interface.has(VIP));
    assert_eq!(node.announcer.sent.lock().len(), 1);

    // Later ticks retry the add until the interface accepts it
    eventually("vip added on retry", || interface.has(VIP)).await;
    assert_eq!(interface.add_attempts.load(Ordering::SeqCst), 3);
    assert!(node.announcer.sent.lock().len() >= 3);

    // The loop still reacts to leadership changes
    node.consensus.demote(None);
    eventually("vip removed", || !interface.has(VIP)).await;
    assert_eq!(node.cluster.stop().await.unwrap(), ControllerExit::Stopped);
}

#[tokio::test]
async fn test_overflowed_leadership_stream_resynchronizes() {
    let interface = Arc::new(FakeInterface::default());
    let mut config = test_config("node1");
    // Keep ticks out of the way so only leadership events move the VIP
    config.checks_interval = 3600;
    let mut node = node(config, &interface);
    node.cluster.start().await.unwrap();

    // The loop has not run yet; flapping overflows the 16-slot channel
    node.consensus.promote_silently();
    for _ in 0..10 {
        node.consensus.publish(true);
        node.consensus.publish(false);
    }
    node.consensus.publish(true);

    eventually("vip added after overflow", || interface.has(VIP)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(interface.has(VIP));
    assert_eq!(leader_gauge(&node), 1);

    // The stream keeps delivering after the overflow
    node.consensus.demote(None);
    eventually("vip removed", || !interface.has(VIP)).await;
    node.consensus.promote();
    eventually("vip added again", || interface.has(VIP)).await;

    node.cluster.stop().await.unwrap();
}

#[tokio::test]
async fn test_closed_leadership_stream_falls_back_to_ticks() {
    let interface = Arc::new(FakeInterface::default());
    let mut node = node(test_config("node1"), &interface);
    node.cluster.start().await.unwrap();
    node.consensus.close_leadership();

    node.consensus.promote_silently();
    eventually("vip added by tick", || interface.has(VIP)).await;
    assert_eq!(leader_gauge(&node), 1);

    node.consensus.demote_silently(None);
    eventually("vip removed by tick", || !interface.has(VIP)).await;
    assert_eq!(leader_gauge(&node), 0);

    assert_eq!(node.cluster.stop().await.unwrap(), ControllerExit::Stopped);
}
