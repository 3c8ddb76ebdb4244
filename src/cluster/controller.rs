//! Cluster Controller
//!
//! [`Cluster`] owns startup and the stop/wait rendezvous. The decision loop
//! itself runs in [`Controller::run`], a single task that turns every input
//! into a [`ControllerEvent`] and handles events one at a time.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::balancer::{LoadBalancer, LoadBalancerManager};
use crate::config::{CheckConfig, Config};
use crate::consensus::{ConsensusProvider, Peer};
use crate::metrics::{MemberLabels, Metrics};
use crate::network::{is_local_address, Announcer, VipManager};

use super::health::{spawn_checks, HealthReport};
use super::peers::{classify_peers, resolve_members};
use super::{ClusterError, ControllerExit, FatalLeaderHealthFailure};

/// Capacity of the health report channel
const HEALTH_CHANNEL_SIZE: usize = 64;

/// Inputs to the decision loop
#[derive(Debug)]
enum ControllerEvent {
    /// Leadership gained (`true`) or lost (`false`)
    Leadership(bool),
    /// Periodic reconciliation
    Tick,
    /// A health check failed
    HealthCheckFailed(HealthReport),
    /// Shutdown requested
    Stop,
}

/// A cluster member process: consensus, VIP ownership, and load balancers
pub struct Cluster {
    config: Config,
    consensus: Arc<dyn ConsensusProvider>,
    vip: Arc<dyn VipManager>,
    announcer: Arc<dyn Announcer>,
    metrics: Arc<Metrics>,
    is_local: fn(IpAddr) -> bool,
    local: Option<Peer>,
    stop_tx: Option<oneshot::Sender<()>>,
    done_rx: Option<watch::Receiver<Option<ControllerExit>>>,
    loop_task: Option<JoinHandle<()>>,
}

impl Cluster {
    pub fn new(
        config: Config,
        consensus: Arc<dyn ConsensusProvider>,
        vip: Arc<dyn VipManager>,
        announcer: Arc<dyn Announcer>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            consensus,
            vip,
            announcer,
            metrics,
            is_local: is_local_address,
            local: None,
            stop_tx: None,
            done_rx: None,
            loop_task: None,
        }
    }

    /// Replace the host address check used for peer classification
    pub fn with_local_address_check(mut self, is_local: fn(IpAddr) -> bool) -> Self {
        self.is_local = is_local;
        self
    }

    /// The local peer, once started
    pub fn local_peer(&self) -> Option<&Peer> {
        self.local.as_ref()
    }

    /// Bring the node into the cluster and start the decision loop
    pub async fn start(&mut self) -> Result<(), ClusterError> {
        if self.done_rx.is_some() {
            return Err(ClusterError::AlreadyStarted);
        }
        info!("Started");

        let members = resolve_members(&self.config.members).await?;
        let (local, remotes) =
            classify_peers(&members, self.config.node_id.as_deref(), self.is_local)?;
        info!(
            "Local peer {}, {} remote peer(s): {}",
            local,
            remotes.len(),
            remotes
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        // Subscribe first so the first election result cannot be missed
        let leadership = self.consensus.subscribe_leadership();
        self.consensus.bootstrap(local.clone(), members).await?;

        let warmup = self.config.lifecycle.warmup;
        if !warmup.is_zero() {
            info!(
                "This instance will wait approximately {:?}, from cold start to ensure cluster elections are complete",
                warmup
            );
            tokio::time::sleep(warmup).await;
        }

        let balancers = match self.start_load_balancers().await {
            Ok(balancers) => balancers,
            Err(e) => {
                if let Err(shutdown_err) = self.consensus.shutdown().await {
                    warn!("Consensus shutdown after failed start: {}", shutdown_err);
                }
                return Err(e);
            }
        };

        let labels = MemberLabels {
            cluster: self.config.cluster.clone(),
            server_id: local.id.clone(),
            server_address: local.address.to_string(),
            vip: self.vip.address().to_string(),
        };
        let (health_tx, health_rx) = mpsc::channel(HEALTH_CHANNEL_SIZE);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(None);

        let controller = Controller {
            local: local.clone(),
            consensus: self.consensus.clone(),
            vip: self.vip.clone(),
            announcer: self.announcer.clone(),
            metrics: self.metrics.clone(),
            labels,
            checks: self.config.checks.clone(),
            checks_interval: self.config.checks_interval,
            drain: self.config.lifecycle.drain,
            balancers,
            is_leader: false,
            health_tx,
        };

        self.loop_task = Some(tokio::spawn(async move {
            let exit = controller.run(leadership, health_rx, stop_rx).await;
            let _ = done_tx.send(Some(exit));
        }));
        self.local = Some(local);
        self.stop_tx = Some(stop_tx);
        self.done_rx = Some(done_rx);
        Ok(())
    }

    async fn start_load_balancers(&self) -> Result<LoadBalancerManager, ClusterError> {
        let mut manager = LoadBalancerManager::new();
        for config in &self.config.load_balancers {
            let started = match LoadBalancer::resolve(config).await {
                Ok(lb) => manager.add_load_balancer(lb).await,
                Err(e) => Err(e),
            };
            match started {
                Ok(addr) => info!(
                    "Load Balancer [{}] started, connection address: {}:{}",
                    config.name,
                    self.vip.address(),
                    addr.port()
                ),
                Err(e) => {
                    manager.stop_all().await;
                    return Err(e.into());
                }
            }
        }
        Ok(manager)
    }

    /// Wait until the decision loop completes
    pub async fn wait(&self) -> Result<ControllerExit, ClusterError> {
        let mut done = self.done_rx.clone().ok_or(ClusterError::NotStarted)?;
        let exit = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ClusterError::ControllerGone)?;
        exit.clone().ok_or(ClusterError::ControllerGone)
    }

    /// Request shutdown and wait for it to complete.
    ///
    /// Calling this again returns the recorded exit without side effects.
    pub async fn stop(&mut self) -> Result<ControllerExit, ClusterError> {
        if let Some(stop) = self.stop_tx.take() {
            // The loop may have finished on its own already
            let _ = stop.send(());
        }
        let exit = self.wait().await?;
        if let Some(task) = self.loop_task.take() {
            if let Err(e) = task.await {
                error!("Cluster controller task failed: {}", e);
            }
        }
        info!("Stopped");
        Ok(exit)
    }
}

/// State owned by the decision loop
struct Controller {
    local: Peer,
    consensus: Arc<dyn ConsensusProvider>,
    vip: Arc<dyn VipManager>,
    announcer: Arc<dyn Announcer>,
    metrics: Arc<Metrics>,
    labels: MemberLabels,
    checks: Vec<CheckConfig>,
    checks_interval: u64,
    drain: Duration,
    balancers: LoadBalancerManager,
    /// Leadership as of the most recent decision point
    is_leader: bool,
    health_tx: mpsc::Sender<HealthReport>,
}

impl Controller {
    async fn run(
        mut self,
        mut leadership: broadcast::Receiver<bool>,
        mut health_rx: mpsc::Receiver<HealthReport>,
        mut stop: oneshot::Receiver<()>,
    ) -> ControllerExit {
        let period = Duration::from_secs(self.checks_interval);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut leadership_open = true;

        loop {
            let event = tokio::select! {
                biased;

                // A dropped sender means the owning Cluster is gone
                _ = &mut stop => ControllerEvent::Stop,
                changed = leadership.recv(), if leadership_open => match changed {
                    Ok(is_leader) => ControllerEvent::Leadership(is_leader),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} leadership change(s), resynchronizing", skipped);
                        ControllerEvent::Leadership(self.recognized_as_leader())
                    }
                    Err(RecvError::Closed) => {
                        warn!("Leadership stream closed; relying on periodic checks");
                        leadership_open = false;
                        continue;
                    }
                },
                Some(report) = health_rx.recv() => ControllerEvent::HealthCheckFailed(report),
                _ = ticker.tick() => ControllerEvent::Tick,
            };

            debug!("Controller event: {:?}", event);
            match event {
                ControllerEvent::Leadership(true) => {
                    info!("This node is Leader of the cluster");
                    self.take_vip().await;
                }
                ControllerEvent::Leadership(false) => {
                    info!("This node is becoming a follower within the cluster");
                    self.release_vip().await;
                }
                ControllerEvent::Tick => self.reconcile().await,
                ControllerEvent::HealthCheckFailed(report) => {
                    if self.is_leader {
                        error!(
                            "Health check {} ({}) failed on the leader, terminating",
                            report.name, report.address
                        );
                        self.shutdown().await;
                        return ControllerExit::Fatal(FatalLeaderHealthFailure {
                            check: report.name,
                            address: report.address,
                            reason: report.reason,
                        });
                    }
                    warn!(
                        "Health check {} ({}) failed on a follower: {}",
                        report.name, report.address, report.reason
                    );
                }
                ControllerEvent::Stop => {
                    self.shutdown().await;
                    return ControllerExit::Stopped;
                }
            }
        }
    }

    fn recognized_as_leader(&self) -> bool {
        self.consensus.current_leader().as_ref() == Some(&self.local)
    }

    async fn take_vip(&mut self) {
        self.is_leader = true;
        if let Err(e) = self.vip.add().await {
            warn!("Add vip {} failed: {}", self.vip.address(), e);
        }
        if let Err(e) = self
            .announcer
            .announce(self.vip.address(), self.vip.interface_name())
            .await
        {
            warn!("ARP announce of {} failed: {}", self.vip.address(), e);
        }
        self.metrics.set_leader(&self.labels, true);
    }

    async fn release_vip(&mut self) {
        self.is_leader = false;
        if let Err(e) = self.vip.delete().await {
            warn!("Delete vip {} failed: {}", self.vip.address(), e);
        }
        self.metrics.set_leader(&self.labels, false);
    }

    async fn reconcile(&mut self) {
        let leader = self.consensus.current_leader();
        match &leader {
            Some(peer) => debug!("Leader is {}", peer),
            None => debug!("No leader recognized"),
        }

        if leader.as_ref() == Some(&self.local) {
            self.take_vip().await;
        } else {
            self.release_vip().await;
        }

        self.metrics
            .set_state(&self.labels, self.consensus.current_role().as_gauge());

        spawn_checks(
            &self.checks,
            self.checks_interval,
            &self.metrics,
            &self.labels,
            &self.health_tx,
        );
    }

    async fn shutdown(&mut self) {
        if self.is_leader || self.recognized_as_leader() {
            if let Err(e) = self.vip.delete().await {
                warn!("Delete vip {} failed: {}", self.vip.address(), e);
            }
        }
        self.is_leader = false;
        self.metrics.set_leader(&self.labels, false);

        info!("Stopping Load Balancers");
        self.balancers.stop_all().await;

        info!("Stopping Raft Cluster");
        if let Err(e) = self.consensus.shutdown().await {
            error!("Consensus shutdown failed: {}", e);
        }

        if !self.drain.is_zero() {
            info!("Wait Stopping {:?}", self.drain);
            tokio::time::sleep(self.drain).await;
        }
    }
}
