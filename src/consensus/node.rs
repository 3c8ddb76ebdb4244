//! Raft Election Node
//!
//! Two background tasks per node: the election listener answering vote and
//! heartbeat RPCs, and the driver that runs election timeouts while following
//! and sends heartbeats while leading. All mutable state sits behind one
//! mutex that is never held across an await.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RaftConfig;

use super::protocol::{read_message, write_message, RaftMessage, ELECTION_PROTOCOL_VERSION};
use super::{ConsensusError, ConsensusProvider, Peer, RaftRole};

/// Capacity of the leadership broadcast channel
const LEADERSHIP_CHANNEL_SIZE: usize = 16;

/// In-memory Raft leader election
pub struct RaftNode {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    timing: RaftConfig,
    state: Mutex<NodeState>,
    leadership: broadcast::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

struct NodeState {
    local: Option<Peer>,
    members: Vec<Peer>,
    term: u64,
    voted_for: Option<String>,
    role: RaftRole,
    leader: Option<Peer>,
    /// Last time a valid leader or candidate was heard from
    last_heard: Instant,
    /// Last time a heartbeat round reached a quorum (leader only)
    last_quorum: Instant,
}

impl NodeState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            local: None,
            members: Vec::new(),
            term: 0,
            voted_for: None,
            role: RaftRole::Follower,
            leader: None,
            last_heard: now,
            last_quorum: now,
        }
    }

    fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    fn remote_peers(&self) -> Vec<Peer> {
        self.members
            .iter()
            .filter(|m| Some(*m) != self.local.as_ref())
            .cloned()
            .collect()
    }

    /// Change role, publishing leadership gained or lost
    fn transition(&mut self, role: RaftRole, leadership: &broadcast::Sender<bool>) {
        let was_leader = self.role == RaftRole::Leader;
        self.role = role;
        match (was_leader, role == RaftRole::Leader) {
            (false, true) => {
                let _ = leadership.send(true);
            }
            (true, false) => {
                let _ = leadership.send(false);
            }
            _ => {}
        }
    }

    /// Become a follower in `term`; the vote is kept only if the term is unchanged
    fn step_down(&mut self, term: u64, leadership: &broadcast::Sender<bool>) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        self.leader = None;
        self.last_heard = Instant::now();
        self.transition(RaftRole::Follower, leadership);
    }
}

impl RaftNode {
    pub fn new(timing: RaftConfig) -> Self {
        let (leadership, _) = broadcast::channel(LEADERSHIP_CHANNEL_SIZE);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                timing,
                state: Mutex::new(NodeState::new()),
                leadership,
                shutdown,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current term, mostly useful for diagnostics
    pub fn current_term(&self) -> u64 {
        self.inner.state.lock().term
    }
}

#[async_trait]
impl ConsensusProvider for RaftNode {
    async fn bootstrap(&self, local: Peer, members: Vec<Peer>) -> Result<(), ConsensusError> {
        if !members.contains(&local) {
            return Err(ConsensusError::LocalNotMember(local.id));
        }
        if *self.inner.shutdown.borrow() || self.inner.state.lock().local.is_some() {
            return Err(ConsensusError::AlreadyBootstrapped);
        }

        let listener = TcpListener::bind(local.address)
            .await
            .map_err(|source| ConsensusError::Bind {
                address: local.address,
                source,
            })?;

        {
            let mut state = self.inner.state.lock();
            if state.local.is_some() {
                return Err(ConsensusError::AlreadyBootstrapped);
            }
            info!(
                "Bootstrapping election node {} with {} member(s)",
                local,
                members.len()
            );
            state.local = Some(local);
            state.members = members;
            state.last_heard = Instant::now();
        }

        let server = tokio::spawn(serve(
            self.inner.clone(),
            listener,
            self.inner.shutdown.subscribe(),
        ));
        let driver = tokio::spawn(drive(self.inner.clone(), self.inner.shutdown.subscribe()));
        self.tasks.lock().extend([server, driver]);

        Ok(())
    }

    fn subscribe_leadership(&self) -> broadcast::Receiver<bool> {
        self.inner.leadership.subscribe()
    }

    fn current_leader(&self) -> Option<Peer> {
        self.inner.state.lock().leader.clone()
    }

    fn current_role(&self) -> RaftRole {
        self.inner.state.lock().role
    }

    async fn shutdown(&self) -> Result<(), ConsensusError> {
        self.inner.shutdown.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("Election task failed during shutdown: {}", e);
            }
        }

        let mut state = self.inner.state.lock();
        let term = state.term;
        state.step_down(term, &self.inner.leadership);
        info!("Election node shut down at term {}", term);
        Ok(())
    }
}

impl Inner {
    fn election_timeout(&self) -> Duration {
        let base = (self.timing.election_timeout.as_millis() as u64).max(1);
        Duration::from_millis(rand::thread_rng().gen_range(base..base * 2))
    }

    /// Answer one inbound RPC
    fn handle(&self, request: RaftMessage) -> Result<RaftMessage, ConsensusError> {
        let mut state = self.state.lock();
        match request {
            RaftMessage::RequestVote {
                version,
                term,
                candidate_id,
            } => {
                if version != ELECTION_PROTOCOL_VERSION || term < state.term {
                    return Ok(RaftMessage::Vote {
                        term: state.term,
                        granted: false,
                    });
                }
                if term > state.term {
                    state.step_down(term, &self.leadership);
                }

                let granted = match &state.voted_for {
                    None => true,
                    Some(id) => *id == candidate_id,
                };
                if granted {
                    debug!("Granting vote to {} for term {}", candidate_id, term);
                    state.voted_for = Some(candidate_id);
                    state.last_heard = Instant::now();
                }
                Ok(RaftMessage::Vote {
                    term: state.term,
                    granted,
                })
            }
            RaftMessage::Heartbeat {
                version,
                term,
                leader_id,
            } => {
                if version != ELECTION_PROTOCOL_VERSION || term < state.term {
                    return Ok(RaftMessage::HeartbeatAck {
                        term: state.term,
                        success: false,
                    });
                }
                if term > state.term || state.role != RaftRole::Follower {
                    state.step_down(term, &self.leadership);
                }

                let leader = state.members.iter().find(|m| m.id == leader_id).cloned();
                if leader.is_some() && state.leader != leader {
                    info!("Following leader {} in term {}", leader_id, term);
                }
                state.leader = leader;
                state.last_heard = Instant::now();
                Ok(RaftMessage::HeartbeatAck {
                    term: state.term,
                    success: true,
                })
            }
            other => Err(ConsensusError::Protocol(format!(
                "unexpected {} request",
                other.type_name()
            ))),
        }
    }

    /// One request/response exchange on a fresh connection
    async fn rpc(
        &self,
        address: SocketAddr,
        request: &RaftMessage,
    ) -> Result<RaftMessage, ConsensusError> {
        let exchange = async {
            let mut stream = TcpStream::connect(address).await?;
            write_message(&mut stream, request).await?;
            Ok::<_, ConsensusError>(read_message(&mut stream).await?)
        };
        tokio::time::timeout(self.timing.rpc_timeout, exchange)
            .await
            .map_err(|_| ConsensusError::Timeout)?
    }

    async fn run_election(&self) {
        let (term, candidate, peers) = {
            let mut state = self.state.lock();
            let Some(local) = state.local.clone() else {
                return;
            };
            state.term += 1;
            state.voted_for = Some(local.id.clone());
            state.leader = None;
            state.last_heard = Instant::now();
            state.transition(RaftRole::Candidate, &self.leadership);
            (state.term, local, state.remote_peers())
        };
        debug!("Starting election for term {}", term);

        let request = RaftMessage::RequestVote {
            version: ELECTION_PROTOCOL_VERSION,
            term,
            candidate_id: candidate.id.clone(),
        };
        let responses = join_all(peers.iter().map(|p| self.rpc(p.address, &request))).await;

        let mut state = self.state.lock();
        if state.term != term || state.role != RaftRole::Candidate {
            return;
        }

        let mut votes = 1;
        for (peer, response) in peers.iter().zip(responses) {
            match response {
                Ok(RaftMessage::Vote {
                    term: peer_term,
                    granted,
                }) => {
                    if peer_term > term {
                        state.step_down(peer_term, &self.leadership);
                        return;
                    }
                    if granted {
                        votes += 1;
                    }
                }
                Ok(other) => {
                    debug!("Unexpected {} from {}", other.type_name(), peer);
                }
                Err(e) => {
                    debug!("Vote request to {} failed: {}", peer, e);
                }
            }
        }

        if votes >= state.quorum() {
            info!("Won election for term {} with {} vote(s)", term, votes);
            state.leader = Some(candidate);
            state.last_quorum = Instant::now();
            state.transition(RaftRole::Leader, &self.leadership);
        } else {
            debug!("Election for term {} got {} vote(s)", term, votes);
        }
    }

    async fn send_heartbeats(&self) {
        let (term, leader_id, peers) = {
            let state = self.state.lock();
            match (&state.local, state.role) {
                (Some(local), RaftRole::Leader) => {
                    (state.term, local.id.clone(), state.remote_peers())
                }
                _ => return,
            }
        };

        let request = RaftMessage::Heartbeat {
            version: ELECTION_PROTOCOL_VERSION,
            term,
            leader_id,
        };
        let responses = join_all(peers.iter().map(|p| self.rpc(p.address, &request))).await;

        let mut state = self.state.lock();
        if state.term != term || state.role != RaftRole::Leader {
            return;
        }

        let mut acks = 1;
        for (peer, response) in peers.iter().zip(responses) {
            match response {
                Ok(RaftMessage::HeartbeatAck {
                    term: peer_term,
                    success,
                }) => {
                    if peer_term > term {
                        info!("Peer {} is at term {}, stepping down", peer, peer_term);
                        state.step_down(peer_term, &self.leadership);
                        return;
                    }
                    if success {
                        acks += 1;
                    }
                }
                Ok(other) => {
                    debug!("Unexpected {} from {}", other.type_name(), peer);
                }
                Err(e) => {
                    debug!("Heartbeat to {} failed: {}", peer, e);
                }
            }
        }

        if acks >= state.quorum() {
            state.last_quorum = Instant::now();
        } else if state.last_quorum.elapsed() >= self.timing.election_timeout {
            warn!(
                "Lost contact with quorum ({} of {} reachable), stepping down",
                acks,
                state.members.len()
            );
            state.step_down(term, &self.leadership);
        }
    }
}

/// Election timer and heartbeat loop
async fn drive(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let role = inner.state.lock().role;
        let wait = match role {
            RaftRole::Leader => inner.timing.heartbeat_interval,
            _ => inner.election_timeout(),
        };

        let step = async {
            tokio::time::sleep(wait).await;
            match role {
                RaftRole::Leader => inner.send_heartbeats().await,
                _ => {
                    let expired = inner.state.lock().last_heard.elapsed() >= wait;
                    if expired {
                        inner.run_election().await;
                    }
                }
            }
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = step => {}
        }
    }
    debug!("Election driver stopped");
}

/// Accept loop for inbound election RPCs
async fn serve(inner: Arc<Inner>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        if let Err(e) = answer(&inner, stream).await {
                            debug!("Election RPC from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Election listener accept error: {}", e);
                }
            },
        }
    }
    debug!("Election listener stopped");
}

async fn answer(inner: &Inner, mut stream: TcpStream) -> Result<(), ConsensusError> {
    let request = tokio::time::timeout(inner.timing.rpc_timeout, read_message(&mut stream))
        .await
        .map_err(|_| ConsensusError::Timeout)??;
    let response = inner.handle(request)?;
    write_message(&mut stream, &response).await
}
