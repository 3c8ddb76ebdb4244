//! Load Balancer Instance
//!
//! Owns one TCP listener. The accept loop runs in its own task and hands each
//! connection to a relay task; `stop` closes the listener and waits for the
//! accept loop to confirm. Relays already in flight are left to drain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::pool::BackendPool;
use super::{BalancerError, LoadBalancer};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
/// Pause after a failed accept so descriptor exhaustion does not spin the loop
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// A running TCP load balancer
pub struct LoadBalancerInstance {
    name: String,
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

/// Per-connection relay settings shared by every connection of an instance
struct RelayContext {
    name: String,
    pool: BackendPool,
    dial_timeout: Duration,
    dial_rounds: u32,
}

impl LoadBalancerInstance {
    /// Bind the listener and start accepting connections
    pub async fn start_tcp(lb: LoadBalancer) -> Result<Self, BalancerError> {
        let listener =
            TcpListener::bind(lb.bind_address)
                .await
                .map_err(|source| BalancerError::Bind {
                    address: lb.bind_address,
                    source,
                })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BalancerError::Bind {
                address: lb.bind_address,
                source,
            })?;

        let ctx = Arc::new(RelayContext {
            name: lb.name.clone(),
            pool: BackendPool::new(lb.backends),
            dial_timeout: lb.dial_timeout,
            dial_rounds: lb.dial_rounds.max(1),
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(listener, ctx, stop_rx));

        debug!("Load Balancer [{}] listening on {}", lb.name, local_addr);

        Ok(Self {
            name: lb.name,
            local_addr,
            stop: Some(stop_tx),
            accept_task: Some(accept_task),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the listener is actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait until the listener is closed
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!("Load Balancer [{}] accept loop failed: {}", self.name, e);
            }
        }
        debug!("Load Balancer instance [{}] has stopped", self.name);
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<RelayContext>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        relay_connection(stream, peer, ctx).await;
                    });
                }
                Err(e) => {
                    error!("Load Balancer [{}] TCP Accept error [{}]", ctx.name, e);
                    tokio::select! {
                        biased;

                        _ = &mut stop => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => {}
                    }
                }
            },
        }
    }
    // Listener is dropped here, closing the socket before stop() returns
}

async fn relay_connection(mut frontend: TcpStream, peer: SocketAddr, ctx: Arc<RelayContext>) {
    let mut backend = match dial_backend(peer, &ctx).await {
        Some(stream) => stream,
        None => return,
    };

    match tokio::io::copy_bidirectional(&mut frontend, &mut backend).await {
        Ok((sent, received)) => {
            debug!(
                "[{}] closed: {} bytes to backend, {} bytes to client",
                peer, sent, received
            );
        }
        Err(e) => {
            debug!("[{}] relay error: {}", peer, e);
        }
    }
}

/// Dial backends in rotation until one accepts.
///
/// Each pass claims one position from the shared rotation and then walks the
/// whole pool from there, so every backend is tried once per pass no matter
/// how other connections move the cursor. After `dial_rounds` passes the
/// client connection is given up on; between passes the task backs off so an
/// all-down pool does not spin.
async fn dial_backend(peer: SocketAddr, ctx: &RelayContext) -> Option<TcpStream> {
    let mut backoff = INITIAL_BACKOFF;

    for round in 0..ctx.dial_rounds {
        if round > 0 {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        let start = match ctx.pool.next_index() {
            Ok(index) => index,
            Err(e) => {
                error!("Load Balancer [{}]: {}", ctx.name, e);
                return None;
            }
        };

        for offset in 0..ctx.pool.len() {
            let Some(backend) = ctx.pool.address_at(start + offset) else {
                return None;
            };

            match tokio::time::timeout(ctx.dial_timeout, TcpStream::connect(backend)).await {
                Ok(Ok(stream)) => {
                    debug!("[{}]--->[ACCEPT]--->[{}]", peer, backend);
                    return Some(stream);
                }
                Ok(Err(e)) => {
                    warn!("[{}]---X [FAILED] X-->[{}]: {}", peer, backend, e);
                }
                Err(_) => {
                    warn!("[{}]---X [FAILED] X-->[{}]: dial timed out", peer, backend);
                }
            }
        }
    }

    info!(
        "Load Balancer [{}]: dropping connection from {}, no backend reachable after {} rounds",
        ctx.name, peer, ctx.dial_rounds
    );
    None
}
