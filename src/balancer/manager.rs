//! Load Balancer Manager
//!
//! Owns every running load balancer instance and starts/stops them as a
//! group on behalf of the cluster controller.

use std::net::SocketAddr;

use futures_util::future::join_all;
use tracing::info;

use super::instance::LoadBalancerInstance;
use super::{BalancerError, LoadBalancer, PROTOCOL_TCP};

/// Manages all load balancer instances of a node
#[derive(Default)]
pub struct LoadBalancerManager {
    instances: Vec<LoadBalancerInstance>,
}

impl LoadBalancerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the protocol, start an instance, and take ownership of it
    pub async fn add_load_balancer(&mut self, lb: LoadBalancer) -> Result<SocketAddr, BalancerError> {
        if !lb.protocol.eq_ignore_ascii_case(PROTOCOL_TCP) {
            return Err(BalancerError::UnsupportedProtocol {
                name: lb.name,
                protocol: lb.protocol,
            });
        }

        let instance = LoadBalancerInstance::start_tcp(lb).await?;
        let addr = instance.local_addr();
        self.instances.push(instance);
        Ok(addr)
    }

    /// Stop every instance and wait for each to confirm
    pub async fn stop_all(&mut self) {
        info!("Stopping {} load balancer(s)", self.instances.len());
        join_all(self.instances.iter_mut().map(|instance| instance.stop())).await;
        self.instances.clear();
    }

    /// Bound addresses of all running instances, by name
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.instances
            .iter()
            .map(|i| (i.name().to_string(), i.local_addr()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
