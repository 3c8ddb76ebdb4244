//! VIP ownership through iproute2

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::process::Command;
use tracing::debug;

use super::{NetworkError, VipManager};

/// Manages `<vip>/32` on one interface by running the `ip` tool
#[derive(Debug, Clone)]
pub struct IpCommandVip {
    network: Ipv4Net,
    interface: String,
}

impl IpCommandVip {
    pub fn new(address: Ipv4Addr, interface: impl Into<String>) -> Self {
        Self {
            network: Ipv4Net::from(address),
            interface: interface.into(),
        }
    }

    /// Loopback VIPs are host-scoped so they are not advertised off-box
    fn scope(&self) -> Option<&'static str> {
        (self.interface == "lo").then_some("host")
    }

    async fn run_ip(&self, args: &[&str]) -> Result<String, NetworkError> {
        let output = Command::new("ip").args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if stderr.contains("does not exist") || stderr.contains("Cannot find device") {
                return Err(NetworkError::InterfaceNotFound(self.interface.clone()));
            }
            return Err(NetworkError::Command {
                command: format!("ip {}", args.join(" ")),
                status: output.status.to_string(),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl VipManager for IpCommandVip {
    async fn exists(&self) -> Result<bool, NetworkError> {
        let stdout = self
            .run_ip(&["-4", "addr", "show", "dev", &self.interface])
            .await?;
        Ok(parse_inet_addresses(&stdout)
            .iter()
            .any(|net| *net == self.network))
    }

    async fn add(&self) -> Result<(), NetworkError> {
        if self.exists().await? {
            return Ok(());
        }
        debug!("Add vip: {}", self.network.addr());

        let net = self.network.to_string();
        let mut args = vec!["addr", "add", net.as_str(), "dev", self.interface.as_str()];
        if let Some(scope) = self.scope() {
            args.extend(["scope", scope]);
        }
        self.run_ip(&args).await.map(|_| ())
    }

    async fn delete(&self) -> Result<(), NetworkError> {
        if !self.exists().await? {
            return Ok(());
        }
        debug!("Delete vip: {}", self.network.addr());

        let net = self.network.to_string();
        self.run_ip(&["addr", "del", net.as_str(), "dev", self.interface.as_str()])
            .await
            .map(|_| ())
    }

    fn address(&self) -> Ipv4Addr {
        self.network.addr()
    }

    fn interface_name(&self) -> &str {
        &self.interface
    }
}

/// Extract the `inet` entries from `ip -4 addr show` output
pub fn parse_inet_addresses(output: &str) -> Vec<Ipv4Net> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("inet") => fields.next()?.parse().ok(),
                _ => None,
            }
        })
        .collect()
}
