//! Host Networking
//!
//! Capabilities the cluster controller needs from the host: owning the VIP on
//! an interface, announcing it to the segment, and probing TCP endpoints.
//!
//! # Components
//!
//! - **VipManager**: add/delete/query the `/32` VIP on one interface
//! - **Announcer**: gratuitous ARP reply for the VIP
//! - **check_tcp_address**: connect-with-timeout health probe

mod arp;
mod vip;

pub use arp::ArpAnnouncer;
pub use vip::{parse_inet_addresses, IpCommandVip};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Error type for host networking operations
#[derive(Debug)]
pub enum NetworkError {
    /// I/O error
    Io(std::io::Error),
    /// An external command exited unsuccessfully
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    /// The named interface does not exist
    InterfaceNotFound(String),
    /// The interface has no usable Ethernet hardware address
    InvalidHardwareAddress(String),
    /// Operation is not available on this platform
    Unsupported(&'static str),
    /// A connect attempt did not finish in time
    Timeout { address: String, timeout: Duration },
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Io(e) => write!(f, "I/O error: {}", e),
            NetworkError::Command {
                command,
                status,
                stderr,
            } => write!(f, "'{}' failed ({}): {}", command, status, stderr.trim()),
            NetworkError::InterfaceNotFound(name) => {
                write!(f, "failed to get interface {}", name)
            }
            NetworkError::InvalidHardwareAddress(addr) => {
                write!(f, "{}: is not an Ethernet MAC address", addr)
            }
            NetworkError::Unsupported(what) => write!(f, "{} is not supported on this platform", what),
            NetworkError::Timeout { address, timeout } => {
                write!(f, "dial {} timed out after {:?}", address, timeout)
            }
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        NetworkError::Io(e)
    }
}

/// Ownership of a single VIP on a single interface.
///
/// `add` and `delete` are idempotent: adding a present address or deleting an
/// absent one succeeds without touching the interface.
#[async_trait]
pub trait VipManager: Send + Sync {
    async fn exists(&self) -> Result<bool, NetworkError>;

    async fn add(&self) -> Result<(), NetworkError>;

    async fn delete(&self) -> Result<(), NetworkError>;

    fn address(&self) -> Ipv4Addr;

    fn interface_name(&self) -> &str;
}

/// Broadcasts that an address now lives on this host
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, address: Ipv4Addr, interface: &str) -> Result<(), NetworkError>;
}

/// Open a TCP connection to `address` and close it again
pub async fn check_tcp_address(address: &str, timeout: Duration) -> Result<(), NetworkError> {
    debug!("Check address {}, timeout: {:?}", address, timeout);
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(NetworkError::Io(e)),
        Err(_) => Err(NetworkError::Timeout {
            address: address.to_string(),
            timeout,
        }),
    }
}

/// True if `ip` is assigned to this host.
///
/// Binding succeeds only for local addresses, so a throwaway UDP bind on an
/// ephemeral port answers the question without enumerating interfaces.
pub fn is_local_address(ip: IpAddr) -> bool {
    if ip.is_unspecified() {
        return false;
    }
    std::net::UdpSocket::bind((ip, 0)).is_ok()
}

/// True when running with an effective uid of root
pub fn is_privileged() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_check_tcp_address_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        check_tcp_address(&addr, Duration::from_millis(500))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_check_tcp_address_refused() {
        // Reserve a port, then close it so nothing is listening
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let err = check_tcp_address(&addr, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Io(_)));
    }

    #[tokio::test]
    async fn test_check_tcp_address_unresolvable() {
        assert!(check_tcp_address("not an address", Duration::from_millis(200))
            .await
            .is_err());
    }

    #[test]
    fn test_loopback_is_local() {
        assert!(is_local_address(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(!is_local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        // TEST-NET-3, never assigned to a test host
        assert!(!is_local_address("203.0.113.77".parse().unwrap()));
    }
}
