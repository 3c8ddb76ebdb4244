//! Gratuitous ARP
//!
//! The announcement is an ARP reply (opcode 2) whose sender is the VIP and the
//! interface MAC, sent to the Ethernet broadcast address so every neighbour
//! refreshes its cache entry for the VIP.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tracing::debug;

use super::{Announcer, NetworkError};

const OP_ARP_REPLY: u16 = 2;
const HW_TYPE_ETHERNET: u16 = 1;
const PROTO_TYPE_IPV4: u16 = 0x0800;
const HW_LEN: usize = 6;
const ARP_PACKET_LEN: usize = 28;

const ETHERNET_BROADCAST: [u8; HW_LEN] = [0xff; HW_LEN];

/// Sends gratuitous ARP replies through a raw packet socket
#[derive(Debug, Default, Clone, Copy)]
pub struct ArpAnnouncer;

impl ArpAnnouncer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Announcer for ArpAnnouncer {
    async fn announce(&self, address: Ipv4Addr, interface: &str) -> Result<(), NetworkError> {
        let interface = interface.to_string();
        tokio::task::spawn_blocking(move || imp::send_gratuitous(address, &interface))
            .await
            .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?
    }
}

/// Build the ARP payload (without the Ethernet header, which the kernel adds)
pub fn build_gratuitous_reply(mac: [u8; HW_LEN], address: Ipv4Addr) -> [u8; ARP_PACKET_LEN] {
    let mut packet = [0u8; ARP_PACKET_LEN];
    packet[0..2].copy_from_slice(&HW_TYPE_ETHERNET.to_be_bytes());
    packet[2..4].copy_from_slice(&PROTO_TYPE_IPV4.to_be_bytes());
    packet[4] = HW_LEN as u8;
    packet[5] = 4;
    packet[6..8].copy_from_slice(&OP_ARP_REPLY.to_be_bytes());
    packet[8..14].copy_from_slice(&mac);
    packet[14..18].copy_from_slice(&address.octets());
    packet[18..24].copy_from_slice(&ETHERNET_BROADCAST);
    packet[24..28].copy_from_slice(&Ipv4Addr::BROADCAST.octets());
    packet
}

/// Parse a colon-separated Ethernet MAC such as `52:54:00:12:34:56`
pub fn parse_hardware_address(text: &str) -> Result<[u8; HW_LEN], NetworkError> {
    let text = text.trim();
    let invalid = || NetworkError::InvalidHardwareAddress(text.to_string());

    let octets = text
        .split(':')
        .map(|part| u8::from_str_radix(part, 16).map_err(|_| invalid()))
        .collect::<Result<Vec<u8>, _>>()?;

    octets.try_into().map_err(|_| invalid())
}

#[cfg(target_os = "linux")]
mod imp {
    use std::ffi::CString;

    use socket2::{Domain, Protocol, SockAddr, Socket, Type};

    use super::*;

    const ETH_P_ARP: u16 = 0x0806;

    pub(super) fn send_gratuitous(address: Ipv4Addr, interface: &str) -> Result<(), NetworkError> {
        let index = interface_index(interface)?;
        let mac = std::fs::read_to_string(format!("/sys/class/net/{}/address", interface))
            .map_err(|_| NetworkError::InterfaceNotFound(interface.to_string()))
            .and_then(|text| parse_hardware_address(&text))?;

        debug!(
            "Broadcasting ARP update for {} ({}) via {}",
            address,
            format_mac(&mac),
            interface
        );

        let socket = Socket::new(
            Domain::PACKET,
            Type::DGRAM,
            Some(Protocol::from(i32::from(ETH_P_ARP.to_be()))),
        )?;
        socket.bind_device(Some(interface.as_bytes()))?;

        let packet = build_gratuitous_reply(mac, address);
        socket.send_to(&packet, &link_layer_broadcast(index))?;
        Ok(())
    }

    fn interface_index(interface: &str) -> Result<u32, NetworkError> {
        let name = CString::new(interface)
            .map_err(|_| NetworkError::InterfaceNotFound(interface.to_string()))?;
        // SAFETY: name is a valid NUL-terminated string for the duration of the call
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            return Err(NetworkError::InterfaceNotFound(interface.to_string()));
        }
        Ok(index)
    }

    pub(super) fn link_layer_broadcast(index: u32) -> SockAddr {
        // SAFETY: both structs are plain old data, so all-zero is a valid value
        let mut ll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        ll.sll_family = libc::AF_PACKET as libc::c_ushort;
        ll.sll_protocol = ETH_P_ARP.to_be();
        ll.sll_ifindex = index as libc::c_int;
        ll.sll_hatype = HW_TYPE_ETHERNET;
        ll.sll_halen = HW_LEN as u8;
        ll.sll_addr[..HW_LEN].copy_from_slice(&ETHERNET_BROADCAST);

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        // SAFETY: sockaddr_storage is larger than sockaddr_ll
        unsafe {
            std::ptr::write_unaligned(
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_ll,
                ll,
            );
            SockAddr::new(
                storage,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        }
    }

    fn format_mac(mac: &[u8; HW_LEN]) -> String {
        mac.iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub(super) fn send_gratuitous(address: Ipv4Addr, interface: &str) -> Result<(), NetworkError> {
        debug!("Skipping ARP update for {} via {}", address, interface);
        Err(NetworkError::Unsupported("gratuitous ARP"))
    }
}
