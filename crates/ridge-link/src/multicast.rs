//! UDP multicast links: one receive socket joined to the group, one send
//! socket whose local address identifies our own datagrams.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::{Endpoint, LinkError};

const UDP_MTU: usize = 1472;

#[derive(Debug)]
pub struct UdpMulticastLink {
    rx: UdpSocket,
    tx: UdpSocket,
    group: SocketAddr,
    local: SocketAddr,
}

impl UdpMulticastLink {
    /// Join `endpoint`'s multicast group. The optional `#iface=` option
    /// names the interface: an IPv4 address for v4 groups, an interface
    /// name for v6 groups.
    pub async fn open(endpoint: &Endpoint) -> Result<Self, LinkError> {
        let group = endpoint.socket_addr()?;
        if !group.ip().is_multicast() {
            return Err(LinkError::LocatorInvalid(endpoint.to_string()));
        }
        let iface = endpoint.config_get("iface");

        let rx = make_recv_socket(&group, iface)?;
        let tx = make_send_socket(&group, iface, endpoint)?;

        let rx = UdpSocket::from_std(rx.into()).map_err(LinkError::Rx)?;
        let tx = UdpSocket::from_std(tx.into()).map_err(LinkError::Tx)?;
        let local = tx.local_addr().map_err(LinkError::Tx)?;

        tracing::debug!(group = %group, local = %local, "multicast link open");
        Ok(Self {
            rx,
            tx,
            group,
            local,
        })
    }

    pub fn group(&self) -> SocketAddr {
        self.group
    }

    /// The send socket's address; receivers use it to drop our own datagrams.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn mtu(&self) -> usize {
        UDP_MTU
    }

    pub async fn send_batch(&self, batch: &[u8]) -> Result<(), LinkError> {
        self.tx
            .send_to(batch, self.group)
            .await
            .map_err(LinkError::Tx)?;
        Ok(())
    }

    pub async fn recv_batch(&self) -> Result<(Bytes, Option<SocketAddr>), LinkError> {
        loop {
            let mut buf = vec![0u8; UDP_MTU];
            let (n, src) = self.rx.recv_from(&mut buf).await.map_err(LinkError::Rx)?;
            if self.is_own(&src) {
                continue;
            }
            buf.truncate(n);
            return Ok((Bytes::from(buf), Some(src)));
        }
    }

    /// Loopback of our own transmissions. The send socket binds to the
    /// unspecified address, so its IP compares as a wildcard.
    fn is_own(&self, src: &SocketAddr) -> bool {
        src.port() == self.local.port()
            && (self.local.ip().is_unspecified() || src.ip() == self.local.ip())
    }
}

fn make_recv_socket(group: &SocketAddr, iface: Option<&str>) -> Result<Socket, LinkError> {
    let domain = if group.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(LinkError::Rx)?;
    socket.set_reuse_address(true).map_err(LinkError::Rx)?;
    socket.set_nonblocking(true).map_err(LinkError::Rx)?;

    match group {
        SocketAddr::V4(g) => {
            let iface_addr = parse_v4_iface(iface)?;
            let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, g.port()).into();
            socket.bind(&bind.into()).map_err(LinkError::Rx)?;
            socket
                .join_multicast_v4(g.ip(), &iface_addr)
                .map_err(LinkError::Rx)?;
        }
        SocketAddr::V6(g) => {
            let index = iface.map(if_index).transpose()?.unwrap_or(0);
            let bind: SocketAddr = (Ipv6Addr::UNSPECIFIED, g.port()).into();
            socket.bind(&bind.into()).map_err(LinkError::Rx)?;
            socket
                .join_multicast_v6(g.ip(), index)
                .map_err(LinkError::Rx)?;
        }
    }
    Ok(socket)
}

fn make_send_socket(
    group: &SocketAddr,
    iface: Option<&str>,
    endpoint: &Endpoint,
) -> Result<Socket, LinkError> {
    let domain = if group.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(LinkError::Tx)?;
    socket.set_nonblocking(true).map_err(LinkError::Tx)?;

    let ttl: u32 = match endpoint.config_get("ttl") {
        Some(v) => v
            .parse()
            .map_err(|_| LinkError::LocatorInvalid(endpoint.to_string()))?,
        // Link-local by default; do not route beyond this segment.
        None => 1,
    };

    match group {
        SocketAddr::V4(_) => {
            let iface_addr = parse_v4_iface(iface)?;
            socket
                .set_multicast_if_v4(&iface_addr)
                .map_err(LinkError::Tx)?;
            socket.set_multicast_ttl_v4(ttl).map_err(LinkError::Tx)?;
            let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
            socket.bind(&bind.into()).map_err(LinkError::Tx)?;
        }
        SocketAddr::V6(_) => {
            let index = iface.map(if_index).transpose()?.unwrap_or(0);
            socket.set_multicast_if_v6(index).map_err(LinkError::Tx)?;
            socket
                .set_multicast_hops_v6(ttl)
                .map_err(LinkError::Tx)?;
            let bind: SocketAddr = (Ipv6Addr::UNSPECIFIED, 0).into();
            socket.bind(&bind.into()).map_err(LinkError::Tx)?;
        }
    }
    Ok(socket)
}

/// For v4 groups the interface is named by one of its addresses.
fn parse_v4_iface(iface: Option<&str>) -> Result<Ipv4Addr, LinkError> {
    match iface {
        None => Ok(Ipv4Addr::UNSPECIFIED),
        Some(s) => s
            .parse()
            .map_err(|_| LinkError::LocatorInvalid(format!("iface={s}"))),
    }
}

/// OS interface index for a named network interface.
fn if_index(name: &str) -> Result<u32, LinkError> {
    let cstr = std::ffi::CString::new(name)
        .map_err(|_| LinkError::LocatorInvalid(format!("iface={name}")))?;
    let index = unsafe { libc::if_nametoindex(cstr.as_ptr()) };
    if index == 0 {
        return Err(LinkError::LocatorInvalid(format!("iface={name}")));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_multicast_round_trips() {
        // Needs a host that allows joining a group on loopback-capable
        // interfaces; skip quietly where the environment forbids it.
        let ep = Endpoint::parse("udp/224.0.0.224:0#iface=127.0.0.1").unwrap();
        let link = match UdpMulticastLink::open(&ep).await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("SKIP: multicast unavailable ({e})");
                return;
            }
        };
        assert!(link.group().ip().is_multicast());
    }
}
