//! UDP unicast links: unreliable datagrams, one batch per datagram.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::{Endpoint, LinkError};

/// Conservative datagram payload: ethernet MTU minus IP/UDP headers.
const UDP_MTU: usize = 1472;

#[derive(Debug)]
pub struct UdpLink {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpLink {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, LinkError> {
        let peer = endpoint.socket_addr()?;
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(LinkError::Tx)?;
        socket.connect(peer).await.map_err(LinkError::Tx)?;
        Ok(Self { socket, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn mtu(&self) -> usize {
        UDP_MTU
    }

    pub async fn send_batch(&self, batch: &[u8]) -> Result<(), LinkError> {
        self.socket.send(batch).await.map_err(LinkError::Tx)?;
        Ok(())
    }

    pub async fn recv_batch(&self) -> Result<(Bytes, Option<SocketAddr>), LinkError> {
        let mut buf = vec![0u8; UDP_MTU];
        let (n, src) = self.socket.recv_from(&mut buf).await.map_err(LinkError::Rx)?;
        buf.truncate(n);
        Ok((Bytes::from(buf), Some(src)))
    }
}
