//! ridge-link — capability-tagged byte pipes under the transports.
//!
//! A link moves whole batches of bytes. Stream links (TCP) prefix every
//! batch with a little-endian u16 length; datagram links map one batch to
//! one datagram. The codec never sees the difference.

pub mod endpoint;

mod multicast;
mod tcp;
mod udp;

pub use endpoint::{Endpoint, Scheme};
pub use multicast::UdpMulticastLink;
pub use tcp::{TcpLink, TcpLinkListener};
pub use udp::UdpLink;

use std::net::SocketAddr;

use bytes::Bytes;

/// Errors raised by links and endpoint parsing.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("invalid locator: {0}")]
    LocatorInvalid(String),

    #[error("unknown locator scheme: {0}")]
    UnknownScheme(String),

    #[error("{0} links are not supported by this build")]
    Unsupported(&'static str),

    #[error("link tx failed: {0}")]
    Tx(#[source] std::io::Error),

    #[error("link rx failed: {0}")]
    Rx(#[source] std::io::Error),

    #[error("link is closed")]
    Closed,
}

/// How a link moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Stream,
    Datagram,
}

/// What a link can promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCapabilities {
    pub reliable: bool,
    pub flow: Flow,
    pub multicast: bool,
}

/// A connected link of any supported scheme.
#[derive(Debug)]
pub enum Link {
    Tcp(TcpLink),
    Udp(UdpLink),
    UdpMulticast(UdpMulticastLink),
}

impl Link {
    /// Dial `endpoint`. Multicast addresses on the `udp` scheme open a
    /// group link; everything else is point-to-point.
    pub async fn open(endpoint: &Endpoint) -> Result<Link, LinkError> {
        match endpoint.scheme {
            Scheme::Tcp => Ok(Link::Tcp(TcpLink::connect(endpoint).await?)),
            Scheme::Udp => {
                let addr = endpoint.socket_addr()?;
                if addr.ip().is_multicast() {
                    Ok(Link::UdpMulticast(UdpMulticastLink::open(endpoint).await?))
                } else {
                    Ok(Link::Udp(UdpLink::connect(endpoint).await?))
                }
            }
            Scheme::Tls => Err(LinkError::Unsupported("tls")),
            Scheme::Ws => Err(LinkError::Unsupported("ws")),
            Scheme::Wss => Err(LinkError::Unsupported("wss")),
            Scheme::Serial => Err(LinkError::Unsupported("serial")),
            Scheme::Bt => Err(LinkError::Unsupported("bt")),
            Scheme::RawEth => Err(LinkError::Unsupported("reth")),
        }
    }

    pub fn capabilities(&self) -> LinkCapabilities {
        match self {
            Link::Tcp(_) => LinkCapabilities {
                reliable: true,
                flow: Flow::Stream,
                multicast: false,
            },
            Link::Udp(_) => LinkCapabilities {
                reliable: false,
                flow: Flow::Datagram,
                multicast: false,
            },
            Link::UdpMulticast(_) => LinkCapabilities {
                reliable: false,
                flow: Flow::Datagram,
                multicast: true,
            },
        }
    }

    /// Largest batch this link can carry.
    pub fn mtu(&self) -> usize {
        match self {
            Link::Tcp(l) => l.mtu(),
            Link::Udp(l) => l.mtu(),
            Link::UdpMulticast(l) => l.mtu(),
        }
    }

    /// Send one batch. Stream links add the length prefix here.
    pub async fn send_batch(&self, batch: &[u8]) -> Result<(), LinkError> {
        match self {
            Link::Tcp(l) => l.send_batch(batch).await,
            Link::Udp(l) => l.send_batch(batch).await,
            Link::UdpMulticast(l) => l.send_batch(batch).await,
        }
    }

    /// Receive one whole batch. Datagram links also report the sender.
    pub async fn recv_batch(&self) -> Result<(Bytes, Option<SocketAddr>), LinkError> {
        match self {
            Link::Tcp(l) => l.recv_batch().await.map(|b| (b, None)),
            Link::Udp(l) => l.recv_batch().await,
            Link::UdpMulticast(l) => l.recv_batch().await,
        }
    }

    pub async fn close(&self) {
        match self {
            Link::Tcp(l) => l.close().await,
            Link::Udp(_) | Link::UdpMulticast(_) => {}
        }
    }
}

/// Bind a listener for `endpoint`. Only stream schemes accept.
pub async fn listen(endpoint: &Endpoint) -> Result<TcpLinkListener, LinkError> {
    match endpoint.scheme {
        Scheme::Tcp => TcpLinkListener::bind(endpoint).await,
        Scheme::Udp => Err(LinkError::Unsupported("udp listen")),
        Scheme::Tls => Err(LinkError::Unsupported("tls")),
        Scheme::Ws => Err(LinkError::Unsupported("ws")),
        Scheme::Wss => Err(LinkError::Unsupported("wss")),
        Scheme::Serial => Err(LinkError::Unsupported("serial")),
        Scheme::Bt => Err(LinkError::Unsupported("bt")),
        Scheme::RawEth => Err(LinkError::Unsupported("reth")),
    }
}
