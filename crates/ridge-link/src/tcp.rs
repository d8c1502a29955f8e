//! TCP links: reliable, streamed, length-prefixed batches.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::{Endpoint, LinkError};

/// Bytes of batch-length prefix on stream links.
const LEN_PREFIX: usize = 2;

/// A connected TCP link.
///
/// The read and write halves live behind separate locks: the read task owns
/// the rx side, the send path the tx side, and they never contend.
#[derive(Debug)]
pub struct TcpLink {
    rx: Mutex<ReadHalfState>,
    tx: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
}

#[derive(Debug)]
struct ReadHalfState {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl TcpLink {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, LinkError> {
        let addr = endpoint.socket_addr()?;
        let stream = TcpStream::connect(addr).await.map_err(LinkError::Tx)?;
        Ok(Self::from_stream(stream, addr))
    }

    pub(crate) fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Self {
            rx: Mutex::new(ReadHalfState {
                half: read,
                buf: BytesMut::with_capacity(u16::MAX as usize),
            }),
            tx: Mutex::new(write),
            peer,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Stream batches are capped by the u16 length prefix.
    pub fn mtu(&self) -> usize {
        u16::MAX as usize
    }

    pub async fn send_batch(&self, batch: &[u8]) -> Result<(), LinkError> {
        debug_assert!(batch.len() <= u16::MAX as usize);
        let mut tx = self.tx.lock().await;
        tx.write_all(&(batch.len() as u16).to_le_bytes())
            .await
            .map_err(LinkError::Tx)?;
        tx.write_all(batch).await.map_err(LinkError::Tx)?;
        tx.flush().await.map_err(LinkError::Tx)
    }

    /// Read one length-prefixed batch. A zero length is an empty batch;
    /// the next length is read immediately.
    pub async fn recv_batch(&self) -> Result<Bytes, LinkError> {
        let mut guard = self.rx.lock().await;
        let rx = &mut *guard;
        loop {
            let mut len_bytes = [0u8; LEN_PREFIX];
            rx.half
                .read_exact(&mut len_bytes)
                .await
                .map_err(LinkError::Rx)?;
            let len = u16::from_le_bytes(len_bytes) as usize;
            if len == 0 {
                continue;
            }
            rx.buf.resize(len, 0);
            rx.half
                .read_exact(&mut rx.buf[..])
                .await
                .map_err(LinkError::Rx)?;
            return Ok(rx.buf.split().freeze());
        }
    }

    pub async fn close(&self) {
        let mut tx = self.tx.lock().await;
        let _ = tx.shutdown().await;
    }
}

/// An accepting TCP endpoint.
#[derive(Debug)]
pub struct TcpLinkListener {
    inner: TcpListener,
}

impl TcpLinkListener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, LinkError> {
        let addr = endpoint.socket_addr()?;
        let inner = TcpListener::bind(addr).await.map_err(LinkError::Tx)?;
        Ok(Self { inner })
    }

    /// The bound address, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        self.inner.local_addr().map_err(LinkError::Rx)
    }

    pub async fn accept(&self) -> Result<TcpLink, LinkError> {
        let (stream, peer) = self.inner.accept().await.map_err(LinkError::Rx)?;
        Ok(TcpLink::from_stream(stream, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batches_round_trip_over_localhost() {
        let listener = TcpLinkListener::bind(&Endpoint::parse("tcp/127.0.0.1:0").unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let ep = Endpoint::parse(&format!("tcp/{addr}")).unwrap();
            let link = TcpLink::connect(&ep).await.unwrap();
            link.send_batch(b"first").await.unwrap();
            link.send_batch(&[0xab; 1000]).await.unwrap();
            link
        });

        let server = listener.accept().await.unwrap();
        let first = server.recv_batch().await.unwrap();
        assert_eq!(first.as_ref(), b"first");
        let second = server.recv_batch().await.unwrap();
        assert_eq!(second.as_ref(), &[0xab; 1000][..]);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn zero_length_batches_are_skipped() {
        let listener = TcpLinkListener::bind(&Endpoint::parse("tcp/127.0.0.1:0").unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let link = TcpLink::from_stream(stream, addr);
            // An empty batch, then a real one.
            link.send_batch(&[]).await.unwrap();
            link.send_batch(b"data").await.unwrap();
            link
        });

        let server = listener.accept().await.unwrap();
        let batch = server.recv_batch().await.unwrap();
        assert_eq!(batch.as_ref(), b"data");
        client.await.unwrap();
    }
}
