//! Multicast transport: N peers over one group link.
//!
//! There is no handshake. Peers discover each other through periodic JOIN
//! messages and die by lease. FRAME and FRAGMENT carry no peer identity;
//! the sender is the datagram's source address.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use ridge_link::Link;
use ridge_proto::codec::{network as ncodec, transport as tcodec};
use ridge_proto::core::{close_reason, PROTOCOL_VERSION};
use ridge_proto::iobuf::ZBuf;
use ridge_proto::msg::{
    Close, Fragment, Frame, Join, KeepAlive, NetworkMessage, Reliability, TransportMessage,
};
use ridge_proto::{CongestionControl, PeerId, WhatAmI};

use crate::common::{
    self, sn_decrement, sn_precedes, sn_random, transmit_transport, TransportConfig, TxState,
};
use crate::defrag::DefragBuffer;
use crate::{DisconnectReason, TransportError, TransportEventHandler};

/// An open multicast transport. Cheap to clone.
#[derive(Clone)]
pub struct TransportMulticast {
    inner: Arc<Inner>,
}

struct Inner {
    link: Link,
    cfg: TransportConfig,
    tx: AsyncMutex<TxState>,
    /// Peers keyed by datagram source address.
    peers: DashMap<SocketAddr, MulticastPeer>,
    transmitted: AtomicBool,
    open: AtomicBool,
    handler: Arc<dyn TransportEventHandler>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Everything tracked per discovered peer.
struct MulticastPeer {
    zid: PeerId,
    whatami: WhatAmI,
    sn_resolution: u64,
    lease: Duration,
    next_lease: Duration,
    received: bool,
    sn_reliable: u64,
    sn_best_effort: u64,
    defrag_reliable: DefragBuffer,
    defrag_best_effort: DefragBuffer,
}

impl MulticastPeer {
    fn from_join(join: &Join, defrag_budget: usize) -> Self {
        let res = join.sn_resolution;
        Self {
            zid: join.zid,
            whatami: join.whatami,
            sn_resolution: res,
            lease: Duration::from_millis(join.lease_ms.max(1)),
            next_lease: Duration::from_millis(join.lease_ms.max(1)),
            received: true,
            sn_reliable: sn_decrement(res, join.next_sn_reliable),
            sn_best_effort: sn_decrement(res, join.next_sn_best_effort),
            defrag_reliable: DefragBuffer::new(defrag_budget),
            defrag_best_effort: DefragBuffer::new(defrag_budget),
        }
    }

    fn channel(&mut self, reliability: Reliability) -> (&mut u64, &mut DefragBuffer) {
        match reliability {
            Reliability::Reliable => (&mut self.sn_reliable, &mut self.defrag_reliable),
            Reliability::BestEffort => (&mut self.sn_best_effort, &mut self.defrag_best_effort),
        }
    }
}

impl TransportMulticast {
    /// Open the group link's transport: announce ourselves and start the
    /// read and lease tasks.
    pub async fn open(
        link: Link,
        cfg: TransportConfig,
        handler: Arc<dyn TransportEventHandler>,
    ) -> Result<Self, TransportError> {
        debug_assert!(link.capabilities().multicast);
        let mtu = link.mtu().min(cfg.batch_size as usize);
        let initial_sn = sn_random(cfg.sn_resolution);
        let (shutdown, _) = broadcast::channel(1);

        let inner = Arc::new(Inner {
            link,
            tx: AsyncMutex::new(TxState::new(mtu, cfg.sn_resolution, initial_sn)),
            peers: DashMap::new(),
            transmitted: AtomicBool::new(false),
            open: AtomicBool::new(true),
            handler,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            cfg,
        });

        // First JOIN goes out immediately so existing peers learn us fast.
        {
            let mut tx = inner.tx.lock().await;
            let join = make_join(&inner, &tx);
            transmit_transport(&inner.link, &mut tx, &join).await?;
        }

        tracing::info!(zid = %inner.cfg.zid, "multicast transport open");

        let read = tokio::spawn(read_task(inner.clone(), inner.shutdown.subscribe()));
        let lease = tokio::spawn(lease_task(inner.clone(), inner.shutdown.subscribe()));
        inner.tasks.lock().unwrap().extend([read, lease]);

        Ok(Self { inner })
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Number of currently known peers.
    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub async fn send(
        &self,
        msg: &NetworkMessage,
        reliability: Reliability,
        congestion: CongestionControl,
    ) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let mut tx = match congestion {
            CongestionControl::Block => self.inner.tx.lock().await,
            CongestionControl::Drop => match self.inner.tx.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::debug!("tx congested, dropping message");
                    return Ok(());
                }
            },
        };
        common::transmit(&self.inner.link, &mut tx, msg, reliability).await?;
        self.inner.transmitted.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Leave the group: send CLOSE, stop tasks, evict every peer.
    pub async fn close(&self, reason: u8) {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut tx = self.inner.tx.lock().await;
            let _ = transmit_transport(
                &self.inner.link,
                &mut tx,
                &TransportMessage::Close(Close { reason }),
            )
            .await;
        }
        let _ = self.inner.shutdown.send(());

        let handles: Vec<_> = self.inner.tasks.lock().unwrap().drain(..).collect();
        let bound = self.inner.cfg.lease_tick() + Duration::from_millis(1);
        for handle in handles {
            let _ = timeout(bound, handle).await;
        }
        self.inner.peers.clear();
    }
}

fn make_join(inner: &Inner, tx: &TxState) -> TransportMessage {
    TransportMessage::Join(Join {
        version: PROTOCOL_VERSION,
        whatami: inner.cfg.whatami,
        zid: inner.cfg.zid,
        sn_resolution: inner.cfg.sn_resolution,
        batch_size: inner.cfg.batch_size,
        lease_ms: inner.cfg.lease_ms,
        next_sn_reliable: tx.peek_sn(Reliability::Reliable),
        next_sn_best_effort: tx.peek_sn(Reliability::BestEffort),
    })
}

// ── Read task ─────────────────────────────────────────────────────────────────

async fn read_task(inner: Arc<Inner>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            res = inner.link.recv_batch() => {
                let (batch, src) = match res {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "multicast read failed");
                        continue;
                    }
                };
                let Some(src) = src else { continue };
                handle_batch(&inner, batch, src);
            }
        }
    }
}

fn handle_batch(inner: &Arc<Inner>, batch: bytes::Bytes, src: SocketAddr) {
    let mut r = ZBuf::new(batch);
    while r.can_read() {
        let msg = match tcodec::decode(&mut r) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, %src, "malformed multicast batch dropped");
                if let Some(mut peer) = inner.peers.get_mut(&src) {
                    peer.defrag_reliable.reset();
                }
                return;
            }
        };
        match msg {
            TransportMessage::Join(join) => handle_join(inner, join, src),
            TransportMessage::Frame(f) => handle_frame(inner, f, src),
            TransportMessage::Fragment(f) => handle_fragment(inner, f, src),
            TransportMessage::KeepAlive(KeepAlive) => {
                if let Some(mut peer) = inner.peers.get_mut(&src) {
                    peer.received = true;
                }
            }
            TransportMessage::Close(c) => {
                if let Some((_, peer)) = inner.peers.remove(&src) {
                    tracing::debug!(zid = %peer.zid, reason = c.reason, "peer left the group");
                    inner
                        .handler
                        .peer_disconnected(&peer.zid, DisconnectReason::Closed);
                }
            }
            other => {
                tracing::trace!(?other, "ignoring message on multicast transport");
            }
        }
    }
}

fn handle_join(inner: &Arc<Inner>, join: Join, src: SocketAddr) {
    if join.zid == inner.cfg.zid {
        // Our own JOIN reflected by a multi-homed host.
        return;
    }
    if join.version != PROTOCOL_VERSION {
        tracing::debug!(%src, version = join.version, "ignoring JOIN with foreign version");
        return;
    }

    let mut connected = None;
    match inner.peers.entry(src) {
        dashmap::mapref::entry::Entry::Vacant(e) => {
            tracing::info!(zid = %join.zid, %src, "new multicast peer");
            connected = Some((join.zid, join.whatami));
            e.insert(MulticastPeer::from_join(&join, inner.cfg.defrag_budget));
        }
        dashmap::mapref::entry::Entry::Occupied(mut e) => {
            let peer = e.get_mut();
            if peer.zid != join.zid || peer.sn_resolution != join.sn_resolution {
                // Parameter conflict: evict and re-admit with the new view.
                tracing::warn!(old = %peer.zid, new = %join.zid, "peer conflict, evicting");
                let old_zid = peer.zid;
                *peer = MulticastPeer::from_join(&join, inner.cfg.defrag_budget);
                drop(e);
                inner
                    .handler
                    .peer_disconnected(&old_zid, DisconnectReason::Error);
                connected = Some((join.zid, join.whatami));
            } else {
                peer.received = true;
                peer.next_lease = peer.lease;
            }
        }
    }
    if let Some((zid, whatami)) = connected {
        inner.handler.peer_connected(&zid, whatami);
    }
}

fn handle_frame(inner: &Arc<Inner>, frame: Frame, src: SocketAddr) {
    let zid = {
        // Datagrams from unknown addresses are dropped silently.
        let Some(mut peer) = inner.peers.get_mut(&src) else {
            return;
        };
        peer.received = true;
        let zid = peer.zid;
        let res = peer.sn_resolution;
        let (sn_rx, defrag) = peer.channel(frame.reliability);
        if !sn_precedes(res, *sn_rx, frame.sn) {
            tracing::debug!(sn = frame.sn, %src, "frame out of order, dropped");
            defrag.reset();
            return;
        }
        *sn_rx = frame.sn;
        zid
    };
    for msg in frame.payload {
        inner.handler.handle_message(&zid, msg);
    }
}

fn handle_fragment(inner: &Arc<Inner>, fragment: Fragment, src: SocketAddr) {
    let finalized = {
        let Some(mut peer) = inner.peers.get_mut(&src) else {
            return;
        };
        peer.received = true;
        let zid = peer.zid;
        let res = peer.sn_resolution;
        let (sn_rx, defrag) = peer.channel(fragment.reliability);
        if !sn_precedes(res, *sn_rx, fragment.sn) {
            tracing::debug!(sn = fragment.sn, %src, "fragment out of order, dropped");
            defrag.reset();
            return;
        }
        *sn_rx = fragment.sn;
        if let Err(e) = defrag.push(res, fragment.sn, fragment.payload) {
            tracing::warn!(error = %e, %src, "fragment dropped");
            return;
        }
        if fragment.more {
            None
        } else {
            Some((zid, defrag.finalize()))
        }
    };
    if let Some((zid, mut z)) = finalized {
        match ncodec::decode(&mut z) {
            Ok(msg) => inner.handler.handle_message(&zid, msg),
            Err(e) => tracing::warn!(error = %e, "reassembled message is malformed"),
        }
    }
}

// ── Lease task ────────────────────────────────────────────────────────────────

/// One scheduler serves every peer: tick, decrement, evict the silent.
/// JOIN re-emission and the shared keepalive budget ride the same tick.
async fn lease_task(inner: Arc<Inner>, mut shutdown: broadcast::Receiver<()>) {
    let tick = inner.cfg.lease_tick();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(tick) => {}
        }

        // Re-announce ourselves; JOIN also counts as the keepalive.
        if !inner.transmitted.swap(false, Ordering::Relaxed) {
            let mut tx = inner.tx.lock().await;
            let join = make_join(&inner, &tx);
            if let Err(e) = transmit_transport(&inner.link, &mut tx, &join).await {
                tracing::debug!(error = %e, "join send failed");
            }
        }

        let mut evicted = Vec::new();
        inner.peers.retain(|src, peer| {
            peer.next_lease = peer.next_lease.saturating_sub(tick);
            if !peer.next_lease.is_zero() {
                return true;
            }
            if peer.received {
                peer.received = false;
                peer.next_lease = peer.lease;
                true
            } else {
                tracing::info!(zid = %peer.zid, %src, "peer lease expired");
                evicted.push(peer.zid);
                false
            }
        });
        for zid in evicted {
            inner.handler.peer_disconnected(&zid, DisconnectReason::Expired);
        }
    }
}
