//! Unicast transport: one peer over one link.
//!
//! Establishment is a four-step exchange — InitSyn, InitAck (cookie),
//! OpenSyn (cookie echo), OpenAck — after which both sides install their SN
//! state and spawn a read task and a lease task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use ridge_link::Link;
use ridge_proto::codec::{network as ncodec, transport as tcodec};
use ridge_proto::core::{close_reason, PROTOCOL_VERSION};
use ridge_proto::iobuf::{WBuf, ZBuf};
use ridge_proto::msg::{
    Close, Frame, Fragment, Init, KeepAlive, NetworkMessage, Open, Reliability, TransportMessage,
};
use ridge_proto::{CongestionControl, PeerId, WhatAmI};

use crate::common::{
    self, sn_decrement, sn_precedes, sn_random, transmit_transport, TransportConfig, TxState,
};
use crate::defrag::DefragBuffer;
use crate::{DisconnectReason, TransportError, TransportEventHandler};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// An established unicast transport. Cheap to clone.
#[derive(Clone)]
pub struct TransportUnicast {
    inner: Arc<Inner>,
}

struct Inner {
    link: Link,
    remote_zid: PeerId,
    remote_whatami: WhatAmI,
    sn_resolution: u64,
    lease_ms: u64,
    tx: AsyncMutex<TxState>,
    rx: Mutex<RxState>,
    received: AtomicBool,
    transmitted: AtomicBool,
    open: AtomicBool,
    handler: Arc<dyn TransportEventHandler>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct RxState {
    sn_reliable: u64,
    sn_best_effort: u64,
    defrag_reliable: DefragBuffer,
    defrag_best_effort: DefragBuffer,
}

impl RxState {
    fn channel(&mut self, reliability: Reliability) -> (&mut u64, &mut DefragBuffer) {
        match reliability {
            Reliability::Reliable => (&mut self.sn_reliable, &mut self.defrag_reliable),
            Reliability::BestEffort => (&mut self.sn_best_effort, &mut self.defrag_best_effort),
        }
    }
}

/// What the handshake settled on.
struct EstablishParams {
    remote_zid: PeerId,
    remote_whatami: WhatAmI,
    sn_resolution: u64,
    batch_size: u16,
    lease_ms: u64,
    initial_sn_tx: u64,
    initial_sn_rx: u64,
}

// ── Handshake helpers ─────────────────────────────────────────────────────────

async fn send_handshake(link: &Link, msg: &TransportMessage) -> Result<(), TransportError> {
    let mut w = WBuf::fixed(link.mtu());
    tcodec::encode(&mut w, msg)?;
    link.send_batch(w.as_slice()).await?;
    Ok(())
}

async fn recv_handshake(link: &Link) -> Result<TransportMessage, TransportError> {
    let (batch, _) = timeout(HANDSHAKE_TIMEOUT, link.recv_batch())
        .await
        .map_err(|_| TransportError::Expired)??;
    let mut r = ZBuf::new(batch);
    tcodec::decode(&mut r).map_err(TransportError::Proto)
}

async fn reject(link: &Link, reason: u8) {
    let _ = send_handshake(link, &TransportMessage::Close(Close { reason })).await;
    link.close().await;
}

impl TransportUnicast {
    /// Dial side of the handshake.
    pub async fn open(
        link: Link,
        cfg: TransportConfig,
        handler: Arc<dyn TransportEventHandler>,
    ) -> Result<Self, TransportError> {
        send_handshake(
            &link,
            &TransportMessage::Init(Init {
                ack: false,
                version: PROTOCOL_VERSION,
                whatami: cfg.whatami,
                zid: cfg.zid,
                sn_resolution: cfg.sn_resolution,
                batch_size: cfg.batch_size,
                cookie: Bytes::new(),
            }),
        )
        .await?;

        let init_ack = match recv_handshake(&link).await? {
            TransportMessage::Init(m) if m.ack => m,
            TransportMessage::Close(c) => {
                tracing::debug!(reason = c.reason, "peer refused session");
                return Err(TransportError::Closed);
            }
            _ => {
                reject(&link, close_reason::INVALID).await;
                return Err(TransportError::MessageUnexpected);
            }
        };
        if init_ack.version != PROTOCOL_VERSION {
            reject(&link, close_reason::UNSUPPORTED).await;
            return Err(TransportError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: init_ack.version,
            });
        }
        // The acceptor may only narrow what we proposed.
        if init_ack.sn_resolution > cfg.sn_resolution {
            reject(&link, close_reason::INVALID).await;
            return Err(TransportError::SnResolutionMismatch);
        }
        let sn_resolution = init_ack.sn_resolution;
        let batch_size = cfg.batch_size.min(init_ack.batch_size);
        let initial_sn_tx = sn_random(sn_resolution);

        send_handshake(
            &link,
            &TransportMessage::Open(Open {
                ack: false,
                lease_ms: cfg.lease_ms,
                initial_sn: initial_sn_tx,
                cookie: init_ack.cookie,
            }),
        )
        .await?;

        let open_ack = match recv_handshake(&link).await? {
            TransportMessage::Open(m) if m.ack => m,
            TransportMessage::Close(c) => {
                tracing::debug!(reason = c.reason, "peer refused session");
                return Err(TransportError::Closed);
            }
            _ => {
                reject(&link, close_reason::INVALID).await;
                return Err(TransportError::MessageUnexpected);
            }
        };

        let params = EstablishParams {
            remote_zid: init_ack.zid,
            remote_whatami: init_ack.whatami,
            sn_resolution,
            batch_size,
            lease_ms: open_ack.lease_ms.min(cfg.lease_ms),
            initial_sn_tx,
            initial_sn_rx: open_ack.initial_sn,
        };
        Ok(Self::establish(link, &cfg, params, handler))
    }

    /// Accept side of the handshake, driven on an already-accepted link.
    pub async fn accept(
        link: Link,
        cfg: TransportConfig,
        handler: Arc<dyn TransportEventHandler>,
    ) -> Result<Self, TransportError> {
        let init_syn = match recv_handshake(&link).await? {
            TransportMessage::Init(m) if !m.ack => m,
            _ => {
                reject(&link, close_reason::INVALID).await;
                return Err(TransportError::MessageUnexpected);
            }
        };
        if init_syn.version != PROTOCOL_VERSION {
            reject(&link, close_reason::UNSUPPORTED).await;
            return Err(TransportError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: init_syn.version,
            });
        }
        let sn_resolution = cfg.sn_resolution.min(init_syn.sn_resolution);
        let batch_size = cfg.batch_size.min(init_syn.batch_size);

        let mut cookie = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut cookie[..]);
        let cookie = Bytes::copy_from_slice(&cookie);

        send_handshake(
            &link,
            &TransportMessage::Init(Init {
                ack: true,
                version: PROTOCOL_VERSION,
                whatami: cfg.whatami,
                zid: cfg.zid,
                sn_resolution,
                batch_size,
                cookie: cookie.clone(),
            }),
        )
        .await?;

        let open_syn = match recv_handshake(&link).await? {
            TransportMessage::Open(m) if !m.ack => m,
            _ => {
                reject(&link, close_reason::INVALID).await;
                return Err(TransportError::MessageUnexpected);
            }
        };
        if open_syn.cookie != cookie {
            reject(&link, close_reason::INVALID).await;
            return Err(TransportError::CookieMismatch);
        }

        let initial_sn_tx = sn_random(sn_resolution);
        send_handshake(
            &link,
            &TransportMessage::Open(Open {
                ack: true,
                lease_ms: cfg.lease_ms,
                initial_sn: initial_sn_tx,
                cookie: Bytes::new(),
            }),
        )
        .await?;

        let params = EstablishParams {
            remote_zid: init_syn.zid,
            remote_whatami: init_syn.whatami,
            sn_resolution,
            batch_size,
            lease_ms: open_syn.lease_ms.min(cfg.lease_ms),
            initial_sn_tx,
            initial_sn_rx: open_syn.initial_sn,
        };
        Ok(Self::establish(link, &cfg, params, handler))
    }

    fn establish(
        link: Link,
        cfg: &TransportConfig,
        params: EstablishParams,
        handler: Arc<dyn TransportEventHandler>,
    ) -> Self {
        let mtu = link.mtu().min(params.batch_size as usize);
        let initial_sn_rx = sn_decrement(params.sn_resolution, params.initial_sn_rx);
        let (shutdown, _) = broadcast::channel(1);

        let inner = Arc::new(Inner {
            link,
            remote_zid: params.remote_zid,
            remote_whatami: params.remote_whatami,
            sn_resolution: params.sn_resolution,
            lease_ms: params.lease_ms,
            tx: AsyncMutex::new(TxState::new(
                mtu,
                params.sn_resolution,
                params.initial_sn_tx,
            )),
            rx: Mutex::new(RxState {
                sn_reliable: initial_sn_rx,
                sn_best_effort: initial_sn_rx,
                defrag_reliable: DefragBuffer::new(cfg.defrag_budget),
                defrag_best_effort: DefragBuffer::new(cfg.defrag_budget),
            }),
            received: AtomicBool::new(false),
            transmitted: AtomicBool::new(false),
            open: AtomicBool::new(true),
            handler,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        tracing::info!(
            remote = %inner.remote_zid,
            sn_resolution = inner.sn_resolution,
            lease_ms = inner.lease_ms,
            "unicast transport established"
        );

        let read = tokio::spawn(read_task(inner.clone(), inner.shutdown.subscribe()));
        let lease = tokio::spawn(lease_task(inner.clone(), inner.shutdown.subscribe()));
        inner.tasks.lock().unwrap().extend([read, lease]);

        // The caller announces the peer once it has registered the
        // transport; announcing here would race the registration.
        Self { inner }
    }

    pub fn remote_zid(&self) -> PeerId {
        self.inner.remote_zid
    }

    pub fn remote_whatami(&self) -> WhatAmI {
        self.inner.remote_whatami
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Send one network message, fragmenting if needed.
    ///
    /// With [`CongestionControl::Drop`], a contended tx path discards the
    /// message instead of waiting.
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

    /// Orderly local close: send CLOSE, stop the tasks, drop the link.
    /// Blocks until both tasks observed the stop, bounded by one lease tick.
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
        self.inner.link.close().await;

        let handles: Vec<_> = self.inner.tasks.lock().unwrap().drain(..).collect();
        let bound = Duration::from_millis(
            self.inner.lease_ms / u64::from(ridge_proto::core::LEASE_KEEPALIVE_FACTOR) + 1,
        );
        for handle in handles {
            let _ = timeout(bound, handle).await;
        }
    }
}

// ── Read task ─────────────────────────────────────────────────────────────────

async fn read_task(inner: Arc<Inner>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            res = inner.link.recv_batch() => {
                let batch = match res {
                    Ok((batch, _)) => batch,
                    Err(e) => {
                        if inner.open.swap(false, Ordering::SeqCst) {
                            tracing::warn!(error = %e, "link read failed");
                            inner
                                .handler
                                .peer_disconnected(&inner.remote_zid, DisconnectReason::Error);
                        }
                        return;
                    }
                };
                inner.received.store(true, Ordering::Relaxed);
                if !handle_batch(&inner, batch) {
                    return;
                }
            }
        }
    }
}

/// Returns false when the transport must stop reading.
fn handle_batch(inner: &Arc<Inner>, batch: Bytes) -> bool {
    let mut r = ZBuf::new(batch);
    while r.can_read() {
        let msg = match tcodec::decode(&mut r) {
            Ok(m) => m,
            Err(e) => {
                // The rest of the batch is unparseable; a reliable fragment
                // sequence can no longer be stitched either.
                tracing::warn!(error = %e, "malformed batch dropped");
                inner.rx.lock().unwrap().defrag_reliable.reset();
                return true;
            }
        };
        match msg {
            TransportMessage::Frame(f) => handle_frame(inner, f),
            TransportMessage::Fragment(f) => handle_fragment(inner, f),
            TransportMessage::KeepAlive(KeepAlive) => {}
            TransportMessage::Close(c) => {
                tracing::debug!(reason = c.reason, remote = %inner.remote_zid, "remote closed session");
                if inner.open.swap(false, Ordering::SeqCst) {
                    inner
                        .handler
                        .peer_disconnected(&inner.remote_zid, DisconnectReason::Closed);
                }
                return false;
            }
            TransportMessage::Init(_) | TransportMessage::Open(_) | TransportMessage::Join(_) => {
                tracing::trace!("ignoring establishment message on established session");
            }
        }
    }
    true
}

fn handle_frame(inner: &Arc<Inner>, frame: Frame) {
    {
        let mut rx = inner.rx.lock().unwrap();
        let (sn_rx, defrag) = rx.channel(frame.reliability);
        if !sn_precedes(inner.sn_resolution, *sn_rx, frame.sn) {
            tracing::debug!(sn = frame.sn, last = *sn_rx, "frame out of order, dropped");
            defrag.reset();
            return;
        }
        *sn_rx = frame.sn;
    }
    // Within one frame, messages are delivered in wire order.
    for msg in frame.payload {
        inner.handler.handle_message(&inner.remote_zid, msg);
    }
}

fn handle_fragment(inner: &Arc<Inner>, fragment: Fragment) {
    let finalized = {
        let mut rx = inner.rx.lock().unwrap();
        let (sn_rx, defrag) = rx.channel(fragment.reliability);
        if !sn_precedes(inner.sn_resolution, *sn_rx, fragment.sn) {
            tracing::debug!(sn = fragment.sn, "fragment out of order, dropped");
            defrag.reset();
            return;
        }
        *sn_rx = fragment.sn;
        if let Err(e) = defrag.push(inner.sn_resolution, fragment.sn, fragment.payload) {
            tracing::warn!(error = %e, "fragment dropped");
            return;
        }
        if fragment.more {
            None
        } else {
            Some(defrag.finalize())
        }
    };
    if let Some(mut z) = finalized {
        match ncodec::decode(&mut z) {
            Ok(msg) => inner.handler.handle_message(&inner.remote_zid, msg),
            Err(e) => tracing::warn!(error = %e, "reassembled message is malformed"),
        }
    }
}

// ── Lease task ────────────────────────────────────────────────────────────────

async fn lease_task(inner: Arc<Inner>, mut shutdown: broadcast::Receiver<()>) {
    let lease = Duration::from_millis(inner.lease_ms.max(1));
    let tick = lease / ridge_proto::core::LEASE_KEEPALIVE_FACTOR;
    let mut next_lease = lease;
    let mut next_keepalive = tick;

    loop {
        let interval = next_lease.min(next_keepalive);
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        next_lease = next_lease.saturating_sub(interval);
        next_keepalive = next_keepalive.saturating_sub(interval);

        if next_keepalive.is_zero() {
            if !inner.transmitted.swap(false, Ordering::Relaxed) {
                let mut tx = inner.tx.lock().await;
                if let Err(e) = transmit_transport(
                    &inner.link,
                    &mut tx,
                    &TransportMessage::KeepAlive(KeepAlive),
                )
                .await
                {
                    tracing::debug!(error = %e, "keepalive send failed");
                }
            }
            next_keepalive = tick;
        }

        if next_lease.is_zero() {
            if inner.received.swap(false, Ordering::Relaxed) {
                next_lease = lease;
            } else {
                tracing::info!(
                    remote = %inner.remote_zid,
                    lease_ms = inner.lease_ms,
                    "closing session: lease expired"
                );
                if inner.open.swap(false, Ordering::SeqCst) {
                    {
                        let mut tx = inner.tx.lock().await;
                        let _ = transmit_transport(
                            &inner.link,
                            &mut tx,
                            &TransportMessage::Close(Close {
                                reason: close_reason::EXPIRED,
                            }),
                        )
                        .await;
                    }
                    inner
                        .handler
                        .peer_disconnected(&inner.remote_zid, DisconnectReason::Expired);
                }
                let _ = inner.shutdown.send(());
                return;
            }
        }
    }
}
