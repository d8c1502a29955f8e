//! End-to-end scenarios over real sockets on localhost.

mod lease;
mod liveliness;
mod pubsub;
mod query;
mod scouting;

pub use std::net::SocketAddr;
pub use std::sync::Arc;
pub use std::time::Duration;

pub use bytes::Bytes;

pub use ridge_link::{Endpoint, TcpLink, TcpLinkListener};
pub use ridge_proto::codec::transport as tcodec;
pub use ridge_proto::core::PROTOCOL_VERSION;
pub use ridge_proto::iobuf::{WBuf, ZBuf};
pub use ridge_proto::msg::network::{NetworkMessage, Push, PushBody, Put, WireKeyExpr};
pub use ridge_proto::msg::{Frame, Init, Open, Reliability, TransportMessage};
pub use ridge_proto::{PeerId, WhatAmI};
pub use ridge_session::{Config, Session};

pub fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Open a listening peer session and a second one connected to it.
pub async fn open_pair() -> (Arc<Session>, Arc<Session>) {
    open_pair_with(|_| {}).await
}

/// Same, with a configuration tweak applied to both sides.
pub async fn open_pair_with(tweak: impl Fn(&mut Config)) -> (Arc<Session>, Arc<Session>) {
    init_logs();
    let mut cfg_a = Config::default();
    cfg_a.insert("mode", "peer").unwrap();
    cfg_a.insert("listen", "tcp/127.0.0.1:0").unwrap();
    tweak(&mut cfg_a);
    let a = Session::open(cfg_a).await.expect("open listener session");
    let addr = a.listen_addrs()[0];

    let mut cfg_b = Config::default();
    cfg_b.insert("mode", "peer").unwrap();
    cfg_b.insert("connect", &format!("tcp/{addr}")).unwrap();
    tweak(&mut cfg_b);
    let b = Session::open(cfg_b).await.expect("open connecting session");

    // The listener learns about b as soon as the handshake lands.
    wait_until(Duration::from_secs(5), || !a.connected_peers().is_empty()).await;
    (a, b)
}

/// Poll `cond` until it holds or the deadline trips the test.
pub async fn wait_until(deadline: Duration, cond: impl Fn() -> bool) {
    let end = tokio::time::Instant::now() + deadline;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < end,
            "condition not met within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Scripted peer ─────────────────────────────────────────────────────────────

/// A raw protocol speaker for scenarios a well-behaved session cannot
/// produce: stale sequence numbers, silent severing, wire inspection.
pub struct ScriptedPeer {
    link: TcpLink,
    pub zid: PeerId,
}

impl ScriptedPeer {
    /// Dial `addr` and run the opener half of the handshake. `initial_sn`
    /// is announced as our first outbound SN.
    pub async fn connect(
        addr: SocketAddr,
        sn_resolution: u64,
        lease_ms: u64,
        initial_sn: u64,
    ) -> ScriptedPeer {
        let ep = Endpoint::parse(&format!("tcp/{addr}")).unwrap();
        let link = TcpLink::connect(&ep).await.unwrap();
        let zid = PeerId::random();

        send_on(
            &link,
            &TransportMessage::Init(Init {
                ack: false,
                version: PROTOCOL_VERSION,
                whatami: WhatAmI::Peer,
                zid,
                sn_resolution,
                batch_size: u16::MAX,
                cookie: Bytes::new(),
            }),
        )
        .await;
        let init_ack = match recv_on(&link).await {
            TransportMessage::Init(m) if m.ack => m,
            other => panic!("expected InitAck, got {other:?}"),
        };
        send_on(
            &link,
            &TransportMessage::Open(Open {
                ack: false,
                lease_ms,
                initial_sn,
                cookie: init_ack.cookie,
            }),
        )
        .await;
        match recv_on(&link).await {
            TransportMessage::Open(m) if m.ack => {}
            other => panic!("expected OpenAck, got {other:?}"),
        }
        ScriptedPeer { link, zid }
    }

    /// Accept one inbound session on `listener` and run the acceptor half.
    pub async fn accept(listener: &TcpLinkListener, batch_size: u16) -> ScriptedPeer {
        let link = listener.accept().await.unwrap();
        let zid = PeerId::random();

        let init_syn = match recv_on(&link).await {
            TransportMessage::Init(m) if !m.ack => m,
            other => panic!("expected InitSyn, got {other:?}"),
        };
        let cookie = Bytes::from_static(b"scripted-cookie");
        send_on(
            &link,
            &TransportMessage::Init(Init {
                ack: true,
                version: PROTOCOL_VERSION,
                whatami: WhatAmI::Peer,
                zid,
                sn_resolution: init_syn.sn_resolution,
                batch_size: batch_size.min(init_syn.batch_size),
                cookie: cookie.clone(),
            }),
        )
        .await;
        let open_syn = match recv_on(&link).await {
            TransportMessage::Open(m) if !m.ack => m,
            other => panic!("expected OpenSyn, got {other:?}"),
        };
        assert_eq!(open_syn.cookie, cookie, "cookie echo mismatch");
        send_on(
            &link,
            &TransportMessage::Open(Open {
                ack: true,
                lease_ms: 10_000,
                initial_sn: 0,
                cookie: Bytes::new(),
            }),
        )
        .await;
        ScriptedPeer { link, zid }
    }

    /// One reliable frame carrying a single PUT.
    pub async fn send_put_frame(&self, sn: u64, key: &str, payload: &[u8]) {
        let push = NetworkMessage::Push(Push {
            key: WireKeyExpr::from_str(key),
            qos: Default::default(),
            body: PushBody::Put(Put {
                payload: Bytes::copy_from_slice(payload),
                ..Default::default()
            }),
        });
        send_on(
            &self.link,
            &TransportMessage::Frame(Frame {
                reliability: Reliability::Reliable,
                sn,
                payload: vec![push],
            }),
        )
        .await;
    }

    pub async fn send(&self, msg: &TransportMessage) {
        send_on(&self.link, msg).await;
    }

    /// Next transport message, skipping keepalives.
    pub async fn recv(&self) -> TransportMessage {
        loop {
            match recv_on(&self.link).await {
                TransportMessage::KeepAlive(_) => continue,
                msg => return msg,
            }
        }
    }

    /// Every transport message of the next batch, keepalives included.
    pub async fn recv_batch(&self) -> Vec<TransportMessage> {
        let batch = self.link.recv_batch().await.unwrap();
        let mut r = ZBuf::new(batch);
        let mut out = Vec::new();
        while r.can_read() {
            out.push(tcodec::decode(&mut r).unwrap());
        }
        out
    }
}

async fn send_on(link: &TcpLink, msg: &TransportMessage) {
    let mut w = WBuf::fixed(link.mtu());
    tcodec::encode(&mut w, msg).unwrap();
    link.send_batch(w.as_slice()).await.unwrap();
}

async fn recv_on(link: &TcpLink) -> TransportMessage {
    let batch = link.recv_batch().await.unwrap();
    let mut r = ZBuf::new(batch);
    tcodec::decode(&mut r).unwrap()
}
