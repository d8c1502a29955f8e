//! Lease expiry: a silently severed peer is detected and the session,
//! having lost its only link, closes with all pending queries cancelled.

use crate::*;

use std::sync::atomic::{AtomicBool, Ordering};

use ridge_session::{GetOptions, PutOptions, SessionError};

#[tokio::test]
async fn silent_peer_expires_and_closes_the_session() {
    init_logs();
    let listener = TcpLinkListener::bind(&Endpoint::parse("tcp/127.0.0.1:0").unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let session_task = tokio::spawn(async move {
        let mut cfg = Config::default();
        cfg.insert("mode", "client").unwrap();
        cfg.insert("connect", &format!("tcp/{addr}")).unwrap();
        cfg.lease_ms = 600;
        Session::open(cfg).await.unwrap()
    });
    // The scripted peer completes the handshake and then falls silent:
    // the socket stays open, no keepalives, no close.
    let peer = ScriptedPeer::accept(&listener, u16::MAX).await;
    let session = session_task.await.unwrap();

    let dropped = Arc::new(AtomicBool::new(false));
    let flag = dropped.clone();
    session
        .get(
            "service/echo",
            GetOptions {
                timeout_ms: 30_000,
                ..Default::default()
            },
            |_| {},
            move || flag.store(true, Ordering::SeqCst),
        )
        .await
        .unwrap();

    // Nothing received for a whole lease: the transport expires, and with
    // it the session's only link.
    wait_until(Duration::from_secs(5), || session.is_closed()).await;
    assert!(
        dropped.load(Ordering::SeqCst),
        "pending query must get its drop notification on session loss"
    );

    // Every subsequent call fails with Closed.
    match session
        .put("demo/a", &b"x"[..], PutOptions::default())
        .await
    {
        Err(SessionError::Closed) => {}
        other => panic!("expected Closed, got {other:?}"),
    }

    drop(peer);
}

#[tokio::test]
async fn keepalives_keep_an_idle_session_alive() {
    let (a, b) = open_pair_with(|cfg| cfg.lease_ms = 500).await;

    // Well past several leases with zero application traffic.
    tokio::time::sleep(Duration::from_millis(1_600)).await;
    assert!(!a.is_closed(), "idle session must be kept alive");
    assert!(!b.is_closed());
    assert_eq!(a.connected_peers().len(), 1);

    a.close().await.unwrap();
    b.close().await.unwrap();
}
