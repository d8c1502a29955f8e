//! Publish/subscribe scenarios: plain delivery, key-expression
//! abbreviation, fragmentation, and reliable ordering across SN wrap.

use crate::*;

use std::sync::Mutex;

use ridge_proto::msg::{Fragment, TransportMessage};
use ridge_proto::SampleKind;
use ridge_session::{Config, GetOptions, PutOptions};

#[tokio::test]
async fn put_reaches_matching_subscriber_exactly_once() {
    let (a, b) = open_pair().await;

    let samples = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    let _sub = a
        .declare_subscriber("demo/**", move |s| {
            sink.lock().unwrap().push(s);
        })
        .await
        .unwrap();

    b.put("demo/a", &b"hi"[..], PutOptions::default())
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || samples.lock().unwrap().len() == 1).await;
    {
        let got = samples.lock().unwrap();
        assert_eq!(got[0].key.as_str(), "demo/a");
        assert_eq!(got[0].payload.as_ref(), b"hi");
        assert_eq!(got[0].kind, SampleKind::Put);
    }

    // Never duplicated.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(samples.lock().unwrap().len(), 1);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn non_matching_keys_are_not_delivered() {
    let (a, b) = open_pair().await;

    let samples = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    let _sub = a
        .declare_subscriber("demo/room/*", move |s| {
            sink.lock().unwrap().push(s.key.as_str().to_string());
        })
        .await
        .unwrap();

    b.put("demo/room/one", &b"1"[..], PutOptions::default())
        .await
        .unwrap();
    b.put("demo/other", &b"2"[..], PutOptions::default())
        .await
        .unwrap();
    b.put("demo/room/one/deeper", &b"3"[..], PutOptions::default())
        .await
        .unwrap();
    b.put("demo/room/two", &b"4"[..], PutOptions::default())
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || samples.lock().unwrap().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let got = samples.lock().unwrap();
    assert_eq!(&*got, &["demo/room/one".to_string(), "demo/room/two".to_string()]);
}

#[tokio::test]
async fn delete_samples_carry_the_delete_kind() {
    let (a, b) = open_pair().await;

    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = kinds.clone();
    let _sub = a
        .declare_subscriber("demo/**", move |s| {
            sink.lock().unwrap().push(s.kind);
        })
        .await
        .unwrap();

    b.put("demo/a", &b"v"[..], PutOptions::default())
        .await
        .unwrap();
    b.delete("demo/a", PutOptions::default()).await.unwrap();

    wait_until(Duration::from_secs(5), || kinds.lock().unwrap().len() == 2).await;
    assert_eq!(
        &*kinds.lock().unwrap(),
        &[SampleKind::Put, SampleKind::Delete]
    );
}

#[tokio::test]
async fn declared_keyexpr_abbreviates_and_expands() {
    let (a, b) = open_pair().await;

    let samples = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    let _sub = a
        .declare_subscriber("demo/**", move |s| {
            sink.lock().unwrap().push((s.key.as_str().to_string(), s.payload.clone()));
        })
        .await
        .unwrap();

    // The declaration travels first on the same reliable channel, so the
    // scoped push always finds the mapping installed.
    let ke = b.declare_keyexpr("demo/example/").await.unwrap();
    b.put_scoped(&ke, "x", &b"compressed"[..], PutOptions::default())
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || samples.lock().unwrap().len() == 1).await;
    let got = samples.lock().unwrap();
    assert_eq!(got[0].0, "demo/example/x");
    assert_eq!(got[0].1.as_ref(), b"compressed");
}

#[tokio::test]
async fn publisher_ships_the_compressed_form() {
    let (a, b) = open_pair().await;

    let samples = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    let _sub = a
        .declare_subscriber("sensors/**", move |s| {
            sink.lock().unwrap().push(s.key.as_str().to_string());
        })
        .await
        .unwrap();

    let publisher = b.declare_publisher("sensors/temp/room-1").await.unwrap();
    publisher
        .put(&b"21.5"[..], PutOptions::default())
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || samples.lock().unwrap().len() == 1).await;
    assert_eq!(samples.lock().unwrap()[0], "sensors/temp/room-1");
}

/// MTU 256, 1024-byte payload: exactly five fragments on the wire, `more`
/// on all but the last, and a bit-identical reassembly.
#[tokio::test]
async fn oversized_put_fragments_on_the_wire() {
    init_logs();
    let listener = TcpLinkListener::bind(&Endpoint::parse("tcp/127.0.0.1:0").unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let session_task = tokio::spawn(async move {
        let mut cfg = Config::default();
        cfg.insert("mode", "client").unwrap();
        cfg.insert("connect", &format!("tcp/{addr}")).unwrap();
        cfg.batch_size = 256;
        Session::open(cfg).await.unwrap()
    });
    let peer = ScriptedPeer::accept(&listener, 256).await;
    let session = session_task.await.unwrap();

    let payload = vec![0xA5u8; 1024];
    session
        .put("demo/frag", payload.clone(), PutOptions::default())
        .await
        .unwrap();

    let mut fragments: Vec<Fragment> = Vec::new();
    loop {
        match peer.recv().await {
            TransportMessage::Fragment(f) => {
                let done = !f.more;
                fragments.push(f);
                if done {
                    break;
                }
            }
            other => panic!("expected fragments, got {other:?}"),
        }
    }

    assert_eq!(fragments.len(), 5, "1024 bytes over MTU 256 is 5 fragments");
    for (i, f) in fragments.iter().enumerate() {
        assert_eq!(f.more, i < 4, "fragment {i} more flag");
        if i > 0 {
            let expected = (fragments[i - 1].sn + 1) % (1 << 28);
            assert_eq!(f.sn, expected, "fragment SNs are consecutive");
        }
    }

    // Reassemble and decode: the payload must be bit-identical.
    let mut z = ZBuf::empty();
    for f in &fragments {
        z.push(f.payload.clone());
    }
    match ridge_proto::codec::network::decode(&mut z).unwrap() {
        NetworkMessage::Push(p) => match p.body {
            PushBody::Put(put) => assert_eq!(put.payload.as_ref(), &payload[..]),
            other => panic!("unexpected push body {other:?}"),
        },
        other => panic!("unexpected message {other:?}"),
    }

    session.close().await.unwrap();
}

/// SN resolution 16: 18 in-order reliable frames wrap the ring, a stale
/// frame is rejected without disturbing the channel, delivery continues.
#[tokio::test]
async fn reliable_ordering_survives_sn_wrap() {
    init_logs();
    let mut cfg = Config::default();
    cfg.insert("mode", "peer").unwrap();
    cfg.insert("listen", "tcp/127.0.0.1:0").unwrap();
    let a = Session::open(cfg).await.unwrap();
    let addr = a.listen_addrs()[0];

    let markers = Arc::new(Mutex::new(Vec::new()));
    let sink = markers.clone();
    let _sub = a
        .declare_subscriber("wrap/**", move |s| {
            sink.lock().unwrap().push(s.payload[0]);
        })
        .await
        .unwrap();

    let peer = ScriptedPeer::connect(addr, 16, 10_000, 0).await;

    // Two full cycles plus two: sns 0..15, 0, 1.
    for i in 0u8..18 {
        peer.send_put_frame(u64::from(i) % 16, "wrap/m", &[i]).await;
    }
    wait_until(Duration::from_secs(5), || markers.lock().unwrap().len() == 18).await;

    // A stale frame from the previous cycle: rejected, sn_rx untouched.
    peer.send_put_frame(14, "wrap/m", &[99]).await;
    // The next in-order frame proves the channel is intact.
    peer.send_put_frame(2, "wrap/m", &[18]).await;

    wait_until(Duration::from_secs(5), || markers.lock().unwrap().len() == 19).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let got = markers.lock().unwrap();
    assert_eq!(got.len(), 19, "stale frame must not be delivered");
    assert!(!got.contains(&99));
    let expected: Vec<u8> = (0u8..19).collect();
    assert_eq!(&*got, &expected, "delivery order is submission order");
}

#[tokio::test]
async fn get_options_default_is_sane() {
    // Ten seconds is the documented default query budget.
    assert_eq!(GetOptions::default().timeout_ms, 10_000);
}
