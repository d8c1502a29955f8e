//! Scouting over multicast. These tests need a host that allows joining a
//! multicast group on loopback; they skip quietly where it cannot.

use crate::*;

use ridge_link::UdpMulticastLink;
use ridge_proto::codec::scouting as scodec;
use ridge_proto::msg::{Hello, ScoutingMessage};
use ridge_session::scout;

const GROUP: &str = "udp/224.0.0.224:17448#iface=127.0.0.1";

async fn open_group() -> Option<UdpMulticastLink> {
    match UdpMulticastLink::open(&Endpoint::parse(GROUP).unwrap()).await {
        Ok(link) => Some(link),
        Err(e) => {
            eprintln!("SKIP: multicast unavailable ({e})");
            None
        }
    }
}

#[tokio::test]
async fn scout_with_nobody_around_times_out_empty() {
    init_logs();
    let mut cfg = Config::default();
    cfg.scout_locator = GROUP.to_string();
    cfg.insert("scouting.timeout", "300").unwrap();

    match scout::scout(ridge_proto::core::what::ROUTER, &cfg, false).await {
        Ok(hellos) => assert!(hellos.is_empty()),
        Err(e) => eprintln!("SKIP: multicast unavailable ({e})"),
    }
}

#[tokio::test]
async fn scout_collects_a_hello_reply() {
    init_logs();
    let Some(responder) = open_group().await else {
        return;
    };

    // A hand-rolled router: answer the first scout with one hello.
    let responder_task = tokio::spawn(async move {
        loop {
            let (batch, _src) = responder.recv_batch().await.unwrap();
            let mut r = ZBuf::new(batch);
            match scodec::decode(&mut r) {
                Ok(ScoutingMessage::Scout(_)) => {
                    let hello = ScoutingMessage::Hello(Hello {
                        version: PROTOCOL_VERSION,
                        whatami: WhatAmI::Router,
                        zid: PeerId::random(),
                        locators: vec!["tcp/127.0.0.1:7447".to_string()],
                    });
                    let mut w = WBuf::fixed(responder.mtu());
                    scodec::encode(&mut w, &hello).unwrap();
                    responder.send_batch(w.as_slice()).await.unwrap();
                    return;
                }
                _ => continue,
            }
        }
    });

    let mut cfg = Config::default();
    cfg.scout_locator = GROUP.to_string();
    cfg.insert("scouting.timeout", "3000").unwrap();

    let hellos = scout::scout(ridge_proto::core::what::ROUTER, &cfg, true)
        .await
        .unwrap();
    assert_eq!(hellos.len(), 1, "exit_on_first stops at the first hello");
    assert_eq!(hellos[0].whatami, WhatAmI::Router);
    assert_eq!(hellos[0].locators, vec!["tcp/127.0.0.1:7447".to_string()]);
    responder_task.await.unwrap();
}

#[tokio::test]
async fn sessions_meet_over_a_multicast_group() {
    init_logs();
    // Probe the environment first.
    let Some(probe) = open_group().await else {
        return;
    };
    drop(probe);

    let group = "udp/224.0.0.224:17449#iface=127.0.0.1";
    let mut cfg_a = Config::default();
    cfg_a.insert("mode", "peer").unwrap();
    cfg_a.insert("connect", group).unwrap();
    cfg_a.lease_ms = 2_000;
    let mut cfg_b = cfg_a.clone();
    cfg_b.lease_ms = 2_000;

    let a = Session::open(cfg_a).await.unwrap();
    let b = Session::open(cfg_b).await.unwrap();

    let samples = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = samples.clone();
    let _sub = a
        .declare_subscriber("group/**", move |s| {
            sink.lock().unwrap().push(s.payload.clone());
        })
        .await
        .unwrap();

    // JOIN-based discovery takes up to one lease tick.
    tokio::time::sleep(Duration::from_millis(800)).await;
    b.put("group/hello", &b"over-multicast"[..], Default::default())
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || !samples.lock().unwrap().is_empty()).await;
    assert_eq!(samples.lock().unwrap()[0].as_ref(), b"over-multicast");

    a.close().await.unwrap();
    b.close().await.unwrap();
}
