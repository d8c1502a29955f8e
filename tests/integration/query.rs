//! Query/reply scenarios.

use crate::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use ridge_session::{GetOptions, Reply};

#[tokio::test]
async fn query_gets_reply_then_final() {
    let (a, b) = open_pair().await;

    let _queryable = a
        .declare_queryable("service/echo", true, |query| {
            assert_eq!(query.key().as_str(), "service/echo");
            assert_eq!(query.payload().map(|p| p.as_ref()), Some(&b"ping"[..]));
            query.reply("service/echo", &b"pong"[..]).unwrap();
        })
        .await
        .unwrap();

    let replies = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(AtomicBool::new(false));
    let (sink, flag) = (replies.clone(), finished.clone());
    b.get(
        "service/echo",
        GetOptions {
            payload: Some(Bytes::from_static(b"ping")),
            ..Default::default()
        },
        move |reply| {
            sink.lock().unwrap().push(reply);
        },
        move || {
            flag.store(true, Ordering::SeqCst);
        },
    )
    .await
    .unwrap();

    // One sample, then the terminal notification, well within five seconds.
    wait_until(Duration::from_secs(5), || {
        finished.load(Ordering::SeqCst) && replies.lock().unwrap().len() == 1
    })
    .await;

    match &replies.lock().unwrap()[0] {
        Reply::Sample(s) => {
            assert_eq!(s.key.as_str(), "service/echo");
            assert_eq!(s.payload.as_ref(), b"pong");
        }
        Reply::Error { code, .. } => panic!("unexpected error reply {code}"),
    }

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn query_with_parameters_and_error_reply() {
    let (a, b) = open_pair().await;

    let _queryable = a
        .declare_queryable("service/strict", false, |query| {
            if query.parameters() == "ok=1" {
                query.reply("service/strict", &b"fine"[..]).unwrap();
            } else {
                query.reply_err(400, &b"bad parameters"[..]).unwrap();
            }
        })
        .await
        .unwrap();

    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = replies.clone();
    b.get(
        "service/strict?nope=0",
        GetOptions::default(),
        move |reply| sink.lock().unwrap().push(reply),
        || {},
    )
    .await
    .unwrap();

    wait_until(Duration::from_secs(5), || replies.lock().unwrap().len() == 1).await;
    let guard = replies.lock().unwrap();
    match &guard[0] {
        Reply::Error { code, payload } => {
            assert_eq!(*code, 400);
            assert_eq!(payload.as_ref(), b"bad parameters");
        }
        Reply::Sample(_) => panic!("expected an error reply"),
    }
}

#[tokio::test]
async fn query_without_queryable_finishes_empty() {
    let (a, b) = open_pair().await;
    let _ = &a;

    let replies = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(AtomicBool::new(false));
    let (sink, flag) = (replies.clone(), finished.clone());
    b.get(
        "service/nobody-home",
        GetOptions::default(),
        move |reply| sink.lock().unwrap().push(reply),
        move || flag.store(true, Ordering::SeqCst),
    )
    .await
    .unwrap();

    wait_until(Duration::from_secs(5), || finished.load(Ordering::SeqCst)).await;
    assert!(replies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unanswered_query_ends_at_its_deadline() {
    let (a, b) = open_pair().await;

    // The queryable keeps the query alive forever: no reply, no final.
    let _queryable = a
        .declare_queryable("service/tarpit", false, |query| {
            std::mem::forget(query);
        })
        .await
        .unwrap();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    let started = tokio::time::Instant::now();
    b.get(
        "service/tarpit",
        GetOptions {
            timeout_ms: 500,
            ..Default::default()
        },
        |_| {},
        move || flag.store(true, Ordering::SeqCst),
    )
    .await
    .unwrap();

    wait_until(Duration::from_secs(5), || finished.load(Ordering::SeqCst)).await;
    assert!(
        started.elapsed() >= Duration::from_millis(450),
        "deadline fired too early"
    );
}

#[tokio::test]
async fn querier_reuses_its_key() {
    let (a, b) = open_pair().await;

    let _queryable = a
        .declare_queryable("service/add", true, |query| {
            query.reply("service/add", query.parameters().as_bytes().to_vec()).unwrap();
        })
        .await
        .unwrap();

    let querier = b.declare_querier("service/add", 5_000).await.unwrap();
    let replies = Arc::new(Mutex::new(Vec::new()));
    for parameters in ["a=1", "a=2"] {
        let sink = replies.clone();
        querier
            .get(
                parameters,
                GetOptions::default(),
                move |reply| sink.lock().unwrap().push(reply),
                || {},
            )
            .await
            .unwrap();
    }
    wait_until(Duration::from_secs(5), || replies.lock().unwrap().len() == 2).await;
}
