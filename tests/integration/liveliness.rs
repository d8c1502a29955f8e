//! Liveliness tokens: appearance, explicit undeclare, and loss with the
//! declaring session.

use crate::*;

use std::sync::Mutex;

use ridge_proto::SampleKind;

type Events = Arc<Mutex<Vec<(String, SampleKind)>>>;

async fn liveliness_events(session: &Arc<Session>, key: &str) -> (Events, ridge_session::Subscriber) {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let sub = session
        .declare_liveliness_subscriber(key, move |s| {
            sink.lock().unwrap().push((s.key.as_str().to_string(), s.kind));
        })
        .await
        .unwrap();
    (events, sub)
}

#[tokio::test]
async fn token_appearance_and_undeclare_are_observable() {
    let (a, b) = open_pair().await;
    let (events, _sub) = liveliness_events(&a, "alive/**").await;

    let token = b.liveliness_token("alive/b-1").await.unwrap();
    wait_until(Duration::from_secs(5), || {
        events.lock().unwrap().first()
            == Some(&("alive/b-1".to_string(), SampleKind::Put))
    })
    .await;

    token.undeclare().await.unwrap();
    wait_until(Duration::from_secs(5), || {
        events.lock().unwrap().len() == 2
            && events.lock().unwrap()[1] == ("alive/b-1".to_string(), SampleKind::Delete)
    })
    .await;
}

#[tokio::test]
async fn current_tokens_replay_to_late_subscribers() {
    let (a, b) = open_pair().await;

    // The token exists before anyone subscribes.
    let _token = b.liveliness_token("alive/early").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (events, _sub) = liveliness_events(&a, "alive/**").await;
    wait_until(Duration::from_secs(5), || {
        events.lock().unwrap().first()
            == Some(&("alive/early".to_string(), SampleKind::Put))
    })
    .await;
}

#[tokio::test]
async fn session_close_retracts_its_tokens() {
    let (a, b) = open_pair().await;
    let (events, _sub) = liveliness_events(&a, "alive/**").await;

    let _token = b.liveliness_token("alive/doomed").await.unwrap();
    wait_until(Duration::from_secs(5), || !events.lock().unwrap().is_empty()).await;

    // The whole session goes; its tokens die with it.
    b.close().await.unwrap();
    wait_until(Duration::from_secs(5), || {
        events
            .lock()
            .unwrap()
            .contains(&("alive/doomed".to_string(), SampleKind::Delete))
    })
    .await;

    // The listener side keeps running without its peer.
    assert!(!a.is_closed());
}

#[tokio::test]
async fn non_matching_tokens_are_invisible() {
    let (a, b) = open_pair().await;
    let (events, _sub) = liveliness_events(&a, "alive/room-1/**").await;

    let _other = b.liveliness_token("alive/room-2/x").await.unwrap();
    let _ours = b.liveliness_token("alive/room-1/x").await.unwrap();

    wait_until(Duration::from_secs(5), || !events.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let got = events.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, "alive/room-1/x");
}
