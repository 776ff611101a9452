use bytes::Bytes;
use mqttload::testing::{LoopbackBroker, LoopbackConnector};
use mqttload::{
    Credentials, Envelope, EnvelopeLimits, QoS, RetainedStore, Session, SessionConfig,
};
use std::time::Duration;
use tokio::time::timeout;

async fn connect(connector: &LoopbackConnector, client_id: &str, retained: &RetainedStore) -> Session {
    Session::connect(
        connector,
        "loopback",
        &Credentials::anonymous(),
        SessionConfig::new(client_id),
        retained.clone(),
    )
    .await
    .expect("connect")
}

fn retained(topic: &str, payload: &'static [u8], qos: QoS) -> Envelope {
    Envelope::new(
        topic,
        Bytes::from_static(payload),
        qos,
        true,
        &EnvelopeLimits::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_late_subscriber_gets_retained_message() {
    let connector = LoopbackConnector::new(LoopbackBroker::new());
    let store = RetainedStore::new();
    let publisher = connect(&connector, "pub", &store).await;

    publisher
        .publish(retained("home/light", b"ON", QoS::AtLeastOnce))
        .await
        .unwrap()
        .await
        .expect("acknowledged");
    assert_eq!(store.len(), 1);

    let subscriber = connect(&connector, "sub", &store).await;
    let mut subscription = subscriber.subscribe("home/+", QoS::AtLeastOnce).await.unwrap();

    let replay = timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("timeout")
        .expect("retained replay");
    assert_eq!(replay.topic(), "home/light");
    assert_eq!(replay.payload().as_ref(), b"ON");
    assert!(replay.retain());

    // nothing else is queued: the broker stores nothing itself
    assert!(subscription.try_recv().is_none());
}

#[tokio::test]
async fn test_empty_retained_payload_deletes_entry() {
    let connector = LoopbackConnector::new(LoopbackBroker::new());
    let store = RetainedStore::new();
    let publisher = connect(&connector, "pub", &store).await;

    publisher
        .publish(retained("home/light", b"ON", QoS::AtMostOnce))
        .await
        .unwrap()
        .await
        .unwrap();
    assert!(store.get("home/light").is_some());

    publisher
        .publish(retained("home/light", b"", QoS::AtMostOnce))
        .await
        .unwrap()
        .await
        .unwrap();
    assert!(store.get("home/light").is_none());

    let subscriber = connect(&connector, "sub", &store).await;
    let mut subscription = subscriber.subscribe("home/#", QoS::AtMostOnce).await.unwrap();
    let nothing = timeout(Duration::from_millis(100), subscription.recv()).await;
    assert!(nothing.is_err(), "deleted retained message was replayed");
}

#[tokio::test]
async fn test_retained_replay_respects_filter() {
    let connector = LoopbackConnector::new(LoopbackBroker::new());
    let store = RetainedStore::new();
    store.publish_retained("home/kitchen/light", Bytes::from_static(b"OFF"), QoS::AtMostOnce);
    store.publish_retained("home/hall/light", Bytes::from_static(b"ON"), QoS::AtMostOnce);
    store.publish_retained("office/light", Bytes::from_static(b"ON"), QoS::AtMostOnce);

    let subscriber = connect(&connector, "sub", &store).await;
    let mut subscription = subscriber
        .subscribe("home/+/light", QoS::AtMostOnce)
        .await
        .unwrap();

    let mut topics = Vec::new();
    while let Some(message) = subscription.try_recv() {
        topics.push(message.topic().to_string());
    }
    assert_eq!(topics, vec!["home/hall/light", "home/kitchen/light"]);
}

#[tokio::test]
async fn test_retained_flag_cleared_on_live_delivery() {
    let connector = LoopbackConnector::new(LoopbackBroker::new());
    let store = RetainedStore::new();
    let subscriber = connect(&connector, "sub", &store).await;
    let publisher = connect(&connector, "pub", &store).await;
    let mut subscription = subscriber.subscribe("home/+", QoS::ExactlyOnce).await.unwrap();

    publisher
        .publish(retained("home/door", b"LOCKED", QoS::ExactlyOnce))
        .await
        .unwrap()
        .await
        .unwrap();

    let live = timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("timeout")
        .expect("message");
    assert_eq!(live.payload().as_ref(), b"LOCKED");
    assert!(!live.retain());
    assert_eq!(store.get("home/door").map(|e| e.payload), Some(Bytes::from_static(b"LOCKED")));
}
