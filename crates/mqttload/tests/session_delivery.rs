use bytes::Bytes;
use mqttload::testing::{LoopbackBroker, LoopbackConnector, LoopbackFaults};
use mqttload::{
    Credentials, Envelope, EnvelopeLimits, HarnessError, PublishOutcome, QoS, ReasonCode,
    RetainedStore, Session, SessionConfig,
};
use std::time::Duration;
use tokio::time::{timeout, Instant};

async fn connect(connector: &LoopbackConnector, client_id: &str) -> Session {
    connect_with(connector, SessionConfig::new(client_id)).await
}

async fn connect_with(connector: &LoopbackConnector, config: SessionConfig) -> Session {
    Session::connect(
        connector,
        "loopback",
        &Credentials::anonymous(),
        config.with_retry(Duration::from_millis(500), 3),
        RetainedStore::new(),
    )
    .await
    .expect("connect")
}

fn envelope(topic: &str, payload: &'static [u8], qos: QoS) -> Envelope {
    Envelope::new(
        topic,
        Bytes::from_static(payload),
        qos,
        false,
        &EnvelopeLimits::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_qos1_publish_is_acknowledged_and_delivered() {
    let connector = LoopbackConnector::new(LoopbackBroker::new());
    let subscriber = connect(&connector, "sub").await;
    let publisher = connect(&connector, "pub").await;

    let mut subscription = subscriber
        .subscribe("sensors/+", QoS::AtLeastOnce)
        .await
        .expect("subscribe");
    assert_eq!(subscription.granted_qos(), QoS::AtLeastOnce);

    let handle = publisher
        .publish(envelope("sensors/temp", b"21.5", QoS::AtLeastOnce))
        .await
        .expect("publish");
    let packet_id = handle.packet_id().expect("qos 1 gets a packet id");

    let outcome = handle.await.expect("acknowledged");
    assert_eq!(
        outcome,
        PublishOutcome::Acked {
            packet_id,
            attempts: 1
        }
    );

    let received = timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("timeout")
        .expect("message");
    assert_eq!(received.topic(), "sensors/temp");
    assert_eq!(received.payload().as_ref(), b"21.5");
    assert_eq!(publisher.stats().acked, 1);
    assert_eq!(publisher.stats().outstanding, 0);
}

#[tokio::test]
async fn test_qos0_reports_sent_without_ack() {
    let connector = LoopbackConnector::new(LoopbackBroker::with_faults(LoopbackFaults {
        unresponsive: true,
        ..LoopbackFaults::default()
    }));
    let publisher = connect(&connector, "pub").await;

    let handle = publisher
        .publish(envelope("fire/forget", b"x", QoS::AtMostOnce))
        .await
        .expect("publish");
    assert_eq!(handle.packet_id(), None);
    assert_eq!(handle.await, Ok(PublishOutcome::Sent));
    assert_eq!(publisher.stats().acked, 0);
}

#[tokio::test(start_paused = true)]
async fn test_qos1_without_puback_times_out() {
    let connector = LoopbackConnector::new(LoopbackBroker::with_faults(LoopbackFaults {
        unresponsive: true,
        ..LoopbackFaults::default()
    }));
    let publisher = connect(&connector, "pub").await;

    let handle = publisher
        .publish(envelope("no/ack", b"x", QoS::AtLeastOnce))
        .await
        .expect("publish");
    let packet_id = handle.packet_id().unwrap();

    let result = handle.await;
    assert_eq!(result, Err(HarnessError::DeliveryTimeout { packet_id }));

    let stats = publisher.stats();
    assert_eq!(stats.acked, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retransmitted, 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_puback_is_retransmitted() {
    let broker = LoopbackBroker::with_faults(LoopbackFaults {
        drop_pubacks: 1,
        ..LoopbackFaults::default()
    });
    let connector = LoopbackConnector::new(broker.clone());
    let subscriber = connect(&connector, "sub").await;
    let publisher = connect(&connector, "pub").await;
    let mut subscription = subscriber
        .subscribe("retry/me", QoS::AtLeastOnce)
        .await
        .unwrap();

    let handle = publisher
        .publish(envelope("retry/me", b"again", QoS::AtLeastOnce))
        .await
        .unwrap();
    let packet_id = handle.packet_id().unwrap();

    let outcome = handle.await.expect("acknowledged after retry");
    assert_eq!(
        outcome,
        PublishOutcome::Acked {
            packet_id,
            attempts: 2
        }
    );
    assert_eq!(broker.pubacks_dropped(), 1);
    assert_eq!(broker.publishes_received(), 2);
    assert_eq!(publisher.stats().retransmitted, 1);
    assert_eq!(publisher.stats().acked, 1);

    // the broker forwards both copies, QoS 1 allows the duplicate through
    assert!(subscription.recv().await.is_some());
    assert!(subscription.recv().await.is_some());
}

#[tokio::test]
async fn test_qos2_exactly_once_under_duplicate_delivery() {
    let connector = LoopbackConnector::new(LoopbackBroker::with_faults(LoopbackFaults {
        duplicate_deliveries: true,
        ..LoopbackFaults::default()
    }));
    let subscriber = connect(&connector, "sub").await;
    let publisher = connect(&connector, "pub").await;
    let mut subscription = subscriber
        .subscribe("orders/#", QoS::ExactlyOnce)
        .await
        .unwrap();

    for payload in [&b"first"[..], &b"second"[..], &b"third"[..]] {
        let handle = publisher
            .publish(envelope("orders/new", payload, QoS::ExactlyOnce))
            .await
            .unwrap();
        assert!(matches!(
            handle.await,
            Ok(PublishOutcome::Completed { attempts: 1, .. })
        ));
    }

    let mut payloads = Vec::new();
    for _ in 0..3 {
        let message = timeout(Duration::from_secs(1), subscription.recv())
            .await
            .expect("timeout")
            .expect("message");
        payloads.push(message.payload().clone());
    }
    assert_eq!(payloads, vec!["first", "second", "third"]);

    let extra = timeout(Duration::from_millis(100), subscription.recv()).await;
    assert!(extra.is_err(), "duplicate reached the application");
    assert_eq!(subscriber.stats().duplicates_suppressed, 3);
    assert_eq!(publisher.stats().completed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_max_outstanding_rejects_with_overloaded() {
    let connector = LoopbackConnector::new(LoopbackBroker::with_faults(LoopbackFaults {
        unresponsive: true,
        ..LoopbackFaults::default()
    }));
    let publisher = connect_with(&connector, SessionConfig::new("pub").with_max_outstanding(1)).await;

    let first = publisher
        .publish(envelope("busy/a", b"1", QoS::AtLeastOnce))
        .await
        .expect("first fits");
    let second = publisher
        .publish(envelope("busy/b", b"2", QoS::AtLeastOnce))
        .await;
    assert_eq!(second.err(), Some(HarnessError::Overloaded { limit: 1 }));

    // QoS 0 does not occupy the window
    assert!(publisher
        .publish(envelope("busy/c", b"3", QoS::AtMostOnce))
        .await
        .is_ok());
    assert_eq!(publisher.stats().outstanding, 1);
    drop(first);
}

#[tokio::test]
async fn test_refused_connection_is_connect_error() {
    let connector = LoopbackConnector::new(LoopbackBroker::with_faults(LoopbackFaults {
        refuse_connections: Some(ReasonCode::ServerUnavailable),
        ..LoopbackFaults::default()
    }));

    let result = Session::connect(
        &connector,
        "loopback",
        &Credentials::anonymous(),
        SessionConfig::new("refused"),
        RetainedStore::new(),
    )
    .await;
    assert!(matches!(result, Err(HarnessError::ConnectError(_))));
}

#[tokio::test]
async fn test_bad_credentials_are_connect_error() {
    let broker = LoopbackBroker::with_credentials(Credentials::new("load", "secret"));
    let connector = LoopbackConnector::new(broker.clone());

    let wrong = Session::connect(
        &connector,
        "loopback",
        &Credentials::new("load", "guess"),
        SessionConfig::new("intruder"),
        RetainedStore::new(),
    )
    .await;
    assert!(matches!(wrong, Err(HarnessError::ConnectError(_))));

    let right = Session::connect(
        &connector,
        "loopback",
        &Credentials::new("load", "secret"),
        SessionConfig::new("operator"),
        RetainedStore::new(),
    )
    .await
    .expect("valid credentials");
    assert_eq!(broker.connected_clients(), 1);
    right.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out_without_connack() {
    let result = Session::connect(
        &SilentConnector,
        "nowhere",
        &Credentials::anonymous(),
        SessionConfig::new("waiting").with_connect_timeout(Duration::from_secs(2)),
        RetainedStore::new(),
    )
    .await;
    assert!(matches!(result, Err(HarnessError::ConnectError(_))));
}

/// Opens transports that never answer anything.
struct SilentConnector;

struct SilentTransport;

impl mqttload::Transport for SilentTransport {
    async fn send(&mut self, _packet: mqttload::Packet) -> mqttload::Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> mqttload::Result<Option<mqttload::Packet>> {
        std::future::pending().await
    }

    async fn close(&mut self) -> mqttload::Result<()> {
        Ok(())
    }
}

impl mqttload::Connector for SilentConnector {
    type Transport = SilentTransport;

    async fn open(&self, _endpoint: &str) -> mqttload::Result<SilentTransport> {
        Ok(SilentTransport)
    }
}

#[tokio::test(start_paused = true)]
async fn test_server_disconnect_fails_outstanding_deliveries() {
    let broker = LoopbackBroker::with_faults(LoopbackFaults {
        unresponsive: true,
        ..LoopbackFaults::default()
    });
    let connector = LoopbackConnector::new(broker.clone());
    let session = connect(&connector, "victim").await;

    let handle = session
        .publish(envelope("doomed/topic", b"x", QoS::ExactlyOnce))
        .await
        .unwrap();
    assert!(broker.disconnect_client("victim"));

    assert_eq!(handle.await, Err(HarnessError::SessionClosed));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(session.is_closed());
    assert_eq!(
        session
            .publish(envelope("doomed/topic", b"y", QoS::AtMostOnce))
            .await
            .err(),
        Some(HarnessError::SessionClosed)
    );
}

#[tokio::test]
async fn test_dropping_session_ends_subscriptions() {
    let connector = LoopbackConnector::new(LoopbackBroker::new());
    let session = connect(&connector, "short-lived").await;
    let mut subscription = session.subscribe("any/#", QoS::AtMostOnce).await.unwrap();

    drop(session);

    let end = timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("stream should end");
    assert!(end.is_none());
}

#[tokio::test]
async fn test_unsubscribe_ends_stream() {
    let connector = LoopbackConnector::new(LoopbackBroker::new());
    let subscriber = connect(&connector, "sub").await;
    let publisher = connect(&connector, "pub").await;
    let mut subscription = subscriber.subscribe("news/#", QoS::AtLeastOnce).await.unwrap();

    subscriber.unsubscribe("news/#").await.expect("unsubscribe");
    publisher
        .publish(envelope("news/today", b"late", QoS::AtLeastOnce))
        .await
        .unwrap()
        .await
        .unwrap();

    let end = timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("stream should end");
    assert!(end.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_waits_for_outstanding_acks() {
    let broker = LoopbackBroker::with_faults(LoopbackFaults {
        drop_pubacks: 1,
        ..LoopbackFaults::default()
    });
    let connector = LoopbackConnector::new(broker);
    let session = connect_with(
        &connector,
        SessionConfig::new("graceful").with_disconnect_grace(Duration::from_secs(5)),
    )
    .await;

    let handle = session
        .publish(envelope("grace/topic", b"x", QoS::AtLeastOnce))
        .await
        .unwrap();
    let started = Instant::now();
    session.disconnect().await.unwrap();

    assert!(matches!(
        handle.await,
        Ok(PublishOutcome::Acked { attempts: 2, .. })
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_invalid_filter_is_rejected_before_sending() {
    let connector = LoopbackConnector::new(LoopbackBroker::new());
    let session = connect(&connector, "sub").await;

    let result = session.subscribe("bad/#/filter", QoS::AtMostOnce).await;
    assert!(matches!(result, Err(HarnessError::InvalidTopicFilter(_))));
    assert!(!session.is_closed());
}
