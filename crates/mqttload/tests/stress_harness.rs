use mqttload::testing::{LoopbackBroker, LoopbackConnector, LoopbackFaults};
use mqttload::{
    CancelSource, Credentials, HarnessConfig, HarnessError, QoS, ReasonCode, RetainedStore,
    StressHarness,
};
use std::time::Duration;

fn harness(broker: LoopbackBroker, config: HarnessConfig) -> StressHarness<LoopbackConnector> {
    StressHarness::new(LoopbackConnector::new(broker), config)
}

#[tokio::test(start_paused = true)]
async fn test_qos1_run_is_lossless() {
    let config = HarnessConfig::builder()
        .publishers(5)
        .subscribers(1)
        .qos(QoS::AtLeastOnce)
        .message_rate(100)
        .duration(Duration::from_secs(10))
        .build()
        .unwrap();

    let report = harness(LoopbackBroker::new(), config).run().await.unwrap();

    assert_eq!(report.sent, 5000);
    assert_eq!(report.acknowledged, 5000);
    assert_eq!(report.failed, 0);
    assert_eq!(report.received, 5000);
    assert_eq!(report.duplicates, 0);
    assert!(report.is_lossless());
    assert!(!report.cancelled);
    assert_eq!(report.per_qos[&1].publishers, 5);
    assert!(report.throughput > 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_to_every_subscriber() {
    let config = HarnessConfig::builder()
        .publishers(2)
        .subscribers(3)
        .qos(QoS::ExactlyOnce)
        .message_rate(20)
        .duration(Duration::from_secs(2))
        .build()
        .unwrap();

    let report = harness(LoopbackBroker::new(), config).run().await.unwrap();

    assert_eq!(report.sent, 80);
    assert_eq!(report.acknowledged, 80);
    assert_eq!(report.received, 240);
    assert_eq!(report.loss, 0);
    assert!(report.loss_rate(3).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_mixed_qos_breakdown() {
    let config = HarnessConfig::builder()
        .publishers(3)
        .subscribers(1)
        .mixed_qos(true)
        .message_rate(10)
        .duration(Duration::from_secs(1))
        .build()
        .unwrap();

    let report = harness(LoopbackBroker::new(), config).run().await.unwrap();

    assert_eq!(report.per_qos.len(), 3);
    assert_eq!(report.per_qos[&0].sent, 10);
    assert_eq!(report.per_qos[&0].acknowledged, 0);
    assert_eq!(report.per_qos[&1].acknowledged, 10);
    assert_eq!(report.per_qos[&2].acknowledged, 10);
    assert_eq!(report.received, 30);
    assert!(report.is_lossless());
}

#[tokio::test(start_paused = true)]
async fn test_delivered_but_unacknowledged_is_failure_not_loss() {
    let broker = LoopbackBroker::with_faults(LoopbackFaults {
        drop_pubacks: usize::MAX,
        ..LoopbackFaults::default()
    });
    let config = HarnessConfig::builder()
        .publishers(1)
        .subscribers(1)
        .qos(QoS::AtLeastOnce)
        .message_rate(10)
        .duration(Duration::from_secs(1))
        .retry(Duration::from_millis(100), 3)
        .build()
        .unwrap();

    let report = harness(broker, config).run().await.unwrap();

    assert_eq!(report.sent, 10);
    assert_eq!(report.acknowledged, 0);
    assert_eq!(report.failures_of("delivery_timeout"), 10);
    assert_eq!(report.retransmitted, 20);
    assert_eq!(report.received, 10);
    assert_eq!(report.duplicates, 20);
    assert_eq!(report.loss, 0);
    assert!(report.is_lossless());
}

#[tokio::test(start_paused = true)]
async fn test_broker_going_silent_mid_run_is_loss() {
    let broker = LoopbackBroker::new();
    let config = HarnessConfig::builder()
        .publishers(1)
        .subscribers(1)
        .qos(QoS::AtLeastOnce)
        .message_rate(10)
        .duration(Duration::from_secs(1))
        .retry(Duration::from_millis(100), 3)
        .build()
        .unwrap();

    let silenced = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        silenced.set_faults(LoopbackFaults {
            unresponsive: true,
            ..LoopbackFaults::default()
        });
    });
    let report = harness(broker, config).run().await.unwrap();

    assert_eq!(report.sent, 10);
    assert_eq!(report.acknowledged, 1);
    assert_eq!(report.failures_of("delivery_timeout"), 9);
    assert_eq!(report.received, 1);
    assert_eq!(report.loss, 9);
    assert_eq!(report.acknowledged_loss, 0);
    assert_eq!(report.per_qos[&1].loss, 9);
    assert!(!report.is_lossless());
}

#[tokio::test]
async fn test_sub_nanosecond_interval_rejected() {
    let result = HarnessConfig::builder()
        .message_rate(2_000_000_000)
        .duration(Duration::from_nanos(1))
        .build();
    assert!(matches!(result, Err(HarnessError::Configuration(_))));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_publishing_early() {
    let config = HarnessConfig::builder()
        .publishers(2)
        .subscribers(1)
        .qos(QoS::AtLeastOnce)
        .message_rate(100)
        .duration(Duration::from_secs(10))
        .build()
        .unwrap();
    let cancel = CancelSource::new();
    let token = cancel.token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
    });
    let report = harness(LoopbackBroker::new(), config)
        .with_cancel(token)
        .run()
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(report.sent > 0);
    assert!(report.sent < 2000);
    assert_eq!(report.acknowledged, report.sent);
    assert!(report.is_lossless());
}

#[tokio::test]
async fn test_refused_broker_aborts_run() {
    let broker = LoopbackBroker::with_faults(LoopbackFaults {
        refuse_connections: Some(ReasonCode::NotAuthorized),
        ..LoopbackFaults::default()
    });
    let config = HarnessConfig::builder().publishers(1).subscribers(1).build().unwrap();

    let result = harness(broker, config).run().await;
    assert!(matches!(result, Err(HarnessError::ConnectError(_))));
}

#[tokio::test(start_paused = true)]
async fn test_credentials_are_passed_to_every_session() {
    let credentials = Credentials::new("load", "secret");
    let config = HarnessConfig::builder()
        .credentials(credentials.clone())
        .publishers(2)
        .subscribers(2)
        .qos(QoS::AtMostOnce)
        .message_rate(10)
        .duration(Duration::from_secs(1))
        .build()
        .unwrap();

    let report = harness(LoopbackBroker::with_credentials(credentials), config)
        .run()
        .await
        .unwrap();
    assert_eq!(report.sent, 20);
    assert_eq!(report.received, 40);
}

#[tokio::test(start_paused = true)]
async fn test_retained_load_still_counts_live_copies() {
    let store = RetainedStore::new();
    let config = HarnessConfig::builder()
        .publishers(1)
        .subscribers(1)
        .qos(QoS::AtLeastOnce)
        .retain(true)
        .message_rate(10)
        .duration(Duration::from_secs(1))
        .build()
        .unwrap();

    let report = harness(LoopbackBroker::new(), config)
        .with_retained_store(store.clone())
        .run()
        .await
        .unwrap();

    // the broker clears retain on forward, so live copies still count
    assert_eq!(report.received, 10);
    assert_eq!(store.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_report_serializes_to_json() {
    let config = HarnessConfig::builder()
        .publishers(1)
        .subscribers(1)
        .qos(QoS::AtLeastOnce)
        .message_rate(10)
        .duration(Duration::from_secs(1))
        .build()
        .unwrap();

    let report = harness(LoopbackBroker::new(), config).run().await.unwrap();
    let json = report.to_json_pretty().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert_eq!(value["sent"], 10);
    assert_eq!(value["settings"]["qos"], 1);
    assert!(value["latency"]["p99_us"].is_u64());
}
