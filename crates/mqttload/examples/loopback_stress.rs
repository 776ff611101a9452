//! Runs a stress pass against the in-process loopback broker and prints the
//! JSON report.
//!
//! ```text
//! cargo run -p mqttload --example loopback_stress --features test-util [config.json]
//! ```
//!
//! Set `RUST_LOG=mqttload=debug` for per-session logs.

use anyhow::Context;
use mqttload::testing::{LoopbackBroker, LoopbackConnector, LoopbackFaults};
use mqttload::{CancelSource, HarnessConfig, QoS, StressHarness};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mqttload=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => HarnessConfig::from_json_file(&path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => HarnessConfig::builder()
            .publishers(5)
            .subscribers(2)
            .qos(QoS::ExactlyOnce)
            .message_rate(100)
            .duration(Duration::from_secs(5))
            .build()
            .context("invalid default config")?,
    };

    // a few lost PUBACKs and duplicated deliveries keep the retry and
    // dedup paths busy
    let broker = LoopbackBroker::with_faults(LoopbackFaults {
        drop_pubacks: 10,
        duplicate_deliveries: true,
        ..LoopbackFaults::default()
    });

    let cancel = CancelSource::new();
    let token = cancel.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, draining");
            cancel.cancel();
        }
    });

    let report = StressHarness::new(LoopbackConnector::new(broker), config)
        .with_cancel(token)
        .run()
        .await
        .context("stress run failed")?;

    println!(
        "{}",
        report.to_json_pretty().context("failed to serialize report")?
    );
    if !report.is_lossless() {
        anyhow::bail!(
            "{} deliveries lost ({} acknowledged), {} task(s) aborted",
            report.loss,
            report.acknowledged_loss,
            report.aborted_tasks
        );
    }
    Ok(())
}
