//! Stress-run results.

use crate::config::HarnessConfig;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Settings the run was started with, echoed in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSettings {
    pub endpoint: String,
    pub publishers: usize,
    pub subscribers: usize,
    pub qos: u8,
    pub mixed_qos: bool,
    pub message_rate: u32,
    pub message_size: usize,
    pub duration_ms: u64,
    pub topic_pattern: String,
    pub subscribe_filter: String,
    pub retain: bool,
    pub max_attempts: u32,
    pub retry_timeout_ms: u64,
}

impl From<&HarnessConfig> for RunSettings {
    #[allow(clippy::cast_possible_truncation)]
    fn from(config: &HarnessConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            publishers: config.publisher_count,
            subscribers: config.subscriber_count,
            qos: config.qos.as_u8(),
            mixed_qos: config.mixed_qos,
            message_rate: config.message_rate,
            message_size: config.message_size,
            duration_ms: config.duration.as_millis() as u64,
            topic_pattern: config.topic_pattern.clone(),
            subscribe_filter: config.effective_subscribe_filter(),
            retain: config.retain,
            max_attempts: config.max_attempts,
            retry_timeout_ms: config.retry_timeout.as_millis() as u64,
        }
    }
}

/// End-to-end latency in microseconds, publish to subscriber receipt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub min_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencySummary {
    #[must_use]
    pub fn from_histogram(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }
        Self {
            samples: histogram.len(),
            min_us: histogram.min(),
            mean_us: histogram.mean(),
            p50_us: histogram.value_at_quantile(0.50),
            p90_us: histogram.value_at_quantile(0.90),
            p99_us: histogram.value_at_quantile(0.99),
            max_us: histogram.max(),
        }
    }
}

/// Counters for the publishers of one QoS level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QosBreakdown {
    pub publishers: usize,
    pub sent: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub received: u64,
    pub duplicates: u64,
    /// Sent messages a matching subscriber never saw, whether or not the
    /// broker acknowledged them. Always zero for QoS 0, which promises nothing.
    pub loss: u64,
    /// The part of `loss` the broker had acknowledged.
    pub acknowledged_loss: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub settings: RunSettings,
    pub sent: u64,
    pub acknowledged: u64,
    pub failed: u64,
    /// Failures keyed by error kind.
    pub failures: BTreeMap<String, u64>,
    pub retransmitted: u64,
    pub received: u64,
    pub duplicates: u64,
    /// QoS 1/2 messages sent but not delivered, summed over subscribers.
    pub loss: u64,
    /// Lost messages the broker had acknowledged.
    pub acknowledged_loss: u64,
    /// Publisher or subscriber tasks that panicked; their counts are missing.
    pub aborted_tasks: u64,
    /// Retained replays and payloads that did not come from a publisher.
    pub ignored: u64,
    pub latency: LatencySummary,
    pub per_qos: BTreeMap<u8, QosBreakdown>,
    pub elapsed_secs: f64,
    /// Unique messages received per second over the whole run.
    pub throughput: f64,
    /// Unique messages received in each second of the run.
    pub samples: Vec<u64>,
    pub cancelled: bool,
}

impl Report {
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_secs)
    }

    #[must_use]
    pub fn is_lossless(&self) -> bool {
        self.loss == 0 && self.aborted_tasks == 0
    }

    /// Share of sent QoS 1/2 deliveries that never arrived.
    #[must_use]
    pub fn loss_rate(&self, subscribers: usize) -> f64 {
        let expected: u64 = self
            .per_qos
            .iter()
            .filter(|(qos, _)| **qos > 0)
            .map(|(_, breakdown)| breakdown.sent)
            .sum::<u64>()
            * subscribers as u64;
        if expected == 0 {
            0.0
        } else {
            self.loss as f64 / expected as f64
        }
    }

    #[must_use]
    pub fn failures_of(&self, kind: &str) -> u64 {
        self.failures.get(kind).copied().unwrap_or_default()
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes the summary to the tracing sink.
    pub fn log(&self) {
        info!(
            "Run finished in {:.2}s: sent {}, acknowledged {}, failed {}, received {}, duplicates {}, loss {} ({} acknowledged)",
            self.elapsed_secs,
            self.sent,
            self.acknowledged,
            self.failed,
            self.received,
            self.duplicates,
            self.loss,
            self.acknowledged_loss
        );
        if self.aborted_tasks > 0 {
            warn!("{} harness task(s) aborted, their counts are missing", self.aborted_tasks);
        }
        info!(
            "Latency (us): min {} mean {:.1} p50 {} p90 {} p99 {} max {} over {} samples",
            self.latency.min_us,
            self.latency.mean_us,
            self.latency.p50_us,
            self.latency.p90_us,
            self.latency.p99_us,
            self.latency.max_us,
            self.latency.samples
        );
        info!(
            "Throughput: {:.1} msg/s, retransmitted {}",
            self.throughput, self.retransmitted
        );
        for (qos, breakdown) in &self.per_qos {
            info!(
                "QoS {}: {} publisher(s), sent {}, acknowledged {}, failed {}, received {}, loss {}",
                qos,
                breakdown.publishers,
                breakdown.sent,
                breakdown.acknowledged,
                breakdown.failed,
                breakdown.received,
                breakdown.loss
            );
        }
        for (kind, count) in &self.failures {
            info!("Failure {}: {}", kind, count);
        }
    }
}
