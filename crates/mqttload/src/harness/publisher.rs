use super::payload::LoadPayload;
use super::Counters;
use crate::cancel::CancelToken;
use crate::session::{DeliveryHandle, Session};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use mqttload_protocol::{Envelope, EnvelopeLimits, HarnessError, PublishOutcome, QoS, Result};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

type Completion = BoxFuture<'static, (u64, Result<PublishOutcome>)>;

/// What one publisher is asked to send.
#[derive(Debug, Clone)]
pub(crate) struct PublisherPlan {
    pub index: u32,
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub message_size: usize,
    pub interval: Duration,
    pub count: u64,
    pub drain_timeout: Duration,
    pub limits: EnvelopeLimits,
}

/// Outcome of one publisher's run.
#[derive(Debug, Clone, Default)]
pub(crate) struct PublisherStats {
    pub index: u32,
    pub qos: QoS,
    pub sent: u64,
    pub acknowledged: u64,
    pub failures: BTreeMap<&'static str, u64>,
    /// Sequences the session accepted for sending.
    pub published: Vec<u64>,
    /// Sequences whose QoS 1/2 handshake finished successfully.
    pub confirmed: Vec<u64>,
    pub retransmitted: u64,
}

impl PublisherStats {
    fn new(plan: &PublisherPlan) -> Self {
        Self {
            index: plan.index,
            qos: plan.qos,
            ..Self::default()
        }
    }

    pub fn failed(&self) -> u64 {
        self.failures.values().sum()
    }

    fn record_failure(&mut self, error: &HarnessError) {
        *self.failures.entry(error.kind()).or_default() += 1;
    }

    fn record_outcome(&mut self, sequence: u64, result: Result<PublishOutcome>) {
        match result {
            Ok(PublishOutcome::Sent) => {}
            Ok(PublishOutcome::Acked { .. } | PublishOutcome::Completed { .. }) => {
                self.acknowledged += 1;
                self.confirmed.push(sequence);
            }
            Err(e) => {
                debug!("Publisher {} message {} failed: {}", self.index, sequence, e);
                self.record_failure(&e);
            }
        }
    }
}

/// Publishes `plan.count` messages at a fixed rate, then waits up to the
/// drain timeout for their completions and disconnects.
pub(crate) async fn run_publisher(
    session: Session,
    plan: PublisherPlan,
    epoch: Instant,
    counters: Arc<Counters>,
    cancel: CancelToken,
) -> PublisherStats {
    let mut stats = PublisherStats::new(&plan);
    let mut in_flight: FuturesUnordered<Completion> = FuturesUnordered::new();
    let mut ticker = tokio::time::interval(plan.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sequence = 0;
    while sequence < plan.count {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("Publisher {} cancelled after {} messages", plan.index, sequence);
                break;
            }
            Some((seq, result)) = in_flight.next(), if !in_flight.is_empty() => {
                stats.record_outcome(seq, result);
            }
            _ = ticker.tick() => {
                match publish_one(&session, &plan, sequence, epoch).await {
                    Ok(handle) => {
                        stats.sent += 1;
                        stats.published.push(sequence);
                        counters.sent.fetch_add(1, Ordering::Relaxed);
                        let seq = sequence;
                        in_flight.push(handle.map(move |result| (seq, result)).boxed());
                    }
                    Err(e) => stats.record_failure(&e),
                }
                sequence += 1;
            }
        }
    }

    let drain_deadline = Instant::now() + plan.drain_timeout;
    while !in_flight.is_empty() {
        match tokio::time::timeout_at(drain_deadline, in_flight.next()).await {
            Ok(Some((seq, result))) => stats.record_outcome(seq, result),
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "Publisher {} gave up on {} outstanding deliveries",
                    plan.index,
                    in_flight.len()
                );
                let timeout = HarnessError::DeliveryTimeout { packet_id: 0 };
                for _ in 0..in_flight.len() {
                    stats.record_failure(&timeout);
                }
                break;
            }
        }
    }
    drop(in_flight);

    stats.retransmitted = session.stats().retransmitted;
    if let Err(e) = session.disconnect().await {
        debug!("Publisher {} disconnect failed: {}", plan.index, e);
    }
    stats
}

async fn publish_one(
    session: &Session,
    plan: &PublisherPlan,
    sequence: u64,
    epoch: Instant,
) -> Result<DeliveryHandle> {
    #[allow(clippy::cast_possible_truncation)]
    let payload = LoadPayload {
        publisher: plan.index,
        sequence,
        sent_at_micros: epoch.elapsed().as_micros() as u64,
    };
    let envelope = Envelope::new(
        plan.topic.as_str(),
        payload.encode(plan.message_size),
        plan.qos,
        plan.retain,
        &plan.limits,
    )?;
    session.publish(envelope).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> PublisherPlan {
        PublisherPlan {
            index: 3,
            topic: "load/3".to_string(),
            qos: QoS::AtLeastOnce,
            retain: false,
            message_size: 32,
            interval: Duration::from_millis(10),
            count: 5,
            drain_timeout: Duration::from_secs(1),
            limits: EnvelopeLimits::default(),
        }
    }

    #[test]
    fn test_outcomes_are_classified() {
        let mut stats = PublisherStats::new(&plan());
        stats.record_outcome(
            0,
            Ok(PublishOutcome::Acked {
                packet_id: 1,
                attempts: 1,
            }),
        );
        stats.record_outcome(1, Err(HarnessError::DeliveryTimeout { packet_id: 2 }));
        stats.record_outcome(2, Err(HarnessError::DeliveryTimeout { packet_id: 3 }));
        stats.record_failure(&HarnessError::Overloaded { limit: 1 });

        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.confirmed, vec![0]);
        assert_eq!(stats.failures["delivery_timeout"], 2);
        assert_eq!(stats.failures["overloaded"], 1);
        assert_eq!(stats.failed(), 3);
    }

    #[test]
    fn test_qos0_send_is_not_an_acknowledgment() {
        let mut stats = PublisherStats::new(&plan());
        stats.record_outcome(0, Ok(PublishOutcome::Sent));
        assert_eq!(stats.acknowledged, 0);
        assert!(stats.confirmed.is_empty());
    }
}
