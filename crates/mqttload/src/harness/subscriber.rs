use super::payload::LoadPayload;
use super::Counters;
use crate::cancel::CancelToken;
use crate::session::Subscription;
use hdrhistogram::Histogram;
use mqttload_protocol::{Envelope, HarnessError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::trace;

/// What one subscriber observed.
#[derive(Debug, Clone)]
pub(crate) struct SubscriberStats {
    pub received: u64,
    pub duplicates: u64,
    pub ignored: u64,
    /// Unique (publisher, sequence) pairs seen.
    pub seen: HashSet<(u32, u64)>,
    pub received_by_publisher: HashMap<u32, u64>,
    pub duplicates_by_publisher: HashMap<u32, u64>,
    /// Microseconds from publish to receipt.
    pub latency: Histogram<u64>,
}

impl SubscriberStats {
    /// # Errors
    ///
    /// Returns `Configuration` if the latency histogram cannot be created
    pub(crate) fn new() -> Result<Self> {
        let latency = Histogram::new(3)
            .map_err(|e| HarnessError::Configuration(format!("latency histogram: {e}")))?;
        Ok(Self {
            received: 0,
            duplicates: 0,
            ignored: 0,
            seen: HashSet::new(),
            received_by_publisher: HashMap::new(),
            duplicates_by_publisher: HashMap::new(),
            latency,
        })
    }

    /// How many of `sequences` from `publisher` never arrived.
    pub(crate) fn missing(&self, publisher: u32, sequences: &[u64]) -> u64 {
        sequences
            .iter()
            .filter(|seq| !self.seen.contains(&(publisher, **seq)))
            .count() as u64
    }

    /// Returns true for the first sight of a load message.
    fn observe(&mut self, envelope: &Envelope, received_at_micros: u64) -> bool {
        if envelope.retain() {
            // replayed from the retained cache, not part of the live load
            self.ignored += 1;
            return false;
        }
        let Some(header) = LoadPayload::decode(envelope.payload()) else {
            self.ignored += 1;
            return false;
        };

        if !self.seen.insert((header.publisher, header.sequence)) {
            self.duplicates += 1;
            *self
                .duplicates_by_publisher
                .entry(header.publisher)
                .or_default() += 1;
            trace!(
                "Duplicate message {} from publisher {}",
                header.sequence,
                header.publisher
            );
            return false;
        }

        self.received += 1;
        *self
            .received_by_publisher
            .entry(header.publisher)
            .or_default() += 1;
        let latency = received_at_micros.saturating_sub(header.sent_at_micros);
        if self.latency.record(latency).is_err() {
            trace!("Latency sample {} out of range", latency);
        }
        true
    }
}

/// Consumes `subscription` until `stop` fires, then takes whatever is
/// already queued.
pub(crate) async fn run_subscriber(
    mut subscription: Subscription,
    mut stats: SubscriberStats,
    epoch: Instant,
    counters: Arc<Counters>,
    stop: CancelToken,
) -> SubscriberStats {
    while let Some(envelope) = subscription.recv_or_cancel(&stop).await {
        if stats.observe(&envelope, micros_since(epoch)) {
            counters.received.fetch_add(1, Ordering::Relaxed);
        }
    }
    while let Some(envelope) = subscription.try_recv() {
        if stats.observe(&envelope, micros_since(epoch)) {
            counters.received.fetch_add(1, Ordering::Relaxed);
        }
    }

    stats
}

#[allow(clippy::cast_possible_truncation)]
fn micros_since(epoch: Instant) -> u64 {
    epoch.elapsed().as_micros() as u64
}
