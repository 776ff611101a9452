//! Multi-publisher, multi-subscriber load runs.
//!
//! A run connects every subscriber first so nothing published is missed,
//! then the publishers. Publishers send at a fixed rate for the configured
//! duration and drain their outstanding deliveries. Subscribers are stopped
//! once every expected message arrived or the drain timeout passed. Per-message
//! failures are counted in the report, only connection and configuration
//! errors abort the run.

pub mod payload;
mod publisher;
mod subscriber;

use crate::cancel::{CancelSource, CancelToken};
use crate::config::HarnessConfig;
use crate::report::{LatencySummary, QosBreakdown, Report, RunSettings};
use crate::retained::RetainedStore;
use crate::session::Session;
use crate::transport::Connector;
use hdrhistogram::Histogram;
use mqttload_protocol::{topic_matches_filter, HarnessError, Result};
use publisher::{run_publisher, PublisherPlan, PublisherStats};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subscriber::{run_subscriber, SubscriberStats};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Live counters shared with the progress log.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub sent: AtomicU64,
    pub received: AtomicU64,
}

const SETTLE_POLL: Duration = Duration::from_millis(10);

/// Failure kind recorded for a publisher or subscriber task that panicked.
pub const TASK_ABORTED: &str = "task_aborted";

pub struct StressHarness<C: Connector> {
    connector: C,
    config: HarnessConfig,
    cancel: CancelToken,
    retained: RetainedStore,
}

impl<C: Connector> StressHarness<C> {
    #[must_use]
    pub fn new(connector: C, config: HarnessConfig) -> Self {
        Self {
            connector,
            config,
            cancel: CancelToken::never(),
            retained: RetainedStore::new(),
        }
    }

    /// Stops publishing early when `token` fires; the run still drains and
    /// reports.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Shares an existing retained cache with the run's sessions.
    #[must_use]
    pub fn with_retained_store(mut self, retained: RetainedStore) -> Self {
        self.retained = retained;
        self
    }

    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Executes the run.
    ///
    /// # Errors
    ///
    /// `Configuration` for an invalid config, `ConnectError` when a session
    /// cannot be established or a subscriber cannot subscribe.
    pub async fn run(self) -> Result<Report> {
        self.config.validate()?;
        let config = &self.config;

        let run_id = rand::rng().random::<u32>();
        let prefix = format!("{}-{:08x}", config.client_id_prefix, run_id);
        let filter = config.effective_subscribe_filter();

        info!(
            "Connecting {} subscriber(s) and {} publisher(s) to {}",
            config.subscriber_count, config.publisher_count, config.endpoint
        );

        let mut subscriber_sessions = Vec::with_capacity(config.subscriber_count);
        let mut subscriptions = Vec::with_capacity(config.subscriber_count);
        for i in 0..config.subscriber_count {
            let session = self.connect(format!("{prefix}-sub-{i}")).await?;
            let subscription = session
                .subscribe(&filter, config.subscription_qos())
                .await
                .map_err(|e| {
                    HarnessError::ConnectError(format!("subscriber {i} could not subscribe: {e}"))
                })?;
            subscriber_sessions.push(session);
            subscriptions.push(subscription);
        }
        info!("Subscribed {} client(s) to {}", subscriptions.len(), filter);

        let mut publisher_sessions = Vec::with_capacity(config.publisher_count);
        for i in 0..config.publisher_count {
            publisher_sessions.push(self.connect(format!("{prefix}-pub-{i}")).await?);
        }

        let counters = Arc::new(Counters::default());
        let stop = CancelSource::new();
        let epoch = Instant::now();

        let subscriber_tasks: Vec<JoinHandle<SubscriberStats>> = subscriptions
            .into_iter()
            .map(|subscription| -> Result<JoinHandle<SubscriberStats>> {
                let stats = SubscriberStats::new()?;
                Ok(tokio::spawn(run_subscriber(
                    subscription,
                    stats,
                    epoch,
                    Arc::clone(&counters),
                    stop.token(),
                )))
            })
            .collect::<Result<_>>()?;

        let progress = config
            .progress_log
            .then(|| tokio::spawn(progress_log(Arc::clone(&counters), stop.token())));

        info!(
            "Publishing {} message(s) per publisher over {:?}",
            config.messages_per_publisher(),
            config.duration
        );
        let publisher_tasks: Vec<JoinHandle<PublisherStats>> = publisher_sessions
            .into_iter()
            .enumerate()
            .map(|(i, session)| {
                let plan = self.plan_for(i);
                tokio::spawn(run_publisher(
                    session,
                    plan,
                    epoch,
                    Arc::clone(&counters),
                    self.cancel.clone(),
                ))
            })
            .collect();

        let mut publishers = Vec::with_capacity(publisher_tasks.len());
        let mut aborted_tasks = 0;
        for task in publisher_tasks {
            match task.await {
                Ok(stats) => publishers.push(stats),
                Err(e) => {
                    warn!("Publisher task failed: {}", e);
                    aborted_tasks += 1;
                }
            }
        }

        let expected = self.expected_unique(&publishers);
        let settle_deadline = Instant::now() + config.drain_timeout;
        while counters.received.load(Ordering::Relaxed) < expected
            && Instant::now() < settle_deadline
        {
            tokio::time::sleep(SETTLE_POLL).await;
        }
        let elapsed = epoch.elapsed();

        stop.cancel();
        let mut subscribers = Vec::with_capacity(subscriber_tasks.len());
        for task in subscriber_tasks {
            match task.await {
                Ok(stats) => subscribers.push(stats),
                Err(e) => {
                    warn!("Subscriber task failed: {}", e);
                    aborted_tasks += 1;
                }
            }
        }
        let samples = match progress {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        for session in subscriber_sessions {
            if let Err(e) = session.disconnect().await {
                debug!("Subscriber disconnect failed: {}", e);
            }
        }

        let report = self.build_report(
            &publishers,
            &subscribers,
            elapsed,
            samples,
            self.cancel.is_cancelled(),
            aborted_tasks,
        );
        report.log();
        Ok(report)
    }

    async fn connect(&self, client_id: String) -> Result<Session> {
        Session::connect(
            &self.connector,
            &self.config.endpoint,
            &self.config.credentials,
            self.config.session_config(client_id),
            self.retained.clone(),
        )
        .await
    }

    #[allow(clippy::cast_possible_truncation)]
    fn plan_for(&self, index: usize) -> PublisherPlan {
        PublisherPlan {
            index: index as u32,
            topic: self.config.topic_for(index),
            qos: self.config.qos_for(index),
            retain: self.config.retain,
            message_size: self.config.message_size,
            interval: self.config.publish_interval(),
            count: self.config.messages_per_publisher(),
            drain_timeout: self.config.drain_timeout,
            limits: self.config.session_config("").limits(),
        }
    }

    /// Subscribers whose filter covers publisher `index`'s topic.
    fn audience(&self, index: u32) -> u64 {
        let filter = self.config.effective_subscribe_filter();
        if topic_matches_filter(&self.config.topic_for(index as usize), &filter) {
            self.config.subscriber_count as u64
        } else {
            0
        }
    }

    fn expected_unique(&self, publishers: &[PublisherStats]) -> u64 {
        publishers
            .iter()
            .map(|p| p.sent * self.audience(p.index))
            .sum()
    }

    fn build_report(
        &self,
        publishers: &[PublisherStats],
        subscribers: &[SubscriberStats],
        elapsed: Duration,
        samples: Vec<u64>,
        cancelled: bool,
        aborted_tasks: u64,
    ) -> Report {
        let mut failures: BTreeMap<String, u64> = BTreeMap::new();
        if aborted_tasks > 0 {
            failures.insert(TASK_ABORTED.to_string(), aborted_tasks);
        }
        let mut per_qos: BTreeMap<u8, QosBreakdown> = BTreeMap::new();
        let mut latency = Histogram::<u64>::new(3).ok();

        for publisher in publishers {
            for (kind, count) in &publisher.failures {
                *failures.entry((*kind).to_string()).or_default() += count;
            }

            let breakdown = per_qos.entry(publisher.qos.as_u8()).or_default();
            breakdown.publishers += 1;
            breakdown.sent += publisher.sent;
            breakdown.acknowledged += publisher.acknowledged;
            breakdown.failed += publisher.failed();

            if publisher.qos.requires_ack() && self.audience(publisher.index) > 0 {
                for subscriber in subscribers {
                    breakdown.loss += subscriber.missing(publisher.index, &publisher.published);
                    breakdown.acknowledged_loss +=
                        subscriber.missing(publisher.index, &publisher.confirmed);
                }
            }

            for subscriber in subscribers {
                breakdown.received += subscriber
                    .received_by_publisher
                    .get(&publisher.index)
                    .copied()
                    .unwrap_or_default();
                breakdown.duplicates += subscriber
                    .duplicates_by_publisher
                    .get(&publisher.index)
                    .copied()
                    .unwrap_or_default();
            }
        }

        for subscriber in subscribers {
            if let Some(histogram) = latency.as_mut() {
                if let Err(e) = histogram.add(&subscriber.latency) {
                    debug!("Could not merge latency samples: {}", e);
                }
            }
        }

        let received: u64 = subscribers.iter().map(|s| s.received).sum();
        let elapsed_secs = elapsed.as_secs_f64();

        Report {
            settings: RunSettings::from(&self.config),
            sent: publishers.iter().map(|p| p.sent).sum(),
            acknowledged: publishers.iter().map(|p| p.acknowledged).sum(),
            failed: publishers.iter().map(PublisherStats::failed).sum::<u64>() + aborted_tasks,
            failures,
            retransmitted: publishers.iter().map(|p| p.retransmitted).sum(),
            received,
            duplicates: subscribers.iter().map(|s| s.duplicates).sum(),
            loss: per_qos.values().map(|b| b.loss).sum(),
            acknowledged_loss: per_qos.values().map(|b| b.acknowledged_loss).sum(),
            aborted_tasks,
            ignored: subscribers.iter().map(|s| s.ignored).sum(),
            latency: latency
                .as_ref()
                .map(LatencySummary::from_histogram)
                .unwrap_or_default(),
            per_qos,
            elapsed_secs,
            throughput: if elapsed_secs > 0.0 {
                received as f64 / elapsed_secs
            } else {
                0.0
            },
            samples,
            cancelled,
        }
    }
}

/// Logs sent and received counts once per second until `stop` fires,
/// returning the per-second received deltas.
async fn progress_log(counters: Arc<Counters>, stop: CancelToken) -> Vec<u64> {
    let mut samples = Vec::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    let mut last_received = 0;

    loop {
        tokio::select! {
            () = stop.cancelled() => return samples,
            _ = ticker.tick() => {
                let received = counters.received.load(Ordering::Relaxed);
                let delta = received - last_received;
                last_received = received;
                samples.push(delta);
                info!(
                    "{}s: sent {}, received {} ({} msg/s)",
                    samples.len(),
                    counters.sent.load(Ordering::Relaxed),
                    received,
                    delta
                );
            }
        }
    }
}
