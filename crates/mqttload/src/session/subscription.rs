use crate::cancel::CancelToken;
use futures_util::Stream;
use mqttload_protocol::{topic_matches_filter, Envelope, QoS};
use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::trace;

/// Inbound messages for one topic filter.
///
/// Retained entries that matched when the subscription was registered come
/// first, flagged `retain`. The stream ends when the filter is unsubscribed,
/// subscribed again, or the session goes away.
#[derive(Debug)]
pub struct Subscription {
    topic_filter: String,
    granted_qos: QoS,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    pub(crate) fn new(
        topic_filter: String,
        granted_qos: QoS,
        rx: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            topic_filter,
            granted_qos,
            rx,
        }
    }

    #[must_use]
    pub fn topic_filter(&self) -> &str {
        &self.topic_filter
    }

    #[must_use]
    pub fn granted_qos(&self) -> QoS {
        self.granted_qos
    }

    /// Next message, `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Like [`recv`](Self::recv) but returns `None` early once `token` fires.
    pub async fn recv_or_cancel(&mut self, token: &CancelToken) -> Option<Envelope> {
        tokio::select! {
            message = self.rx.recv() => message,
            () = token.cancelled() => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Active streams of one session, keyed by filter.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    streams: HashMap<String, mpsc::UnboundedSender<Envelope>>,
}

impl SubscriptionRegistry {
    /// Registers a stream for `topic_filter`, closing any previous one, and
    /// pushes `replay` into it before anything else.
    pub(crate) fn register(
        &mut self,
        topic_filter: &str,
        granted_qos: QoS,
        replay: impl IntoIterator<Item = Envelope>,
    ) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        for envelope in replay {
            let _ = tx.send(envelope);
        }
        if self.streams.insert(topic_filter.to_string(), tx).is_some() {
            trace!("Replaced stream for filter: {}", topic_filter);
        }
        Subscription::new(topic_filter.to_string(), granted_qos, rx)
    }

    pub(crate) fn remove(&mut self, topic_filter: &str) -> bool {
        self.streams.remove(topic_filter).is_some()
    }

    /// Fans `envelope` out to every matching stream, returning how many took it.
    pub(crate) fn deliver(&mut self, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        self.streams.retain(|filter, tx| {
            if !topic_matches_filter(envelope.topic(), filter) {
                return true;
            }
            if tx.send(envelope.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                trace!("Dropping stream for filter {} with no receiver", filter);
                false
            }
        });
        delivered
    }

    pub(crate) fn clear(&mut self) {
        self.streams.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }
}
