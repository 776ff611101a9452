use crate::cancel::CancelToken;
use mqttload_protocol::{HarnessError, PublishOutcome, QoS, Result};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Completion of one publish.
///
/// Resolves once the QoS protocol reaches a terminal state. Waiting is
/// optional: dropping the handle does not cancel the delivery, the session
/// keeps retrying until the handshake finishes or the retry budget runs out.
#[derive(Debug)]
pub struct DeliveryHandle {
    packet_id: Option<u16>,
    qos: QoS,
    rx: oneshot::Receiver<Result<PublishOutcome>>,
}

impl DeliveryHandle {
    pub(crate) fn new(
        packet_id: Option<u16>,
        qos: QoS,
        rx: oneshot::Receiver<Result<PublishOutcome>>,
    ) -> Self {
        Self { packet_id, qos, rx }
    }

    #[must_use]
    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }

    #[must_use]
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Waits until `deadline`, then gives up with `DeliveryTimeout`.
    pub async fn wait_until(self, deadline: Instant) -> Result<PublishOutcome> {
        let packet_id = self.packet_id.unwrap_or_default();
        match tokio::time::timeout_at(deadline, self).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::DeliveryTimeout { packet_id }),
        }
    }

    /// Waits until the delivery resolves or `token` fires (`Cancelled`).
    pub async fn wait_or_cancel(self, token: &CancelToken) -> Result<PublishOutcome> {
        tokio::select! {
            result = self => result,
            () = token.cancelled() => Err(HarnessError::Cancelled),
        }
    }
}

impl Future for DeliveryHandle {
    type Output = Result<PublishOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(HarnessError::SessionClosed)))
    }
}
