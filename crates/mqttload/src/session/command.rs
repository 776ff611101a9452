use super::subscription::Subscription;
use mqttload_protocol::{Envelope, PublishOutcome, QoS, Result};
use tokio::sync::oneshot;

/// Requests from a [`Session`](super::Session) handle to its task.
#[derive(Debug)]
pub(crate) enum Command {
    Publish {
        envelope: Envelope,
        /// Accepted with the assigned packet id, or refused.
        accepted: oneshot::Sender<Result<Option<u16>>>,
        outcome: oneshot::Sender<Result<PublishOutcome>>,
    },
    Subscribe {
        topic_filter: String,
        qos: QoS,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    Unsubscribe {
        topic_filter: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

impl Command {
    /// Answers the command with `SessionClosed` without running it.
    pub(crate) fn reject_closed(self) {
        use mqttload_protocol::HarnessError::SessionClosed;
        match self {
            Command::Publish { accepted, .. } => {
                let _ = accepted.send(Err(SessionClosed));
            }
            Command::Subscribe { reply, .. } => {
                let _ = reply.send(Err(SessionClosed));
            }
            Command::Unsubscribe { reply, .. } => {
                let _ = reply.send(Err(SessionClosed));
            }
            Command::Disconnect { done } => {
                let _ = done.send(());
            }
        }
    }
}
