use super::command::Command;
use super::subscription::{Subscription, SubscriptionRegistry};
use crate::retained::RetainedStore;
use crate::transport::Transport;
use mqttload_protocol::{
    AckType, Clock, HarnessError, ProtocolAction, PublishOutcome, QoS, Result,
    SessionProtocol, SessionStats,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// The caller waiting on the actions currently being executed.
enum Reply {
    None,
    Publish {
        accepted: Option<oneshot::Sender<Result<Option<u16>>>>,
        outcome: Option<oneshot::Sender<Result<PublishOutcome>>>,
    },
    Subscribe {
        topic_filter: String,
        reply: Option<oneshot::Sender<Result<Subscription>>>,
    },
    Unsubscribe {
        reply: Option<oneshot::Sender<Result<()>>>,
    },
}

struct PendingSubscription {
    topic_filter: String,
    reply: oneshot::Sender<Result<Subscription>>,
}

/// How the run loop ended.
enum Exit {
    Disconnect(oneshot::Sender<()>),
    HandleDropped,
    Lost(HarnessError),
}

/// Background half of a [`Session`](super::Session): owns the transport and
/// the protocol state, executes the protocol's actions.
pub(crate) struct SessionTask<T: Transport> {
    protocol: SessionProtocol,
    transport: T,
    clock: Arc<dyn Clock>,
    commands: mpsc::UnboundedReceiver<Command>,
    retained: RetainedStore,
    subscriptions: SubscriptionRegistry,
    pending_publishes: HashMap<u16, oneshot::Sender<Result<PublishOutcome>>>,
    pending_subscribes: HashMap<u16, PendingSubscription>,
    pending_unsubscribes: HashMap<u16, oneshot::Sender<Result<()>>>,
    stats: Arc<Mutex<SessionStats>>,
    disconnect_grace: Duration,
}

impl<T: Transport> SessionTask<T> {
    pub(crate) fn new(
        protocol: SessionProtocol,
        transport: T,
        clock: Arc<dyn Clock>,
        commands: mpsc::UnboundedReceiver<Command>,
        retained: RetainedStore,
        stats: Arc<Mutex<SessionStats>>,
        disconnect_grace: Duration,
    ) -> Self {
        Self {
            protocol,
            transport,
            clock,
            commands,
            retained,
            subscriptions: SubscriptionRegistry::default(),
            pending_publishes: HashMap::new(),
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            stats,
            disconnect_grace,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Session task started for {}", self.protocol.client_id());

        let exit = self.run_loop().await;
        match exit {
            Exit::Disconnect(done) => {
                if let Err(e) = self.drain_outstanding().await {
                    debug!("Connection lost while draining: {}", e);
                    self.teardown(false).await;
                } else {
                    self.teardown(true).await;
                }
                let _ = done.send(());
            }
            Exit::HandleDropped => {
                debug!("Session handle dropped, closing {}", self.protocol.client_id());
                self.teardown(true).await;
            }
            Exit::Lost(e) => {
                warn!("Session {} lost its connection: {}", self.protocol.client_id(), e);
                self.teardown(false).await;
            }
        }

        debug!("Session task finished for {}", self.protocol.client_id());
    }

    async fn run_loop(&mut self) -> Exit {
        loop {
            let deadline = self.protocol.next_deadline().map(Instant::from_std);

            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Disconnect { done }) => return Exit::Disconnect(done),
                    Some(command) => self.handle_command(command).await,
                    None => return Exit::HandleDropped,
                },
                packet = self.transport.recv() => match packet {
                    Ok(Some(packet)) => {
                        trace!("Received {} packet", packet.name());
                        let actions = self.protocol.handle_packet(packet, self.clock.now());
                        self.execute(actions, Reply::None).await
                    }
                    Ok(None) => Err(HarnessError::Transport("broker closed the connection".to_string())),
                    Err(e) => Err(e),
                },
                () = sleep_until(deadline) => {
                    let actions = self.protocol.poll_timeouts(self.clock.now());
                    self.execute(actions, Reply::None).await
                }
            };

            self.publish_stats();
            if let Err(e) = step {
                return Exit::Lost(e);
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        let now = self.clock.now();
        match command {
            Command::Publish {
                envelope,
                accepted,
                outcome,
            } => match self.protocol.publish(&envelope, now) {
                Ok(actions) => {
                    let reply = Reply::Publish {
                        accepted: Some(accepted),
                        outcome: Some(outcome),
                    };
                    self.execute(actions, reply).await
                }
                Err(e) => {
                    trace!("Publish to {} refused: {}", envelope.topic(), e);
                    let _ = accepted.send(Err(e));
                    Ok(())
                }
            },
            Command::Subscribe {
                topic_filter,
                qos,
                reply,
            } => match self.protocol.subscribe(&topic_filter, qos, now) {
                Ok(actions) => {
                    let reply = Reply::Subscribe {
                        topic_filter,
                        reply: Some(reply),
                    };
                    self.execute(actions, reply).await
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Ok(())
                }
            },
            Command::Unsubscribe {
                topic_filter,
                reply,
            } => match self.protocol.unsubscribe(&topic_filter, now) {
                Ok(actions) => {
                    self.subscriptions.remove(&topic_filter);
                    self.execute(actions, Reply::Unsubscribe { reply: Some(reply) })
                        .await
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Ok(())
                }
            },
            Command::Disconnect { done } => {
                let _ = done.send(());
                Ok(())
            }
        }
    }

    /// Carries out `actions` in order. Stops at the first transport failure.
    async fn execute(&mut self, actions: Vec<ProtocolAction>, mut reply: Reply) -> Result<()> {
        for action in actions {
            match action {
                ProtocolAction::SendPacket(packet) => {
                    trace!("Sending {} packet", packet.name());
                    self.transport.send(packet).await?;
                }
                ProtocolAction::TrackPendingAck {
                    packet_id,
                    ack_type,
                } => self.track(packet_id, ack_type, &mut reply),
                ProtocolAction::PublishComplete { packet_id, result } => {
                    self.complete_publish(packet_id, result, &mut reply);
                }
                ProtocolAction::SubscribeComplete { packet_id, result } => {
                    self.complete_subscribe(packet_id, result);
                }
                ProtocolAction::UnsubscribeComplete { packet_id, result } => {
                    if let Some(tx) = self.pending_unsubscribes.remove(&packet_id) {
                        let _ = tx.send(result);
                    }
                }
                ProtocolAction::DeliverMessage(envelope) => {
                    if self.subscriptions.deliver(&envelope) == 0 {
                        trace!("No stream for message on {}", envelope.topic());
                    }
                }
                ProtocolAction::StoreRetained(envelope) => self.retained.apply(&envelope),
                ProtocolAction::ConnectionLost { reason } => {
                    return Err(HarnessError::Transport(reason));
                }
                ProtocolAction::ConnectionComplete { .. }
                | ProtocolAction::ConnectionRefused { .. } => {
                    debug!("Ignoring connection result on an established session");
                }
                ProtocolAction::Error { message } => {
                    warn!("Protocol error: {}", message);
                }
            }
        }
        Ok(())
    }

    fn track(&mut self, packet_id: u16, ack_type: AckType, reply: &mut Reply) {
        match (ack_type, reply) {
            (
                AckType::PubAck | AckType::PubRec,
                Reply::Publish { accepted, outcome },
            ) => {
                if let Some(outcome) = outcome.take() {
                    self.pending_publishes.insert(packet_id, outcome);
                }
                if let Some(accepted) = accepted.take() {
                    let _ = accepted.send(Ok(Some(packet_id)));
                }
            }
            (
                AckType::SubAck,
                Reply::Subscribe {
                    topic_filter,
                    reply,
                },
            ) => {
                if let Some(reply) = reply.take() {
                    self.pending_subscribes.insert(
                        packet_id,
                        PendingSubscription {
                            topic_filter: std::mem::take(topic_filter),
                            reply,
                        },
                    );
                }
            }
            (AckType::UnsubAck, Reply::Unsubscribe { reply }) => {
                if let Some(reply) = reply.take() {
                    self.pending_unsubscribes.insert(packet_id, reply);
                }
            }
            (ack_type, _) => {
                warn!("No waiter for {:?} on packet {}", ack_type, packet_id);
            }
        }
    }

    fn complete_publish(
        &mut self,
        packet_id: Option<u16>,
        result: Result<PublishOutcome>,
        reply: &mut Reply,
    ) {
        let tx = match packet_id {
            Some(packet_id) => self.pending_publishes.remove(&packet_id),
            None => match reply {
                Reply::Publish { accepted, outcome } => {
                    if let Some(accepted) = accepted.take() {
                        let _ = accepted.send(Ok(None));
                    }
                    outcome.take()
                }
                _ => None,
            },
        };
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }

    fn complete_subscribe(&mut self, packet_id: u16, result: Result<QoS>) {
        let Some(pending) = self.pending_subscribes.remove(&packet_id) else {
            return;
        };
        let result = result.map(|granted| {
            let replay = self
                .retained
                .lookup(&pending.topic_filter)
                .into_iter()
                .map(|entry| entry.to_envelope());
            self.subscriptions
                .register(&pending.topic_filter, granted, replay)
        });
        let _ = pending.reply.send(result);
    }

    /// Keeps serving acknowledgments until nothing is outstanding or the
    /// grace period runs out. New commands are not accepted meanwhile.
    async fn drain_outstanding(&mut self) -> Result<()> {
        let grace_deadline = Instant::now() + self.disconnect_grace;

        while self.protocol.outstanding() > 0 {
            let deadline = self
                .protocol
                .next_deadline()
                .map_or(grace_deadline, |d| Instant::from_std(d).min(grace_deadline));

            tokio::select! {
                packet = self.transport.recv() => match packet? {
                    Some(packet) => {
                        let actions = self.protocol.handle_packet(packet, self.clock.now());
                        self.execute(actions, Reply::None).await?;
                    }
                    None => {
                        return Err(HarnessError::Transport("broker closed the connection".to_string()));
                    }
                },
                () = tokio::time::sleep_until(deadline) => {
                    if Instant::now() >= grace_deadline {
                        debug!(
                            "Disconnect grace expired with {} deliveries outstanding",
                            self.protocol.outstanding()
                        );
                        break;
                    }
                    let actions = self.protocol.poll_timeouts(self.clock.now());
                    self.execute(actions, Reply::None).await?;
                }
            }
            self.publish_stats();
        }
        Ok(())
    }

    /// Fails everything still pending with `SessionClosed`, ends every
    /// stream, rejects queued commands and closes the transport.
    async fn teardown(&mut self, send_disconnect: bool) {
        let now = self.clock.now();
        let actions = if send_disconnect {
            self.protocol.disconnect(now)
        } else {
            self.protocol.connection_lost()
        };
        if let Err(e) = self.execute(actions, Reply::None).await {
            debug!("Could not send DISCONNECT: {}", e);
        }

        for (_, tx) in self.pending_publishes.drain() {
            let _ = tx.send(Err(HarnessError::SessionClosed));
        }
        for (_, pending) in self.pending_subscribes.drain() {
            let _ = pending.reply.send(Err(HarnessError::SessionClosed));
        }
        for (_, tx) in self.pending_unsubscribes.drain() {
            let _ = tx.send(Err(HarnessError::SessionClosed));
        }
        self.subscriptions.clear();

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject_closed();
        }

        if let Err(e) = self.transport.close().await {
            debug!("Error closing transport: {}", e);
        }
        self.publish_stats();
    }

    fn publish_stats(&self) {
        *self.stats.lock() = self.protocol.stats();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
