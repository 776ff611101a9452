//! Broker sessions.
//!
//! [`Session::connect`] performs the CONNECT/CONNACK handshake and then moves
//! the transport into a background task. The returned handle is cheap to
//! share by reference; every operation is a message to that task.

mod command;
mod delivery;
mod subscription;
mod task;

pub use delivery::DeliveryHandle;
pub use subscription::Subscription;

use crate::clock::TokioClock;
use crate::config::SessionConfig;
use crate::retained::RetainedStore;
use crate::transport::{Connector, Transport};
use command::Command;
use mqttload_protocol::{
    Clock, Credentials, Envelope, HarnessError, Packet, ProtocolAction, QoS, Result,
    SessionProtocol, SessionStats,
};
use parking_lot::Mutex;
use std::sync::Arc;
use task::SessionTask;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handle to one connected broker session.
///
/// Dropping the handle closes the session the same way a transport failure
/// does: outstanding deliveries resolve to `SessionClosed` and every
/// subscription stream ends.
#[derive(Debug)]
pub struct Session {
    client_id: String,
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<Mutex<SessionStats>>,
    task: JoinHandle<()>,
}

impl Session {
    /// Connects with the tokio clock.
    pub async fn connect<C: Connector>(
        connector: &C,
        endpoint: &str,
        credentials: &Credentials,
        config: SessionConfig,
        retained: RetainedStore,
    ) -> Result<Self> {
        Self::connect_with_clock(
            connector,
            endpoint,
            credentials,
            config,
            retained,
            Arc::new(TokioClock),
        )
        .await
    }

    /// Opens a transport, sends CONNECT and waits for CONNACK within
    /// `config.connect_timeout`.
    ///
    /// # Errors
    ///
    /// Every failure, whether transport error, refusal or timeout, is
    /// reported as `ConnectError`.
    pub async fn connect_with_clock<C: Connector>(
        connector: &C,
        endpoint: &str,
        credentials: &Credentials,
        config: SessionConfig,
        retained: RetainedStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut protocol = SessionProtocol::new(config.protocol_config(credentials));
        let client_id = config.client_id.clone();

        let connecting = async {
            let mut transport = connector.open(endpoint).await?;
            let session_present = handshake(&mut protocol, &mut transport, clock.as_ref()).await?;
            Ok::<_, HarnessError>((transport, session_present))
        };

        let (transport, session_present) =
            match tokio::time::timeout(config.connect_timeout, connecting).await {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => return Err(into_connect_error(e)),
                Err(_) => {
                    return Err(HarnessError::ConnectError(format!(
                        "no CONNACK from {} within {:?}",
                        endpoint, config.connect_timeout
                    )))
                }
            };

        info!(
            "Session {} connected to {} (session_present={})",
            client_id, endpoint, session_present
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(protocol.stats()));
        let task = SessionTask::new(
            protocol,
            transport,
            clock,
            rx,
            retained,
            Arc::clone(&stats),
            config.disconnect_grace,
        );
        let task = tokio::spawn(task.run());

        Ok(Self {
            client_id,
            commands: tx,
            stats,
            task,
        })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Sends `envelope`. QoS 1/2 envelopes get a packet id here.
    ///
    /// # Errors
    ///
    /// `Overloaded`, `SessionClosed`, `PayloadTooLarge` or
    /// `PacketIdExhausted` when the session refuses the message.
    pub async fn publish(&self, envelope: Envelope) -> Result<DeliveryHandle> {
        let qos = envelope.qos();
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.send(Command::Publish {
            envelope,
            accepted: accepted_tx,
            outcome: outcome_tx,
        })?;

        let packet_id = accepted_rx
            .await
            .map_err(|_| HarnessError::SessionClosed)??;
        Ok(DeliveryHandle::new(packet_id, qos, outcome_rx))
    }

    /// Subscribes and waits for SUBACK.
    ///
    /// # Errors
    ///
    /// `InvalidTopicFilter`, `DeliveryRejected` when the broker refuses,
    /// `DeliveryTimeout` when no SUBACK arrives, `SessionClosed`.
    pub async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            topic_filter: topic_filter.to_string(),
            qos,
            reply,
        })?;
        rx.await.map_err(|_| HarnessError::SessionClosed)?
    }

    /// Ends the stream for `topic_filter` and waits for UNSUBACK.
    pub async fn unsubscribe(&self, topic_filter: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            topic_filter: topic_filter.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| HarnessError::SessionClosed)?
    }

    /// Counters as of the last event the session task handled.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        *self.stats.lock()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Waits up to the disconnect grace for outstanding acknowledgments,
    /// then closes the session.
    pub async fn disconnect(self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { done }).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.task.await {
            debug!("Session task for {} ended abnormally: {}", self.client_id, e);
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| HarnessError::SessionClosed)
    }
}

async fn handshake<T: Transport>(
    protocol: &mut SessionProtocol,
    transport: &mut T,
    clock: &dyn Clock,
) -> Result<bool> {
    for action in protocol.connect(clock.now()) {
        match action {
            ProtocolAction::SendPacket(packet) => transport.send(packet).await?,
            ProtocolAction::Error { message } => return Err(HarnessError::ConnectError(message)),
            _ => {}
        }
    }

    loop {
        let Some(packet) = transport.recv().await? else {
            return Err(HarnessError::ConnectError(
                "connection closed before CONNACK".to_string(),
            ));
        };
        let connack = match packet {
            Packet::ConnAck(connack) => connack,
            other => {
                debug!("Ignoring {} received before CONNACK", other.name());
                continue;
            }
        };

        for action in protocol.handle_connack(&connack) {
            match action {
                ProtocolAction::ConnectionComplete { session_present } => {
                    return Ok(session_present)
                }
                ProtocolAction::ConnectionRefused { reason_code } => {
                    return Err(HarnessError::ConnectError(format!(
                        "refused by broker: {reason_code:?}"
                    )))
                }
                ProtocolAction::Error { message } => {
                    return Err(HarnessError::ConnectError(message))
                }
                _ => {}
            }
        }
    }
}

fn into_connect_error(error: HarnessError) -> HarnessError {
    match error {
        HarnessError::ConnectError(_) => error,
        other => HarnessError::ConnectError(other.to_string()),
    }
}
