use crate::dedup::{DedupWindow, DEFAULT_DEDUP_CAPACITY};
use crate::delivery::{DeliveryPhase, DeliveryState, DeliveryTable};
use crate::envelope::{Envelope, EnvelopeLimits};
use crate::error::{HarnessError, Result};
use crate::keepalive::{KeepaliveConfig, KeepaliveTracker};
use crate::packet::{
    granted_qos, AckPacket, ConnAckPacket, ConnectPacket, Packet, SubAckPacket, SubscribePacket,
    UnsubAckPacket, UnsubscribePacket,
};
use crate::packet_id::PacketIdGenerator;
use crate::prelude::{debug_log, trace_log, warn_log};
use crate::qos2::{self, QoS2Action};
use crate::reason_code::{ReasonCode, NORMAL_DISCONNECTION};
use crate::time::{Duration, Instant};
use crate::topic::validate_topic_filter;
use crate::types::{Credentials, PublishOutcome, QoS};
use std::collections::HashMap;

use super::actions::{AckType, ProtocolAction};
use super::state::{ConnectionState, PendingSubscribe, PendingUnsubscribe, SessionStats};

const DEFAULT_MAX_OUTSTANDING: usize = 1000;
const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SessionProtocolConfig {
    pub client_id: String,
    pub credentials: Credentials,
    pub clean_start: bool,
    pub keep_alive: Duration,
    pub max_outstanding: usize,
    pub retry_timeout: Duration,
    pub max_attempts: u32,
    /// Inbound QoS 2 dedup TTL; `None` derives it from the retry budget.
    pub dedup_window: Option<Duration>,
    pub dedup_capacity: usize,
    pub limits: EnvelopeLimits,
}

impl Default for SessionProtocolConfig {
    fn default() -> Self {
        Self {
            client_id: "mqttload".to_string(),
            credentials: Credentials::anonymous(),
            clean_start: true,
            keep_alive: DEFAULT_KEEP_ALIVE,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            dedup_window: None,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            limits: EnvelopeLimits::default(),
        }
    }
}

impl SessionProtocolConfig {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Time an unacknowledged request may stay pending before it fails.
    #[must_use]
    pub fn retry_budget(&self) -> Duration {
        self.retry_timeout * self.max_attempts.max(1)
    }

    #[must_use]
    pub fn dedup_ttl(&self) -> Duration {
        self.dedup_window.unwrap_or_else(|| self.retry_budget())
    }
}

/// Client side of one session, with no I/O.
///
/// Every entry point takes the current instant and returns the actions the
/// runtime has to perform. Retransmissions, dedup expiry and keep-alive pings
/// only happen inside [`poll_timeouts`](Self::poll_timeouts); the runtime
/// calls it when [`next_deadline`](Self::next_deadline) passes.
#[derive(Debug)]
pub struct SessionProtocol {
    config: SessionProtocolConfig,
    state: ConnectionState,
    packet_ids: PacketIdGenerator,
    deliveries: DeliveryTable,
    inbound: DedupWindow,
    keepalive: KeepaliveTracker,
    pending_subacks: HashMap<u16, PendingSubscribe>,
    pending_unsubacks: HashMap<u16, PendingUnsubscribe>,
    stats: SessionStats,
}

impl SessionProtocol {
    #[must_use]
    pub fn new(config: SessionProtocolConfig) -> Self {
        let deliveries = DeliveryTable::new(config.max_outstanding);
        let inbound = DedupWindow::new(config.dedup_ttl(), config.dedup_capacity);
        let keepalive = KeepaliveTracker::new(config.keep_alive, KeepaliveConfig::default());
        Self {
            config,
            state: ConnectionState::Disconnected,
            packet_ids: PacketIdGenerator::new(),
            deliveries,
            inbound,
            keepalive,
            pending_subacks: HashMap::new(),
            pending_unsubacks: HashMap::new(),
            stats: SessionStats::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionProtocolConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.deliveries.len()
    }

    #[must_use]
    pub fn delivery(&self, packet_id: u16) -> Option<&DeliveryState> {
        self.deliveries.get(packet_id)
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            outstanding: self.deliveries.len(),
            ..self.stats
        }
    }

    #[must_use]
    pub fn connect(&mut self, now: Instant) -> Vec<ProtocolAction> {
        if self.state != ConnectionState::Disconnected {
            return vec![ProtocolAction::error(
                "Cannot connect: not in disconnected state",
            )];
        }

        self.state = ConnectionState::Connecting;
        let packet = ConnectPacket {
            client_id: self.config.client_id.clone(),
            credentials: self.config.credentials.clone(),
            clean_start: self.config.clean_start,
            keep_alive: self.config.keep_alive,
        };

        let mut actions = Vec::new();
        self.send(&mut actions, Packet::Connect(Box::new(packet)), now);
        actions
    }

    #[must_use]
    pub fn handle_connack(&mut self, packet: &ConnAckPacket) -> Vec<ProtocolAction> {
        if self.state != ConnectionState::Connecting {
            return vec![ProtocolAction::error("Received CONNACK in unexpected state")];
        }

        if packet.reason_code.is_error() {
            self.state = ConnectionState::Disconnected;
            return vec![ProtocolAction::ConnectionRefused {
                reason_code: packet.reason_code,
            }];
        }

        self.state = ConnectionState::Connected {
            session_present: packet.session_present,
        };
        vec![ProtocolAction::ConnectionComplete {
            session_present: packet.session_present,
        }]
    }

    /// Sends an application envelope.
    ///
    /// QoS 0 completes immediately. QoS 1/2 get a packet id, a delivery state
    /// and a `TrackPendingAck` so the runtime can attach the caller's waiter.
    ///
    /// # Errors
    /// `SessionClosed` when not connected, `PayloadTooLarge` over the session
    /// limit, `Overloaded` at `max_outstanding`, `PacketIdExhausted` when every
    /// id is in flight.
    pub fn publish(&mut self, envelope: &Envelope, now: Instant) -> Result<Vec<ProtocolAction>> {
        if !self.is_connected() {
            return Err(HarnessError::SessionClosed);
        }
        self.config.limits.check_payload(envelope.payload().len())?;

        let mut actions = Vec::new();

        let ack_type = match envelope.qos() {
            QoS::AtMostOnce => {
                let envelope = envelope.with_qos(QoS::AtMostOnce);
                self.send(&mut actions, Packet::Publish(envelope.clone()), now);
                self.stats.sent += 1;
                if envelope.retain() {
                    actions.push(ProtocolAction::StoreRetained(envelope));
                }
                actions.push(ProtocolAction::PublishComplete {
                    packet_id: None,
                    result: Ok(PublishOutcome::Sent),
                });
                return Ok(actions);
            }
            QoS::AtLeastOnce => AckType::PubAck,
            QoS::ExactlyOnce => AckType::PubRec,
        };

        self.deliveries.check_capacity()?;
        let packet_id = self.next_request_id()?;

        let envelope = envelope.with_packet_id(packet_id);
        self.deliveries.track(envelope.clone(), now)?;
        self.stats.sent += 1;

        trace_log!(packet_id, topic = envelope.topic(), qos = %envelope.qos(), "publish tracked");

        actions.push(ProtocolAction::TrackPendingAck {
            packet_id,
            ack_type,
        });
        self.send(&mut actions, Packet::Publish(envelope), now);
        Ok(actions)
    }

    /// # Errors
    /// `SessionClosed` when not connected, `InvalidTopicFilter` for a bad
    /// filter, `PacketIdExhausted` when every id is in flight.
    pub fn subscribe(
        &mut self,
        topic_filter: &str,
        qos: QoS,
        now: Instant,
    ) -> Result<Vec<ProtocolAction>> {
        if !self.is_connected() {
            return Err(HarnessError::SessionClosed);
        }
        validate_topic_filter(topic_filter)?;

        let packet_id = self.next_request_id()?;
        self.pending_subacks.insert(
            packet_id,
            PendingSubscribe {
                topic_filter: topic_filter.to_string(),
                qos,
                sent_at: now,
            },
        );

        let mut actions = vec![ProtocolAction::TrackPendingAck {
            packet_id,
            ack_type: AckType::SubAck,
        }];
        self.send(
            &mut actions,
            Packet::Subscribe(SubscribePacket {
                packet_id,
                filters: vec![(topic_filter.to_string(), qos)],
            }),
            now,
        );
        Ok(actions)
    }

    #[must_use]
    pub fn handle_suback(&mut self, packet: &SubAckPacket) -> Vec<ProtocolAction> {
        let Some(pending) = self.pending_subacks.remove(&packet.packet_id) else {
            debug_log!(packet_id = packet.packet_id, "SUBACK for unknown packet id dropped");
            return vec![];
        };

        let reason_code = packet
            .reason_codes
            .first()
            .copied()
            .unwrap_or(ReasonCode::ProtocolError);

        let result = granted_qos(reason_code).ok_or(HarnessError::DeliveryRejected {
            packet_id: packet.packet_id,
            reason_code,
        });
        debug_log!(
            packet_id = packet.packet_id,
            filter = %pending.topic_filter,
            requested = %pending.qos,
            ?result,
            "subscription acknowledged"
        );

        vec![ProtocolAction::SubscribeComplete {
            packet_id: packet.packet_id,
            result,
        }]
    }

    /// # Errors
    /// `SessionClosed` when not connected, `InvalidTopicFilter` for a bad
    /// filter, `PacketIdExhausted` when every id is in flight.
    pub fn unsubscribe(&mut self, topic_filter: &str, now: Instant) -> Result<Vec<ProtocolAction>> {
        if !self.is_connected() {
            return Err(HarnessError::SessionClosed);
        }
        validate_topic_filter(topic_filter)?;

        let packet_id = self.next_request_id()?;
        self.pending_unsubacks.insert(
            packet_id,
            PendingUnsubscribe {
                topic_filter: topic_filter.to_string(),
                sent_at: now,
            },
        );

        let mut actions = vec![ProtocolAction::TrackPendingAck {
            packet_id,
            ack_type: AckType::UnsubAck,
        }];
        self.send(
            &mut actions,
            Packet::Unsubscribe(UnsubscribePacket {
                packet_id,
                filters: vec![topic_filter.to_string()],
            }),
            now,
        );
        Ok(actions)
    }

    #[must_use]
    pub fn handle_unsuback(&mut self, packet: &UnsubAckPacket) -> Vec<ProtocolAction> {
        let Some(pending) = self.pending_unsubacks.remove(&packet.packet_id) else {
            debug_log!(packet_id = packet.packet_id, "UNSUBACK for unknown packet id dropped");
            return vec![];
        };

        let result = match packet.reason_codes.first() {
            Some(code) if code.is_error() => Err(HarnessError::DeliveryRejected {
                packet_id: packet.packet_id,
                reason_code: *code,
            }),
            _ => Ok(()),
        };
        debug_log!(
            packet_id = packet.packet_id,
            filter = %pending.topic_filter,
            "unsubscribe acknowledged"
        );

        vec![ProtocolAction::UnsubscribeComplete {
            packet_id: packet.packet_id,
            result,
        }]
    }

    /// Dispatches one inbound packet.
    #[must_use]
    pub fn handle_packet(&mut self, packet: Packet, now: Instant) -> Vec<ProtocolAction> {
        match packet {
            Packet::ConnAck(ref connack) => self.handle_connack(connack),
            Packet::Publish(envelope) => self.handle_publish(envelope, now),
            Packet::PubAck(ack) => self.handle_puback(&ack),
            Packet::PubRec(ack) => self.handle_pubrec(&ack, now),
            Packet::PubRel(ack) => self.handle_pubrel(&ack, now),
            Packet::PubComp(ack) => self.handle_pubcomp(&ack),
            Packet::SubAck(ref suback) => self.handle_suback(suback),
            Packet::UnsubAck(ref unsuback) => self.handle_unsuback(unsuback),
            Packet::PingResp => {
                self.keepalive.on_pong();
                vec![]
            }
            Packet::Disconnect(reason_code) => {
                debug_log!(?reason_code, "broker sent DISCONNECT");
                vec![ProtocolAction::ConnectionLost {
                    reason: format!("broker disconnected: {reason_code:?}"),
                }]
            }
            other @ (Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq) => vec![ProtocolAction::error(format!(
                "Unexpected {} from broker",
                other.name()
            ))],
        }
    }

    #[must_use]
    pub fn handle_puback(&mut self, packet: &AckPacket) -> Vec<ProtocolAction> {
        let packet_id = packet.packet_id;
        let is_pending = self
            .deliveries
            .get(packet_id)
            .is_some_and(|state| state.qos == QoS::AtLeastOnce && state.phase == DeliveryPhase::Sent);
        if !is_pending {
            debug_log!(packet_id, "PUBACK for unknown packet id dropped");
            return vec![];
        }

        let Some(state) = self.deliveries.remove(packet_id) else {
            return vec![];
        };

        if packet.reason_code.is_error() {
            return self.fail(
                &state,
                HarnessError::DeliveryRejected {
                    packet_id,
                    reason_code: packet.reason_code,
                },
            );
        }

        self.stats.acked += 1;
        let mut actions = Vec::new();
        if state.envelope().retain() {
            actions.push(ProtocolAction::StoreRetained(state.envelope().clone()));
        }
        actions.push(ProtocolAction::PublishComplete {
            packet_id: Some(packet_id),
            result: Ok(PublishOutcome::Acked {
                packet_id,
                attempts: state.publish_attempts(),
            }),
        });
        actions
    }

    #[must_use]
    pub fn handle_pubrec(&mut self, packet: &AckPacket, now: Instant) -> Vec<ProtocolAction> {
        let phase = self
            .deliveries
            .get(packet.packet_id)
            .filter(|state| state.qos == QoS::ExactlyOnce)
            .map(|state| state.phase);

        if phase.is_none() {
            debug_log!(packet_id = packet.packet_id, "PUBREC for unknown packet id dropped");
        }

        let mut actions = Vec::new();
        for qos2_action in qos2::handle_incoming_pubrec(packet.packet_id, packet.reason_code, phase)
        {
            match qos2_action {
                QoS2Action::SendPubRel { packet_id } => {
                    if phase == Some(DeliveryPhase::Sent) {
                        if let Some(state) = self.deliveries.get_mut(packet_id) {
                            state.phase = DeliveryPhase::Received;
                            state.release(now);
                        }
                    }
                    if let Some(pubrel) = qos2_action.to_packet() {
                        self.send(&mut actions, pubrel, now);
                    }
                }
                QoS2Action::ErrorFlow {
                    packet_id,
                    reason_code,
                } => {
                    if let Some(state) = self.deliveries.remove(packet_id) {
                        actions.extend(self.fail(
                            &state,
                            HarnessError::DeliveryRejected {
                                packet_id,
                                reason_code,
                            },
                        ));
                    }
                }
                _ => {}
            }
        }
        actions
    }

    #[must_use]
    pub fn handle_pubcomp(&mut self, packet: &AckPacket) -> Vec<ProtocolAction> {
        let phase = self
            .deliveries
            .get(packet.packet_id)
            .filter(|state| state.qos == QoS::ExactlyOnce)
            .map(|state| state.phase);

        let qos2_actions = qos2::handle_incoming_pubcomp(packet.packet_id, packet.reason_code, phase);
        if qos2_actions.is_empty() {
            debug_log!(packet_id = packet.packet_id, ?phase, "PUBCOMP without matching PUBREL dropped");
        }

        let mut actions = Vec::new();
        for qos2_action in qos2_actions {
            match qos2_action {
                QoS2Action::CompleteFlow { packet_id } => {
                    if let Some(state) = self.deliveries.remove(packet_id) {
                        self.stats.completed += 1;
                        if state.envelope().retain() {
                            actions.push(ProtocolAction::StoreRetained(state.envelope().clone()));
                        }
                        actions.push(ProtocolAction::PublishComplete {
                            packet_id: Some(packet_id),
                            result: Ok(PublishOutcome::Completed {
                                packet_id,
                                attempts: state.publish_attempts(),
                            }),
                        });
                    }
                }
                QoS2Action::ErrorFlow {
                    packet_id,
                    reason_code,
                } => {
                    if let Some(state) = self.deliveries.remove(packet_id) {
                        actions.extend(self.fail(
                            &state,
                            HarnessError::DeliveryRejected {
                                packet_id,
                                reason_code,
                            },
                        ));
                    }
                }
                _ => {}
            }
        }
        actions
    }

    /// Inbound PUBLISH from the broker.
    #[must_use]
    pub fn handle_publish(&mut self, envelope: Envelope, now: Instant) -> Vec<ProtocolAction> {
        let mut actions = Vec::new();

        match envelope.qos() {
            QoS::AtMostOnce => {
                self.accept_inbound(&mut actions, envelope);
            }
            QoS::AtLeastOnce => {
                let Some(packet_id) = envelope.packet_id() else {
                    return vec![ProtocolAction::error("QoS 1 PUBLISH without packet id")];
                };
                self.send(&mut actions, Packet::PubAck(AckPacket::new(packet_id)), now);
                self.accept_inbound(&mut actions, envelope);
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = envelope.packet_id() else {
                    return vec![ProtocolAction::error("QoS 2 PUBLISH without packet id")];
                };
                let is_duplicate = self.inbound.contains(packet_id, now);
                let mut envelope = Some(envelope);
                for qos2_action in qos2::handle_incoming_publish_qos2(packet_id, is_duplicate) {
                    match qos2_action {
                        QoS2Action::RecordIncoming { packet_id } => {
                            self.inbound.record(packet_id, now);
                        }
                        QoS2Action::DeliverMessage { .. } => {
                            if let Some(envelope) = envelope.take() {
                                self.accept_inbound(&mut actions, envelope);
                            }
                        }
                        QoS2Action::SendPubRec { .. } => {
                            if let Some(pubrec) = qos2_action.to_packet() {
                                self.send(&mut actions, pubrec, now);
                            }
                        }
                        _ => {}
                    }
                }
                if is_duplicate {
                    self.stats.duplicates_suppressed += 1;
                    trace_log!(packet_id, "duplicate QoS 2 PUBLISH suppressed");
                }
            }
        }

        actions
    }

    #[must_use]
    pub fn handle_pubrel(&mut self, packet: &AckPacket, now: Instant) -> Vec<ProtocolAction> {
        let is_known = self.inbound.contains(packet.packet_id, now);
        if !is_known {
            debug_log!(packet_id = packet.packet_id, "PUBREL for unknown packet id");
        }

        let mut actions = Vec::new();
        for qos2_action in qos2::handle_incoming_pubrel(packet.packet_id, is_known) {
            match qos2_action {
                QoS2Action::ReleaseIncoming { packet_id } => {
                    self.inbound.release(packet_id);
                }
                QoS2Action::SendPubComp { .. } => {
                    if let Some(pubcomp) = qos2_action.to_packet() {
                        self.send(&mut actions, pubcomp, now);
                    }
                }
                _ => {}
            }
        }
        actions
    }

    /// Runs every timer that has expired at `now`: retransmissions and
    /// delivery timeouts in publish order, then subscribe and unsubscribe
    /// timeouts, dedup expiry and keep-alive.
    #[must_use]
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<ProtocolAction> {
        let mut actions = Vec::new();
        if !self.is_connected() {
            return actions;
        }

        let retry_timeout = self.config.retry_timeout;
        for packet_id in self.deliveries.due(now, retry_timeout) {
            let Some(state) = self.deliveries.get_mut(packet_id) else {
                continue;
            };

            if state.attempt_count >= self.config.max_attempts {
                if let Some(state) = self.deliveries.remove(packet_id) {
                    warn_log!(
                        packet_id,
                        attempts = state.attempt_count,
                        awaiting = state.phase.awaiting(state.qos),
                        "delivery timed out"
                    );
                    actions.extend(self.fail(&state, HarnessError::DeliveryTimeout { packet_id }));
                }
                continue;
            }

            let Some(packet) = state.retransmission() else {
                continue;
            };
            state.record_send(now);
            debug_log!(
                packet_id,
                attempt = state.attempt_count,
                packet = packet.name(),
                "retransmitting"
            );
            self.stats.retransmitted += 1;
            self.send(&mut actions, packet, now);
        }

        let budget = self.config.retry_budget();
        let expired_subs: Vec<u16> = self
            .pending_subacks
            .iter()
            .filter(|(_, pending)| now >= pending.sent_at + budget)
            .map(|(id, _)| *id)
            .collect();
        for packet_id in expired_subs {
            self.pending_subacks.remove(&packet_id);
            warn_log!(packet_id, "SUBACK not received in time");
            actions.push(ProtocolAction::SubscribeComplete {
                packet_id,
                result: Err(HarnessError::DeliveryTimeout { packet_id }),
            });
        }

        let expired_unsubs: Vec<u16> = self
            .pending_unsubacks
            .iter()
            .filter(|(_, pending)| now >= pending.sent_at + budget)
            .map(|(id, _)| *id)
            .collect();
        for packet_id in expired_unsubs {
            self.pending_unsubacks.remove(&packet_id);
            warn_log!(packet_id, "UNSUBACK not received in time");
            actions.push(ProtocolAction::UnsubscribeComplete {
                packet_id,
                result: Err(HarnessError::DeliveryTimeout { packet_id }),
            });
        }

        self.inbound.sweep(now);

        if self.keepalive.timed_out(now) {
            warn_log!(client_id = %self.config.client_id, "keep-alive timed out");
            actions.push(ProtocolAction::ConnectionLost {
                reason: "no PINGRESP within keep-alive timeout".to_string(),
            });
        } else if self.keepalive.ping_due(now) {
            self.keepalive.on_ping_sent(now);
            actions.push(ProtocolAction::send_packet(Packet::PingReq));
        }

        actions
    }

    /// Earliest instant at which [`poll_timeouts`](Self::poll_timeouts) has
    /// work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.is_connected() {
            return None;
        }

        let budget = self.config.retry_budget();
        [
            self.deliveries.next_deadline(self.config.retry_timeout),
            self.inbound.next_expiry(),
            self.keepalive.next_deadline(),
            self.pending_subacks
                .values()
                .map(|pending| pending.sent_at + budget)
                .min(),
            self.pending_unsubacks
                .values()
                .map(|pending| pending.sent_at + budget)
                .min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fails every outstanding delivery and request with `SessionClosed`.
    #[must_use]
    pub fn fail_outstanding(&mut self) -> Vec<ProtocolAction> {
        let mut actions = Vec::new();

        for state in self.deliveries.drain() {
            actions.extend(self.fail(&state, HarnessError::SessionClosed));
        }

        let mut subs: Vec<u16> = self.pending_subacks.drain().map(|(id, _)| id).collect();
        subs.sort_unstable();
        actions.extend(subs.into_iter().map(|packet_id| ProtocolAction::SubscribeComplete {
            packet_id,
            result: Err(HarnessError::SessionClosed),
        }));

        let mut unsubs: Vec<u16> = self.pending_unsubacks.drain().map(|(id, _)| id).collect();
        unsubs.sort_unstable();
        actions.extend(unsubs.into_iter().map(|packet_id| {
            ProtocolAction::UnsubscribeComplete {
                packet_id,
                result: Err(HarnessError::SessionClosed),
            }
        }));

        self.inbound.clear();
        actions
    }

    /// Ends the session: outstanding work fails with `SessionClosed` and a
    /// DISCONNECT goes out if the broker accepted us.
    #[must_use]
    pub fn disconnect(&mut self, now: Instant) -> Vec<ProtocolAction> {
        let was_connected = self.is_connected();
        let mut actions = self.fail_outstanding();
        if was_connected {
            self.send(&mut actions, Packet::Disconnect(NORMAL_DISCONNECTION), now);
        }
        self.state = ConnectionState::Closed;
        actions
    }

    /// Marks the connection as gone without sending anything.
    #[must_use]
    pub fn connection_lost(&mut self) -> Vec<ProtocolAction> {
        let actions = self.fail_outstanding();
        self.state = ConnectionState::Closed;
        actions
    }

    fn next_request_id(&mut self) -> Result<u16> {
        let deliveries = &self.deliveries;
        let subs = &self.pending_subacks;
        let unsubs = &self.pending_unsubacks;
        self.packet_ids
            .next_free(|id| deliveries.contains(id) || subs.contains_key(&id) || unsubs.contains_key(&id))
            .ok_or(HarnessError::PacketIdExhausted)
    }

    fn send(&mut self, actions: &mut Vec<ProtocolAction>, packet: Packet, now: Instant) {
        self.keepalive.on_packet_sent(now);
        actions.push(ProtocolAction::send_packet(packet));
    }

    fn accept_inbound(&mut self, actions: &mut Vec<ProtocolAction>, envelope: Envelope) {
        self.stats.received += 1;
        if envelope.retain() {
            actions.push(ProtocolAction::StoreRetained(envelope.clone()));
        }
        actions.push(ProtocolAction::DeliverMessage(envelope));
    }

    fn fail(&mut self, state: &DeliveryState, error: HarnessError) -> Vec<ProtocolAction> {
        self.stats.failed += 1;
        vec![ProtocolAction::PublishComplete {
            packet_id: Some(state.packet_id),
            result: Err(error),
        }]
    }
}
