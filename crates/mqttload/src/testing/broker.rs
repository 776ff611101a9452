use super::connector::LoopbackTransport;
use mqttload_protocol::{
    grant_reason, topic_matches_filter, AckPacket, ConnAckPacket, ConnectPacket, Credentials,
    Envelope, EnvelopeLimits, Packet, QoS, ReasonCode, SubAckPacket, SubscribePacket,
    UnsubAckPacket, UnsubscribePacket,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Misbehaviour the broker can be told to show.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackFaults {
    /// Swallow the first N PUBACKs owed to publishers.
    pub drop_pubacks: usize,
    /// Send every QoS 1/2 delivery twice, the second copy flagged dup.
    pub duplicate_deliveries: bool,
    /// Accept connections, then ignore every packet.
    pub unresponsive: bool,
    /// Answer CONNECT with this reason code.
    pub refuse_connections: Option<ReasonCode>,
}

struct ClientEntry {
    client_id: String,
    tx: mpsc::UnboundedSender<Packet>,
    subscriptions: HashMap<String, QoS>,
    next_packet_id: u16,
    kick: Option<oneshot::Sender<()>>,
}

impl ClientEntry {
    fn allocate_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }

    /// Highest QoS granted by any of this client's filters matching `topic`.
    fn granted_for(&self, topic: &str) -> Option<QoS> {
        self.subscriptions
            .iter()
            .filter(|(filter, _)| topic_matches_filter(topic, filter))
            .map(|(_, qos)| *qos)
            .max()
    }
}

struct BrokerInner {
    clients: Mutex<HashMap<u64, ClientEntry>>,
    faults: Mutex<LoopbackFaults>,
    credentials: Option<Credentials>,
    next_connection: AtomicU64,
    pubacks_dropped: AtomicUsize,
    publishes_received: AtomicU64,
}

/// Channel-backed broker double. Cloning shares the same broker.
#[derive(Clone)]
pub struct LoopbackBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for LoopbackBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBroker")
            .field("clients", &self.connected_clients())
            .field("faults", &*self.inner.faults.lock())
            .finish_non_exhaustive()
    }
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::build(None, LoopbackFaults::default())
    }

    /// A broker that only admits `credentials`.
    #[must_use]
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self::build(Some(credentials), LoopbackFaults::default())
    }

    #[must_use]
    pub fn with_faults(faults: LoopbackFaults) -> Self {
        Self::build(None, faults)
    }

    fn build(credentials: Option<Credentials>, faults: LoopbackFaults) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                clients: Mutex::new(HashMap::new()),
                faults: Mutex::new(faults),
                credentials,
                next_connection: AtomicU64::new(1),
                pubacks_dropped: AtomicUsize::new(0),
                publishes_received: AtomicU64::new(0),
            }),
        }
    }

    /// Replaces the active faults; connections already open see the change.
    pub fn set_faults(&self, faults: LoopbackFaults) {
        *self.inner.faults.lock() = faults;
    }

    #[must_use]
    pub fn faults(&self) -> LoopbackFaults {
        self.inner.faults.lock().clone()
    }

    #[must_use]
    pub fn connected_clients(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// PUBLISH packets received from clients, retransmissions included.
    #[must_use]
    pub fn publishes_received(&self) -> u64 {
        self.inner.publishes_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pubacks_dropped(&self) -> usize {
        self.inner.pubacks_dropped.load(Ordering::Relaxed)
    }

    /// Sends DISCONNECT to `client_id` and drops its connection.
    pub fn disconnect_client(&self, client_id: &str) -> bool {
        let mut clients = self.inner.clients.lock();
        let Some(entry) = clients.values_mut().find(|c| c.client_id == client_id) else {
            return false;
        };
        let _ = entry.tx.send(Packet::Disconnect(ReasonCode::ServerBusy));
        if let Some(kick) = entry.kick.take() {
            let _ = kick.send(());
        }
        true
    }

    /// Opens a connection and spawns the task serving it.
    pub(crate) fn accept(&self) -> LoopbackTransport {
        let (to_broker, from_client) = mpsc::unbounded_channel();
        let (to_client, from_broker) = mpsc::unbounded_channel();
        let connection = Connection {
            inner: Arc::clone(&self.inner),
            id: self.inner.next_connection.fetch_add(1, Ordering::Relaxed),
            rx: from_client,
            tx: to_client,
            awaiting_release: HashSet::new(),
        };
        tokio::spawn(connection.serve());
        LoopbackTransport::new(to_broker, from_broker)
    }
}

/// Broker side of one client connection.
struct Connection {
    inner: Arc<BrokerInner>,
    id: u64,
    rx: mpsc::UnboundedReceiver<Packet>,
    tx: mpsc::UnboundedSender<Packet>,
    /// Inbound QoS 2 ids routed but not yet released.
    awaiting_release: HashSet<u16>,
}

impl Connection {
    async fn serve(mut self) {
        let Some(Packet::Connect(connect)) = self.rx.recv().await else {
            debug!("Loopback connection {} closed before CONNECT", self.id);
            return;
        };

        let reason_code = self.admit(&connect);
        let _ = self.tx.send(Packet::ConnAck(ConnAckPacket {
            session_present: false,
            reason_code,
        }));
        if reason_code.is_error() {
            debug!("Refused {}: {:?}", connect.client_id, reason_code);
            return;
        }

        let (kick_tx, mut kick_rx) = oneshot::channel();
        self.inner.clients.lock().insert(
            self.id,
            ClientEntry {
                client_id: connect.client_id.clone(),
                tx: self.tx.clone(),
                subscriptions: HashMap::new(),
                next_packet_id: 0,
                kick: Some(kick_tx),
            },
        );
        trace!("Loopback client {} connected", connect.client_id);

        loop {
            tokio::select! {
                packet = self.rx.recv() => {
                    let Some(packet) = packet else { break };
                    if !self.handle(packet) {
                        break;
                    }
                }
                _ = &mut kick_rx => break,
            }
        }

        self.inner.clients.lock().remove(&self.id);
        trace!("Loopback client {} gone", connect.client_id);
    }

    fn admit(&self, connect: &ConnectPacket) -> ReasonCode {
        if let Some(code) = self.inner.faults.lock().refuse_connections {
            return code;
        }
        match &self.inner.credentials {
            Some(required) if *required != connect.credentials => {
                ReasonCode::BadUsernameOrPassword
            }
            _ => ReasonCode::Success,
        }
    }

    /// Returns false once the client said goodbye.
    fn handle(&mut self, packet: Packet) -> bool {
        if matches!(packet, Packet::Disconnect(_)) {
            return false;
        }
        if matches!(packet, Packet::Publish(_)) {
            self.inner.publishes_received.fetch_add(1, Ordering::Relaxed);
        }
        if self.inner.faults.lock().unresponsive {
            trace!("Unresponsive broker ignoring {}", packet.name());
            return true;
        }

        match packet {
            Packet::Publish(envelope) => self.handle_publish(&envelope),
            Packet::PubRel(ack) => {
                let reason_code = if self.awaiting_release.remove(&ack.packet_id) {
                    ReasonCode::Success
                } else {
                    ReasonCode::PacketIdentifierNotFound
                };
                self.reply(Packet::PubComp(AckPacket::new_with_reason(
                    ack.packet_id,
                    reason_code,
                )));
            }
            Packet::PubRec(ack) => self.reply(Packet::PubRel(AckPacket::new(ack.packet_id))),
            Packet::PubAck(_) | Packet::PubComp(_) => {}
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe),
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe),
            Packet::PingReq => self.reply(Packet::PingResp),
            other => debug!("Loopback broker ignoring unexpected {}", other.name()),
        }
        true
    }

    fn handle_publish(&mut self, envelope: &Envelope) {
        match (envelope.qos(), envelope.packet_id()) {
            (QoS::AtMostOnce, _) => self.route(envelope),
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.route(envelope);
                let drop_limit = self.inner.faults.lock().drop_pubacks;
                let dropped = self
                    .inner
                    .pubacks_dropped
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                        (n < drop_limit).then_some(n + 1)
                    })
                    .is_ok();
                if dropped {
                    trace!("Dropping PUBACK for {}", packet_id);
                } else {
                    self.reply(Packet::PubAck(AckPacket::new(packet_id)));
                }
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                if self.awaiting_release.insert(packet_id) {
                    self.route(envelope);
                }
                self.reply(Packet::PubRec(AckPacket::new(packet_id)));
            }
            (qos, None) => debug!("QoS {} PUBLISH without packet id dropped", qos),
        }
    }

    fn handle_subscribe(&mut self, subscribe: SubscribePacket) {
        let mut clients = self.inner.clients.lock();
        let reason_codes = match clients.get_mut(&self.id) {
            Some(entry) => subscribe
                .filters
                .into_iter()
                .map(|(filter, qos)| {
                    entry.subscriptions.insert(filter, qos);
                    grant_reason(qos)
                })
                .collect(),
            None => vec![ReasonCode::UnspecifiedError; subscribe.filters.len()],
        };
        drop(clients);
        self.reply(Packet::SubAck(SubAckPacket {
            packet_id: subscribe.packet_id,
            reason_codes,
        }));
    }

    fn handle_unsubscribe(&mut self, unsubscribe: UnsubscribePacket) {
        let mut clients = self.inner.clients.lock();
        let reason_codes = unsubscribe
            .filters
            .iter()
            .map(|filter| {
                let existed = clients
                    .get_mut(&self.id)
                    .is_some_and(|entry| entry.subscriptions.remove(filter).is_some());
                if existed {
                    ReasonCode::Success
                } else {
                    ReasonCode::NoSubscriptionExisted
                }
            })
            .collect();
        drop(clients);
        self.reply(Packet::UnsubAck(UnsubAckPacket {
            packet_id: unsubscribe.packet_id,
            reason_codes,
        }));
    }

    /// Forwards `envelope` once to every client with a matching filter, at
    /// the lower of the published and granted QoS. Forwarded copies carry
    /// retain=false.
    fn route(&self, envelope: &Envelope) {
        let duplicate = self.inner.faults.lock().duplicate_deliveries;
        let limits = EnvelopeLimits::default();
        let mut clients = self.inner.clients.lock();

        for entry in clients.values_mut() {
            let Some(granted) = entry.granted_for(envelope.topic()) else {
                continue;
            };
            let qos = envelope.qos().min(granted);
            let Ok(mut copy) = Envelope::new(
                envelope.topic(),
                envelope.payload().clone(),
                qos,
                false,
                &limits,
            ) else {
                continue;
            };
            if qos.requires_ack() {
                copy = copy.with_packet_id(entry.allocate_packet_id());
            }

            let _ = entry.tx.send(Packet::Publish(copy.clone()));
            if duplicate && qos.requires_ack() {
                let _ = entry.tx.send(Packet::Publish(copy.as_duplicate()));
            }
        }
    }

    fn reply(&self, packet: Packet) {
        let _ = self.tx.send(packet);
    }
}
