use crate::time::Instant;
use crate::types::QoS;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected {
        session_present: bool,
    },
    Closed,
}

#[derive(Debug, Clone)]
pub struct PendingSubscribe {
    pub topic_filter: String,
    pub qos: QoS,
    pub sent_at: Instant,
}

#[derive(Debug, Clone)]
pub struct PendingUnsubscribe {
    pub topic_filter: String,
    pub sent_at: Instant,
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub outstanding: usize,
    pub sent: u64,
    pub acked: u64,
    pub completed: u64,
    pub retransmitted: u64,
    pub failed: u64,
    pub received: u64,
    pub duplicates_suppressed: u64,
}
