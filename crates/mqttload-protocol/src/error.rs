use crate::reason_code::ReasonCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HarnessError {
    #[error("Connect failed: {0}")]
    ConnectError(String),

    #[error("Payload too large: size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Delivery timeout: packet {packet_id} was not acknowledged")]
    DeliveryTimeout { packet_id: u16 },

    #[error("Delivery rejected: packet {packet_id} refused with {reason_code:?}")]
    DeliveryRejected {
        packet_id: u16,
        reason_code: ReasonCode,
    },

    #[error("Overloaded: {limit} deliveries already outstanding")]
    Overloaded { limit: usize },

    #[error("Session closed")]
    SessionClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Packet ID exhausted")]
    PacketIdExhausted,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl HarnessError {
    /// Per-message failures: recorded by the harness, never abort a run.
    #[must_use]
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            Self::DeliveryTimeout { .. }
                | Self::DeliveryRejected { .. }
                | Self::Overloaded { .. }
                | Self::SessionClosed
                | Self::Cancelled
        )
    }

    /// Errors that end a stress run.
    #[must_use]
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, Self::ConnectError(_) | Self::Configuration(_))
    }

    /// Stable label used as a report bucket.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectError(_) => "connect_error",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::InvalidTopicName(_) => "invalid_topic_name",
            Self::InvalidTopicFilter(_) => "invalid_topic_filter",
            Self::InvalidQoS(_) => "invalid_qos",
            Self::DeliveryTimeout { .. } => "delivery_timeout",
            Self::DeliveryRejected { .. } => "delivery_rejected",
            Self::Overloaded { .. } => "overloaded",
            Self::SessionClosed => "session_closed",
            Self::Cancelled => "cancelled",
            Self::PacketIdExhausted => "packet_id_exhausted",
            Self::Transport(_) => "transport",
            Self::ProtocolError(_) => "protocol_error",
            Self::Configuration(_) => "configuration",
        }
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        HarnessError::Transport(err.to_string())
    }
}
