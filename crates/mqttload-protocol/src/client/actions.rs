use crate::envelope::Envelope;
use crate::error::Result;
use crate::packet::Packet;
use crate::reason_code::ReasonCode;
use crate::types::{PublishOutcome, QoS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    SubAck,
    UnsubAck,
    PubAck,
    PubRec,
}

/// Work for the runtime, in the order it must be carried out.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolAction {
    SendPacket(Packet),
    /// Hand an inbound message to the subscribers whose filter matches.
    DeliverMessage(Envelope),
    /// Write the entry into the retained cache (empty payload deletes).
    StoreRetained(Envelope),
    /// The request that produced this action now owns `packet_id`.
    TrackPendingAck {
        packet_id: u16,
        ack_type: AckType,
    },
    /// `packet_id` is `None` for QoS 0, which completes on send.
    PublishComplete {
        packet_id: Option<u16>,
        result: Result<PublishOutcome>,
    },
    SubscribeComplete {
        packet_id: u16,
        result: Result<QoS>,
    },
    UnsubscribeComplete {
        packet_id: u16,
        result: Result<()>,
    },
    ConnectionComplete {
        session_present: bool,
    },
    ConnectionRefused {
        reason_code: ReasonCode,
    },
    /// The broker closed the session or stopped answering pings.
    ConnectionLost {
        reason: String,
    },
    Error {
        message: String,
    },
}

impl ProtocolAction {
    #[must_use]
    pub fn send_packet(packet: Packet) -> Self {
        Self::SendPacket(packet)
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    #[must_use]
    pub fn is_send_packet(&self) -> bool {
        matches!(self, Self::SendPacket(_))
    }

    #[must_use]
    pub fn packet(&self) -> Option<&Packet> {
        match self {
            Self::SendPacket(packet) => Some(packet),
            _ => None,
        }
    }
}
