use crate::delivery::DeliveryPhase;
use crate::packet::{AckPacket, Packet};
use crate::reason_code::ReasonCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QoS2Action {
    SendPubRec {
        packet_id: u16,
        reason_code: ReasonCode,
    },
    SendPubRel {
        packet_id: u16,
    },
    SendPubComp {
        packet_id: u16,
        reason_code: ReasonCode,
    },
    /// Enter the inbound id into the dedup window.
    RecordIncoming {
        packet_id: u16,
    },
    /// Drop the inbound id from the dedup window.
    ReleaseIncoming {
        packet_id: u16,
    },
    DeliverMessage {
        packet_id: u16,
    },
    CompleteFlow {
        packet_id: u16,
    },
    ErrorFlow {
        packet_id: u16,
        reason_code: ReasonCode,
    },
}

impl QoS2Action {
    #[must_use]
    pub fn to_packet(&self) -> Option<Packet> {
        match self {
            QoS2Action::SendPubRec {
                packet_id,
                reason_code,
            } => Some(Packet::PubRec(AckPacket::new_with_reason(
                *packet_id,
                *reason_code,
            ))),
            QoS2Action::SendPubRel { packet_id } => Some(Packet::PubRel(AckPacket::new(*packet_id))),
            QoS2Action::SendPubComp {
                packet_id,
                reason_code,
            } => Some(Packet::PubComp(AckPacket::new_with_reason(
                *packet_id,
                *reason_code,
            ))),
            _ => None,
        }
    }
}

/// PUBREC for an outbound QoS 2 delivery in `phase` (`None` when unknown).
///
/// A repeated PUBREC after PUBREL went out re-sends PUBREL.
#[must_use]
pub fn handle_incoming_pubrec(
    packet_id: u16,
    reason_code: ReasonCode,
    phase: Option<DeliveryPhase>,
) -> Vec<QoS2Action> {
    let Some(phase) = phase else {
        return vec![];
    };

    if reason_code.is_error() {
        return vec![QoS2Action::ErrorFlow {
            packet_id,
            reason_code,
        }];
    }

    match phase {
        DeliveryPhase::Sent | DeliveryPhase::Received | DeliveryPhase::Released => {
            vec![QoS2Action::SendPubRel { packet_id }]
        }
        DeliveryPhase::Acked | DeliveryPhase::Complete => vec![],
    }
}

#[must_use]
pub fn handle_incoming_pubcomp(
    packet_id: u16,
    reason_code: ReasonCode,
    phase: Option<DeliveryPhase>,
) -> Vec<QoS2Action> {
    if phase != Some(DeliveryPhase::Released) {
        return vec![];
    }

    if reason_code.is_error() {
        vec![QoS2Action::ErrorFlow {
            packet_id,
            reason_code,
        }]
    } else {
        vec![QoS2Action::CompleteFlow { packet_id }]
    }
}

/// Inbound QoS 2 PUBLISH. `is_duplicate` means the id is still in the window.
#[must_use]
pub fn handle_incoming_publish_qos2(packet_id: u16, is_duplicate: bool) -> Vec<QoS2Action> {
    if is_duplicate {
        vec![QoS2Action::SendPubRec {
            packet_id,
            reason_code: ReasonCode::Success,
        }]
    } else {
        vec![
            QoS2Action::RecordIncoming { packet_id },
            QoS2Action::DeliverMessage { packet_id },
            QoS2Action::SendPubRec {
                packet_id,
                reason_code: ReasonCode::Success,
            },
        ]
    }
}

#[must_use]
pub fn handle_incoming_pubrel(packet_id: u16, is_known: bool) -> Vec<QoS2Action> {
    if is_known {
        vec![
            QoS2Action::ReleaseIncoming { packet_id },
            QoS2Action::SendPubComp {
                packet_id,
                reason_code: ReasonCode::Success,
            },
        ]
    } else {
        vec![QoS2Action::SendPubComp {
            packet_id,
            reason_code: ReasonCode::PacketIdentifierNotFound,
        }]
    }
}
