//! Outbound delivery tracking.
//!
//! One [`DeliveryState`] per outstanding QoS 1/2 publish. States are created
//! when the envelope is first sent and removed when the handshake finishes,
//! retries run out, the broker rejects the message or the session goes away.

use crate::envelope::Envelope;
use crate::error::{HarnessError, Result};
use crate::packet::{AckPacket, Packet};
use crate::time::{Duration, Instant};
use crate::types::QoS;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryPhase {
    /// PUBLISH sent, waiting for PUBACK or PUBREC.
    Sent,
    /// PUBREC seen, PUBREL not yet sent.
    Received,
    /// PUBREL sent, waiting for PUBCOMP.
    Released,
    Acked,
    Complete,
}

impl DeliveryPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::Complete)
    }

    /// Name of the packet that moves a delivery out of this phase.
    #[must_use]
    pub fn awaiting(self, qos: QoS) -> Option<&'static str> {
        match (self, qos) {
            (Self::Sent, QoS::AtLeastOnce) => Some("PUBACK"),
            (Self::Sent, QoS::ExactlyOnce) => Some("PUBREC"),
            (Self::Released, _) => Some("PUBCOMP"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryState {
    pub packet_id: u16,
    pub qos: QoS,
    pub phase: DeliveryPhase,
    /// Sends of the current leg (PUBLISH or PUBREL).
    pub attempt_count: u32,
    pub last_sent_at: Instant,
    /// Publish order within the session.
    pub sequence: u64,
    publish_attempts: u32,
    envelope: Envelope,
}

impl DeliveryState {
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// PUBLISH sends made for this delivery, including the first one.
    #[must_use]
    pub fn publish_attempts(&self) -> u32 {
        self.publish_attempts
    }

    #[must_use]
    pub fn deadline(&self, retry_timeout: Duration) -> Instant {
        self.last_sent_at + retry_timeout
    }

    #[must_use]
    pub fn is_due(&self, now: Instant, retry_timeout: Duration) -> bool {
        now >= self.deadline(retry_timeout)
    }

    /// Packet to resend for the current leg.
    #[must_use]
    pub fn retransmission(&self) -> Option<Packet> {
        match self.phase {
            DeliveryPhase::Sent => Some(Packet::Publish(self.envelope.as_duplicate())),
            DeliveryPhase::Received | DeliveryPhase::Released => {
                Some(Packet::PubRel(AckPacket::new(self.packet_id)))
            }
            DeliveryPhase::Acked | DeliveryPhase::Complete => None,
        }
    }

    pub fn record_send(&mut self, now: Instant) {
        self.attempt_count += 1;
        if self.phase == DeliveryPhase::Sent {
            self.publish_attempts = self.attempt_count;
        }
        self.last_sent_at = now;
    }

    /// Moves a QoS 2 delivery into the PUBREL leg, resetting the leg counter.
    pub fn release(&mut self, now: Instant) {
        self.phase = DeliveryPhase::Released;
        self.attempt_count = 1;
        self.last_sent_at = now;
    }
}

#[derive(Debug)]
pub struct DeliveryTable {
    entries: HashMap<u16, DeliveryState>,
    max_outstanding: usize,
    next_sequence: u64,
}

impl DeliveryTable {
    #[must_use]
    pub fn new(max_outstanding: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_outstanding,
            next_sequence: 0,
        }
    }

    #[must_use]
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, packet_id: u16) -> bool {
        self.entries.contains_key(&packet_id)
    }

    /// # Errors
    /// Returns `Overloaded` when the table is at `max_outstanding`.
    pub fn check_capacity(&self) -> Result<()> {
        if self.entries.len() >= self.max_outstanding {
            return Err(HarnessError::Overloaded {
                limit: self.max_outstanding,
            });
        }
        Ok(())
    }

    /// Starts tracking a QoS 1/2 envelope that was just sent for the first time.
    ///
    /// # Errors
    /// Returns `Overloaded` when full, `ProtocolError` when the envelope has
    /// no packet id or its id is already tracked.
    pub fn track(&mut self, envelope: Envelope, now: Instant) -> Result<&DeliveryState> {
        self.check_capacity()?;
        let packet_id = envelope.packet_id().ok_or_else(|| {
            HarnessError::ProtocolError("tracked envelope has no packet id".to_string())
        })?;
        if self.entries.contains_key(&packet_id) {
            return Err(HarnessError::ProtocolError(format!(
                "packet id {packet_id} is already outstanding"
            )));
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let state = DeliveryState {
            packet_id,
            qos: envelope.qos(),
            phase: DeliveryPhase::Sent,
            attempt_count: 1,
            last_sent_at: now,
            sequence,
            publish_attempts: 1,
            envelope,
        };
        Ok(self.entries.entry(packet_id).or_insert(state))
    }

    #[must_use]
    pub fn get(&self, packet_id: u16) -> Option<&DeliveryState> {
        self.entries.get(&packet_id)
    }

    pub fn get_mut(&mut self, packet_id: u16) -> Option<&mut DeliveryState> {
        self.entries.get_mut(&packet_id)
    }

    pub fn remove(&mut self, packet_id: u16) -> Option<DeliveryState> {
        self.entries.remove(&packet_id)
    }

    /// Packet ids whose retry timer has fired, oldest publish first.
    #[must_use]
    pub fn due(&self, now: Instant, retry_timeout: Duration) -> Vec<u16> {
        let mut due: Vec<(u64, u16)> = self
            .entries
            .values()
            .filter(|state| state.is_due(now, retry_timeout))
            .map(|state| (state.sequence, state.packet_id))
            .collect();
        due.sort_unstable();
        due.into_iter().map(|(_, packet_id)| packet_id).collect()
    }

    #[must_use]
    pub fn next_deadline(&self, retry_timeout: Duration) -> Option<Instant> {
        self.entries
            .values()
            .map(|state| state.deadline(retry_timeout))
            .min()
    }

    /// Removes every state, oldest publish first.
    pub fn drain(&mut self) -> Vec<DeliveryState> {
        let mut states: Vec<DeliveryState> = self.entries.drain().map(|(_, s)| s).collect();
        states.sort_unstable_by_key(|state| state.sequence);
        states
    }
}
