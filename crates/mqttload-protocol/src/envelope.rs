use crate::error::{HarnessError, Result};
use crate::topic::validate_topic_name;
use crate::types::QoS;
use bytes::Bytes;

/// Default payload ceiling, the largest remaining length an MQTT packet can
/// declare.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 268_435_455;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeLimits {
    pub max_payload_size: usize,
}

impl Default for EnvelopeLimits {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl EnvelopeLimits {
    #[must_use]
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    /// # Errors
    /// Returns `PayloadTooLarge` if `size` exceeds the ceiling.
    pub fn check_payload(&self, size: usize) -> Result<()> {
        if size > self.max_payload_size {
            Err(HarnessError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            })
        } else {
            Ok(())
        }
    }
}

/// One application message.
///
/// Envelopes are values: every modifier returns a new envelope. An envelope
/// built by the application has no packet id; the session that sends a
/// QoS 1/2 envelope assigns one, so on the wire `packet_id` is present
/// exactly when `qos > 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    dup: bool,
    packet_id: Option<u16>,
}

impl Envelope {
    /// # Errors
    /// Returns `InvalidTopicName` or `PayloadTooLarge`.
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        limits: &EnvelopeLimits,
    ) -> Result<Self> {
        let topic = topic.into();
        let payload = payload.into();
        validate_topic_name(&topic)?;
        limits.check_payload(payload.len())?;

        Ok(Self {
            topic,
            payload,
            qos,
            retain,
            dup: false,
            packet_id: None,
        })
    }

    /// Builds an envelope from raw wire fields, validating the QoS byte.
    ///
    /// # Errors
    /// Returns `InvalidQoS`, `InvalidTopicName` or `PayloadTooLarge`.
    pub fn from_wire(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: u8,
        retain: bool,
        limits: &EnvelopeLimits,
    ) -> Result<Self> {
        let qos = QoS::try_from(qos)?;
        Self::new(topic, payload, qos, retain, limits)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub fn qos(&self) -> QoS {
        self.qos
    }

    #[must_use]
    pub fn retain(&self) -> bool {
        self.retain
    }

    #[must_use]
    pub fn dup(&self) -> bool {
        self.dup
    }

    #[must_use]
    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }

    /// A zero-length retained publish clears the retained entry for its topic.
    #[must_use]
    pub fn is_retained_delete(&self) -> bool {
        self.retain && self.payload.is_empty()
    }

    #[must_use]
    pub fn with_packet_id(&self, packet_id: u16) -> Self {
        Self {
            packet_id: Some(packet_id),
            ..self.clone()
        }
    }

    /// Same bytes, same packet id, dup flag set: what a retransmission sends.
    #[must_use]
    pub fn as_duplicate(&self) -> Self {
        Self {
            dup: true,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_qos(&self, qos: QoS) -> Self {
        Self {
            qos,
            packet_id: if qos.requires_ack() { self.packet_id } else { None },
            ..self.clone()
        }
    }

    /// Synthetic copy replayed to a new subscriber from the retained cache.
    #[must_use]
    pub fn retained_copy(topic: &str, payload: Bytes, qos: QoS) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
            qos,
            retain: true,
            dup: false,
            packet_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_envelope() {
        let env = Envelope::new(
            "home/light",
            &b"ON"[..],
            QoS::AtLeastOnce,
            true,
            &EnvelopeLimits::default(),
        )
        .unwrap();

        assert_eq!(env.topic(), "home/light");
        assert_eq!(env.payload().as_ref(), b"ON");
        assert_eq!(env.qos(), QoS::AtLeastOnce);
        assert!(env.retain());
        assert!(!env.dup());
        assert_eq!(env.packet_id(), None);
    }

    #[test]
    fn test_wildcard_topic_rejected() {
        let err = Envelope::new(
            "home/+",
            Bytes::new(),
            QoS::AtMostOnce,
            false,
            &EnvelopeLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidTopicName(_)));
    }

    #[test]
    fn test_payload_limit() {
        let limits = EnvelopeLimits::new(4);
        let err = Envelope::new("a/b", vec![0u8; 5], QoS::AtMostOnce, false, &limits)
            .unwrap_err();
        assert_eq!(err, HarnessError::PayloadTooLarge { size: 5, max: 4 });

        assert!(Envelope::new("a/b", vec![0u8; 4], QoS::AtMostOnce, false, &limits).is_ok());
    }

    #[test]
    fn test_from_wire_rejects_bad_qos() {
        let err = Envelope::from_wire("a/b", Bytes::new(), 3, false, &EnvelopeLimits::default())
            .unwrap_err();
        assert_eq!(err, HarnessError::InvalidQoS(3));
    }

    #[test]
    fn test_duplicate_keeps_identity() {
        let env = Envelope::new(
            "a/b",
            &b"payload"[..],
            QoS::ExactlyOnce,
            false,
            &EnvelopeLimits::default(),
        )
        .unwrap()
        .with_packet_id(42);

        let dup = env.as_duplicate();
        assert!(dup.dup());
        assert_eq!(dup.packet_id(), Some(42));
        assert_eq!(dup.payload(), env.payload());
        assert!(!env.dup());
    }

    #[test]
    fn test_retained_delete_detection() {
        let limits = EnvelopeLimits::default();
        let delete = Envelope::new("home/light", Bytes::new(), QoS::AtMostOnce, true, &limits)
            .unwrap();
        assert!(delete.is_retained_delete());

        let plain = Envelope::new("home/light", Bytes::new(), QoS::AtMostOnce, false, &limits)
            .unwrap();
        assert!(!plain.is_retained_delete());
    }

    #[test]
    fn test_downgrade_to_qos0_drops_packet_id() {
        let env = Envelope::new(
            "a/b",
            Bytes::new(),
            QoS::AtLeastOnce,
            false,
            &EnvelopeLimits::default(),
        )
        .unwrap()
        .with_packet_id(9);
        assert_eq!(env.with_qos(QoS::AtMostOnce).packet_id(), None);
    }
}
