//! Last-value cache of retained messages, one entry per topic.

use bytes::Bytes;
use mqttload_protocol::{topic_matches_filter, Envelope, QoS};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedEntry {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

impl RetainedEntry {
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        Envelope::retained_copy(&self.topic, self.payload.clone(), self.qos)
    }
}

/// Shared retained-message cache.
///
/// Cloning shares the same cache. Writers replace whole entries under the
/// write lock, so a reader sees either the old or the new entry.
#[derive(Debug, Clone, Default)]
pub struct RetainedStore {
    entries: Arc<RwLock<HashMap<String, Arc<RetainedEntry>>>>,
}

impl RetainedStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `topic`; an empty payload deletes it.
    pub fn publish_retained(&self, topic: &str, payload: Bytes, qos: QoS) {
        let mut entries = self.entries.write();
        if payload.is_empty() {
            if entries.remove(topic).is_some() {
                debug!("Deleted retained message for topic: {}", topic);
            }
            return;
        }

        entries.insert(
            topic.to_string(),
            Arc::new(RetainedEntry {
                topic: topic.to_string(),
                payload,
                qos,
            }),
        );
        debug!("Stored retained message for topic: {}", topic);
    }

    /// Applies a retain-flagged envelope; others are ignored.
    pub fn apply(&self, envelope: &Envelope) {
        if envelope.retain() {
            self.publish_retained(envelope.topic(), envelope.payload().clone(), envelope.qos());
        }
    }

    /// Copies of every entry matching `topic_filter`, ordered by topic.
    #[must_use]
    pub fn lookup(&self, topic_filter: &str) -> Vec<RetainedEntry> {
        let mut matched: Vec<RetainedEntry> = self
            .entries
            .read()
            .values()
            .filter(|entry| topic_matches_filter(&entry.topic, topic_filter))
            .map(|entry| RetainedEntry::clone(entry))
            .collect();
        matched.sort_by(|a, b| a.topic.cmp(&b.topic));
        matched
    }

    #[must_use]
    pub fn get(&self, topic: &str) -> Option<RetainedEntry> {
        self.entries
            .read()
            .get(topic)
            .map(|entry| RetainedEntry::clone(entry))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqttload_protocol::EnvelopeLimits;

    #[test]
    fn test_store_and_overwrite() {
        let store = RetainedStore::new();
        store.publish_retained("home/light", Bytes::from_static(b"ON"), QoS::AtLeastOnce);
        store.publish_retained("home/light", Bytes::from_static(b"OFF"), QoS::AtMostOnce);

        let entry = store.get("home/light").unwrap();
        assert_eq!(entry.payload.as_ref(), b"OFF");
        assert_eq!(entry.qos, QoS::AtMostOnce);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_empty_payload_deletes() {
        let store = RetainedStore::new();
        store.publish_retained("home/light", Bytes::from_static(b"ON"), QoS::AtMostOnce);
        store.publish_retained("home/light", Bytes::new(), QoS::AtMostOnce);
        assert!(store.get("home/light").is_none());
        assert!(store.lookup("home/+").is_empty());
    }

    #[test]
    fn test_lookup_by_filter() {
        let store = RetainedStore::new();
        store.publish_retained("home/light", Bytes::from_static(b"ON"), QoS::AtMostOnce);
        store.publish_retained("home/door", Bytes::from_static(b"CLOSED"), QoS::AtMostOnce);
        store.publish_retained("garden/tap", Bytes::from_static(b"OFF"), QoS::AtMostOnce);

        let topics: Vec<String> = store.lookup("home/+").into_iter().map(|e| e.topic).collect();
        assert_eq!(topics, vec!["home/door", "home/light"]);
        assert_eq!(store.lookup("#").len(), 3);
    }

    #[test]
    fn test_apply_ignores_non_retained() {
        let store = RetainedStore::new();
        let limits = EnvelopeLimits::default();
        let plain = Envelope::new("a/b", &b"x"[..], QoS::AtMostOnce, false, &limits).unwrap();
        store.apply(&plain);
        assert!(store.is_empty());

        let retained = Envelope::new("a/b", &b"x"[..], QoS::AtMostOnce, true, &limits).unwrap();
        store.apply(&retained);
        assert!(store.get("a/b").unwrap().to_envelope().retain());
    }

    #[test]
    fn test_clones_share_state() {
        let store = RetainedStore::new();
        let other = store.clone();
        other.publish_retained("x", Bytes::from_static(b"1"), QoS::AtMostOnce);
        assert_eq!(store.len(), 1);
        store.clear();
        assert!(other.is_empty());
    }

    #[test]
    fn test_concurrent_readers_see_whole_entries() {
        let store = RetainedStore::new();
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    let payload = Bytes::from(vec![u8::try_from(i % 251).unwrap(); 64]);
                    store.publish_retained("t", payload, QoS::AtMostOnce);
                }
            })
        };
        for _ in 0..1000 {
            if let Some(entry) = store.get("t") {
                let first = entry.payload[0];
                assert!(entry.payload.iter().all(|b| *b == first));
            }
        }
        writer.join().unwrap();
    }
}
