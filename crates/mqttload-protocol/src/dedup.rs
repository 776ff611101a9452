//! Inbound QoS 2 deduplication window.
//!
//! A packet id enters the window on the first PUBLISH that carries it and
//! leaves on PUBREL, on expiry, or when the window is full and it is the
//! oldest entry. While present, redeliveries are acknowledged but never
//! handed to the application.

use crate::prelude::debug_log;
use crate::time::{Duration, Instant};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct DedupWindow {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<u16, Instant>,
    // Insertion order. Released pairs linger until they reach the front or
    // the deque outgrows twice the capacity.
    order: VecDeque<(u16, Instant)>,
}

impl DedupWindow {
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
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
    pub fn contains(&self, packet_id: u16, now: Instant) -> bool {
        self.entries
            .get(&packet_id)
            .is_some_and(|recorded| now.duration_since(*recorded) < self.ttl)
    }

    /// Records `packet_id`; returns `false` if it was already in the window.
    pub fn record(&mut self, packet_id: u16, now: Instant) -> bool {
        if self.contains(packet_id, now) {
            return false;
        }

        while self.entries.len() >= self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }

        self.entries.insert(packet_id, now);
        self.order.push_back((packet_id, now));
        self.discard_stale();
        true
    }

    /// Removes `packet_id` once the sender released it.
    pub fn release(&mut self, packet_id: u16) -> bool {
        let released = self.entries.remove(&packet_id).is_some();
        if released {
            self.discard_stale();
        }
        released
    }

    /// Drops expired entries, returning how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(&(packet_id, recorded)) = self.order.front() {
            if !self.is_live(packet_id, recorded) {
                self.order.pop_front();
                continue;
            }
            if now.duration_since(recorded) < self.ttl {
                break;
            }
            self.order.pop_front();
            self.entries.remove(&packet_id);
            removed += 1;
        }
        if removed > 0 {
            debug_log!(removed, remaining = self.entries.len(), "dedup window expired entries");
        }
        removed
    }

    /// Instant at which the oldest live entry expires.
    #[must_use]
    pub fn next_expiry(&self) -> Option<Instant> {
        self.order
            .iter()
            .find(|(packet_id, recorded)| self.is_live(*packet_id, *recorded))
            .map(|(_, recorded)| *recorded + self.ttl)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn is_live(&self, packet_id: u16, recorded: Instant) -> bool {
        self.entries.get(&packet_id) == Some(&recorded)
    }

    /// Pops released pairs off the front and compacts the deque once it holds
    /// more than twice the capacity.
    fn discard_stale(&mut self) {
        while let Some(&(packet_id, recorded)) = self.order.front() {
            if self.is_live(packet_id, recorded) {
                break;
            }
            self.order.pop_front();
        }

        if self.order.len() > self.capacity * 2 {
            let entries = &self.entries;
            self.order
                .retain(|(packet_id, recorded)| entries.get(packet_id) == Some(recorded));
        }
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((packet_id, recorded)) = self.order.pop_front() {
            if self.is_live(packet_id, recorded) {
                self.entries.remove(&packet_id);
                debug_log!(packet_id, "dedup window full, evicted oldest entry");
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> (DedupWindow, Instant) {
        (
            DedupWindow::new(Duration::from_secs(10), 3),
            Instant::now(),
        )
    }

    #[test]
    fn test_record_and_duplicate() {
        let (mut window, now) = window();
        assert!(window.record(7, now));
        assert!(!window.record(7, now + Duration::from_secs(1)));
        assert!(window.contains(7, now));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_release_allows_reuse() {
        let (mut window, now) = window();
        window.record(7, now);
        assert!(window.release(7));
        assert!(!window.contains(7, now));
        assert!(window.record(7, now));
    }

    #[test]
    fn test_entries_expire() {
        let (mut window, now) = window();
        window.record(1, now);
        window.record(2, now + Duration::from_secs(5));

        let later = now + Duration::from_secs(10);
        assert!(!window.contains(1, later));
        assert!(window.contains(2, later));

        assert_eq!(window.sweep(later), 1);
        assert_eq!(window.len(), 1);
        assert_eq!(window.next_expiry(), Some(now + Duration::from_secs(15)));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let (mut window, now) = window();
        window.record(1, now);
        window.record(2, now);
        window.record(3, now);
        window.record(4, now);

        assert_eq!(window.len(), 3);
        assert!(!window.contains(1, now));
        assert!(window.contains(4, now));
    }

    #[test]
    fn test_stale_order_entries_are_skipped() {
        let (mut window, now) = window();
        window.record(1, now);
        window.release(1);
        window.record(2, now + Duration::from_secs(1));

        assert_eq!(window.next_expiry(), Some(now + Duration::from_secs(11)));
        assert_eq!(window.sweep(now + Duration::from_secs(11)), 1);
        assert!(window.is_empty());
    }

    #[test]
    fn test_released_entries_do_not_accumulate() {
        let now = Instant::now();
        let mut window = DedupWindow::new(Duration::from_secs(15), 1024);
        for i in 0..100_000u32 {
            let packet_id = (i % u32::from(u16::MAX)) as u16 + 1;
            assert!(window.record(packet_id, now));
            assert!(window.release(packet_id));
        }

        assert!(window.is_empty());
        assert!(window.order.is_empty());
        assert_eq!(window.next_expiry(), None);
    }

    #[test]
    fn test_order_bounded_behind_unreleased_entry() {
        let now = Instant::now();
        let mut window = DedupWindow::new(Duration::from_secs(15), 16);
        window.record(u16::MAX, now);
        for i in 0..10_000u32 {
            let packet_id = (i % 1000) as u16 + 1;
            window.record(packet_id, now + Duration::from_millis(1));
            window.release(packet_id);
        }

        assert_eq!(window.len(), 1);
        assert!(window.order.len() <= 2 * window.capacity() + 1);
        assert_eq!(window.next_expiry(), Some(now + Duration::from_secs(15)));
    }
}
