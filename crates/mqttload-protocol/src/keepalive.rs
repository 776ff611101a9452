use crate::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub ping_interval_percent: u8,
    pub timeout_percent: u8,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_percent: 75,
            timeout_percent: 150,
        }
    }
}

impl KeepaliveConfig {
    #[must_use]
    pub const fn new(ping_interval_percent: u8, timeout_percent: u8) -> Self {
        Self {
            ping_interval_percent,
            timeout_percent,
        }
    }

    #[must_use]
    pub fn ping_interval(&self, keep_alive: Duration) -> Duration {
        scale(keep_alive, self.ping_interval_percent)
    }

    #[must_use]
    pub fn timeout_duration(&self, keep_alive: Duration) -> Duration {
        scale(keep_alive, self.timeout_percent)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn scale(keep_alive: Duration, percent: u8) -> Duration {
    let millis = keep_alive.as_millis() as u64;
    Duration::from_millis(millis * u64::from(percent) / 100)
}

/// Ping bookkeeping for an idle connection. A zero keep-alive disables it.
#[derive(Debug, Clone)]
pub struct KeepaliveTracker {
    keep_alive: Duration,
    config: KeepaliveConfig,
    last_sent_at: Option<Instant>,
    ping_sent_at: Option<Instant>,
}

impl KeepaliveTracker {
    #[must_use]
    pub fn new(keep_alive: Duration, config: KeepaliveConfig) -> Self {
        Self {
            keep_alive,
            config,
            last_sent_at: None,
            ping_sent_at: None,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.keep_alive.is_zero()
    }

    pub fn on_packet_sent(&mut self, now: Instant) {
        self.last_sent_at = Some(now);
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.last_sent_at = Some(now);
        self.ping_sent_at = Some(now);
    }

    pub fn on_pong(&mut self) {
        self.ping_sent_at = None;
    }

    #[must_use]
    pub fn ping_due(&self, now: Instant) -> bool {
        self.is_enabled()
            && self.ping_sent_at.is_none()
            && self
                .last_sent_at
                .is_some_and(|at| now >= at + self.config.ping_interval(self.keep_alive))
    }

    #[must_use]
    pub fn timed_out(&self, now: Instant) -> bool {
        self.ping_sent_at
            .is_some_and(|at| now >= at + self.config.timeout_duration(self.keep_alive))
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.is_enabled() {
            return None;
        }
        match self.ping_sent_at {
            Some(at) => Some(at + self.config.timeout_duration(self.keep_alive)),
            None => self
                .last_sent_at
                .map(|at| at + self.config.ping_interval(self.keep_alive)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intervals() {
        let config = KeepaliveConfig::default();
        let keep_alive = Duration::from_secs(60);
        assert_eq!(config.ping_interval(keep_alive), Duration::from_secs(45));
        assert_eq!(config.timeout_duration(keep_alive), Duration::from_secs(90));
    }

    #[test]
    fn test_ping_then_timeout() {
        let start = Instant::now();
        let mut tracker = KeepaliveTracker::new(Duration::from_secs(60), KeepaliveConfig::default());
        tracker.on_packet_sent(start);

        assert!(!tracker.ping_due(start + Duration::from_secs(44)));
        assert!(tracker.ping_due(start + Duration::from_secs(45)));

        let ping_at = start + Duration::from_secs(45);
        tracker.on_ping_sent(ping_at);
        assert!(!tracker.ping_due(ping_at + Duration::from_secs(50)));
        assert_eq!(tracker.next_deadline(), Some(ping_at + Duration::from_secs(90)));
        assert!(tracker.timed_out(ping_at + Duration::from_secs(90)));

        tracker.on_pong();
        assert!(!tracker.timed_out(ping_at + Duration::from_secs(90)));
    }

    #[test]
    fn test_disabled() {
        let mut tracker = KeepaliveTracker::new(Duration::ZERO, KeepaliveConfig::default());
        let now = Instant::now();
        tracker.on_packet_sent(now);
        assert!(!tracker.ping_due(now + Duration::from_secs(3600)));
        assert_eq!(tracker.next_deadline(), None);
    }
}
