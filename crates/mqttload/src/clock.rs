use mqttload_protocol::time::Instant;
use mqttload_protocol::Clock;

/// Clock backed by tokio's timer, so paused-time tests move it too.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_follows_paused_time() {
        let clock = TokioClock;
        let before = clock.now();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(clock.now() - before, Duration::from_secs(30));
    }
}
