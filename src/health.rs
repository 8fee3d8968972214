use crate::config::KeepAliveConfig;
use std::time::Instant;
use tokio::time::Duration;

/// Upper bound on how long the monitor sleeps between liveness checks
const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Tracks ping/pong liveness for a single session
#[derive(Debug)]
pub(crate) struct KeepAlive {
    config: KeepAliveConfig,

    /// Time of last ping sent (session start before the first ping)
    last_ping_sent: Instant,

    /// Number of consecutive pings without a pong
    consecutive_missed: u32,

    /// Whether we're currently waiting for a pong
    waiting_for_pong: bool,
}

impl KeepAlive {
    /// Start tracking a freshly established session.
    ///
    /// The first ping goes out one interval after the session starts.
    pub fn new(config: KeepAliveConfig) -> Self {
        Self {
            config,
            last_ping_sent: Instant::now(),
            consecutive_missed: 0,
            waiting_for_pong: false,
        }
    }

    pub fn record_ping_sent(&mut self) {
        self.last_ping_sent = Instant::now();
        self.waiting_for_pong = true;
    }

    pub fn record_pong_received(&mut self) {
        self.consecutive_missed = 0;
        self.waiting_for_pong = false;
    }

    /// Check if we should send a ping now
    pub fn should_send_ping(&self) -> bool {
        self.config.enabled
            && !self.waiting_for_pong
            && self.last_ping_sent.elapsed() >= self.config.ping_interval
    }

    /// Check if pong is overdue and record a miss if so.
    ///
    /// Has side effects: increments the miss counter and clears the
    /// waiting flag so the next ping can go out.
    pub fn check_and_record_pong_timeout(&mut self) -> bool {
        if !self.waiting_for_pong || self.last_ping_sent.elapsed() < self.config.pong_timeout {
            return false;
        }
        self.consecutive_missed += 1;
        self.waiting_for_pong = false;
        true
    }

    /// Whether enough pongs were missed to treat the session as lost
    pub fn is_unhealthy(&self) -> bool {
        self.config.enabled && self.consecutive_missed >= self.config.failure_threshold
    }

    /// Get time until the next liveness action, capped for responsiveness
    pub fn time_until_next_check(&self) -> Duration {
        if !self.config.enabled {
            return MAX_CHECK_INTERVAL;
        }
        let deadline = if self.waiting_for_pong {
            self.config.pong_timeout
        } else {
            self.config.ping_interval
        };
        deadline
            .saturating_sub(self.last_ping_sent.elapsed())
            .min(MAX_CHECK_INTERVAL)
    }

    pub fn consecutive_missed(&self) -> u32 {
        self.consecutive_missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> KeepAliveConfig {
        KeepAliveConfig {
            enabled: true,
            ping_interval: Duration::from_millis(100),
            pong_timeout: Duration::from_millis(50),
            failure_threshold: 3,
        }
    }

    #[test]
    fn test_initial_state() {
        let mut keepalive = KeepAlive::new(test_config());
        assert!(!keepalive.should_send_ping()); // first ping waits one interval
        assert!(!keepalive.check_and_record_pong_timeout());
        assert!(!keepalive.is_unhealthy());
    }

    #[tokio::test]
    async fn test_ping_due_after_interval() {
        let keepalive = KeepAlive::new(test_config());
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(keepalive.should_send_ping());
    }

    #[test]
    fn test_ping_pong_cycle() {
        let mut keepalive = KeepAlive::new(test_config());

        keepalive.record_ping_sent();
        assert!(!keepalive.should_send_ping()); // Waiting for pong

        keepalive.record_pong_received();
        assert_eq!(keepalive.consecutive_missed(), 0);
    }

    #[tokio::test]
    async fn test_pong_timeout() {
        let mut keepalive = KeepAlive::new(test_config());

        keepalive.record_ping_sent();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(keepalive.check_and_record_pong_timeout());
        assert_eq!(keepalive.consecutive_missed(), 1);
        // Already recorded
        assert!(!keepalive.check_and_record_pong_timeout());
    }

    #[tokio::test]
    async fn test_unhealthy_after_threshold() {
        let mut keepalive = KeepAlive::new(test_config());

        for _ in 0..3 {
            keepalive.record_ping_sent();
            tokio::time::sleep(Duration::from_millis(60)).await;
            keepalive.check_and_record_pong_timeout();
        }

        assert!(keepalive.is_unhealthy());
    }

    #[test]
    fn test_disabled_never_pings() {
        let mut keepalive = KeepAlive::new(KeepAliveConfig::disabled());
        keepalive.consecutive_missed = 10;
        assert!(!keepalive.should_send_ping());
        assert!(!keepalive.is_unhealthy());
        assert_eq!(keepalive.time_until_next_check(), MAX_CHECK_INTERVAL);
    }
}
