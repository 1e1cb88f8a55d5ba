//! Timing parameters and the go-back-N retransmit timer.
//!
//! Reliable delivery requires that unacknowledged bytes are re-sent if no
//! cumulative ACK arrives within a bounded time.  This module provides:
//! - [`TimerConfig`]: every interval the handshake, the two workers and
//!   teardown run on.
//! - [`RetransmitTimer`]: armed while data is on the wire, restarted by each
//!   ACK that makes progress, and reports expiry once the fixed timeout has
//!   passed without progress.
//!
//! The timeout is deliberately fixed: no RTT estimation, no back-off.

use std::time::{Duration, Instant};

/// Adjustable timeout parameters.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Time without ACK progress after which the whole window is resent.
    pub retransmit_timeout: Duration,
    /// Longest the sender worker sleeps without a wake-up.
    pub heartbeat: Duration,
    /// Receive timeout of the receiver worker; bounds teardown latency.
    pub recv_timeout: Duration,
    /// How long an active open waits for SYN+ACK before resending SYN.
    pub handshake_timeout: Duration,
    /// SYN (or SYN+ACK) transmissions before the handshake is abandoned.
    pub max_handshake_attempts: u32,
    /// EXIT transmissions (and idle retransmit periods) before closing gives up.
    pub max_exit_attempts: u32,
    /// Time a fully closed stream keeps answering duplicate EXITs.
    pub linger: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout: Duration::from_millis(500),
            heartbeat: Duration::from_millis(100),
            recv_timeout: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(1),
            max_handshake_attempts: 8,
            max_exit_attempts: 10,
            linger: Duration::from_millis(1000),
        }
    }
}

impl TimerConfig {
    /// Scale every interval so that the retransmit timeout is `rto`.
    ///
    /// Handy for tests, which want the same ratios with much shorter waits.
    pub fn with_retransmit_timeout(rto: Duration) -> Self {
        Self {
            retransmit_timeout: rto,
            heartbeat: (rto / 5).max(Duration::from_millis(1)),
            recv_timeout: (rto / 5).max(Duration::from_millis(1)),
            handshake_timeout: rto * 2,
            linger: rto * 2,
            ..Self::default()
        }
    }

    /// Longest a closing stream may go without hearing from its peer.
    pub fn idle_close_limit(&self) -> Duration {
        self.retransmit_timeout * self.max_exit_attempts
    }
}

/// Fixed-timeout retransmit timer.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    timeout: Duration,
    /// Start of the current wait for ACK progress; `None` when idle.
    armed_at: Option<Instant>,
    /// Number of times the timer has fired.
    expirations: u64,
}

impl RetransmitTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            armed_at: None,
            expirations: 0,
        }
    }

    /// Start timing if not already running (first byte put on the wire).
    pub fn arm(&mut self, now: Instant) {
        if self.armed_at.is_none() {
            self.armed_at = Some(now);
        }
    }

    /// Restart the wait (an ACK made progress, or the window was resent).
    pub fn restart(&mut self, now: Instant) {
        self.armed_at = Some(now);
    }

    /// Stop timing (nothing left on the wire).
    pub fn disarm(&mut self) {
        self.armed_at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    /// Returns `true` (once per timeout period) when the timer has run out.
    ///
    /// Firing restarts the timer so that the caller's resend gets a full
    /// timeout of its own.
    pub fn poll_expired(&mut self, now: Instant) -> bool {
        match self.armed_at {
            Some(start) if now.saturating_duration_since(start) >= self.timeout => {
                self.expirations += 1;
                self.armed_at = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn expirations(&self) -> u64 {
        self.expirations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTO: Duration = Duration::from_millis(100);

    #[test]
    fn idle_timer_never_fires() {
        let mut t = RetransmitTimer::new(RTO);
        let now = Instant::now();
        assert!(!t.poll_expired(now + RTO * 10));
        assert_eq!(t.expirations(), 0);
    }

    #[test]
    fn armed_timer_fires_after_timeout() {
        let mut t = RetransmitTimer::new(RTO);
        let start = Instant::now();
        t.arm(start);
        assert!(!t.poll_expired(start + RTO / 2));
        assert!(t.poll_expired(start + RTO));
        assert_eq!(t.expirations(), 1);
    }

    #[test]
    fn firing_restarts_the_wait() {
        let mut t = RetransmitTimer::new(RTO);
        let start = Instant::now();
        t.arm(start);
        assert!(t.poll_expired(start + RTO));
        assert!(!t.poll_expired(start + RTO + RTO / 2));
        assert!(t.poll_expired(start + RTO * 2));
    }

    #[test]
    fn arm_does_not_reset_a_running_timer() {
        let mut t = RetransmitTimer::new(RTO);
        let start = Instant::now();
        t.arm(start);
        t.arm(start + RTO / 2);
        assert!(t.poll_expired(start + RTO));
    }

    #[test]
    fn restart_pushes_deadline_out() {
        let mut t = RetransmitTimer::new(RTO);
        let start = Instant::now();
        t.arm(start);
        t.restart(start + RTO / 2);
        assert!(!t.poll_expired(start + RTO));
        assert!(t.poll_expired(start + RTO + RTO / 2));
    }

    #[test]
    fn disarm_stops_timer() {
        let mut t = RetransmitTimer::new(RTO);
        let start = Instant::now();
        t.arm(start);
        t.disarm();
        assert!(!t.is_armed());
        assert!(!t.poll_expired(start + RTO * 3));
    }

    #[test]
    fn scaled_config_keeps_ratios() {
        let c = TimerConfig::with_retransmit_timeout(Duration::from_millis(50));
        assert_eq!(c.heartbeat, Duration::from_millis(10));
        assert_eq!(c.handshake_timeout, Duration::from_millis(100));
        assert_eq!(c.idle_close_limit(), Duration::from_millis(500));
    }
}
