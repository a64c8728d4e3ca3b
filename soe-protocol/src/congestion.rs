//! Window control for the session
//!
//! A simple AIMD controller sizes the window of unacknowledged packets. Every
//! acknowledged packet opens the window by `additive_increase / window`, so a
//! full window of acks grows it by roughly `additive_increase` packets. A
//! retransmission timeout cuts it by `multiplicative_decrease`, at most once
//! per round trip so a burst of expiring packets counts as one loss event.

use crate::config::WindowConfig;
use std::time::{Duration, Instant};

/// AIMD window controller
#[derive(Debug, Clone)]
pub struct WindowController {
    config: WindowConfig,
    /// Hard ceiling from the session's resend window size
    max_size: u32,
    /// Fractional window size
    window: f64,
    /// Last time the window was cut
    last_decrease: Option<Instant>,
    increases: u64,
    decreases: u64,
}

impl WindowController {
    /// Create a controller bounded by `max_size` packets
    pub fn new(config: WindowConfig, max_size: u32) -> Self {
        let max_size = max_size.max(1);
        let min = config.min_size.clamp(1, max_size);
        let initial = config.initial_size.clamp(min, max_size);

        WindowController {
            config: WindowConfig {
                min_size: min,
                ..config
            },
            max_size,
            window: initial as f64,
            last_decrease: None,
            increases: 0,
            decreases: 0,
        }
    }

    /// Current window size in packets
    pub fn window_size(&self) -> u32 {
        (self.window as u32).clamp(self.config.min_size, self.max_size)
    }

    /// Upper bound the window can reach
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Record newly acknowledged packets
    pub fn on_ack(&mut self, acked_packets: u32) {
        if acked_packets == 0 {
            return;
        }
        let before = self.window_size();
        for _ in 0..acked_packets {
            self.window += self.config.additive_increase / self.window.max(1.0);
        }
        self.window = self.window.min(self.max_size as f64);

        if self.window_size() > before {
            self.increases += 1;
            tracing::trace!("Window opened to {}", self.window_size());
        }
    }

    /// Record a retransmission timeout
    ///
    /// Returns true when the window was actually reduced.
    pub fn on_timeout(&mut self, now: Instant, rtt: Duration) -> bool {
        if let Some(last) = self.last_decrease {
            if now.saturating_duration_since(last) < rtt {
                return false;
            }
        }

        let before = self.window_size();
        self.window = (self.window * self.config.multiplicative_decrease)
            .max(self.config.min_size as f64);
        self.last_decrease = Some(now);
        self.decreases += 1;

        tracing::debug!("Window closed from {} to {}", before, self.window_size());
        true
    }

    pub fn stats(&self) -> WindowStats {
        WindowStats {
            window_size: self.window_size(),
            max_size: self.max_size,
            increases: self.increases,
            decreases: self.decreases,
        }
    }
}

/// Window controller statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub window_size: u32,
    pub max_size: u32,
    /// Number of acks that grew the window by at least one packet
    pub increases: u64,
    /// Number of timeout-driven reductions
    pub decreases: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial: u32) -> WindowConfig {
        WindowConfig {
            initial_size: initial,
            min_size: 2,
            additive_increase: 1.0,
            multiplicative_decrease: 0.5,
        }
    }

    #[test]
    fn test_initial_window() {
        let wc = WindowController::new(config(16), 64);
        assert_eq!(wc.window_size(), 16);

        let capped = WindowController::new(config(128), 64);
        assert_eq!(capped.window_size(), 64);
    }

    #[test]
    fn test_additive_increase() {
        let mut wc = WindowController::new(config(16), 64);

        // One full window of acks grows by about one packet
        wc.on_ack(16);
        assert_eq!(wc.window_size(), 16);
        wc.on_ack(1);
        assert_eq!(wc.window_size(), 17);
    }

    #[test]
    fn test_never_exceeds_max() {
        let mut wc = WindowController::new(config(60), 64);
        wc.on_ack(100_000);
        assert_eq!(wc.window_size(), 64);
    }

    #[test]
    fn test_multiplicative_decrease() {
        let mut wc = WindowController::new(config(32), 64);
        let now = Instant::now();

        assert!(wc.on_timeout(now, Duration::from_millis(100)));
        assert_eq!(wc.window_size(), 16);

        // Second timeout within one RTT is the same loss event
        assert!(!wc.on_timeout(now + Duration::from_millis(10), Duration::from_millis(100)));
        assert_eq!(wc.window_size(), 16);

        assert!(wc.on_timeout(now + Duration::from_millis(200), Duration::from_millis(100)));
        assert_eq!(wc.window_size(), 8);
    }

    #[test]
    fn test_floor() {
        let mut wc = WindowController::new(config(4), 64);
        let mut now = Instant::now();
        for _ in 0..10 {
            wc.on_timeout(now, Duration::ZERO);
            now += Duration::from_millis(1);
        }
        assert_eq!(wc.window_size(), 2);
        assert_eq!(wc.stats().decreases, 10);
    }
}
