//! Periodic deadlines for the service workers
//!
//! The caller passes in the current instant, so a schedule can be driven by
//! the worker's own clock reading or by simulated time in tests.

use std::time::{Duration, Instant};

/// Repeating deadline
///
/// Fires at most once per poll. A worker that falls behind by several periods
/// gets one firing and the schedule restarts from that poll, so missed
/// periods are skipped rather than replayed in a burst.
#[derive(Debug, Clone)]
pub struct Interval {
    period: Duration,
    next: Instant,
    fired: u64,
}

impl Interval {
    /// Create an interval whose first deadline is one period after `now`
    pub fn new(period: Duration, now: Instant) -> Self {
        Interval {
            period,
            next: now + period,
            fired: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Fire if the deadline has passed
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }

        let late = now.saturating_duration_since(self.next);
        self.next = if late >= self.period {
            now + self.period
        } else {
            self.next + self.period
        };
        self.fired += 1;
        true
    }

    /// Time left until the next deadline, zero when overdue
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }

    /// Push the next deadline a full period past `now`
    pub fn reset(&mut self, now: Instant) {
        self.next = now + self.period;
    }

    /// Number of times the interval has fired
    pub fn fired(&self) -> u64 {
        self.fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_fires_on_deadline() {
        let start = Instant::now();
        let mut interval = Interval::new(Duration::from_millis(100), start);

        assert!(!interval.poll(start));
        assert!(!interval.poll(start + Duration::from_millis(99)));
        assert!(interval.poll(start + Duration::from_millis(100)));
        assert!(!interval.poll(start + Duration::from_millis(150)));
        assert!(interval.poll(start + Duration::from_millis(210)));
        assert_eq!(interval.fired(), 2);
    }

    #[test]
    fn test_interval_keeps_phase_when_slightly_late() {
        let start = Instant::now();
        let mut interval = Interval::new(Duration::from_millis(100), start);

        assert!(interval.poll(start + Duration::from_millis(130)));
        assert_eq!(
            interval.remaining(start + Duration::from_millis(130)),
            Duration::from_millis(70)
        );
    }

    #[test]
    fn test_interval_skips_missed_periods() {
        let start = Instant::now();
        let mut interval = Interval::new(Duration::from_millis(10), start);
        let late = start + Duration::from_secs(1);

        assert!(interval.poll(late));
        assert!(!interval.poll(late));
        assert_eq!(interval.remaining(late), Duration::from_millis(10));
        assert_eq!(interval.fired(), 1);
    }

    #[test]
    fn test_interval_reset() {
        let start = Instant::now();
        let mut interval = Interval::new(Duration::from_millis(50), start);
        let later = start + Duration::from_millis(60);

        interval.reset(later);
        assert!(!interval.poll(later));
        assert_eq!(interval.remaining(later), Duration::from_millis(50));
        assert_eq!(interval.period(), Duration::from_millis(50));
    }
}
