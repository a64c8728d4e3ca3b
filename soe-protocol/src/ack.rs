//! Acknowledgment bookkeeping
//!
//! The receive side keeps the next expected sequence, a bounded hold list for
//! packets that arrive ahead of it, and a delayed-ack flag so that one
//! cumulative ack covers everything processed in a tick. The send side
//! samples round-trip times from acks and derives the retransmission timeout.

use crate::packet::SessionPacket;
use crate::sequence::SeqNumber;
use std::collections::HashMap;
use std::time::Duration;

/// Result of offering a sequenced packet to the [`ReceiveTracker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// The packet was next in line; it is returned followed by any held
    /// packets that are now contiguous, all in sequence order
    Deliver(Vec<SessionPacket>),
    /// Ahead of the expected sequence and held for later
    Held,
    /// Already received; dropped and re-acked
    Duplicate,
    /// Too far ahead to hold; dropped without ack
    Dropped,
}

/// Incoming sequence tracker
#[derive(Debug)]
pub struct ReceiveTracker {
    next_expected: SeqNumber,
    held: HashMap<u16, SessionPacket>,
    max_held: usize,
    send_delayed_ack: bool,
    last_ack_sent: Option<SeqNumber>,
    duplicates: u64,
    dropped_ahead: u64,
}

impl ReceiveTracker {
    /// Create a tracker holding at most `max_held` early packets
    pub fn new(max_held: usize) -> Self {
        ReceiveTracker {
            next_expected: SeqNumber::new(0),
            held: HashMap::new(),
            max_held,
            send_delayed_ack: false,
            last_ack_sent: None,
            duplicates: 0,
            dropped_ahead: 0,
        }
    }

    /// Offer a received data or fragment packet
    pub fn offer(&mut self, seq: SeqNumber, packet: SessionPacket) -> Arrival {
        let distance = self.next_expected.distance_to(seq);

        if distance < 0 {
            self.duplicates += 1;
            self.send_delayed_ack = true;
            tracing::trace!("Duplicate packet {} (expecting {})", seq, self.next_expected);
            return Arrival::Duplicate;
        }

        if distance > 0 {
            if self.held.contains_key(&seq.as_raw()) {
                self.duplicates += 1;
                return Arrival::Duplicate;
            }
            if distance as usize > self.max_held || self.held.len() >= self.max_held {
                self.dropped_ahead += 1;
                tracing::debug!(
                    "Dropping packet {} too far ahead of {}",
                    seq,
                    self.next_expected
                );
                return Arrival::Dropped;
            }
            self.held.insert(seq.as_raw(), packet);
            tracing::trace!("Holding out-of-order packet {}", seq);
            return Arrival::Held;
        }

        let mut ready = vec![packet];
        self.next_expected.increment();
        while let Some(next) = self.held.remove(&self.next_expected.as_raw()) {
            ready.push(next);
            self.next_expected.increment();
        }
        self.send_delayed_ack = true;

        Arrival::Deliver(ready)
    }

    /// Take the cumulative ack owed for this tick, if any
    pub fn take_pending_ack(&mut self) -> Option<SeqNumber> {
        if !self.send_delayed_ack {
            return None;
        }
        self.send_delayed_ack = false;
        // Nothing received yet means there is nothing to acknowledge
        if self.last_ack_sent.is_none() && self.next_expected == SeqNumber::new(0) {
            return None;
        }
        let ack = self.next_expected.prev();
        self.last_ack_sent = Some(ack);
        Some(ack)
    }

    pub fn next_expected(&self) -> SeqNumber {
        self.next_expected
    }

    /// Highest sequence acknowledged to the peer
    pub fn last_ack_sent(&self) -> Option<SeqNumber> {
        self.last_ack_sent
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Drop held packets, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        let count = self.held.len();
        self.held.clear();
        count
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn dropped_ahead(&self) -> u64 {
        self.dropped_ahead
    }
}

/// RTT (Round-Trip Time) estimator
///
/// Smoothed RTT and variance follow the usual 1/8 and 1/4 gains; the
/// timeout is `srtt + 4 * rttvar`, clamped, and doubles on each consecutive
/// retransmission timeout until a fresh sample arrives.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: f64,
    rtt_var: f64,
    min_rto: Duration,
    max_rto: Duration,
    backoff: u32,
    stats: RttStats,
    total: Duration,
}

/// Round-trip statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RttStats {
    pub last: Duration,
    pub average: Duration,
    pub shortest: Duration,
    pub longest: Duration,
    pub samples: u64,
}

impl RttEstimator {
    const MAX_BACKOFF: u32 = 6;

    /// Create an estimator; `initial_rto` is used until the first sample
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        let initial_us = initial_rto.as_micros() as f64;
        RttEstimator {
            srtt: initial_us / 3.0,
            rtt_var: initial_us / 6.0,
            min_rto,
            max_rto,
            backoff: 0,
            stats: RttStats::default(),
            total: Duration::ZERO,
        }
    }

    /// Update with a new RTT sample
    pub fn update(&mut self, sample: Duration) {
        let sample_us = sample.as_micros() as f64;

        if self.stats.samples == 0 {
            self.srtt = sample_us;
            self.rtt_var = sample_us / 2.0;
            self.stats.shortest = sample;
            self.stats.longest = sample;
        } else {
            let alpha = 0.125;
            let beta = 0.25;

            let error = sample_us - self.srtt;
            self.srtt += alpha * error;
            self.rtt_var = (1.0 - beta) * self.rtt_var + beta * error.abs();

            self.stats.shortest = self.stats.shortest.min(sample);
            self.stats.longest = self.stats.longest.max(sample);
        }

        self.stats.samples += 1;
        self.stats.last = sample;
        self.total += sample;
        self.stats.average = self.total / self.stats.samples.min(u32::MAX as u64) as u32;
        self.backoff = 0;
    }

    /// Double the timeout after a retransmission
    pub fn on_timeout(&mut self) {
        self.backoff = (self.backoff + 1).min(Self::MAX_BACKOFF);
    }

    /// Smoothed RTT
    pub fn srtt(&self) -> Duration {
        Duration::from_micros(self.srtt as u64)
    }

    /// RTT variance
    pub fn rtt_var(&self) -> Duration {
        Duration::from_micros(self.rtt_var as u64)
    }

    /// Get retransmission timeout (RTO)
    pub fn rto(&self) -> Duration {
        let base = Duration::from_micros((self.srtt + 4.0 * self.rtt_var) as u64)
            .clamp(self.min_rto, self.max_rto);
        (base * (1u32 << self.backoff)).min(self.max_rto)
    }

    pub fn stats(&self) -> RttStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn data(seq: u16) -> SessionPacket {
        SessionPacket::Data {
            channel: crate::packet::Channel::A,
            seq: SeqNumber::new(seq),
            payload: Bytes::from(vec![seq as u8 | 1]),
        }
    }

    fn deliver(tracker: &mut ReceiveTracker, seq: u16) -> Arrival {
        tracker.offer(SeqNumber::new(seq), data(seq))
    }

    #[test]
    fn test_in_order_delivery() {
        let mut tracker = ReceiveTracker::new(8);
        assert_eq!(deliver(&mut tracker, 0), Arrival::Deliver(vec![data(0)]));
        assert_eq!(tracker.take_pending_ack(), Some(SeqNumber::new(0)));
        assert_eq!(tracker.take_pending_ack(), None);
    }

    #[test]
    fn test_hold_and_release() {
        let mut tracker = ReceiveTracker::new(8);
        assert_eq!(deliver(&mut tracker, 2), Arrival::Held);
        assert_eq!(deliver(&mut tracker, 1), Arrival::Held);
        assert_eq!(tracker.take_pending_ack(), None);

        assert_eq!(
            deliver(&mut tracker, 0),
            Arrival::Deliver(vec![data(0), data(1), data(2)])
        );
        assert_eq!(tracker.held_count(), 0);
        assert_eq!(tracker.take_pending_ack(), Some(SeqNumber::new(2)));
    }

    #[test]
    fn test_duplicates_reacked() {
        let mut tracker = ReceiveTracker::new(8);
        deliver(&mut tracker, 0);
        tracker.take_pending_ack();

        assert_eq!(deliver(&mut tracker, 0), Arrival::Duplicate);
        assert_eq!(tracker.take_pending_ack(), Some(SeqNumber::new(0)));

        deliver(&mut tracker, 3);
        assert_eq!(deliver(&mut tracker, 3), Arrival::Duplicate);
        assert_eq!(tracker.duplicates(), 2);
    }

    #[test]
    fn test_hold_list_bounded() {
        let mut tracker = ReceiveTracker::new(2);
        assert_eq!(deliver(&mut tracker, 1), Arrival::Held);
        assert_eq!(deliver(&mut tracker, 2), Arrival::Held);
        assert_eq!(deliver(&mut tracker, 3), Arrival::Dropped);
        assert_eq!(tracker.dropped_ahead(), 1);
    }

    #[test]
    fn test_wraparound_ordering() {
        let mut tracker = ReceiveTracker::new(8);
        tracker.next_expected = SeqNumber::new(u16::MAX);

        assert_eq!(deliver(&mut tracker, 0), Arrival::Held);
        assert_eq!(
            deliver(&mut tracker, u16::MAX),
            Arrival::Deliver(vec![data(u16::MAX), data(0)])
        );
        assert_eq!(tracker.next_expected(), SeqNumber::new(1));
        assert_eq!(deliver(&mut tracker, u16::MAX - 3), Arrival::Duplicate);
    }

    #[test]
    fn test_rtt_estimator() {
        let mut estimator = RttEstimator::new(
            Duration::from_millis(500),
            Duration::from_millis(10),
            Duration::from_secs(5),
        );

        estimator.update(Duration::from_millis(100));
        estimator.update(Duration::from_millis(120));
        estimator.update(Duration::from_millis(90));

        let srtt = estimator.srtt();
        assert!(srtt > Duration::from_millis(90) && srtt < Duration::from_millis(120));
        assert!(estimator.rto() > Duration::from_millis(100));

        let stats = estimator.stats();
        assert_eq!(stats.shortest, Duration::from_millis(90));
        assert_eq!(stats.longest, Duration::from_millis(120));
        assert_eq!(stats.last, Duration::from_millis(90));
        assert_eq!(stats.average.as_micros(), 103_333);
    }

    #[test]
    fn test_rto_clamp_and_backoff() {
        let mut estimator = RttEstimator::new(
            Duration::from_millis(500),
            Duration::from_millis(200),
            Duration::from_secs(1),
        );
        estimator.update(Duration::from_millis(1));
        assert_eq!(estimator.rto(), Duration::from_millis(200));

        estimator.on_timeout();
        assert_eq!(estimator.rto(), Duration::from_millis(400));
        for _ in 0..10 {
            estimator.on_timeout();
        }
        assert_eq!(estimator.rto(), Duration::from_secs(1));

        estimator.update(Duration::from_millis(1));
        assert!(estimator.rto() < Duration::from_secs(1));
    }
}
