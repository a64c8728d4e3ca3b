//! Send window for reliable packets
//!
//! Built packets wait in a pending queue until the window has room. Admitted
//! packets stay in the window, in sequence order, until a cumulative ack
//! covers them. When the 16-bit counter wraps, packets numbered after the wrap
//! are parked in a rollover list and only promoted once every pre-wrap packet
//! is acknowledged, so old and new numbering are never in flight together.

use crate::fragment::BuiltPacket;
use crate::sequence::SeqNumber;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A packet admitted to the window
#[derive(Debug, Clone)]
pub struct WindowEntry {
    pub seq: SeqNumber,
    pub data: Bytes,
    /// First transmission, `None` while parked in the rollover list
    pub first_sent: Option<Instant>,
    pub last_sent: Option<Instant>,
    pub resend_count: u32,
    /// Selectively acknowledged by an out-of-order report
    pub acknowledged: bool,
    /// Scheduled for resend ahead of its timeout
    pub fast_resend: bool,
}

impl WindowEntry {
    fn new(packet: BuiltPacket) -> Self {
        WindowEntry {
            seq: packet.seq,
            data: packet.data,
            first_sent: None,
            last_sent: None,
            resend_count: 0,
            acknowledged: false,
            fast_resend: false,
        }
    }

    fn mark_sent(&mut self, now: Instant) {
        self.first_sent.get_or_insert(now);
        self.last_sent = Some(now);
    }
}

/// Outcome of a cumulative ack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Entries released from the window
    pub released: u32,
    /// Round-trip sample from a released packet that was never resent
    pub rtt_sample: Option<Duration>,
}

/// A packet due for retransmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resend {
    pub seq: SeqNumber,
    pub data: Bytes,
    /// Resends of this packet so far, including this one
    pub resend_count: u32,
    /// True for RTO expiry, false for an out-of-order fast resend
    pub timed_out: bool,
}

/// Sliding window of unacknowledged reliable packets
#[derive(Debug, Default)]
pub struct SendWindow {
    pending: VecDeque<BuiltPacket>,
    window: VecDeque<WindowEntry>,
    rollover: VecDeque<WindowEntry>,
    rollover_active: bool,
    last_admitted: Option<SeqNumber>,
    max_in_flight: usize,
}

impl SendWindow {
    pub fn new() -> Self {
        SendWindow::default()
    }

    /// Queue a built packet behind those already pending
    pub fn push_pending(&mut self, packet: BuiltPacket) {
        self.pending.push_back(packet);
    }

    /// Admit pending packets while window and rollover hold fewer than
    /// `window_size` entries
    ///
    /// Returns the encoded packets to transmit now, in sequence order.
    pub fn admit(&mut self, now: Instant, window_size: usize) -> Vec<Bytes> {
        let mut to_send = Vec::new();

        while self.in_flight() < window_size {
            let packet = match self.pending.pop_front() {
                Some(packet) => packet,
                None => break,
            };

            if let Some(last) = self.last_admitted {
                if packet.seq.as_raw() < last.as_raw() && !self.window.is_empty() {
                    tracing::debug!(
                        "Sequence rollover at {}, parking packets until {} entries drain",
                        packet.seq,
                        self.window.len()
                    );
                    self.rollover_active = true;
                }
            }
            self.last_admitted = Some(packet.seq);

            let mut entry = WindowEntry::new(packet);
            if self.rollover_active {
                self.rollover.push_back(entry);
            } else {
                entry.mark_sent(now);
                to_send.push(entry.data.clone());
                self.window.push_back(entry);
            }
        }

        self.max_in_flight = self.max_in_flight.max(self.in_flight());
        to_send
    }

    /// Release every entry with sequence at or before `ack`
    ///
    /// Entries after `ack` are untouched. Once the pre-wrap epoch drains,
    /// parked rollover entries move into the window; call [`SendWindow::promote`]
    /// to transmit them.
    pub fn ack_up_to(&mut self, ack: SeqNumber, now: Instant) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        while let Some(front) = self.window.front() {
            if !front.seq.le(ack) {
                break;
            }
            if let Some(entry) = self.window.pop_front() {
                outcome.released += 1;
                if entry.resend_count == 0 && !entry.acknowledged {
                    if let Some(sent) = entry.last_sent {
                        outcome.rtt_sample = Some(now.saturating_duration_since(sent));
                    }
                }
            }
        }

        outcome
    }

    /// Move parked rollover entries into the window once it has drained
    ///
    /// Returns the packets to transmit.
    pub fn promote(&mut self, now: Instant) -> Vec<Bytes> {
        if !self.rollover_active || !self.window.is_empty() {
            return Vec::new();
        }

        tracing::debug!(
            "Rollover complete, promoting {} parked packets",
            self.rollover.len()
        );
        self.rollover_active = false;

        let mut to_send = Vec::with_capacity(self.rollover.len());
        for mut entry in self.rollover.drain(..) {
            entry.mark_sent(now);
            to_send.push(entry.data.clone());
            self.window.push_back(entry);
        }
        to_send
    }

    /// Handle an out-of-order report for `seq`
    ///
    /// Marks `seq` as received and schedules every unacknowledged entry before
    /// it that has been in flight for at least `min_age`. Returns how many were
    /// scheduled, or `None` if `seq` is not in the window.
    pub fn mark_out_of_order(
        &mut self,
        seq: SeqNumber,
        now: Instant,
        min_age: Duration,
    ) -> Option<usize> {
        let index = self.index_of(seq)?;
        self.window[index].acknowledged = true;

        let mut scheduled = 0;
        for entry in self.window.iter_mut().take(index) {
            if entry.acknowledged || entry.fast_resend {
                continue;
            }
            let old_enough = entry
                .last_sent
                .map_or(false, |sent| now.saturating_duration_since(sent) >= min_age);
            if old_enough {
                entry.fast_resend = true;
                scheduled += 1;
            }
        }
        Some(scheduled)
    }

    /// Collect entries whose timeout expired or that are flagged for fast resend
    ///
    /// Sequence numbers are preserved and send timestamps refreshed.
    pub fn due_for_resend(&mut self, now: Instant, rto: Duration) -> Vec<Resend> {
        let mut due = Vec::new();

        for entry in self.window.iter_mut() {
            if entry.acknowledged {
                continue;
            }
            let timed_out = entry
                .last_sent
                .map_or(false, |sent| now.saturating_duration_since(sent) >= rto);
            if !timed_out && !entry.fast_resend {
                continue;
            }

            entry.fast_resend = false;
            entry.resend_count += 1;
            entry.mark_sent(now);
            due.push(Resend {
                seq: entry.seq,
                data: entry.data.clone(),
                resend_count: entry.resend_count,
                timed_out,
            });
        }

        due
    }

    fn index_of(&self, seq: SeqNumber) -> Option<usize> {
        let front = self.window.front()?.seq;
        let offset = front.distance_to(seq);
        if offset < 0 || offset as usize >= self.window.len() {
            return None;
        }
        Some(offset as usize)
    }

    /// Entries counted against the window size
    pub fn in_flight(&self) -> usize {
        self.window.len() + self.rollover.len()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn rollover_len(&self) -> usize {
        self.rollover.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn rollover_active(&self) -> bool {
        self.rollover_active
    }

    /// Oldest unacknowledged sequence in the window
    pub fn oldest(&self) -> Option<SeqNumber> {
        self.window.front().map(|e| e.seq)
    }

    /// Largest number of entries ever in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn entries(&self) -> impl Iterator<Item = &WindowEntry> {
        self.window.iter()
    }

    /// True when nothing is pending, in flight or parked
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.window.is_empty() && self.rollover.is_empty()
    }

    /// Drop everything, returning (pending, window, rollover) counts
    pub fn clear(&mut self) -> (usize, usize, usize) {
        let counts = (self.pending.len(), self.window.len(), self.rollover.len());
        self.pending.clear();
        self.window.clear();
        self.rollover.clear();
        self.rollover_active = false;
        counts
    }
}
