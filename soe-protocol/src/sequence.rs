//! Wrapping 16-bit sequence numbers
//!
//! Reliable packets are numbered 0..=0xFFFF and the counter wraps back to 0.
//! Comparisons use serial-number arithmetic: `a` is before `b` when the
//! wrapped difference `b - a`, read as a signed 16-bit value, is positive.
//! That holds for numbers less than half the space apart, which the send
//! window guarantees.

use std::fmt;

/// Largest sequence number before the counter wraps
pub const MAX_SEQ_NUMBER: u16 = u16::MAX;

/// Half of the sequence space; distances at or beyond this are ambiguous
pub const HALF_SEQ_SPACE: u32 = 0x8000;

/// Sequence number of a reliable data or fragment packet
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SeqNumber(u16);

impl SeqNumber {
    #[inline]
    pub const fn new(value: u16) -> Self {
        SeqNumber(value)
    }

    /// Value as carried on the wire
    #[inline]
    pub fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub fn increment(&mut self) {
        *self = self.next();
    }

    #[inline]
    pub fn next(self) -> Self {
        SeqNumber(self.0.wrapping_add(1))
    }

    #[inline]
    pub fn prev(self) -> Self {
        SeqNumber(self.0.wrapping_sub(1))
    }

    /// Signed steps from `self` forward to `other`
    ///
    /// Negative when `other` is behind. The result lies in -32768..=32767.
    #[inline]
    pub fn distance_to(self, other: SeqNumber) -> i32 {
        i32::from(other.0.wrapping_sub(self.0) as i16)
    }

    /// Strictly before `other`
    #[inline]
    pub fn lt(self, other: SeqNumber) -> bool {
        self.distance_to(other) > 0
    }

    #[inline]
    pub fn le(self, other: SeqNumber) -> bool {
        self.distance_to(other) >= 0
    }

    /// Strictly after `other`
    #[inline]
    pub fn gt(self, other: SeqNumber) -> bool {
        self.distance_to(other) < 0
    }

    #[inline]
    pub fn ge(self, other: SeqNumber) -> bool {
        self.distance_to(other) <= 0
    }

    /// The next increment wraps the counter to zero
    #[inline]
    pub fn is_last_before_wrap(self) -> bool {
        self.0 == MAX_SEQ_NUMBER
    }
}

impl fmt::Debug for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNumber({})", self.0)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wraps_to_zero() {
        let mut seq = SeqNumber::new(MAX_SEQ_NUMBER);
        assert!(seq.is_last_before_wrap());
        seq.increment();
        assert_eq!(seq, SeqNumber::new(0));
        assert_eq!(seq.prev(), SeqNumber::new(MAX_SEQ_NUMBER));
    }

    #[test]
    fn test_ordering_across_wrap() {
        let last = SeqNumber::new(0xFFF0);
        let first = SeqNumber::new(0x0005);

        assert_eq!(last.distance_to(first), 21);
        assert_eq!(first.distance_to(last), -21);
        assert!(last.lt(first));
        assert!(first.gt(last));
        assert!(last.le(last) && last.ge(last));
    }

    #[test]
    fn test_half_space_is_ambiguous() {
        let zero = SeqNumber::new(0);
        let half = SeqNumber::new(HALF_SEQ_SPACE as u16);
        // Both directions read as "behind" at exactly half the space
        assert_eq!(zero.distance_to(half), -32768);
        assert_eq!(half.distance_to(zero), -32768);
    }

    proptest! {
        #[test]
        fn test_steps_forward_are_after(start in any::<u16>(), steps in 1u16..0x8000) {
            let a = SeqNumber::new(start);
            let b = SeqNumber::new(start.wrapping_add(steps));

            prop_assert_eq!(a.distance_to(b), i32::from(steps));
            prop_assert_eq!(b.distance_to(a), -i32::from(steps));
            prop_assert!(a.lt(b) && b.gt(a));
            prop_assert!(!a.ge(b) && !b.le(a));
        }

        #[test]
        fn test_next_prev_inverse(value in any::<u16>()) {
            let seq = SeqNumber::new(value);
            prop_assert_eq!(seq.next().prev(), seq);
            prop_assert_eq!(seq.next().distance_to(seq), -1);
        }
    }
}
