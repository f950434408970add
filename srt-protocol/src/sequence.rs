//! Sequence Number Handling
//!
//! Data packets are numbered with 31 bits; the top bit of the header word
//! tells data from control. Ordering is decided by the shortest distance
//! around the circle, so anything more than 2^30 ahead counts as behind.

use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use std::ops::{Add, Sub};

/// Maximum sequence number value (31-bit: 0x7FFFFFFF)
pub const MAX_SEQ_NUMBER: u32 = 0x7FFF_FFFF;

/// Largest forward distance; anything further is considered behind
const HALF_SEQ_SPACE: u32 = 0x4000_0000;

/// Sequence number with 31-bit wraparound semantics
///
/// SRT sequence numbers are 31-bit values that wrap around. The comparison
/// and arithmetic operations account for this wraparound to properly handle
/// sequence number ordering even across the wrap boundary.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SeqNumber(u32);

impl SeqNumber {
    /// Create a new sequence number
    ///
    /// # Panics
    /// Panics if value exceeds MAX_SEQ_NUMBER
    pub fn new(value: u32) -> Self {
        assert!(
            value <= MAX_SEQ_NUMBER,
            "Sequence number {} exceeds maximum {}",
            value,
            MAX_SEQ_NUMBER
        );
        SeqNumber(value)
    }

    /// Create a sequence number from any `u32`
    ///
    /// The value will be masked to 31 bits
    #[inline]
    pub fn new_unchecked(value: u32) -> Self {
        SeqNumber(value & MAX_SEQ_NUMBER)
    }

    /// Random initial sequence number
    pub fn random() -> Self {
        let mut bytes = [0u8; 4];
        if SystemRandom::new().fill(&mut bytes).is_err() {
            tracing::warn!("no randomness for the initial sequence number");
        }
        SeqNumber::new_unchecked(u32::from_be_bytes(bytes))
    }

    /// Get the raw sequence number value
    #[inline]
    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// Get the next sequence number
    #[inline]
    pub fn next(self) -> Self {
        SeqNumber((self.0 + 1) & MAX_SEQ_NUMBER)
    }

    /// Calculate the distance from this sequence number to another
    ///
    /// Returns a signed distance that accounts for wraparound. Positive values
    /// mean `other` is ahead of `self`, negative means `other` is behind.
    /// The result always lies in `-2^30..2^30`.
    pub fn distance_to(self, other: SeqNumber) -> i32 {
        let diff = other.0.wrapping_sub(self.0) & MAX_SEQ_NUMBER;
        if diff > HALF_SEQ_SPACE {
            diff as i32 - (MAX_SEQ_NUMBER as i32) - 1
        } else {
            diff as i32
        }
    }

    /// Number of sequence numbers in the inclusive range `self..=last`
    #[inline]
    pub fn range_len(self, last: SeqNumber) -> u32 {
        (last.0.wrapping_sub(self.0) & MAX_SEQ_NUMBER) + 1
    }

    /// The later of two sequence numbers
    #[inline]
    pub fn max(self, other: SeqNumber) -> SeqNumber {
        if self.lt(other) {
            other
        } else {
            self
        }
    }

    /// The earlier of two sequence numbers
    #[inline]
    pub fn min(self, other: SeqNumber) -> SeqNumber {
        if other.lt(self) {
            other
        } else {
            self
        }
    }

    /// Check if this sequence number is less than another (accounting for wraparound)
    #[inline]
    pub fn lt(self, other: SeqNumber) -> bool {
        self.distance_to(other) > 0
    }

    /// Check if this sequence number is less than or equal to another
    #[inline]
    pub fn le(self, other: SeqNumber) -> bool {
        self == other || self.lt(other)
    }

    /// Check if this sequence number is greater than another
    #[inline]
    pub fn gt(self, other: SeqNumber) -> bool {
        self.distance_to(other) < 0
    }

    /// Check if this sequence number is greater than or equal to another
    #[inline]
    pub fn ge(self, other: SeqNumber) -> bool {
        self == other || self.gt(other)
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

impl Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        SeqNumber::new_unchecked(self.0.wrapping_add(rhs))
    }
}

impl Sub<u32> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u32) -> SeqNumber {
        SeqNumber::new_unchecked(self.0.wrapping_sub(rhs))
    }
}

impl Sub for SeqNumber {
    type Output = i32;

    /// Calculate the signed distance between two sequence numbers
    fn sub(self, rhs: SeqNumber) -> i32 {
        rhs.distance_to(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn test_new_rejects_32_bit_values() {
        SeqNumber::new(MAX_SEQ_NUMBER + 1);
    }

    #[test]
    fn test_unchecked_masks_top_bit() {
        assert_eq!(SeqNumber::new_unchecked(MAX_SEQ_NUMBER + 100).as_raw(), 99);
    }

    #[test]
    fn test_next_wraps_to_zero() {
        assert_eq!(SeqNumber::new(41).next().as_raw(), 42);
        assert_eq!(SeqNumber::new(MAX_SEQ_NUMBER).next().as_raw(), 0);
    }

    #[test]
    fn test_ordering_across_wrap() {
        let old = SeqNumber::new(MAX_SEQ_NUMBER - 10);
        let new = SeqNumber::new(10);
        assert_eq!(old.distance_to(new), 21);
        assert_eq!(new.distance_to(old), -21);
        assert!(old.lt(new) && old.le(new));
        assert!(new.gt(old) && new.ge(old));
        assert!(old.le(old) && old.ge(old));
        assert_eq!(new - old, 21);
    }

    #[test]
    fn test_arithmetic_wraps() {
        assert_eq!((SeqNumber::new(MAX_SEQ_NUMBER - 10) + 20).as_raw(), 9);
        assert_eq!((SeqNumber::new(10) - 20).as_raw(), MAX_SEQ_NUMBER - 9);
    }

    #[test]
    fn test_distance_half_space() {
        let a = SeqNumber::new(0);
        assert_eq!(a.distance_to(SeqNumber::new(0x4000_0000)), 0x4000_0000);
        assert_eq!(a.distance_to(SeqNumber::new(0x4000_0001)), -0x3FFF_FFFF);
    }

    #[test]
    fn test_range_len() {
        assert_eq!(SeqNumber::new(5).range_len(SeqNumber::new(5)), 1);
        assert_eq!(SeqNumber::new(MAX_SEQ_NUMBER).range_len(SeqNumber::new(1)), 3);
    }

    #[test]
    fn test_min_max_across_wrap() {
        let a = SeqNumber::new(MAX_SEQ_NUMBER - 1);
        let b = SeqNumber::new(3);
        assert_eq!(a.max(b), b);
        assert_eq!(b.min(a), a);
    }

    #[test]
    fn test_random_is_31_bit() {
        for _ in 0..32 {
            assert!(SeqNumber::random().as_raw() <= MAX_SEQ_NUMBER);
        }
    }
}
