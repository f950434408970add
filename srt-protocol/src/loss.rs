//! Loss list tracking for SRT
//!
//! Tracks lost packets for NAK (Negative Acknowledgment) generation and
//! retransmission scheduling.
//!
//! Entries leave a loss list only when the packet is received (or
//! acknowledged, on the sender side) or when it is declared permanently lost
//! by a drop decision. Sending a NAK never removes anything.

use crate::sequence::SeqNumber;

/// Loss sequence range (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossRange {
    /// First sequence number in range
    pub start: SeqNumber,
    /// Last sequence number in range (inclusive)
    pub end: SeqNumber,
}

impl LossRange {
    /// Create a new loss range
    pub fn new(start: SeqNumber, end: SeqNumber) -> Self {
        LossRange { start, end }
    }

    /// Create a single-packet loss range
    pub fn single(seq: SeqNumber) -> Self {
        LossRange { start: seq, end: seq }
    }

    /// Check if this range contains a sequence number
    pub fn contains(&self, seq: SeqNumber) -> bool {
        seq.ge(self.start) && seq.le(self.end)
    }

    /// Get the length of this range
    pub fn len(&self) -> usize {
        self.start.range_len(self.end) as usize
    }

    /// Check if this is a single packet
    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    /// Merge with another range if they overlap or are adjacent
    pub fn try_merge(&self, other: &LossRange) -> Option<LossRange> {
        if other.start.le(self.end.next()) && other.end.ge(self.start - 1) {
            Some(LossRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }

    /// Iterate over every sequence number in the range
    pub fn iter(&self) -> impl Iterator<Item = SeqNumber> {
        let start = self.start;
        (0..self.len() as u32).map(move |offset| start + offset)
    }
}

/// Ordered, non-overlapping set of lost sequence ranges
#[derive(Debug, Clone, Default)]
pub struct LossList {
    ranges: Vec<LossRange>,
}

impl LossList {
    /// Create a new loss list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a lost packet
    pub fn add(&mut self, seq: SeqNumber) {
        self.add_range(LossRange::single(seq));
    }

    /// Add a range of lost packets, merging with neighbours
    pub fn add_range(&mut self, range: LossRange) {
        let mut merged = range;
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;

        for existing in self.ranges.drain(..) {
            if let Some(m) = merged.try_merge(&existing) {
                merged = m;
            } else if existing.start.lt(merged.start) {
                result.push(existing);
            } else {
                if !placed {
                    result.push(merged);
                    placed = true;
                }
                result.push(existing);
            }
        }

        if !placed {
            result.push(merged);
        }
        self.ranges = result;
    }

    /// Remove a sequence number; returns whether it was present
    pub fn remove(&mut self, seq: SeqNumber) -> bool {
        let Some(index) = self.ranges.iter().position(|r| r.contains(seq)) else {
            return false;
        };

        let range = self.ranges[index];
        if range.is_single() {
            self.ranges.remove(index);
        } else if seq == range.start {
            self.ranges[index].start = seq.next();
        } else if seq == range.end {
            self.ranges[index].end = seq - 1;
        } else {
            self.ranges[index].end = seq - 1;
            self.ranges
                .insert(index + 1, LossRange::new(seq.next(), range.end));
        }
        true
    }

    /// Remove all losses up to and including a sequence number
    ///
    /// Returns the number of sequence numbers removed.
    pub fn remove_up_to(&mut self, seq: SeqNumber) -> usize {
        let before = self.len();
        self.ranges.retain(|r| r.end.gt(seq));
        if let Some(first) = self.ranges.first_mut() {
            if first.start.le(seq) {
                first.start = seq.next();
            }
        }
        before - self.len()
    }

    /// Earliest lost sequence number
    pub fn first(&self) -> Option<SeqNumber> {
        self.ranges.first().map(|r| r.start)
    }

    /// Remove and return the earliest lost sequence number
    pub fn pop_first(&mut self) -> Option<SeqNumber> {
        let seq = self.first()?;
        self.remove(seq);
        Some(seq)
    }

    /// Get all loss ranges
    pub fn ranges(&self) -> &[LossRange] {
        &self.ranges
    }

    /// Get total number of lost packets
    pub fn len(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    /// Check if the loss list is empty
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Clear all losses
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Check if a sequence number is in the loss list
    pub fn contains(&self, seq: SeqNumber) -> bool {
        self.ranges.iter().any(|r| r.contains(seq))
    }
}

/// Sender loss list
///
/// Tracks packets that need to be retransmitted based on receiver NAKs.
#[derive(Debug, Default)]
pub struct SenderLossList {
    inner: LossList,
}

impl SenderLossList {
    /// Create a new sender loss list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a range of lost packets from NAK
    pub fn add_range(&mut self, range: LossRange) {
        self.inner.add_range(range);
    }

    /// Forget everything the peer acknowledged (everything before `ack`)
    pub fn acknowledge(&mut self, ack: SeqNumber) {
        self.inner.remove_up_to(ack - 1);
    }

    /// Drop a range the sender gave up on
    pub fn drop_range(&mut self, range: LossRange) {
        for seq in range.iter() {
            self.inner.remove(seq);
        }
    }

    /// Get next packet to retransmit
    pub fn pop_next(&mut self) -> Option<SeqNumber> {
        self.inner.pop_first()
    }

    pub fn ranges(&self) -> &[LossRange] {
        self.inner.ranges()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Get count of packets to retransmit
    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Gap waiting for reordered packets before it is reported
#[derive(Debug, Clone, Copy)]
struct FreshLoss {
    range: LossRange,
    /// Later arrivals still tolerated before the gap counts as lost
    ttl: u32,
}

/// Receiver loss list
///
/// Tracks detected packet losses for NAK generation. With a non-zero
/// reorder tolerance a new gap is held back until that many later packets
/// arrived; a late arrival inside the gap cancels it silently.
#[derive(Debug, Default)]
pub struct ReceiverLossList {
    reported: LossList,
    fresh: Vec<FreshLoss>,
    reorder_tolerance: u32,
}

impl ReceiverLossList {
    /// Create a new receiver loss list
    ///
    /// # Arguments
    /// * `reorder_tolerance` - later packets tolerated before a gap is reported
    pub fn new(reorder_tolerance: u32) -> Self {
        ReceiverLossList {
            reported: LossList::new(),
            fresh: Vec::new(),
            reorder_tolerance,
        }
    }

    pub fn set_reorder_tolerance(&mut self, tolerance: u32) {
        self.reorder_tolerance = tolerance;
    }

    /// Register a gap; returns the range to NAK right away, if any
    pub fn on_gap(&mut self, range: LossRange) -> Option<LossRange> {
        if self.reorder_tolerance == 0 {
            self.reported.add_range(range);
            Some(range)
        } else {
            self.fresh.push(FreshLoss {
                range,
                ttl: self.reorder_tolerance,
            });
            None
        }
    }

    /// A packet arrived out of a gap; returns whether it was missing
    pub fn on_recovered(&mut self, seq: SeqNumber) -> bool {
        if self.reported.remove(seq) {
            return true;
        }

        let Some(index) = self.fresh.iter().position(|f| f.range.contains(seq)) else {
            return false;
        };

        let fresh = self.fresh[index];
        let mut split = LossList::new();
        split.add_range(fresh.range);
        split.remove(seq);
        self.fresh.remove(index);
        for (offset, range) in split.ranges().iter().enumerate() {
            self.fresh.insert(
                index + offset,
                FreshLoss {
                    range: *range,
                    ttl: fresh.ttl,
                },
            );
        }
        true
    }

    /// A packet beyond every known gap arrived
    ///
    /// Ages the held-back gaps and returns those whose tolerance ran out;
    /// they are now reported losses and should be NAKed.
    pub fn on_later_arrival(&mut self) -> Vec<LossRange> {
        let mut expired = Vec::new();
        self.fresh.retain_mut(|f| {
            f.ttl = f.ttl.saturating_sub(1);
            if f.ttl == 0 {
                expired.push(f.range);
                false
            } else {
                true
            }
        });

        for range in &expired {
            self.reported.add_range(*range);
        }
        expired
    }

    /// Declare everything up to and including `seq` permanently lost
    ///
    /// Returns how many listed sequence numbers were removed.
    pub fn declare_lost_up_to(&mut self, seq: SeqNumber) -> usize {
        let mut removed = self.reported.remove_up_to(seq);

        let mut kept = Vec::with_capacity(self.fresh.len());
        for mut f in self.fresh.drain(..) {
            if f.range.end.le(seq) {
                removed += f.range.len();
            } else {
                if f.range.start.le(seq) {
                    removed += f.range.start.range_len(seq) as usize;
                    f.range.start = seq.next();
                }
                kept.push(f);
            }
        }
        self.fresh = kept;
        removed
    }

    /// Reported losses, for the periodic NAK report
    pub fn ranges(&self) -> &[LossRange] {
        self.reported.ranges()
    }

    /// Earliest missing packet, reported or held back
    pub fn first(&self) -> Option<SeqNumber> {
        let fresh = self.fresh.iter().map(|f| f.range.start).reduce(SeqNumber::min);
        match (self.reported.first(), fresh) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn contains(&self, seq: SeqNumber) -> bool {
        self.reported.contains(seq) || self.fresh.iter().any(|f| f.range.contains(seq))
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.reported.is_empty() && self.fresh.is_empty()
    }

    /// Get count of lost packets
    pub fn len(&self) -> usize {
        self.reported.len() + self.fresh.iter().map(|f| f.range.len()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::MAX_SEQ_NUMBER;

    fn range(a: u32, b: u32) -> LossRange {
        LossRange::new(SeqNumber::new(a), SeqNumber::new(b))
    }

    #[test]
    fn test_loss_range_merge() {
        let r1 = range(10, 15);
        let r2 = range(16, 20);

        // Adjacent ranges should merge
        let merged = r1.try_merge(&r2).unwrap();
        assert_eq!(merged, range(10, 20));
    }

    #[test]
    fn test_loss_range_no_merge() {
        // Non-adjacent ranges should not merge
        assert!(range(10, 15).try_merge(&range(20, 25)).is_none());
    }

    #[test]
    fn test_loss_range_across_wrap() {
        let r = range(MAX_SEQ_NUMBER - 1, 1);
        assert_eq!(r.len(), 4);
        assert!(r.contains(SeqNumber::new(0)));
        assert_eq!(r.iter().last(), Some(SeqNumber::new(1)));
    }

    #[test]
    fn test_loss_list_add_remove() {
        let mut list = LossList::new();

        list.add(SeqNumber::new(10));
        list.add(SeqNumber::new(11));
        list.add(SeqNumber::new(12));
        assert_eq!(list.len(), 3);

        assert!(list.remove(SeqNumber::new(11)));
        assert!(!list.remove(SeqNumber::new(11)));
        assert_eq!(list.len(), 2);

        // Should have split into two ranges
        assert_eq!(list.ranges(), &[range(10, 10), range(12, 12)]);
    }

    #[test]
    fn test_loss_list_merge() {
        let mut list = LossList::new();

        list.add(SeqNumber::new(10));
        list.add(SeqNumber::new(12));
        list.add(SeqNumber::new(11)); // Should merge all three

        assert_eq!(list.ranges(), &[range(10, 12)]);
    }

    #[test]
    fn test_loss_list_keeps_order() {
        let mut list = LossList::new();
        list.add_range(range(30, 31));
        list.add_range(range(10, 11));
        list.add_range(range(20, 20));
        assert_eq!(list.ranges(), &[range(10, 11), range(20, 20), range(30, 31)]);
    }

    #[test]
    fn test_remove_up_to_trims() {
        let mut list = LossList::new();
        list.add_range(range(5, 9));
        list.add_range(range(20, 22));
        assert_eq!(list.remove_up_to(SeqNumber::new(7)), 3);
        assert_eq!(list.ranges(), &[range(8, 9), range(20, 22)]);
    }

    #[test]
    fn test_sender_loss_list() {
        let mut list = SenderLossList::new();

        list.add_range(range(5, 5));
        list.add_range(range(7, 7));
        list.add_range(range(6, 6));
        assert_eq!(list.len(), 3);

        assert_eq!(list.pop_next(), Some(SeqNumber::new(5)));
        assert_eq!(list.len(), 2);

        list.acknowledge(SeqNumber::new(7));
        assert_eq!(list.ranges(), &[range(7, 7)]);
    }

    #[test]
    fn test_receiver_immediate_report() {
        let mut list = ReceiverLossList::new(0);
        assert_eq!(list.on_gap(range(10, 11)), Some(range(10, 11)));
        assert_eq!(list.ranges(), &[range(10, 11)]);

        assert!(list.on_recovered(SeqNumber::new(10)));
        assert_eq!(list.ranges(), &[range(11, 11)]);
        assert_eq!(list.first(), Some(SeqNumber::new(11)));
    }

    #[test]
    fn test_receiver_reorder_tolerance() {
        let mut list = ReceiverLossList::new(2);
        assert_eq!(list.on_gap(range(10, 10)), None);
        assert!(list.ranges().is_empty());
        assert_eq!(list.first(), Some(SeqNumber::new(10)));

        assert!(list.on_later_arrival().is_empty());
        assert_eq!(list.on_later_arrival(), vec![range(10, 10)]);
        assert_eq!(list.ranges(), &[range(10, 10)]);
    }

    #[test]
    fn test_receiver_reordered_packet_cancels_fresh_loss() {
        let mut list = ReceiverLossList::new(3);
        list.on_gap(range(10, 12));
        assert!(list.on_recovered(SeqNumber::new(11)));
        assert_eq!(list.len(), 2);

        for _ in 0..3 {
            list.on_later_arrival();
        }
        assert_eq!(list.ranges(), &[range(10, 10), range(12, 12)]);
    }

    #[test]
    fn test_receiver_declare_lost() {
        let mut list = ReceiverLossList::new(0);
        list.on_gap(range(3, 3));
        list.on_gap(range(7, 7));
        assert_eq!(list.declare_lost_up_to(SeqNumber::new(3)), 1);
        assert_eq!(list.ranges(), &[range(7, 7)]);
        assert!(!list.contains(SeqNumber::new(3)));
    }
}
