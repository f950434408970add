//! ACK scheduling, ACK journal and RTT/rate estimation
//!
//! The receiver sends a full ACK every SYN interval (or after enough packets
//! arrived), remembers each one in the [`AckWindow`], and measures RTT when
//! the sender echoes it back in an ACKACK.

use crate::sequence::SeqNumber;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Periodic ACK interval
pub const SYN_INTERVAL: Duration = Duration::from_millis(10);

/// Packets received before an ACK is sent regardless of the timer
pub const ACK_PACKET_INTERVAL: u32 = 64;

/// Floor of the periodic NAK report interval
pub const MIN_NAK_INTERVAL: Duration = Duration::from_millis(20);

/// Journal capacity; older unanswered ACKs are forgotten
const ACK_WINDOW_SIZE: usize = 1024;

/// Samples kept by the receive-rate median filter
const RATE_WINDOW: usize = 16;

/// Every 16th packet starts a probing pair for link capacity
const PROBE_MODULO: u32 = 16;

#[derive(Debug, Clone, Copy)]
struct AckRecord {
    journal: u32,
    ack_seq: SeqNumber,
    sent_at: Instant,
}

/// Journal of sent ACKs, matched against ACKACK replies
#[derive(Debug)]
pub struct AckWindow {
    records: VecDeque<AckRecord>,
    next_journal: u32,
}

impl AckWindow {
    pub fn new() -> Self {
        AckWindow {
            records: VecDeque::with_capacity(ACK_WINDOW_SIZE),
            next_journal: 1,
        }
    }

    /// Record an outgoing ACK and return its journal number
    pub fn record(&mut self, ack_seq: SeqNumber, now: Instant) -> u32 {
        let journal = self.next_journal;
        self.next_journal = self.next_journal.wrapping_add(1).max(1);

        if self.records.len() == ACK_WINDOW_SIZE {
            self.records.pop_front();
        }
        self.records.push_back(AckRecord {
            journal,
            ack_seq,
            sent_at: now,
        });
        journal
    }

    /// Match an ACKACK; returns the acknowledged sequence and the RTT sample
    ///
    /// Older journal entries are discarded along with the matched one.
    pub fn acknowledge(&mut self, journal: u32, now: Instant) -> Option<(SeqNumber, Duration)> {
        let index = self.records.iter().position(|r| r.journal == journal)?;
        let record = self.records[index];
        self.records.drain(..=index);
        Some((record.ack_seq, now.saturating_duration_since(record.sent_at)))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for AckWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides when the receiver owes the peer an ACK
#[derive(Debug)]
pub struct AckTimer {
    next_ack: Instant,
    packets_since_ack: u32,
    /// Last acknowledged position, to skip ACKs that carry no news
    last_ack_seq: Option<SeqNumber>,
}

impl AckTimer {
    pub fn new(now: Instant) -> Self {
        AckTimer {
            next_ack: now + SYN_INTERVAL,
            packets_since_ack: 0,
            last_ack_seq: None,
        }
    }

    pub fn on_packet(&mut self) {
        self.packets_since_ack += 1;
    }

    /// Check if an ACK is due for the given acknowledgment position
    pub fn is_due(&self, ack_seq: SeqNumber, now: Instant) -> bool {
        let due = now >= self.next_ack || self.packets_since_ack >= ACK_PACKET_INTERVAL;
        due && self.last_ack_seq != Some(ack_seq)
    }

    /// Note that an ACK for `ack_seq` was sent
    pub fn sent(&mut self, ack_seq: SeqNumber, now: Instant) {
        self.next_ack = now + SYN_INTERVAL;
        self.packets_since_ack = 0;
        self.last_ack_seq = Some(ack_seq);
    }

    /// Advance the timer without sending (nothing new to acknowledge)
    pub fn skip(&mut self, now: Instant) {
        if now >= self.next_ack {
            self.next_ack = now + SYN_INTERVAL;
        }
    }

    pub fn deadline(&self) -> Instant {
        self.next_ack
    }
}

/// Periodic NAK report timer
#[derive(Debug)]
pub struct NakTimer {
    next_report: Instant,
}

impl NakTimer {
    pub fn new(now: Instant) -> Self {
        NakTimer {
            next_report: now + MIN_NAK_INTERVAL,
        }
    }

    /// Check whether a report is due; rearms the timer when it is
    pub fn poll(&mut self, now: Instant, rtt: &RttEstimator) -> bool {
        if now < self.next_report {
            return false;
        }
        self.next_report = now + rtt.rto().max(MIN_NAK_INTERVAL);
        true
    }

    pub fn deadline(&self) -> Instant {
        self.next_report
    }
}

/// RTT (Round-Trip Time) estimator
///
/// Tracks RTT measurements and calculates smoothed RTT and variance.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT (microseconds)
    srtt: u32,
    /// RTT variance (microseconds)
    rtt_var: u32,
    /// Number of samples
    sample_count: u32,
}

impl RttEstimator {
    /// Create a new RTT estimator
    pub fn new() -> Self {
        RttEstimator {
            srtt: 100_000, // Initial estimate: 100ms
            rtt_var: 50_000,
            sample_count: 0,
        }
    }

    /// Update with a new RTT sample
    pub fn update(&mut self, rtt_sample_us: u32) {
        if self.sample_count == 0 {
            self.srtt = rtt_sample_us;
            self.rtt_var = rtt_sample_us / 2;
        } else {
            let error = self.srtt.abs_diff(rtt_sample_us) as u64;
            self.rtt_var = ((3 * self.rtt_var as u64 + error) / 4) as u32;
            self.srtt = ((7 * self.srtt as u64 + rtt_sample_us as u64) / 8) as u32;
        }
        self.sample_count += 1;
    }

    /// Take over the values the peer reported in an ACK
    pub fn set(&mut self, srtt_us: u32, rtt_var_us: u32) {
        if srtt_us == 0 {
            return;
        }
        self.srtt = srtt_us;
        self.rtt_var = rtt_var_us;
        self.sample_count = self.sample_count.max(1);
    }

    /// Get smoothed RTT in microseconds
    pub fn srtt(&self) -> u32 {
        self.srtt
    }

    /// Get RTT variance in microseconds
    pub fn rtt_var(&self) -> u32 {
        self.rtt_var
    }

    pub fn has_samples(&self) -> bool {
        self.sample_count > 0
    }

    /// Get retransmission timeout (RTO)
    ///
    /// RTO = SRTT + 4 * RTT_VAR
    pub fn rto(&self) -> Duration {
        Duration::from_micros(self.srtt as u64 + 4 * self.rtt_var as u64)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Median-filtered receive speed and link capacity estimation
#[derive(Debug)]
pub struct ReceiveRateEstimator {
    last_arrival: Option<Instant>,
    /// (inter-arrival time µs, payload bytes)
    intervals: VecDeque<(u64, usize)>,
    probe_start: Option<Instant>,
    probes: VecDeque<u64>,
}

impl ReceiveRateEstimator {
    pub fn new() -> Self {
        ReceiveRateEstimator {
            last_arrival: None,
            intervals: VecDeque::with_capacity(RATE_WINDOW),
            probe_start: None,
            probes: VecDeque::with_capacity(RATE_WINDOW),
        }
    }

    /// Record the arrival of a fresh (not retransmitted) data packet
    pub fn on_arrival(&mut self, seq: SeqNumber, bytes: usize, now: Instant) {
        if let Some(last) = self.last_arrival {
            let gap = now.saturating_duration_since(last).as_micros() as u64;
            if self.intervals.len() == RATE_WINDOW {
                self.intervals.pop_front();
            }
            self.intervals.push_back((gap.max(1), bytes));
        }
        self.last_arrival = Some(now);

        match seq.as_raw() % PROBE_MODULO {
            0 => self.probe_start = Some(now),
            1 => {
                if let Some(start) = self.probe_start.take() {
                    let gap = now.saturating_duration_since(start).as_micros() as u64;
                    if self.probes.len() == RATE_WINDOW {
                        self.probes.pop_front();
                    }
                    self.probes.push_back(gap.max(1));
                }
            }
            _ => self.probe_start = None,
        }
    }

    /// Packets and bytes per second over the filtered window
    pub fn receive_rate(&self) -> (u32, u32) {
        let gaps: Vec<u64> = self.intervals.iter().map(|(gap, _)| *gap).collect();
        let Some(median) = median(&gaps) else {
            return (0, 0);
        };

        let (mut count, mut total_us, mut total_bytes) = (0u64, 0u64, 0u64);
        for (gap, bytes) in &self.intervals {
            if *gap > median / 8 && *gap < median * 8 {
                count += 1;
                total_us += gap;
                total_bytes += *bytes as u64;
            }
        }

        // Too few samples survived the filter to be meaningful
        if count <= RATE_WINDOW as u64 / 2 || total_us == 0 {
            return (0, 0);
        }
        let pps = count * 1_000_000 / total_us;
        let bps = total_bytes * 1_000_000 / total_us;
        (pps as u32, bps.min(u32::MAX as u64) as u32)
    }

    /// Estimated link capacity in packets per second
    pub fn link_capacity(&self) -> u32 {
        let gaps: Vec<u64> = self.probes.iter().copied().collect();
        let Some(median) = median(&gaps) else {
            return 0;
        };

        let kept: Vec<u64> = gaps
            .into_iter()
            .filter(|gap| *gap > median / 8 && *gap < median * 8)
            .collect();
        if kept.is_empty() {
            return 0;
        }
        let average = kept.iter().sum::<u64>() / kept.len() as u64;
        (1_000_000 / average.max(1)) as u32
    }
}

impl Default for ReceiveRateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn median(values: &[u64]) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    Some(sorted[sorted.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_window_rtt() {
        let start = Instant::now();
        let mut window = AckWindow::new();

        let first = window.record(SeqNumber::new(10), start);
        let second = window.record(SeqNumber::new(20), start + Duration::from_millis(10));
        assert_ne!(first, second);

        let (seq, rtt) = window
            .acknowledge(second, start + Duration::from_millis(35))
            .unwrap();
        assert_eq!(seq, SeqNumber::new(20));
        assert_eq!(rtt, Duration::from_millis(25));

        // Matching a later entry discards the older one
        assert!(window.acknowledge(first, start).is_none());
        assert!(window.is_empty());
    }

    #[test]
    fn test_ack_window_bounded() {
        let now = Instant::now();
        let mut window = AckWindow::new();
        for i in 0..(ACK_WINDOW_SIZE as u32 + 10) {
            window.record(SeqNumber::new(i), now);
        }
        assert_eq!(window.len(), ACK_WINDOW_SIZE);
        assert!(window.acknowledge(1, now).is_none());
    }

    #[test]
    fn test_ack_timer() {
        let now = Instant::now();
        let mut timer = AckTimer::new(now);
        let seq = SeqNumber::new(100);

        assert!(!timer.is_due(seq, now));
        assert!(timer.is_due(seq, now + SYN_INTERVAL));

        timer.sent(seq, now + SYN_INTERVAL);
        // Same position again carries nothing new
        assert!(!timer.is_due(seq, now + SYN_INTERVAL * 3));

        for _ in 0..ACK_PACKET_INTERVAL {
            timer.on_packet();
        }
        assert!(timer.is_due(SeqNumber::new(164), now + SYN_INTERVAL));
    }

    #[test]
    fn test_nak_timer_floor() {
        let now = Instant::now();
        let mut rtt = RttEstimator::new();
        rtt.set(1_000, 100);

        let mut timer = NakTimer::new(now);
        assert!(!timer.poll(now, &rtt));
        assert!(timer.poll(now + MIN_NAK_INTERVAL, &rtt));
        assert_eq!(timer.deadline(), now + MIN_NAK_INTERVAL * 2);
    }

    #[test]
    fn test_rtt_estimator() {
        let mut estimator = RttEstimator::new();

        estimator.update(100_000);
        assert_eq!(estimator.srtt(), 100_000);
        assert_eq!(estimator.rtt_var(), 50_000);

        estimator.update(20_000);
        assert_eq!(estimator.srtt(), 90_000);
        assert_eq!(estimator.rtt_var(), 57_500);

        let rto = estimator.rto();
        assert_eq!(rto, Duration::from_micros(90_000 + 4 * 57_500));
    }

    #[test]
    fn test_receive_rate_steady() {
        let start = Instant::now();
        let mut estimator = ReceiveRateEstimator::new();
        for i in 0..=RATE_WINDOW as u32 {
            let at = start + Duration::from_millis(i as u64);
            estimator.on_arrival(SeqNumber::new(i + 1), 1000, at);
        }
        let (pps, bps) = estimator.receive_rate();
        assert_eq!(pps, 1000);
        assert_eq!(bps, 1_000_000);
    }

    #[test]
    fn test_link_capacity_from_probe_pairs() {
        let start = Instant::now();
        let mut estimator = ReceiveRateEstimator::new();
        for pair in 0..4u32 {
            let base = start + Duration::from_millis(pair as u64 * 10);
            estimator.on_arrival(SeqNumber::new(pair * 16), 1000, base);
            estimator.on_arrival(
                SeqNumber::new(pair * 16 + 1),
                1000,
                base + Duration::from_micros(100),
            );
        }
        assert_eq!(estimator.link_capacity(), 10_000);
    }
}
