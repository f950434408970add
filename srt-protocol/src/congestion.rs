//! Congestion Control for SRT
//!
//! A small capability interface ([`CongestionControl`]) consumed by the
//! connection engine, with two built-in strategies selected at connection
//! setup through [`CongestionKind`]:
//!
//! * [`LiveCongestion`] paces at the configured bandwidth ceiling and never
//!   backs off on loss, relying on the latency budget instead.
//! * [`FileCongestion`] is rate-based AIMD with slow start.

use crate::loss::LossRange;
use crate::packet::HEADER_SIZE;
use crate::sequence::SeqNumber;
use std::fmt;
use std::time::{Duration, Instant};

/// Initial congestion window (packets)
const INITIAL_CWND: f64 = 16.0;

/// SYN interval in microseconds, the rate-control period
const SYN_US: f64 = 10_000.0;

/// Smallest rate increase step (packets per SYN)
const MIN_RATE_INCREASE: f64 = 0.01;

/// Rate decrease factor applied once per congestion epoch
const RATE_DECREASE: f64 = 0.875;

/// Built-in congestion strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CongestionKind {
    #[default]
    Live,
    File,
}

impl CongestionKind {
    pub fn name(self) -> &'static str {
        match self {
            CongestionKind::Live => "live",
            CongestionKind::File => "file",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "live" => Some(CongestionKind::Live),
            "file" => Some(CongestionKind::File),
            _ => None,
        }
    }

    /// Instantiate the strategy
    pub fn build(self, mss: usize, flow_window: u32) -> Box<dyn CongestionControl> {
        match self {
            CongestionKind::Live => Box::new(LiveCongestion::new(flow_window)),
            CongestionKind::File => Box::new(FileCongestion::new(mss, flow_window)),
        }
    }
}

impl fmt::Display for CongestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the engine learned from an incoming ACK
#[derive(Debug, Clone, Copy)]
pub struct AckEvent {
    /// Packets newly acknowledged by this ACK
    pub acked: u32,
    /// Smoothed RTT in microseconds
    pub rtt_us: u32,
    /// Peer receive rate (packets per second)
    pub receive_rate: u32,
    /// Peer-estimated link capacity (packets per second)
    pub link_capacity: u32,
}

/// Congestion control capability interface
pub trait CongestionControl: Send + fmt::Debug {
    fn kind(&self) -> CongestionKind;

    /// A data packet with `payload_len` bytes went out for the first time
    fn on_packet_sent(&mut self, seq: SeqNumber, payload_len: usize);

    fn on_ack(&mut self, ack: &AckEvent, now: Instant);

    fn on_loss(&mut self, ranges: &[LossRange], now: Instant);

    /// Retransmission timer expired without any feedback
    fn on_timeout(&mut self, now: Instant);

    /// Set the bandwidth ceiling in bytes per second, `None` for unlimited
    fn set_max_bandwidth(&mut self, bytes_per_sec: Option<u64>);

    /// Minimum gap between two data packets
    fn send_interval(&self) -> Duration;

    /// Congestion window in packets
    fn window(&self) -> u32;
}

/// Interval between packets of `packet_size` bytes at `bytes_per_sec`
pub fn interval_for_rate(packet_size: usize, bytes_per_sec: Option<u64>) -> Duration {
    match bytes_per_sec {
        Some(rate) if rate > 0 => {
            Duration::from_micros((packet_size as u64 * 1_000_000) / rate)
        }
        Some(_) => Duration::from_secs(1),
        None => Duration::ZERO,
    }
}

/// Live streaming strategy
#[derive(Debug, Clone)]
pub struct LiveCongestion {
    flow_window: u32,
    max_bandwidth: Option<u64>,
    /// Smoothed payload size (bytes)
    avg_payload: f64,
}

impl LiveCongestion {
    pub fn new(flow_window: u32) -> Self {
        LiveCongestion {
            flow_window,
            max_bandwidth: None,
            avg_payload: 1316.0,
        }
    }
}

impl CongestionControl for LiveCongestion {
    fn kind(&self) -> CongestionKind {
        CongestionKind::Live
    }

    fn on_packet_sent(&mut self, _seq: SeqNumber, payload_len: usize) {
        self.avg_payload = (self.avg_payload * 7.0 + payload_len as f64) / 8.0;
    }

    fn on_ack(&mut self, _ack: &AckEvent, _now: Instant) {}

    fn on_loss(&mut self, _ranges: &[LossRange], _now: Instant) {}

    fn on_timeout(&mut self, _now: Instant) {}

    fn set_max_bandwidth(&mut self, bytes_per_sec: Option<u64>) {
        self.max_bandwidth = bytes_per_sec;
    }

    fn send_interval(&self) -> Duration {
        interval_for_rate(self.avg_payload as usize + HEADER_SIZE, self.max_bandwidth)
    }

    fn window(&self) -> u32 {
        self.flow_window
    }
}

/// File transfer strategy: slow start, then AIMD on the sending period
#[derive(Debug, Clone)]
pub struct FileCongestion {
    mss: usize,
    flow_window: u32,
    max_bandwidth: Option<u64>,
    /// Congestion window (packets)
    cwnd: f64,
    /// Sending period (microseconds per packet)
    period_us: f64,
    slow_start: bool,
    /// Period in force when the last decrease happened
    last_decrease_period: f64,
    /// Highest sequence sent when the current congestion epoch began
    epoch_end: Option<SeqNumber>,
    last_sent: Option<SeqNumber>,
    last_rate_increase: Option<Instant>,
    receive_rate: u32,
    rtt_us: u32,
}

impl FileCongestion {
    pub fn new(mss: usize, flow_window: u32) -> Self {
        FileCongestion {
            mss,
            flow_window,
            max_bandwidth: None,
            cwnd: INITIAL_CWND,
            period_us: 1.0,
            slow_start: true,
            last_decrease_period: 1.0,
            epoch_end: None,
            last_sent: None,
            last_rate_increase: None,
            receive_rate: 0,
            rtt_us: 100_000,
        }
    }

    pub fn in_slow_start(&self) -> bool {
        self.slow_start
    }

    fn leave_slow_start(&mut self) {
        self.slow_start = false;
        self.period_us = if self.receive_rate > 0 {
            1_000_000.0 / self.receive_rate as f64
        } else {
            (self.rtt_us as f64 + SYN_US) / self.cwnd
        };
    }

    fn apply_ceiling(&mut self) {
        if let Some(rate) = self.max_bandwidth.filter(|r| *r > 0) {
            let min_period = (self.mss as f64 * 1_000_000.0) / rate as f64;
            self.period_us = self.period_us.max(min_period);
        }
    }
}

impl CongestionControl for FileCongestion {
    fn kind(&self) -> CongestionKind {
        CongestionKind::File
    }

    fn on_packet_sent(&mut self, seq: SeqNumber, _payload_len: usize) {
        self.last_sent = Some(self.last_sent.map_or(seq, |last| last.max(seq)));
    }

    fn on_ack(&mut self, ack: &AckEvent, now: Instant) {
        self.rtt_us = ack.rtt_us.max(1);
        if ack.receive_rate > 0 {
            self.receive_rate = ack.receive_rate;
        }

        // Rate control runs at most once per SYN interval
        if let Some(last) = self.last_rate_increase {
            if now.saturating_duration_since(last) < Duration::from_micros(SYN_US as u64) {
                return;
            }
        }
        self.last_rate_increase = Some(now);

        if self.slow_start {
            self.cwnd += ack.acked as f64;
            if self.cwnd > self.flow_window as f64 {
                self.leave_slow_start();
            }
        } else {
            self.cwnd = self.receive_rate as f64 / 1_000_000.0 * (self.rtt_us as f64 + SYN_US)
                + INITIAL_CWND;
        }

        if !self.slow_start {
            let capacity = ack.link_capacity as f64;
            let current = 1_000_000.0 / self.period_us;
            let mut spare = capacity - current;
            if self.period_us > self.last_decrease_period && capacity / 9.0 < spare {
                spare = capacity / 9.0;
            }

            let increase = if spare <= 0.0 {
                MIN_RATE_INCREASE
            } else {
                let bits = spare * self.mss as f64 * 8.0;
                let step = 10f64.powf(bits.log10().ceil()) * 0.000_001_5 / self.mss as f64;
                step.max(MIN_RATE_INCREASE)
            };
            self.period_us = (self.period_us * SYN_US) / (self.period_us * increase + SYN_US);
        }

        self.apply_ceiling();
    }

    fn on_loss(&mut self, ranges: &[LossRange], _now: Instant) {
        let Some(first) = ranges.first().map(|r| r.start) else {
            return;
        };

        if self.slow_start {
            self.leave_slow_start();
        }

        // One decrease per congestion epoch
        if let Some(end) = self.epoch_end {
            if first.le(end) {
                return;
            }
        }

        self.last_decrease_period = self.period_us;
        self.period_us /= RATE_DECREASE;
        self.cwnd = (self.cwnd / 2.0).max(2.0);
        self.epoch_end = self.last_sent;
        self.apply_ceiling();
    }

    fn on_timeout(&mut self, _now: Instant) {
        self.slow_start = true;
        self.cwnd = INITIAL_CWND;
        self.period_us = 1.0;
        self.epoch_end = self.last_sent;
        self.apply_ceiling();
    }

    fn set_max_bandwidth(&mut self, bytes_per_sec: Option<u64>) {
        self.max_bandwidth = bytes_per_sec;
        self.apply_ceiling();
    }

    fn send_interval(&self) -> Duration {
        Duration::from_nanos((self.period_us * 1000.0) as u64)
    }

    fn window(&self) -> u32 {
        (self.cwnd as u32).clamp(2, self.flow_window.max(2))
    }
}

/// Bandwidth ceiling configuration
///
/// `max_bw`: positive for a fixed ceiling, `0` for a ceiling relative to the
/// input rate, `-1` for unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthLimit {
    pub max_bw: i64,
    pub input_bw: i64,
    /// Overhead over the input rate, in percent
    pub overhead_pct: u32,
}

impl BandwidthLimit {
    /// Effective ceiling in bytes per second, `None` when unlimited
    pub fn ceiling(&self, estimated_input_bps: u64) -> Option<u64> {
        let with_overhead = |rate: u64| rate * (100 + self.overhead_pct as u64) / 100;
        match self.max_bw {
            bw if bw > 0 => Some(bw as u64),
            0 if self.input_bw > 0 => Some(with_overhead(self.input_bw as u64)),
            0 if estimated_input_bps > 0 => Some(with_overhead(estimated_input_bps)),
            _ => None,
        }
    }
}

impl Default for BandwidthLimit {
    fn default() -> Self {
        BandwidthLimit {
            max_bw: -1,
            input_bw: 0,
            overhead_pct: 25,
        }
    }
}

/// Sender input rate estimator
///
/// Estimates how fast the application hands data to the socket, sampled over
/// fixed periods.
#[derive(Debug)]
pub struct InputRateEstimator {
    period_start: Option<Instant>,
    period_bytes: u64,
    period: Duration,
    /// Estimated rate (bytes per second)
    estimated_bps: u64,
}

impl InputRateEstimator {
    /// Create a new estimator sampling over `period`
    pub fn new(period: Duration) -> Self {
        InputRateEstimator {
            period_start: None,
            period_bytes: 0,
            period,
            estimated_bps: 0,
        }
    }

    /// Record `bytes` handed to the send buffer
    pub fn add_sample(&mut self, bytes: usize, now: Instant) {
        let start = *self.period_start.get_or_insert(now);
        self.period_bytes += (bytes + HEADER_SIZE) as u64;

        let elapsed = now.saturating_duration_since(start);
        if elapsed >= self.period {
            let micros = elapsed.as_micros().max(1) as u64;
            self.estimated_bps = self.period_bytes * 1_000_000 / micros;
            self.period_start = Some(now);
            self.period_bytes = 0;
        }
    }

    /// Get estimated bandwidth
    pub fn estimated_bandwidth_bps(&self) -> u64 {
        self.estimated_bps
    }
}

impl Default for InputRateEstimator {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(acked: u32) -> AckEvent {
        AckEvent {
            acked,
            rtt_us: 50_000,
            receive_rate: 1000,
            link_capacity: 10_000,
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(CongestionKind::from_name("live"), Some(CongestionKind::Live));
        assert_eq!(CongestionKind::from_name("file"), Some(CongestionKind::File));
        assert_eq!(CongestionKind::from_name("vegas"), None);
        assert_eq!(CongestionKind::File.build(1500, 8192).kind(), CongestionKind::File);
    }

    #[test]
    fn test_live_ignores_loss() {
        let mut cc = LiveCongestion::new(8192);
        cc.set_max_bandwidth(Some(1_000_000));
        let before = cc.send_interval();

        cc.on_loss(&[LossRange::single(SeqNumber::new(5))], Instant::now());
        cc.on_timeout(Instant::now());

        assert_eq!(cc.send_interval(), before);
        assert_eq!(cc.window(), 8192);
    }

    #[test]
    fn test_live_pacing_follows_ceiling() {
        let mut cc = LiveCongestion::new(8192);
        assert_eq!(cc.send_interval(), Duration::ZERO);

        // 1316 payload + 16 header at 1.332 MB/s is one packet per ms
        cc.set_max_bandwidth(Some(1_332_000));
        assert_eq!(cc.send_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_file_slow_start_grows_window() {
        let now = Instant::now();
        let mut cc = FileCongestion::new(1500, 8192);
        assert_eq!(cc.window(), 16);

        cc.on_ack(&ack(10), now);
        assert_eq!(cc.window(), 26);
        assert!(cc.in_slow_start());
    }

    #[test]
    fn test_file_loss_decreases_once_per_epoch() {
        let now = Instant::now();
        let mut cc = FileCongestion::new(1500, 8192);
        for i in 0..100 {
            cc.on_packet_sent(SeqNumber::new(i), 1456);
        }
        cc.on_ack(&ack(50), now);

        cc.on_loss(&[LossRange::single(SeqNumber::new(60))], now);
        assert!(!cc.in_slow_start());
        let after_first = cc.send_interval();
        let window = cc.window();

        // Same epoch: no further decrease
        cc.on_loss(&[LossRange::single(SeqNumber::new(70))], now);
        assert_eq!(cc.send_interval(), after_first);
        assert_eq!(cc.window(), window);

        // New epoch
        cc.on_packet_sent(SeqNumber::new(150), 1456);
        cc.on_loss(&[LossRange::single(SeqNumber::new(120))], now);
        assert!(cc.send_interval() > after_first);
    }

    #[test]
    fn test_file_timeout_resets() {
        let now = Instant::now();
        let mut cc = FileCongestion::new(1500, 8192);
        cc.on_packet_sent(SeqNumber::new(1), 1456);
        cc.on_loss(&[LossRange::single(SeqNumber::new(1))], now);
        cc.on_timeout(now);
        assert!(cc.in_slow_start());
        assert_eq!(cc.window(), 16);
    }

    #[test]
    fn test_file_respects_ceiling() {
        let mut cc = FileCongestion::new(1500, 8192);
        cc.set_max_bandwidth(Some(1_500_000));
        assert_eq!(cc.send_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_bandwidth_limit_modes() {
        let fixed = BandwidthLimit {
            max_bw: 5_000_000,
            ..Default::default()
        };
        assert_eq!(fixed.ceiling(0), Some(5_000_000));

        let relative = BandwidthLimit {
            max_bw: 0,
            input_bw: 1_000_000,
            overhead_pct: 25,
        };
        assert_eq!(relative.ceiling(0), Some(1_250_000));

        let estimated = BandwidthLimit {
            max_bw: 0,
            input_bw: 0,
            overhead_pct: 50,
        };
        assert_eq!(estimated.ceiling(2_000), Some(3_000));

        assert_eq!(BandwidthLimit::default().ceiling(1_000_000), None);
    }

    #[test]
    fn test_input_rate_estimator() {
        let start = Instant::now();
        let mut estimator = InputRateEstimator::new(Duration::from_millis(100));

        for i in 0..=10 {
            estimator.add_sample(984, start + Duration::from_millis(i * 10));
        }
        // 11 samples of 1000 bytes over 100 ms
        assert_eq!(estimator.estimated_bandwidth_bps(), 110_000);
    }
}
