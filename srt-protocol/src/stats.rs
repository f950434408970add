//! Connection statistics
//!
//! [`TraceStats`] is the detailed snapshot returned by `bstats`: totals since
//! the connection started, the same counters for the current interval, and
//! instantaneous values sampled when the snapshot is taken.

use std::time::{Duration, Instant};

/// Event counters, kept once for the whole connection and once per interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub pkt_sent: u64,
    pub pkt_sent_unique: u64,
    pub pkt_recv: u64,
    pub pkt_recv_unique: u64,
    pub pkt_snd_loss: u64,
    pub pkt_rcv_loss: u64,
    pub pkt_retrans: u64,
    pub pkt_rcv_retrans: u64,
    pub pkt_sent_ack: u64,
    pub pkt_recv_ack: u64,
    pub pkt_sent_nak: u64,
    pub pkt_recv_nak: u64,
    pub pkt_snd_drop: u64,
    pub pkt_rcv_drop: u64,
    pub pkt_rcv_undecrypt: u64,
    pub pkt_rcv_belated: u64,
    pub byte_sent: u64,
    pub byte_sent_unique: u64,
    pub byte_recv: u64,
    pub byte_recv_unique: u64,
    pub byte_rcv_loss: u64,
    pub byte_retrans: u64,
    pub byte_snd_drop: u64,
    pub byte_rcv_drop: u64,
    pub byte_rcv_undecrypt: u64,
    pub byte_rcv_belated: u64,
}

/// Values sampled at snapshot time
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Instantaneous {
    /// Inter-packet send period (µs)
    pub us_pkt_snd_period: f64,
    pub pkt_flow_window: u32,
    pub pkt_congestion_window: u32,
    pub pkt_flight_size: u32,
    pub ms_rtt: f64,
    /// Estimated link bandwidth (Mb/s)
    pub mbps_bandwidth: f64,
    pub byte_avail_snd_buf: u64,
    pub byte_avail_rcv_buf: u64,
    /// Bandwidth ceiling (Mb/s), 0 when unlimited
    pub mbps_max_bw: f64,
    pub byte_mss: u32,
    pub pkt_snd_buf: u32,
    pub byte_snd_buf: u64,
    pub ms_snd_buf: u64,
    pub ms_snd_tsbpd_delay: u32,
    pub pkt_rcv_buf: u32,
    pub byte_rcv_buf: u64,
    pub ms_rcv_buf: u64,
    pub ms_rcv_tsbpd_delay: u32,
    pub pkt_reorder_tolerance: u32,
}

/// Detailed statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TraceStats {
    /// Time since the connection started (ms)
    pub ms_timestamp: u64,
    pub total: Counters,
    pub interval: Counters,
    /// Length of the interval the `interval` counters cover (ms)
    pub ms_interval: u64,
    pub mbps_send_rate: f64,
    pub mbps_recv_rate: f64,
    pub instant: Instantaneous,
}

/// Coarse snapshot: interval traffic plus the main link figures
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerfMon {
    pub ms_timestamp: u64,
    pub pkt_sent: u64,
    pub pkt_recv: u64,
    pub pkt_snd_loss: u64,
    pub pkt_rcv_loss: u64,
    pub pkt_retrans: u64,
    pub pkt_sent_ack: u64,
    pub pkt_recv_ack: u64,
    pub pkt_sent_nak: u64,
    pub pkt_recv_nak: u64,
    pub mbps_send_rate: f64,
    pub mbps_recv_rate: f64,
    pub us_pkt_snd_period: f64,
    pub pkt_flow_window: u32,
    pub pkt_congestion_window: u32,
    pub pkt_flight_size: u32,
    pub ms_rtt: f64,
    pub mbps_bandwidth: f64,
}

impl From<&TraceStats> for PerfMon {
    fn from(stats: &TraceStats) -> Self {
        let i = &stats.interval;
        PerfMon {
            ms_timestamp: stats.ms_timestamp,
            pkt_sent: i.pkt_sent,
            pkt_recv: i.pkt_recv,
            pkt_snd_loss: i.pkt_snd_loss,
            pkt_rcv_loss: i.pkt_rcv_loss,
            pkt_retrans: i.pkt_retrans,
            pkt_sent_ack: i.pkt_sent_ack,
            pkt_recv_ack: i.pkt_recv_ack,
            pkt_sent_nak: i.pkt_sent_nak,
            pkt_recv_nak: i.pkt_recv_nak,
            mbps_send_rate: stats.mbps_send_rate,
            mbps_recv_rate: stats.mbps_recv_rate,
            us_pkt_snd_period: stats.instant.us_pkt_snd_period,
            pkt_flow_window: stats.instant.pkt_flow_window,
            pkt_congestion_window: stats.instant.pkt_congestion_window,
            pkt_flight_size: stats.instant.pkt_flight_size,
            ms_rtt: stats.instant.ms_rtt,
            mbps_bandwidth: stats.instant.mbps_bandwidth,
        }
    }
}

fn mbps(bytes: u64, over: Duration) -> f64 {
    let micros = over.as_micros();
    if micros == 0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / micros as f64
}

/// Accumulates counters for one connection
#[derive(Debug)]
pub struct StatsCollector {
    start: Instant,
    interval_start: Instant,
    total: Counters,
    interval: Counters,
}

impl StatsCollector {
    pub fn new(now: Instant) -> Self {
        StatsCollector {
            start: now,
            interval_start: now,
            total: Counters::default(),
            interval: Counters::default(),
        }
    }

    /// Apply an update to both the totals and the interval counters
    pub fn count(&mut self, update: impl Fn(&mut Counters)) {
        update(&mut self.total);
        update(&mut self.interval);
    }

    pub fn total(&self) -> &Counters {
        &self.total
    }

    pub fn interval(&self) -> &Counters {
        &self.interval
    }

    /// Build a snapshot, optionally starting a new interval
    pub fn snapshot(&mut self, instant: Instantaneous, now: Instant, clear: bool) -> TraceStats {
        let elapsed = now.saturating_duration_since(self.interval_start);
        let stats = TraceStats {
            ms_timestamp: now.saturating_duration_since(self.start).as_millis() as u64,
            total: self.total,
            interval: self.interval,
            ms_interval: elapsed.as_millis() as u64,
            mbps_send_rate: mbps(self.interval.byte_sent, elapsed),
            mbps_recv_rate: mbps(self.interval.byte_recv, elapsed),
            instant,
        };
        if clear {
            self.interval = Counters::default();
            self.interval_start = now;
        }
        stats
    }
}
