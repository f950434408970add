//! Timestamp-based packet delivery clock
//!
//! Maps the peer's 32-bit microsecond timestamps onto local [`Instant`]s.
//! A packet stamped `ts` becomes deliverable at
//! `base + ts + wrap periods + drift + latency`.

use std::time::{Duration, Instant};
use tracing::debug;

/// Timestamps wrap every 2^32 microseconds (about 71.6 minutes)
const TIMESTAMP_PERIOD_US: u64 = 1 << 32;

/// Window at both ends of the timestamp space used to detect a wrap
const WRAP_WINDOW_US: u32 = 30_000_000;

/// Drift samples per averaging span
const DRIFT_SPAN_SAMPLES: u32 = 1000;

/// Longest averaging span
const DRIFT_SPAN_TIME: Duration = Duration::from_secs(5);

/// Drift below this is left alone
const MAX_DRIFT_US: i64 = 5_000;

/// Averages clock drift samples over a span
#[derive(Debug, Default)]
struct DriftTracer {
    sum_us: i64,
    count: u32,
    span_start: Option<Instant>,
}

impl DriftTracer {
    /// Returns the span average once the span is complete
    fn add(&mut self, sample_us: i64, now: Instant) -> Option<i64> {
        let start = *self.span_start.get_or_insert(now);
        self.sum_us += sample_us;
        self.count += 1;

        let complete = self.count >= DRIFT_SPAN_SAMPLES
            || now.saturating_duration_since(start) >= DRIFT_SPAN_TIME;
        if !complete {
            return None;
        }

        let average = self.sum_us / self.count as i64;
        *self = DriftTracer::default();
        Some(average)
    }
}

/// Receiver-side TSBPD clock
#[derive(Debug)]
pub struct TsbpdClock {
    /// Local instant corresponding to peer timestamp zero
    base: Instant,
    latency: Duration,
    /// Completed timestamp wrap periods
    wraps: u64,
    /// Timestamps near the top of the space were seen; a wrap is imminent
    wrap_check: bool,
    /// Accumulated drift correction (microseconds)
    drift_us: i64,
    tracer: DriftTracer,
}

impl TsbpdClock {
    /// Create a clock from the local arrival time of a packet stamped `peer_ts`
    pub fn new(arrival: Instant, peer_ts: u32, latency: Duration) -> Self {
        let base = arrival
            .checked_sub(Duration::from_micros(peer_ts as u64))
            .unwrap_or(arrival);
        TsbpdClock {
            base,
            latency,
            wraps: 0,
            wrap_check: false,
            drift_us: 0,
            tracer: DriftTracer::default(),
        }
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Accumulated drift correction in microseconds
    pub fn drift_us(&self) -> i64 {
        self.drift_us
    }

    /// Track timestamp wrap from an arriving data packet
    pub fn observe(&mut self, ts: u32) {
        if !self.wrap_check {
            if ts > u32::MAX - WRAP_WINDOW_US {
                self.wrap_check = true;
            }
        } else if ts > WRAP_WINDOW_US && ts <= 2 * WRAP_WINDOW_US {
            self.wraps += 1;
            self.wrap_check = false;
            debug!(wraps = self.wraps, "TSBPD timestamp wrapped");
        }
    }

    /// Unwrapped microseconds since the base for timestamp `ts`
    fn unwrapped(&self, ts: u32) -> u64 {
        let mut periods = self.wraps;
        if self.wrap_check && ts < WRAP_WINDOW_US {
            periods += 1;
        }
        periods * TIMESTAMP_PERIOD_US + ts as u64
    }

    /// Local time the packet was sent, as seen through this clock
    pub fn origin_time(&self, ts: u32) -> Instant {
        let offset = self.unwrapped(ts) as i64 + self.drift_us;
        if offset >= 0 {
            self.base + Duration::from_micros(offset as u64)
        } else {
            self.base
                .checked_sub(Duration::from_micros(offset.unsigned_abs()))
                .unwrap_or(self.base)
        }
    }

    /// Time a packet stamped `ts` is handed to the application
    pub fn release_time(&self, ts: u32) -> Instant {
        self.origin_time(ts) + self.latency
    }

    /// Feed a drift sample: a control packet stamped `ts` arrived at `now`
    ///
    /// Returns the correction applied, if the span average was large enough.
    pub fn on_drift_sample(&mut self, ts: u32, now: Instant) -> Option<i64> {
        let expected = self.origin_time(ts);
        let sample = if now >= expected {
            now.duration_since(expected).as_micros() as i64
        } else {
            -(expected.duration_since(now).as_micros() as i64)
        };

        let average = self.tracer.add(sample, now)?;
        if average.abs() <= MAX_DRIFT_US {
            return None;
        }
        self.drift_us += average;
        debug!(drift_us = self.drift_us, "TSBPD drift corrected");
        Some(average)
    }
}
