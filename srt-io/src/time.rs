//! Packet timestamps
//!
//! SRT timestamps are 32-bit microsecond counters relative to the moment a
//! socket was set up. They wrap roughly every 71.6 minutes.

use std::time::Instant;

/// Microseconds of one full 32-bit timestamp period
pub const TIMESTAMP_PERIOD_US: u64 = 1 << 32;

/// Timestamp of `now` relative to `origin`, wrapping every
/// [`TIMESTAMP_PERIOD_US`]
#[inline]
pub fn srt_timestamp(origin: Instant, now: Instant) -> u32 {
    let micros = now.saturating_duration_since(origin).as_micros();
    (micros % TIMESTAMP_PERIOD_US as u128) as u32
}
