//! Statistics display and formatting

use srt::protocol::stats::Counters;
use srt::{PerfMon, TraceStats};
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bandwidth in human-readable form
pub fn format_bandwidth(bps: u64) -> String {
    const KBPS: u64 = 1000;
    const MBPS: u64 = KBPS * 1000;
    const GBPS: u64 = MBPS * 1000;

    if bps >= GBPS {
        format!("{:.2} Gbps", bps as f64 / GBPS as f64)
    } else if bps >= MBPS {
        format!("{:.2} Mbps", bps as f64 / MBPS as f64)
    } else if bps >= KBPS {
        format!("{:.2} Kbps", bps as f64 / KBPS as f64)
    } else {
        format!("{} bps", bps)
    }
}

/// Format RTT in human-readable form
pub fn format_rtt(rtt_us: u32) -> String {
    if rtt_us >= 1_000_000 {
        format!("{:.2}s", rtt_us as f64 / 1_000_000.0)
    } else if rtt_us >= 1_000 {
        format!("{:.2}ms", rtt_us as f64 / 1_000.0)
    } else {
        format!("{}µs", rtt_us)
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn mbps_to_bps(mbps: f64) -> u64 {
    (mbps * 1_000_000.0).max(0.0) as u64
}

/// Display a detailed statistics snapshot
pub fn display_stats(stats: &TraceStats) {
    let total = &stats.total;
    let interval = &stats.interval;
    let instant = &stats.instant;

    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ CONNECTION STATISTICS                                       │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Uptime: {}                                              ",
        format_duration(Duration::from_millis(stats.ms_timestamp))
    );
    println!(
        "│ RTT: {}   Bandwidth: {}                       ",
        format_rtt((instant.ms_rtt * 1000.0) as u32),
        format_bandwidth(mbps_to_bps(instant.mbps_bandwidth))
    );
    println!(
        "│ Window: flow {} / congestion {} / in flight {}              ",
        instant.pkt_flow_window, instant.pkt_congestion_window, instant.pkt_flight_size
    );
    println!("├──────────┬──────────┬──────────┬──────────┬──────────┬─────┤");
    println!("│ Counter  │ Sent     │ Received │ Lost     │ Retrans  │ Drop│");
    println!("├──────────┼──────────┼──────────┼──────────┼──────────┼─────┤");
    display_counters_row("total", total);
    display_counters_row("interval", interval);
    println!("└──────────┴──────────┴──────────┴──────────┴──────────┴─────┘");
    println!(
        "  Rates: send {} / receive {}   Buffers: send {} pkts ({} ms), receive {} pkts ({} ms)",
        format_bandwidth(mbps_to_bps(stats.mbps_send_rate)),
        format_bandwidth(mbps_to_bps(stats.mbps_recv_rate)),
        instant.pkt_snd_buf,
        instant.ms_snd_buf,
        instant.pkt_rcv_buf,
        instant.ms_rcv_buf
    );
}

/// One table row of packet counters
fn display_counters_row(label: &str, counters: &Counters) {
    println!(
        "│ {:8} │ {:8} │ {:8} │ {:8} │ {:8} │ {:3} │",
        label,
        counters.pkt_sent,
        counters.pkt_recv,
        counters.pkt_snd_loss + counters.pkt_rcv_loss,
        counters.pkt_retrans,
        counters.pkt_snd_drop + counters.pkt_rcv_drop
    );
}

/// Display compact stats on one line (for continuous updates)
pub fn display_compact_stats(stats: &PerfMon, bytes: u64, elapsed: Duration) {
    let throughput_bps = if elapsed.as_secs() > 0 {
        (bytes * 8) / elapsed.as_secs()
    } else {
        0
    };

    eprint!(
        "\r[{:8}] {} | Rate: {} | RTT: {} | Loss: {}/{} | Retrans: {}         ",
        format_duration(elapsed),
        format_bytes(bytes),
        format_bandwidth(throughput_bps),
        format_rtt((stats.ms_rtt * 1000.0) as u32),
        stats.pkt_snd_loss,
        stats.pkt_rcv_loss,
        stats.pkt_retrans
    );

    use std::io::Write;
    let _ = std::io::stderr().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.00 MB");
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(500), "500 bps");
        assert_eq!(format_bandwidth(10_000), "10.00 Kbps");
        assert_eq!(format_bandwidth(10_000_000), "10.00 Mbps");
    }

    #[test]
    fn test_format_rtt() {
        assert_eq!(format_rtt(500), "500µs");
        assert_eq!(format_rtt(50_000), "50.00ms");
        assert_eq!(format_rtt(2_000_000), "2.00s");
    }

    #[test]
    fn test_mbps_to_bps() {
        assert_eq!(mbps_to_bps(1.5), 1_500_000);
        assert_eq!(mbps_to_bps(-1.0), 0);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 01m 01s");
    }
}
