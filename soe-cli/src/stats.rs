//! Statistics display and formatting

use soe::{ServiceStats, SessionStats};
use std::io::Write;
use std::time::Duration;

/// Scale `value` to the largest unit it reaches
///
/// `units` runs from the base unit upward, each `step` times the previous.
fn scaled(value: f64, step: f64, units: &[&str]) -> String {
    let mut value = value;
    let mut unit = 0;
    while value >= step && unit + 1 < units.len() {
        value /= step;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", value as u64, units[0])
    } else {
        format!("{:.2}{}", value, units[unit])
    }
}

/// Byte count in binary units
pub fn format_bytes(bytes: u64) -> String {
    scaled(bytes as f64, 1024.0, &[" B", " KB", " MB", " GB"])
}

/// Bit rate in decimal units
pub fn format_bandwidth(bps: u64) -> String {
    scaled(bps as f64, 1000.0, &[" bps", " Kbps", " Mbps", " Gbps"])
}

/// Round-trip time, from microseconds up to seconds
pub fn format_rtt(rtt: Duration) -> String {
    scaled(rtt.as_micros() as f64, 1000.0, &["µs", "ms", "s"])
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

/// Display one session's statistics
pub fn display_session_stats(stats: &SessionStats) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ SESSION STATISTICS                                          │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Session: {:#010x}  Status: {}                      ",
        stats.connection_id, stats.status
    );
    println!(
        "│ Window: {} / {}  In flight: {} (max {})                 ",
        stats.window_size, stats.max_window_size, stats.in_flight, stats.max_in_flight
    );
    println!(
        "│ Pending: {}  Rollover: {}  Queued messages: {}          ",
        stats.pending_packets, stats.rollover_packets, stats.outgoing_messages
    );
    println!(
        "│ Window changes: +{} / -{}                               ",
        stats.window_increases, stats.window_decreases
    );
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ TRAFFIC                                                     │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Packets:  {} sent / {} received                       ",
        stats.packets_sent, stats.packets_received
    );
    println!(
        "│ Bytes:    {} sent / {} received                 ",
        format_bytes(stats.bytes_sent),
        format_bytes(stats.bytes_received)
    );
    println!(
        "│ Messages: {} queued / {} delivered                    ",
        stats.messages_queued, stats.messages_delivered
    );
    println!(
        "│ Resent: {} ({} fast)  Duplicates: {}  Held: {}          ",
        stats.packets_resent, stats.fast_resends, stats.duplicates_dropped, stats.out_of_order_held
    );
    println!(
        "│ Holding: {}  Dropped ahead: {}  Last ack: {}          ",
        stats.held_packets,
        stats.dropped_ahead,
        stats
            .last_ack_sent
            .map_or_else(|| "-".to_string(), |seq| seq.to_string())
    );
    println!(
        "│ Protocol errors: {}  Unknown opcodes: {}  Reassembly: {}  ",
        stats.protocol_errors, stats.unknown_opcodes, stats.reassembly_failures
    );
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ ROUND TRIP                                                  │");
    println!("├─────────────────────────────────────────────────────────────┤");
    if stats.rtt.samples > 0 {
        println!(
            "│ Last: {}  Avg: {}  Min: {}  Max: {}          ",
            format_rtt(stats.rtt.last),
            format_rtt(stats.rtt.average),
            format_rtt(stats.rtt.shortest),
            format_rtt(stats.rtt.longest)
        );
    } else {
        println!("│ No samples yet                                              │");
    }
    println!("│ RTO: {}                                              ", format_rtt(stats.rto));
    println!("└─────────────────────────────────────────────────────────────┘");
}

/// Display service-wide statistics
pub fn display_service_stats(stats: &ServiceStats) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ SERVICE STATISTICS                                          │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Sessions: {} active / {} created                           ",
        stats.sessions, stats.sessions_created
    );
    println!(
        "│ Uptime: {}                                              ",
        format_duration(stats.uptime)
    );
    println!(
        "│ Datagrams: {} sent / {} received                     ",
        stats.datagrams_sent, stats.datagrams_received
    );
    println!(
        "│ Bytes:     {} sent / {} received                 ",
        format_bytes(stats.bytes_sent),
        format_bytes(stats.bytes_received)
    );
    println!(
        "│ Errors: {} decode / {} send / {} unknown peer          ",
        stats.decode_errors, stats.send_errors, stats.unknown_peer_datagrams
    );
    println!("└─────────────────────────────────────────────────────────────┘");
}

/// Display compact stats on one line (for continuous updates)
pub fn display_compact_stats(stats: &SessionStats, elapsed: Duration) {
    let throughput_bps = if elapsed.as_secs() > 0 {
        (stats.bytes_sent * 8) / elapsed.as_secs()
    } else {
        0
    };

    print!(
        "\r[{:8}] {} | Sent: {} | Rate: {} | Window: {}/{} | RTT: {} | Resent: {}         ",
        format_duration(elapsed),
        stats.status,
        format_bytes(stats.bytes_sent),
        format_bandwidth(throughput_bps),
        stats.in_flight,
        stats.window_size,
        format_rtt(stats.rtt.average),
        stats.packets_resent
    );

    // A failed flush only delays the progress line
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.00 MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024 * 1024), "5120.00 GB");
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(500), "500 bps");
        assert_eq!(format_bandwidth(10_000), "10.00 Kbps");
        assert_eq!(format_bandwidth(10_000_000), "10.00 Mbps");
    }

    #[test]
    fn test_format_rtt() {
        assert_eq!(format_rtt(Duration::from_micros(500)), "500µs");
        assert_eq!(format_rtt(Duration::from_millis(50)), "50.00ms");
        assert_eq!(format_rtt(Duration::from_secs(2)), "2.00s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 01m 01s");
    }
}
