//! Duration strings as used in configuration and on the wire.
//!
//! Accepts `"500ms"`, `"5s"`, `"2m"`, and bare numbers (seconds).
//! Formatting produces strings the coordination service accepts
//! (`"8s"`, `"1500ms"`).

use std::time::Duration;

/// Longest TTL, deregister-after or backoff the catalog accepts.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Longest blocking-query wait; the coordination service caps it at 10m.
pub const MAX_WAIT: Duration = Duration::from_secs(10 * 60);

/// Parse agent config durations (`check.ttl`, `heartbeat.base_backoff`,
/// `watch.wait`, ...). Minutes that overflow yield `None`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Format a duration for the wire (check TTLs, blocking-query waits):
/// whole seconds when exact, milliseconds otherwise.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
