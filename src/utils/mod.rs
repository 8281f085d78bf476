/// Utility functions and helpers
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a unique ID based on timestamp, a process-wide sequence and a random component
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let sequence = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);

    let random: u32 = rand::random();
    format!("{}-{}-{}-{:x}", prefix, timestamp, sequence, random)
}

/// Share of `part` in `total` as a percentage, 0 when there is no total
pub fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / total as f64
}

/// Milliseconds with sub-millisecond precision
pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Human-readable age of a timestamp, e.g. for the last health check
pub fn format_age(at: Option<SystemTime>) -> String {
    match at.and_then(|t| SystemTime::now().duration_since(t).ok()) {
        Some(age) => format!("{} ago", format_duration(age)),
        None => "never".to_string(),
    }
}
