//! Output formatting utilities

use serde::Serialize;

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Format duration as human-readable
pub fn format_eta(seconds: u64) -> String {
    if seconds == 0 {
        return "-".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Shorten long ids for tables
pub fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        let head: String = value.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(0), "-");
        assert_eq!(format_eta(59), "59s");
        assert_eq!(format_eta(61), "1m 1s");
        assert_eq!(format_eta(3725), "1h 2m 5s");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("org--model_main_abcdef12", 10), "org--mo...");
    }
}
