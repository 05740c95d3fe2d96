use chrono::{DateTime, Local};
use std::time::Duration;

// Get current local timestamp as a formatted string
pub fn current_local_timestamp_str(format_str: &str) -> String {
    let now: DateTime<Local> = Local::now();
    now.format(format_str).to_string()
}

/// Renders a duration as `H:MM:SS`, the way progress and ETA are shown to users.
pub fn format_eta(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{}:{:02}:{:02}", hours, minutes, seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_formatting() {
        assert_eq!(format_eta(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_eta(Duration::from_secs(59)), "0:00:59");
        assert_eq!(format_eta(Duration::from_secs(3 * 3600 + 25 * 60 + 7)), "3:25:07");
        assert_eq!(format_eta(Duration::from_millis(1999)), "0:00:01");
    }
}
