use std::time::Duration;

/// Format an uptime as `"Dd Hh Mm Ss"`, e.g. `"0d 3h 27m 4s"`.
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    format!("{days}d {hours}h {minutes}m {seconds}s")
}
