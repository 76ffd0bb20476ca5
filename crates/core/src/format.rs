/// Clock-style playhead label: `mm:ss.mmm`, or `h:mm:ss.mmm` from one hour on.
/// Non-finite input renders as `--:--`.
pub fn format_time(seconds: f64) -> String {
    if !seconds.is_finite() {
        return "--:--".to_string();
    }

    let sign = if seconds < 0.0 { "-" } else { "" };
    let seconds = seconds.abs();
    let whole = seconds.trunc() as u64;
    let ms = (seconds.fract() * 1000.0).floor() as u64;
    let (h, m, s) = (whole / 3600, whole % 3600 / 60, whole % 60);

    if h > 0 {
        format!("{sign}{h}:{m:02}:{s:02}.{ms:03}")
    } else {
        format!("{sign}{m:02}:{s:02}.{ms:03}")
    }
}

/// Compact ruler label using at most the two largest non-zero units, e.g.
/// `1h 5m`, `1m 30s`, `250ms`.
pub fn format_time_scale(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "0s".to_string();
    }

    let total_ms = (seconds * 1000.0).round() as u64;
    let units = [
        (total_ms / 3_600_000, "h"),
        (total_ms / 60_000 % 60, "m"),
        (total_ms / 1000 % 60, "s"),
        (total_ms % 1000, "ms"),
    ];

    let label: Vec<String> = units
        .iter()
        .filter(|(value, _)| *value > 0)
        .take(2)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();

    if label.is_empty() {
        "0s".to_string()
    } else {
        label.join(" ")
    }
}
