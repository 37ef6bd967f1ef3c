//! Formatting helpers for log lines: byte previews, throughput and ETA.
use std::fmt::Write;
use std::time::Duration;

/// Hex preview of at most `max` bytes of `data`, with an ellipsis when cut.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(data.len().min(max) * 2 + 1);
    for b in data.iter().take(max) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > max {
        out.push('…');
    }
    out
}

/// Human readable throughput, e.g. `12.3 KiB/s`.
pub fn format_rate(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 3] = ["B/s", "KiB/s", "MiB/s"];
    let mut value = bytes_per_sec.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// `m:ss` remaining, or `--:--` while the rate is still unknown.
pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(d) => {
            let secs = d.as_secs();
            format!("{}:{:02}", secs / 60, secs % 60)
        }
        None => "--:--".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_truncates() {
        assert_eq!(hex_snippet(&[0xde, 0xad, 0xbe, 0xef], 2), "dead…");
        assert_eq!(hex_snippet(&[0x01], 8), "01");
    }

    #[test]
    fn rates_and_eta() {
        assert_eq!(format_rate(512.0), "512 B/s");
        assert_eq!(format_rate(1536.0), "1.5 KiB/s");
        assert_eq!(format_eta(Some(Duration::from_secs(125))), "2:05");
        assert_eq!(format_eta(None), "--:--");
    }
}
