//! Human-readable sizes and counts for probe messages.

const UNITS: [&str; 5] = ["Bytes", "KiB", "MiB", "GiB", "TiB"];

/// Format a byte count with binary units and at most two decimals ("1.5 MiB").
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut index = 0;
    let mut divisor = 1u64;
    while index + 1 < UNITS.len() && bytes / divisor >= 1024 {
        divisor *= 1024;
        index += 1;
    }
    let value = bytes as f64 / divisor as f64;
    format!("{} {}", trim_decimals(value), UNITS[index])
}

/// Format a count with thousands separators ("12,345").
pub fn format_count(count: u64) -> String {
    let digits = count.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn trim_decimals(value: f64) -> String {
    let s = format!("{value:.2}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}
