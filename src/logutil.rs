//! Logging utilities for sanitizing mesh-sourced strings so logs stay single-line.
//! Message bodies and node names arrive from untrusted radios and brokers; escape
//! control characters before they reach a log line.

use std::fmt::Write;

const MAX_PREVIEW: usize = 300;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Other control characters are written as `\xNN`. Strings longer than 300 chars
///   are cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// UTF-8 safe truncation for log display. Never slices inside a multi-byte char;
/// appends `...` when the input had to be cut.
pub fn truncate_for_log(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return escape_log(input);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&input[..cut]);
    out.push_str("...");
    out
}

/// Lowercase hex of the first `max` bytes of `data`, for frame-level trace logs.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    data.iter()
        .take(max)
        .fold(String::with_capacity(max * 2), |mut acc, b| {
            let _ = write!(&mut acc, "{:02x}", b);
            acc
        })
}
