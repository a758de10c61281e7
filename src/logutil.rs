//! Logging helpers that keep user-supplied text and raw wire bytes on a single log line.

const MAX_PREVIEW: usize = 200;

/// Escape a string for single-line logging.
///
/// Newlines, carriage returns, tabs and backslashes are written as their escape
/// sequences; other control characters become `\xNN`. Long input is cut with an
/// ellipsis.
pub fn escape_log(s: &str) -> String {
    use std::fmt::Write;
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

/// Render raw protocol bytes as a short hex preview (`ff fb 01 …`).
pub fn hex_preview(bytes: &[u8]) -> String {
    const MAX_BYTES: usize = 32;
    let mut parts: Vec<String> = bytes
        .iter()
        .take(MAX_BYTES)
        .map(|b| format!("{:02x}", b))
        .collect();
    if bytes.len() > MAX_BYTES {
        parts.push("…".to_string());
    }
    parts.join(" ")
}
