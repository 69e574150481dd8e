//! Text helpers

/// Deterministic truncation to at most `max_chars` characters.
/// Never splits a UTF-8 sequence; identical input always yields identical output.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    let trimmed = input.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => trimmed[..idx].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

/// Short snippet for log lines
pub fn truncate_snippet(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &input[..idx]),
        None => input.to_string(),
    }
}

/// Treat empty and obviously templated values as missing credentials
pub fn is_placeholder(value: &str) -> bool {
    let t = value.trim();
    t.is_empty()
        || t.contains("${")
        || t.eq_ignore_ascii_case("your-api-key-here")
        || t.eq_ignore_ascii_case("changeme")
}
