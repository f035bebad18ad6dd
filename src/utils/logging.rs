use serde::Serialize;

/// Pretty-print `value` and hand it to `log_action`, only when debug logging is on.
pub(crate) fn with_pretty_json_debug<T, F>(value: &T, log_action: F)
where
    T: Serialize,
    F: FnOnce(&str),
{
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }

    let pretty_json = serde_json::to_string_pretty(value)
        .unwrap_or_else(|error| format!("<pretty serialize failed: {error}>"));
    log_action(pretty_json.as_str());
}

/// First `max_chars` characters of a possibly non-UTF-8 body, for log lines.
pub(crate) fn body_preview(bytes: &[u8], max_chars: usize) -> String {
    let raw = String::from_utf8_lossy(bytes);
    let mut preview: String = raw.chars().take(max_chars).collect();
    if raw.chars().nth(max_chars).is_some() {
        preview.push('…');
    }
    preview
}
