//! Bounded payload previews for log lines.
//!
//! Log output must never contain a full payload: payloads can be large,
//! and plugin data is not ours to persist in log files. Everything the
//! transport logs about a payload goes through [`preview`].

use serde_json::Value;

/// Maximum characters of payload included in a log line.
pub const PREVIEW_MAX_CHARS: usize = 200;

/// Render a payload preview bounded to [`PREVIEW_MAX_CHARS`].
pub fn preview(payload: Option<&Value>) -> String {
    match payload {
        None => String::from("<none>"),
        Some(Value::String(text)) => truncate(text),
        Some(value) => truncate(&value.to_string()),
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= PREVIEW_MAX_CHARS {
        return text.to_string();
    }

    let clipped: String = text.chars().take(PREVIEW_MAX_CHARS).collect();
    format!("{clipped}…")
}
