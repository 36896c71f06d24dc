// ABOUTME: Output line parser - normalizes heterogeneous backend lines into text fragments
// ABOUTME: Duck-types JSONL content fields; metadata yields nothing; plain text passes through

use serde_json::Value;

/// Turn one raw output line into zero or more text fragments.
///
/// JSON objects are inspected for a content field without caring which backend
/// produced them:
/// - `{"type":"delta","delta":"hi"}` and `{"delta":{"text":"hi"}}`
/// - Claude partial messages: `{"type":"stream_event","event":{"delta":{"text":"hi"}}}`
/// - `{"content":"hi"}` / `{"text":"hi"}`
/// - Codex completed items: `{"type":"item.completed","item":{"type":"agent_message","text":"hi"}}`
///
/// Objects without any of these (thread lifecycle, system/style records, usage,
/// tool chatter) produce no fragments. Anything that is not a JSON object is
/// treated as plain text and comes back with its newline restored.
pub fn parse_line(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(json @ Value::Object(_)) => match content_field(&json) {
            Some(text) => vec![text.to_string()],
            None => {
                tracing::trace!(
                    event_type = json.get("type").and_then(|t| t.as_str()).unwrap_or(""),
                    "Skipping metadata record"
                );
                Vec::new()
            }
        },
        _ => plain(raw),
    }
}

fn plain(raw: &str) -> Vec<String> {
    vec![format!("{raw}\n")]
}

fn content_field(json: &Value) -> Option<&str> {
    if let Some(delta) = json.get("delta") {
        if let Some(text) = delta.as_str().or_else(|| text_of(delta)) {
            return Some(text);
        }
    }

    if let Some(text) = json
        .get("event")
        .and_then(|e| e.get("delta"))
        .and_then(text_of)
    {
        return Some(text);
    }

    if let Some(text) = json.get("content").and_then(|c| c.as_str()) {
        return Some(text);
    }

    if let Some(text) = text_of(json) {
        return Some(text);
    }

    let item = json.get("item")?;
    match item.get("type").and_then(|t| t.as_str()) {
        // Reasoning items also carry "text"; only the reply counts
        Some("agent_message") | Some("message") => text_of(item),
        _ => None,
    }
}

fn text_of(value: &Value) -> Option<&str> {
    value.get("text").and_then(|t| t.as_str())
}
