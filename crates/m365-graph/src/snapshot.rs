//! Assistant-text extraction from cumulative conversation snapshots.
//!
//! Graph re-sends the whole conversation on every stream event and in the
//! buffered chat body. The prompt itself appears among the messages, so the
//! extractor prefers the last non-empty text that is *not* the prompt and
//! only falls back to the last non-empty text when nothing else exists.

use m365_core::json;
use serde_json::Value;

/// All non-empty message texts in snapshot order.
fn message_texts(snapshot: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let locations = [
        snapshot.get("messages"),
        json::path(snapshot, &["item", "messages"]),
    ];
    for messages in locations.into_iter().flatten() {
        let Some(arr) = messages.as_array() else {
            continue;
        };
        for msg in arr {
            if let Some(text) = message_text(msg) {
                out.push(text.to_string());
            }
        }
    }
    // some snapshots carry a bare top-level text
    if out.is_empty() {
        if let Some(text) = message_text(snapshot) {
            out.push(text.to_string());
        }
    }
    out
}

fn message_text(msg: &Value) -> Option<&str> {
    json::first_str(msg, &["text", "hiddenText", "spokenText"])
        .or_else(|| json::path(msg, &["body", "content"]).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// Last non-empty text that differs from the prompt. `None` when every text
/// echoes the prompt — the stream transform then emits no delta.
pub fn latest_excluding_prompt(snapshot: &Value, prompt: &str) -> Option<String> {
    let texts = message_texts(snapshot);
    texts.into_iter().rev().find(|t| t != prompt)
}

/// Last non-empty text of any kind.
pub fn latest_any(snapshot: &Value) -> Option<String> {
    message_texts(snapshot).pop()
}

/// Buffered extraction: prompt-excluded first, then the fallback.
pub fn latest_assistant_text(snapshot: &Value, prompt: &str) -> Option<String> {
    latest_excluding_prompt(snapshot, prompt).or_else(|| latest_any(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefers_last_non_prompt_text() {
        let snapshot = json!({"messages": [
            {"text": "Hi"},
            {"text": "Hello there."},
            {"text": "Hi"},
        ]});
        assert_eq!(
            latest_assistant_text(&snapshot, "Hi"),
            Some("Hello there.".to_string())
        );
    }

    #[test]
    fn context_block_echo_is_excluded() {
        // requests with additional context send a Context:-prefixed prompt;
        // the exclusion value must be that full sent text, or the echo leaks
        // back to the client as an assistant delta
        let sent = "Context:\nsystem: be terse\nuser: earlier turn\n\nUser: Hi";
        let echo_only = json!({"messages": [{"text": sent}]});
        assert_eq!(latest_excluding_prompt(&echo_only, sent), None);

        let with_reply = json!({"messages": [
            {"text": sent},
            {"text": "Hello there."},
        ]});
        assert_eq!(
            latest_excluding_prompt(&with_reply, sent),
            Some("Hello there.".to_string())
        );
    }

    #[test]
    fn prompt_only_snapshot() {
        let snapshot = json!({"messages": [{"text": "Hi"}]});
        assert_eq!(latest_excluding_prompt(&snapshot, "Hi"), None);
        // fallback still surfaces something for the buffered path
        assert_eq!(latest_assistant_text(&snapshot, "Hi"), Some("Hi".to_string()));
    }

    #[test]
    fn hidden_text_and_nested_item() {
        let snapshot = json!({"item": {"messages": [
            {"hiddenText": "internal"},
        ]}});
        assert_eq!(
            latest_assistant_text(&snapshot, "x"),
            Some("internal".to_string())
        );
    }

    #[test]
    fn body_content_fallback() {
        let snapshot = json!({"messages": [
            {"body": {"content": "rich text"}},
        ]});
        assert_eq!(latest_any(&snapshot), Some("rich text".to_string()));
    }

    #[test]
    fn empty_snapshot_yields_none() {
        assert_eq!(latest_any(&json!({})), None);
        assert_eq!(latest_any(&json!({"messages": []})), None);
    }
}
