//! RS-framed hub records and per-frame field extraction.
//!
//! Records on the wire are newline-less JSON separated by the ASCII RS byte
//! (0x1E); every outbound payload carries a trailing RS terminator. Frame
//! shapes vary across service snapshots, so extraction probes several known
//! locations per field rather than deserializing into fixed types.

use m365_core::json;
use serde_json::Value;

pub const RS: char = '\u{1e}';

/// Serialize one outbound record with its RS terminator.
pub fn encode(payload: &Value) -> String {
    format!("{payload}{RS}")
}

/// Split one inbound text message into its JSON records.
pub fn split_records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RS).map(str::trim).filter(|s| !s.is_empty())
}

pub fn parse_records(text: &str) -> Vec<Value> {
    split_records(text)
        .filter_map(|r| serde_json::from_str(r).ok())
        .collect()
}

/// Conversation id, probed shallow to deep; the deepest-last non-empty
/// location wins.
pub fn conversation_id(frame: &Value) -> Option<String> {
    let mut found = json::str_field(frame, "conversationId");
    if let Some(s) = frame
        .get("item")
        .and_then(|i| json::str_field(i, "conversationId"))
    {
        found = Some(s);
    }
    if let Some(args) = json::array_field(frame, "arguments") {
        for arg in args {
            if let Some(s) = json::str_field(arg, "conversationId") {
                found = Some(s);
            }
        }
        for arg in args {
            if let Some(s) = arg
                .get("item")
                .and_then(|i| json::str_field(i, "conversationId"))
            {
                found = Some(s);
            }
        }
    }
    found.map(String::from)
}

/// Streaming content deltas (`writeAtCursor`) carried by update frames.
pub fn cursor_deltas(frame: &Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(args) = json::array_field(frame, "arguments") {
        for arg in args {
            if let Some(delta) = json::str_field(arg, "writeAtCursor") {
                out.push(delta.to_string());
            }
        }
    }
    out
}

/// Latest bot message text: `author == "bot"`, `messageType` in
/// {Chat, Disengaged} (absent counts as Chat); text is the first of
/// `text`, `hiddenText`, `spokenText`.
pub fn bot_message_text(frame: &Value) -> Option<String> {
    let mut found = None;
    let mut scan = |messages: Option<&Value>| {
        let Some(arr) = messages.and_then(Value::as_array) else {
            return;
        };
        for msg in arr {
            if json::str_field(msg, "author") != Some("bot") {
                continue;
            }
            let message_type = json::str_field(msg, "messageType").unwrap_or("Chat");
            if message_type != "Chat" && message_type != "Disengaged" {
                continue;
            }
            if let Some(text) = json::first_str(msg, &["text", "hiddenText", "spokenText"]) {
                found = Some(text.to_string());
            }
        }
    };

    scan(frame.get("messages"));
    scan(json::path(frame, &["item", "messages"]));
    if let Some(args) = json::array_field(frame, "arguments") {
        for arg in args {
            scan(arg.get("messages"));
            scan(json::path(arg, &["item", "messages"]));
        }
    }
    found
}

pub fn frame_type(frame: &Value) -> Option<i64> {
    json::int_field(frame, "type")
}

/// Invocation result, close, and completion frames end the turn.
pub fn is_terminal(frame: &Value) -> bool {
    matches!(frame_type(frame), Some(2) | Some(3) | Some(7))
}

pub fn error_message(frame: &Value) -> Option<String> {
    match frame.get("error")? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// `result.value`, when present, must be Success or ApologyResponseReturned
/// (case-insensitive). Returns the failure description otherwise.
pub fn result_failure(frame: &Value) -> Option<String> {
    let result = frame
        .get("result")
        .or_else(|| json::path(frame, &["item", "result"]))?;
    let value = json::str_field(result, "value")?;
    if value.eq_ignore_ascii_case("success")
        || value.eq_ignore_ascii_case("apologyresponsereturned")
    {
        return None;
    }
    Some(
        json::str_field(result, "message")
            .map(String::from)
            .unwrap_or_else(|| format!("result {value}")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_appends_rs() {
        let rec = encode(&json!({"type": 6}));
        assert!(rec.ends_with('\u{1e}'));
        assert_eq!(&rec[..rec.len() - 1], r#"{"type":6}"#);
    }

    #[test]
    fn split_handles_multiple_records() {
        let wire = format!("{}\u{1e}{}\u{1e}", r#"{"type":6}"#, r#"{"type":3}"#);
        let records = parse_records(&wire);
        assert_eq!(records.len(), 2);
        assert_eq!(frame_type(&records[0]), Some(6));
        assert!(is_terminal(&records[1]));
    }

    #[test]
    fn conversation_id_deepest_last_wins() {
        let frame = json!({
            "conversationId": "shallow",
            "arguments": [{"conversationId": "mid", "item": {"conversationId": "deep"}}],
        });
        assert_eq!(conversation_id(&frame), Some("deep".to_string()));

        let frame = json!({"item": {"conversationId": "only"}});
        assert_eq!(conversation_id(&frame), Some("only".to_string()));

        // empty strings never win
        let frame = json!({"conversationId": "kept", "arguments": [{"conversationId": ""}]});
        assert_eq!(conversation_id(&frame), Some("kept".to_string()));
    }

    #[test]
    fn cursor_deltas_in_order() {
        let frame = json!({"arguments": [
            {"writeAtCursor": "Hel"},
            {"writeAtCursor": "lo"},
            {"other": true},
        ]});
        assert_eq!(cursor_deltas(&frame), vec!["Hel", "lo"]);
    }

    #[test]
    fn bot_message_selection() {
        let frame = json!({"arguments": [{"messages": [
            {"author": "user", "text": "Hi"},
            {"author": "bot", "messageType": "Suggestions", "text": "ignored"},
            {"author": "bot", "messageType": "Chat", "text": "first"},
            {"author": "bot", "hiddenText": "latest"},
        ]}]});
        assert_eq!(bot_message_text(&frame), Some("latest".to_string()));
    }

    #[test]
    fn disengaged_counts_as_chat() {
        let frame = json!({"item": {"messages": [
            {"author": "bot", "messageType": "Disengaged", "spokenText": "bye"},
        ]}});
        assert_eq!(bot_message_text(&frame), Some("bye".to_string()));
    }

    #[test]
    fn result_status_case_insensitive() {
        let ok = json!({"type": 3, "result": {"value": "SUCCESS"}});
        assert_eq!(result_failure(&ok), None);
        let apology = json!({"result": {"value": "ApologyResponseReturned"}});
        assert_eq!(result_failure(&apology), None);
        let no_result = json!({"type": 3});
        assert_eq!(result_failure(&no_result), None);
        let failed = json!({"result": {"value": "Throttled", "message": "slow down"}});
        assert_eq!(result_failure(&failed), Some("slow down".to_string()));
        let failed_no_msg = json!({"result": {"value": "InternalError"}});
        assert_eq!(
            result_failure(&failed_no_msg),
            Some("result InternalError".to_string())
        );
    }

    #[test]
    fn error_field_detected() {
        assert_eq!(
            error_message(&json!({"error": "bad handshake"})),
            Some("bad handshake".to_string())
        );
        assert!(error_message(&json!({"type": 1})).is_none());
    }
}
