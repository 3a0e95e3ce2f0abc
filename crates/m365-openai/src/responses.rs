//! Responses API request parsing.
//!
//! The Responses surface is translated into the same canonical record as
//! chat: `input` items become synthetic messages, `text.format` becomes a
//! response format, and `function_call` / `function_call_output` items are
//! rewritten into the assistant-with-tool-calls and tool message shapes the
//! chat parser already understands.

use m365_core::config::ProxyConfig;
use m365_core::{json, ProxyError, Result};
use serde_json::{Map, Value};

use crate::request::{self, CanonicalRequest};

#[derive(Debug, Clone)]
pub struct ResponsesRequest {
    pub canonical: CanonicalRequest,
    pub previous_response_id: Option<String>,
    pub instructions: Option<String>,
    /// Original `input` preserved verbatim for echoing in response bodies.
    pub input_echo: Value,
}

pub fn parse_responses(body: &Value, cfg: &ProxyConfig) -> Result<ResponsesRequest> {
    let input = body
        .get("input")
        .ok_or_else(|| ProxyError::InvalidRequest("input is required".to_string()))?;

    let mut messages = input_to_messages(input);

    if let Some(instructions) = json::str_field(body, "instructions") {
        let has_system = messages.iter().any(|m| {
            matches!(json::str_field(m, "role"), Some("system") | Some("developer"))
        });
        if !has_system {
            messages.insert(
                0,
                serde_json::json!({"role": "system", "content": instructions}),
            );
        }
    }

    let textual = messages.iter().any(|m| {
        request::content_to_text(
            json::str_field(m, "role").unwrap_or("user"),
            m.get("content"),
        )
        .is_some()
            || request::context_line(m).is_some()
    });
    if messages.is_empty() || !textual {
        return Err(ProxyError::InvalidRequest(
            "input did not yield any textual item".to_string(),
        ));
    }

    let mut canonical = request::parse_chat(&synthetic_chat_body(body, messages), cfg)?;

    if let Some(format) = json::path(body, &["text", "format"]) {
        canonical.response_format = request::parse_response_format(Some(format));
    }
    if let Some(effort) = json::path(body, &["reasoning", "effort"]).and_then(Value::as_str) {
        canonical.reasoning_effort = Some(effort.to_string());
    }

    Ok(ResponsesRequest {
        canonical,
        previous_response_id: json::str_field(body, "previous_response_id").map(String::from),
        instructions: json::str_field(body, "instructions").map(String::from),
        input_echo: input.clone(),
    })
}

/// Translate `input` (string or item array) into synthetic chat messages.
fn input_to_messages(input: &Value) -> Vec<Value> {
    match input {
        Value::String(s) => vec![serde_json::json!({"role": "user", "content": s})],
        Value::Array(items) => items.iter().filter_map(item_to_message).collect(),
        _ => Vec::new(),
    }
}

fn item_to_message(item: &Value) -> Option<Value> {
    if let Value::String(s) = item {
        return Some(serde_json::json!({"role": "user", "content": s}));
    }
    let item_type = json::str_field(item, "type");
    match item_type {
        Some("function_call") => {
            let call_id = json::first_str(item, &["call_id", "id"]).unwrap_or("call_0");
            let name = json::str_field(item, "name")?;
            let arguments = match item.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "{}".to_string(),
            };
            Some(serde_json::json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": call_id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments},
                }],
            }))
        }
        Some("function_call_output") => {
            let call_id = json::str_field(item, "call_id").unwrap_or("call_0");
            let output = match item.get("output") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            Some(serde_json::json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": output,
            }))
        }
        // `message` items and anything that already looks like a message.
        Some("message") | None => {
            let role = json::str_field(item, "role")?;
            let content = item.get("content")?.clone();
            Some(serde_json::json!({"role": role, "content": content}))
        }
        // reasoning items and other server-side shapes carry nothing usable.
        _ => None,
    }
}

/// Assemble a chat-shaped body so the chat parser handles everything else
/// (tools, extensions, location, compat context).
fn synthetic_chat_body(body: &Value, messages: Vec<Value>) -> Value {
    let mut out = Map::new();
    out.insert("messages".to_string(), Value::Array(messages));
    const FORWARDED: &[&str] = &[
        "model",
        "stream",
        "tools",
        "tool_choice",
        "parallel_tool_calls",
        "temperature",
        "user",
        "m365_transport",
        "m365_conversation_id",
        "m365_conversation_key",
        "m365_new_conversation",
        "m365_time_zone",
        "m365_country_or_region",
        "m365_location_hint",
        "m365_contextual_resources",
        "m365_additional_context",
        "m365_system_prompt",
    ];
    if let Some(obj) = body.as_object() {
        for key in FORWARDED {
            if let Some(v) = obj.get(*key) {
                out.insert((*key).to_string(), v.clone());
            }
        }
    }
    Value::Object(out)
}
