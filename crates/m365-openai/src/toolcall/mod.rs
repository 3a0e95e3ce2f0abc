//! Assistant-response building: tool-call salvage and strict-mode policy.
//!
//! The upstream never speaks OpenAI tool calling natively — calls arrive as
//! free-form assistant text that may wrap the JSON in prose, fences, or
//! malformed argument strings. Extraction enumerates candidate substrings
//! and probes each parsed node for the known call shapes; the first
//! candidate producing an accepted call wins.

pub mod arguments;
pub mod candidates;

use m365_core::json;
use serde_json::Value;

use crate::request::{CanonicalRequest, ResponseFormat, ToolChoiceMode, Tooling};
use candidates::Candidates;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallOut {
    pub id: String,
    pub name: String,
    /// Always a valid JSON string, possibly `"{}"`.
    pub arguments_json: String,
}

/// Structured result of one assistant turn.
///
/// Invariants: non-empty `tool_calls` implies `content == None` and
/// `finish_reason == ToolCalls`; a set `strict_tool_error` implies both
/// content and calls are empty.
#[derive(Debug, Clone)]
pub struct AssistantResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallOut>,
    pub finish_reason: FinishReason,
    pub strict_tool_error: Option<String>,
}

impl AssistantResponse {
    pub fn text(content: String) -> Self {
        Self {
            content: Some(content),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            strict_tool_error: None,
        }
    }
}

/// Build the assistant response for a completed turn.
pub fn build(req: &CanonicalRequest, raw_text: &str) -> AssistantResponse {
    if req.tooling.extraction_enabled() {
        if let Some(calls) = extract_tool_calls(&req.tooling, raw_text) {
            return AssistantResponse {
                content: None,
                tool_calls: calls,
                finish_reason: FinishReason::ToolCalls,
                strict_tool_error: None,
            };
        }
        if req.tooling.strict() {
            let message = match req.tooling.choice_mode {
                ToolChoiceMode::Function => format!(
                    "the model did not produce the required call to \"{}\"",
                    req.tooling.choice_function.as_deref().unwrap_or_default()
                ),
                _ => "the model did not produce a required tool call".to_string(),
            };
            return AssistantResponse {
                content: None,
                tool_calls: Vec::new(),
                finish_reason: FinishReason::Stop,
                strict_tool_error: Some(message),
            };
        }
    }
    AssistantResponse::text(normalize_content(req, raw_text))
}

/// First candidate substring that parses into a node yielding at least one
/// accepted call.
pub fn extract_tool_calls(tooling: &Tooling, text: &str) -> Option<Vec<ToolCallOut>> {
    for cand in Candidates::new(text) {
        let Ok(node) = serde_json::from_str::<Value>(cand) else {
            continue;
        };
        for group in call_groups(&node) {
            let accepted = accept_group(tooling, &group);
            if !accepted.is_empty() {
                tracing::debug!(
                    calls = accepted.len(),
                    candidate_len = cand.len(),
                    "tool calls extracted"
                );
                return Some(accepted);
            }
        }
    }
    None
}

/// Probe a parsed node for tool-call shapes, in priority order.
fn call_groups(node: &Value) -> Vec<Vec<&Value>> {
    let mut groups = Vec::new();

    if let Some(calls) = json::array_field(node, "tool_calls") {
        groups.push(calls.iter().collect());
    }
    if let Some(calls) = node
        .get("message")
        .and_then(|m| json::array_field(m, "tool_calls"))
    {
        groups.push(calls.iter().collect());
    }
    if let Some(choices) = json::array_field(node, "choices") {
        for choice in choices {
            for slot in ["message", "delta"] {
                if let Some(calls) = choice
                    .get(slot)
                    .and_then(|m| json::array_field(m, "tool_calls"))
                {
                    groups.push(calls.iter().collect());
                }
            }
        }
    }
    if let Some(output) = json::array_field(node, "output") {
        let items: Vec<&Value> = output
            .iter()
            .filter(|item| json::str_field(item, "type") == Some("function_call"))
            .collect();
        if !items.is_empty() {
            groups.push(items);
        }
    }
    // single-call shape, optionally nested under `function`
    if json::str_field(node, "name").is_some()
        || node
            .get("function")
            .map(|f| json::str_field(f, "name").is_some())
            .unwrap_or(false)
    {
        groups.push(vec![node]);
    }

    groups
}

fn accept_group(tooling: &Tooling, group: &[&Value]) -> Vec<ToolCallOut> {
    group
        .iter()
        .filter_map(|call| accept_call(tooling, call))
        .collect()
}

fn accept_call(tooling: &Tooling, call: &Value) -> Option<ToolCallOut> {
    let function = call.get("function").unwrap_or(call);
    let name = json::str_field(function, "name").or_else(|| json::str_field(call, "name"))?;

    if tooling.choice_mode == ToolChoiceMode::Function
        && tooling.choice_function.as_deref() != Some(name)
    {
        return None;
    }
    if !tooling.declares(name) {
        return None;
    }

    let arguments = function
        .get("arguments")
        .or_else(|| call.get("arguments"));
    let id = json::first_str(call, &["id", "call_id"])
        .map(String::from)
        .unwrap_or_else(new_call_id);

    Some(ToolCallOut {
        id,
        name: name.to_string(),
        arguments_json: arguments::canonicalize(arguments),
    })
}

pub fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// With a response format and no tool call, try to re-extract a JSON node
/// from the text; otherwise pass the raw text through.
fn normalize_content(req: &CanonicalRequest, text: &str) -> String {
    let Some(format) = &req.response_format else {
        return text.to_string();
    };
    for cand in Candidates::new(text) {
        if let Ok(node) = serde_json::from_str::<Value>(cand) {
            let compatible = match format {
                ResponseFormat::JsonObject => node.is_object(),
                ResponseFormat::JsonSchema { .. } => true,
            };
            if compatible {
                return node.to_string();
            }
        }
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::parse_chat;
    use m365_core::config::ProxyConfig;
    use serde_json::json;

    fn req_with_tools(tool_choice: Value) -> CanonicalRequest {
        let body = json!({
            "messages": [{"role": "user", "content": "what time is it?"}],
            "tools": [
                {"type": "function", "function": {"name": "get_time",
                    "parameters": {"type": "object"}}},
                {"type": "function", "function": {"name": "get_date"}},
            ],
            "tool_choice": tool_choice,
        });
        parse_chat(&body, &ProxyConfig::default()).unwrap()
    }

    #[test]
    fn whole_text_tool_calls_array() {
        let req = req_with_tools(json!("auto"));
        let out = build(&req, r#"{"tool_calls":[{"name":"get_time","arguments":{"zone":"UTC"}}]}"#);
        assert_eq!(out.finish_reason, FinishReason::ToolCalls);
        assert_eq!(out.content, None);
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].name, "get_time");
        assert_eq!(out.tool_calls[0].arguments_json, r#"{"zone":"UTC"}"#);
        assert!(out.tool_calls[0].id.starts_with("call_"));
    }

    #[test]
    fn fenced_block_with_prose() {
        let req = req_with_tools(json!({"type": "function", "function": {"name": "get_time"}}));
        let text = "Happy to help!\n```json\n{\"tool_calls\":[{\"name\":\"get_time\",\
                    \"arguments\":{\"zone\":\"UTC\"}}]}\n```";
        let out = build(&req, text);
        assert_eq!(out.tool_calls[0].name, "get_time");
        assert_eq!(out.tool_calls[0].arguments_json, r#"{"zone":"UTC"}"#);
    }

    #[test]
    fn chat_completion_echo_shape() {
        let req = req_with_tools(json!("auto"));
        let text = r#"{"choices":[{"message":{"tool_calls":[
            {"id":"call_9","function":{"name":"get_date","arguments":"{}"}}]}}]}"#;
        let out = build(&req, text);
        assert_eq!(out.tool_calls[0].id, "call_9");
        assert_eq!(out.tool_calls[0].name, "get_date");
        assert_eq!(out.tool_calls[0].arguments_json, "{}");
    }

    #[test]
    fn responses_output_items() {
        let req = req_with_tools(json!("auto"));
        let text = r#"{"output":[
            {"type":"reasoning"},
            {"type":"function_call","call_id":"call_z","name":"get_time","arguments":"{\"zone\":\"CET\"}"}
        ]}"#;
        let out = build(&req, text);
        assert_eq!(out.tool_calls[0].id, "call_z");
        assert_eq!(out.tool_calls[0].arguments_json, r#"{"zone":"CET"}"#);
    }

    #[test]
    fn single_call_shape_nested_function() {
        let req = req_with_tools(json!("auto"));
        let out = build(&req, r#"{"function":{"name":"get_time","arguments":{"zone":"UTC"}}}"#);
        assert_eq!(out.tool_calls[0].name, "get_time");
    }

    #[test]
    fn undeclared_name_rejected_then_embedded_accepted() {
        let req = req_with_tools(json!("auto"));
        // first candidate names an undeclared tool; a later balanced region
        // carries the valid call
        let text = r#"{"tool_calls":[{"name":"rm_rf","arguments":{}}]} but really: {"name":"get_time","arguments":{}}"#;
        let out = build(&req, text);
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].name, "get_time");
    }

    #[test]
    fn function_mode_requires_matching_name() {
        let req = req_with_tools(json!({"type": "function", "function": {"name": "get_time"}}));
        let out = build(&req, r#"{"tool_calls":[{"name":"get_date","arguments":{}}]}"#);
        assert!(out.tool_calls.is_empty());
        let err = out.strict_tool_error.unwrap();
        assert!(err.contains("get_time"));
        assert_eq!(out.finish_reason, FinishReason::Stop);
        assert_eq!(out.content, None);
    }

    #[test]
    fn strict_required_with_plain_text() {
        let req = req_with_tools(json!("required"));
        let out = build(&req, "I cannot call tools.");
        assert!(out.strict_tool_error.is_some());
        assert!(out.tool_calls.is_empty());
    }

    #[test]
    fn auto_mode_falls_back_to_text() {
        let req = req_with_tools(json!("auto"));
        let out = build(&req, "Just a plain answer.");
        assert_eq!(out.content.as_deref(), Some("Just a plain answer."));
        assert_eq!(out.finish_reason, FinishReason::Stop);
        assert!(out.strict_tool_error.is_none());
    }

    #[test]
    fn extraction_disabled_without_tools() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let req = parse_chat(&body, &ProxyConfig::default()).unwrap();
        let out = build(&req, r#"{"tool_calls":[{"name":"get_time","arguments":{}}]}"#);
        // no tools declared: the JSON is just content
        assert!(out.tool_calls.is_empty());
        assert!(out.content.is_some());
    }

    #[test]
    fn malformed_arguments_repaired() {
        let req = req_with_tools(json!("auto"));
        // arguments is a string whose embedded JSON carries a raw newline
        let text = serde_json::to_string(&json!({
            "tool_calls": [{"name": "get_time", "arguments": "{\"diff\": \"a\nb\"}"}]
        }))
        .unwrap();
        let out = build(&req, &text);
        let parsed: Value =
            serde_json::from_str(&out.tool_calls[0].arguments_json).unwrap();
        assert_eq!(parsed["diff"], "a\nb");
    }

    #[test]
    fn content_normalization_with_json_object_format() {
        let body = json!({
            "messages": [{"role": "user", "content": "hi"}],
            "response_format": {"type": "json_object"},
        });
        let req = parse_chat(&body, &ProxyConfig::default()).unwrap();
        let out = build(&req, "Here:\n```json\n{ \"ok\" : true }\n```");
        assert_eq!(out.content.as_deref(), Some(r#"{"ok":true}"#));

        // an array is not type-compatible with json_object
        let out = build(&req, "[1,2,3]");
        assert_eq!(out.content.as_deref(), Some("[1,2,3]"));
    }
}
