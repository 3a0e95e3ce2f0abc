//! Chat Completions bodies and SSE chunks.

use serde_json::Value;

use crate::toolcall::{AssistantResponse, ToolCallOut};

pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn tool_calls_json(calls: &[ToolCallOut]) -> Value {
    Value::Array(
        calls
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "type": "function",
                    "function": {"name": c.name, "arguments": c.arguments_json},
                })
            })
            .collect(),
    )
}

/// Buffered chat completion body.
pub fn chat_completion_body(
    id: &str,
    created: i64,
    model: &str,
    assistant: &AssistantResponse,
    conversation_id: Option<&str>,
) -> Value {
    let mut message = serde_json::json!({
        "role": "assistant",
        "content": assistant.content,
    });
    if !assistant.tool_calls.is_empty() {
        message["tool_calls"] = tool_calls_json(&assistant.tool_calls);
    }
    let mut body = serde_json::json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": assistant.finish_reason.as_str(),
        }],
    });
    if let Some(conv) = conversation_id {
        body["conversation_id"] = Value::String(conv.to_string());
    }
    body
}

/// One streaming chunk; `delta` holds only the fields that are set.
pub fn chunk(id: &str, created: i64, model: &str, delta: Value, finish: Option<&str>) -> Value {
    serde_json::json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }],
    })
}

pub fn role_chunk(id: &str, created: i64, model: &str) -> Value {
    chunk(id, created, model, serde_json::json!({"role": "assistant"}), None)
}

pub fn content_chunk(id: &str, created: i64, model: &str, text: &str) -> Value {
    chunk(id, created, model, serde_json::json!({"content": text}), None)
}

pub fn tool_calls_chunk(id: &str, created: i64, model: &str, calls: &[ToolCallOut]) -> Value {
    let indexed: Vec<Value> = calls
        .iter()
        .enumerate()
        .map(|(i, c)| {
            serde_json::json!({
                "index": i,
                "id": c.id,
                "type": "function",
                "function": {"name": c.name, "arguments": c.arguments_json},
            })
        })
        .collect();
    chunk(
        id,
        created,
        model,
        serde_json::json!({"tool_calls": indexed}),
        None,
    )
}

pub fn finish_chunk(id: &str, created: i64, model: &str, finish_reason: &str) -> Value {
    chunk(id, created, model, serde_json::json!({}), Some(finish_reason))
}

/// Single-model list for `GET /v1/models`.
pub fn models_body(model: &str, created: i64) -> Value {
    serde_json::json!({
        "object": "list",
        "data": [{
            "id": model,
            "object": "model",
            "created": created,
            "owned_by": "microsoft",
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolcall::FinishReason;

    fn text_response(s: &str) -> AssistantResponse {
        AssistantResponse::text(s.to_string())
    }

    #[test]
    fn completion_body_shape() {
        let body = chat_completion_body("chatcmpl-x", 1700000000, "m365-copilot",
            &text_response("Hello."), None);
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["index"], 0);
        assert_eq!(body["choices"][0]["message"]["content"], "Hello.");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert!(body.get("conversation_id").is_none());
    }

    #[test]
    fn tool_call_body_nulls_content() {
        let resp = AssistantResponse {
            content: None,
            tool_calls: vec![ToolCallOut {
                id: "call_1".into(),
                name: "get_time".into(),
                arguments_json: r#"{"zone":"UTC"}"#.into(),
            }],
            finish_reason: FinishReason::ToolCalls,
            strict_tool_error: None,
        };
        let body = chat_completion_body("chatcmpl-x", 0, "m", &resp, Some("conv-1"));
        let msg = &body["choices"][0]["message"];
        assert!(msg["content"].is_null());
        assert_eq!(msg["tool_calls"][0]["function"]["name"], "get_time");
        assert_eq!(msg["tool_calls"][0]["function"]["arguments"], r#"{"zone":"UTC"}"#);
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(body["conversation_id"], "conv-1");
    }

    #[test]
    fn chunk_shapes() {
        let role = role_chunk("c", 1, "m");
        assert_eq!(role["object"], "chat.completion.chunk");
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");
        assert!(role["choices"][0]["delta"].get("content").is_none());
        assert!(role["choices"][0]["finish_reason"].is_null());

        let content = content_chunk("c", 1, "m", "He");
        assert_eq!(content["choices"][0]["delta"]["content"], "He");

        let finish = finish_chunk("c", 1, "m", "stop");
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert_eq!(finish["choices"][0]["delta"], serde_json::json!({}));
    }

    #[test]
    fn ids_are_hex32() {
        let id = completion_id();
        assert!(id.starts_with("chatcmpl-"));
        assert_eq!(id.len(), "chatcmpl-".len() + 32);
    }
}
