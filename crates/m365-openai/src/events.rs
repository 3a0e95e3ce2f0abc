//! Responses API output items, response bodies, and the streamed event
//! sequence.
//!
//! Every response streams the same scaffold: created → in_progress →
//! output_item.added → text deltas → output_text.done → output_item.done →
//! completed. Function-call output skips the two text events; the item is
//! added already in final form.

use serde_json::Value;

use crate::toolcall::AssistantResponse;

pub fn response_id() -> String {
    format!("resp_{}", uuid::Uuid::new_v4().simple())
}

fn message_item_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

fn function_item_id() -> String {
    format!("fc_{}", uuid::Uuid::new_v4().simple())
}

/// Final output items for a completed turn.
pub fn output_items(assistant: &AssistantResponse) -> Vec<Value> {
    if !assistant.tool_calls.is_empty() {
        return assistant
            .tool_calls
            .iter()
            .map(|c| {
                serde_json::json!({
                    "type": "function_call",
                    "id": function_item_id(),
                    "call_id": c.id,
                    "name": c.name,
                    "arguments": c.arguments_json,
                    "status": "completed",
                })
            })
            .collect();
    }
    vec![serde_json::json!({
        "type": "message",
        "id": message_item_id(),
        "role": "assistant",
        "status": "completed",
        "content": [{
            "type": "output_text",
            "text": assistant.content.clone().unwrap_or_default(),
            "annotations": [],
        }],
    })]
}

/// Concatenated text of all message items.
pub fn output_text(items: &[Value]) -> String {
    let mut out = String::new();
    for item in items {
        if item.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        if let Some(parts) = item.get("content").and_then(Value::as_array) {
            for part in parts {
                if let Some(t) = part.get("text").and_then(Value::as_str) {
                    out.push_str(t);
                }
            }
        }
    }
    out
}

pub struct ResponseBodyParams<'a> {
    pub response_id: &'a str,
    pub created_at: i64,
    pub model: &'a str,
    pub previous_response_id: Option<&'a str>,
    pub instructions: Option<&'a str>,
    pub input_echo: &'a Value,
    pub conversation_id: Option<&'a str>,
}

/// Full response object, `status: completed`.
pub fn response_body(p: &ResponseBodyParams<'_>, items: Vec<Value>) -> Value {
    let text = output_text(&items);
    let mut body = serde_json::json!({
        "id": p.response_id,
        "object": "response",
        "created_at": p.created_at,
        "status": "completed",
        "model": p.model,
        "output": items,
        "output_text": text,
        "previous_response_id": p.previous_response_id,
        "instructions": p.instructions,
        "input": p.input_echo,
    });
    if let Some(conv) = p.conversation_id {
        body["conversation_id"] = Value::String(conv.to_string());
    }
    body
}

/// The same object before any output exists, `status: in_progress`.
pub fn response_skeleton(p: &ResponseBodyParams<'_>) -> Value {
    serde_json::json!({
        "id": p.response_id,
        "object": "response",
        "created_at": p.created_at,
        "status": "in_progress",
        "model": p.model,
        "output": [],
        "previous_response_id": p.previous_response_id,
        "instructions": p.instructions,
        "input": p.input_echo,
    })
}

/// Emits the event scaffold in order, tagging each with a sequence number.
/// One sequencer per streamed response.
pub struct EventSequencer {
    item_id: String,
    seq: u64,
}

impl EventSequencer {
    pub fn new() -> Self {
        Self {
            item_id: message_item_id(),
            seq: 0,
        }
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    fn tag(&mut self, mut event: Value) -> (String, Value) {
        event["sequence_number"] = Value::from(self.seq);
        self.seq += 1;
        let name = event["type"].as_str().unwrap_or_default().to_string();
        (name, event)
    }

    pub fn created(&mut self, skeleton: &Value) -> (String, Value) {
        self.tag(serde_json::json!({"type": "response.created", "response": skeleton}))
    }

    pub fn in_progress(&mut self, skeleton: &Value) -> (String, Value) {
        self.tag(serde_json::json!({"type": "response.in_progress", "response": skeleton}))
    }

    /// Message items are added as an empty placeholder; function-call items
    /// are passed in final form.
    pub fn output_item_added(&mut self, item: &Value) -> (String, Value) {
        self.tag(serde_json::json!({
            "type": "response.output_item.added",
            "output_index": 0,
            "item": item,
        }))
    }

    pub fn message_placeholder(&self) -> Value {
        serde_json::json!({
            "type": "message",
            "id": self.item_id,
            "role": "assistant",
            "status": "in_progress",
            "content": [],
        })
    }

    /// Completed form of the placeholder, carrying the same item id.
    pub fn final_message_item(&self, text: &str) -> Value {
        serde_json::json!({
            "type": "message",
            "id": self.item_id,
            "role": "assistant",
            "status": "completed",
            "content": [{
                "type": "output_text",
                "text": text,
                "annotations": [],
            }],
        })
    }

    pub fn text_delta(&mut self, delta: &str) -> (String, Value) {
        self.tag(serde_json::json!({
            "type": "response.output_text.delta",
            "item_id": self.item_id,
            "output_index": 0,
            "content_index": 0,
            "delta": delta,
        }))
    }

    pub fn text_done(&mut self, full_text: &str) -> (String, Value) {
        self.tag(serde_json::json!({
            "type": "response.output_text.done",
            "item_id": self.item_id,
            "output_index": 0,
            "content_index": 0,
            "text": full_text,
        }))
    }

    pub fn output_item_done(&mut self, item: &Value) -> (String, Value) {
        self.tag(serde_json::json!({
            "type": "response.output_item.done",
            "output_index": 0,
            "item": item,
        }))
    }

    pub fn completed(&mut self, body: &Value) -> (String, Value) {
        self.tag(serde_json::json!({"type": "response.completed", "response": body}))
    }
}

impl Default for EventSequencer {
    fn default() -> Self {
        Self::new()
    }
}
