// End-to-end translation shapes: parsed request → assistant response →
// emitted OpenAI bodies. These pin the externally visible contract.

use m365_core::config::ProxyConfig;
use m365_openai::events::{self, EventSequencer, ResponseBodyParams};
use m365_openai::toolcall::{self, FinishReason};
use m365_openai::{emit, request, DeltaTracker};
use serde_json::{json, Value};

fn cfg() -> ProxyConfig {
    ProxyConfig::default()
}

#[test]
fn tool_call_round_trip_to_chat_body() {
    let body = json!({
        "model": "m365-copilot",
        "messages": [{"role": "user", "content": "what time is it in UTC?"}],
        "tools": [{"type": "function", "function": {
            "name": "get_time",
            "parameters": {"type": "object", "properties": {"zone": {"type": "string"}}},
        }}],
        "tool_choice": {"type": "function", "function": {"name": "get_time"}},
    });
    let req = request::parse_chat(&body, &cfg()).unwrap();

    let upstream_text = "Sure.\n```json\n{\"tool_calls\":[{\"name\":\"get_time\",\
                         \"arguments\":{\"zone\":\"UTC\"}}]}\n```";
    let assistant = toolcall::build(&req, upstream_text);
    assert_eq!(assistant.finish_reason, FinishReason::ToolCalls);

    let out = emit::chat_completion_body("chatcmpl-t", 1, "m365-copilot", &assistant, None);
    let message = &out["choices"][0]["message"];
    // finish_reason = tool_calls implies content is null
    assert!(message["content"].is_null());
    let call = &message["tool_calls"][0];
    assert_eq!(call["function"]["name"], "get_time");
    // arguments must always parse as JSON
    let args: Value =
        serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
    assert_eq!(args["zone"], "UTC");
    assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
}

#[test]
fn strict_function_violation_names_the_function() {
    let body = json!({
        "messages": [{"role": "user", "content": "hi"}],
        "tools": [{"type": "function", "function": {"name": "get_time"}}],
        "tool_choice": {"type": "function", "function": {"name": "get_time"}},
    });
    let req = request::parse_chat(&body, &cfg()).unwrap();
    let assistant = toolcall::build(&req, "I cannot call tools.");
    let err = assistant.strict_tool_error.unwrap();
    assert!(err.contains("get_time"));
    assert!(assistant.tool_calls.is_empty());
    assert!(assistant.content.is_none());
}

#[test]
fn streamed_deltas_concatenate_to_buffered_content() {
    // prefix-extending snapshots, as the Graph stream sends them
    let snapshots = ["Hel", "Hello", "Hello there", "Hello there."];
    let mut tracker = DeltaTracker::new();
    let mut streamed = String::new();
    for s in snapshots {
        if let Some(delta) = tracker.advance(s) {
            streamed.push_str(&delta);
        }
    }
    assert_eq!(streamed, "Hello there.");
    assert_eq!(streamed, *snapshots.last().unwrap());
}

#[test]
fn responses_scaffold_skips_text_events_for_function_calls() {
    let body = json!({
        "input": "call the tool",
        "tools": [{"type": "function", "function": {"name": "get_time"}}],
        "tool_choice": "required",
    });
    let rreq = m365_openai::responses::parse_responses(&body, &cfg()).unwrap();
    let assistant = toolcall::build(
        &rreq.canonical,
        r#"{"tool_calls":[{"name":"get_time","arguments":{}}]}"#,
    );
    let items = events::output_items(&assistant);
    assert_eq!(items[0]["type"], "function_call");

    let input = json!("call the tool");
    let params = ResponseBodyParams {
        response_id: "resp_t",
        created_at: 1,
        model: "m365-copilot",
        previous_response_id: None,
        instructions: None,
        input_echo: &input,
        conversation_id: None,
    };
    let skeleton = events::response_skeleton(&params);
    let full = events::response_body(&params, items.clone());

    let mut seq = EventSequencer::new();
    let mut names = vec![
        seq.created(&skeleton).0,
        seq.in_progress(&skeleton).0,
    ];
    for item in &items {
        names.push(seq.output_item_added(item).0);
        names.push(seq.output_item_done(item).0);
    }
    names.push(seq.completed(&full).0);

    assert_eq!(
        names,
        vec![
            "response.created",
            "response.in_progress",
            "response.output_item.added",
            "response.output_item.done",
            "response.completed",
        ]
    );
    assert_eq!(full["output"][0]["call_id"], items[0]["call_id"]);
    assert_eq!(full["output_text"], "");
}

#[test]
fn responses_body_round_trips_message_text() {
    let body = json!({"input": "Say hello"});
    let rreq = m365_openai::responses::parse_responses(&body, &cfg()).unwrap();
    let assistant = toolcall::build(&rreq.canonical, "Hello.");
    let items = events::output_items(&assistant);
    let input = rreq.input_echo.clone();
    let params = ResponseBodyParams {
        response_id: "resp_r",
        created_at: 2,
        model: "m365-copilot",
        previous_response_id: None,
        instructions: None,
        input_echo: &input,
        conversation_id: None,
    };
    let out = events::response_body(&params, items);
    assert_eq!(out["object"], "response");
    assert_eq!(out["output"][0]["type"], "message");
    assert_eq!(out["output"][0]["content"][0]["text"], "Hello.");
    assert_eq!(out["output_text"], "Hello.");
}
