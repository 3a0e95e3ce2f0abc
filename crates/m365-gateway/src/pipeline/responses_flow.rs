//! Responses API end-to-end: creation (buffered and streamed with the full
//! event scaffold), retrieval, listing, and deletion against the response
//! store.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use m365_core::{ProxyError, Result, Transport};
use m365_graph::{snapshot, sse as graph_sse};
use m365_openai::events::{self, EventSequencer, ResponseBodyParams};
use m365_openai::toolcall::AssistantResponse;
use m365_openai::{emit, responses, DeltaTracker};
use serde_json::Value;
use tracing::info;

use crate::app::AppState;
use crate::pipeline::turn::{
    begin_substrate_stream, graph_payload, run_turn_with_policies, spawn_substrate_stream,
    LiveEvent,
};
use crate::pipeline::{
    error_response, map_graph, parse_body, resolve_auth, resolve_conversation,
    resolve_transport, sse_done, sse_error, sse_named, with_headers, TurnScope,
};

/// Owned response-body context; streams outlive the request locals.
#[derive(Clone)]
struct BodyCtx {
    response_id: String,
    created_at: i64,
    model: String,
    previous_response_id: Option<String>,
    instructions: Option<String>,
    input_echo: Value,
    conversation_id_in_body: bool,
}

impl BodyCtx {
    fn params<'a>(&'a self, conversation_id: &'a str) -> ResponseBodyParams<'a> {
        ResponseBodyParams {
            response_id: &self.response_id,
            created_at: self.created_at,
            model: &self.model,
            previous_response_id: self.previous_response_id.as_deref(),
            instructions: self.instructions.as_deref(),
            input_echo: &self.input_echo,
            conversation_id: self.conversation_id_in_body.then_some(conversation_id),
        }
    }
}

pub async fn handle_create(state: Arc<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match run_create(state, headers, body).await {
        Ok(resp) => resp,
        Err(err) => error_response(&err),
    }
}

async fn run_create(state: Arc<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response> {
    let auth = resolve_auth(&state, &headers).await?;
    let parsed = parse_body(&body)?;
    let rreq = responses::parse_responses(&parsed, &state.config)?;
    let req = rreq.canonical.clone();
    let transport = resolve_transport(&state, &headers, &req)?;
    let mut scope = resolve_conversation(
        &state,
        &headers,
        &req,
        transport,
        &auth,
        rreq.previous_response_id.as_deref(),
    )
    .await?;

    info!(
        transport = %scope.transport,
        stream = req.stream,
        continuation = rreq.previous_response_id.is_some(),
        "responses request"
    );

    let ctx = BodyCtx {
        response_id: events::response_id(),
        created_at: emit::now_unix(),
        model: req.model.clone(),
        previous_response_id: rreq.previous_response_id.clone(),
        instructions: rreq.instructions.clone(),
        input_echo: rreq.input_echo.clone(),
        conversation_id_in_body: state.config.include_conversation_id_in_response_body,
    };

    if !req.stream {
        let assistant = run_turn_with_policies(&state, &auth, &req, &mut scope).await?;
        let items = events::output_items(&assistant);
        let body = events::response_body(&ctx.params(&scope.conversation_id), items);
        state
            .responses
            .set(&ctx.response_id, &body, Some(&scope.conversation_id));
        return Ok(with_headers(Json(body).into_response(), &scope));
    }

    if req.must_buffer() {
        let assistant = run_turn_with_policies(&state, &auth, &req, &mut scope).await?;
        let resp = buffered_event_stream(state.clone(), ctx, &assistant, &scope);
        return Ok(with_headers(resp, &scope));
    }

    match scope.transport {
        Transport::Graph => stream_graph(&state, &auth, &req, ctx, scope).await,
        Transport::Substrate => stream_substrate(state, auth, req, ctx, scope).await,
    }
}

/// Scaffold for a fully known result. Message output walks the text events;
/// function-call output adds each item in final form and skips them.
fn buffered_event_stream(
    state: Arc<AppState>,
    ctx: BodyCtx,
    assistant: &AssistantResponse,
    scope: &TurnScope,
) -> Response {
    let mut seq = EventSequencer::new();
    let skeleton = events::response_skeleton(&ctx.params(&scope.conversation_id));

    let mut emitted: Vec<(String, Value)> = vec![seq.created(&skeleton), seq.in_progress(&skeleton)];

    let items;
    if assistant.tool_calls.is_empty() {
        let text = assistant.content.clone().unwrap_or_default();
        let placeholder = seq.message_placeholder();
        emitted.push(seq.output_item_added(&placeholder));
        if !text.is_empty() {
            emitted.push(seq.text_delta(&text));
        }
        emitted.push(seq.text_done(&text));
        let item = seq.final_message_item(&text);
        emitted.push(seq.output_item_done(&item));
        items = vec![item];
    } else {
        items = events::output_items(assistant);
        for item in &items {
            emitted.push(seq.output_item_added(item));
            emitted.push(seq.output_item_done(item));
        }
    }

    let body = events::response_body(&ctx.params(&scope.conversation_id), items);
    emitted.push(seq.completed(&body));

    let response_id = ctx.response_id.clone();
    let conversation_id = scope.conversation_id.clone();
    let stream = async_stream::stream! {
        for (name, event) in emitted {
            yield Ok::<_, Infallible>(sse_named(&name, &event));
        }
        // stored only once the stream has fully drained
        state.responses.set(&response_id, &body, Some(&conversation_id));
    };
    Sse::new(stream).into_response()
}

async fn stream_graph(
    state: &Arc<AppState>,
    auth: &str,
    req: &m365_openai::CanonicalRequest,
    ctx: BodyCtx,
    scope: TurnScope,
) -> Result<Response> {
    let upstream = state
        .graph
        .chat_over_stream(auth, &scope.conversation_id, &graph_payload(req))
        .await
        .map_err(map_graph)?;

    // snapshots echo what was sent upstream — the full Context: block
    let prompt = req.prompt_with_context();
    let conversation_id = scope.conversation_id.clone();
    let store = state.clone();

    let stream = async_stream::stream! {
        let mut seq = EventSequencer::new();
        let skeleton = events::response_skeleton(&ctx.params(&conversation_id));
        for (name, event) in [
            seq.created(&skeleton),
            seq.in_progress(&skeleton),
        ] {
            yield Ok::<_, Infallible>(sse_named(&name, &event));
        }
        let placeholder = seq.message_placeholder();
        let (name, event) = seq.output_item_added(&placeholder);
        yield Ok(sse_named(&name, &event));

        let mut tracker = DeltaTracker::new();
        let mut data = Box::pin(graph_sse::data_stream(upstream));
        while let Some(item) = data.next().await {
            match item {
                Ok(payload) => {
                    if payload.trim() == "[DONE]" {
                        break;
                    }
                    let Ok(snapshot_json) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    let Some(latest) =
                        snapshot::latest_excluding_prompt(&snapshot_json, &prompt)
                    else {
                        continue;
                    };
                    if let Some(delta) = tracker.advance(&latest) {
                        let (name, event) = seq.text_delta(&delta);
                        yield Ok(sse_named(&name, &event));
                    }
                }
                Err(e) => {
                    yield Ok(sse_error(&map_graph(e)));
                    yield Ok(sse_done());
                    return;
                }
            }
        }

        let full = tracker.emitted().to_string();
        let (name, event) = seq.text_done(&full);
        yield Ok(sse_named(&name, &event));
        let item = seq.final_message_item(&full);
        let (name, event) = seq.output_item_done(&item);
        yield Ok(sse_named(&name, &event));
        let body = events::response_body(&ctx.params(&conversation_id), vec![item]);
        let (name, event) = seq.completed(&body);
        store.responses.set(&ctx.response_id, &body, Some(&conversation_id));
        yield Ok(sse_named(&name, &event));
    };

    Ok(with_headers(Sse::new(stream).into_response(), &scope))
}

/// The connect/invoke phase is awaited before the event scaffold starts so
/// pre-stream failures still produce a plain JSON error body.
async fn stream_substrate(
    state: Arc<AppState>,
    auth: String,
    req: m365_openai::CanonicalRequest,
    ctx: BodyCtx,
    scope: TurnScope,
) -> Result<Response> {
    let (token, active) = begin_substrate_stream(&state, &auth, &req, &scope).await?;

    let initial_conversation = scope.conversation_id.clone();
    let store = state.clone();
    let mut rx = spawn_substrate_stream(state, token, req, &scope, active);

    let stream = async_stream::stream! {
        let mut seq = EventSequencer::new();
        let skeleton = events::response_skeleton(&ctx.params(&initial_conversation));
        for (name, event) in [
            seq.created(&skeleton),
            seq.in_progress(&skeleton),
        ] {
            yield Ok::<_, Infallible>(sse_named(&name, &event));
        }
        let placeholder = seq.message_placeholder();
        let (name, event) = seq.output_item_added(&placeholder);
        yield Ok(sse_named(&name, &event));

        let mut tracker = DeltaTracker::new();
        while let Some(live) = rx.recv().await {
            match live {
                LiveEvent::Delta(delta) => {
                    tracker.push_delta(&delta);
                    let (name, event) = seq.text_delta(&delta);
                    yield Ok(sse_named(&name, &event));
                }
                LiveEvent::Done { text, conversation_id } => {
                    if let Some(trailing) = tracker.trailing(&text) {
                        let (name, event) = seq.text_delta(&trailing);
                        yield Ok(sse_named(&name, &event));
                    }
                    let full = tracker.emitted().to_string();
                    let (name, event) = seq.text_done(&full);
                    yield Ok(sse_named(&name, &event));
                    let item = seq.final_message_item(&full);
                    let (name, event) = seq.output_item_done(&item);
                    yield Ok(sse_named(&name, &event));
                    let body =
                        events::response_body(&ctx.params(&conversation_id), vec![item]);
                    let (name, event) = seq.completed(&body);
                    store.responses.set(&ctx.response_id, &body, Some(&conversation_id));
                    yield Ok(sse_named(&name, &event));
                    return;
                }
                LiveEvent::Failed(err) => {
                    yield Ok(sse_error(&err));
                    yield Ok(sse_done());
                    return;
                }
            }
        }
    };

    Ok(with_headers(Sse::new(stream).into_response(), &scope))
}

// ── store surface ────────────────────────────────────────────────────────────

pub fn retrieve(state: &AppState, id: &str) -> Result<Value> {
    if id.trim().is_empty() {
        return Err(ProxyError::MissingResponseId);
    }
    state
        .responses
        .try_get(id)
        .ok_or_else(|| ProxyError::ResponseNotFound(id.to_string()))
}

pub fn delete(state: &AppState, id: &str) -> Result<Value> {
    if id.trim().is_empty() {
        return Err(ProxyError::MissingResponseId);
    }
    if !state.responses.try_delete(id) {
        return Err(ProxyError::ResponseNotFound(id.to_string()));
    }
    Ok(serde_json::json!({
        "id": id,
        "object": "response",
        "deleted": true,
    }))
}

pub fn list(state: &AppState, limit: Option<i64>) -> Value {
    let page = state.responses.list(limit);
    serde_json::json!({
        "object": "list",
        "data": page.data,
        "first_id": page.first_id,
        "last_id": page.last_id,
        "has_more": page.has_more,
    })
}
