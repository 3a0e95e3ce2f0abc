//! Chat Completions end-to-end: buffered JSON, buffered SSE, and the two
//! live streaming paths.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use m365_core::{Result, Transport};
use m365_graph::{snapshot, sse as graph_sse};
use m365_openai::toolcall::AssistantResponse;
use m365_openai::{emit, request, DeltaTracker};
use serde_json::Value;
use tracing::info;

use crate::app::AppState;
use crate::pipeline::turn::{
    begin_substrate_stream, graph_payload, run_turn_with_policies, spawn_substrate_stream,
    LiveEvent,
};
use crate::pipeline::{
    error_response, include_conversation_id, map_graph, parse_body, resolve_auth,
    resolve_conversation, resolve_transport, sse_done, sse_error, sse_json, with_headers,
    TurnScope,
};

pub async fn handle(state: Arc<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match run(state, headers, body).await {
        Ok(resp) => resp,
        Err(err) => error_response(&err),
    }
}

async fn run(state: Arc<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response> {
    let auth = resolve_auth(&state, &headers).await?;
    let parsed = parse_body(&body)?;
    let req = request::parse_chat(&parsed, &state.config)?;
    let transport = resolve_transport(&state, &headers, &req)?;
    let mut scope =
        resolve_conversation(&state, &headers, &req, transport, &auth, None).await?;

    info!(
        transport = %scope.transport,
        stream = req.stream,
        buffered = req.must_buffer(),
        created = scope.created,
        "chat completion request"
    );

    if !req.stream {
        let assistant = run_turn_with_policies(&state, &auth, &req, &mut scope).await?;
        let body = emit::chat_completion_body(
            &emit::completion_id(),
            emit::now_unix(),
            &req.model,
            &assistant,
            include_conversation_id(&state, &scope),
        );
        return Ok(with_headers(Json(body).into_response(), &scope));
    }

    // tools and response formats need the whole text before anything can be
    // emitted, so those requests stream a canned sequence
    if req.must_buffer() {
        let assistant = run_turn_with_policies(&state, &auth, &req, &mut scope).await?;
        let resp = buffered_sse(&req.model, &assistant);
        return Ok(with_headers(resp, &scope));
    }

    match scope.transport {
        Transport::Graph => stream_graph(&state, &auth, &req, scope).await,
        Transport::Substrate => stream_substrate(state, auth, req, scope).await,
    }
}

/// Role chunk, one content or tool-calls chunk, the terminal chunk, then
/// `[DONE]`.
fn buffered_sse(model: &str, assistant: &AssistantResponse) -> Response {
    let id = emit::completion_id();
    let created = emit::now_unix();

    let mut chunks = vec![emit::role_chunk(&id, created, model)];
    if assistant.tool_calls.is_empty() {
        chunks.push(emit::content_chunk(
            &id,
            created,
            model,
            assistant.content.as_deref().unwrap_or_default(),
        ));
    } else {
        chunks.push(emit::tool_calls_chunk(&id, created, model, &assistant.tool_calls));
    }
    chunks.push(emit::finish_chunk(
        &id,
        created,
        model,
        assistant.finish_reason.as_str(),
    ));

    let mut events: Vec<_> = chunks.iter().map(sse_json).collect();
    events.push(sse_done());
    let stream = futures_util::stream::iter(events.into_iter().map(Ok::<_, Infallible>));
    Sse::new(stream).into_response()
}

/// Live Graph stream: each upstream event is a cumulative snapshot; only
/// true suffixes are forwarded.
async fn stream_graph(
    state: &AppState,
    auth: &str,
    req: &request::CanonicalRequest,
    scope: TurnScope,
) -> Result<Response> {
    let upstream = state
        .graph
        .chat_over_stream(auth, &scope.conversation_id, &graph_payload(req))
        .await
        .map_err(map_graph)?;

    let id = emit::completion_id();
    let created = emit::now_unix();
    let model = req.model.clone();
    // snapshots echo what was sent upstream — the full Context: block
    let prompt = req.prompt_with_context();

    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(sse_json(&emit::role_chunk(&id, created, &model)));
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
                        yield Ok(sse_json(&emit::content_chunk(&id, created, &model, &delta)));
                    }
                }
                Err(e) => {
                    yield Ok(sse_error(&map_graph(e)));
                    yield Ok(sse_done());
                    return;
                }
            }
        }
        yield Ok(sse_json(&emit::finish_chunk(&id, created, &model, "stop")));
        yield Ok(sse_done());
    };

    Ok(with_headers(Sse::new(stream).into_response(), &scope))
}

/// Live Substrate stream: cursor deltas forwarded as they arrive, with the
/// trailing suffix of the final snapshot emitted before the terminal chunk.
/// The connect/invoke phase is awaited first so pre-stream failures still
/// produce a plain JSON error body.
async fn stream_substrate(
    state: Arc<AppState>,
    auth: String,
    req: request::CanonicalRequest,
    scope: TurnScope,
) -> Result<Response> {
    let (token, active) = begin_substrate_stream(&state, &auth, &req, &scope).await?;

    let id = emit::completion_id();
    let created = emit::now_unix();
    let model = req.model.clone();
    let mut rx = spawn_substrate_stream(state, token, req, &scope, active);

    let stream = async_stream::stream! {
        let mut role_sent = false;
        let mut tracker = DeltaTracker::new();
        while let Some(event) = rx.recv().await {
            match event {
                LiveEvent::Delta(delta) => {
                    if !role_sent {
                        role_sent = true;
                        yield Ok::<_, Infallible>(sse_json(&emit::role_chunk(&id, created, &model)));
                    }
                    tracker.push_delta(&delta);
                    yield Ok(sse_json(&emit::content_chunk(&id, created, &model, &delta)));
                }
                LiveEvent::Done { text: final_text, .. } => {
                    if !role_sent {
                        role_sent = true;
                        yield Ok(sse_json(&emit::role_chunk(&id, created, &model)));
                    }
                    if let Some(trailing) = tracker.trailing(&final_text) {
                        yield Ok(sse_json(&emit::content_chunk(&id, created, &model, &trailing)));
                    }
                    yield Ok(sse_json(&emit::finish_chunk(&id, created, &model, "stop")));
                    yield Ok(sse_done());
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
