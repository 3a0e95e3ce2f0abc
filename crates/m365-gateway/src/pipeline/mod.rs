//! Per-request orchestration: authorize → parse → resolve transport →
//! resolve/create conversation → execute turn → emit.
//!
//! Shared scaffolding lives here; the chat and responses flows drive it.

pub mod chat_flow;
pub mod responses_flow;
pub mod turn;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response};
use axum::Json;
use m365_core::{ProxyError, Result, Transport};
use m365_openai::request::CanonicalRequest;
use serde_json::Value;

use crate::app::AppState;

/// Everything the turn needs to know about where it is going.
#[derive(Debug)]
pub struct TurnScope {
    pub transport: Transport,
    /// `"<transport>:<conversation key>"`.
    pub scoped_key: String,
    pub conversation_id: String,
    /// The conversation was created by this request.
    pub created: bool,
    /// The empty-assistant recreate retry has been spent.
    pub(crate) empty_retry_used: bool,
    /// Completed substrate turns in this request; the first invocation on a
    /// freshly created conversation sets `isStartOfSession`.
    pub(crate) turns_completed: u32,
}

impl TurnScope {
    pub(crate) fn is_start_of_session(&self) -> bool {
        self.created && self.turns_completed == 0
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) async fn resolve_auth(state: &AppState, headers: &HeaderMap) -> Result<String> {
    let inbound = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state
        .tokens
        .resolve(inbound)
        .await
        .ok_or(ProxyError::MissingAuthorization)
}

pub(crate) fn parse_body(body: &[u8]) -> Result<Value> {
    serde_json::from_slice(body).map_err(|e| ProxyError::InvalidJson(e.to_string()))
}

/// Header `x-m365-transport`, then body `m365_transport` / `transport`, then
/// the config default.
pub(crate) fn resolve_transport(
    state: &AppState,
    headers: &HeaderMap,
    req: &CanonicalRequest,
) -> Result<Transport> {
    let requested = header_str(headers, "x-m365-transport")
        .map(String::from)
        .or_else(|| req.extensions.transport.clone());
    match requested {
        Some(value) => {
            Transport::parse(&value).ok_or(ProxyError::InvalidTransport(value))
        }
        None => Ok(state.default_transport),
    }
}

/// Resolve or create the conversation this turn posts into.
///
/// Order: explicit header/body id, previous-response link (responses only),
/// cache, create. The store is refreshed on every use.
pub(crate) async fn resolve_conversation(
    state: &AppState,
    headers: &HeaderMap,
    req: &CanonicalRequest,
    transport: Transport,
    auth: &str,
    previous_response_id: Option<&str>,
) -> Result<TurnScope> {
    let key = header_str(headers, "x-m365-conversation-key")
        .map(String::from)
        .or_else(|| req.extensions.conversation_key.clone())
        .unwrap_or_else(|| req.user_key.clone());
    let scoped_key = format!("{}:{}", transport.as_str(), key);

    let force_new = header_str(headers, "x-m365-new-conversation")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
        || req.extensions.new_conversation;
    let explicit_id = header_str(headers, "x-m365-conversation-id")
        .map(String::from)
        .or_else(|| req.extensions.conversation_id.clone());

    let mut created = false;
    let conversation_id = if force_new {
        created = true;
        create_conversation(state, transport, auth).await?
    } else if let Some(id) = explicit_id {
        id
    } else if let Some(prev) = previous_response_id {
        state
            .responses
            .try_get_conversation_link(prev)
            .ok_or_else(|| ProxyError::InvalidPreviousResponseId(prev.to_string()))?
    } else if let Some(id) = state.conversations.try_get(&scoped_key) {
        id
    } else {
        created = true;
        create_conversation(state, transport, auth).await?
    };

    if conversation_id.is_empty() {
        return Err(ProxyError::ConversationIdMissing);
    }
    state.conversations.set(&scoped_key, &conversation_id);

    Ok(TurnScope {
        transport,
        scoped_key,
        conversation_id,
        created,
        empty_retry_used: false,
        turns_completed: 0,
    })
}

pub(crate) async fn create_conversation(
    state: &AppState,
    transport: Transport,
    auth: &str,
) -> Result<String> {
    match transport {
        Transport::Graph => state
            .graph
            .create_conversation(auth)
            .await
            .map_err(map_graph),
        Transport::Substrate => Ok(state.substrate.create_conversation()),
    }
}

pub(crate) fn map_graph(err: m365_graph::GraphError) -> ProxyError {
    use m365_graph::GraphError;
    match err {
        GraphError::Api { status, message } => ProxyError::Graph { status, message },
        GraphError::Http(e) if e.is_timeout() => {
            ProxyError::Timeout("graph request timed out".to_string())
        }
        GraphError::Http(e) => ProxyError::Graph {
            status: 502,
            message: e.to_string(),
        },
        GraphError::Parse(message) => ProxyError::Graph {
            status: 502,
            message,
        },
    }
}

pub(crate) fn map_substrate(err: m365_substrate::SubstrateError) -> ProxyError {
    use m365_substrate::SubstrateError;
    match err {
        SubstrateError::Timeout(secs) => ProxyError::Timeout(format!(
            "substrate invocation timed out after {secs}s"
        )),
        other => ProxyError::Substrate {
            status: other.status(),
            message: other.to_string(),
        },
    }
}

pub(crate) fn error_response(err: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(err.body())).into_response()
}

/// Attach the `x-m365-*` headers every successful response carries.
pub(crate) fn with_headers(mut resp: Response, scope: &TurnScope) -> Response {
    let headers = resp.headers_mut();
    headers.insert(
        "x-m365-transport",
        HeaderValue::from_static(scope.transport.as_str()),
    );
    if let Ok(value) = HeaderValue::from_str(&scope.conversation_id) {
        headers.insert("x-m365-conversation-id", value);
    }
    if scope.created {
        headers.insert("x-m365-conversation-created", HeaderValue::from_static("true"));
    }
    resp
}

pub(crate) fn include_conversation_id<'a>(
    state: &AppState,
    scope: &'a TurnScope,
) -> Option<&'a str> {
    state
        .config
        .include_conversation_id_in_response_body
        .then_some(scope.conversation_id.as_str())
}

// ── SSE framing ──────────────────────────────────────────────────────────────

pub(crate) fn sse_json(value: &Value) -> Event {
    Event::default().data(value.to_string())
}

pub(crate) fn sse_named(name: &str, value: &Value) -> Event {
    Event::default().event(name).data(value.to_string())
}

pub(crate) fn sse_done() -> Event {
    Event::default().data("[DONE]")
}

/// Mid-stream failure: `event: error` then `data: [DONE]`.
pub(crate) fn sse_error(err: &ProxyError) -> Event {
    Event::default().event("error").data(err.body().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use m365_core::config::ProxyConfig;
    use m365_openai::request::parse_chat;
    use serde_json::json;

    fn state() -> AppState {
        AppState::new(ProxyConfig::default()).unwrap()
    }

    fn canonical(body: Value) -> CanonicalRequest {
        parse_chat(&body, &ProxyConfig::default()).unwrap()
    }

    #[test]
    fn malformed_json_maps_to_invalid_json() {
        let err = parse_body(b"{not json").unwrap_err();
        assert_eq!(err.code(), "invalid_json");
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn transport_header_beats_body_beats_config() {
        let state = state();
        let req = canonical(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "m365_transport": "substrate",
        }));

        let mut headers = HeaderMap::new();
        assert_eq!(
            resolve_transport(&state, &headers, &req).unwrap(),
            Transport::Substrate
        );

        headers.insert("x-m365-transport", "graph".parse().unwrap());
        assert_eq!(
            resolve_transport(&state, &headers, &req).unwrap(),
            Transport::Graph
        );

        let plain = canonical(json!({"messages": [{"role": "user", "content": "hi"}]}));
        let headers = HeaderMap::new();
        assert_eq!(
            resolve_transport(&state, &headers, &plain).unwrap(),
            state.default_transport
        );
    }

    #[test]
    fn unknown_transport_rejected() {
        let state = state();
        let req = canonical(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "transport": "teams",
        }));
        let err = resolve_transport(&state, &HeaderMap::new(), &req).unwrap_err();
        assert_eq!(err.code(), "invalid_transport");
    }

    #[tokio::test]
    async fn substrate_conversation_resolution_caches() {
        let state = state();
        let req = canonical(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "user": "Alice",
        }));
        let headers = HeaderMap::new();
        let scope = resolve_conversation(
            &state, &headers, &req, Transport::Substrate, "Bearer t", None,
        )
        .await
        .unwrap();
        assert!(scope.created);
        assert_eq!(scope.scoped_key, "substrate:Alice");

        // second resolution reuses the cached id
        let scope2 = resolve_conversation(
            &state, &headers, &req, Transport::Substrate, "Bearer t", None,
        )
        .await
        .unwrap();
        assert!(!scope2.created);
        assert_eq!(scope2.conversation_id, scope.conversation_id);
    }

    #[tokio::test]
    async fn explicit_id_wins_over_cache() {
        let state = state();
        let req = canonical(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "m365_conversation_id": "conv-explicit",
        }));
        state.conversations.set("substrate:default", "conv-cached");
        let scope = resolve_conversation(
            &state, &HeaderMap::new(), &req, Transport::Substrate, "Bearer t", None,
        )
        .await
        .unwrap();
        assert!(!scope.created);
        assert_eq!(scope.conversation_id, "conv-explicit");
        // explicit use refreshes the mapping
        assert_eq!(
            state.conversations.try_get("substrate:default"),
            Some("conv-explicit".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_previous_response_id_rejected() {
        let state = state();
        let req = canonical(json!({"messages": [{"role": "user", "content": "hi"}]}));
        let err = resolve_conversation(
            &state,
            &HeaderMap::new(),
            &req,
            Transport::Substrate,
            "Bearer t",
            Some("resp_unknown"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "invalid_previous_response_id");
    }

    #[tokio::test]
    async fn previous_response_link_resolves() {
        let state = state();
        let req = canonical(json!({"messages": [{"role": "user", "content": "hi"}]}));
        state.responses.set_conversation_link("resp_a", "conv_x");
        let scope = resolve_conversation(
            &state,
            &HeaderMap::new(),
            &req,
            Transport::Substrate,
            "Bearer t",
            Some("resp_a"),
        )
        .await
        .unwrap();
        assert!(!scope.created);
        assert_eq!(scope.conversation_id, "conv_x");
    }
}
