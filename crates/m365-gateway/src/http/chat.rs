use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use std::sync::Arc;

use crate::app::AppState;

/// POST /v1/chat/completions — body is taken raw so malformed JSON surfaces
/// as the OpenAI-shaped `invalid_json` error rather than a bare 422.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    crate::pipeline::chat_flow::handle(state, headers, body).await
}
