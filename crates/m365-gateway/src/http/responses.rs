use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::app::AppState;
use crate::pipeline::{error_response, responses_flow};

/// POST /v1/responses
pub async fn create_response(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    responses_flow::handle_create(state, headers, body).await
}

/// GET /v1/responses?limit=N
pub async fn list_responses(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let limit = params.get("limit").and_then(|s| s.parse::<i64>().ok());
    Json(responses_flow::list(&state, limit)).into_response()
}

/// GET /v1/responses/{id}
pub async fn get_response(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match responses_flow::retrieve(&state, &id) {
        Ok(body) => Json(body).into_response(),
        Err(err) => error_response(&err),
    }
}

/// DELETE /v1/responses/{id}
pub async fn delete_response(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match responses_flow::delete(&state, &id) {
        Ok(body) => Json(body).into_response(),
        Err(err) => error_response(&err),
    }
}
