use axum::extract::State;
use axum::Json;
use m365_openai::emit;
use serde_json::Value;
use std::sync::Arc;

use crate::app::AppState;

/// GET /v1/models — single-model list from the config default.
pub async fn models_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(emit::models_body(
        &state.config.default_model,
        emit::now_unix(),
    ))
}
