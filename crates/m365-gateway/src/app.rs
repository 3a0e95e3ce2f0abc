use axum::{
    routing::{get, post},
    Router,
};
use m365_core::config::ProxyConfig;
use m365_core::Transport;
use m365_graph::GraphClient;
use m365_substrate::SubstrateClient;
use std::sync::Arc;

use crate::store::{ConversationStore, ResponseStore};
use crate::token::TokenProvider;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: ProxyConfig,
    pub default_transport: Transport,
    pub graph: GraphClient,
    pub substrate: SubstrateClient,
    pub conversations: ConversationStore,
    pub responses: ResponseStore,
    pub tokens: TokenProvider,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> anyhow::Result<Self> {
        let default_transport = Transport::parse(&config.transport)
            .ok_or_else(|| anyhow::anyhow!("unsupported transport in config: {}", config.transport))?;
        Ok(Self {
            default_transport,
            graph: GraphClient::new(&config),
            substrate: SubstrateClient::new(config.substrate.clone()),
            conversations: ConversationStore::new(config.conversation_ttl_minutes),
            responses: ResponseStore::new(config.conversation_ttl_minutes),
            tokens: TokenProvider::new(&config),
            config,
        })
    }
}

/// Assemble the full Axum router. Every API route is reachable under both
/// `/v1` and `/openai/v1`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/models", get(crate::http::models::models_handler))
        .route(
            "/chat/completions",
            post(crate::http::chat::chat_completions),
        )
        .route(
            "/responses",
            post(crate::http::responses::create_response)
                .get(crate::http::responses::list_responses),
        )
        .route(
            "/responses/{id}",
            get(crate::http::responses::get_response)
                .delete(crate::http::responses::delete_response),
        );

    Router::new()
        .route("/healthz", get(crate::http::health::health_handler))
        .nest("/v1", api.clone())
        .nest("/openai/v1", api)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
