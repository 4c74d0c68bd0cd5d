pub mod backend;
pub mod config;
pub mod errors;
pub mod extract;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod relay;
pub mod state;
pub mod store;

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use backend::http::HttpTransport;
use config::AppConfig;
use store::{ConfigStore, JsonStore};
use tracing::info;

pub async fn build_state(config: &AppConfig) -> Result<state::AppState, std::io::Error> {
    let json = JsonStore::open(&config.data_dir)
        .await
        .map_err(std::io::Error::other)?;
    let store = ConfigStore::load(json, config.hosted_api_base.clone())
        .await
        .map_err(std::io::Error::other)?;
    let transport = HttpTransport::new(config.connect_timeout, config.relay.extraction_timeout)
        .map_err(std::io::Error::other)?;

    info!(
        hosted_api_base = %config.hosted_api_base,
        extraction_timeout_secs = config.relay.extraction_timeout.as_secs(),
        stream_idle_timeout_secs = config.relay.stream_idle_timeout.as_secs(),
        "upstream transport configured"
    );
    Ok(state::AppState::new(
        Arc::new(store),
        Arc::new(transport),
        config.relay,
    ))
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/api/models", get(handlers::list_models))
        .route("/api/generate", post(handlers::generate))
        .route(
            "/api/character-relationship-graph",
            post(handlers::relationship_graph),
        )
        .route("/api/knowledge-graph", post(handlers::knowledge_graph))
        .route("/api/set-api-key", post(handlers::set_api_key))
        .route("/api/api-key-status", get(handlers::api_key_status))
        .route(
            "/api/custom-apis",
            get(handlers::list_custom_apis).post(handlers::add_custom_api),
        )
        .route(
            "/api/custom-apis/:id",
            put(handlers::update_custom_api).delete(handlers::delete_custom_api),
        )
        .with_state(state)
}
