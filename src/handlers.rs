use std::{convert::Infallible, time::Instant};

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    backend::request,
    errors::AppError,
    extract::{self, GraphKind},
    models::{
        ApiKeyStatus, CustomApiConfig, CustomApiInput, GenerateBody, GraphBody, GraphResult,
        MessageResponse, ModelEntry, SetApiKeyBody, StreamEvent,
    },
    relay,
    state::AppState,
};

const HOSTED_KEY_PREFIX: &str = "sk-";

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateBody>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let _inflight = state.metrics.inflight_guard();

    let response = match start_generation(&state, payload).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/api/generate",
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn start_generation(
    state: &AppState,
    payload: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let generation = body.into_request().map_err(AppError::BadRequest)?;
    let target = state.config.resolve(&generation.model).await?;
    let upstream = request::build(&target, &generation.prompt, generation.temperature, true);

    info!(
        backend = target.label(),
        model = %target.model_name(),
        url = %upstream.url,
        temperature = generation.temperature,
        prompt_chars = generation.prompt.chars().count(),
        "generation stream accepted"
    );

    let metrics = state.metrics.clone();
    let outbound = relay::spawn(state.transport.clone(), upstream, state.relay).map(move |event| {
        metrics.observe_stream_event(event.kind());
        if let StreamEvent::Error(message) = &event {
            metrics.observe_upstream_error("stream");
            warn!(error = %message, "generation stream ended with error");
        }
        Ok::<Event, Infallible>(json_event(&event))
    });

    Ok(Sse::new(outbound)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(10)))
        .into_response())
}

pub async fn relationship_graph(
    State(state): State<AppState>,
    payload: Result<Json<GraphBody>, JsonRejection>,
) -> Response {
    graph_response(state, payload, GraphKind::Relationship, "/api/character-relationship-graph")
        .await
}

pub async fn knowledge_graph(
    State(state): State<AppState>,
    payload: Result<Json<GraphBody>, JsonRejection>,
) -> Response {
    graph_response(state, payload, GraphKind::Knowledge, "/api/knowledge-graph").await
}

async fn graph_response(
    state: AppState,
    payload: Result<Json<GraphBody>, JsonRejection>,
    kind: GraphKind,
    path: &'static str,
) -> Response {
    let started = Instant::now();
    let _inflight = state.metrics.inflight_guard();

    let response = match build_graph(&state, payload, kind).await {
        Ok(graph) => Json(graph).into_response(),
        Err(error) => error.into_response(),
    };

    state
        .metrics
        .observe_request(path, "POST", response.status().as_u16(), started.elapsed());
    response
}

async fn build_graph(
    state: &AppState,
    payload: Result<Json<GraphBody>, JsonRejection>,
    kind: GraphKind,
) -> Result<GraphResult, AppError> {
    let Json(body) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    extract::extract(
        state.transport.as_ref(),
        &state.config,
        &body.content,
        &body.model,
        kind,
    )
    .await
    .map_err(|error| {
        if matches!(
            error,
            extract::ExtractError::Upstream(_) | extract::ExtractError::UpstreamTimeout(_)
        ) {
            state.metrics.observe_upstream_error(kind.label());
        }
        AppError::from(error)
    })
}

pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelEntry>> {
    Json(state.config.model_catalog().await)
}

pub async fn set_api_key(
    State(state): State<AppState>,
    payload: Result<Json<SetApiKeyBody>, JsonRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    let Json(body) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let api_key = body
        .api_key
        .map(|key| key.trim().to_owned())
        .ok_or_else(|| AppError::BadRequest("api_key is required".to_owned()))?;
    if api_key.is_empty() {
        return Err(AppError::BadRequest("api_key must not be empty".to_owned()));
    }
    if !api_key.starts_with(HOSTED_KEY_PREFIX) {
        return Err(AppError::BadRequest(format!(
            "invalid API key format; hosted keys start with '{HOSTED_KEY_PREFIX}'"
        )));
    }

    state.config.set_hosted_key(api_key).await?;
    info!("hosted API key updated");
    Ok(Json(MessageResponse::new("API key saved")))
}

pub async fn api_key_status(State(state): State<AppState>) -> Json<ApiKeyStatus> {
    Json(state.config.hosted_key_status().await)
}

pub async fn list_custom_apis(State(state): State<AppState>) -> Json<Vec<CustomApiConfig>> {
    Json(state.config.custom_apis().await)
}

pub async fn add_custom_api(
    State(state): State<AppState>,
    payload: Result<Json<CustomApiInput>, JsonRejection>,
) -> Result<(StatusCode, Json<CustomApiConfig>), AppError> {
    let Json(input) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let config = input
        .into_config(Uuid::new_v4().to_string())
        .map_err(AppError::BadRequest)?;
    let created = state.config.add_custom_api(config).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_custom_api(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<CustomApiInput>, JsonRejection>,
) -> Result<Json<CustomApiConfig>, AppError> {
    let Json(patch) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    state
        .config
        .update_custom_api(&id, patch)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("custom API configuration not found: {id}")))
}

pub async fn delete_custom_api(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    let removed = state
        .config
        .delete_custom_api(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("custom API configuration not found: {id}")))?;
    Ok(Json(MessageResponse::new(format!(
        "custom API '{}' deleted",
        removed.name
    ))))
}

fn json_event<T: serde::Serialize>(payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(serialized) => Event::default().data(serialized),
        Err(error) => {
            let fallback = serde_json::json!({
                "error": format!("serialization error: {error}")
            });
            Event::default().data(fallback.to_string())
        }
    }
}
