use std::sync::Arc;

use axum::{
    extract::State,
    http::{self, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::FallbackError;
use crate::fallback::FallbackOrchestrator;
use crate::types::{CompletionOptions, Message};

/// Body sent for any failed request. Provider details stay in the logs.
const GENERIC_ERROR: &str = "Request failed, please try again";

/// Shared state for the HTTP server.
pub struct AppState {
    pub orchestrator: Arc<FallbackOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<FallbackOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub prompt: String,
    #[serde(default)]
    pub language: String,
}

#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Deserialize)]
pub struct InstantRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Create the axum Router with all API routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(handle_chat))
        .route("/api/code", post(handle_code))
        .route("/api/image", post(handle_image))
        .route("/api/instant", post(handle_instant))
        .route("/api/providers/status", get(handle_status))
        .route("/api/providers/health", get(handle_provider_health))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
                .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION]),
        )
        .with_state(state)
}

fn error_response(status: StatusCode) -> Response {
    (status, Json(serde_json::json!({ "error": GENERIC_ERROR }))).into_response()
}

fn fallback_error_response(route: &str, err: FallbackError) -> Response {
    error!("{} failed: {}", route, err);
    let status = match err {
        FallbackError::NoProvidersAvailable => StatusCode::SERVICE_UNAVAILABLE,
        FallbackError::AllProvidersFailed { .. } | FallbackError::AllKeysFailed { .. } => {
            StatusCode::BAD_GATEWAY
        }
    };
    error_response(status)
}

/// POST /api/chat
async fn handle_chat(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> Response {
    if req.messages.iter().all(|m| m.content.trim().is_empty()) {
        return error_response(StatusCode::BAD_REQUEST);
    }
    info!("Chat request: {} messages, model={:?}", req.messages.len(), req.model);

    let options = CompletionOptions {
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        ..CompletionOptions::default()
    };
    match state
        .orchestrator
        .ai_completion(req.messages, req.model.as_deref(), options)
        .await
    {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => fallback_error_response("chat", e),
    }
}

/// POST /api/code
async fn handle_code(State(state): State<Arc<AppState>>, Json(req): Json<CodeRequest>) -> Response {
    if req.prompt.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST);
    }
    match state
        .orchestrator
        .generate_code_with_fallback(&req.prompt, &req.language)
        .await
    {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => fallback_error_response("code", e),
    }
}

/// POST /api/image
async fn handle_image(State(state): State<Arc<AppState>>, Json(req): Json<ImageRequest>) -> Response {
    if req.prompt.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST);
    }
    match state
        .orchestrator
        .generate_image_with_fallback(&req.prompt, req.width, req.height)
        .await
    {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => fallback_error_response("image", e),
    }
}

/// POST /api/instant
async fn handle_instant(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InstantRequest>,
) -> Response {
    if req.prompt.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST);
    }
    match state.orchestrator.instant_completion(&req.prompt).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => fallback_error_response("instant", e),
    }
}

/// GET /api/providers/status
async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "providers": state.orchestrator.provider_status() }))
}

/// GET /api/providers/health
async fn handle_provider_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.health_check().await)
}

/// GET /health
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
    })
}

/// Start the HTTP server on the given address.
pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}
