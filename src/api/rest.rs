// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` and are strictly read-only: the
// dashboard observes the engine, it does not steer it. Snapshots stay
// stable even while analysis cycles are failing.
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::TradingEngine;
use crate::reasoning::ReasoningStore;
use crate::risk::RiskGovernor;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<TradingEngine>,
    pub governor: Arc<RiskGovernor>,
    pub store: Arc<ReasoningStore>,
}

/// Build the read-only router with CORS middleware.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/risk", get(risk))
        .route("/api/v1/reasoning/:agent", get(reasoning_summary))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.engine.status())
}

async fn risk(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.governor.summary())
}

async fn reasoning_summary(
    State(state): State<ApiState>,
    Path(agent): Path<String>,
) -> impl IntoResponse {
    let known = state.store.known_agents();
    if !known.iter().any(|a| a == &agent) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown agent: {agent}") })),
        )
            .into_response();
    }
    Json(state.store.summarize_agent(&agent)).into_response()
}
