//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

/// Build identification captured by build.rs
#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub git_hash: &'static str,
    pub built_at: &'static str,
    pub profile: &'static str,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when inference is not configured
    pub status: String,
    pub module: String,
    pub version: String,
    pub build: BuildInfo,
    pub uptime_seconds: u64,
    pub inference_configured: bool,
    /// Last error message if any (for diagnostics)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;
    let last_error = state.last_error.read().await.clone();
    let inference_configured = state.runner.is_configured();

    Json(HealthResponse {
        status: if inference_configured { "ok" } else { "degraded" }.to_string(),
        module: "mta-audit".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        build: BuildInfo {
            git_hash: env!("GIT_HASH"),
            built_at: env!("BUILD_TIMESTAMP"),
            profile: env!("BUILD_PROFILE"),
        },
        uptime_seconds,
        inference_configured,
        last_error,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
