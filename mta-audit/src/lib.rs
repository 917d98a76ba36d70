//! mta-audit library
//!
//! Audit orchestration for material transfer transactions: enqueue, drain
//! within a wall-clock budget, evaluate against organization rules through an
//! external inference service, reconcile statuses and record batch history.

pub mod api;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use mta_common::config::TomlConfig;

use crate::db::SqliteRuleRepository;
use crate::services::{
    AuditRunner, EvaluationEngine, InferenceClient, ObjectUrlSigner, RunnerSettings,
    HmacUrlSigner, TransactionAssembler,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub runner: Arc<AuditRunner>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(db: SqlitePool, runner: Arc<AuditRunner>) -> Self {
        Self {
            db,
            runner,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Wire the runner from configuration and an inference client
pub fn build_runner(db: SqlitePool, config: &TomlConfig, client: Arc<dyn InferenceClient>) -> AuditRunner {
    let signer: Arc<dyn ObjectUrlSigner> = Arc::new(HmacUrlSigner::new(
        config.storage.object_base_url.clone(),
        config.storage.signing_secret.clone(),
        config.storage.url_ttl_secs,
    ));

    AuditRunner::new(
        db.clone(),
        Arc::new(SqliteRuleRepository::new(db.clone())),
        TransactionAssembler::new(db, signer),
        EvaluationEngine::new(client, config.audit.failure_policy),
        RunnerSettings::from_config(&config.audit),
    )
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::audit_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
