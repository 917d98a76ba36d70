//! HTTP API integration tests
//!
//! Exercise the router in-process with `tower::ServiceExt::oneshot`.

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use helpers::*;
use http_body_util::BodyExt;
use mta_audit::{build_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn test_app(db: &TestDb, client: ScriptedInferenceClient) -> Router {
    let runner = Arc::new(default_runner(&db.pool, Arc::new(client)));
    build_router(AppState::new(db.pool.clone(), runner))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// TC-HTTP-001: health reports module, uptime and inference configuration
#[tokio::test]
async fn tc_http_001_health() {
    let db = create_test_db().await;
    let app = test_app(&db, ScriptedInferenceClient::approving()).await;

    let (status, body) = send(app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "mta-audit");
    assert_eq!(body["inference_configured"], true);
    assert!(body["build"]["git_hash"].is_string());
}

/// TC-HTTP-002: health is degraded without an inference credential
#[tokio::test]
async fn tc_http_002_health_degraded_without_credential() {
    let db = create_test_db().await;
    let app = test_app(&db, ScriptedInferenceClient::approving().unconfigured()).await;

    let (_, body) = send(app, get("/health")).await;

    assert_eq!(body["status"], "degraded");
}

/// TC-HTTP-003: synchronous run returns the envelope with per-transaction results
#[tokio::test]
async fn tc_http_003_run_returns_envelope() {
    // Given: two transactions, the second violating a reject rule
    let db = create_test_db().await;
    seed_organization(&db.pool, 1, true).await;
    seed_rule(&db.pool, 1, 5, true).await;
    seed_transactions(&db.pool, 1, [1, 2]).await;
    let app = test_app(
        &db,
        ScriptedInferenceClient::approving().with(2, Script::Violations(vec![5])),
    )
    .await;

    // When: POST /audit/run
    let (status, body) = send(app, post_json("/audit/run", json!({ "organization_id": 1 }))).await;

    // Then: success envelope with counts, usage and results
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(body["queued_count"], 2);
    assert_eq!(body["counts"]["approved"], 1);
    assert_eq!(body["counts"]["rejected"], 1);
    assert_eq!(body["usage"]["total_units"], 2 * CALL_USAGE.total_units);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    let rejected = results.iter().find(|r| r["transaction_id"] == 2).unwrap();
    assert_eq!(rejected["outcome"], "REJECTED");
    assert_eq!(rejected["violations"][0]["rule_code"], "RULE-5");
}

/// TC-HTTP-004: run with zero rules reports the failed batch
#[tokio::test]
async fn tc_http_004_run_without_rules_reports_failure() {
    let db = create_test_db().await;
    seed_organization(&db.pool, 1, false).await;
    seed_transactions(&db.pool, 1, [1]).await;
    let app = test_app(&db, ScriptedInferenceClient::approving()).await;

    let (status, body) = send(app, post_json("/audit/run", json!({ "organization_id": 1 }))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["status"], "FAILED");
    assert!(body["error"].as_str().unwrap().contains("no active audit rules"));
}

/// TC-HTTP-005: enqueue for an unknown organization is 404
#[tokio::test]
async fn tc_http_005_enqueue_unknown_organization() {
    let db = create_test_db().await;
    let app = test_app(&db, ScriptedInferenceClient::approving()).await;

    let (status, body) = send(app, post_json("/audit/enqueue", json!({ "organization_id": 42 }))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

/// TC-HTTP-006: enqueue returns the handle, history lists the batch
#[tokio::test]
async fn tc_http_006_enqueue_then_history() {
    let db = create_test_db().await;
    seed_organization(&db.pool, 1, false).await;
    seed_transactions(&db.pool, 1, [1, 2, 3]).await;

    let app = test_app(&db, ScriptedInferenceClient::approving()).await;
    let (status, handle) = send(
        app.clone(),
        post_json("/audit/enqueue", json!({ "organization_id": 1, "transaction_ids": [1, 3] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(handle["queued_count"], 2);
    let batch_id = handle["batch_id"].as_i64().unwrap();

    let (status, history) = send(app.clone(), get("/audit/batches?organization_id=1&limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["batches"].as_array().unwrap().len(), 1);
    assert_eq!(history["batches"][0]["status"], "IN_PROGRESS");

    let (status, batch) = send(app, get(&format!("/audit/batches/{}", batch_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(batch["transaction_ids"], json!([1, 3]));
}

/// TC-HTTP-007: history validation and missing batch
#[tokio::test]
async fn tc_http_007_history_errors() {
    let db = create_test_db().await;
    let app = test_app(&db, ScriptedInferenceClient::approving()).await;

    let (status, body) = send(app.clone(), get("/audit/batches?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, _) = send(app, get("/audit/batches/999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// TC-HTTP-008: requeue requires ids
#[tokio::test]
async fn tc_http_008_requeue_requires_ids() {
    let db = create_test_db().await;
    seed_organization(&db.pool, 1, false).await;
    let app = test_app(&db, ScriptedInferenceClient::approving()).await;

    let (status, _) = send(
        app,
        post_json("/audit/requeue", json!({ "organization_id": 1, "transaction_ids": [] })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

/// TC-HTTP-009: drain without a body drains every organization
#[tokio::test]
async fn tc_http_009_drain_all() {
    let db = create_test_db().await;
    seed_organization(&db.pool, 1, false).await;
    seed_rule(&db.pool, 1, 1, true).await;
    seed_transactions(&db.pool, 1, [1]).await;
    let app = test_app(&db, ScriptedInferenceClient::approving()).await;

    let (status, _) = send(app.clone(), post_json("/audit/enqueue", json!({ "organization_id": 1 }))).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .method("POST")
        .uri("/audit/drain")
        .body(Body::empty())
        .unwrap();
    let (status, summary) = send(app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["skipped"], false);
    assert_eq!(summary["batches"][0]["status"], "COMPLETED");
    assert_eq!(audit_status(&db.pool, 1).await, "APPROVED");
}
