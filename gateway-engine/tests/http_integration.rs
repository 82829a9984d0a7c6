//! Integration tests for the HTTP adapter.
//!
//! These tests drive the Axum router directly with `oneshot` over an
//! in-memory SQLite store.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use gateway_engine::{GatewayConfig, PaymentEngine, RecordingAlertSink, inbound::HttpServer};
use gateway_repo::SqliteRepo;

/// Helper to create a test router over a fresh database.
async fn create_test_app() -> axum::Router {
    let config = GatewayConfig::with_database_url("sqlite::memory:").unwrap();
    let repo = SqliteRepo::new(&config.database.url).await.unwrap();
    let engine = PaymentEngine::new(Arc::new(repo), &config, Arc::new(RecordingAlertSink::new()));
    HttpServer::new(engine).router()
}

fn payment_body(key: &str, amount: i64) -> Value {
    json!({
        "idempotencyKey": key,
        "amount": amount,
        "currency": "USD",
        "sourceAccount": "acct-source-1111",
        "destAccount": "acct-dest-2222"
    })
}

fn post_json(uri: &str, body: String) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Sends a request and returns the status with the parsed JSON body.
async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health() {
    let app = create_test_app().await;
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_submit_then_retry_returns_same_transaction() {
    let app = create_test_app().await;

    let (status, first) = send(
        &app,
        post_json("/api/payments", payment_body("abc", 1000).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["status"], "authorized");

    let (status, retry) = send(
        &app,
        post_json("/api/payments", payment_body("abc", 1000).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retry["transactionId"], first["transactionId"]);
}

#[tokio::test]
async fn test_reused_key_with_different_payload_conflicts() {
    let app = create_test_app().await;
    send(
        &app,
        post_json("/api/payments", payment_body("abc", 1000).to_string()),
    )
    .await;

    let (status, body) = send(
        &app,
        post_json("/api/payments", payment_body("abc", 2000).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "idempotency_conflict");
    assert_eq!(body["code"], 409);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let app = create_test_app().await;

    let (status, body) = send(
        &app,
        post_json("/api/payments", payment_body("neg", -5).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation_error");

    let (status, body) = send(&app, post_json("/api/payments", "{not json".into())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation_error");

    let mut unknown_currency = payment_body("cur", 100);
    unknown_currency["currency"] = json!("usd");
    let (status, _) = send(
        &app,
        post_json("/api/payments", unknown_currency.to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_masks_accounts() {
    let app = create_test_app().await;
    let (_, created) = send(
        &app,
        post_json("/api/payments", payment_body("mask", 300).to_string()),
    )
    .await;
    let id = created["transactionId"].as_str().unwrap();

    let (status, body) = send(&app, get(&format!("/api/payments/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sourceAccount"], "****1111");
    assert_eq!(body["destAccount"], "****2222");
    assert_eq!(body["amount"], 300);
    assert!(!body.to_string().contains("acct-source"));
}

#[tokio::test]
async fn test_unknown_transaction_is_404() {
    let app = create_test_app().await;
    let (status, body) = send(
        &app,
        get("/api/payments/00000000-0000-4000-8000-000000000000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn test_capture_after_void_is_conflict() {
    let app = create_test_app().await;
    let (_, created) = send(
        &app,
        post_json("/api/payments", payment_body("void-me", 800).to_string()),
    )
    .await;
    let id = created["transactionId"].as_str().unwrap();

    let (status, voided) = send(&app, post_empty(&format!("/api/payments/{id}/void"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(voided["status"], "voided");

    let (status, body) = send(&app, post_empty(&format!("/api/payments/{id}/capture"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "invalid_transition");
}

#[tokio::test]
async fn test_refund_of_unsettled_payment_is_conflict() {
    let app = create_test_app().await;
    let (_, created) = send(
        &app,
        post_json("/api/payments", payment_body("refund-early", 800).to_string()),
    )
    .await;
    let id = created["transactionId"].as_str().unwrap();

    let (status, body) = send(&app, post_empty(&format!("/api/payments/{id}/refund"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "invalid_transition");

    let (_, fetched) = send(&app, get(&format!("/api/payments/{id}"))).await;
    assert_eq!(fetched["status"], "authorized");
}
