use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::DateTime;
use http_body_util::BodyExt;
use quotaguard::clock::{ManualClock, SharedClock};
use quotaguard::config::Config;
use quotaguard::server::{build_state_with_clock, create_app};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const START: i64 = 1_700_000_000;

fn test_app() -> (Router, ManualClock) {
    let clock = ManualClock::new(DateTime::from_timestamp(START, 0).unwrap());
    let shared: SharedClock = Arc::new(clock.clone());
    let state = build_state_with_clock(Config::default(), shared);
    (create_app(state), clock)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    let request = match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _clock) = test_app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_check_allowed_request() {
    let (app, _clock) = test_app();
    let (status, body) = send(&app, "POST", "/subjects/42/check", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], true);
    assert_eq!(body["limits"]["hourly"], 1_000);
    assert!(body["limit_type_hit"].is_null());
}

#[tokio::test]
async fn test_burst_denial_returns_429_with_retry_after() {
    let (app, _clock) = test_app();
    // Free tier allows 100 requests per minute.
    for _ in 0..100 {
        let (status, _) = send(&app, "POST", "/subjects/42/check", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        send(&app, "POST", "/subjects/42/release", Some(json!({}))).await;
    }

    let request = Request::builder()
        .method("POST")
        .uri("/subjects/42/check")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = response.headers().get("Retry-After").unwrap();
    let secs: i64 = retry_after.to_str().unwrap().parse().unwrap();
    assert!(secs > 0 && secs <= 60);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["allowed"], false);
    assert_eq!(body["limit_type_hit"], "burst");
}

#[tokio::test]
async fn test_burst_window_resets_after_a_minute() {
    let (app, clock) = test_app();
    for _ in 0..100 {
        send(&app, "POST", "/subjects/42/check", Some(json!({}))).await;
        send(&app, "POST", "/subjects/42/release", Some(json!({}))).await;
    }
    let (status, _) = send(&app, "POST", "/subjects/42/check", Some(json!({}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    clock.advance_secs(60);
    let (status, body) = send(&app, "POST", "/subjects/42/check", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], true);
}

#[tokio::test]
async fn test_subject_status_reports_usage() {
    let (app, _clock) = test_app();
    send(&app, "POST", "/subjects/42/check", Some(json!({"cost": 2.0}))).await;

    let (status, body) = send(&app, "GET", "/subjects/42/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subject_id"], "42");
    assert_eq!(body["subscription_tier"], "free");
    assert_eq!(body["usage"]["hourly"]["total_cost"], 2.0);
    assert_eq!(body["usage"]["hourly"]["total_requests"], 1);
    assert_eq!(body["usage"]["concurrent"], 1);
    assert_eq!(body["limits"]["hourly"], 1_000);
}

#[tokio::test]
async fn test_exception_lifecycle_over_http() {
    let (app, _clock) = test_app();

    let (status, created) = send(
        &app,
        "POST",
        "/exceptions",
        Some(json!({
            "subject_id": "42",
            "dimension": "hourly",
            "effect": { "kind": "grant", "amount": 500 },
            "reason": "launch traffic",
            "created_by": "ops"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "active");
    let id = created["id"].as_str().unwrap().to_string();

    // The grant shows up in the subject's effective limits.
    let (_, body) = send(&app, "GET", "/subjects/42/status", None).await;
    assert_eq!(body["limits"]["hourly"], 1_500);

    let (status, body) = send(&app, "GET", &format!("/exceptions/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id.as_str());

    let (status, revoked) = send(
        &app,
        "POST",
        &format!("/exceptions/{}/revoke", id),
        Some(json!({ "reason": "abuse detected" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(revoked["status"], "revoked");

    // Revocation invalidates the cache immediately.
    let (_, body) = send(&app, "GET", "/subjects/42/status", None).await;
    assert_eq!(body["limits"]["hourly"], 1_000);

    // Terminal states are final.
    let (status, _) = send(
        &app,
        "POST",
        &format!("/exceptions/{}/revoke", id),
        Some(json!({ "reason": "again" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_list_exceptions_filters() {
    let (app, _clock) = test_app();
    for subject in ["a", "b"] {
        send(
            &app,
            "POST",
            "/exceptions",
            Some(json!({
                "subject_id": subject,
                "dimension": "burst",
                "effect": { "kind": "grant", "amount": 10 },
                "reason": "test",
                "created_by": "ops"
            })),
        )
        .await;
    }

    let (status, body) = send(&app, "GET", "/exceptions?subject_id=a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (_, body) = send(&app, "GET", "/exceptions?status=active", None).await;
    assert_eq!(body.as_array().unwrap().len(), 2);

    // Tier filter: move one subject off the free tier.
    send(
        &app,
        "PUT",
        "/subjects/a/subscription",
        Some(json!({ "tier": "premium" })),
    )
    .await;
    let (_, body) = send(&app, "GET", "/exceptions?tier=premium", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    let (_, body) = send(&app, "GET", "/exceptions?tier=free", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, "GET", "/exceptions?status=bogus", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_unknown_exception_is_404() {
    let (app, _clock) = test_app();
    let (status, body) = send(
        &app,
        "GET",
        "/exceptions/00000000-0000-0000-0000-000000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
}

#[tokio::test]
async fn test_create_exception_validation() {
    let (app, _clock) = test_app();
    let (status, _) = send(
        &app,
        "POST",
        "/exceptions",
        Some(json!({
            "subject_id": "42",
            "dimension": "hourly",
            "effect": { "kind": "grant", "amount": 500 },
            "reason": "",
            "created_by": "ops"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_update_subscription_tier() {
    let (app, _clock) = test_app();
    let (status, body) = send(
        &app,
        "PUT",
        "/subjects/42/subscription",
        Some(json!({ "tier": "premium", "overage_allowed": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "premium");
    assert_eq!(body["overage_allowed"], true);

    let (_, status_body) = send(&app, "GET", "/subjects/42/status", None).await;
    assert_eq!(status_body["limits"]["hourly"], 25_000);

    let (status, _) = send(
        &app,
        "PUT",
        "/subjects/42/subscription",
        Some(json!({ "tier": "platinum" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_top_consumers_ordering() {
    let (app, _clock) = test_app();
    send(&app, "POST", "/subjects/heavy/check", Some(json!({"cost": 5.0}))).await;
    send(&app, "POST", "/subjects/light/check", Some(json!({}))).await;

    let (status, body) = send(&app, "GET", "/stats/top-consumers?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    let consumers = body.as_array().unwrap();
    assert_eq!(consumers[0]["subject_id"], "heavy");
    assert_eq!(consumers[1]["subject_id"], "light");

    let (status, _) = send(&app, "GET", "/stats/top-consumers?period=bogus", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_current_overage_endpoint() {
    let (app, clock) = test_app();
    send(
        &app,
        "PUT",
        "/subjects/42/subscription",
        Some(json!({ "tier": "free", "overage_allowed": true })),
    )
    .await;
    // Accumulate 1100 cost in 50-cost slices, staying under the burst cap.
    for _ in 0..11 {
        for _ in 0..2 {
            let (status, _) =
                send(&app, "POST", "/subjects/42/check", Some(json!({"cost": 50.0}))).await;
            assert_eq!(status, StatusCode::OK);
            send(&app, "POST", "/subjects/42/release", Some(json!({}))).await;
        }
        clock.advance_secs(60);
    }

    let (status, body) = send(&app, "GET", "/subjects/42/overage", None).await;
    assert_eq!(status, StatusCode::OK);
    // 100 requests over the free hourly limit at 0.001 each.
    assert!((body["overage_cost"].as_f64().unwrap() - 0.1).abs() < 1e-9);
}

#[tokio::test]
async fn test_dashboard_stats() {
    let (app, _clock) = test_app();
    send(&app, "POST", "/subjects/a/check", Some(json!({}))).await;
    send(&app, "POST", "/subjects/b/check", Some(json!({}))).await;

    let (status, body) = send(&app, "GET", "/stats/dashboard", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_subjects"], 2);
    assert_eq!(body["requests_today"], 2);
    assert_eq!(body["subscriptions_by_tier"]["free"], 2);
}

#[tokio::test]
async fn test_retention_sweep_endpoint() {
    let (app, clock) = test_app();
    send(&app, "POST", "/subjects/42/check", Some(json!({}))).await;
    clock.advance_secs(31 * 24 * 3600);

    let (status, body) = send(&app, "POST", "/maintenance/retention?dry_run=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dry_run"], true);
    assert!(body["affected"].as_u64().unwrap() >= 1);

    let (_, body) = send(&app, "POST", "/maintenance/retention", None).await;
    assert_eq!(body["dry_run"], false);
    assert!(body["affected"].as_u64().unwrap() >= 1);

    // A second pass finds nothing left to delete.
    let (_, body) = send(&app, "POST", "/maintenance/retention", None).await;
    assert_eq!(body["affected"], 0);
}

#[tokio::test]
async fn test_expiry_sweep_endpoint() {
    let (app, clock) = test_app();
    let expires = DateTime::from_timestamp(START + 60, 0).unwrap();
    send(
        &app,
        "POST",
        "/exceptions",
        Some(json!({
            "subject_id": "42",
            "dimension": "hourly",
            "effect": { "kind": "grant", "amount": 100 },
            "expires_at": expires.to_rfc3339(),
            "reason": "short lived",
            "created_by": "ops"
        })),
    )
    .await;

    clock.advance_secs(120);
    let (status, body) = send(&app, "POST", "/maintenance/expiry", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["affected"], 1);
    assert_eq!(body["details"][0]["subject_id"], "42");

    let (_, body) = send(&app, "GET", "/exceptions?status=expired", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}
