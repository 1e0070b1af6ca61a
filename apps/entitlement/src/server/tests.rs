use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use super::build_router;
use crate::{
    Stores, build_state_with_stores,
    config::{Config, LogFormat},
    entitlement::tests::UnavailableLedger,
    ledger::{ArtifactCreatedMetadata, EventOrigin, UsageEvent, UsageMetadata},
    policy::PolicyLimits,
    webhook::{SIGNATURE_HEADER, TIMESTAMP_HEADER, sign_payload},
};

const WEBHOOK_SECRET: &str = "whsec_test";

fn test_config() -> Config {
    Config {
        service_name: "entitlement-test".to_string(),
        bind_addr: std::net::SocketAddr::from(([127, 0, 0, 1], 0)),
        build_sha: "test".to_string(),
        db_url: None,
        db_pool_size: 1,
        log_format: LogFormat::Text,
        webhook_secrets: HashMap::from([("stripe".to_string(), WEBHOOK_SECRET.to_string())]),
        webhook_tolerance_seconds: 300,
        progress_ttl_seconds: 4 * 60 * 60,
        progress_sweep_interval_seconds: 0,
        policy_limits: PolicyLimits::default(),
    }
}

fn test_router_with_stores(stores: Stores) -> axum::Router {
    build_router(build_state_with_stores(test_config(), stores))
}

fn test_router() -> axum::Router {
    test_router_with_stores(Stores::memory())
}

async fn response_json(response: axum::response::Response) -> Result<Value> {
    let collected = response.into_body().collect().await?;
    let bytes = collected.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn json_request(method: Method, uri: &str, body: &Value) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body)?))?)
}

fn check_body(identity: Value, resource_id: Option<&str>) -> Value {
    json!({
        "identity": identity,
        "event_type": "artifact_created",
        "metadata": { "source_url": "https://example.com/watch?v=1" },
        "resource_id": resource_id,
    })
}

fn webhook_request(event_id: &str, actor_id: &str, tier: &str) -> Result<Request<Body>> {
    let payload = json!({
        "id": event_id,
        "type": "subscription.updated",
        "data": { "actor_id": actor_id, "tier": tier },
    })
    .to_string();
    let timestamp = Utc::now().timestamp().to_string();
    let signature = sign_payload(WEBHOOK_SECRET, &timestamp, payload.as_bytes())
        .ok_or_else(|| anyhow::anyhow!("signature"))?;
    Ok(Request::builder()
        .method(Method::POST)
        .uri("/webhooks/stripe")
        .header(TIMESTAMP_HEADER, timestamp)
        .header(SIGNATURE_HEADER, format!("v1={signature}"))
        .body(Body::from(payload))?)
}

#[tokio::test]
async fn health_and_readiness_endpoints_are_available() -> Result<()> {
    let app = test_router();

    let health = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty())?)
        .await?;
    assert_eq!(health.status(), StatusCode::OK);
    assert!(health.headers().contains_key("x-request-id"));
    let health = response_json(health).await?;
    assert_eq!(health["service"], "entitlement-test");
    assert_eq!(health["store_driver"], "memory");

    let readiness = app
        .oneshot(Request::builder().uri("/readyz").body(Body::empty())?)
        .await?;
    assert_eq!(readiness.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn anonymous_check_allows_once_then_returns_429() -> Result<()> {
    let app = test_router();
    let identity = json!({ "kind": "anonymous", "fingerprint": "fp123" });

    let first = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/internal/v1/entitlements/check",
            &check_body(identity.clone(), None),
        )?)
        .await?;
    assert_eq!(first.status(), StatusCode::OK);
    let first = response_json(first).await?;
    assert_eq!(first["allowed"], true);
    assert_eq!(first["current"], 1);
    assert_eq!(first["limit"], 1);
    assert_eq!(first["tier"], "anonymous");

    let second = app
        .oneshot(json_request(
            Method::POST,
            "/internal/v1/entitlements/check",
            &check_body(identity, None),
        )?)
        .await?;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let second = response_json(second).await?;
    assert_eq!(second["error"], "limit_exceeded");
    assert_eq!(second["current"], 1);
    assert_eq!(second["limit"], 1);
    Ok(())
}

#[tokio::test]
async fn upgrade_webhook_lifts_free_limit() -> Result<()> {
    let stores = Stores::memory();
    let last_month = Utc::now() - Duration::days(40);
    for index in 0..3 {
        let event = UsageEvent::new(
            "u1",
            Some(&format!("old_{index}")),
            UsageMetadata::ArtifactCreated(ArtifactCreatedMetadata {
                source_url: "https://example.com/watch?v=old".to_string(),
                origin: EventOrigin::Organic,
            }),
            last_month,
        )?;
        assert!(stores.ledger.insert_if_absent(event).await?);
    }
    let app = test_router_with_stores(stores);
    let identity = json!({ "kind": "registered", "principal_id": "u1" });

    let denied = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/internal/v1/entitlements/check",
            &check_body(identity.clone(), None),
        )?)
        .await?;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    let denied = response_json(denied).await?;
    assert_eq!(denied["current"], 3);
    assert_eq!(denied["tier"], "free");

    let upgrade = app
        .clone()
        .oneshot(webhook_request("evt_1", "u1", "pro")?)
        .await?;
    assert_eq!(upgrade.status(), StatusCode::OK);
    assert_eq!(response_json(upgrade).await?["outcome"], "applied");

    let replay = app
        .clone()
        .oneshot(webhook_request("evt_1", "u1", "free")?)
        .await?;
    assert_eq!(replay.status(), StatusCode::OK);
    assert_eq!(response_json(replay).await?["outcome"], "skipped_duplicate");

    let allowed = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/internal/v1/entitlements/check",
            &check_body(identity, None),
        )?)
        .await?;
    assert_eq!(allowed.status(), StatusCode::OK);
    let allowed = response_json(allowed).await?;
    assert_eq!(allowed["allowed"], true);
    assert_eq!(allowed["current"], 1);
    assert_eq!(allowed["limit"], 25);
    assert_eq!(allowed["tier"], "pro");

    let usage = app
        .oneshot(
            Request::builder()
                .uri("/internal/v1/entitlements/usage?actor_id=u1")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(usage.status(), StatusCode::OK);
    let usage = response_json(usage).await?;
    assert_eq!(usage["remaining"], 24);
    Ok(())
}

#[tokio::test]
async fn webhook_with_bad_signature_is_unauthorized() -> Result<()> {
    let app = test_router();
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/webhooks/stripe")
                .header(TIMESTAMP_HEADER, Utc::now().timestamp().to_string())
                .header(SIGNATURE_HEADER, "v1=deadbeef")
                .body(Body::from(r#"{"id":"evt_9","data":{"actor_id":"u1","tier":"pro"}}"#))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response_json(response).await?;
    assert_eq!(body["reason_code"], "invalid_signature");
    Ok(())
}

#[tokio::test]
async fn webhook_with_unknown_tier_is_bad_request() -> Result<()> {
    let response = test_router()
        .oneshot(webhook_request("evt_2", "u1", "platinum")?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(response).await?["reason_code"], "unknown_tier");
    Ok(())
}

#[tokio::test]
async fn invalid_check_requests_are_rejected() -> Result<()> {
    let app = test_router();
    let reserved = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/internal/v1/entitlements/check",
            &check_body(json!({ "kind": "registered", "principal_id": "anon_x" }), None),
        )?)
        .await?;
    assert_eq!(reserved.status(), StatusCode::BAD_REQUEST);

    let unknown_event = app
        .oneshot(json_request(
            Method::POST,
            "/internal/v1/entitlements/check",
            &json!({
                "identity": { "kind": "registered", "principal_id": "u1" },
                "event_type": "login",
                "metadata": {},
            }),
        )?)
        .await?;
    assert_eq!(unknown_event.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(unknown_event).await?["error"], "invalid_request");
    Ok(())
}

#[tokio::test]
async fn replayed_resource_conflicts_across_actors() -> Result<()> {
    let app = test_router();
    let first = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/internal/v1/entitlements/check",
            &check_body(json!({ "kind": "registered", "principal_id": "u1" }), Some("sum_1")),
        )?)
        .await?;
    assert_eq!(first.status(), StatusCode::OK);

    let other = app
        .oneshot(json_request(
            Method::POST,
            "/internal/v1/entitlements/check",
            &check_body(json!({ "kind": "registered", "principal_id": "u2" }), Some("sum_1")),
        )?)
        .await?;
    assert_eq!(other.status(), StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn progress_round_trip_and_stale_updates() -> Result<()> {
    let app = test_router();

    let applied = app
        .clone()
        .oneshot(json_request(
            Method::PUT,
            "/internal/v1/progress/task_1",
            &json!({
                "stage": "running",
                "sequence": 2,
                "payload": { "percent": 40, "message": "transcribing" },
            }),
        )?)
        .await?;
    assert_eq!(applied.status(), StatusCode::OK);
    assert_eq!(response_json(applied).await?["outcome"], "applied");

    let stale = app
        .clone()
        .oneshot(json_request(
            Method::PUT,
            "/internal/v1/progress/task_1",
            &json!({
                "stage": "running",
                "sequence": 1,
                "payload": { "percent": 10, "message": "late" },
            }),
        )?)
        .await?;
    assert_eq!(stale.status(), StatusCode::OK);
    let stale = response_json(stale).await?;
    assert_eq!(stale["outcome"], "ignored");
    assert_eq!(stale["reason"], "stale_sequence");

    let read = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/progress/task_1")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(read.status(), StatusCode::OK);
    let read = response_json(read).await?;
    assert_eq!(read["stage"], "running");
    assert_eq!(read["payload"]["percent"], 40);
    assert!(read["ttl_remaining_seconds"].as_i64().unwrap_or_default() > 0);

    let deleted = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/internal/v1/progress/task_1")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let missing = app
        .oneshot(
            Request::builder()
                .uri("/api/progress/task_1")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn progress_rejects_out_of_range_percent() -> Result<()> {
    let response = test_router()
        .oneshot(json_request(
            Method::PUT,
            "/internal/v1/progress/task_2",
            &json!({
                "stage": "queued",
                "sequence": 1,
                "payload": { "percent": 150 },
            }),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn ledger_outage_fails_closed_with_503() -> Result<()> {
    let stores = Stores {
        ledger: Arc::new(UnavailableLedger),
        ..Stores::memory()
    };
    let app = test_router_with_stores(stores);

    let check = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/internal/v1/entitlements/check",
            &check_body(json!({ "kind": "registered", "principal_id": "u1" }), None),
        )?)
        .await?;
    assert_eq!(check.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response_json(check).await?["error"], "store_unavailable");

    let readiness = app
        .oneshot(Request::builder().uri("/readyz").body(Body::empty())?)
        .await?;
    assert_eq!(readiness.status(), StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}
