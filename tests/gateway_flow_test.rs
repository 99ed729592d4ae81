//! End-to-end gateway decision tests: real router, captured event sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header::LOCATION, Request, StatusCode},
    Router,
};
use chrono::Utc;
use tower::ServiceExt;

use naglfar::config::Config;
use naglfar::error::AppResult;
use naglfar::events::{Action, Event, EventSink, Status};
use naglfar::gateway::{self, GatewayState};
use naglfar::token::codec;

const SECRET: &str = "naglfar-test-secret";

/// Event sink that records instead of publishing.
#[derive(Default)]
struct CapturingSink {
    events: Mutex<Vec<Event>>,
}

impl CapturingSink {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for CapturingSink {
    async fn publish(&self, event: &Event) -> AppResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn test_gateway() -> (Router, Arc<CapturingSink>) {
    let sink = Arc::new(CapturingSink::default());
    let state = GatewayState::new(Config::for_tests(SECRET), sink.clone());
    (gateway::router(state), sink)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_with_token(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("auth_token", token)
        .body(Body::empty())
        .unwrap()
}

fn valid_token(tenant: &str, user_id: i64) -> String {
    codec::encode_post_auth(
        tenant,
        user_id,
        Utc::now() + chrono::Duration::minutes(5),
        SECRET,
    )
    .unwrap()
}

#[tokio::test]
async fn test_health_bypass_emits_no_events() {
    let (app, sink) = test_gateway();

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(sink.events().is_empty());
    assert!(response.headers().get("e_token").is_none());
}

#[tokio::test]
async fn test_unauthenticated_request_redirects_with_fresh_token() {
    let (app, sink) = test_gateway();

    let response = app
        .oneshot(get("/api/v1/store-1/books?page=2"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);

    let location = response
        .headers()
        .get(LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(location.starts_with("http://auth.test/api/v1/auth/?"));
    assert!(location.contains("return_url="));
    assert!(location.contains("e_token="));
    assert!(location.contains("%2Fapi%2Fv1%2Fstore-1%2Fbooks"));

    // The minted pre-auth token rides along as a response header
    let e_token = response
        .headers()
        .get("e_token")
        .unwrap()
        .to_str()
        .unwrap();
    let claims = codec::decode_pre_auth(e_token).unwrap();
    assert_eq!(claims.tenant_id, "store-1");
    assert!(claims.expiry().unwrap() > Utc::now());

    assert!(response.headers().get("session_id").is_some());

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, Action::TokenIssued);
    assert_eq!(events[0].status, None);
    assert_eq!(events[0].tenant_id.as_deref(), Some("store-1"));
    assert_eq!(events[0].path, "/api/v1/store-1/books");
    assert_eq!(events[0].query.as_deref(), Some("page=2"));
    assert!(events[0].session_id.is_some());
}

#[tokio::test]
async fn test_every_unauthenticated_request_gets_a_distinct_token() {
    let (app, _sink) = test_gateway();

    let first = app
        .clone()
        .oneshot(get("/api/v1/store-1/books"))
        .await
        .unwrap();
    // Pre-auth expiries carry microsecond precision; any measurable gap
    // makes the payloads differ.
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = app.oneshot(get("/api/v1/store-1/books")).await.unwrap();

    let token_a = first.headers().get("e_token").unwrap();
    let token_b = second.headers().get("e_token").unwrap();
    assert_ne!(token_a, token_b);
}

#[tokio::test]
async fn test_valid_token_is_forwarded_with_one_pass_event() {
    let (app, sink) = test_gateway();
    let token = valid_token("store-1", 1001);

    let response = app
        .oneshot(get_with_token("/api/v1/store-1/cart", &token))
        .await
        .unwrap();

    // No upstream configured in tests, so an authorized request reaches the
    // gateway's own 404 fallback rather than being redirected.
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().get(LOCATION).is_none());
    assert!(response.headers().get("session_id").is_some());

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, Action::TokenValidated);
    assert_eq!(events[0].status, Some(Status::Pass));
    assert_eq!(events[0].user_id, Some(1001));
    assert_eq!(events[0].tenant_id.as_deref(), Some("store-1"));
    assert_eq!(events[0].token_id.as_deref().map(str::len), Some(64));
}

#[tokio::test]
async fn test_rejected_token_emits_two_events_then_redirects() {
    let (app, sink) = test_gateway();
    // Valid for store-2, presented against store-1
    let token = valid_token("store-2", 1001);

    let response = app
        .oneshot(get_with_token("/api/v1/store-1/cart", &token))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);

    let events = sink.events();
    assert_eq!(events.len(), 2);

    assert_eq!(events[0].action, Action::TokenValidated);
    assert_eq!(events[0].status, Some(Status::Fail));
    assert_eq!(
        events[0].data.as_ref().unwrap()["reason"],
        "tenant_mismatch"
    );
    assert!(events[0].token_id.is_some());

    assert_eq!(events[1].action, Action::TokenIssued);
    // Both decisions belong to the same session
    assert_eq!(events[0].session_id, events[1].session_id);
}

#[tokio::test]
async fn test_expired_token_reason_reaches_the_event() {
    let (app, sink) = test_gateway();
    let token = codec::encode_post_auth(
        "store-1",
        1001,
        Utc::now() - chrono::Duration::minutes(1),
        SECRET,
    )
    .unwrap();

    let response = app
        .oneshot(get_with_token("/api/v1/store-1/cart", &token))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    let events = sink.events();
    assert_eq!(events[0].data.as_ref().unwrap()["reason"], "expired");
}

#[tokio::test]
async fn test_pathless_request_falls_back_to_default_tenant() {
    let (app, sink) = test_gateway();

    let response = app.oneshot(get("/totally/unrelated")).await.unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tenant_id.as_deref(), Some("store-0"));

    let e_token = response
        .headers()
        .get("e_token")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(codec::decode_pre_auth(e_token).unwrap().tenant_id, "store-0");
}

#[tokio::test]
async fn test_incoming_session_header_is_honored_and_echoed() {
    let (app, sink) = test_gateway();

    let request = Request::builder()
        .uri("/api/v1/store-1/books")
        .header("session_id", "sess-fixed-1")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(
        response.headers().get("session_id").unwrap(),
        "sess-fixed-1"
    );
    assert_eq!(sink.events()[0].session_id.as_deref(), Some("sess-fixed-1"));
}

#[tokio::test]
async fn test_client_ip_header_attribution() {
    let (app, sink) = test_gateway();

    let request = Request::builder()
        .uri("/api/v1/store-1/books")
        .header("client_ip", "203.0.113.45")
        .header("user-agent", "python-requests/2.28.1")
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap();

    let events = sink.events();
    assert_eq!(events[0].client_ip, "203.0.113.45");
    assert_eq!(events[0].device_type.as_deref(), Some("bot"));
    assert_eq!(
        events[0].user_agent.as_deref(),
        Some("python-requests/2.28.1")
    );
}
