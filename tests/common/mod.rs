//! Shared fixtures for the HTTP-level tests. Everything runs against the
//! in-memory store so each test owns an isolated, pre-seeded world.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request};
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use keydesk::notify::Notifier;
use keydesk::ratelimit::RateLimiter;
use keydesk::store::MemoryStore;
use keydesk::{build_router, AppState};

pub const ADMIN_KEY: &str = "test-admin-key";
pub const DEMO_KEY: &str = "EIMS-TEST-0001-DEMO";

/// Router plus a direct handle on the backing store for assertions.
pub fn test_app() -> (Router, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::seeded());
    let state = AppState {
        licenses: store.clone(),
        payments: store.clone(),
        limiter: Arc::new(RateLimiter::new()),
        notifier: Arc::new(Notifier::from_config(None)),
        gateway: None,
        admin_api_key: Some(ADMIN_KEY.to_string()),
        base_url: "http://127.0.0.1:3000".to_string(),
        degraded: true,
    };
    (build_router(state), store)
}

pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    bearer: Option<&str>,
) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

pub async fn send_json(app: &Router, method: &str, uri: &str, body: Value) -> Response {
    send(app, method, uri, Some(body), None).await
}

pub async fn send_json_admin(app: &Router, method: &str, uri: &str, body: Value) -> Response {
    send(app, method, uri, Some(body), Some(ADMIN_KEY)).await
}

pub async fn get_admin(app: &Router, uri: &str) -> Response {
    send(app, "GET", uri, None, Some(ADMIN_KEY)).await
}

pub async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
