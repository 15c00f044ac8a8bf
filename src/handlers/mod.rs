pub mod activate;
pub mod gateway;
pub mod payments;

use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;

use crate::extractors::Json;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub store: &'static str,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        store: if state.degraded { "memory" } else { "sqlite" },
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/activate",
            post(activate::activate)
                .put(activate::create_license)
                .get(activate::list_licenses),
        )
        .route(
            "/payments",
            post(payments::submit_payment)
                .get(payments::list_payments)
                .put(payments::resolve_payment),
        )
        .route(
            "/payments/push",
            post(gateway::initiate_push).get(gateway::push_status),
        )
        .route("/payments/callback", post(gateway::gateway_callback))
        .with_state(state)
}
