pub mod auth;
pub mod config;
pub mod error;
pub mod extractors;
pub mod gateway;
pub mod handlers;
pub mod models;
pub mod notify;
pub mod ratelimit;
pub mod store;
pub mod util;

use std::sync::Arc;

use axum::Router;

use crate::gateway::DarajaClient;
use crate::notify::Notifier;
use crate::ratelimit::RateLimiter;
use crate::store::{LicenseStore, PaymentStore};

/// Shared per-request context. Everything in here is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub licenses: Arc<dyn LicenseStore>,
    pub payments: Arc<dyn PaymentStore>,
    pub limiter: Arc<RateLimiter>,
    pub notifier: Arc<Notifier>,
    pub gateway: Option<Arc<DarajaClient>>,
    pub admin_api_key: Option<String>,
    pub base_url: String,
    /// True when running on the non-durable in-memory fallback store.
    pub degraded: bool,
}

pub fn build_router(state: AppState) -> Router {
    handlers::router(state)
}
