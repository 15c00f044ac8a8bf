//! Static bearer-token gate for the admin endpoints.
//!
//! The public and admin surfaces share paths (POST /activate is public,
//! PUT/GET /activate are operator-only), so the check runs at the top of
//! each admin handler rather than as a router layer.

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::error::{AppError, Result};
use crate::util::extract_bearer_token;
use crate::AppState;

/// Require a valid admin bearer token; returns the operator identity to
/// stamp into `resolved_by` fields (the `x-operator` header, defaulting
/// to "admin" since the token itself is anonymous).
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<String> {
    // No configured token means the admin surface is closed, not open.
    let expected = state.admin_api_key.as_deref().ok_or(AppError::Unauthorized)?;
    let token = extract_bearer_token(headers).ok_or(AppError::Unauthorized)?;

    if !bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(AppError::Unauthorized);
    }

    let operator = headers
        .get("x-operator")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("admin")
        .to_string();
    Ok(operator)
}
