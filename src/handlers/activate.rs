use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::auth::require_admin;
use crate::error::{AppError, Result};
use crate::extractors::Json;
use crate::models::{
    generate_key, is_plausible_email, is_plausible_phone, is_valid_key_format, normalize_key,
    ActivationAttempt, License, LicenseStatus, NewLicense, MAX_DEVICES,
};
use crate::ratelimit::Scope;
use crate::store::BindOutcome;
use crate::util::extract_request_info;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateBody {
    pub key: String,
    pub device_id: String,
    #[serde(default)]
    pub heartbeat: bool,
    #[serde(default)]
    pub device_info: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseSummary {
    pub key: String,
    pub email: String,
    pub status: LicenseStatus,
    pub activated_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub device_count: i32,
    pub max_devices: i32,
}

impl LicenseSummary {
    fn from_license(license: &License) -> Self {
        Self {
            key: license.key.clone(),
            email: license.customer_email.clone(),
            status: license.status,
            activated_at: license.activated_at,
            expires_at: license.expires_at,
            device_count: license.device_count(),
            max_devices: MAX_DEVICES,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActivateResponse {
    pub success: bool,
    pub message: String,
    pub license: LicenseSummary,
}

/// POST /activate
/// Activate a license on a device, or heartbeat an existing binding.
pub async fn activate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ActivateBody>,
) -> Result<Json<ActivateResponse>> {
    // Malformed input fails fast: no store lookup, no audit row, and no
    // rate-limit consumption.
    let key = normalize_key(&body.key);
    if !is_valid_key_format(&key) {
        return Err(AppError::BadRequest("Invalid license key format".into()));
    }
    let fingerprint = body.device_id.trim().to_string();
    if fingerprint.is_empty() {
        return Err(AppError::BadRequest("deviceId is required".into()));
    }

    let now = Utc::now().timestamp();
    let (ip_address, user_agent) = extract_request_info(&headers);
    let attempt = |success: bool, failure_reason: Option<&str>| ActivationAttempt {
        license_key: key.clone(),
        device_fingerprint: fingerprint.clone(),
        device_info: body.device_info.clone(),
        ip_address: ip_address.clone(),
        user_agent: user_agent.clone(),
        success,
        failure_reason: failure_reason.map(String::from),
        timestamp: now,
    };

    if !state.limiter.check_and_record(Scope::Device, &fingerprint) {
        record_attempt(&state, &attempt(false, Some("rate limit exceeded")));
        return Err(AppError::RateLimited(
            "Too many activation attempts for this device. Try again in an hour.".into(),
        ));
    }

    match state.licenses.bind_device(&key, &fingerprint, now)? {
        BindOutcome::Bound(license) => {
            record_attempt(&state, &attempt(true, None));
            Ok(Json(ActivateResponse {
                success: true,
                message: "License activated successfully".into(),
                license: LicenseSummary::from_license(&license),
            }))
        }
        BindOutcome::AlreadyBound(license) => {
            record_attempt(&state, &attempt(true, None));
            let message = if body.heartbeat {
                "Heartbeat verified"
            } else {
                "License already active on this device"
            };
            Ok(Json(ActivateResponse {
                success: true,
                message: message.into(),
                license: LicenseSummary::from_license(&license),
            }))
        }
        BindOutcome::OtherDevice => {
            record_attempt(&state, &attempt(false, Some("bound to different device")));
            Err(AppError::Forbidden(
                "License is already activated on a different device. Contact support to transfer it."
                    .into(),
            ))
        }
        BindOutcome::Revoked => {
            record_attempt(&state, &attempt(false, Some("license revoked")));
            Err(AppError::Forbidden("License has been revoked".into()))
        }
        BindOutcome::Expired => {
            record_attempt(&state, &attempt(false, Some("license expired")));
            Err(AppError::Forbidden("License has expired".into()))
        }
        BindOutcome::NotFound => {
            record_attempt(&state, &attempt(false, Some("license key not found")));
            Err(AppError::NotFound(
                "License key not found. Check the key and try again.".into(),
            ))
        }
    }
}

/// Audit writes never fail the request they describe.
fn record_attempt(state: &AppState, attempt: &ActivationAttempt) {
    if let Err(e) = state.licenses.record_attempt(attempt) {
        tracing::warn!("failed to record activation attempt: {e}");
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLicenseBody {
    pub email: String,
    pub phone: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub payment_reference: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreateLicenseResponse {
    pub success: bool,
    pub key: String,
}

/// PUT /activate (admin)
/// Issue a license directly, outside the payment queue.
pub async fn create_license(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateLicenseBody>,
) -> Result<Json<CreateLicenseResponse>> {
    let operator = require_admin(&state, &headers)?;

    if !is_plausible_email(&body.email) {
        return Err(AppError::BadRequest("Valid email is required".into()));
    }
    if !is_plausible_phone(&body.phone) {
        return Err(AppError::BadRequest("Valid phone number is required".into()));
    }

    let license = state.licenses.create_license(&NewLicense {
        key: generate_key(),
        customer_email: body.email.trim().to_string(),
        customer_phone: body.phone.trim().to_string(),
        customer_name: body.name.clone(),
        device_fingerprint: None,
        expires_at: body.expires_at,
    })?;

    tracing::info!(
        key = %license.key,
        operator = %operator,
        reference = body.payment_reference.as_deref().unwrap_or("-"),
        "license issued by operator"
    );

    Ok(Json(CreateLicenseResponse {
        success: true,
        key: license.key,
    }))
}

#[derive(Debug, Serialize)]
pub struct LicenseStats {
    pub total: usize,
    pub active: usize,
    pub bound: usize,
    pub revoked: usize,
    pub expired: usize,
}

#[derive(Debug, Serialize)]
pub struct ListLicensesResponse {
    pub licenses: Vec<License>,
    pub stats: LicenseStats,
}

/// GET /activate (admin)
pub async fn list_licenses(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ListLicensesResponse>> {
    require_admin(&state, &headers)?;

    let licenses = state.licenses.list_licenses()?;
    let now = Utc::now().timestamp();
    let stats = LicenseStats {
        total: licenses.len(),
        active: licenses
            .iter()
            .filter(|l| l.status == LicenseStatus::Active && !l.is_expired(now))
            .count(),
        bound: licenses
            .iter()
            .filter(|l| l.device_fingerprint.is_some())
            .count(),
        revoked: licenses
            .iter()
            .filter(|l| l.status == LicenseStatus::Revoked)
            .count(),
        expired: licenses
            .iter()
            .filter(|l| l.status == LicenseStatus::Expired || l.is_expired(now))
            .count(),
    };

    Ok(Json(ListLicensesResponse { licenses, stats }))
}
