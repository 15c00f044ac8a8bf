use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::auth::require_admin;
use crate::error::{AppError, Result};
use crate::extractors::{Json, Query};
use crate::models::{
    generate_key, is_plausible_email, is_plausible_phone, normalize_transaction_code, NewLicense,
    NewPaymentRequest, PaymentMethod, PaymentRequest, MIN_TRANSACTION_CODE_LEN,
};
use crate::notify::NotifyEvent;
use crate::AppState;

const DEFAULT_REJECTION_REASON: &str = "Payment could not be verified";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPaymentBody {
    pub transaction_code: String,
    pub phone: String,
    pub email: String,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPaymentResponse {
    pub success: bool,
    pub verification_id: String,
    pub message: String,
}

/// POST /payments
/// Submit a payment claim for manual verification.
pub async fn submit_payment(
    State(state): State<AppState>,
    Json(body): Json<SubmitPaymentBody>,
) -> Result<Json<SubmitPaymentResponse>> {
    let code = normalize_transaction_code(&body.transaction_code);
    if code.len() < MIN_TRANSACTION_CODE_LEN {
        return Err(AppError::BadRequest(
            "Transaction code looks too short. Copy it exactly from your payment confirmation."
                .into(),
        ));
    }
    if !is_plausible_email(&body.email) {
        return Err(AppError::BadRequest("Valid email is required".into()));
    }
    if !is_plausible_phone(&body.phone) {
        return Err(AppError::BadRequest("Valid phone number is required".into()));
    }

    let method = body.payment_method.unwrap_or(PaymentMethod::Mpesa);
    let payment = state.payments.create_payment(&NewPaymentRequest {
        transaction_code: code,
        payment_method: method,
        email: body.email.trim().to_string(),
        phone: body.phone.trim().to_string(),
        name: body.name.clone(),
        amount: body.amount,
        currency: body.currency.clone(),
        device_fingerprint: body
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from),
    })?;

    let notifier = state.notifier.clone();
    let event = NotifyEvent::PaymentSubmitted {
        transaction_code: payment.transaction_code.clone(),
        payment_method: method.as_ref().to_string(),
        phone: payment.phone.clone(),
        email: payment.email.clone(),
        amount: payment.amount,
    };
    tokio::spawn(async move { notifier.send(event).await });

    Ok(Json(SubmitPaymentResponse {
        success: true,
        verification_id: payment.transaction_code,
        message: "Payment received for verification. You will get your license key within 24 hours."
            .into(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListPaymentsQuery {
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
pub struct ListPaymentsResponse {
    pub payments: Vec<PaymentRequest>,
    pub total: usize,
}

/// GET /payments (admin)
/// Pending queue by default; `?all=true` includes resolved history.
pub async fn list_payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListPaymentsQuery>,
) -> Result<Json<ListPaymentsResponse>> {
    require_admin(&state, &headers)?;

    let payments = state.payments.list_payments(query.all)?;
    let total = payments.len();
    Ok(Json(ListPaymentsResponse { payments, total }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvePaymentBody {
    pub transaction_code: String,
    pub action: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvePaymentResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// PUT /payments (admin)
/// Verify a pending claim (minting a license atomically) or reject it.
pub async fn resolve_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ResolvePaymentBody>,
) -> Result<Json<ResolvePaymentResponse>> {
    let operator = require_admin(&state, &headers)?;

    let code = normalize_transaction_code(&body.transaction_code);
    if code.is_empty() {
        return Err(AppError::BadRequest("transactionCode is required".into()));
    }

    let now = Utc::now().timestamp();
    let response = match body.action.as_str() {
        "verify" => {
            let payment = state
                .payments
                .get_payment(&code)?
                .ok_or_else(|| AppError::BadRequest("Payment request not found".into()))?;

            let license = NewLicense {
                key: generate_key(),
                customer_email: payment.email.clone(),
                customer_phone: payment.phone.clone(),
                customer_name: payment.name.clone(),
                device_fingerprint: payment.device_fingerprint.clone(),
                expires_at: None,
            };
            let (payment, license) = state
                .payments
                .verify_and_mint(&code, &operator, &license, now)
                .map_err(operator_input_error)?;

            notify_resolution(&state, &payment, "verified", &operator, Some(&license.key));
            ResolvePaymentResponse {
                success: true,
                license_key: Some(license.key),
                reason: None,
            }
        }
        "reject" => {
            let reason = body
                .reason
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_REJECTION_REASON)
                .to_string();
            let payment = state
                .payments
                .reject_payment(&code, &operator, &reason, now)
                .map_err(operator_input_error)?;

            notify_resolution(&state, &payment, "rejected", &operator, None);
            ResolvePaymentResponse {
                success: true,
                license_key: None,
                reason: Some(reason),
            }
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "Unknown action '{other}'. Use 'verify' or 'reject'."
            )));
        }
    };

    Ok(Json(response))
}

/// Resolution failures are operator input problems (wrong code, already
/// handled), so the not-found/conflict classes surface as 400 here.
fn operator_input_error(err: AppError) -> AppError {
    match err {
        AppError::NotFound(msg) | AppError::Conflict(msg) => AppError::BadRequest(msg),
        other => other,
    }
}

fn notify_resolution(
    state: &AppState,
    payment: &PaymentRequest,
    outcome: &str,
    operator: &str,
    license_key: Option<&str>,
) {
    let notifier = state.notifier.clone();
    let event = NotifyEvent::PaymentResolved {
        transaction_code: payment.transaction_code.clone(),
        outcome: outcome.to_string(),
        operator: operator.to_string(),
        license_key: license_key.map(String::from),
    };
    tokio::spawn(async move { notifier.send(event).await });
}
