use axum::extract::State;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{AppError, Result};
use crate::extractors::{Json, Query};
use crate::gateway::{parse_callback, StkPushRequest, TransactionStatus};
use crate::models::{NewPaymentRequest, PaymentMethod};
use crate::AppState;

/// License price in KES, charged when the caller does not specify one.
const LICENSE_PRICE_KES: f64 = 20000.0;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBody {
    pub phone: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub account_reference: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_message: Option<String>,
}

/// POST /payments/push
/// Ask the gateway to prompt the customer's phone for payment.
pub async fn initiate_push(
    State(state): State<AppState>,
    Json(body): Json<PushBody>,
) -> Result<Json<PushResponse>> {
    let gateway = state
        .gateway
        .as_ref()
        .ok_or_else(|| AppError::Gateway("M-Pesa is not configured on this server".into()))?;

    let outcome = gateway
        .stk_push(&StkPushRequest {
            phone: body.phone,
            amount: body.amount.unwrap_or(LICENSE_PRICE_KES),
            account_reference: body.account_reference.unwrap_or_else(|| "KEYDESK".into()),
            transaction_desc: "License fee".into(),
            callback_url: format!("{}/payments/callback", state.base_url),
        })
        .await?;

    Ok(Json(PushResponse {
        success: true,
        merchant_request_id: outcome.merchant_request_id,
        checkout_request_id: outcome.checkout_request_id,
        customer_message: outcome.customer_message,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushStatusQuery {
    pub checkout_request_id: String,
}

/// GET /payments/push?checkoutRequestId=...
pub async fn push_status(
    State(state): State<AppState>,
    Query(query): Query<PushStatusQuery>,
) -> Result<Json<TransactionStatus>> {
    let gateway = state
        .gateway
        .as_ref()
        .ok_or_else(|| AppError::Gateway("M-Pesa is not configured on this server".into()))?;

    let status = gateway.query_status(&query.checkout_request_id).await?;
    Ok(Json(status))
}

/// POST /payments/callback
/// Asynchronous STK result from the gateway. Always acknowledged: the
/// gateway retries on anything else, and a malformed or failed callback
/// has nothing for us to retry. A successful payment lands in the queue
/// as a pending claim keyed by receipt, so redelivery is a no-op.
pub async fn gateway_callback(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let ack = Json(json!({ "ResultCode": 0, "ResultDesc": "Accepted" }));

    let Some(callback) = parse_callback(&body) else {
        tracing::warn!("unrecognized gateway callback payload");
        return ack;
    };

    if callback.result_code != 0 {
        tracing::info!(
            checkout_request_id = %callback.checkout_request_id,
            result_code = callback.result_code,
            "payment not completed: {}",
            callback.result_desc
        );
        return ack;
    }

    let Some(receipt) = callback.receipt.as_deref() else {
        tracing::warn!(
            checkout_request_id = %callback.checkout_request_id,
            "successful callback carried no receipt number"
        );
        return ack;
    };

    // The gateway already confirmed the money moved, but minting still
    // goes through the operator queue like any other claim.
    let claim = NewPaymentRequest {
        transaction_code: receipt.trim().to_ascii_uppercase(),
        payment_method: PaymentMethod::Mpesa,
        email: String::new(),
        phone: callback.phone.clone().unwrap_or_default(),
        name: None,
        amount: callback.amount,
        currency: Some("KES".into()),
        device_fingerprint: None,
    };
    match state.payments.create_payment(&claim) {
        Ok(payment) => {
            tracing::info!(
                receipt = %payment.transaction_code,
                amount = ?payment.amount,
                "gateway payment recorded for verification"
            );
        }
        Err(AppError::Conflict(_)) => {
            tracing::debug!(receipt = %claim.transaction_code, "gateway callback redelivered");
        }
        Err(e) => {
            tracing::error!(receipt = %claim.transaction_code, "failed to record gateway payment: {e}");
        }
    }

    ack
}
