//! M-Pesa Daraja API client (STK push).
//!
//! Three concerns: OAuth token acquisition (cached until near expiry),
//! push-payment initiation and status query, and parsing of the
//! asynchronous result callback Safaricom POSTs back. The push itself is
//! fire-and-forget from the caller's perspective; the money outcome only
//! arrives via the callback.

use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::MpesaConfig;
use crate::error::{AppError, Result};

/// Daraja tokens last ~1 hour; refresh after 50 minutes.
const TOKEN_TTL_SECS: i64 = 50 * 60;

/// Daraja field length limits.
const MAX_ACCOUNT_REFERENCE: usize = 12;
const MAX_TRANSACTION_DESC: usize = 13;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

pub struct DarajaClient {
    client: Client,
    config: MpesaConfig,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Clone)]
pub struct StkPushRequest {
    /// Any common Kenyan format; normalized to `254XXXXXXXXX`.
    pub phone: String,
    /// Rounded to a whole unit before sending.
    pub amount: f64,
    pub account_reference: String,
    pub transaction_desc: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StkPushOutcome {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub customer_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionStatus {
    pub success: bool,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushBody<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'static str,
    amount: u64,
    #[serde(rename = "PartyA")]
    party_a: &'a str,
    #[serde(rename = "PartyB")]
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: &'a str,
    account_reference: &'a str,
    transaction_desc: &'a str,
}

#[derive(Debug, Deserialize)]
struct StkPushReply {
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryBody<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct StkQueryReply {
    #[serde(rename = "ResultCode")]
    result_code: Option<String>,
    #[serde(rename = "ResultDesc")]
    result_desc: Option<String>,
}

impl DarajaClient {
    pub fn new(config: MpesaConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            token: Mutex::new(None),
        }
    }

    fn cached_token(&self) -> Option<String> {
        let guard = match self.token.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .as_ref()
            .filter(|t| t.expires_at > Utc::now().timestamp())
            .map(|t| t.token.clone())
    }

    fn store_token(&self, token: &str) {
        let mut guard = match self.token.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(CachedToken {
            token: token.to_string(),
            expires_at: Utc::now().timestamp() + TOKEN_TTL_SECS,
        });
    }

    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let auth = BASE64.encode(format!(
            "{}:{}",
            self.config.consumer_key, self.config.consumer_secret
        ));

        let response = self
            .client
            .get(format!(
                "{}/oauth/v1/generate?grant_type=client_credentials",
                self.config.base_url()
            ))
            .header("Authorization", format!("Basic {auth}"))
            .send()
            .await
            .map_err(|e| AppError::Gateway(format!("M-Pesa auth request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AppError::Gateway(format!(
                "M-Pesa auth failed with status {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::Gateway(format!("invalid M-Pesa auth response: {e}")))?;

        self.store_token(&body.access_token);
        Ok(body.access_token)
    }

    /// Initiate an STK push. Returns the checkout identifiers to poll with;
    /// the payment result arrives later through the callback.
    pub async fn stk_push(&self, request: &StkPushRequest) -> Result<StkPushOutcome> {
        let phone = format_phone(&request.phone);
        if !is_valid_kenyan_phone(&phone) {
            return Err(AppError::BadRequest(
                "Invalid phone number. Use format 0712345678 or 254712345678".into(),
            ));
        }

        let token = self.access_token().await?;
        let (password, timestamp) = self.password();

        let account_reference = truncate(&request.account_reference, MAX_ACCOUNT_REFERENCE);
        let transaction_desc = truncate(&request.transaction_desc, MAX_TRANSACTION_DESC);

        let body = StkPushBody {
            business_short_code: &self.config.shortcode,
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount: request.amount.round().max(1.0) as u64,
            party_a: &phone,
            party_b: &self.config.shortcode,
            phone_number: &phone,
            callback_url: &request.callback_url,
            account_reference,
            transaction_desc,
        };

        let response = self
            .client
            .post(format!(
                "{}/mpesa/stkpush/v1/processrequest",
                self.config.base_url()
            ))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Gateway(format!("STK push request failed: {e}")))?;

        let reply: StkPushReply = response
            .json()
            .await
            .map_err(|e| AppError::Gateway(format!("invalid STK push response: {e}")))?;

        if reply.response_code.as_deref() == Some("0") {
            match (reply.merchant_request_id, reply.checkout_request_id) {
                (Some(merchant_request_id), Some(checkout_request_id)) => Ok(StkPushOutcome {
                    merchant_request_id,
                    checkout_request_id,
                    customer_message: reply.customer_message,
                }),
                _ => Err(AppError::Gateway(
                    "STK push accepted but response was missing request ids".into(),
                )),
            }
        } else {
            let reason = reply
                .response_description
                .or(reply.error_message)
                .unwrap_or_else(|| "STK push rejected".into());
            Err(AppError::Gateway(reason))
        }
    }

    /// Poll the state of a previously initiated push.
    pub async fn query_status(&self, checkout_request_id: &str) -> Result<TransactionStatus> {
        let token = self.access_token().await?;
        let (password, timestamp) = self.password();

        let body = StkQueryBody {
            business_short_code: &self.config.shortcode,
            password,
            timestamp,
            checkout_request_id,
        };

        let response = self
            .client
            .post(format!(
                "{}/mpesa/stkpushquery/v1/query",
                self.config.base_url()
            ))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Gateway(format!("STK status query failed: {e}")))?;

        let reply: StkQueryReply = response
            .json()
            .await
            .map_err(|e| AppError::Gateway(format!("invalid STK status response: {e}")))?;

        let result_code = reply.result_code.as_deref().and_then(|c| c.parse().ok());
        Ok(TransactionStatus {
            success: result_code == Some(0),
            result_code,
            result_desc: reply.result_desc,
        })
    }

    /// Daraja STK password: base64(shortcode + passkey + timestamp).
    fn password(&self) -> (String, String) {
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = BASE64.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ));
        (password, timestamp)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Normalize to `254XXXXXXXXX`.
pub fn format_phone(phone: &str) -> String {
    let cleaned: String = phone
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '+')
        .collect();

    if let Some(rest) = cleaned.strip_prefix('0') {
        format!("254{rest}")
    } else if cleaned.starts_with('7') || cleaned.starts_with('1') {
        format!("254{cleaned}")
    } else {
        cleaned
    }
}

/// 12 digits, `254` prefix, then a Safaricom `7`/`1` range.
pub fn is_valid_kenyan_phone(phone: &str) -> bool {
    let formatted = format_phone(phone);
    formatted.len() == 12
        && formatted.starts_with("254")
        && matches!(formatted.as_bytes()[3], b'7' | b'1')
        && formatted.chars().all(|c| c.is_ascii_digit())
}

/// Parsed asynchronous STK result callback.
#[derive(Debug, Clone)]
pub struct StkCallback {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub result_code: i64,
    pub result_desc: String,
    /// M-Pesa receipt number; present only on success. Redelivered
    /// callbacks carry the same receipt, which is what makes downstream
    /// processing idempotent.
    pub receipt: Option<String>,
    pub amount: Option<f64>,
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    #[serde(rename = "Body")]
    body: CallbackBody,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: RawCallback,
}

#[derive(Debug, Deserialize)]
struct RawCallback {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    result_code: i64,
    #[serde(rename = "ResultDesc")]
    result_desc: String,
    #[serde(rename = "CallbackMetadata")]
    metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item")]
    items: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
struct CallbackItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: Option<serde_json::Value>,
}

/// Parse a callback POST body. Returns None when the payload is not an
/// STK callback at all (Daraja is still acked in that case).
pub fn parse_callback(body: &serde_json::Value) -> Option<StkCallback> {
    let envelope: CallbackEnvelope = serde_json::from_value(body.clone()).ok()?;
    let raw = envelope.body.stk_callback;

    let mut callback = StkCallback {
        merchant_request_id: raw.merchant_request_id,
        checkout_request_id: raw.checkout_request_id,
        result_code: raw.result_code,
        result_desc: raw.result_desc,
        receipt: None,
        amount: None,
        phone: None,
    };

    if let Some(metadata) = raw.metadata {
        for item in metadata.items {
            let Some(value) = item.value else { continue };
            match item.name.as_str() {
                "Amount" => callback.amount = value.as_f64(),
                "MpesaReceiptNumber" => {
                    callback.receipt = value.as_str().map(String::from);
                }
                "PhoneNumber" => {
                    callback.phone = Some(match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    });
                }
                _ => {}
            }
        }
    }

    Some(callback)
}
