use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// Minimum transaction code length after normalization.
pub const MIN_TRANSACTION_CODE_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentMethod {
    Mpesa,
    Bank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Verified,
    Rejected,
}

/// A customer's claim that an off-system payment happened, pending operator
/// verification. The normalized transaction code is the idempotency key:
/// exactly one record ever exists per code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub transaction_code: String,
    pub payment_method: PaymentMethod,
    pub email: String,
    pub phone: String,
    pub name: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    /// Pre-binds the eventual license to the submitting device.
    pub device_fingerprint: Option<String>,
    pub status: PaymentStatus,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
    pub resolved_by: Option<String>,
    pub rejection_reason: Option<String>,
}

/// Input for creating a pending claim. The code must already be normalized.
#[derive(Debug, Clone)]
pub struct NewPaymentRequest {
    pub transaction_code: String,
    pub payment_method: PaymentMethod,
    pub email: String,
    pub phone: String,
    pub name: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub device_fingerprint: Option<String>,
}

/// Trim + uppercase. The normalized form is what uniqueness is keyed on.
pub fn normalize_transaction_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Minimal shape check; real verification is the operator's job.
pub fn is_plausible_email(email: &str) -> bool {
    let email = email.trim();
    email.contains('@') && email.len() >= 3
}

/// At least 9 digits once separators and country-code punctuation are gone.
pub fn is_plausible_phone(phone: &str) -> bool {
    phone.chars().filter(|c| c.is_ascii_digit()).count() >= 9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_normalization() {
        assert_eq!(normalize_transaction_code("  abc12345 "), "ABC12345");
        assert_eq!(normalize_transaction_code("QWE777"), "QWE777");
    }

    #[test]
    fn email_plausibility() {
        assert!(is_plausible_email("jane@example.com"));
        assert!(!is_plausible_email("janeexample.com"));
        assert!(!is_plausible_email("@"));
    }

    #[test]
    fn phone_plausibility() {
        assert!(is_plausible_phone("0712 345 678"));
        assert!(is_plausible_phone("+254-712-345-678"));
        assert!(!is_plausible_phone("12345"));
    }
}
