use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// Constant key prefix: `EIMS-XXXX-XXXX-XXXX`.
pub const KEY_PREFIX: &str = "EIMS";

/// One device per license, system-wide. Not per-record configuration.
pub const MAX_DEVICES: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LicenseStatus {
    Active,
    Revoked,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct License {
    pub key: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub customer_name: Option<String>,
    pub status: LicenseStatus,
    /// At most one, permanent once set (admin override only).
    pub device_fingerprint: Option<String>,
    pub activated_at: Option<i64>,
    /// None = no expiry.
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

impl License {
    pub fn is_expired(&self, now: i64) -> bool {
        self.status == LicenseStatus::Expired
            || self.expires_at.is_some_and(|exp| exp < now)
    }

    pub fn device_count(&self) -> i32 {
        if self.device_fingerprint.is_some() { 1 } else { 0 }
    }
}

/// Input for minting a license (payment verification or admin issuance).
#[derive(Debug, Clone)]
pub struct NewLicense {
    pub key: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub customer_name: Option<String>,
    /// Pre-binds the license when the payment claim carried a fingerprint.
    pub device_fingerprint: Option<String>,
    pub expires_at: Option<i64>,
}

/// Uppercase and trim a customer-supplied key before validation or lookup.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_uppercase()
}

/// Strict format check on a normalized key: `EIMS-XXXX-XXXX-XXXX` with
/// uppercase alphanumeric groups.
pub fn is_valid_key_format(key: &str) -> bool {
    let mut parts = key.split('-');
    if parts.next() != Some(KEY_PREFIX) {
        return false;
    }
    let groups: Vec<&str> = parts.collect();
    groups.len() == 3
        && groups.iter().all(|g| {
            g.len() == 4
                && g.chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        })
}

/// Generate a fresh license key. Uses an unambiguous charset (no I/O/0/1)
/// so keys survive being read over the phone; validation still accepts the
/// full uppercase alphanumeric class.
pub fn generate_key() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();

    let mut group = || -> String {
        (0..4)
            .map(|_| chars[rng.gen_range(0..chars.len())])
            .collect()
    };

    format!("{}-{}-{}-{}", KEY_PREFIX, group(), group(), group())
}
