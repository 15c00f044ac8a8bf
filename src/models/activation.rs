use serde::{Deserialize, Serialize};

/// One row in the append-only activation audit log. Written on every
/// activation/heartbeat request that gets past format validation,
/// success or failure alike. Never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationAttempt {
    pub license_key: String,
    pub device_fingerprint: String,
    /// Opaque client-supplied metadata (OS, app version, ...).
    pub device_info: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub timestamp: i64,
}
