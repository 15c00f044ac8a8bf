//! Persistence contracts for licenses and payment claims.
//!
//! Two implementations share these traits: [`SqliteStore`] (durable, the
//! primary path) and [`MemoryStore`] (process-local fallback for degraded
//! mode). The store primitives are the linearization points the service
//! relies on: `bind_device` is a conditional write (bind iff unbound or
//! already ours), `create_payment` is a unique-create keyed on the
//! normalized transaction code, and `verify_and_mint` transitions the claim
//! and mints the license in a single transactional boundary.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::models::{ActivationAttempt, License, NewLicense, NewPaymentRequest, PaymentRequest};

/// Outcome of the atomic device-binding write.
#[derive(Debug, Clone)]
pub enum BindOutcome {
    /// First writer won; the license is now bound to this fingerprint.
    Bound(License),
    /// Already bound to this same fingerprint (re-activation/heartbeat).
    AlreadyBound(License),
    /// Bound to a different fingerprint. Permanent until admin action.
    OtherDevice,
    Revoked,
    Expired,
    NotFound,
}

pub trait LicenseStore: Send + Sync {
    /// Insert a freshly minted license. Fails with a conflict if the key
    /// already exists.
    fn create_license(&self, input: &NewLicense) -> Result<License>;

    fn get_license(&self, key: &str) -> Result<Option<License>>;

    /// All licenses, newest first.
    fn list_licenses(&self) -> Result<Vec<License>>;

    /// Atomically bind `fingerprint` to the license iff it is active,
    /// unexpired, and either unbound or already bound to this fingerprint.
    /// Two concurrent calls with different fingerprints can never both
    /// succeed; implementations must not use a read-then-write pair.
    fn bind_device(&self, key: &str, fingerprint: &str, now: i64) -> Result<BindOutcome>;

    /// Append to the activation audit log.
    fn record_attempt(&self, attempt: &ActivationAttempt) -> Result<()>;

    /// Full audit log, oldest first.
    fn list_attempts(&self) -> Result<Vec<ActivationAttempt>>;
}

pub trait PaymentStore: Send + Sync {
    /// Unique-create keyed on the transaction code. A second submission
    /// with the same code fails with a conflict regardless of the existing
    /// record's status — never a silent overwrite.
    fn create_payment(&self, input: &NewPaymentRequest) -> Result<PaymentRequest>;

    fn get_payment(&self, code: &str) -> Result<Option<PaymentRequest>>;

    /// Pending claims only, or full history. Newest first.
    fn list_payments(&self, include_resolved: bool) -> Result<Vec<PaymentRequest>>;

    /// Transition `pending -> verified` and mint `license`, atomically.
    /// Fails with not-found for unknown codes and conflict for claims
    /// already resolved; on any failure neither write survives.
    fn verify_and_mint(
        &self,
        code: &str,
        operator: &str,
        license: &NewLicense,
        now: i64,
    ) -> Result<(PaymentRequest, License)>;

    /// Transition `pending -> rejected`. Same not-found/conflict rules.
    fn reject_payment(
        &self,
        code: &str,
        operator: &str,
        reason: &str,
        now: i64,
    ) -> Result<PaymentRequest>;
}
