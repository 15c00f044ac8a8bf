//! Process-local fallback store for degraded mode.
//!
//! Holds a small seed dataset plus whatever the process creates before it
//! exits. Not durable, not shared across instances — acceptable only when
//! the durable store is unreachable, and the startup log says so. The
//! contracts are the same as the sqlite store: one record per transaction
//! code, one device per license, with every primitive executing under a
//! single mutex section so concurrent callers observe it atomically.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::error::{AppError, Result};
use crate::models::{
    ActivationAttempt, License, LicenseStatus, NewLicense, NewPaymentRequest, PaymentRequest,
    PaymentStatus,
};

use super::{BindOutcome, LicenseStore, PaymentStore};

/// Seed license available in degraded/demo mode.
pub const DEMO_KEY: &str = "EIMS-TEST-0001-DEMO";

#[derive(Default)]
struct Inner {
    licenses: HashMap<String, License>,
    payments: HashMap<String, PaymentRequest>,
    attempts: Vec<ActivationAttempt>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fallback store pre-loaded with the demo license, unbound.
    pub fn seeded() -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            inner.licenses.insert(
                DEMO_KEY.to_string(),
                License {
                    key: DEMO_KEY.to_string(),
                    customer_email: "demo@keydesk.local".into(),
                    customer_phone: "254700000000".into(),
                    customer_name: Some("Demo Customer".into()),
                    status: LicenseStatus::Active,
                    device_fingerprint: None,
                    activated_at: None,
                    expires_at: None,
                    created_at: Utc::now().timestamp(),
                },
            );
        }
        store
    }

    /// Administrative status transition. Revocation and expiry have no
    /// public endpoint; they are operator actions against the store.
    pub fn set_status(&self, key: &str, status: LicenseStatus) {
        if let Some(license) = self.lock().licenses.get_mut(key) {
            license.status = status;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Recover from poisoning; dropping abuse-control state would be
        // worse than keeping whatever the panicking thread left behind.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl LicenseStore for MemoryStore {
    fn create_license(&self, input: &NewLicense) -> Result<License> {
        let mut inner = self.lock();
        if inner.licenses.contains_key(&input.key) {
            return Err(AppError::Conflict(format!(
                "License key {} already exists",
                input.key
            )));
        }
        let license = License {
            key: input.key.clone(),
            customer_email: input.customer_email.clone(),
            customer_phone: input.customer_phone.clone(),
            customer_name: input.customer_name.clone(),
            status: LicenseStatus::Active,
            device_fingerprint: input.device_fingerprint.clone(),
            activated_at: None,
            expires_at: input.expires_at,
            created_at: Utc::now().timestamp(),
        };
        inner.licenses.insert(input.key.clone(), license.clone());
        Ok(license)
    }

    fn get_license(&self, key: &str) -> Result<Option<License>> {
        Ok(self.lock().licenses.get(key).cloned())
    }

    fn list_licenses(&self) -> Result<Vec<License>> {
        let mut licenses: Vec<License> = self.lock().licenses.values().cloned().collect();
        licenses.sort_by_key(|l| std::cmp::Reverse(l.created_at));
        Ok(licenses)
    }

    fn bind_device(&self, key: &str, fingerprint: &str, now: i64) -> Result<BindOutcome> {
        // Check-and-set under one guard; this is the degraded-mode
        // equivalent of the sqlite conditional UPDATE.
        let mut inner = self.lock();
        let Some(license) = inner.licenses.get_mut(key) else {
            return Ok(BindOutcome::NotFound);
        };

        if license.status == LicenseStatus::Revoked {
            return Ok(BindOutcome::Revoked);
        }
        if license.is_expired(now) {
            return Ok(BindOutcome::Expired);
        }

        match license.device_fingerprint.as_deref() {
            None => {
                license.device_fingerprint = Some(fingerprint.to_string());
                license.activated_at.get_or_insert(now);
                Ok(BindOutcome::Bound(license.clone()))
            }
            Some(bound) if bound == fingerprint => {
                license.activated_at.get_or_insert(now);
                Ok(BindOutcome::AlreadyBound(license.clone()))
            }
            Some(_) => Ok(BindOutcome::OtherDevice),
        }
    }

    fn record_attempt(&self, attempt: &ActivationAttempt) -> Result<()> {
        self.lock().attempts.push(attempt.clone());
        Ok(())
    }

    fn list_attempts(&self) -> Result<Vec<ActivationAttempt>> {
        Ok(self.lock().attempts.clone())
    }
}

impl PaymentStore for MemoryStore {
    fn create_payment(&self, input: &NewPaymentRequest) -> Result<PaymentRequest> {
        let mut inner = self.lock();
        if inner.payments.contains_key(&input.transaction_code) {
            return Err(AppError::Conflict(
                "This transaction code has already been submitted".into(),
            ));
        }
        let payment = PaymentRequest {
            transaction_code: input.transaction_code.clone(),
            payment_method: input.payment_method,
            email: input.email.clone(),
            phone: input.phone.clone(),
            name: input.name.clone(),
            amount: input.amount,
            currency: input.currency.clone(),
            device_fingerprint: input.device_fingerprint.clone(),
            status: PaymentStatus::Pending,
            created_at: Utc::now().timestamp(),
            resolved_at: None,
            resolved_by: None,
            rejection_reason: None,
        };
        inner
            .payments
            .insert(input.transaction_code.clone(), payment.clone());
        Ok(payment)
    }

    fn get_payment(&self, code: &str) -> Result<Option<PaymentRequest>> {
        Ok(self.lock().payments.get(code).cloned())
    }

    fn list_payments(&self, include_resolved: bool) -> Result<Vec<PaymentRequest>> {
        let mut payments: Vec<PaymentRequest> = self
            .lock()
            .payments
            .values()
            .filter(|p| include_resolved || p.status == PaymentStatus::Pending)
            .cloned()
            .collect();
        payments.sort_by_key(|p| std::cmp::Reverse(p.created_at));
        Ok(payments)
    }

    fn verify_and_mint(
        &self,
        code: &str,
        operator: &str,
        license: &NewLicense,
        now: i64,
    ) -> Result<(PaymentRequest, License)> {
        let mut inner = self.lock();

        let Some(payment) = inner.payments.get(code) else {
            return Err(AppError::NotFound("Payment request not found".into()));
        };
        if payment.status != PaymentStatus::Pending {
            return Err(AppError::Conflict(format!(
                "Payment request has already been resolved ({})",
                payment.status.as_ref()
            )));
        }
        // Mint-or-abort before touching the claim, so both writes land or
        // neither does.
        if inner.licenses.contains_key(&license.key) {
            return Err(AppError::Conflict(format!(
                "License key {} already exists",
                license.key
            )));
        }

        let minted = License {
            key: license.key.clone(),
            customer_email: license.customer_email.clone(),
            customer_phone: license.customer_phone.clone(),
            customer_name: license.customer_name.clone(),
            status: LicenseStatus::Active,
            device_fingerprint: license.device_fingerprint.clone(),
            activated_at: None,
            expires_at: license.expires_at,
            created_at: now,
        };
        inner.licenses.insert(minted.key.clone(), minted.clone());

        let Some(payment) = inner.payments.get_mut(code) else {
            return Err(AppError::Internal("payment vanished under lock".into()));
        };
        payment.status = PaymentStatus::Verified;
        payment.resolved_at = Some(now);
        payment.resolved_by = Some(operator.to_string());

        Ok((payment.clone(), minted))
    }

    fn reject_payment(
        &self,
        code: &str,
        operator: &str,
        reason: &str,
        now: i64,
    ) -> Result<PaymentRequest> {
        let mut inner = self.lock();
        let Some(payment) = inner.payments.get_mut(code) else {
            return Err(AppError::NotFound("Payment request not found".into()));
        };
        if payment.status != PaymentStatus::Pending {
            return Err(AppError::Conflict(format!(
                "Payment request has already been resolved ({})",
                payment.status.as_ref()
            )));
        }
        payment.status = PaymentStatus::Rejected;
        payment.resolved_at = Some(now);
        payment.resolved_by = Some(operator.to_string());
        payment.rejection_reason = Some(reason.to_string());
        Ok(payment.clone())
    }
}
