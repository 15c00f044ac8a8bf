//! Durable store backed by SQLite through an r2d2 connection pool.
//!
//! Device binding and payment resolution are expressed as conditional
//! writes so the database itself is the single point of truth under
//! concurrent requests; handlers never read-then-write.

use std::str::FromStr;

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    ActivationAttempt, License, LicenseStatus, NewLicense, NewPaymentRequest, PaymentMethod,
    PaymentRequest, PaymentStatus,
};

use super::{BindOutcome, LicenseStore, PaymentStore};

const LICENSE_COLS: &str = "key, customer_email, customer_phone, customer_name, status, \
     device_fingerprint, activated_at, expires_at, created_at";

const PAYMENT_COLS: &str = "transaction_code, payment_method, email, phone, name, amount, \
     currency, device_fingerprint, status, created_at, resolved_at, resolved_by, \
     rejection_reason";

const ATTEMPT_COLS: &str = "license_key, device_fingerprint, device_info, ip_address, \
     user_agent, success, failure_reason, timestamp";

fn now() -> i64 {
    Utc::now().timestamp()
}

fn gen_id() -> String {
    Uuid::new_v4().to_string()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_enum<T: FromStr>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn license_from_row(row: &Row) -> rusqlite::Result<License> {
    Ok(License {
        key: row.get(0)?,
        customer_email: row.get(1)?,
        customer_phone: row.get(2)?,
        customer_name: row.get(3)?,
        status: parse_enum::<LicenseStatus>(4, row.get(4)?)?,
        device_fingerprint: row.get(5)?,
        activated_at: row.get(6)?,
        expires_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn payment_from_row(row: &Row) -> rusqlite::Result<PaymentRequest> {
    Ok(PaymentRequest {
        transaction_code: row.get(0)?,
        payment_method: parse_enum::<PaymentMethod>(1, row.get(1)?)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        name: row.get(4)?,
        amount: row.get(5)?,
        currency: row.get(6)?,
        device_fingerprint: row.get(7)?,
        status: parse_enum::<PaymentStatus>(8, row.get(8)?)?,
        created_at: row.get(9)?,
        resolved_at: row.get(10)?,
        resolved_by: row.get(11)?,
        rejection_reason: row.get(12)?,
    })
}

fn attempt_from_row(row: &Row) -> rusqlite::Result<ActivationAttempt> {
    let device_info: Option<String> = row.get(2)?;
    Ok(ActivationAttempt {
        license_key: row.get(0)?,
        device_fingerprint: row.get(1)?,
        device_info: device_info.and_then(|s| serde_json::from_str(&s).ok()),
        ip_address: row.get(3)?,
        user_agent: row.get(4)?,
        success: row.get(5)?,
        failure_reason: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::new(manager)
            .map_err(|e| AppError::Internal(format!("failed to open database pool: {e}")))?;

        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;

             CREATE TABLE IF NOT EXISTS licenses (
                 key TEXT PRIMARY KEY,
                 customer_email TEXT NOT NULL,
                 customer_phone TEXT NOT NULL,
                 customer_name TEXT,
                 status TEXT NOT NULL DEFAULT 'active',
                 device_fingerprint TEXT,
                 activated_at INTEGER,
                 expires_at INTEGER,
                 created_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS payment_requests (
                 transaction_code TEXT PRIMARY KEY,
                 payment_method TEXT NOT NULL,
                 email TEXT NOT NULL,
                 phone TEXT NOT NULL,
                 name TEXT,
                 amount REAL,
                 currency TEXT,
                 device_fingerprint TEXT,
                 status TEXT NOT NULL DEFAULT 'pending',
                 created_at INTEGER NOT NULL,
                 resolved_at INTEGER,
                 resolved_by TEXT,
                 rejection_reason TEXT
             );

             CREATE TABLE IF NOT EXISTS activation_attempts (
                 id TEXT PRIMARY KEY,
                 license_key TEXT NOT NULL,
                 device_fingerprint TEXT NOT NULL,
                 device_info TEXT,
                 ip_address TEXT,
                 user_agent TEXT,
                 success INTEGER NOT NULL,
                 failure_reason TEXT,
                 timestamp INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_attempts_key
                 ON activation_attempts (license_key);",
        )?;
        Ok(())
    }

    fn insert_license(conn: &Connection, input: &NewLicense, created_at: i64) -> Result<License> {
        let result = conn.execute(
            "INSERT INTO licenses (key, customer_email, customer_phone, customer_name, \
             status, device_fingerprint, activated_at, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, NULL, ?6, ?7)",
            params![
                &input.key,
                &input.customer_email,
                &input.customer_phone,
                &input.customer_name,
                &input.device_fingerprint,
                &input.expires_at,
                created_at,
            ],
        );

        match result {
            Ok(_) => Ok(License {
                key: input.key.clone(),
                customer_email: input.customer_email.clone(),
                customer_phone: input.customer_phone.clone(),
                customer_name: input.customer_name.clone(),
                status: LicenseStatus::Active,
                device_fingerprint: input.device_fingerprint.clone(),
                activated_at: None,
                expires_at: input.expires_at,
                created_at,
            }),
            Err(e) if is_unique_violation(&e) => Err(AppError::Conflict(format!(
                "License key {} already exists",
                input.key
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Administrative status transition. Revocation and expiry have no
    /// public endpoint; they are operator actions against the store.
    pub fn set_status(&self, key: &str, status: LicenseStatus) -> Result<bool> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE licenses SET status = ?2 WHERE key = ?1",
            params![key, status.as_ref()],
        )?;
        Ok(updated == 1)
    }
}

impl LicenseStore for SqliteStore {
    fn create_license(&self, input: &NewLicense) -> Result<License> {
        let conn = self.pool.get()?;
        Self::insert_license(&conn, input, now())
    }

    fn get_license(&self, key: &str) -> Result<Option<License>> {
        let conn = self.pool.get()?;
        let license = conn
            .query_row(
                &format!("SELECT {} FROM licenses WHERE key = ?1", LICENSE_COLS),
                params![key],
                license_from_row,
            )
            .optional()?;
        Ok(license)
    }

    fn list_licenses(&self) -> Result<Vec<License>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM licenses ORDER BY created_at DESC",
            LICENSE_COLS
        ))?;
        let rows = stmt.query_map([], license_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn bind_device(&self, key: &str, fingerprint: &str, now: i64) -> Result<BindOutcome> {
        let conn = self.pool.get()?;

        // Single conditional write: binds iff active, unexpired, and the
        // device slot is empty or already ours. Concurrent activations with
        // different fingerprints race on this statement; at most one wins.
        let bound = conn.execute(
            "UPDATE licenses
                SET device_fingerprint = ?2,
                    activated_at = COALESCE(activated_at, ?3)
              WHERE key = ?1
                AND status = 'active'
                AND (expires_at IS NULL OR expires_at >= ?3)
                AND (device_fingerprint IS NULL OR device_fingerprint = ?2)",
            params![key, fingerprint, now],
        )?;

        if bound == 1 {
            let license = self
                .get_license(key)?
                .ok_or_else(|| AppError::Internal("license vanished after bind".into()))?;
            // A bind stamped with this call's timestamp is a first
            // activation; anything older is a repeat.
            return if license.activated_at == Some(now)
                && license.device_fingerprint.as_deref() == Some(fingerprint)
            {
                Ok(BindOutcome::Bound(license))
            } else {
                Ok(BindOutcome::AlreadyBound(license))
            };
        }

        // The write did not apply; read once to say why.
        let Some(license) = self.get_license(key)? else {
            return Ok(BindOutcome::NotFound);
        };
        match license.status {
            LicenseStatus::Revoked => Ok(BindOutcome::Revoked),
            _ if license.is_expired(now) => Ok(BindOutcome::Expired),
            _ => Ok(BindOutcome::OtherDevice),
        }
    }

    fn record_attempt(&self, attempt: &ActivationAttempt) -> Result<()> {
        let conn = self.pool.get()?;
        let device_info = attempt
            .device_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO activation_attempts (id, license_key, device_fingerprint, \
             device_info, ip_address, user_agent, success, failure_reason, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                gen_id(),
                &attempt.license_key,
                &attempt.device_fingerprint,
                device_info,
                &attempt.ip_address,
                &attempt.user_agent,
                attempt.success,
                &attempt.failure_reason,
                attempt.timestamp,
            ],
        )?;
        Ok(())
    }

    fn list_attempts(&self) -> Result<Vec<ActivationAttempt>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM activation_attempts ORDER BY timestamp ASC",
            ATTEMPT_COLS
        ))?;
        let rows = stmt.query_map([], attempt_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl PaymentStore for SqliteStore {
    fn create_payment(&self, input: &NewPaymentRequest) -> Result<PaymentRequest> {
        let conn = self.pool.get()?;
        let created_at = now();

        let result = conn.execute(
            "INSERT INTO payment_requests (transaction_code, payment_method, email, phone, \
             name, amount, currency, device_fingerprint, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
            params![
                &input.transaction_code,
                input.payment_method.as_ref(),
                &input.email,
                &input.phone,
                &input.name,
                input.amount,
                &input.currency,
                &input.device_fingerprint,
                created_at,
            ],
        );

        match result {
            Ok(_) => Ok(PaymentRequest {
                transaction_code: input.transaction_code.clone(),
                payment_method: input.payment_method,
                email: input.email.clone(),
                phone: input.phone.clone(),
                name: input.name.clone(),
                amount: input.amount,
                currency: input.currency.clone(),
                device_fingerprint: input.device_fingerprint.clone(),
                status: PaymentStatus::Pending,
                created_at,
                resolved_at: None,
                resolved_by: None,
                rejection_reason: None,
            }),
            Err(e) if is_unique_violation(&e) => Err(AppError::Conflict(
                "This transaction code has already been submitted".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn get_payment(&self, code: &str) -> Result<Option<PaymentRequest>> {
        let conn = self.pool.get()?;
        let payment = conn
            .query_row(
                &format!(
                    "SELECT {} FROM payment_requests WHERE transaction_code = ?1",
                    PAYMENT_COLS
                ),
                params![code],
                payment_from_row,
            )
            .optional()?;
        Ok(payment)
    }

    fn list_payments(&self, include_resolved: bool) -> Result<Vec<PaymentRequest>> {
        let conn = self.pool.get()?;
        let sql = if include_resolved {
            format!(
                "SELECT {} FROM payment_requests ORDER BY created_at DESC",
                PAYMENT_COLS
            )
        } else {
            format!(
                "SELECT {} FROM payment_requests WHERE status = 'pending' \
                 ORDER BY created_at DESC",
                PAYMENT_COLS
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], payment_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn verify_and_mint(
        &self,
        code: &str,
        operator: &str,
        license: &NewLicense,
        now: i64,
    ) -> Result<(PaymentRequest, License)> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        // Conditional transition; `status = 'pending'` closes the
        // double-resolution race.
        let updated = tx.execute(
            "UPDATE payment_requests
                SET status = 'verified', resolved_at = ?2, resolved_by = ?3
              WHERE transaction_code = ?1 AND status = 'pending'",
            params![code, now, operator],
        )?;

        if updated == 0 {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT status FROM payment_requests WHERE transaction_code = ?1",
                    params![code],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match existing {
                None => AppError::NotFound("Payment request not found".into()),
                Some(status) => AppError::Conflict(format!(
                    "Payment request has already been resolved ({status})"
                )),
            });
        }

        // Mint inside the same transaction: a verified claim with no
        // license (or the reverse) can never be observed.
        let minted = Self::insert_license(&tx, license, now)?;

        let payment = tx.query_row(
            &format!(
                "SELECT {} FROM payment_requests WHERE transaction_code = ?1",
                PAYMENT_COLS
            ),
            params![code],
            payment_from_row,
        )?;

        tx.commit()?;
        Ok((payment, minted))
    }

    fn reject_payment(
        &self,
        code: &str,
        operator: &str,
        reason: &str,
        now: i64,
    ) -> Result<PaymentRequest> {
        let conn = self.pool.get()?;

        let updated = conn.execute(
            "UPDATE payment_requests
                SET status = 'rejected', resolved_at = ?2, resolved_by = ?3,
                    rejection_reason = ?4
              WHERE transaction_code = ?1 AND status = 'pending'",
            params![code, now, operator, reason],
        )?;

        if updated == 0 {
            let existing = self.get_payment(code)?;
            return Err(match existing {
                None => AppError::NotFound("Payment request not found".into()),
                Some(p) => AppError::Conflict(format!(
                    "Payment request has already been resolved ({})",
                    p.status.as_ref()
                )),
            });
        }

        self.get_payment(code)?
            .ok_or_else(|| AppError::Internal("payment vanished after reject".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{generate_key, PaymentMethod};

    fn open_temp() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        (store, dir)
    }

    fn new_license(key: &str) -> NewLicense {
        NewLicense {
            key: key.to_string(),
            customer_email: "jane@example.com".into(),
            customer_phone: "254712345678".into(),
            customer_name: Some("Jane".into()),
            device_fingerprint: None,
            expires_at: None,
        }
    }

    fn new_payment(code: &str) -> NewPaymentRequest {
        NewPaymentRequest {
            transaction_code: code.to_string(),
            payment_method: PaymentMethod::Mpesa,
            email: "jane@example.com".into(),
            phone: "254712345678".into(),
            name: None,
            amount: Some(20000.0),
            currency: Some("KES".into()),
            device_fingerprint: None,
        }
    }

    #[test]
    fn bind_is_first_writer_wins() {
        let (store, _dir) = open_temp();
        store.create_license(&new_license("EIMS-AAAA-BBBB-CCCC")).unwrap();

        let first = store.bind_device("EIMS-AAAA-BBBB-CCCC", "dev-1", 100).unwrap();
        assert!(matches!(first, BindOutcome::Bound(_)));

        let same = store.bind_device("EIMS-AAAA-BBBB-CCCC", "dev-1", 200).unwrap();
        assert!(matches!(same, BindOutcome::AlreadyBound(_)));

        let other = store.bind_device("EIMS-AAAA-BBBB-CCCC", "dev-2", 300).unwrap();
        assert!(matches!(other, BindOutcome::OtherDevice));
    }

    #[test]
    fn bind_respects_expiry() {
        let (store, _dir) = open_temp();
        let mut input = new_license("EIMS-AAAA-BBBB-CCCC");
        input.expires_at = Some(50);
        store.create_license(&input).unwrap();

        let outcome = store.bind_device("EIMS-AAAA-BBBB-CCCC", "dev-1", 100).unwrap();
        assert!(matches!(outcome, BindOutcome::Expired));
    }

    #[test]
    fn bind_refuses_revoked_license() {
        let (store, _dir) = open_temp();
        store.create_license(&new_license("EIMS-AAAA-BBBB-CCCC")).unwrap();
        assert!(store
            .set_status("EIMS-AAAA-BBBB-CCCC", LicenseStatus::Revoked)
            .unwrap());

        let outcome = store.bind_device("EIMS-AAAA-BBBB-CCCC", "dev-1", 100).unwrap();
        assert!(matches!(outcome, BindOutcome::Revoked));
    }

    #[test]
    fn bind_unknown_key() {
        let (store, _dir) = open_temp();
        let outcome = store.bind_device("EIMS-ZZZZ-ZZZZ-ZZZZ", "dev-1", 100).unwrap();
        assert!(matches!(outcome, BindOutcome::NotFound));
    }

    #[test]
    fn duplicate_payment_rejected() {
        let (store, _dir) = open_temp();
        store.create_payment(&new_payment("ABC12345")).unwrap();

        let err = store.create_payment(&new_payment("ABC12345")).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn verify_mints_atomically_and_only_once() {
        let (store, _dir) = open_temp();
        store.create_payment(&new_payment("ABC12345")).unwrap();

        let key = generate_key();
        let (payment, minted) = store
            .verify_and_mint("ABC12345", "admin", &new_license(&key), 100)
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Verified);
        assert_eq!(payment.resolved_by.as_deref(), Some("admin"));
        assert_eq!(minted.key, key);
        assert!(store.get_license(&key).unwrap().is_some());

        // Terminal: a second resolve of any kind fails.
        let err = store
            .verify_and_mint("ABC12345", "admin", &new_license(&generate_key()), 200)
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let err = store
            .reject_payment("ABC12345", "admin", "nope", 200)
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn verify_rolls_back_when_mint_fails() {
        let (store, _dir) = open_temp();
        store.create_payment(&new_payment("ABC12345")).unwrap();
        store.create_license(&new_license("EIMS-AAAA-BBBB-CCCC")).unwrap();

        // Minting collides with an existing key; the claim must stay pending.
        let err = store
            .verify_and_mint("ABC12345", "admin", &new_license("EIMS-AAAA-BBBB-CCCC"), 100)
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let payment = store.get_payment("ABC12345").unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
    }

    #[test]
    fn pending_filter() {
        let (store, _dir) = open_temp();
        store.create_payment(&new_payment("AAA11111")).unwrap();
        store.create_payment(&new_payment("BBB22222")).unwrap();
        store.reject_payment("AAA11111", "admin", "no match", 100).unwrap();

        assert_eq!(store.list_payments(false).unwrap().len(), 1);
        assert_eq!(store.list_payments(true).unwrap().len(), 2);
    }

    #[test]
    fn audit_log_appends() {
        let (store, _dir) = open_temp();
        let attempt = ActivationAttempt {
            license_key: "EIMS-AAAA-BBBB-CCCC".into(),
            device_fingerprint: "dev-1".into(),
            device_info: Some(serde_json::json!({"os": "linux"})),
            ip_address: Some("203.0.113.9".into()),
            user_agent: None,
            success: false,
            failure_reason: Some("rate limit exceeded".into()),
            timestamp: 42,
        };
        store.record_attempt(&attempt).unwrap();
        store.record_attempt(&attempt).unwrap();

        let attempts = store.list_attempts().unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].failure_reason.as_deref(), Some("rate limit exceeded"));
    }
}
