//! Durable audit trail for OTP verification episodes.
//!
//! The fast store serves the hot path; this trait mirrors each episode
//! into Postgres for compliance queries. Writes are best-effort and the
//! service layer logs rather than escalates failures here.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use lendo_core::service::OtpType;
use lendo_core::types::Timestamp;
use lendo_db::repositories::otp_verification_repo::OtpVerificationRepo;
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
#[error("audit store failure: {0}")]
pub struct AuditError(pub String);

impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        Self(err.to_string())
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Record a freshly created episode (or reset a duplicate of it).
    async fn upsert_session(
        &self,
        session_id: &str,
        identifier: &str,
        otp_type: OtpType,
        code_hash: &str,
        expires_at: Timestamp,
        max_attempts: u32,
    ) -> Result<(), AuditError>;

    /// Record a reissued code on an existing episode. Returns false when
    /// no row with that session id exists, letting the caller fall back
    /// to an upsert.
    async fn record_resend(
        &self,
        session_id: &str,
        code_hash: &str,
        expires_at: Timestamp,
    ) -> Result<bool, AuditError>;

    /// Count a failed attempt on the episode.
    async fn record_attempt(&self, session_id: &str) -> Result<(), AuditError>;

    /// Mark the episode consumed by a successful verification. Falls back
    /// to an identifier+hash lookup when the session id row is missing.
    async fn mark_verified(
        &self,
        session_id: &str,
        identifier: &str,
        code_hash: &str,
    ) -> Result<(), AuditError>;

    /// Invalidate every episode for `identifier` that was neither
    /// verified nor already invalidated: the codes those rows carry have
    /// been superseded by a fresh session.
    async fn mark_used(&self, identifier: &str) -> Result<(), AuditError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

/// [`AuditStore`] backed by the `otp_verifications` table.
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn upsert_session(
        &self,
        session_id: &str,
        identifier: &str,
        otp_type: OtpType,
        code_hash: &str,
        expires_at: Timestamp,
        max_attempts: u32,
    ) -> Result<(), AuditError> {
        OtpVerificationRepo::upsert_session(
            &self.pool,
            session_id,
            identifier,
            otp_type.as_str(),
            code_hash,
            expires_at,
            max_attempts as i32,
        )
        .await?;
        Ok(())
    }

    async fn record_resend(
        &self,
        session_id: &str,
        code_hash: &str,
        expires_at: Timestamp,
    ) -> Result<bool, AuditError> {
        let updated =
            OtpVerificationRepo::record_resend(&self.pool, session_id, code_hash, expires_at)
                .await?;
        Ok(updated.is_some())
    }

    async fn record_attempt(&self, session_id: &str) -> Result<(), AuditError> {
        OtpVerificationRepo::record_attempt(&self.pool, session_id).await?;
        Ok(())
    }

    async fn mark_verified(
        &self,
        session_id: &str,
        identifier: &str,
        code_hash: &str,
    ) -> Result<(), AuditError> {
        if OtpVerificationRepo::mark_verified(&self.pool, session_id)
            .await?
            .is_some()
        {
            return Ok(());
        }
        // Episode row was created under a different id (e.g. audit write
        // raced the resend); match on the identifier and hash instead.
        if let Some(row) =
            OtpVerificationRepo::find_by_identifier_and_code(&self.pool, identifier, code_hash)
                .await?
        {
            OtpVerificationRepo::mark_verified(&self.pool, &row.session_id).await?;
        }
        Ok(())
    }

    async fn mark_used(&self, identifier: &str) -> Result<(), AuditError> {
        OtpVerificationRepo::mark_used(&self.pool, identifier).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

/// One recorded episode, inspectable from tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub identifier: String,
    pub otp_type: OtpType,
    pub code_hash: String,
    pub expires_at: Timestamp,
    pub attempts: u32,
    pub max_attempts: u32,
    pub resend_count: u32,
    pub is_used: bool,
    pub is_verified: bool,
}

/// [`AuditStore`] kept in a mutex-guarded map. Used in tests to assert
/// what the service would have written to Postgres.
#[derive(Default)]
pub struct MemoryAuditStore {
    records: Mutex<HashMap<String, AuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<AuditRecord> {
        self.records
            .lock()
            .ok()
            .and_then(|r| r.get(session_id).cloned())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, AuditRecord>>, AuditError> {
        self.records
            .lock()
            .map_err(|e| AuditError(format!("audit lock poisoned: {e}")))
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn upsert_session(
        &self,
        session_id: &str,
        identifier: &str,
        otp_type: OtpType,
        code_hash: &str,
        expires_at: Timestamp,
        max_attempts: u32,
    ) -> Result<(), AuditError> {
        self.lock()?.insert(
            session_id.to_string(),
            AuditRecord {
                identifier: identifier.to_string(),
                otp_type,
                code_hash: code_hash.to_string(),
                expires_at,
                attempts: 0,
                max_attempts,
                resend_count: 0,
                is_used: false,
                is_verified: false,
            },
        );
        Ok(())
    }

    async fn record_resend(
        &self,
        session_id: &str,
        code_hash: &str,
        expires_at: Timestamp,
    ) -> Result<bool, AuditError> {
        let mut records = self.lock()?;
        let Some(record) = records.get_mut(session_id) else {
            return Ok(false);
        };
        record.code_hash = code_hash.to_string();
        record.expires_at = expires_at;
        record.attempts = 0;
        record.is_verified = false;
        record.resend_count += 1;
        Ok(true)
    }

    async fn record_attempt(&self, session_id: &str) -> Result<(), AuditError> {
        let mut records = self.lock()?;
        if let Some(record) = records.get_mut(session_id) {
            record.attempts = (record.attempts + 1).min(record.max_attempts);
        }
        Ok(())
    }

    async fn mark_verified(
        &self,
        session_id: &str,
        identifier: &str,
        code_hash: &str,
    ) -> Result<(), AuditError> {
        let mut records = self.lock()?;
        if let Some(record) = records.get_mut(session_id) {
            record.is_used = true;
            record.is_verified = true;
            return Ok(());
        }
        if let Some(record) = records
            .values_mut()
            .find(|r| r.identifier == identifier && r.code_hash == code_hash)
        {
            record.is_used = true;
            record.is_verified = true;
        }
        Ok(())
    }

    async fn mark_used(&self, identifier: &str) -> Result<(), AuditError> {
        let mut records = self.lock()?;
        for record in records
            .values_mut()
            .filter(|r| r.identifier == identifier && !r.is_verified && !r.is_used)
        {
            record.is_used = true;
        }
        Ok(())
    }
}
