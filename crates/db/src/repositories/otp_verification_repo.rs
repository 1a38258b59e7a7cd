//! Repository for the `otp_verifications` audit table.

use lendo_core::types::Timestamp;
use sqlx::PgPool;

use crate::models::otp_verification::OtpVerification;

/// Column list for `otp_verifications` queries.
const COLUMNS: &str = "\
    id, session_id, identifier, otp_type, code, expires_at, \
    attempts, max_attempts, is_used, is_verified, resend_count, \
    created_at, updated_at";

/// Provides audit-trail operations for OTP verification episodes.
///
/// All writes here are best-effort from the caller's point of view: the
/// hot verify path is served by the fast shared store, and audit failures
/// are logged by the caller rather than escalated.
pub struct OtpVerificationRepo;

impl OtpVerificationRepo {
    /// Create the audit row for a fresh session, or reset an existing row
    /// with the same `session_id`.
    ///
    /// The upsert (rather than a plain insert) tolerates rare duplicate
    /// create calls racing on the same session id.
    pub async fn upsert_session(
        pool: &PgPool,
        session_id: &str,
        identifier: &str,
        otp_type: &str,
        code_hash: &str,
        expires_at: Timestamp,
        max_attempts: i32,
    ) -> Result<OtpVerification, sqlx::Error> {
        let query = format!(
            "INSERT INTO otp_verifications \
                 (session_id, identifier, otp_type, code, expires_at, max_attempts) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (session_id) DO UPDATE SET \
                 identifier = EXCLUDED.identifier, \
                 otp_type = EXCLUDED.otp_type, \
                 code = EXCLUDED.code, \
                 expires_at = EXCLUDED.expires_at, \
                 max_attempts = EXCLUDED.max_attempts, \
                 attempts = 0, \
                 is_used = FALSE, \
                 is_verified = FALSE, \
                 updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, OtpVerification>(&query)
            .bind(session_id)
            .bind(identifier)
            .bind(otp_type)
            .bind(code_hash)
            .bind(expires_at)
            .bind(max_attempts)
            .fetch_one(pool)
            .await
    }

    /// Reissue the code on an existing episode: replace the hash, refresh
    /// the expiry, reset the per-session attempt counter, and bump
    /// `resend_count`. The row keeps its identity (one audit row per
    /// verification episode).
    pub async fn record_resend(
        pool: &PgPool,
        session_id: &str,
        code_hash: &str,
        expires_at: Timestamp,
    ) -> Result<Option<OtpVerification>, sqlx::Error> {
        let query = format!(
            "UPDATE otp_verifications SET \
                 code = $2, \
                 expires_at = $3, \
                 attempts = 0, \
                 is_verified = FALSE, \
                 resend_count = resend_count + 1, \
                 updated_at = NOW() \
             WHERE session_id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, OtpVerification>(&query)
            .bind(session_id)
            .bind(code_hash)
            .bind(expires_at)
            .fetch_optional(pool)
            .await
    }

    /// Fallback lookup by identifier and code hash (newest first) for when
    /// the session's back-reference is missing.
    pub async fn find_by_identifier_and_code(
        pool: &PgPool,
        identifier: &str,
        code_hash: &str,
    ) -> Result<Option<OtpVerification>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM otp_verifications \
             WHERE identifier = $1 AND code = $2 \
             ORDER BY created_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, OtpVerification>(&query)
            .bind(identifier)
            .bind(code_hash)
            .fetch_optional(pool)
            .await
    }

    /// Count one failed verification attempt, capped at `max_attempts`.
    pub async fn record_attempt(
        pool: &PgPool,
        session_id: &str,
    ) -> Result<Option<OtpVerification>, sqlx::Error> {
        let query = format!(
            "UPDATE otp_verifications SET \
                 attempts = LEAST(attempts + 1, max_attempts), \
                 updated_at = NOW() \
             WHERE session_id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, OtpVerification>(&query)
            .bind(session_id)
            .fetch_optional(pool)
            .await
    }

    /// Terminal success: the code was consumed by a correct match.
    pub async fn mark_verified(
        pool: &PgPool,
        session_id: &str,
    ) -> Result<Option<OtpVerification>, sqlx::Error> {
        let query = format!(
            "UPDATE otp_verifications SET \
                 is_used = TRUE, is_verified = TRUE, updated_at = NOW() \
             WHERE session_id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, OtpVerification>(&query)
            .bind(session_id)
            .fetch_optional(pool)
            .await
    }

    /// Terminal without success: every unresolved code for the identifier
    /// was invalidated (superseded by a fresh episode). Returns the number
    /// of rows closed out.
    pub async fn mark_used(pool: &PgPool, identifier: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE otp_verifications SET is_used = TRUE, updated_at = NOW() \
             WHERE identifier = $1 AND is_used = FALSE AND is_verified = FALSE",
        )
        .bind(identifier)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
