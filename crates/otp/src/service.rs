//! OTP protocol facade: create (with resend reuse) and verify.
//!
//! Callers receive a closed set of outcomes. Infrastructure failures of
//! the fast store surface as errors; audit failures never do.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lendo_core::error::CoreError;
use lendo_core::otp::hash_code;
use lendo_core::service::OtpType;
use lendo_core::types::Timestamp;
use uuid::Uuid;

use crate::audit::AuditStore;
use crate::rate_limiter::{AttemptsDecision, RateLimiter, SendDecision, SendScope};
use crate::session::{RawVerify, SessionStore};
use crate::store::StoreError;

/// Infrastructure failure on the hot path.
#[derive(Debug, thiserror::Error)]
pub enum OtpError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Outcome set for session creation.
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    /// A send-rate window for this identifier is full. Callers render
    /// this distinctly from the attempts denial; retrying the send later
    /// is expected.
    #[error("send rate exceeded, retry in {retry_after_ms}ms")]
    SendRateExceeded {
        scope: SendScope,
        retry_after_ms: i64,
    },
    /// The shared attempts budget for this identifier is exhausted.
    #[error("too many attempts, retry in {retry_after_ms}ms")]
    TooManyAttempts { retry_after_ms: i64 },
    #[error(transparent)]
    Otp(#[from] OtpError),
}

impl From<StoreError> for CreateError {
    fn from(err: StoreError) -> Self {
        Self::Otp(err.into())
    }
}

impl From<CoreError> for CreateError {
    fn from(err: CoreError) -> Self {
        Self::Otp(err.into())
    }
}

/// Successful creation: the session now carrying the caller's code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedOtp {
    pub session_id: String,
    pub expires_at: Timestamp,
    /// True when an existing episode's code was reissued.
    pub resent: bool,
}

/// Outcome set for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    /// Wrong code; `attempts` is the session's failed-attempt count.
    Invalid { attempts: u32 },
    /// Session missing or past its TTL.
    Expired,
    AlreadyUsed,
    /// Wrong code and the shared attempts budget is now exhausted.
    TooManyAttempts { attempts: u32, retry_after_ms: i64 },
}

#[derive(Debug, Clone)]
pub struct OtpConfig {
    /// Server-side HMAC key; codes are stored only as keyed hashes.
    pub hash_secret: String,
    pub max_attempts: u32,
}

impl OtpConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        let hash_secret = std::env::var("OTP_HASH_SECRET")
            .map_err(|_| CoreError::Validation("OTP_HASH_SECRET is not set".into()))?;
        Ok(Self {
            hash_secret,
            max_attempts: 3,
        })
    }
}

pub struct OtpService {
    sessions: Arc<dyn SessionStore>,
    limiter: RateLimiter,
    audit: Arc<dyn AuditStore>,
    config: OtpConfig,
}

impl OtpService {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        limiter: RateLimiter,
        audit: Arc<dyn AuditStore>,
        config: OtpConfig,
    ) -> Self {
        Self {
            sessions,
            limiter,
            audit,
            config,
        }
    }

    /// Create a session for `identifier` carrying `code`, reusing a live
    /// session when one exists (resend). Both rate policies are consumed
    /// here, on the request path, so the caller gets the denial (and its
    /// `retry_after_ms`) immediately rather than from a queued job: every
    /// call draws one send from the send-rate windows and one unit of the
    /// shared attempts budget.
    pub async fn create_session(
        &self,
        identifier: &str,
        otp_type: OtpType,
        code: &str,
        ttl: Duration,
    ) -> Result<CreatedOtp, CreateError> {
        self.create_session_at(identifier, otp_type, code, ttl, Utc::now().timestamp_millis())
            .await
    }

    pub async fn create_session_at(
        &self,
        identifier: &str,
        otp_type: OtpType,
        code: &str,
        ttl: Duration,
        now_ms: i64,
    ) -> Result<CreatedOtp, CreateError> {
        if let SendDecision::Denied {
            scope,
            retry_after_ms,
        } = self.limiter.consume_send_at(identifier, now_ms).await
        {
            return Err(CreateError::SendRateExceeded {
                scope,
                retry_after_ms,
            });
        }

        match self.limiter.consume_attempt_at(identifier, now_ms).await {
            AttemptsDecision::Allowed { .. } => {}
            AttemptsDecision::Denied { retry_after_ms } => {
                return Err(CreateError::TooManyAttempts { retry_after_ms });
            }
        }

        let code_hash = hash_code(&self.config.hash_secret, code)?;
        let fresh_id = Uuid::new_v4().to_string();
        let handle = self
            .sessions
            .create_or_reuse(
                identifier,
                otp_type,
                &code_hash,
                ttl.as_millis() as i64,
                self.config.max_attempts,
                &fresh_id,
                now_ms,
            )
            .await?;

        let expires_at = timestamp_from_ms(handle.expires_at_ms);
        self.audit_created(identifier, otp_type, &code_hash, &handle.session_id, expires_at, handle.resent)
            .await;

        Ok(CreatedOtp {
            session_id: handle.session_id,
            expires_at,
            resent: handle.resent,
        })
    }

    /// Atomically verify `code` against the session. Exactly one caller
    /// can observe `Verified` for a given session.
    pub async fn verify_session(
        &self,
        session_id: &str,
        code: &str,
    ) -> Result<VerifyOutcome, OtpError> {
        self.verify_session_at(session_id, code, Utc::now().timestamp_millis())
            .await
    }

    pub async fn verify_session_at(
        &self,
        session_id: &str,
        code: &str,
        now_ms: i64,
    ) -> Result<VerifyOutcome, OtpError> {
        let code_hash = hash_code(&self.config.hash_secret, code)?;

        match self.sessions.verify(session_id, &code_hash, now_ms).await? {
            RawVerify::Missing => Ok(VerifyOutcome::Expired),
            RawVerify::AlreadyUsed => Ok(VerifyOutcome::AlreadyUsed),
            RawVerify::Verified(snap) => {
                // Reconcile the audit row off the hot path.
                let audit = Arc::clone(&self.audit);
                let sid = session_id.to_string();
                tokio::spawn(async move {
                    if let Err(err) = audit
                        .mark_verified(&sid, &snap.identifier, &code_hash)
                        .await
                    {
                        tracing::warn!(session_id = %sid, error = %err, "audit mark_verified failed");
                    }
                });
                Ok(VerifyOutcome::Verified)
            }
            RawVerify::Mismatch(snap) => {
                let audit = Arc::clone(&self.audit);
                let sid = session_id.to_string();
                tokio::spawn(async move {
                    if let Err(err) = audit.record_attempt(&sid).await {
                        tracing::warn!(session_id = %sid, error = %err, "audit record_attempt failed");
                    }
                });

                // Failed attempts draw from the same budget as sends.
                match self
                    .limiter
                    .consume_attempt_at(&snap.identifier, now_ms)
                    .await
                {
                    AttemptsDecision::Allowed { .. } => Ok(VerifyOutcome::Invalid {
                        attempts: snap.attempts,
                    }),
                    AttemptsDecision::Denied { retry_after_ms } => {
                        Ok(VerifyOutcome::TooManyAttempts {
                            attempts: snap.attempts,
                            retry_after_ms,
                        })
                    }
                }
            }
        }
    }

    async fn audit_created(
        &self,
        identifier: &str,
        otp_type: OtpType,
        code_hash: &str,
        session_id: &str,
        expires_at: Timestamp,
        resent: bool,
    ) {
        let result = if resent {
            match self
                .audit
                .record_resend(session_id, code_hash, expires_at)
                .await
            {
                // The prior row vanished (e.g. audit write raced); fall
                // back to recreating it.
                Ok(false) => {
                    self.audit
                        .upsert_session(
                            session_id,
                            identifier,
                            otp_type,
                            code_hash,
                            expires_at,
                            self.config.max_attempts,
                        )
                        .await
                }
                other => other.map(|_| ()),
            }
        } else {
            // A fresh episode supersedes whatever codes were still
            // outstanding for the identifier.
            if let Err(err) = self.audit.mark_used(identifier).await {
                tracing::warn!(identifier, error = %err, "audit mark_used failed");
            }
            self.audit
                .upsert_session(
                    session_id,
                    identifier,
                    otp_type,
                    code_hash,
                    expires_at,
                    self.config.max_attempts,
                )
                .await
        };

        if let Err(err) = result {
            tracing::warn!(%session_id, error = %err, "audit create write failed");
        }
    }
}

fn timestamp_from_ms(ms: i64) -> Timestamp {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
}
