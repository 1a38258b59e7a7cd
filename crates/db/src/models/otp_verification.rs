//! OTP verification audit entity model.

use lendo_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `otp_verifications` table, one per verification episode.
///
/// The row is reused across resends of the same session (`resend_count`
/// increments, `code` is replaced, `attempts` resets) and becomes terminal
/// when `is_used` is set. The hot verify path lives in the fast shared
/// store; this row is the durable audit trail.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OtpVerification {
    pub id: DbId,
    pub session_id: String,
    pub identifier: String,
    pub otp_type: String,
    /// Keyed HMAC hash of the code, never the plaintext.
    pub code: String,
    pub expires_at: Timestamp,
    pub attempts: i32,
    pub max_attempts: i32,
    pub is_used: bool,
    pub is_verified: bool,
    pub resend_count: i32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}
