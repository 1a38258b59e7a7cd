//! OTP code generation and keyed hashing.
//!
//! Codes are stored as a deterministic HMAC-SHA256 of the plaintext under a
//! server-side secret, never as the raw code. The hash is deterministic (no
//! per-hash salt) so verification is a pure equality check against the
//! stored value.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use crate::error::CoreError;

type HmacSha256 = Hmac<Sha256>;

/// Default OTP length in digits.
pub const DEFAULT_CODE_LEN: usize = 6;

/// Generate a numeric OTP of `len` digits (leading zeros allowed).
pub fn generate_code(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

/// Compute the keyed hash of an OTP code as lowercase hex.
///
/// The same `(secret, code)` pair always yields the same digest, so the
/// verifier compares digests directly instead of re-deriving a salt.
pub fn hash_code(secret: &str, code: &str) -> Result<String, CoreError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CoreError::Internal(format!("HMAC key error: {e}")))?;
    mac.update(code.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}
