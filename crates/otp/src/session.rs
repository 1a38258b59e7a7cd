//! Ephemeral OTP session storage with atomic create-or-reuse and verify.
//!
//! Sessions live in the fast shared store under a TTL; an
//! `identifier -> session id` reverse index detects resend eligibility.
//! Both operations are single atomic scripts so concurrent calls for the
//! same identifier or session are linearized by the store, not by this
//! process.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use lendo_core::service::OtpType;

use crate::store::{RedisStore, StoreError, IDENT_KEY_PREFIX, SESSION_KEY_PREFIX};

/// Result of create-or-reuse: the session now holding the fresh code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
    pub expires_at_ms: i64,
    /// True when an existing non-expired, non-used session was reissued.
    pub resent: bool,
}

/// Post-operation snapshot returned by verify for audit propagation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub identifier: String,
    pub otp_type: OtpType,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Raw verify result from the store; the service layer maps this (plus the
/// attempts policy) onto the caller-facing outcome set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawVerify {
    /// No live session: never existed, expired, or evicted by TTL.
    Missing,
    /// The session was already consumed.
    AlreadyUsed,
    /// Correct code; the session is now used+verified.
    Verified(SessionSnapshot),
    /// Wrong code; `attempts` reflects the increment (capped at max).
    Mismatch(SessionSnapshot),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Reuse the identifier's live session (replacing its code hash and
    /// resetting attempts) or create a fresh one under `fresh_id`.
    #[allow(clippy::too_many_arguments)]
    async fn create_or_reuse(
        &self,
        identifier: &str,
        otp_type: OtpType,
        code_hash: &str,
        ttl_ms: i64,
        max_attempts: u32,
        fresh_id: &str,
        now_ms: i64,
    ) -> Result<SessionHandle, StoreError>;

    /// Atomically check `code_hash` against the stored hash, consuming the
    /// session on a match and counting the attempt on a mismatch.
    async fn verify(
        &self,
        session_id: &str,
        code_hash: &str,
        now_ms: i64,
    ) -> Result<RawVerify, StoreError>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// KEYS[1] = reverse index key. ARGV: now_ms, fresh_id, code_hash, ttl_ms,
/// max_attempts, identifier, otp_type, session key prefix.
///
/// Reuses the indexed session when it is neither used nor expired;
/// otherwise writes a fresh session hash and repoints the index.
const CREATE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local ttl = tonumber(ARGV[4])
local sid = redis.call('GET', KEYS[1])
if sid then
    local skey = ARGV[8] .. sid
    local used = redis.call('HGET', skey, 'is_used')
    local exp = redis.call('HGET', skey, 'expires_at_ms')
    if used == '0' and exp and tonumber(exp) > now then
        local new_exp = now + ttl
        redis.call('HSET', skey,
            'code_hash', ARGV[3], 'attempts', '0', 'is_verified', '0',
            'expires_at_ms', tostring(new_exp))
        redis.call('PEXPIRE', skey, ttl)
        redis.call('SET', KEYS[1], sid, 'PX', ttl)
        return {1, sid, new_exp}
    end
end
local skey = ARGV[8] .. ARGV[2]
local new_exp = now + ttl
redis.call('HSET', skey,
    'identifier', ARGV[6], 'otp_type', ARGV[7], 'code_hash', ARGV[3],
    'attempts', '0', 'max_attempts', ARGV[5], 'is_used', '0',
    'is_verified', '0', 'expires_at_ms', tostring(new_exp))
redis.call('PEXPIRE', skey, ttl)
redis.call('SET', KEYS[1], ARGV[2], 'PX', ttl)
return {0, ARGV[2], new_exp}
"#;

/// KEYS[1] = session key. ARGV: now_ms, submitted code hash.
///
/// Expired sessions report `missing` without counting an attempt; a match
/// flips used+verified in the same script invocation, so exactly one
/// concurrent caller can observe `ok`.
const VERIFY_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return {'missing'}
end
local exp = tonumber(redis.call('HGET', KEYS[1], 'expires_at_ms'))
if not exp or exp <= tonumber(ARGV[1]) then
    return {'missing'}
end
if redis.call('HGET', KEYS[1], 'is_used') == '1' then
    return {'used'}
end
local identifier = redis.call('HGET', KEYS[1], 'identifier')
local otp_type = redis.call('HGET', KEYS[1], 'otp_type')
local max = tonumber(redis.call('HGET', KEYS[1], 'max_attempts'))
local att = tonumber(redis.call('HGET', KEYS[1], 'attempts'))
if redis.call('HGET', KEYS[1], 'code_hash') == ARGV[2] then
    redis.call('HSET', KEYS[1], 'is_used', '1', 'is_verified', '1')
    return {'ok', identifier, otp_type, tostring(att), tostring(max)}
end
if att < max then
    att = att + 1
    redis.call('HSET', KEYS[1], 'attempts', tostring(att))
end
return {'bad', identifier, otp_type, tostring(att), tostring(max)}
"#;

/// [`SessionStore`] backed by Redis hashes plus a reverse index.
pub struct RedisSessionStore {
    store: RedisStore,
    create_script: redis::Script,
    verify_script: redis::Script,
}

impl RedisSessionStore {
    pub fn new(store: RedisStore) -> Self {
        Self {
            store,
            create_script: redis::Script::new(CREATE_SCRIPT),
            verify_script: redis::Script::new(VERIFY_SCRIPT),
        }
    }

    fn ident_key(identifier: &str, otp_type: OtpType) -> String {
        format!("{IDENT_KEY_PREFIX}{}:{identifier}", otp_type.as_str())
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create_or_reuse(
        &self,
        identifier: &str,
        otp_type: OtpType,
        code_hash: &str,
        ttl_ms: i64,
        max_attempts: u32,
        fresh_id: &str,
        now_ms: i64,
    ) -> Result<SessionHandle, StoreError> {
        let mut conn = self.store.connection();
        let (resent, session_id, expires_at_ms): (i64, String, i64) = self
            .create_script
            .key(Self::ident_key(identifier, otp_type))
            .arg(now_ms)
            .arg(fresh_id)
            .arg(code_hash)
            .arg(ttl_ms)
            .arg(max_attempts)
            .arg(identifier)
            .arg(otp_type.as_str())
            .arg(SESSION_KEY_PREFIX)
            .invoke_async(&mut conn)
            .await?;

        Ok(SessionHandle {
            session_id,
            expires_at_ms,
            resent: resent == 1,
        })
    }

    async fn verify(
        &self,
        session_id: &str,
        code_hash: &str,
        now_ms: i64,
    ) -> Result<RawVerify, StoreError> {
        let mut conn = self.store.connection();
        let reply: Vec<String> = self
            .verify_script
            .key(format!("{SESSION_KEY_PREFIX}{session_id}"))
            .arg(now_ms)
            .arg(code_hash)
            .invoke_async(&mut conn)
            .await?;

        parse_verify_reply(&reply)
    }
}

fn parse_verify_reply(reply: &[String]) -> Result<RawVerify, StoreError> {
    let snapshot = |parts: &[String]| -> Result<SessionSnapshot, StoreError> {
        let [identifier, otp_type, attempts, max_attempts] = parts else {
            return Err(StoreError::Corrupt(format!(
                "unexpected verify reply tail: {parts:?}"
            )));
        };
        Ok(SessionSnapshot {
            identifier: identifier.clone(),
            otp_type: OtpType::parse(otp_type)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            attempts: attempts
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("bad attempts: {attempts}")))?,
            max_attempts: max_attempts
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("bad max_attempts: {max_attempts}")))?,
        })
    };

    match reply {
        [tag] if tag == "missing" => Ok(RawVerify::Missing),
        [tag] if tag == "used" => Ok(RawVerify::AlreadyUsed),
        [tag, rest @ ..] if tag == "ok" => Ok(RawVerify::Verified(snapshot(rest)?)),
        [tag, rest @ ..] if tag == "bad" => Ok(RawVerify::Mismatch(snapshot(rest)?)),
        other => Err(StoreError::Corrupt(format!(
            "unexpected verify reply: {other:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemorySession {
    identifier: String,
    otp_type: OtpType,
    code_hash: String,
    attempts: u32,
    max_attempts: u32,
    is_used: bool,
    expires_at_ms: i64,
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, MemorySession>,
    by_identifier: HashMap<String, String>,
}

/// Process-local [`SessionStore`] with the same semantics as the Redis
/// scripts, serialized by one mutex. Used in tests.
#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<MemoryState>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Corrupt(format!("session lock poisoned: {e}")))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_or_reuse(
        &self,
        identifier: &str,
        otp_type: OtpType,
        code_hash: &str,
        ttl_ms: i64,
        max_attempts: u32,
        fresh_id: &str,
        now_ms: i64,
    ) -> Result<SessionHandle, StoreError> {
        let mut state = self.lock()?;
        let ident_key = format!("{}:{identifier}", otp_type.as_str());
        let expires_at_ms = now_ms + ttl_ms;

        if let Some(sid) = state.by_identifier.get(&ident_key).cloned() {
            if let Some(session) = state.sessions.get_mut(&sid) {
                if !session.is_used && session.expires_at_ms > now_ms {
                    session.code_hash = code_hash.to_string();
                    session.attempts = 0;
                    session.expires_at_ms = expires_at_ms;
                    return Ok(SessionHandle {
                        session_id: sid,
                        expires_at_ms,
                        resent: true,
                    });
                }
            }
        }

        state.sessions.insert(
            fresh_id.to_string(),
            MemorySession {
                identifier: identifier.to_string(),
                otp_type,
                code_hash: code_hash.to_string(),
                attempts: 0,
                max_attempts,
                is_used: false,
                expires_at_ms,
            },
        );
        state.by_identifier.insert(ident_key, fresh_id.to_string());

        Ok(SessionHandle {
            session_id: fresh_id.to_string(),
            expires_at_ms,
            resent: false,
        })
    }

    async fn verify(
        &self,
        session_id: &str,
        code_hash: &str,
        now_ms: i64,
    ) -> Result<RawVerify, StoreError> {
        let mut state = self.lock()?;
        let Some(session) = state.sessions.get_mut(session_id) else {
            return Ok(RawVerify::Missing);
        };
        if session.expires_at_ms <= now_ms {
            return Ok(RawVerify::Missing);
        }
        if session.is_used {
            return Ok(RawVerify::AlreadyUsed);
        }

        if session.code_hash == code_hash {
            session.is_used = true;
            Ok(RawVerify::Verified(SessionSnapshot {
                identifier: session.identifier.clone(),
                otp_type: session.otp_type,
                attempts: session.attempts,
                max_attempts: session.max_attempts,
            }))
        } else {
            if session.attempts < session.max_attempts {
                session.attempts += 1;
            }
            Ok(RawVerify::Mismatch(SessionSnapshot {
                identifier: session.identifier.clone(),
                otp_type: session.otp_type,
                attempts: session.attempts,
                max_attempts: session.max_attempts,
            }))
        }
    }
}
