//! Atomic sliding-window consumption over the fast shared store.
//!
//! [`SlidingWindowStore::consume`] evaluates one or more windows as a unit:
//! either every window has capacity and one entry is recorded in each, or
//! nothing is recorded and the decision names the limiting window. The
//! Redis implementation performs the whole read-check-write in a single
//! Lua script so concurrent callers for the same identifier cannot slip
//! past the limit between the read and the write.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use lendo_core::window;

use crate::store::{RedisStore, StoreError};

/// One window to evaluate: a store key, its duration, and its entry limit.
#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub key: String,
    pub window_ms: i64,
    pub limit: u32,
}

/// Outcome of an atomic multi-window consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowDecision {
    /// Every window had capacity; one entry was recorded in each.
    /// `counts[i]` is the entry count of window `i` after recording.
    Allowed { counts: Vec<u32> },
    /// Window `index` was at its limit; nothing was recorded anywhere.
    Denied {
        index: usize,
        current_count: u32,
        retry_after_ms: i64,
    },
}

#[async_trait]
pub trait SlidingWindowStore: Send + Sync {
    /// Atomically evaluate all `specs` at time `now_ms` and record one
    /// entry per window if every window has capacity.
    async fn consume(
        &self,
        specs: &[WindowSpec],
        now_ms: i64,
    ) -> Result<WindowDecision, StoreError>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Evaluate-and-record across N sorted sets in one atomic script.
///
/// Per key: evict entries older than the window, count survivors, and on
/// any full window report `{0, index, count, retry_after}` computed from
/// the oldest survivor. Only when every window has room does the second
/// pass insert a uniquely-named member and refresh the key TTL.
const CONSUME_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
for i = 1, #KEYS do
    local window = tonumber(ARGV[2 * i + 1])
    local limit = tonumber(ARGV[2 * i + 2])
    redis.call('ZREMRANGEBYSCORE', KEYS[i], 0, now - window)
    local count = redis.call('ZCARD', KEYS[i])
    if count >= limit then
        local oldest = redis.call('ZRANGE', KEYS[i], 0, 0, 'WITHSCORES')
        local retry = window - (now - tonumber(oldest[2]))
        if retry < 0 then retry = 0 end
        return {0, i, count, retry}
    end
end
local result = {1}
for i = 1, #KEYS do
    local window = tonumber(ARGV[2 * i + 1])
    redis.call('ZADD', KEYS[i], now, ARGV[2] .. ':' .. i)
    redis.call('PEXPIRE', KEYS[i], window)
    result[i + 1] = redis.call('ZCARD', KEYS[i])
end
return result
"#;

/// [`SlidingWindowStore`] backed by Redis sorted sets.
pub struct RedisWindowStore {
    store: RedisStore,
    script: redis::Script,
}

impl RedisWindowStore {
    pub fn new(store: RedisStore) -> Self {
        Self {
            store,
            script: redis::Script::new(CONSUME_SCRIPT),
        }
    }
}

#[async_trait]
impl SlidingWindowStore for RedisWindowStore {
    async fn consume(
        &self,
        specs: &[WindowSpec],
        now_ms: i64,
    ) -> Result<WindowDecision, StoreError> {
        let mut invocation = self.script.prepare_invoke();
        invocation.arg(now_ms);
        // Unique member token so two entries in the same millisecond both count.
        invocation.arg(uuid::Uuid::new_v4().to_string());
        for spec in specs {
            invocation.key(&spec.key);
            invocation.arg(spec.window_ms);
            invocation.arg(spec.limit);
        }

        let mut conn = self.store.connection();
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;

        match reply.as_slice() {
            [1, counts @ ..] => Ok(WindowDecision::Allowed {
                counts: counts.iter().map(|&c| c as u32).collect(),
            }),
            [0, index, count, retry] => Ok(WindowDecision::Denied {
                // Lua indexes from 1.
                index: (*index as usize).saturating_sub(1),
                current_count: *count as u32,
                retry_after_ms: *retry,
            }),
            other => Err(StoreError::Corrupt(format!(
                "unexpected window script reply: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

/// Process-local [`SlidingWindowStore`] used as the degraded-mode fallback
/// when the shared store is unreachable, and as the test double.
///
/// A single mutex serializes all callers, which gives the same
/// read-check-write atomicity as the Lua script, but only within this
/// process.
#[derive(Default)]
pub struct MemoryWindowStore {
    windows: Mutex<HashMap<String, Vec<i64>>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlidingWindowStore for MemoryWindowStore {
    async fn consume(
        &self,
        specs: &[WindowSpec],
        now_ms: i64,
    ) -> Result<WindowDecision, StoreError> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|e| StoreError::Corrupt(format!("window lock poisoned: {e}")))?;

        for (index, spec) in specs.iter().enumerate() {
            let entries = windows.entry(spec.key.clone()).or_default();
            window::prune(entries, now_ms, spec.window_ms);
            if !window::has_capacity(entries, spec.limit) {
                return Ok(WindowDecision::Denied {
                    index,
                    current_count: entries.len() as u32,
                    retry_after_ms: window::retry_after_ms(entries, now_ms, spec.window_ms),
                });
            }
        }

        let mut counts = Vec::with_capacity(specs.len());
        for spec in specs {
            let entries = windows.entry(spec.key.clone()).or_default();
            entries.push(now_ms);
            counts.push(entries.len() as u32);
        }
        Ok(WindowDecision::Allowed { counts })
    }
}
