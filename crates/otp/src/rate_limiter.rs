//! The two named rate-limit policies over the sliding-window store.
//!
//! - **Send-rate policy**: two nested windows (per-minute and per-hour)
//!   evaluated together; an OTP send is allowed only if both have room.
//! - **Attempts policy**: one configurable window shared by OTP sends and
//!   failed verification attempts, a single abuse budget per identifier.
//!
//! Decisions are infallible from the caller's point of view: when the
//! shared store is unreachable the limiter falls back to a process-local
//! window store (an explicitly weaker guarantee) and logs a warning on
//! every degraded decision.

use std::sync::Arc;

use crate::store::{ATTEMPTS_KEY_PREFIX, RATE_KEY_PREFIX};
use crate::windows::{MemoryWindowStore, SlidingWindowStore, WindowDecision, WindowSpec};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

/// Limits for the send-rate policy (both windows must have capacity).
#[derive(Debug, Clone, Copy)]
pub struct SendRateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
}

/// Limits for the shared attempts budget.
#[derive(Debug, Clone, Copy)]
pub struct AttemptsLimits {
    pub window_ms: i64,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub send: SendRateLimits,
    pub attempts: AttemptsLimits,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            send: SendRateLimits {
                per_minute: 3,
                per_hour: 10,
            },
            attempts: AttemptsLimits {
                window_ms: HOUR_MS,
                limit: 5,
            },
        }
    }
}

/// Which send-rate window denied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendScope {
    Minute,
    Hour,
}

/// Decision from the send-rate policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDecision {
    Allowed,
    Denied {
        scope: SendScope,
        retry_after_ms: i64,
    },
}

/// Decision from the attempts policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptsDecision {
    Allowed { current_count: u32 },
    Denied { retry_after_ms: i64 },
}

/// Sliding-window rate limiter with a degraded in-process fallback.
pub struct RateLimiter {
    store: Arc<dyn SlidingWindowStore>,
    fallback: MemoryWindowStore,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SlidingWindowStore>, config: RateLimiterConfig) -> Self {
        Self {
            store,
            fallback: MemoryWindowStore::new(),
            config,
        }
    }

    /// Consume one send from both send-rate windows for `identifier`.
    pub async fn consume_send(&self, identifier: &str) -> SendDecision {
        self.consume_send_at(identifier, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// [`consume_send`](Self::consume_send) with an explicit clock, for
    /// deterministic tests.
    pub async fn consume_send_at(&self, identifier: &str, now_ms: i64) -> SendDecision {
        let specs = [
            WindowSpec {
                key: format!("{RATE_KEY_PREFIX}minute:{identifier}"),
                window_ms: MINUTE_MS,
                limit: self.config.send.per_minute,
            },
            WindowSpec {
                key: format!("{RATE_KEY_PREFIX}hour:{identifier}"),
                window_ms: HOUR_MS,
                limit: self.config.send.per_hour,
            },
        ];

        match self.consume_with_fallback(&specs, now_ms, identifier).await {
            WindowDecision::Allowed { .. } => SendDecision::Allowed,
            WindowDecision::Denied {
                index,
                retry_after_ms,
                ..
            } => SendDecision::Denied {
                scope: if index == 0 {
                    SendScope::Minute
                } else {
                    SendScope::Hour
                },
                retry_after_ms,
            },
        }
    }

    /// Consume one unit of the shared attempts budget for `identifier`.
    ///
    /// At-limit attempts are not recorded further (so the budget does not
    /// grow unboundedly under a retry storm); the denial carries the time
    /// until the oldest entry leaves the window.
    pub async fn consume_attempt(&self, identifier: &str) -> AttemptsDecision {
        self.consume_attempt_at(identifier, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// [`consume_attempt`](Self::consume_attempt) with an explicit clock.
    pub async fn consume_attempt_at(&self, identifier: &str, now_ms: i64) -> AttemptsDecision {
        let specs = [WindowSpec {
            key: format!("{ATTEMPTS_KEY_PREFIX}{identifier}"),
            window_ms: self.config.attempts.window_ms,
            limit: self.config.attempts.limit,
        }];

        match self.consume_with_fallback(&specs, now_ms, identifier).await {
            WindowDecision::Allowed { counts } => AttemptsDecision::Allowed {
                current_count: counts.first().copied().unwrap_or(0),
            },
            WindowDecision::Denied { retry_after_ms, .. } => {
                AttemptsDecision::Denied { retry_after_ms }
            }
        }
    }

    /// Try the shared store; on failure, serve a best-effort decision from
    /// the process-local store and warn. Never both.
    async fn consume_with_fallback(
        &self,
        specs: &[WindowSpec],
        now_ms: i64,
        identifier: &str,
    ) -> WindowDecision {
        match self.store.consume(specs, now_ms).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(
                    identifier,
                    error = %e,
                    "Shared store unavailable; rate limiting degraded to process-local windows",
                );
                match self.fallback.consume(specs, now_ms).await {
                    Ok(decision) => decision,
                    // The memory store only fails on lock poisoning; treat
                    // as allowed rather than locking every caller out.
                    Err(e) => {
                        tracing::error!(identifier, error = %e, "Fallback window store failed");
                        WindowDecision::Allowed { counts: vec![] }
                    }
                }
            }
        }
    }
}
