//! OTP session protocol: sliding-window rate limiting, session
//! creation/verification over a fast shared store, and a best-effort
//! durable audit trail.
//!
//! The hot path (create/verify) is served entirely by the shared store
//! through atomic scripted operations; the Postgres audit row is
//! reconciled best-effort and never blocks or changes an outcome.

pub mod audit;
pub mod rate_limiter;
pub mod service;
pub mod session;
pub mod store;
pub mod windows;

pub use rate_limiter::{AttemptsDecision, RateLimiter, RateLimiterConfig, SendDecision, SendScope};
pub use service::{CreateError, CreatedOtp, OtpConfig, OtpError, OtpService, VerifyOutcome};
