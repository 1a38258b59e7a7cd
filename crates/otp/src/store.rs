//! Redis connection handle shared by the window and session stores.
//!
//! Wraps a [`redis::aio::ConnectionManager`] (which transparently
//! reconnects) and centralizes key naming so the two stores cannot
//! collide.

use redis::aio::ConnectionManager;
use redis::Client;

/// Key prefix for send-rate window sorted sets.
pub const RATE_KEY_PREFIX: &str = "otp:rate:";
/// Key prefix for the shared attempts-budget window sorted sets.
pub const ATTEMPTS_KEY_PREFIX: &str = "otp:attempts:";
/// Key prefix for OTP session hashes.
pub const SESSION_KEY_PREFIX: &str = "otp:session:";
/// Key prefix for the identifier -> session id reverse index.
pub const IDENT_KEY_PREFIX: &str = "otp:ident:";

/// Errors from the fast shared store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Could not reach or authenticate with the store.
    #[error("Shared store connection error: {0}")]
    Connection(String),

    /// A command or script invocation failed.
    #[error("Shared store command error: {0}")]
    Command(String),

    /// A stored record did not have the expected shape.
    #[error("Shared store record malformed: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

/// Shared handle to the fast store.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to the store at the given URL.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { manager })
    }

    /// Connect using `REDIS_URL` (default `redis://localhost:6379`).
    pub async fn from_env() -> Result<Self, StoreError> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        Self::connect(&url).await
    }

    /// A cheap clone of the underlying multiplexed connection.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}
