//! WhatsApp session abstraction.
//!
//! [`WhatsAppConnector`] spawns headless-browser-backed sessions and
//! [`WhatsAppSession`] is the live handle delivery code sends through.
//! The production implementation talks to the browser sidecar (see
//! [`crate::bridge`]); tests script these traits directly.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Raw events emitted by a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhatsAppEvent {
    /// A QR code was rendered (initial or periodic refresh).
    Qr { payload: String },
    /// The phone scanned the QR and pairing succeeded.
    Authenticated,
    /// The session is usable for sends.
    Ready,
    /// Pairing was rejected.
    AuthFailure { message: String },
    /// The session dropped; `reason` distinguishes device logout from a
    /// transient failure.
    Disconnected { reason: String },
}

/// Self-reported connection state, probed live on availability checks
/// because the underlying session can silently drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    Connected,
    NotConnected,
}

#[derive(Debug, thiserror::Error)]
pub enum WhatsAppError {
    #[error("session spawn failed: {0}")]
    Spawn(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("session teardown failed: {0}")]
    Teardown(String),
}

/// A live WhatsApp session handle.
#[async_trait]
pub trait WhatsAppSession: Send + Sync {
    /// Probe the session's current connection state.
    async fn live_state(&self) -> LiveState;

    /// Send a text message to a chat identifier (see [`to_chat_id`]).
    async fn send_message(&self, chat_id: &str, body: &str) -> Result<(), WhatsAppError>;

    /// Graceful logout of the paired device.
    async fn logout(&self) -> Result<(), WhatsAppError>;

    /// Tear the client down. Must be safe to call after `logout`.
    async fn destroy(&self) -> Result<(), WhatsAppError>;
}

/// Factory for sessions plus auth-profile housekeeping.
#[async_trait]
pub trait WhatsAppConnector: Send + Sync {
    /// Spawn a client bound to the named persistent auth profile and
    /// return the handle plus its event stream.
    async fn spawn(
        &self,
        profile: &str,
    ) -> Result<(Arc<dyn WhatsAppSession>, mpsc::Receiver<WhatsAppEvent>), WhatsAppError>;

    /// Delete the local auth-profile directory.
    async fn remove_auth_profile(&self, profile: &str) -> Result<(), WhatsAppError>;
}

/// Normalize a phone number into a WhatsApp chat identifier.
///
/// Strips everything but digits and appends the `@c.us` suffix; numbers
/// without a country code are assumed to already carry one upstream.
pub fn to_chat_id(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("{digits}@c.us")
}
