//! Channel names, connection statuses, and lifecycle actions.
//!
//! String forms match the `service_configs` table and the job payloads, so
//! every enum round-trips through [`as_str`](ServiceName::as_str) /
//! [`parse`](ServiceName::parse).

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// ServiceName
// ---------------------------------------------------------------------------

/// The two delivery channels managed by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceName {
    Whatsapp,
    Email,
}

impl ServiceName {
    /// Canonical database / payload string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Whatsapp => "WHATSAPP",
            ServiceName::Email => "EMAIL",
        }
    }

    /// Parse the canonical string form.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "WHATSAPP" => Ok(ServiceName::Whatsapp),
            "EMAIL" => Ok(ServiceName::Email),
            other => Err(CoreError::Validation(format!(
                "Unknown service name: '{other}'. Valid names: WHATSAPP, EMAIL"
            ))),
        }
    }

    /// Both channels, in a fixed order (used by the reconcile sweep).
    pub const ALL: [ServiceName; 2] = [ServiceName::Whatsapp, ServiceName::Email];
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ConnectionStatus
// ---------------------------------------------------------------------------

/// Observed lifecycle state of a channel, persisted to `service_configs`.
///
/// `Disabled` and `Connected` are the only stable rest states; everything
/// else is transient and must eventually resolve or time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Disconnected,
    Initializing,
    WaitingForQrScan,
    Authenticated,
    Connected,
    AuthFailure,
    Timeout,
    Disabled,
    Error,
}

impl ConnectionStatus {
    /// Canonical database string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Initializing => "INITIALIZING",
            ConnectionStatus::WaitingForQrScan => "WAITING_FOR_QR_SCAN",
            ConnectionStatus::Authenticated => "AUTHENTICATED",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::AuthFailure => "AUTH_FAILURE",
            ConnectionStatus::Timeout => "TIMEOUT",
            ConnectionStatus::Disabled => "DISABLED",
            ConnectionStatus::Error => "ERROR",
        }
    }

    /// Parse the canonical database string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "DISCONNECTED" => Ok(ConnectionStatus::Disconnected),
            "INITIALIZING" => Ok(ConnectionStatus::Initializing),
            "WAITING_FOR_QR_SCAN" => Ok(ConnectionStatus::WaitingForQrScan),
            "AUTHENTICATED" => Ok(ConnectionStatus::Authenticated),
            "CONNECTED" => Ok(ConnectionStatus::Connected),
            "AUTH_FAILURE" => Ok(ConnectionStatus::AuthFailure),
            "TIMEOUT" => Ok(ConnectionStatus::Timeout),
            "DISABLED" => Ok(ConnectionStatus::Disabled),
            "ERROR" => Ok(ConnectionStatus::Error),
            other => Err(CoreError::Validation(format!(
                "Unknown connection status: '{other}'"
            ))),
        }
    }

    /// Whether this is a stable rest state (no transition pending).
    pub fn is_rest_state(&self) -> bool {
        matches!(self, ConnectionStatus::Disabled | ConnectionStatus::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// LifecycleAction
// ---------------------------------------------------------------------------

/// Operator-issued lifecycle commands carried in queue payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleAction {
    Start,
    Stop,
    Restart,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "START",
            LifecycleAction::Stop => "STOP",
            LifecycleAction::Restart => "RESTART",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "START" => Ok(LifecycleAction::Start),
            "STOP" => Ok(LifecycleAction::Stop),
            "RESTART" => Ok(LifecycleAction::Restart),
            other => Err(CoreError::Validation(format!(
                "Unknown lifecycle action: '{other}'. Valid actions: START, STOP, RESTART"
            ))),
        }
    }
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OtpType
// ---------------------------------------------------------------------------

/// What kind of identifier an OTP session verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OtpType {
    Email,
    Phone,
}

impl OtpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtpType::Email => "EMAIL",
            OtpType::Phone => "PHONE",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "EMAIL" => Ok(OtpType::Email),
            "PHONE" => Ok(OtpType::Phone),
            other => Err(CoreError::Validation(format!(
                "Unknown OTP type: '{other}'. Valid types: EMAIL, PHONE"
            ))),
        }
    }
}

impl std::fmt::Display for OtpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
