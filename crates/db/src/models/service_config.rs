//! Service configuration entity model.

use lendo_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `service_configs` table, one per delivery channel.
///
/// `is_enabled` is administrator intent; `is_active` and
/// `connection_status` are the observed reality written exclusively by the
/// service controller. `is_active = true` implies
/// `connection_status = 'CONNECTED'`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ServiceConfig {
    pub id: DbId,
    pub service_name: String,
    pub is_enabled: bool,
    pub is_active: bool,
    pub connection_status: String,
    /// Channel-specific settings blob (SMTP credentials, client id, etc.).
    pub config: serde_json::Value,
    /// Rendered QR data URL, present only while waiting for a scan.
    pub qr_code: Option<String>,
    pub last_connected_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub last_error_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}
