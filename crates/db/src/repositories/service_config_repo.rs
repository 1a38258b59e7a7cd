//! Repository for the `service_configs` table.

use sqlx::PgPool;

use crate::models::service_config::ServiceConfig;

/// Column list for `service_configs` queries.
const COLUMNS: &str = "\
    id, service_name, is_enabled, is_active, connection_status, config, \
    qr_code, last_connected_at, last_error, last_error_at, \
    created_at, updated_at";

/// Provides query and mutation operations for per-channel service config.
///
/// Lifecycle fields (`connection_status`, `is_active`, `qr_code`, the error
/// columns) are written only by the service controller; `is_enabled` is the
/// administrator toggle reconciled by the sweep.
pub struct ServiceConfigRepo;

impl ServiceConfigRepo {
    /// Ensure a row exists for the given service, returning it.
    ///
    /// New rows start disabled with status `DISABLED`; an existing row is
    /// returned untouched.
    pub async fn ensure(pool: &PgPool, service_name: &str) -> Result<ServiceConfig, sqlx::Error> {
        let query = format!(
            "INSERT INTO service_configs (service_name) VALUES ($1) \
             ON CONFLICT (service_name) DO UPDATE SET service_name = EXCLUDED.service_name \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ServiceConfig>(&query)
            .bind(service_name)
            .fetch_one(pool)
            .await
    }

    /// Find a service config by channel name.
    pub async fn find_by_name(
        pool: &PgPool,
        service_name: &str,
    ) -> Result<Option<ServiceConfig>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM service_configs WHERE service_name = $1");
        sqlx::query_as::<_, ServiceConfig>(&query)
            .bind(service_name)
            .fetch_optional(pool)
            .await
    }

    /// List all service configs ordered by name.
    pub async fn list(pool: &PgPool) -> Result<Vec<ServiceConfig>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM service_configs ORDER BY service_name ASC");
        sqlx::query_as::<_, ServiceConfig>(&query)
            .fetch_all(pool)
            .await
    }

    /// Flip the administrator enable toggle.
    pub async fn set_enabled(
        pool: &PgPool,
        service_name: &str,
        is_enabled: bool,
    ) -> Result<Option<ServiceConfig>, sqlx::Error> {
        let query = format!(
            "UPDATE service_configs SET is_enabled = $2, updated_at = NOW() \
             WHERE service_name = $1 RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ServiceConfig>(&query)
            .bind(service_name)
            .bind(is_enabled)
            .fetch_optional(pool)
            .await
    }

    /// Record an observed lifecycle status transition.
    ///
    /// Sets `is_active` as given, stamps `last_connected_at` when the
    /// status becomes active, and records `last_error`/`last_error_at`
    /// when an error detail is present (existing error detail is kept
    /// otherwise).
    pub async fn record_status(
        pool: &PgPool,
        service_name: &str,
        connection_status: &str,
        is_active: bool,
        error: Option<&str>,
    ) -> Result<Option<ServiceConfig>, sqlx::Error> {
        let query = format!(
            "UPDATE service_configs SET \
                 connection_status = $2, \
                 is_active = $3, \
                 last_connected_at = CASE WHEN $3 THEN NOW() ELSE last_connected_at END, \
                 last_error = COALESCE($4, last_error), \
                 last_error_at = CASE WHEN $4 IS NOT NULL THEN NOW() ELSE last_error_at END, \
                 updated_at = NOW() \
             WHERE service_name = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ServiceConfig>(&query)
            .bind(service_name)
            .bind(connection_status)
            .bind(is_active)
            .bind(error)
            .fetch_optional(pool)
            .await
    }

    /// Store or clear the rendered QR data URL.
    pub async fn set_qr_code(
        pool: &PgPool,
        service_name: &str,
        qr_code: Option<&str>,
    ) -> Result<Option<ServiceConfig>, sqlx::Error> {
        let query = format!(
            "UPDATE service_configs SET qr_code = $2, updated_at = NOW() \
             WHERE service_name = $1 RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ServiceConfig>(&query)
            .bind(service_name)
            .bind(qr_code)
            .fetch_optional(pool)
            .await
    }

    /// Replace the channel-specific settings blob.
    pub async fn update_config(
        pool: &PgPool,
        service_name: &str,
        config: &serde_json::Value,
    ) -> Result<Option<ServiceConfig>, sqlx::Error> {
        let query = format!(
            "UPDATE service_configs SET config = $2, updated_at = NOW() \
             WHERE service_name = $1 RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ServiceConfig>(&query)
            .bind(service_name)
            .bind(config)
            .fetch_optional(pool)
            .await
    }
}
