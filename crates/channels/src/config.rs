//! Durable per-channel configuration access.
//!
//! The `service_configs` row is the single source of truth for "should
//! this channel be running". The controller and sweep read and write it
//! through [`ConfigStore`] so lifecycle logic can be exercised against an
//! in-process store in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use lendo_core::service::{ConnectionStatus, ServiceName};
use lendo_db::repositories::service_config_repo::ServiceConfigRepo;
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("no config row for service {0}")]
    Missing(ServiceName),

    #[error("corrupt config row: {0}")]
    Corrupt(String),
}

/// Channel state as the lifecycle layer sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub service: ServiceName,
    /// Administrator intent.
    pub is_enabled: bool,
    /// Observed reality, written only by the controller.
    pub is_active: bool,
    pub connection_status: ConnectionStatus,
    /// Channel-specific settings blob (SMTP credentials, auth profile).
    pub config: serde_json::Value,
    pub qr_code: Option<String>,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch the channel row, creating a disabled default if absent.
    async fn ensure(&self, service: ServiceName) -> Result<ChannelConfig, ConfigError>;

    async fn get(&self, service: ServiceName) -> Result<ChannelConfig, ConfigError>;

    /// All channel rows, ordered by service name.
    async fn list(&self) -> Result<Vec<ChannelConfig>, ConfigError>;

    /// Record a lifecycle status transition. `error = None` keeps any
    /// existing error detail in place.
    async fn record_status(
        &self,
        service: ServiceName,
        status: ConnectionStatus,
        error: Option<&str>,
    ) -> Result<(), ConfigError>;

    /// Store or clear the rendered QR data URL.
    async fn set_qr_code(
        &self,
        service: ServiceName,
        qr_code: Option<&str>,
    ) -> Result<(), ConfigError>;

    /// Flip administrator intent. Written by the admin surface and by
    /// forcible disables (QR timeout, device logout), which clear intent
    /// so the self-healing sweep does not immediately re-initialize.
    async fn set_enabled(&self, service: ServiceName, is_enabled: bool) -> Result<(), ConfigError>;

    /// Replace the channel-specific settings blob. Picked up by the next
    /// initialize; no restart required.
    async fn update_config(
        &self,
        service: ServiceName,
        config: &serde_json::Value,
    ) -> Result<(), ConfigError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgConfigStore {
    pool: PgPool,
}

impl PgConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn from_row(row: lendo_db::models::service_config::ServiceConfig) -> Result<ChannelConfig, ConfigError> {
    Ok(ChannelConfig {
        service: ServiceName::parse(&row.service_name)
            .map_err(|e| ConfigError::Corrupt(e.to_string()))?,
        is_enabled: row.is_enabled,
        is_active: row.is_active,
        connection_status: ConnectionStatus::parse(&row.connection_status)
            .map_err(|e| ConfigError::Corrupt(e.to_string()))?,
        config: row.config,
        qr_code: row.qr_code,
        last_error: row.last_error,
    })
}

#[async_trait]
impl ConfigStore for PgConfigStore {
    async fn ensure(&self, service: ServiceName) -> Result<ChannelConfig, ConfigError> {
        let row = ServiceConfigRepo::ensure(&self.pool, service.as_str()).await?;
        from_row(row)
    }

    async fn get(&self, service: ServiceName) -> Result<ChannelConfig, ConfigError> {
        let row = ServiceConfigRepo::find_by_name(&self.pool, service.as_str())
            .await?
            .ok_or(ConfigError::Missing(service))?;
        from_row(row)
    }

    async fn list(&self) -> Result<Vec<ChannelConfig>, ConfigError> {
        ServiceConfigRepo::list(&self.pool)
            .await?
            .into_iter()
            .map(from_row)
            .collect()
    }

    async fn record_status(
        &self,
        service: ServiceName,
        status: ConnectionStatus,
        error: Option<&str>,
    ) -> Result<(), ConfigError> {
        let is_active = status == ConnectionStatus::Connected;
        ServiceConfigRepo::record_status(
            &self.pool,
            service.as_str(),
            status.as_str(),
            is_active,
            error,
        )
        .await?
        .ok_or(ConfigError::Missing(service))?;
        Ok(())
    }

    async fn set_qr_code(
        &self,
        service: ServiceName,
        qr_code: Option<&str>,
    ) -> Result<(), ConfigError> {
        ServiceConfigRepo::set_qr_code(&self.pool, service.as_str(), qr_code)
            .await?
            .ok_or(ConfigError::Missing(service))?;
        Ok(())
    }

    async fn set_enabled(&self, service: ServiceName, is_enabled: bool) -> Result<(), ConfigError> {
        ServiceConfigRepo::set_enabled(&self.pool, service.as_str(), is_enabled)
            .await?
            .ok_or(ConfigError::Missing(service))?;
        Ok(())
    }

    async fn update_config(
        &self,
        service: ServiceName,
        config: &serde_json::Value,
    ) -> Result<(), ConfigError> {
        ServiceConfigRepo::update_config(&self.pool, service.as_str(), config)
            .await?
            .ok_or(ConfigError::Missing(service))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

/// Mutex-guarded [`ConfigStore`] for lifecycle tests.
#[derive(Default)]
pub struct MemoryConfigStore {
    rows: Mutex<HashMap<ServiceName, ChannelConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row with the given administrator intent.
    pub fn with_enabled(self, service: ServiceName, is_enabled: bool) -> Self {
        {
            let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
            rows.insert(service, default_row(service, is_enabled));
        }
        self
    }

    pub fn snapshot(&self, service: ServiceName) -> Option<ChannelConfig> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.get(&service).cloned()
    }
}

fn default_row(service: ServiceName, is_enabled: bool) -> ChannelConfig {
    ChannelConfig {
        service,
        is_enabled,
        is_active: false,
        connection_status: ConnectionStatus::Disabled,
        config: serde_json::Value::Object(serde_json::Map::new()),
        qr_code: None,
        last_error: None,
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn ensure(&self, service: ServiceName) -> Result<ChannelConfig, ConfigError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .entry(service)
            .or_insert_with(|| default_row(service, false))
            .clone())
    }

    async fn get(&self, service: ServiceName) -> Result<ChannelConfig, ConfigError> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.get(&service)
            .cloned()
            .ok_or(ConfigError::Missing(service))
    }

    async fn list(&self) -> Result<Vec<ChannelConfig>, ConfigError> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<ChannelConfig> = rows.values().cloned().collect();
        all.sort_by(|a, b| a.service.as_str().cmp(b.service.as_str()));
        Ok(all)
    }

    async fn record_status(
        &self,
        service: ServiceName,
        status: ConnectionStatus,
        error: Option<&str>,
    ) -> Result<(), ConfigError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let row = rows.get_mut(&service).ok_or(ConfigError::Missing(service))?;
        row.connection_status = status;
        row.is_active = status == ConnectionStatus::Connected;
        if let Some(error) = error {
            row.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn set_qr_code(
        &self,
        service: ServiceName,
        qr_code: Option<&str>,
    ) -> Result<(), ConfigError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let row = rows.get_mut(&service).ok_or(ConfigError::Missing(service))?;
        row.qr_code = qr_code.map(str::to_string);
        Ok(())
    }

    async fn set_enabled(&self, service: ServiceName, is_enabled: bool) -> Result<(), ConfigError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.entry(service)
            .or_insert_with(|| default_row(service, is_enabled))
            .is_enabled = is_enabled;
        Ok(())
    }

    async fn update_config(
        &self,
        service: ServiceName,
        config: &serde_json::Value,
    ) -> Result<(), ConfigError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.get_mut(&service)
            .ok_or(ConfigError::Missing(service))?
            .config = config.clone();
        Ok(())
    }
}
