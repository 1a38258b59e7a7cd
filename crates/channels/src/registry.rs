//! In-process registry of live channel handles.
//!
//! Constructed once at worker startup and passed by reference to every
//! component that needs it. Handles are written only by the service
//! controller; delivery code reads them and checks availability before
//! each send.
//!
//! Availability transitions are broadcast via a [`tokio::sync::broadcast`]
//! channel. Call [`ServiceRegistry::subscribe`] to receive them.

use std::collections::HashMap;
use std::sync::Arc;

use lendo_core::service::ServiceName;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::config::ConfigStore;
use crate::email::EmailTransport;
use crate::whatsapp::{LiveState, WhatsAppSession};

/// Broadcast channel capacity for availability events.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Emitted when a channel's availability actually changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatusEvent {
    pub service: ServiceName,
    pub available: bool,
}

pub struct ServiceRegistry {
    config: Arc<dyn ConfigStore>,
    whatsapp: RwLock<Option<Arc<dyn WhatsAppSession>>>,
    email: RwLock<Option<Arc<dyn EmailTransport>>>,
    status_tx: broadcast::Sender<ChannelStatusEvent>,
    /// Last published availability per channel, for de-duplication.
    last_published: Mutex<HashMap<ServiceName, bool>>,
}

impl ServiceRegistry {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            config,
            whatsapp: RwLock::new(None),
            email: RwLock::new(None),
            status_tx,
            last_published: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to availability transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelStatusEvent> {
        self.status_tx.subscribe()
    }

    // ---- handle accessors ----

    pub async fn whatsapp(&self) -> Option<Arc<dyn WhatsAppSession>> {
        self.whatsapp.read().await.clone()
    }

    pub async fn email(&self) -> Option<Arc<dyn EmailTransport>> {
        self.email.read().await.clone()
    }

    /// Publish or clear the live WhatsApp handle. Controller-only.
    pub async fn set_whatsapp(&self, handle: Option<Arc<dyn WhatsAppSession>>) {
        *self.whatsapp.write().await = handle;
        self.refresh(ServiceName::Whatsapp).await;
    }

    /// Publish or clear the live email transporter. Controller-only.
    pub async fn set_email(&self, handle: Option<Arc<dyn EmailTransport>>) {
        *self.email.write().await = handle;
        self.refresh(ServiceName::Email).await;
    }

    // ---- availability ----

    /// Enabled in durable config, handle registered, and the session's
    /// self-reported state is connected (a live probe, since the
    /// underlying session can drop without an event reaching us).
    pub async fn is_whatsapp_available(&self) -> bool {
        if !self.is_enabled(ServiceName::Whatsapp).await {
            return false;
        }
        match self.whatsapp().await {
            Some(session) => session.live_state().await == LiveState::Connected,
            None => false,
        }
    }

    /// Enabled in durable config and a transporter is registered.
    /// Transporter presence is treated as sufficient; the background
    /// sweep periodically re-verifies the handshake.
    pub async fn is_email_available(&self) -> bool {
        self.is_enabled(ServiceName::Email).await && self.email().await.is_some()
    }

    pub async fn is_available(&self, service: ServiceName) -> bool {
        match service {
            ServiceName::Whatsapp => self.is_whatsapp_available().await,
            ServiceName::Email => self.is_email_available().await,
        }
    }

    /// Recompute availability and broadcast only on an actual transition.
    pub async fn refresh(&self, service: ServiceName) {
        let available = self.is_available(service).await;
        let mut cache = self.last_published.lock().await;
        if cache.insert(service, available) != Some(available) {
            let _ = self.status_tx.send(ChannelStatusEvent { service, available });
        }
    }

    async fn is_enabled(&self, service: ServiceName) -> bool {
        match self.config.get(service).await {
            Ok(row) => row.is_enabled,
            Err(err) => {
                tracing::warn!(service = %service, error = %err, "config read failed during availability check");
                false
            }
        }
    }
}
