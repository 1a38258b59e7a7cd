//! Service lifecycle controller.
//!
//! Interprets lifecycle commands (start/stop/restart per channel) and
//! the WhatsApp session state machine from `lendo_core::session_fsm`.
//! All external-process and network failures are caught here and
//! converted to persisted status plus a logged error; lifecycle methods
//! never propagate them, so job-queue handlers cannot crash on what is
//! really a "this channel is down" outcome.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use lendo_core::service::{ConnectionStatus, LifecycleAction, ServiceName};
use lendo_core::session_fsm::{transition, Effect, SessionEvent, SessionState};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ConfigStore};
use crate::email::EmailConnector;
use crate::qr;
use crate::registry::ServiceRegistry;
use crate::whatsapp::{WhatsAppConnector, WhatsAppEvent, WhatsAppSession};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Hard deadline for the first QR scan of an init attempt.
    pub qr_timeout: Duration,
    /// Wait after a destroy before re-initializing; the previous
    /// browser process needs time to release its profile locks.
    pub settle_delay: Duration,
    /// Cap on graceful logout/close during teardown.
    pub teardown_timeout: Duration,
    /// Delay before deleting the auth profile after a device logout.
    pub profile_remove_delay: Duration,
    /// Name of the persistent browser auth profile, used when the
    /// channel's config blob does not name one.
    pub auth_profile: String,
}

/// One channel's durable state plus its live availability, for operator
/// logs and the sweep's per-pass report.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub service: ServiceName,
    pub is_enabled: bool,
    pub connection_status: ConnectionStatus,
    pub available: bool,
    pub last_error: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            qr_timeout: Duration::from_secs(180),
            settle_delay: Duration::from_secs(2),
            teardown_timeout: Duration::from_secs(5),
            profile_remove_delay: Duration::from_secs(2),
            auth_profile: "default".to_string(),
        }
    }
}

/// Per-attempt WhatsApp runtime state.
///
/// `generation` increments on every spawn; events and timers carry the
/// generation they were created under, so leftovers from a destroyed
/// attempt cannot touch the current one.
struct WaRuntime {
    state: SessionState,
    session: Option<Arc<dyn WhatsAppSession>>,
    qr_timeout: Option<CancellationToken>,
    generation: u64,
    /// Auth profile the current attempt was spawned with.
    auth_profile: String,
}

pub struct ServiceController {
    registry: Arc<ServiceRegistry>,
    config_store: Arc<dyn ConfigStore>,
    wa_connector: Arc<dyn WhatsAppConnector>,
    email_connector: Arc<dyn EmailConnector>,
    settings: ControllerConfig,
    /// Initialization guards. `try_lock` failure means another
    /// initialize is in flight and the duplicate is a logged no-op.
    wa_init: Mutex<()>,
    email_init: Mutex<()>,
    wa: Mutex<WaRuntime>,
}

impl ServiceController {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        config_store: Arc<dyn ConfigStore>,
        wa_connector: Arc<dyn WhatsAppConnector>,
        email_connector: Arc<dyn EmailConnector>,
        settings: ControllerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            config_store,
            wa_connector,
            email_connector,
            wa_init: Mutex::new(()),
            email_init: Mutex::new(()),
            wa: Mutex::new(WaRuntime {
                state: SessionState::Destroyed,
                session: None,
                qr_timeout: None,
                generation: 0,
                auth_profile: settings.auth_profile.clone(),
            }),
            settings,
        })
    }

    /// Durable view of every channel joined with live availability.
    pub async fn status_snapshot(&self) -> Result<Vec<ChannelSnapshot>, ConfigError> {
        let mut snapshot = Vec::new();
        for row in self.config_store.list().await? {
            snapshot.push(ChannelSnapshot {
                available: self.registry.is_available(row.service).await,
                service: row.service,
                is_enabled: row.is_enabled,
                connection_status: row.connection_status,
                last_error: row.last_error,
            });
        }
        Ok(snapshot)
    }

    /// Entry point for queued lifecycle commands.
    pub async fn handle(self: &Arc<Self>, service: ServiceName, action: LifecycleAction) {
        tracing::info!(service = %service, action = %action, "Handling lifecycle command");
        match action {
            LifecycleAction::Start => self.initialize(service).await,
            LifecycleAction::Stop => self.destroy(service).await,
            LifecycleAction::Restart => self.restart(service).await,
        }
    }

    pub async fn initialize(self: &Arc<Self>, service: ServiceName) {
        match service {
            ServiceName::Whatsapp => self.initialize_whatsapp().await,
            ServiceName::Email => self.initialize_email().await,
        }
    }

    pub async fn destroy(self: &Arc<Self>, service: ServiceName) {
        match service {
            ServiceName::Whatsapp => self.destroy_whatsapp().await,
            ServiceName::Email => self.destroy_email().await,
        }
    }

    pub async fn restart(self: &Arc<Self>, service: ServiceName) {
        self.destroy(service).await;
        tokio::time::sleep(self.settings.settle_delay).await;
        self.initialize(service).await;
    }

    // ---------------------------------------------------------------------
    // WhatsApp
    // ---------------------------------------------------------------------

    async fn initialize_whatsapp(self: &Arc<Self>) {
        // Held for the whole spawn so a racing duplicate command is a
        // no-op instead of a second browser process.
        let Ok(_guard) = self.wa_init.try_lock() else {
            tracing::info!("WhatsApp already initializing, skipping duplicate command");
            return;
        };

        let config = match self.config_store.ensure(ServiceName::Whatsapp).await {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(error = %err, "Failed to load WhatsApp config");
                return;
            }
        };

        if !config.is_enabled {
            tracing::info!("WhatsApp is administratively disabled, tearing down");
            self.destroy_whatsapp().await;
            return;
        }

        let has_session = self.wa.lock().await.session.is_some();
        if has_session {
            self.destroy_whatsapp().await;
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        self.persist(
            ServiceName::Whatsapp,
            ConnectionStatus::Initializing,
            None,
        )
        .await;

        let profile = config
            .config
            .get("authProfile")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.settings.auth_profile)
            .to_string();

        let (session, mut events) = match self.wa_connector.spawn(&profile).await {
            Ok(spawned) => spawned,
            Err(err) => {
                tracing::error!(error = %err, "WhatsApp client construction failed");
                self.persist(
                    ServiceName::Whatsapp,
                    ConnectionStatus::Disabled,
                    Some(&err.to_string()),
                )
                .await;
                return;
            }
        };

        let generation = {
            let mut wa = self.wa.lock().await;
            wa.generation += 1;
            wa.state = SessionState::Initializing;
            wa.session = Some(session);
            wa.auth_profile = profile;
            wa.generation
        };

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                controller
                    .apply_whatsapp_event(generation, map_event(event))
                    .await;
            }
            tracing::debug!(generation, "WhatsApp event pump exited");
        });
    }

    async fn destroy_whatsapp(self: &Arc<Self>) {
        let generation = self.wa.lock().await.generation;
        self.apply_whatsapp_event(generation, SessionEvent::DestroyRequested)
            .await;

        // Invalidate the attempt's event pump and timers: teardown kills
        // the event stream, and the resulting disconnect report must not
        // overwrite the terminal DISABLED status.
        {
            let mut wa = self.wa.lock().await;
            if wa.generation == generation {
                wa.generation += 1;
            }
        }

        // Idempotent: the durable DISABLED state is reached even when no
        // live handle existed. Passing no error keeps any prior detail.
        self.persist(ServiceName::Whatsapp, ConnectionStatus::Disabled, None)
            .await;
        if let Err(err) = self
            .config_store
            .set_qr_code(ServiceName::Whatsapp, None)
            .await
        {
            tracing::warn!(error = %err, "Failed to clear QR code");
        }
    }

    /// Fold one session event into the state machine and run its effects.
    ///
    /// Events carrying a stale generation (from an attempt that has since
    /// been destroyed) are dropped.
    ///
    /// Returns a boxed future: the QR timeout task spawned by one of the
    /// effects re-enters this function, and the resulting recursive
    /// opaque future cannot satisfy `tokio::spawn`'s `Send` bound.
    pub(crate) fn apply_whatsapp_event(
        self: &Arc<Self>,
        generation: u64,
        event: SessionEvent,
    ) -> BoxFuture<'static, ()> {
        let controller = Arc::clone(self);
        Box::pin(async move { controller.fold_whatsapp_event(generation, event).await })
    }

    async fn fold_whatsapp_event(self: &Arc<Self>, generation: u64, event: SessionEvent) {
        let (applied, previous, session) = {
            let mut wa = self.wa.lock().await;
            if wa.generation != generation {
                tracing::debug!(generation, current = wa.generation, "Dropping stale session event");
                return;
            }
            let previous = wa.state;
            let applied = transition(previous, event);
            tracing::debug!(from = ?previous, to = ?applied.next, "WhatsApp session transition");
            wa.state = applied.next;
            (applied, previous, wa.session.clone())
        };

        // Device logout removes the auth profile; both it and the QR
        // timeout are forcible disables that clear administrator intent
        // so the sweep does not immediately re-initialize.
        let forcibly_disabled = (applied.next == SessionState::TimedOut
            && previous != SessionState::TimedOut)
            || applied.effects.contains(&Effect::RemoveAuthProfile);

        for effect in applied.effects {
            self.run_effect(generation, effect, session.clone()).await;
        }

        if forcibly_disabled {
            if let Err(err) = self
                .config_store
                .set_enabled(ServiceName::Whatsapp, false)
                .await
            {
                tracing::error!(error = %err, "Failed to clear enable flag");
            }
            // The reason persisted by the transition is kept as lastError.
            self.persist(ServiceName::Whatsapp, ConnectionStatus::Disabled, None)
                .await;
        }
    }

    async fn run_effect(
        self: &Arc<Self>,
        generation: u64,
        effect: Effect,
        session: Option<Arc<dyn WhatsAppSession>>,
    ) {
        match effect {
            Effect::Persist { status, error } => {
                self.persist(ServiceName::Whatsapp, status, error.as_deref())
                    .await;
            }
            Effect::StoreQr { payload } => match qr::render_data_url(&payload) {
                Ok(data_url) => {
                    if let Err(err) = self
                        .config_store
                        .set_qr_code(ServiceName::Whatsapp, Some(&data_url))
                        .await
                    {
                        tracing::warn!(error = %err, "Failed to persist QR code");
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "QR render failed");
                }
            },
            Effect::ClearQr => {
                if let Err(err) = self
                    .config_store
                    .set_qr_code(ServiceName::Whatsapp, None)
                    .await
                {
                    tracing::warn!(error = %err, "Failed to clear QR code");
                }
            }
            Effect::ArmQrTimeout => {
                let cancel = CancellationToken::new();
                self.wa.lock().await.qr_timeout = Some(cancel.clone());

                let controller = Arc::clone(self);
                let deadline = self.settings.qr_timeout;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(deadline) => {
                            controller
                                .apply_whatsapp_event(generation, SessionEvent::QrTimeoutFired)
                                .await;
                        }
                    }
                });
            }
            Effect::ClearQrTimeout => {
                if let Some(cancel) = self.wa.lock().await.qr_timeout.take() {
                    cancel.cancel();
                }
            }
            Effect::RegisterHandle => {
                self.registry.set_whatsapp(session).await;
            }
            Effect::UnregisterHandle => {
                self.registry.set_whatsapp(None).await;
            }
            Effect::TearDownClient => {
                self.wa.lock().await.session = None;
                if let Some(session) = session {
                    let teardown = async {
                        if let Err(err) = session.logout().await {
                            tracing::warn!(error = %err, "WhatsApp logout failed, destroying anyway");
                        }
                        if let Err(err) = session.destroy().await {
                            tracing::warn!(error = %err, "WhatsApp destroy failed");
                        }
                    };
                    if tokio::time::timeout(self.settings.teardown_timeout, teardown)
                        .await
                        .is_err()
                    {
                        tracing::warn!("WhatsApp teardown timed out, proceeding");
                    }
                }
            }
            Effect::RemoveAuthProfile => {
                let connector = Arc::clone(&self.wa_connector);
                let profile = self.wa.lock().await.auth_profile.clone();
                let delay = self.settings.profile_remove_delay;
                tokio::spawn(async move {
                    // Delayed so the dying browser process releases its
                    // file locks first.
                    tokio::time::sleep(delay).await;
                    if let Err(err) = connector.remove_auth_profile(&profile).await {
                        tracing::warn!(error = %err, profile = %profile, "Auth profile removal failed");
                    } else {
                        tracing::info!(profile = %profile, "Auth profile removed after device logout");
                    }
                });
            }
        }
    }

    // ---------------------------------------------------------------------
    // Email
    // ---------------------------------------------------------------------

    async fn initialize_email(self: &Arc<Self>) {
        // Held through the full verify + test-send sequence.
        let Ok(_guard) = self.email_init.try_lock() else {
            tracing::info!("Email already initializing, skipping duplicate command");
            return;
        };

        let config = match self.config_store.ensure(ServiceName::Email).await {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(error = %err, "Failed to load email config");
                return;
            }
        };

        if !config.is_enabled {
            tracing::info!("Email is administratively disabled, tearing down");
            self.destroy_email().await;
            return;
        }

        if self.registry.email().await.is_some() {
            self.destroy_email().await;
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        self.persist(ServiceName::Email, ConnectionStatus::Initializing, None)
            .await;

        match self.email_connector.connect(&config).await {
            Ok(transporter) => {
                self.registry.set_email(Some(transporter)).await;
                self.persist(ServiceName::Email, ConnectionStatus::Connected, None)
                    .await;
                tracing::info!("Email channel connected");
            }
            Err(err) => {
                tracing::error!(error = %err, "Email channel initialization failed");
                self.registry.set_email(None).await;
                self.persist(
                    ServiceName::Email,
                    ConnectionStatus::Disabled,
                    Some(&err.to_string()),
                )
                .await;
            }
        }
    }

    async fn destroy_email(self: &Arc<Self>) {
        self.registry.set_email(None).await;
        self.persist(ServiceName::Email, ConnectionStatus::Disabled, None)
            .await;
    }

    // ---------------------------------------------------------------------

    async fn persist(&self, service: ServiceName, status: ConnectionStatus, error: Option<&str>) {
        if let Err(err) = self.config_store.record_status(service, status, error).await {
            tracing::error!(service = %service, status = %status, error = %err, "Failed to persist status");
        }
        self.registry.refresh(service).await;
    }
}

fn map_event(event: WhatsAppEvent) -> SessionEvent {
    match event {
        WhatsAppEvent::Qr { payload } => SessionEvent::QrReceived { payload },
        WhatsAppEvent::Authenticated => SessionEvent::Authenticated,
        WhatsAppEvent::Ready => SessionEvent::Ready,
        WhatsAppEvent::AuthFailure { message } => SessionEvent::AuthFailure { message },
        WhatsAppEvent::Disconnected { reason } => SessionEvent::Disconnected { reason },
    }
}
