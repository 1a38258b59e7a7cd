//! Channel lifecycle behavior against scripted connectors.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lendo_channels::config::{ChannelConfig, ConfigStore, MemoryConfigStore};
use lendo_channels::control::{ControllerConfig, ServiceController};
use lendo_channels::email::{EmailConnector, EmailError, EmailTransport};
use lendo_channels::registry::ServiceRegistry;
use lendo_channels::sweep;
use lendo_channels::whatsapp::{
    LiveState, WhatsAppConnector, WhatsAppError, WhatsAppEvent, WhatsAppSession,
};
use lendo_core::service::{ConnectionStatus, ServiceName};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Scripted WhatsApp connector
// ---------------------------------------------------------------------------

struct MockSession {
    connected: AtomicBool,
    destroyed: AtomicBool,
}

#[async_trait]
impl WhatsAppSession for MockSession {
    async fn live_state(&self) -> LiveState {
        if self.connected.load(Ordering::SeqCst) {
            LiveState::Connected
        } else {
            LiveState::NotConnected
        }
    }

    async fn send_message(&self, _: &str, _: &str) -> Result<(), WhatsAppError> {
        Ok(())
    }

    async fn logout(&self) -> Result<(), WhatsAppError> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), WhatsAppError> {
        self.destroyed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockConnector {
    spawn_count: AtomicU32,
    current: Mutex<Option<(Arc<MockSession>, mpsc::Sender<WhatsAppEvent>)>>,
    removed_profiles: Mutex<Vec<String>>,
}

impl MockConnector {
    fn session(&self) -> Arc<MockSession> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .expect("no session spawned")
            .0
            .clone()
    }

    fn events(&self) -> mpsc::Sender<WhatsAppEvent> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .expect("no session spawned")
            .1
            .clone()
    }
}

#[async_trait]
impl WhatsAppConnector for MockConnector {
    async fn spawn(
        &self,
        _profile: &str,
    ) -> Result<(Arc<dyn WhatsAppSession>, mpsc::Receiver<WhatsAppEvent>), WhatsAppError> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(MockSession {
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::channel(8);
        *self.current.lock().unwrap() = Some((session.clone(), tx));
        Ok((session, rx))
    }

    async fn remove_auth_profile(&self, profile: &str) -> Result<(), WhatsAppError> {
        self.removed_profiles.lock().unwrap().push(profile.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted email connector
// ---------------------------------------------------------------------------

struct MockTransport;

#[async_trait]
impl EmailTransport for MockTransport {
    async fn send(&self, _: &str, _: &str, _: &str) -> Result<(), EmailError> {
        Ok(())
    }
    async fn verify(&self) -> bool {
        true
    }
}

struct MockEmailConnector {
    connect_count: AtomicU32,
    fail_with: Option<String>,
    seen_configs: Mutex<Vec<serde_json::Value>>,
}

impl MockEmailConnector {
    fn ok() -> Self {
        Self {
            connect_count: AtomicU32::new(0),
            fail_with: None,
            seen_configs: Mutex::new(Vec::new()),
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            connect_count: AtomicU32::new(0),
            fail_with: Some(message.to_string()),
            seen_configs: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EmailConnector for MockEmailConnector {
    async fn connect(&self, config: &ChannelConfig) -> Result<Arc<dyn EmailTransport>, EmailError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.seen_configs.lock().unwrap().push(config.config.clone());
        // Hold the initialization guard across an await point.
        tokio::time::sleep(Duration::from_millis(50)).await;
        match &self.fail_with {
            Some(message) => Err(EmailError::Config(message.clone())),
            None => Ok(Arc::new(MockTransport)),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    controller: Arc<ServiceController>,
    registry: Arc<ServiceRegistry>,
    config: Arc<MemoryConfigStore>,
    wa: Arc<MockConnector>,
    email: Arc<MockEmailConnector>,
}

fn harness(email: MockEmailConnector) -> Harness {
    let config = Arc::new(
        MemoryConfigStore::new()
            .with_enabled(ServiceName::Whatsapp, true)
            .with_enabled(ServiceName::Email, true),
    );
    let registry = Arc::new(ServiceRegistry::new(config.clone() as Arc<dyn ConfigStore>));
    let wa = Arc::new(MockConnector::default());
    let email = Arc::new(email);

    let controller = ServiceController::new(
        registry.clone(),
        config.clone(),
        wa.clone(),
        email.clone(),
        ControllerConfig {
            qr_timeout: Duration::from_secs(180),
            settle_delay: Duration::from_millis(10),
            teardown_timeout: Duration::from_secs(5),
            profile_remove_delay: Duration::from_millis(10),
            auth_profile: "test-profile".to_string(),
        },
    );

    Harness {
        controller,
        registry,
        config,
        wa,
        email,
    }
}

/// Let spawned tasks (event pump, timers) run without advancing time.
async fn drain() {
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
}

fn status(h: &Harness, service: ServiceName) -> ConnectionStatus {
    h.config.snapshot(service).unwrap().connection_status
}

// ---------------------------------------------------------------------------
// WhatsApp lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn qr_then_ready_connects_and_registers() {
    let h = harness(MockEmailConnector::ok());
    h.controller.initialize(ServiceName::Whatsapp).await;

    h.wa.events()
        .send(WhatsAppEvent::Qr {
            payload: "1@qr".into(),
        })
        .await
        .unwrap();
    drain().await;

    let row = h.config.snapshot(ServiceName::Whatsapp).unwrap();
    assert_eq!(row.connection_status, ConnectionStatus::WaitingForQrScan);
    assert!(row
        .qr_code
        .as_deref()
        .unwrap()
        .starts_with("data:image/png;base64,"));

    h.wa.events().send(WhatsAppEvent::Ready).await.unwrap();
    drain().await;

    let row = h.config.snapshot(ServiceName::Whatsapp).unwrap();
    assert_eq!(row.connection_status, ConnectionStatus::Connected);
    assert!(row.is_active);
    assert_eq!(row.qr_code, None);
    assert!(h.registry.whatsapp().await.is_some());

    h.wa.session().connected.store(true, Ordering::SeqCst);
    assert!(h.registry.is_whatsapp_available().await);
}

#[tokio::test(start_paused = true)]
async fn qr_timeout_disables_and_tears_down() {
    let h = harness(MockEmailConnector::ok());
    h.controller.initialize(ServiceName::Whatsapp).await;

    h.wa.events()
        .send(WhatsAppEvent::Qr {
            payload: "1@qr".into(),
        })
        .await
        .unwrap();
    drain().await;
    assert_eq!(
        status(&h, ServiceName::Whatsapp),
        ConnectionStatus::WaitingForQrScan
    );

    // No scan arrives before the hard deadline.
    tokio::time::advance(Duration::from_secs(181)).await;
    drain().await;

    let row = h.config.snapshot(ServiceName::Whatsapp).unwrap();
    assert_eq!(row.connection_status, ConnectionStatus::Disabled);
    assert!(row.last_error.unwrap().contains("not scanned in time"));
    assert!(!row.is_enabled);
    assert!(h.wa.session().destroyed.load(Ordering::SeqCst));
    assert!(h.registry.whatsapp().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn qr_refresh_does_not_extend_deadline() {
    let h = harness(MockEmailConnector::ok());
    h.controller.initialize(ServiceName::Whatsapp).await;

    h.wa.events()
        .send(WhatsAppEvent::Qr {
            payload: "1@first".into(),
        })
        .await
        .unwrap();
    drain().await;

    // A refresh two minutes in replaces the image only.
    tokio::time::advance(Duration::from_secs(120)).await;
    h.wa.events()
        .send(WhatsAppEvent::Qr {
            payload: "1@second".into(),
        })
        .await
        .unwrap();
    drain().await;

    // One more minute passes: 181s from the FIRST render.
    tokio::time::advance(Duration::from_secs(61)).await;
    drain().await;

    assert_eq!(
        status(&h, ServiceName::Whatsapp),
        ConnectionStatus::Disabled
    );
}

#[tokio::test(start_paused = true)]
async fn device_logout_disables_and_removes_profile() {
    let h = harness(MockEmailConnector::ok());
    h.controller.initialize(ServiceName::Whatsapp).await;
    h.wa.events().send(WhatsAppEvent::Ready).await.unwrap();
    drain().await;
    assert!(h.registry.whatsapp().await.is_some());

    h.wa.events()
        .send(WhatsAppEvent::Disconnected {
            reason: "LOGOUT".into(),
        })
        .await
        .unwrap();
    drain().await;

    let row = h.config.snapshot(ServiceName::Whatsapp).unwrap();
    assert_eq!(row.connection_status, ConnectionStatus::Disabled);
    assert!(row.last_error.unwrap().contains("logged out"));
    assert!(!row.is_enabled);
    assert!(h.registry.whatsapp().await.is_none());

    // Profile removal is delayed past file-lock release.
    tokio::time::advance(Duration::from_millis(20)).await;
    drain().await;
    assert_eq!(
        *h.wa.removed_profiles.lock().unwrap(),
        vec!["test-profile".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_after_destroy_leaves_channel_disabled() {
    let h = harness(MockEmailConnector::ok());
    h.controller.initialize(ServiceName::Whatsapp).await;
    h.wa.events().send(WhatsAppEvent::Ready).await.unwrap();
    drain().await;

    let events = h.wa.events();
    h.controller.destroy(ServiceName::Whatsapp).await;
    drain().await;
    assert_eq!(
        status(&h, ServiceName::Whatsapp),
        ConnectionStatus::Disabled
    );

    // Tearing the client down closes its event stream, which the pump
    // reports as a disconnect. That report must not resurrect the
    // attempt or be mistaken for a device logout.
    events
        .send(WhatsAppEvent::Disconnected {
            reason: "event stream closed".into(),
        })
        .await
        .unwrap();
    drain().await;

    assert_eq!(
        status(&h, ServiceName::Whatsapp),
        ConnectionStatus::Disabled
    );
    tokio::time::advance(Duration::from_millis(20)).await;
    drain().await;
    assert!(h.wa.removed_profiles.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn auth_profile_comes_from_config_blob() {
    let h = harness(MockEmailConnector::ok());
    h.config
        .update_config(
            ServiceName::Whatsapp,
            &serde_json::json!({ "authProfile": "tenant-a" }),
        )
        .await
        .unwrap();

    h.controller.initialize(ServiceName::Whatsapp).await;
    h.wa.events().send(WhatsAppEvent::Ready).await.unwrap();
    drain().await;

    h.wa.events()
        .send(WhatsAppEvent::Disconnected {
            reason: "LOGOUT".into(),
        })
        .await
        .unwrap();
    drain().await;
    tokio::time::advance(Duration::from_millis(20)).await;
    drain().await;

    assert_eq!(
        *h.wa.removed_profiles.lock().unwrap(),
        vec!["tenant-a".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn transient_disconnect_stays_reconnectable() {
    let h = harness(MockEmailConnector::ok());
    h.controller.initialize(ServiceName::Whatsapp).await;
    h.wa.events().send(WhatsAppEvent::Ready).await.unwrap();
    drain().await;

    h.wa.events()
        .send(WhatsAppEvent::Disconnected {
            reason: "stream error".into(),
        })
        .await
        .unwrap();
    drain().await;

    let row = h.config.snapshot(ServiceName::Whatsapp).unwrap();
    assert_eq!(row.connection_status, ConnectionStatus::Disconnected);
    // Intent stays set, so the sweep will attempt recovery.
    assert!(row.is_enabled);
    assert!(h.wa.removed_profiles.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn destroy_without_live_handle_is_idempotent() {
    let h = harness(MockEmailConnector::ok());

    h.controller.destroy(ServiceName::Whatsapp).await;
    h.controller.destroy(ServiceName::Whatsapp).await;

    assert_eq!(
        status(&h, ServiceName::Whatsapp),
        ConnectionStatus::Disabled
    );
}

#[tokio::test(start_paused = true)]
async fn auth_failure_is_persisted_without_retry() {
    let h = harness(MockEmailConnector::ok());
    h.controller.initialize(ServiceName::Whatsapp).await;

    h.wa.events()
        .send(WhatsAppEvent::AuthFailure {
            message: "pairing rejected".into(),
        })
        .await
        .unwrap();
    drain().await;

    let row = h.config.snapshot(ServiceName::Whatsapp).unwrap();
    assert_eq!(row.connection_status, ConnectionStatus::AuthFailure);
    assert_eq!(row.last_error.as_deref(), Some("pairing rejected"));
    assert_eq!(h.wa.spawn_count.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Email lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_email_initialize_constructs_one_transporter() {
    let h = harness(MockEmailConnector::ok());

    tokio::join!(
        h.controller.initialize(ServiceName::Email),
        h.controller.initialize(ServiceName::Email),
    );

    assert_eq!(h.email.connect_count.load(Ordering::SeqCst), 1);
    assert_eq!(status(&h, ServiceName::Email), ConnectionStatus::Connected);
    assert!(h.registry.is_email_available().await);
}

#[tokio::test(start_paused = true)]
async fn email_failure_disables_with_actionable_error() {
    let h = harness(MockEmailConnector::failing(
        "missing required settings: SMTP_PASSWORD",
    ));

    h.controller.initialize(ServiceName::Email).await;

    let row = h.config.snapshot(ServiceName::Email).unwrap();
    assert_eq!(row.connection_status, ConnectionStatus::Disabled);
    assert!(row.last_error.unwrap().contains("SMTP_PASSWORD"));
    assert!(h.registry.email().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn email_connector_receives_stored_config_blob() {
    let h = harness(MockEmailConnector::ok());
    h.config
        .update_config(
            ServiceName::Email,
            &serde_json::json!({ "host": "smtp.example.com", "port": 2525 }),
        )
        .await
        .unwrap();

    h.controller.initialize(ServiceName::Email).await;

    let seen = h.email.seen_configs.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["host"], "smtp.example.com");
    assert_eq!(seen[0]["port"], 2525);
}

#[tokio::test(start_paused = true)]
async fn disabled_email_short_circuits_to_destroy() {
    let h = harness(MockEmailConnector::ok());
    h.config.set_enabled(ServiceName::Email, false).await.unwrap();

    h.controller.initialize(ServiceName::Email).await;

    assert_eq!(h.email.connect_count.load(Ordering::SeqCst), 0);
    assert_eq!(status(&h, ServiceName::Email), ConnectionStatus::Disabled);
}

// ---------------------------------------------------------------------------
// Sweep reconciliation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn sweep_initializes_enabled_channel_without_handle() {
    let h = harness(MockEmailConnector::ok());
    let config: Arc<dyn ConfigStore> = h.config.clone();

    sweep::reconcile(&h.controller, &h.registry, &config).await;

    assert_eq!(h.wa.spawn_count.load(Ordering::SeqCst), 1);
    assert_eq!(h.email.connect_count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn sweep_destroys_disabled_channel_with_handle() {
    let h = harness(MockEmailConnector::ok());
    h.controller.initialize(ServiceName::Whatsapp).await;
    h.wa.events().send(WhatsAppEvent::Ready).await.unwrap();
    drain().await;
    assert!(h.registry.whatsapp().await.is_some());

    h.config
        .set_enabled(ServiceName::Whatsapp, false)
        .await
        .unwrap();
    let config: Arc<dyn ConfigStore> = h.config.clone();
    sweep::reconcile(&h.controller, &h.registry, &config).await;

    assert!(h.registry.whatsapp().await.is_none());
    assert_eq!(
        status(&h, ServiceName::Whatsapp),
        ConnectionStatus::Disabled
    );
}

#[tokio::test(start_paused = true)]
async fn sweep_restarts_handle_that_fails_its_probe() {
    let h = harness(MockEmailConnector::ok());
    h.controller.initialize(ServiceName::Whatsapp).await;
    h.wa.events().send(WhatsAppEvent::Ready).await.unwrap();
    drain().await;
    assert!(h.registry.whatsapp().await.is_some());

    // The handle is registered but its socket has silently died.
    h.wa.session().connected.store(false, Ordering::SeqCst);

    let config: Arc<dyn ConfigStore> = h.config.clone();
    sweep::reconcile(&h.controller, &h.registry, &config).await;
    drain().await;

    assert_eq!(h.wa.spawn_count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn status_snapshot_reports_both_channels() {
    let h = harness(MockEmailConnector::ok());
    h.controller.initialize(ServiceName::Whatsapp).await;
    h.wa.events().send(WhatsAppEvent::Ready).await.unwrap();
    drain().await;
    h.wa.session().connected.store(true, Ordering::SeqCst);
    h.controller.initialize(ServiceName::Email).await;

    let snapshot = h.controller.status_snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 2);

    let whatsapp = snapshot
        .iter()
        .find(|c| c.service == ServiceName::Whatsapp)
        .unwrap();
    assert!(whatsapp.is_enabled);
    assert_eq!(whatsapp.connection_status, ConnectionStatus::Connected);
    assert!(whatsapp.available);

    let email = snapshot
        .iter()
        .find(|c| c.service == ServiceName::Email)
        .unwrap();
    assert_eq!(email.connection_status, ConnectionStatus::Connected);
    assert!(email.available);
}

#[tokio::test(start_paused = true)]
async fn sweep_skips_attempt_in_flight() {
    let h = harness(MockEmailConnector::ok());
    h.controller.initialize(ServiceName::Whatsapp).await;
    h.wa.events()
        .send(WhatsAppEvent::Qr {
            payload: "1@qr".into(),
        })
        .await
        .unwrap();
    drain().await;

    let config: Arc<dyn ConfigStore> = h.config.clone();
    sweep::reconcile(&h.controller, &h.registry, &config).await;

    // No second spawn while the QR scan is pending.
    assert_eq!(h.wa.spawn_count.load(Ordering::SeqCst), 1);
}
