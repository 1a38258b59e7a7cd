use std::sync::Arc;

use anyhow::Context;
use lendo_channels::bridge::{BridgeConfig, BridgeConnector};
use lendo_channels::config::{ConfigStore, PgConfigStore};
use lendo_channels::email::SmtpConnector;
use lendo_channels::sweep;
use lendo_channels::{ControllerConfig, ServiceController, ServiceRegistry};
use lendo_core::service::{LifecycleAction, ServiceName};
use lendo_worker::jobs::{self, LifecycleCommand, OtpDelivery};
use lendo_worker::queue::{JobQueue, QueueConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "lendo_worker=debug,lendo_channels=debug,lendo_otp=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    // --- Database ---
    let pool = lendo_db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    lendo_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    lendo_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");

    // --- Channel lifecycle ---
    let config_store: Arc<dyn ConfigStore> = Arc::new(PgConfigStore::new(pool.clone()));
    let registry = Arc::new(ServiceRegistry::new(config_store.clone()));
    let controller = ServiceController::new(
        registry.clone(),
        config_store.clone(),
        Arc::new(BridgeConnector::new(BridgeConfig::from_env())),
        Arc::new(SmtpConnector),
        ControllerConfig::default(),
    );

    // --- Job lanes ---
    let cancel = CancellationToken::new();

    // Lifecycle commands are strictly serialized.
    let lifecycle_queue = {
        let controller = controller.clone();
        JobQueue::start(
            "lifecycle",
            1,
            QueueConfig::default(),
            move |command: LifecycleCommand| {
                let controller = controller.clone();
                async move { jobs::handle_lifecycle(&controller, command).await }
            },
            cancel.clone(),
        )
    };

    // Delivery sends are bounded by the external APIs, not by us.
    // The handle is held so the lane stays open for the enqueueing
    // surface; dropping it would close the channel.
    let _delivery_queue = {
        let registry = registry.clone();
        JobQueue::start(
            "otp-delivery",
            3,
            QueueConfig::default(),
            move |job: OtpDelivery| {
                let registry = registry.clone();
                async move { jobs::handle_delivery(&registry, job).await }
            },
            cancel.clone(),
        )
    };

    // --- Startup reconciliation ---
    // Channels that were enabled before the last shutdown come back up
    // without waiting for the first sweep tick.
    for service in ServiceName::ALL {
        let config = config_store
            .ensure(service)
            .await
            .with_context(|| format!("Failed to load config for {service}"))?;
        if config.is_enabled {
            lifecycle_queue
                .enqueue(LifecycleCommand {
                    service_name: service,
                    action: LifecycleAction::Start,
                    triggered_by: Some("startup".to_string()),
                })
                .await
                .context("Failed to enqueue startup command")?;
        }
    }

    match controller.status_snapshot().await {
        Ok(snapshot) => {
            for channel in &snapshot {
                tracing::info!(
                    service = %channel.service,
                    enabled = channel.is_enabled,
                    status = %channel.connection_status,
                    available = channel.available,
                    "Channel state at startup"
                );
            }
        }
        Err(err) => tracing::warn!(error = %err, "Startup status snapshot failed"),
    }

    // --- Self-healing sweep ---
    let sweep_handle = tokio::spawn(sweep::run(
        controller.clone(),
        registry.clone(),
        config_store.clone(),
        sweep::SWEEP_INTERVAL,
        cancel.clone(),
    ));

    tracing::info!("Worker started");

    wait_for_shutdown().await;
    tracing::info!("Shutdown signal received, draining in-flight jobs");

    // Channels are intentionally NOT destroyed: durable status stays as
    // it was, so a restart resumes existing sessions instead of forcing
    // re-authentication.
    cancel.cancel();
    let _ = sweep_handle.await;
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    tracing::info!("Worker stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
