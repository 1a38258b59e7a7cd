//! Self-healing consistency sweep.
//!
//! Every tick, durable config is compared against the live registry and
//! reconciled: enabled with no handle means initialize, disabled with a
//! handle means destroy, enabled with a handle that fails its probe
//! means restart. This compensates for crashes and silent disconnects
//! between explicit lifecycle commands.

use std::sync::Arc;
use std::time::Duration;

use lendo_core::service::{ConnectionStatus, ServiceName};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigStore;
use crate::control::ServiceController;
use crate::registry::ServiceRegistry;
use crate::whatsapp::LiveState;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// Run the sweep until cancelled. The first reconcile happens after one
/// full interval; startup reconciliation is the worker's job.
pub async fn run(
    controller: Arc<ServiceController>,
    registry: Arc<ServiceRegistry>,
    config_store: Arc<dyn ConfigStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Consistency sweep stopped");
                return;
            }
            _ = ticker.tick() => {
                reconcile(&controller, &registry, &config_store).await;
            }
        }
    }
}

/// One reconciliation pass over both channels.
pub async fn reconcile(
    controller: &Arc<ServiceController>,
    registry: &Arc<ServiceRegistry>,
    config_store: &Arc<dyn ConfigStore>,
) {
    for service in ServiceName::ALL {
        let config = match config_store.ensure(service).await {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(service = %service, error = %err, "Sweep config read failed");
                continue;
            }
        };

        // An attempt in flight resolves or times out on its own; auth
        // failures wait for operator attention.
        if matches!(
            config.connection_status,
            ConnectionStatus::Initializing
                | ConnectionStatus::WaitingForQrScan
                | ConnectionStatus::Authenticated
                | ConnectionStatus::AuthFailure
        ) {
            continue;
        }

        let handle_present = match service {
            ServiceName::Whatsapp => registry.whatsapp().await.is_some(),
            ServiceName::Email => registry.email().await.is_some(),
        };

        if config.is_enabled && !handle_present {
            tracing::info!(service = %service, "Sweep: enabled with no live handle, initializing");
            controller.initialize(service).await;
        } else if !config.is_enabled && handle_present {
            tracing::info!(service = %service, "Sweep: disabled with live handle, destroying");
            controller.destroy(service).await;
        } else if config.is_enabled && handle_present && !probe(registry, service).await {
            tracing::warn!(service = %service, "Sweep: live handle failed probe, restarting");
            controller.restart(service).await;
        }

        registry.refresh(service).await;
    }

    match controller.status_snapshot().await {
        Ok(snapshot) => {
            for channel in &snapshot {
                tracing::debug!(
                    service = %channel.service,
                    enabled = channel.is_enabled,
                    status = %channel.connection_status,
                    available = channel.available,
                    "Sweep channel state"
                );
            }
        }
        Err(err) => tracing::warn!(error = %err, "Sweep status snapshot failed"),
    }
}

/// Verify a registered handle is actually usable.
async fn probe(registry: &Arc<ServiceRegistry>, service: ServiceName) -> bool {
    match service {
        ServiceName::Whatsapp => match registry.whatsapp().await {
            Some(session) => session.live_state().await == LiveState::Connected,
            None => false,
        },
        ServiceName::Email => match registry.email().await {
            Some(transporter) => transporter.verify().await,
            None => false,
        },
    }
}
