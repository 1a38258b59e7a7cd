//! Queued job payloads and their handlers.
//!
//! Lifecycle handlers never fail: the controller converts every channel
//! problem into persisted status. Delivery handlers DO fail when the
//! target channel is unavailable, as a retryable error, so the queue's
//! backoff re-attempts the send once the channel recovers.

use std::sync::Arc;

use lendo_channels::registry::ServiceRegistry;
use lendo_channels::whatsapp::to_chat_id;
use lendo_channels::ServiceController;
use lendo_core::service::{LifecycleAction, ServiceName};
use serde::{Deserialize, Serialize};

use crate::queue::JobError;
use crate::templates::{self, TemplateType};

/// Payload of a queued lifecycle command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleCommand {
    pub service_name: ServiceName,
    pub action: LifecycleAction,
    /// Operator or subsystem that issued the command, for the logs.
    pub triggered_by: Option<String>,
}

/// Payload of a queued OTP delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpDelivery {
    /// Phone number or email address, per `channel`.
    pub recipient: String,
    pub code: String,
    pub user_name: String,
    pub channel: ServiceName,
    pub template: TemplateType,
}

pub async fn handle_lifecycle(
    controller: &Arc<ServiceController>,
    command: LifecycleCommand,
) -> Result<(), JobError> {
    if let Some(source) = &command.triggered_by {
        tracing::info!(
            service = %command.service_name,
            action = %command.action,
            triggered_by = %source,
            "Lifecycle command dequeued"
        );
    }
    controller
        .handle(command.service_name, command.action)
        .await;
    Ok(())
}

/// Dispatch one queued OTP message. The send-rate windows were already
/// consumed when the session was created, on the request path; by the
/// time a job reaches this handler the send is committed.
pub async fn handle_delivery(
    registry: &Arc<ServiceRegistry>,
    job: OtpDelivery,
) -> Result<(), JobError> {
    if !registry.is_available(job.channel).await {
        return Err(JobError::Retryable(format!(
            "{} channel not available",
            job.channel
        )));
    }

    let message = templates::render(job.template, job.channel, &job.user_name, &job.code);

    match job.channel {
        ServiceName::Whatsapp => {
            let session = registry
                .whatsapp()
                .await
                .ok_or_else(|| JobError::Retryable("WhatsApp handle vanished".to_string()))?;
            session
                .send_message(&to_chat_id(&job.recipient), &message.body)
                .await
                .map_err(|e| JobError::Retryable(e.to_string()))?;
        }
        ServiceName::Email => {
            let transporter = registry
                .email()
                .await
                .ok_or_else(|| JobError::Retryable("email transporter vanished".to_string()))?;
            transporter
                .send(&job.recipient, &message.subject, &message.body)
                .await
                .map_err(|e| JobError::Retryable(e.to_string()))?;
        }
    }

    tracing::info!(channel = %job.channel, "OTP delivered");
    Ok(())
}
