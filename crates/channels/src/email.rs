//! SMTP email channel built on the `lettre` async transport.
//!
//! Initialization is a three-step liveness check: validate settings,
//! verify the SMTP handshake, then send a self-addressed test message.
//! Only after all three does the transporter count as connected.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use regex::Regex;

use crate::config::ChannelConfig;

/// Default SMTP port (STARTTLS).
const DEFAULT_SMTP_PORT: u16 = 587;

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    /// Required settings are missing; connection was never attempted.
    #[error("email configuration error: {0}")]
    Config(String),

    /// Handshake, authentication, or send failure with an actionable
    /// operator-facing message.
    #[error("{0}")]
    Transport(String),

    #[error("email build error: {0}")]
    Build(String),
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
    /// RFC 5322 "From" address; also the test-message recipient.
    pub from_address: String,
}

impl EmailSettings {
    /// Load settings from the channel's `config` blob, naming every
    /// missing required setting in the error. Environment variables
    /// (`SMTP_HOST`, `SMTP_USER`, `SMTP_PASSWORD`, `SMTP_PORT`,
    /// `SMTP_FROM`) serve only as a bootstrap fallback for keys the blob
    /// does not carry.
    ///
    /// | Blob key   | Required | Default |
    /// |------------|----------|---------|
    /// | `host`     | yes      |         |
    /// | `user`     | yes      |         |
    /// | `password` | yes      |         |
    /// | `port`     | no       | `587`   |
    /// | `from`     | no       | `user`  |
    pub fn from_config(blob: &serde_json::Value) -> Result<Self, EmailError> {
        let mut missing = Vec::new();
        let host = setting(blob, "host", "SMTP_HOST", &mut missing);
        let user = setting(blob, "user", "SMTP_USER", &mut missing);
        let password = setting(blob, "password", "SMTP_PASSWORD", &mut missing);
        if !missing.is_empty() {
            return Err(EmailError::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }

        let user = user.unwrap_or_default();
        Ok(Self {
            smtp_host: host.unwrap_or_default(),
            smtp_port: blob
                .get("port")
                .and_then(|v| v.as_u64())
                .map(|p| p as u16)
                .or_else(|| {
                    std::env::var("SMTP_PORT")
                        .ok()
                        .and_then(|p| p.parse().ok())
                })
                .unwrap_or(DEFAULT_SMTP_PORT),
            from_address: blob
                .get("from")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .or_else(|| std::env::var("SMTP_FROM").ok().filter(|s| !s.is_empty()))
                .unwrap_or_else(|| user.clone()),
            smtp_user: user,
            smtp_password: password.unwrap_or_default(),
        })
    }
}

fn setting(
    blob: &serde_json::Value,
    key: &'static str,
    env_var: &'static str,
    missing: &mut Vec<&'static str>,
) -> Option<String> {
    if let Some(v) = blob.get(key).and_then(|v| v.as_str()) {
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    match std::env::var(env_var) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => {
            missing.push(key);
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Transport traits
// ---------------------------------------------------------------------------

/// A live email transporter handle.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError>;

    /// Re-verify the SMTP handshake; used by the consistency sweep.
    async fn verify(&self) -> bool;
}

/// Factory producing connected transporters from the channel's durable
/// settings.
#[async_trait]
pub trait EmailConnector: Send + Sync {
    async fn connect(&self, config: &ChannelConfig) -> Result<Arc<dyn EmailTransport>, EmailError>;
}

// ---------------------------------------------------------------------------
// SMTP implementation
// ---------------------------------------------------------------------------

pub struct SmtpTransporter {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
}

#[async_trait]
impl EmailTransport for SmtpTransporter {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError> {
        let message = Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|e| EmailError::Build(format!("bad from address: {e}")))?,
            )
            .to(to
                .parse()
                .map_err(|e| EmailError::Build(format!("bad recipient address: {e}")))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| EmailError::Build(e.to_string()))?;

        self.mailer
            .send(message)
            .await
            .map_err(|e| EmailError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn verify(&self) -> bool {
        self.mailer.test_connection().await.unwrap_or(false)
    }
}

/// [`EmailConnector`] that parses settings from the channel's config
/// blob on every attempt, so a fixed configuration is picked up by the
/// next initialize without a process restart. Missing settings surface
/// as a [`EmailError::Config`] naming the absent keys.
#[derive(Default)]
pub struct SmtpConnector;

impl SmtpConnector {
    async fn connect_with(
        &self,
        settings: EmailSettings,
    ) -> Result<Arc<dyn EmailTransport>, EmailError> {
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)
            .map_err(|e| EmailError::Transport(e.to_string()))?
            .port(settings.smtp_port)
            .credentials(Credentials::new(
                settings.smtp_user.clone(),
                settings.smtp_password.clone(),
            ))
            .build();

        // Protocol handshake only.
        match mailer.test_connection().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(EmailError::Transport(
                    "SMTP connection verification failed".to_string(),
                ))
            }
            Err(e) => {
                return Err(EmailError::Transport(actionable_message(
                    &settings.smtp_host,
                    &e.to_string(),
                )))
            }
        }

        let transporter = Arc::new(SmtpTransporter {
            mailer,
            from_address: settings.from_address.clone(),
        });

        // End-to-end liveness check: a self-addressed test message.
        transporter
            .send(
                &settings.from_address,
                "Email channel test",
                "This is an automated connectivity check. No action needed.",
            )
            .await
            .map_err(|e| {
                EmailError::Transport(actionable_message(&settings.smtp_host, &e.to_string()))
            })?;

        Ok(transporter)
    }
}

#[async_trait]
impl EmailConnector for SmtpConnector {
    async fn connect(&self, config: &ChannelConfig) -> Result<Arc<dyn EmailTransport>, EmailError> {
        let settings = EmailSettings::from_config(&config.config)?;
        self.connect_with(settings).await
    }
}

/// Translate a raw SMTP error into an operator-actionable message.
///
/// Recognizes Gmail's credential rejection (5.7.8 / "Username and
/// Password not accepted") and suggests an app password instead of
/// echoing the bare protocol error.
fn actionable_message(host: &str, raw: &str) -> String {
    let auth_rejected = Regex::new(r"(?i)username and password not accepted|5\.7\.8|535[\s-]")
        .map(|re| re.is_match(raw))
        .unwrap_or(false);

    if auth_rejected && host.contains("gmail") {
        format!(
            "Gmail rejected the credentials ({raw}). Use an app password: \
             https://support.google.com/accounts/answer/185833"
        )
    } else if auth_rejected {
        format!("SMTP authentication rejected by {host}: {raw}")
    } else {
        format!("SMTP connection to {host} failed: {raw}")
    }
}
