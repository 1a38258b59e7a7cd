//! WhatsApp browser-sidecar bridge.
//!
//! The headless-browser WhatsApp client runs as a separate sidecar
//! process. This module implements [`WhatsAppConnector`] against the
//! sidecar's HTTP control API plus a WebSocket event stream, translating
//! raw frames into [`WhatsAppEvent`]s for the service controller.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::whatsapp::{LiveState, WhatsAppConnector, WhatsAppError, WhatsAppEvent, WhatsAppSession};

/// Buffer for the per-session event stream.
const EVENT_BUFFER: usize = 32;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// HTTP base URL of the sidecar, e.g. `http://127.0.0.1:3310`.
    pub api_url: String,
    /// WebSocket base URL, e.g. `ws://127.0.0.1:3310`.
    pub ws_url: String,
}

impl BridgeConfig {
    /// Load from `WA_BRIDGE_API_URL` / `WA_BRIDGE_WS_URL`. The WS URL
    /// defaults to the API URL with an `ws://` scheme.
    pub fn from_env() -> Self {
        let api_url = std::env::var("WA_BRIDGE_API_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3310".to_string());
        let ws_url = std::env::var("WA_BRIDGE_WS_URL").unwrap_or_else(|_| {
            api_url
                .replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1)
        });
        Self { api_url, ws_url }
    }
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Raw event frame emitted by the sidecar's event stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeFrame {
    Qr { payload: String },
    Authenticated,
    Ready,
    AuthFailure { message: String },
    Disconnected { reason: String },
}

impl From<BridgeFrame> for WhatsAppEvent {
    fn from(frame: BridgeFrame) -> Self {
        match frame {
            BridgeFrame::Qr { payload } => WhatsAppEvent::Qr { payload },
            BridgeFrame::Authenticated => WhatsAppEvent::Authenticated,
            BridgeFrame::Ready => WhatsAppEvent::Ready,
            BridgeFrame::AuthFailure { message } => WhatsAppEvent::AuthFailure { message },
            BridgeFrame::Disconnected { reason } => WhatsAppEvent::Disconnected { reason },
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpawnResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// [`WhatsAppConnector`] backed by the browser sidecar.
pub struct BridgeConnector {
    client: reqwest::Client,
    config: BridgeConfig,
}

impl BridgeConnector {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl WhatsAppConnector for BridgeConnector {
    async fn spawn(
        &self,
        profile: &str,
    ) -> Result<(Arc<dyn WhatsAppSession>, mpsc::Receiver<WhatsAppEvent>), WhatsAppError> {
        let response = self
            .client
            .post(format!("{}/sessions", self.config.api_url))
            .json(&serde_json::json!({ "profile": profile }))
            .send()
            .await
            .map_err(|e| WhatsAppError::Spawn(e.to_string()))?;
        let spawned: SpawnResponse = parse_json(response)
            .await
            .map_err(WhatsAppError::Spawn)?;

        let ws_url = format!(
            "{}/sessions/{}/events",
            self.config.ws_url, spawned.session_id
        );
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| WhatsAppError::Spawn(format!("event stream connect failed: {e}")))?;

        tracing::info!(session_id = %spawned.session_id, "WhatsApp sidecar session spawned");

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let session_id = spawned.session_id.clone();
        tokio::spawn(async move {
            pump_events(ws_stream, &session_id, event_tx).await;
        });

        let session = Arc::new(BridgeSession {
            client: self.client.clone(),
            api_url: self.config.api_url.clone(),
            session_id: spawned.session_id,
        });

        Ok((session, event_rx))
    }

    async fn remove_auth_profile(&self, profile: &str) -> Result<(), WhatsAppError> {
        let response = self
            .client
            .delete(format!("{}/profiles/{}", self.config.api_url, profile))
            .send()
            .await
            .map_err(|e| WhatsAppError::Teardown(e.to_string()))?;
        check_status(response).await.map_err(WhatsAppError::Teardown)
    }
}

/// Forward sidecar event frames into the controller's channel until the
/// stream ends. A dropped stream is reported as a disconnect so the
/// controller persists the outage and the sweep can recover.
async fn pump_events(
    mut ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    session_id: &str,
    event_tx: mpsc::Sender<WhatsAppEvent>,
) {
    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match parse_frame(&text) {
                Ok(event) => {
                    if event_tx.send(event).await.is_err() {
                        return; // controller dropped the receiver
                    }
                }
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "Unparseable sidecar frame");
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(frame)) => {
                tracing::info!(session_id, ?frame, "Sidecar event stream closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(session_id, error = %e, "Sidecar event stream error");
                break;
            }
        }
    }

    let _ = event_tx
        .send(WhatsAppEvent::Disconnected {
            reason: "event stream closed".to_string(),
        })
        .await;
}

/// Parse one text frame from the sidecar event stream.
fn parse_frame(text: &str) -> Result<WhatsAppEvent, serde_json::Error> {
    serde_json::from_str::<BridgeFrame>(text).map(Into::into)
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

struct BridgeSession {
    client: reqwest::Client,
    api_url: String,
    session_id: String,
}

impl BridgeSession {
    fn url(&self, suffix: &str) -> String {
        format!("{}/sessions/{}{suffix}", self.api_url, self.session_id)
    }
}

#[async_trait]
impl WhatsAppSession for BridgeSession {
    async fn live_state(&self) -> LiveState {
        let state = async {
            let response = self.client.get(self.url("/state")).send().await.ok()?;
            let body: StateResponse = response.json().await.ok()?;
            Some(body.state)
        }
        .await;

        match state.as_deref() {
            Some("CONNECTED") => LiveState::Connected,
            _ => LiveState::NotConnected,
        }
    }

    async fn send_message(&self, chat_id: &str, body: &str) -> Result<(), WhatsAppError> {
        let response = self
            .client
            .post(self.url("/messages"))
            .json(&serde_json::json!({ "chat_id": chat_id, "body": body }))
            .send()
            .await
            .map_err(|e| WhatsAppError::Send(e.to_string()))?;
        check_status(response).await.map_err(WhatsAppError::Send)
    }

    async fn logout(&self) -> Result<(), WhatsAppError> {
        let response = self
            .client
            .post(self.url("/logout"))
            .send()
            .await
            .map_err(|e| WhatsAppError::Teardown(e.to_string()))?;
        check_status(response).await.map_err(WhatsAppError::Teardown)
    }

    async fn destroy(&self) -> Result<(), WhatsAppError> {
        let response = self
            .client
            .delete(self.url(""))
            .send()
            .await
            .map_err(|e| WhatsAppError::Teardown(e.to_string()))?;
        check_status(response).await.map_err(WhatsAppError::Teardown)
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

async fn check_status(response: reqwest::Response) -> Result<(), String> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(format!("sidecar returned {status}: {body}"))
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, String> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("sidecar returned {status}: {body}"));
    }
    response.json().await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qr_frame() {
        let event = parse_frame(r#"{"event":"qr","payload":"1@abc,def"}"#).unwrap();
        assert_eq!(
            event,
            WhatsAppEvent::Qr {
                payload: "1@abc,def".to_string()
            }
        );
    }

    #[test]
    fn parses_bare_ready_frame() {
        let event = parse_frame(r#"{"event":"ready"}"#).unwrap();
        assert_eq!(event, WhatsAppEvent::Ready);
    }

    #[test]
    fn parses_disconnect_with_reason() {
        let event = parse_frame(r#"{"event":"disconnected","reason":"LOGOUT"}"#).unwrap();
        assert_eq!(
            event,
            WhatsAppEvent::Disconnected {
                reason: "LOGOUT".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_frame() {
        assert!(parse_frame(r#"{"event":"telemetry","cpu":12}"#).is_err());
    }

    #[test]
    fn ws_url_derived_from_api_url() {
        std::env::remove_var("WA_BRIDGE_API_URL");
        std::env::remove_var("WA_BRIDGE_WS_URL");
        let config = BridgeConfig::from_env();
        assert_eq!(config.ws_url, "ws://127.0.0.1:3310");
    }
}
