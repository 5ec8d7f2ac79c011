//! Control-plane client.
//!
//! Unary calls go over HTTP with per-operation deadlines; events arrive on
//! one WebSocket subscription established at connect time and fanned into a
//! local bounded channel (oldest events are dropped on overflow). A broken
//! stream reconnects after a 2 second back-off until the client is closed.

use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::control::server::{
    ConfigResponse, ErrorResponse, PathResponse, ServerListResponse, StatusResponse,
    ToolListResponse,
};
use crate::core::errors::FleetError;
use crate::core::events::FleetEvent;
use crate::core::models::{HealthStatus, ServerEntry, Tool};

/// Deadline for ordinary unary calls.
const UNARY_TIMEOUT: Duration = Duration::from_secs(5);
/// Starting a server includes the child handshake.
const START_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause before re-dialing a broken event stream.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
/// Local event fan-in capacity; a lagging consumer skips the oldest events.
const EVENT_BUFFER: usize = 100;

pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
    events: Mutex<broadcast::Receiver<FleetEvent>>,
    token: CancellationToken,
}

impl ControlClient {
    /// Connect to a daemon at `addr` (e.g. `localhost:8080`).
    ///
    /// Verifies reachability with a health probe and establishes the event
    /// subscription before returning.
    pub async fn connect(addr: &str) -> Result<Self, FleetError> {
        let base_url = format!("http://{addr}");
        let http = reqwest::Client::new();

        let probe = http
            .get(format!("{base_url}/v1/health"))
            .timeout(UNARY_TIMEOUT)
            .send()
            .await
            .map_err(|e| FleetError::Transport(format!("failed to connect to daemon: {e}")))?;
        if !probe.status().is_success() {
            return Err(FleetError::Transport(format!(
                "daemon health probe returned {}",
                probe.status()
            )));
        }

        let (event_tx, event_rx) = broadcast::channel(EVENT_BUFFER);
        let token = CancellationToken::new();
        let ws_url = format!("ws://{addr}/v1/events?types=all");
        tokio::spawn(event_stream_loop(ws_url, event_tx, token.clone()));

        Ok(Self {
            http,
            base_url,
            events: Mutex::new(event_rx),
            token,
        })
    }

    /// Next event from the subscription; `None` once the client is closed.
    /// Overflowed stretches are skipped, not delivered late.
    pub async fn next_event(&self) -> Option<FleetEvent> {
        let mut rx = self.events.lock().await;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event consumer lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop the event loop. Safe to call more than once.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub async fn list_servers(&self) -> Result<(Vec<ServerEntry>, Vec<String>), FleetError> {
        let resp: ServerListResponse = self.get_json("/v1/servers", UNARY_TIMEOUT, None).await?;
        Ok((resp.servers, resp.order))
    }

    pub async fn get_server(&self, name: &str) -> Result<ServerEntry, FleetError> {
        self.get_json(&format!("/v1/servers/{name}"), UNARY_TIMEOUT, Some(name))
            .await
    }

    pub async fn start_server(&self, name: &str) -> Result<ServerEntry, FleetError> {
        self.post_json(&format!("/v1/servers/{name}/start"), START_TIMEOUT, Some(name))
            .await
    }

    pub async fn stop_server(&self, name: &str) -> Result<ServerEntry, FleetError> {
        self.post_json(&format!("/v1/servers/{name}/stop"), STOP_TIMEOUT, Some(name))
            .await
    }

    pub async fn get_tools(&self, name: &str) -> Result<Vec<Tool>, FleetError> {
        let resp: ToolListResponse = self
            .get_json(&format!("/v1/servers/{name}/tools"), UNARY_TIMEOUT, Some(name))
            .await?;
        Ok(resp.tools)
    }

    pub async fn get_config(&self) -> Result<ConfigResponse, FleetError> {
        self.get_json("/v1/config", UNARY_TIMEOUT, None).await
    }

    pub async fn reload_config(&self) -> Result<StatusResponse, FleetError> {
        self.post_json("/v1/config/reload", UNARY_TIMEOUT, None).await
    }

    pub async fn get_config_path(&self) -> Result<String, FleetError> {
        let resp: PathResponse = self.get_json("/v1/config/path", UNARY_TIMEOUT, None).await?;
        Ok(resp.path)
    }

    pub async fn health(&self) -> Result<HealthStatus, FleetError> {
        self.get_json("/v1/health", UNARY_TIMEOUT, None).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
        name: Option<&str>,
    ) -> Result<T, FleetError> {
        let req = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .timeout(timeout);
        Self::finish(req, name).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
        name: Option<&str>,
    ) -> Result<T, FleetError> {
        let req = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .timeout(timeout);
        Self::finish(req, name).await
    }

    async fn finish<T: DeserializeOwned>(
        req: reqwest::RequestBuilder,
        name: Option<&str>,
    ) -> Result<T, FleetError> {
        let resp = req
            .send()
            .await
            .map_err(|e| FleetError::Transport(format!("daemon request failed: {e}")))?;
        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .await
                .map_err(|e| FleetError::Transport(format!("malformed daemon response: {e}")));
        }

        let message = resp
            .json::<ErrorResponse>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());
        // Fold the remote envelope back into the local taxonomy so callers
        // never see transport-specific errors.
        Err(match status.as_u16() {
            404 => FleetError::NotFound(name.unwrap_or(&message).to_string()),
            409 => FleetError::Precondition(message),
            400 => FleetError::ConfigInvalid(message),
            _ => FleetError::Transport(message),
        })
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Own the event subscription: dial, forward frames, back off and re-dial on
/// failure, until cancelled.
async fn event_stream_loop(
    ws_url: String,
    tx: broadcast::Sender<FleetEvent>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            return;
        }
        match connect_async(&ws_url).await {
            Ok((mut ws, _)) => {
                debug!("event stream connected");
                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            let _ = ws.close(None).await;
                            return;
                        }
                        msg = ws.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<FleetEvent>(&text) {
                                    Ok(event) => {
                                        let _ = tx.send(event);
                                    }
                                    Err(e) => debug!(error = %e, "ignoring unparseable event frame"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("event stream closed by server");
                                break;
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "event stream error");
                                break;
                            }
                            Some(Ok(_)) => {}
                        },
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "failed to connect event stream");
            }
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
        }
    }
}
