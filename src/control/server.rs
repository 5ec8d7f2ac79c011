//! Control-plane server.
//!
//! Unary operations are plain JSON over HTTP; the event stream is a
//! WebSocket (`GET /v1/events`) carrying [`FleetEvent`] frames. A monitor
//! task polls the supervisor every two seconds, diffs statuses against the
//! last observation, and broadcasts changes; start/stop handlers emit their
//! optimistic transition first so subscribers see motion before the next
//! tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::errors::FleetError;
use crate::core::events::{EventFilter, EventKind, FleetEvent};
use crate::core::models::{HealthStatus, ServerEntry, ServerStatus, Tool};
use crate::supervisor::Supervisor;

/// Outbound buffer per subscription. On overflow the incoming event is
/// dropped for that subscriber; slow clients are never disconnected.
pub const SUBSCRIBER_BUFFER: usize = 100;

/// Cadence of the status/tool monitor.
const MONITOR_PERIOD: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Wire DTOs, shared with the client.
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerListResponse {
    pub servers: Vec<ServerEntry>,
    pub order: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolListResponse {
    pub tools: Vec<Tool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub config_path: String,
    pub server_order: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PathResponse {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Event hub
// ---------------------------------------------------------------------------

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<FleetEvent>,
}

/// Fan-out point for subscriptions. Sends never block: a full subscriber
/// buffer drops that subscriber's copy of the event with a log line.
#[derive(Default)]
pub struct EventHub {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, filter: EventFilter) -> (u64, mpsc::Receiver<FleetEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .write()
            .await
            .insert(id, Subscriber { filter, tx });
        debug!(subscriber = id, "subscription registered");
        (id, rx)
    }

    pub async fn unregister(&self, id: u64) {
        self.subscribers.write().await.remove(&id);
        debug!(subscriber = id, "subscription removed");
    }

    pub async fn broadcast(&self, event: FleetEvent) {
        let subscribers = self.subscribers.read().await;
        for (id, sub) in subscribers.iter() {
            if !sub.filter.matches(&event.kind) {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = id, "subscriber buffer full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct ControlState {
    supervisor: Arc<Supervisor>,
    hub: Arc<EventHub>,
    started_at: Instant,
}

/// Error envelope mapping [`FleetError`] onto HTTP statuses.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        Self {
            status: StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn router(state: ControlState) -> Router {
    Router::new()
        .route("/v1/servers", get(list_servers))
        .route("/v1/servers/{name}", get(get_server))
        .route("/v1/servers/{name}/start", post(start_server))
        .route("/v1/servers/{name}/stop", post(stop_server))
        .route("/v1/servers/{name}/tools", get(get_tools))
        .route("/v1/config", get(get_config))
        .route("/v1/config/reload", post(reload_config))
        .route("/v1/config/path", get(get_config_path))
        .route("/v1/health", get(health))
        .route("/v1/events", get(subscribe_events))
        .with_state(state)
}

/// Serve the control plane on `listener` until `token` is cancelled.
///
/// Spawns the 2 s monitor and the pump that forwards supervisor-originated
/// events (reload transitions, config changes) into the hub.
pub async fn serve(
    supervisor: Arc<Supervisor>,
    listener: TcpListener,
    token: CancellationToken,
) -> Result<(), FleetError> {
    let hub = Arc::new(EventHub::new());

    tokio::spawn(monitor(supervisor.clone(), hub.clone(), token.clone()));
    tokio::spawn(pump_supervisor_events(
        supervisor.clone(),
        hub.clone(),
        token.clone(),
    ));

    let state = ControlState {
        supervisor,
        hub,
        started_at: Instant::now(),
    };

    let addr = listener.local_addr()?;
    info!(%addr, "control plane listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(|e| FleetError::Transport(format!("control plane server failed: {e}")))
}

/// Poll the supervisor, broadcast status changes and tool updates.
async fn monitor(supervisor: Arc<Supervisor>, hub: Arc<EventHub>, token: CancellationToken) {
    let mut last_status: HashMap<String, ServerStatus> = HashMap::new();
    let (entries, _) = supervisor.list().await;
    for entry in entries {
        last_status.insert(entry.name, entry.status);
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(MONITOR_PERIOD) => {}
        }

        supervisor.sweep_failed().await;

        let (entries, _) = supervisor.list().await;
        for entry in &entries {
            let old = last_status.get(&entry.name).copied();
            if old != Some(entry.status) {
                hub.broadcast(FleetEvent::status_change(
                    &entry.name,
                    old.unwrap_or(ServerStatus::Stopped),
                    entry.status,
                ))
                .await;
                last_status.insert(entry.name.clone(), entry.status);
            }
        }
        last_status.retain(|name, _| entries.iter().any(|e| &e.name == name));

        supervisor.refresh_tool_counts().await;
        let (entries, _) = supervisor.list().await;
        for entry in entries {
            if entry.is_running() && entry.tool_count > 0 {
                hub.broadcast(FleetEvent::now(EventKind::ToolUpdate {
                    name: entry.name.clone(),
                    count: entry.tool_count,
                    tools: entry.tools.clone(),
                }))
                .await;
            }
        }
    }
}

async fn pump_supervisor_events(
    supervisor: Arc<Supervisor>,
    hub: Arc<EventHub>,
    token: CancellationToken,
) {
    let mut rx = supervisor.events();
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            event = rx.recv() => match event {
                Ok(event) => hub.broadcast(event).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "supervisor event pump lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

async fn list_servers(State(state): State<ControlState>) -> Json<ServerListResponse> {
    let (servers, order) = state.supervisor.list().await;
    Json(ServerListResponse { servers, order })
}

async fn get_server(
    State(state): State<ControlState>,
    Path(name): Path<String>,
) -> Result<Json<ServerEntry>, ApiError> {
    Ok(Json(state.supervisor.get(&name).await?))
}

async fn start_server(
    State(state): State<ControlState>,
    Path(name): Path<String>,
) -> Result<Json<ServerEntry>, ApiError> {
    // Optimistic event so subscribers see motion before the monitor tick.
    state
        .hub
        .broadcast(FleetEvent::status_change(
            &name,
            ServerStatus::Stopped,
            ServerStatus::Starting,
        ))
        .await;
    let entry = state.supervisor.start(&name).await?;
    Ok(Json(entry))
}

async fn stop_server(
    State(state): State<ControlState>,
    Path(name): Path<String>,
) -> Result<Json<ServerEntry>, ApiError> {
    state
        .hub
        .broadcast(FleetEvent::status_change(
            &name,
            ServerStatus::Running,
            ServerStatus::Stopping,
        ))
        .await;
    let entry = state.supervisor.stop(&name).await?;
    Ok(Json(entry))
}

async fn get_tools(
    State(state): State<ControlState>,
    Path(name): Path<String>,
) -> Result<Json<ToolListResponse>, ApiError> {
    let entry = state.supervisor.get(&name).await?;
    Ok(Json(ToolListResponse { tools: entry.tools }))
}

async fn get_config(State(state): State<ControlState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        config_path: state.supervisor.config_path().display().to_string(),
        server_order: state.supervisor.server_order().await,
    })
}

async fn reload_config(
    State(state): State<ControlState>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.supervisor.reload_from_disk().await?;
    Ok(Json(StatusResponse {
        success: true,
        message: "Configuration reloaded".to_string(),
    }))
}

async fn get_config_path(State(state): State<ControlState>) -> Json<PathResponse> {
    Json(PathResponse {
        path: state.supervisor.config_path().display().to_string(),
    })
}

async fn health(State(state): State<ControlState>) -> Json<HealthStatus> {
    let (entries, _) = state.supervisor.list().await;
    let running_count = entries.iter().filter(|e| e.is_running()).count();
    Json(HealthStatus {
        healthy: true,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        running_count,
        total_count: entries.len(),
    })
}

#[derive(Deserialize)]
struct SubscribeParams {
    #[serde(default)]
    types: String,
}

async fn subscribe_events(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeParams>,
    State(state): State<ControlState>,
) -> Response {
    let filter = match EventFilter::parse(&params.types) {
        Ok(filter) => filter,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))).into_response()
        }
    };
    ws.on_upgrade(move |socket| handle_subscription(socket, state, filter))
}

/// One subscription: forward hub events until the client goes away.
async fn handle_subscription(socket: WebSocket, state: ControlState, filter: EventFilter) {
    let (id, mut rx) = state.hub.register(filter).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(subscriber = id, error = %e, "failed to serialize event");
                        continue;
                    }
                };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.unregister(id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: i64) -> FleetEvent {
        FleetEvent {
            kind: EventKind::ServerStatus {
                name: format!("s{n}"),
                old: ServerStatus::Stopped,
                new: ServerStatus::Starting,
            },
            timestamp: n,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_matching_subscribers_only() {
        let hub = EventHub::new();
        let (_a, mut status_rx) = hub.register(EventFilter::parse("server_status").unwrap()).await;
        let (_b, mut config_rx) = hub.register(EventFilter::parse("config_change").unwrap()).await;

        hub.broadcast(event(1)).await;

        assert_eq!(status_rx.recv().await.unwrap().timestamp, 1);
        assert!(config_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_overflow_but_stays_subscribed() {
        let hub = EventHub::new();
        let (_id, mut rx) = hub.register(EventFilter::default()).await;

        // Overrun the buffer without reading.
        for n in 0..200 {
            hub.broadcast(event(n)).await;
        }

        // At most the buffer size is queued, in order, starting from the
        // first event; the overflow was dropped.
        let mut received = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            received.push(ev.timestamp);
        }
        assert_eq!(received.len(), SUBSCRIBER_BUFFER);
        assert_eq!(received[0], 0);

        // The subscription survives: a fresh event is delivered.
        assert_eq!(hub.subscriber_count().await, 1);
        hub.broadcast(event(999)).await;
        assert_eq!(rx.recv().await.unwrap().timestamp, 999);
    }

    #[tokio::test]
    async fn one_slow_subscriber_does_not_block_another() {
        let hub = EventHub::new();
        let (_slow, _slow_rx) = hub.register(EventFilter::default()).await;
        let (_fast, mut fast_rx) = hub.register(EventFilter::default()).await;

        for n in 0..150 {
            hub.broadcast(event(n)).await;
        }
        // The fast subscriber still gets events even though the slow one's
        // buffer has been full for a while.
        let mut seen = 0;
        while fast_rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn unregister_reclaims_the_subscription() {
        let hub = EventHub::new();
        let (id, _rx) = hub.register(EventFilter::default()).await;
        assert_eq!(hub.subscriber_count().await, 1);
        hub.unregister(id).await;
        assert_eq!(hub.subscriber_count().await, 0);
    }
}
