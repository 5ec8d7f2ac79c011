//! Per-child HTTP bridge.
//!
//! Each running server gets a listener on its catalog port exposing health,
//! the cached tool count, a live tool list, and raw JSON-RPC passthrough to
//! the child. All responses carry permissive CORS headers. A background
//! poller warms and refreshes the tool cache.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::errors::FleetError;
use crate::core::models::JsonRpcRequest;
use crate::mcp::ChildAdapter;

/// Delay before the first tool-count fetch after startup.
const WARMUP_DELAY: Duration = Duration::from_secs(3);
/// Retry cadence while the count is still zero.
const WARMUP_RETRY: Duration = Duration::from_secs(2);
const WARMUP_ATTEMPTS: usize = 3;
/// Steady-state refresh period.
const REFRESH_PERIOD: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct BridgeState {
    name: String,
    port: u16,
    adapter: Arc<ChildAdapter>,
}

/// A running bridge: HTTP server plus its tool-count poller.
pub struct Bridge {
    addr: SocketAddr,
    token: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    poller: tokio::task::JoinHandle<()>,
}

impl Bridge {
    /// Bind the listener and start serving. `port` 0 binds an ephemeral
    /// port; the bound address is reported by [`Bridge::addr`].
    pub async fn start(
        name: &str,
        port: u16,
        adapter: Arc<ChildAdapter>,
        parent: &CancellationToken,
    ) -> Result<Self, FleetError> {
        let token = parent.child_token();
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;

        let state = BridgeState {
            name: name.to_string(),
            port: addr.port(),
            adapter: adapter.clone(),
        };

        let app = Router::new()
            .route("/health", get(handle_health))
            .route("/tools/count", get(handle_tools_count))
            .route("/tools/list", get(handle_tools_list))
            .route("/", post(handle_passthrough))
            .fallback(handle_unknown)
            .layer(middleware::from_fn(cors))
            .with_state(state);

        let serve_token = token.clone();
        let server_name = name.to_string();
        let server = tokio::spawn(async move {
            let shutdown = async move { serve_token.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(server = %server_name, error = %e, "bridge HTTP server failed");
            }
        });

        let poller = tokio::spawn(poll_tool_count(
            name.to_string(),
            adapter,
            token.clone(),
        ));

        info!(server = name, %addr, "bridge listening");
        Ok(Self {
            addr,
            token,
            server,
            poller,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Shut the listener and poller down and wait for both.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.server.await;
        let _ = self.poller.await;
    }
}

async fn handle_health(State(state): State<BridgeState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "port": state.port,
    }))
}

async fn handle_tools_count(State(state): State<BridgeState>) -> Json<Value> {
    Json(json!({ "count": state.adapter.cached_tool_count() }))
}

async fn handle_tools_list(State(state): State<BridgeState>) -> Response {
    match state.adapter.fetch_tools().await {
        Ok(tools) => Json(json!({ "tools": tools })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to get tools: {e}"),
        )
            .into_response(),
    }
}

/// Raw JSON-RPC passthrough: the body is forwarded to the child and its
/// reply returned verbatim, with the caller's id restored by the adapter.
async fn handle_passthrough(State(state): State<BridgeState>, body: String) -> Response {
    let req: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            debug!(server = %state.name, error = %e, "rejecting malformed passthrough body");
            return (StatusCode::BAD_REQUEST, "Invalid JSON").into_response();
        }
    };
    Json(state.adapter.request(req).await).into_response()
}

async fn handle_unknown() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Permissive CORS on every response; OPTIONS preflights short-circuit.
async fn cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut res = StatusCode::OK.into_response();
        apply_cors_headers(res.headers_mut());
        return res;
    }
    let mut res = next.run(req).await;
    apply_cors_headers(res.headers_mut());
    res
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        "Access-Control-Allow-Origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type"),
    );
}

/// Warm the tool cache shortly after start, retry while it is empty, then
/// refresh on a steady cadence until the bridge is cancelled.
async fn poll_tool_count(name: String, adapter: Arc<ChildAdapter>, token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(WARMUP_DELAY) => {}
    }

    for _ in 0..WARMUP_ATTEMPTS {
        refresh_tools(&name, &adapter).await;
        if adapter.cached_tool_count() > 0 {
            break;
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(WARMUP_RETRY) => {}
        }
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(REFRESH_PERIOD) => refresh_tools(&name, &adapter).await,
        }
    }
}

async fn refresh_tools(name: &str, adapter: &ChildAdapter) {
    match adapter.fetch_tools().await {
        Ok(tools) if !tools.is_empty() => {
            debug!(server = name, count = tools.len(), "tool cache refreshed")
        }
        Ok(_) => {}
        Err(e) => warn!(server = name, error = %e, "failed to refresh tool count"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO_MOCK: &str = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"t1"},{"name":"t2"}]}}\n' "$id"
done"#;

    async fn running_bridge() -> (Bridge, Arc<ChildAdapter>, CancellationToken) {
        let token = CancellationToken::new();
        let adapter = Arc::new(ChildAdapter::new("mock", ECHO_MOCK, &token));
        adapter.start().await.unwrap();
        let bridge = Bridge::start("mock", 0, adapter.clone(), &token)
            .await
            .unwrap();
        (bridge, adapter, token)
    }

    #[tokio::test]
    async fn health_reports_the_bound_port() {
        let (bridge, adapter, _token) = running_bridge().await;
        let url = format!("http://{}/health", bridge.addr());
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["port"], bridge.port());
        bridge.stop().await;
        adapter.stop().await;
    }

    #[tokio::test]
    async fn responses_carry_cors_headers() {
        let (bridge, adapter, _token) = running_bridge().await;
        let url = format!("http://{}/health", bridge.addr());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(
            resp.headers()["Access-Control-Allow-Origin"].to_str().unwrap(),
            "*"
        );
        bridge.stop().await;
        adapter.stop().await;
    }

    #[tokio::test]
    async fn options_preflight_returns_ok() {
        let (bridge, adapter, _token) = running_bridge().await;
        let client = reqwest::Client::new();
        let resp = client
            .request(
                reqwest::Method::OPTIONS,
                format!("http://{}/tools/count", bridge.addr()),
            )
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()["Access-Control-Allow-Methods"]
                .to_str()
                .unwrap(),
            "GET, POST, OPTIONS"
        );
        bridge.stop().await;
        adapter.stop().await;
    }

    #[tokio::test]
    async fn tools_count_serves_the_cache() {
        let (bridge, adapter, _token) = running_bridge().await;
        let url = format!("http://{}/tools/count", bridge.addr());

        // Nothing fetched yet.
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["count"], 0);

        adapter.fetch_tools().await.unwrap();
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["count"], 2);

        bridge.stop().await;
        adapter.stop().await;
    }

    #[tokio::test]
    async fn tools_count_rejects_post() {
        let (bridge, adapter, _token) = running_bridge().await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{}/tools/count", bridge.addr()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 405);
        bridge.stop().await;
        adapter.stop().await;
    }

    #[tokio::test]
    async fn tools_list_queries_the_child() {
        let (bridge, adapter, _token) = running_bridge().await;
        let url = format!("http://{}/tools/list", bridge.addr());
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["tools"].as_array().unwrap().len(), 2);
        assert_eq!(body["tools"][0]["name"], "t1");
        bridge.stop().await;
        adapter.stop().await;
    }

    #[tokio::test]
    async fn passthrough_rejects_malformed_json() {
        let (bridge, adapter, _token) = running_bridge().await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{}/", bridge.addr()))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        bridge.stop().await;
        adapter.stop().await;
    }

    #[tokio::test]
    async fn passthrough_preserves_client_ids() {
        let (bridge, adapter, _token) = running_bridge().await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/", bridge.addr());

        let resp: Value = client
            .post(&url)
            .body(r#"{"jsonrpc":"2.0","id":"abc","method":"tools/list","params":{}}"#)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["id"], "abc");
        assert!(resp["result"]["tools"].is_array());

        bridge.stop().await;
        adapter.stop().await;
    }
}
