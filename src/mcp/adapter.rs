//! The serialized stdio session with one managed server.
//!
//! A child speaks JSON-RPC over a single serial pipe and assumes one
//! consumer, so every request contends on one mutex that serializes the
//! write-then-read pair. The adapter owns a monotonic request-id counter,
//! rewrites each caller's id before the send and restores it on the
//! response, so callers never observe the internal numbering.
//!
//! Failure policy: a write or read error triggers one in-place restart
//! (kill the process group, respawn, re-initialize) and one retry of the
//! current request. A second failure surfaces as a JSON-RPC error envelope
//! with `code: -1` and the caller's original id. A 30 second read deadline
//! bounds head-of-line blocking and does not trigger a restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::errors::FleetError;
use crate::core::models::{JsonRpcRequest, JsonRpcResponse, Tool, ToolsListResult};
use crate::mcp::process::ChildProcess;

/// Read deadline for one child request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// MCP protocol revision spoken to children.
const PROTOCOL_VERSION: &str = "2024-11-05";

struct ChildIo {
    process: ChildProcess,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
}

struct SessionState {
    io: Option<ChildIo>,
    request_id: u64,
}

enum TransactError {
    Timeout,
    Io(String),
}

/// Owns the lifetime of one managed child program.
pub struct ChildAdapter {
    name: String,
    command: String,
    token: CancellationToken,
    session: Mutex<SessionState>,
    healthy: AtomicBool,
    tools: RwLock<Vec<Tool>>,
}

impl ChildAdapter {
    pub fn new(name: &str, command: &str, parent: &CancellationToken) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            token: parent.child_token(),
            session: Mutex::new(SessionState {
                io: None,
                request_id: 0,
            }),
            healthy: AtomicBool::new(false),
            tools: RwLock::new(Vec::new()),
        }
    }

    /// Spawn the child and complete the initialize handshake.
    ///
    /// Returns the child pid. An initialize failure rejects the whole start
    /// and leaves no process behind.
    pub async fn start(&self) -> Result<u32, FleetError> {
        let mut state = self.session.lock().await;
        if state.io.is_some() {
            return Err(FleetError::Precondition(format!(
                "adapter for '{}' is already started",
                self.name
            )));
        }
        let io = self.open_session(&mut state.request_id).await?;
        let pid = io.process.pid();
        state.io = Some(io);
        self.healthy.store(true, Ordering::SeqCst);
        info!(server = %self.name, pid, "child initialized");
        Ok(pid)
    }

    /// Tear the session down: unblock pending I/O, SIGTERM the group, reap.
    pub async fn stop(&self) {
        self.token.cancel();
        let mut state = self.session.lock().await;
        if let Some(io) = state.io.take() {
            io.process.shutdown().await;
        }
        self.healthy.store(false, Ordering::SeqCst);
    }

    /// True while the adapter holds a usable session.
    ///
    /// Cleared when an in-place restart fails; the supervisor sweeps
    /// unhealthy adapters into the `error` state.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub async fn pid(&self) -> Option<u32> {
        let state = self.session.lock().await;
        state.io.as_ref().map(|io| io.process.pid())
    }

    /// Tools from the last successful `tools/list`, without touching the child.
    pub fn cached_tools(&self) -> Vec<Tool> {
        self.tools.read().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn cached_tool_count(&self) -> usize {
        self.tools.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Query `tools/list` on the live child and refresh the cache.
    pub async fn fetch_tools(&self) -> Result<Vec<Tool>, FleetError> {
        let req = JsonRpcRequest::new(0, "tools/list", Some(json!({})));
        let resp = self.request(req).await;
        if let Some(err) = resp.error {
            return Err(FleetError::RequestFailed {
                name: self.name.clone(),
                reason: err.message,
            });
        }
        let result: ToolsListResult = serde_json::from_value(resp.result.unwrap_or(Value::Null))
            .map_err(|e| FleetError::RequestFailed {
                name: self.name.clone(),
                reason: format!("malformed tools/list result: {e}"),
            })?;
        if let Ok(mut cache) = self.tools.write() {
            *cache = result.tools.clone();
        }
        Ok(result.tools)
    }

    /// Forward one JSON-RPC request to the child.
    ///
    /// Always produces an envelope: failures come back as JSON-RPC errors
    /// carrying the caller's original id, never as a transport error.
    pub async fn request(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        let original_id = req.id.clone().unwrap_or(Value::Null);
        let mut state = self.session.lock().await;

        if state.io.is_none() {
            return JsonRpcResponse::error(original_id, -1, "child process not initialized");
        }

        // Notifications are one-way; reading the pipe for them would block
        // until an unrelated response arrives.
        if req.id.is_none() {
            let io = state.io.as_mut().expect("session checked above");
            if let Err(e) = write_message(io, &req).await {
                warn!(server = %self.name, error = %e, "failed to forward notification");
            }
            return JsonRpcResponse::empty(Value::Null);
        }

        state.request_id += 1;
        let wire_id = state.request_id;
        let mut wire = req.clone();
        wire.id = Some(Value::from(wire_id));

        let first = {
            let io = state.io.as_mut().expect("session checked above");
            transact(io, &wire, wire_id, &self.token).await
        };
        match first {
            Ok(mut resp) => {
                resp.id = original_id;
                resp
            }
            Err(TransactError::Timeout) => {
                warn!(server = %self.name, method = %req.method, "request timed out");
                JsonRpcResponse::error(original_id, -1, "Request timeout")
            }
            Err(TransactError::Io(reason)) => {
                warn!(server = %self.name, error = %reason, "child I/O failed, restarting in place");
                if let Some(old) = state.io.take() {
                    old.process.shutdown().await;
                }
                match self.open_session(&mut state.request_id).await {
                    Ok(io) => {
                        state.io = Some(io);
                        self.healthy.store(true, Ordering::SeqCst);
                    }
                    Err(e) => {
                        self.healthy.store(false, Ordering::SeqCst);
                        return JsonRpcResponse::error(
                            original_id,
                            -1,
                            &format!("failed to restart child process: {e}"),
                        );
                    }
                }

                // Exactly one retry of the current request.
                state.request_id += 1;
                let retry_id = state.request_id;
                let mut retry = req.clone();
                retry.id = Some(Value::from(retry_id));
                let second = {
                    let io = state.io.as_mut().expect("restart just succeeded");
                    transact(io, &retry, retry_id, &self.token).await
                };
                match second {
                    Ok(mut resp) => {
                        resp.id = original_id;
                        resp
                    }
                    Err(TransactError::Timeout) => {
                        JsonRpcResponse::error(original_id, -1, "Request timeout")
                    }
                    Err(TransactError::Io(reason)) => JsonRpcResponse::error(
                        original_id,
                        -1,
                        &format!("request failed after restart: {reason}"),
                    ),
                }
            }
        }
    }

    /// Spawn the child and run the initialize exchange.
    async fn open_session(&self, request_id: &mut u64) -> Result<ChildIo, FleetError> {
        let spawned = ChildProcess::spawn(&self.name, &self.command)?;
        let mut io = ChildIo {
            process: spawned.process,
            stdin: spawned.stdin,
            reader: BufReader::new(spawned.stdout),
        };

        *request_id += 1;
        let init_id = *request_id;
        let init = JsonRpcRequest::new(
            init_id,
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "roots": {"listChanged": true},
                    "sampling": {}
                },
                "clientInfo": {
                    "name": "mcp-fleet",
                    "version": env!("CARGO_PKG_VERSION")
                }
            })),
        );

        let handshake = transact(&mut io, &init, init_id, &self.token).await;
        let resp = match handshake {
            Ok(resp) => resp,
            Err(TransactError::Timeout) => {
                io.process.shutdown().await;
                return Err(FleetError::InitializeFailed {
                    name: self.name.clone(),
                    reason: "initialize timed out".into(),
                });
            }
            Err(TransactError::Io(reason)) => {
                io.process.shutdown().await;
                return Err(FleetError::InitializeFailed {
                    name: self.name.clone(),
                    reason,
                });
            }
        };

        if let Some(err) = resp.error {
            io.process.shutdown().await;
            return Err(FleetError::InitializeFailed {
                name: self.name.clone(),
                reason: err.message,
            });
        }

        debug!(server = %self.name, "initialize handshake complete");
        Ok(io)
    }
}

async fn write_message(io: &mut ChildIo, req: &JsonRpcRequest) -> Result<(), String> {
    let mut json =
        serde_json::to_string(req).map_err(|e| format!("failed to serialize request: {e}"))?;
    json.push('\n');
    io.stdin
        .write_all(json.as_bytes())
        .await
        .map_err(|e| format!("failed to write to child stdin: {e}"))?;
    io.stdin
        .flush()
        .await
        .map_err(|e| format!("failed to flush child stdin: {e}"))?;
    Ok(())
}

/// One serial write-then-read exchange, bounded by [`REQUEST_TIMEOUT`].
async fn transact(
    io: &mut ChildIo,
    req: &JsonRpcRequest,
    wire_id: u64,
    token: &CancellationToken,
) -> Result<JsonRpcResponse, TransactError> {
    write_message(io, req).await.map_err(TransactError::Io)?;

    let read = async {
        let mut line = String::new();
        loop {
            line.clear();
            let n = io
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| format!("failed to read from child stdout: {e}"))?;
            if n == 0 {
                return Err("child stdout closed".to_string());
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            // Anything that is not our response (log noise, server-initiated
            // notifications) is skipped; ids are rewritten so the match is
            // exact.
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == Value::from(wire_id) => return Ok(resp),
                Ok(_) | Err(_) => continue,
            }
        }
    };

    tokio::select! {
        _ = token.cancelled() => Err(TransactError::Io("adapter cancelled".into())),
        res = tokio::time::timeout(REQUEST_TIMEOUT, read) => match res {
            Err(_) => Err(TransactError::Timeout),
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(reason)) => Err(TransactError::Io(reason)),
        },
    }
}
