//! Catalog entries, tool descriptors and the JSON-RPC wire types.
//!
//! Child payloads are opaque: `input_schema` and request/response bodies are
//! carried as `serde_json::Value` and never introspected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A capability descriptor published by a child's `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Preserved verbatim for passthrough.
    #[serde(
        default,
        rename = "inputSchema",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<Value>,
}

/// Result payload of the `tools/list` method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
}

/// One catalog unit: configuration plus runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub command: String,
    pub port: u16,
    #[serde(default)]
    pub description: String,
    pub status: ServerStatus,
    /// Non-zero only while running.
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub tool_count: usize,
    #[serde(default)]
    pub tools: Vec<Tool>,
    pub last_updated: DateTime<Utc>,
}

impl ServerEntry {
    pub fn new(name: &str, command: &str, port: u16, description: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            port,
            description: description.to_string(),
            status: ServerStatus::Stopped,
            pid: 0,
            tool_count: 0,
            tools: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ServerStatus::Running
    }

    pub fn set_status(&mut self, status: ServerStatus) {
        self.status = status;
        self.last_updated = Utc::now();
    }

    pub fn set_pid(&mut self, pid: u32) {
        self.pid = pid;
        self.last_updated = Utc::now();
    }

    pub fn set_tools(&mut self, tools: Vec<Tool>) {
        self.tool_count = tools.len();
        self.tools = tools;
        self.last_updated = Utc::now();
    }

    /// Reset the runtime fields on a stopped/error transition.
    pub fn clear_runtime(&mut self) {
        self.pid = 0;
        self.tool_count = 0;
        self.tools.clear();
        self.last_updated = Utc::now();
    }
}

/// Daemon health report on the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub uptime_seconds: u64,
    pub running_count: usize,
    pub total_count: usize,
}

/// JSON-RPC 2.0 request. `id` is absent for notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::from(id)),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Value,
}

impl JsonRpcResponse {
    /// Build an error envelope preserving the caller's id.
    pub fn error(id: Value, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
            id,
        }
    }

    /// Empty success envelope, used to answer forwarded notifications.
    pub fn empty(id: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: None,
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_schema_round_trips_verbatim() {
        let raw = json!({
            "name": "read_file",
            "title": "Read File",
            "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}
        });
        let tool: Tool = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(tool.name, "read_file");
        assert_eq!(serde_json::to_value(&tool).unwrap(), raw);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ServerStatus::Starting).unwrap(),
            "\"starting\""
        );
    }

    #[test]
    fn clear_runtime_resets_pid_and_tools() {
        let mut entry = ServerEntry::new("fs", "echo hi", 4001, "");
        entry.set_pid(42);
        entry.set_tools(vec![Tool {
            name: "t".into(),
            title: None,
            description: None,
            input_schema: None,
        }]);
        entry.clear_runtime();
        assert_eq!(entry.pid, 0);
        assert_eq!(entry.tool_count, 0);
        assert!(entry.tools.is_empty());
    }

    #[test]
    fn notification_omits_id_on_the_wire() {
        let req = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: None,
            method: "notifications/initialized".into(),
            params: None,
        };
        let wire = serde_json::to_string(&req).unwrap();
        assert!(!wire.contains("\"id\""));
    }
}
