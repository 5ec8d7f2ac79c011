//! The ordered server catalog.
//!
//! The on-disk shape is `{"servers": {name: {command, port?, description?}}}`.
//! JSON objects are unordered once parsed, but the catalog's key order is
//! semantically significant: it drives iteration everywhere and port
//! auto-assignment. Loading therefore parses twice — once through serde into
//! the typed map, once as a raw byte walk that recovers the original key
//! order. The walk is the single source of truth for `server_order`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::errors::FleetError;
use crate::core::events::ConfigDiff;

/// First port handed out when an entry has no explicit `port`.
pub const BASE_PORT: u16 = 4001;

/// One server's configuration as written in `mcp.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Deserialize)]
struct CatalogFile {
    servers: HashMap<String, ServerConfig>,
}

/// The full catalog: configs plus the authoritative name order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    pub servers: HashMap<String, ServerConfig>,
    pub server_order: Vec<String>,
}

impl Catalog {
    /// Load the catalog from `path`.
    ///
    /// A missing file yields the built-in defaults without persisting them;
    /// saving happens only on explicit mutation.
    pub fn load(path: &Path) -> Result<Self, FleetError> {
        if !path.exists() {
            debug!(path = %path.display(), "catalog file absent, using defaults");
            return Ok(Self::default_catalog());
        }
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    /// Parse catalog JSON, recover key order, assign missing ports, validate.
    pub fn parse(data: &str) -> Result<Self, FleetError> {
        let file: CatalogFile = serde_json::from_str(data)
            .map_err(|e| FleetError::ConfigInvalid(format!("failed to parse catalog: {e}")))?;

        let mut catalog = Self {
            servers: file.servers,
            server_order: scan_server_order(data),
        };

        // The scan can only disagree with the typed parse on malformed input
        // serde accepted (e.g. duplicate keys); resolve by trusting the map.
        catalog.server_order.retain(|n| catalog.servers.contains_key(n));
        for name in catalog.servers.keys() {
            if !catalog.server_order.contains(name) {
                catalog.server_order.push(name.clone());
            }
        }

        catalog.assign_ports();
        catalog.validate()?;
        Ok(catalog)
    }

    /// Fill in missing ports by walking `server_order` from [`BASE_PORT`].
    ///
    /// Explicit ports advance the cursor past themselves so later
    /// auto-assigned entries never collide with an earlier explicit one.
    fn assign_ports(&mut self) {
        let mut next_port = BASE_PORT;
        let order = self.server_order.clone();
        for name in &order {
            let current = match self.servers.get(name) {
                Some(cfg) => cfg.port,
                None => continue,
            };
            match current {
                None => {
                    while self.port_in_use(next_port) {
                        next_port += 1;
                    }
                    if let Some(cfg) = self.servers.get_mut(name) {
                        cfg.port = Some(next_port);
                    }
                    next_port += 1;
                }
                Some(p) if p >= next_port => next_port = p + 1,
                Some(_) => {}
            }
        }
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.servers.values().any(|c| c.port == Some(port))
    }

    /// Enforce port uniqueness across the catalog.
    pub fn validate(&self) -> Result<(), FleetError> {
        let mut seen: HashMap<u16, &str> = HashMap::new();
        for name in &self.server_order {
            let Some(cfg) = self.servers.get(name) else {
                continue;
            };
            if let Some(port) = cfg.port {
                if let Some(other) = seen.insert(port, name) {
                    return Err(FleetError::ConfigInvalid(format!(
                        "port {port} is claimed by both '{other}' and '{name}'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize with keys in `server_order`, two-space indented.
    ///
    /// The output round-trips through [`Catalog::parse`] without re-ordering.
    pub fn to_json(&self) -> Result<String, FleetError> {
        let mut out = String::from("{\n  \"servers\": {\n");
        for (i, name) in self.server_order.iter().enumerate() {
            let Some(cfg) = self.servers.get(name) else {
                continue;
            };
            let body = serde_json::to_string_pretty(cfg)
                .map_err(|e| FleetError::ConfigInvalid(format!("failed to serialize '{name}': {e}")))?;
            let key = serde_json::to_string(name)
                .map_err(|e| FleetError::ConfigInvalid(format!("failed to serialize key: {e}")))?;
            out.push_str("    ");
            out.push_str(&key);
            out.push_str(": ");
            out.push_str(&body.replace('\n', "\n    "));
            if i + 1 < self.server_order.len() {
                out.push(',');
            }
            out.push('\n');
        }
        out.push_str("  }\n}");
        Ok(out)
    }

    pub fn save(&self, path: &Path) -> Result<(), FleetError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Per-field change set between two catalogs, in the new catalog's order.
    pub fn diff(&self, new: &Catalog) -> ConfigDiff {
        let mut diff = ConfigDiff::default();
        for name in &new.server_order {
            match self.servers.get(name) {
                None => diff.added.push(name.clone()),
                Some(old) => {
                    let changed = new
                        .servers
                        .get(name)
                        .map(|n| {
                            n.command != old.command
                                || n.port != old.port
                                || n.description != old.description
                        })
                        .unwrap_or(false);
                    if changed {
                        diff.modified.push(name.clone());
                    }
                }
            }
        }
        for name in &self.server_order {
            if !new.servers.contains_key(name) {
                diff.removed.push(name.clone());
            }
        }
        diff
    }

    /// Built-in catalog used when no `mcp.json` exists yet.
    fn default_catalog() -> Self {
        let defaults = [
            (
                "playwright",
                "npx @playwright/mcp@latest",
                "Browser automation, screenshots, web interaction",
            ),
            (
                "filesystem",
                "npx @modelcontextprotocol/server-filesystem@latest /tmp",
                "File system operations (read/write/create/delete)",
            ),
            (
                "postgres",
                "npx @modelcontextprotocol/server-postgres@latest postgresql://localhost/mydb",
                "PostgreSQL database operations and queries",
            ),
            (
                "github",
                "npx @modelcontextprotocol/server-github@latest",
                "GitHub repository and issue management",
            ),
            (
                "sequential-thinking",
                "npx @modelcontextprotocol/server-sequential-thinking@latest",
                "Structured problem-solving with reasoning paths",
            ),
        ];

        let mut catalog = Self::default();
        for (name, command, description) in defaults {
            catalog.server_order.push(name.to_string());
            catalog.servers.insert(
                name.to_string(),
                ServerConfig {
                    command: command.to_string(),
                    port: None,
                    description: Some(description.to_string()),
                },
            );
        }
        catalog.assign_ports();
        catalog
    }
}

/// Walk the raw JSON and return the keys of the `servers` object in
/// document order.
///
/// The walk tracks string/escape state and brace depth only; it does not
/// validate the document (the typed parse already did).
fn scan_server_order(data: &str) -> Vec<String> {
    let bytes = data.as_bytes();
    let mut order = Vec::new();
    let mut depth: i32 = 0;
    let mut servers_depth: Option<i32> = None;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let (text, end) = read_json_string(bytes, i);
                let mut j = end;
                while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                let is_key = j < bytes.len() && bytes[j] == b':';
                if is_key {
                    if depth == 1 && text == "servers" && servers_depth.is_none() {
                        servers_depth = Some(depth + 1);
                    } else if Some(depth) == servers_depth {
                        order.push(text);
                    }
                }
                i = end;
            }
            b'{' | b'[' => {
                depth += 1;
                i += 1;
            }
            b'}' | b']' => {
                if Some(depth) == servers_depth {
                    servers_depth = None;
                }
                depth -= 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    order
}

/// Read the JSON string starting at the opening quote `bytes[start]`.
/// Returns the decoded text and the index just past the closing quote.
fn read_json_string(bytes: &[u8], start: usize) -> (String, usize) {
    let mut buf = Vec::new();
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => return (String::from_utf8_lossy(&buf).into_owned(), i + 1),
            b'\\' if i + 1 < bytes.len() => {
                match bytes[i + 1] {
                    b'"' => buf.push(b'"'),
                    b'\\' => buf.push(b'\\'),
                    b'/' => buf.push(b'/'),
                    b'n' => buf.push(b'\n'),
                    b't' => buf.push(b'\t'),
                    b'r' => buf.push(b'\r'),
                    other => {
                        buf.push(b'\\');
                        buf.push(other);
                    }
                }
                i += 2;
            }
            other => {
                // Multi-byte UTF-8 sequences pass through untouched.
                buf.push(other);
                i += 1;
            }
        }
    }
    (String::from_utf8_lossy(&buf).into_owned(), i)
}
