//! mcp-fleet: supervisor and protocol adapter for a fleet of stdio MCP servers.
//!
//! Each managed server is a child process speaking JSON-RPC over its own
//! stdin/stdout with a single serial consumer. The supervisor keeps one
//! long-lived instance of each configured server running, multiplexes
//! concurrent clients onto the serial stdio channel, and re-exposes every
//! server as a per-server HTTP endpoint plus a fleet-wide control plane.

pub mod bridge;
pub mod config;
pub mod control;
pub mod core;
pub mod daemon;
pub mod mcp;
pub mod settings;
pub mod supervisor;
