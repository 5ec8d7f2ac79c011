//! Filesystem locations for configuration and runtime state.
//!
//! Paths are resolved once and passed through constructors rather than read
//! ambiently, so tests can redirect every location per-case.

use std::env;
use std::path::{Path, PathBuf};

use crate::core::errors::FleetError;

/// Resolved configuration and state directories.
#[derive(Debug, Clone)]
pub struct Settings {
    config_dir: PathBuf,
    state_dir: PathBuf,
}

impl Settings {
    /// Resolve directories from the environment.
    ///
    /// The catalog lives in `$MCP_CONFIG_DIR` (default `$HOME/.mcp`), runtime
    /// state (pid files, daemon log) in `$MCP_STATE_DIR` (default
    /// `$HOME/.mcp-manager`).
    pub fn from_env() -> Result<Self, FleetError> {
        let home = || {
            env::var("HOME")
                .map(PathBuf::from)
                .map_err(|_| FleetError::ConfigInvalid("HOME is not set".into()))
        };

        let config_dir = match env::var("MCP_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => home()?.join(".mcp"),
        };
        let state_dir = match env::var("MCP_STATE_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => home()?.join(".mcp-manager"),
        };

        Ok(Self {
            config_dir,
            state_dir,
        })
    }

    /// Build settings with explicit directories.
    pub fn new(config_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    /// Create the config, state and pid directories if missing.
    pub fn ensure_dirs(&self) -> Result<(), FleetError> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(self.pid_dir())?;
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// `<config-dir>/mcp.json`, the ordered server catalog.
    pub fn catalog_path(&self) -> PathBuf {
        self.config_dir.join("mcp.json")
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.state_dir.join("pids")
    }

    /// `<state-dir>/pids/<name>.pid` for a managed server.
    pub fn server_pid_path(&self, name: &str) -> PathBuf {
        self.pid_dir().join(format!("{name}.pid"))
    }

    pub fn daemon_pid_path(&self) -> PathBuf {
        self.state_dir.join("daemon.pid")
    }

    pub fn daemon_log_path(&self) -> PathBuf {
        self.state_dir.join("daemon.log")
    }
}
