//! The fleet supervisor.
//!
//! Holds the catalog and the set of live adapter/bridge pairs, serializes
//! all mutations through a single writer lock, and keeps the three views of
//! a server consistent: catalog status, pid file, and live adapter. Reads
//! return deep copies; no lock is ever held across child I/O.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::{spawn_watcher, Catalog, ServerConfig};
use crate::core::errors::FleetError;
use crate::core::events::{ConfigDiff, EventKind, FleetEvent};
use crate::core::models::{ServerEntry, ServerStatus};
use crate::mcp::process::{pid_alive, signal_group};
use crate::mcp::ChildAdapter;
use crate::settings::Settings;

/// Pause between stop and start when a modified entry is restarted.
const RESTART_DELAY: Duration = Duration::from_millis(500);

struct LivePair {
    adapter: Arc<ChildAdapter>,
    bridge: Bridge,
}

struct Inner {
    entries: HashMap<String, ServerEntry>,
    order: Vec<String>,
    live: HashMap<String, LivePair>,
}

pub struct Supervisor {
    settings: Settings,
    inner: RwLock<Inner>,
    token: CancellationToken,
    events: broadcast::Sender<FleetEvent>,
}

impl Supervisor {
    /// Build the supervisor: load the catalog, recover pid files, start the
    /// catalog watcher.
    pub async fn new(settings: Settings) -> Result<Arc<Self>, FleetError> {
        settings.ensure_dirs()?;
        let catalog = Catalog::load(&settings.catalog_path())?;

        let mut entries = HashMap::new();
        for name in &catalog.server_order {
            if let Some(cfg) = catalog.servers.get(name) {
                entries.insert(name.clone(), entry_from_config(name, cfg));
            }
        }

        let (events, _) = broadcast::channel(256);
        let supervisor = Arc::new(Self {
            settings: settings.clone(),
            inner: RwLock::new(Inner {
                entries,
                order: catalog.server_order.clone(),
                live: HashMap::new(),
            }),
            token: CancellationToken::new(),
            events,
        });

        supervisor.recover_from_pid_files().await;

        let (tx, mut rx) = mpsc::channel(8);
        let _ = spawn_watcher(
            settings.catalog_path(),
            catalog,
            supervisor.token.clone(),
            tx,
        );
        let weak = Arc::downgrade(&supervisor);
        tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                let Some(sup) = weak.upgrade() else { return };
                if let Err(e) = sup.apply_reload(change.catalog, change.diff).await {
                    warn!(error = %e, "config reload rejected");
                }
            }
        });

        Ok(supervisor)
    }

    /// Subscribe to supervisor-originated events (reload transitions and
    /// config changes). Status polling is the control plane's job.
    pub fn events(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Token cancelled on shutdown; bridges, adapters and pollers hang off
    /// child tokens of this one.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn config_path(&self) -> PathBuf {
        self.settings.catalog_path()
    }

    /// Deep copies of every entry, in catalog order, plus the order itself.
    pub async fn list(&self) -> (Vec<ServerEntry>, Vec<String>) {
        let inner = self.inner.read().await;
        let entries = inner
            .order
            .iter()
            .filter_map(|n| inner.entries.get(n).cloned())
            .collect();
        (entries, inner.order.clone())
    }

    pub async fn get(&self, name: &str) -> Result<ServerEntry, FleetError> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(name.to_string()))
    }

    pub async fn server_order(&self) -> Vec<String> {
        self.inner.read().await.order.clone()
    }

    /// Start one server: spawn its child, run the handshake, bring up the
    /// bridge, write the pid file.
    pub async fn start(&self, name: &str) -> Result<ServerEntry, FleetError> {
        let (command, port) = {
            let mut inner = self.inner.write().await;
            let entry = inner
                .entries
                .get_mut(name)
                .ok_or_else(|| FleetError::NotFound(name.to_string()))?;
            match entry.status {
                ServerStatus::Stopped | ServerStatus::Error => {}
                other => {
                    return Err(FleetError::Precondition(format!(
                        "server '{name}' is {other}, cannot start"
                    )))
                }
            }
            entry.set_status(ServerStatus::Starting);
            (entry.command.clone(), entry.port)
        };

        match self.spawn_pair(name, &command, port).await {
            Ok((pair, pid)) => {
                if let Err(e) = self.write_pid_file(name, pid) {
                    warn!(server = name, error = %e, "failed to write pid file");
                }
                let mut guard = self.inner.write().await;
                if !guard.entries.contains_key(name) {
                    // Removed by a concurrent reload while we were spawning.
                    drop(guard);
                    pair.bridge.stop().await;
                    pair.adapter.stop().await;
                    self.remove_pid_file(name);
                    return Err(FleetError::NotFound(name.to_string()));
                }
                let inner = &mut *guard;
                let entry = inner.entries.get_mut(name).expect("presence checked");
                entry.set_pid(pid);
                entry.set_status(ServerStatus::Running);
                let copy = entry.clone();
                inner.live.insert(name.to_string(), pair);
                info!(server = name, pid, port, "server started");
                Ok(copy)
            }
            Err(e) => {
                let mut inner = self.inner.write().await;
                if let Some(entry) = inner.entries.get_mut(name) {
                    entry.set_status(ServerStatus::Error);
                    entry.clear_runtime();
                }
                warn!(server = name, error = %e, "server failed to start");
                Err(e)
            }
        }
    }

    async fn spawn_pair(
        &self,
        name: &str,
        command: &str,
        port: u16,
    ) -> Result<(LivePair, u32), FleetError> {
        let adapter = Arc::new(ChildAdapter::new(name, command, &self.token));
        let pid = adapter.start().await?;
        match Bridge::start(name, port, adapter.clone(), &self.token).await {
            Ok(bridge) => Ok((LivePair { adapter, bridge }, pid)),
            Err(e) => {
                adapter.stop().await;
                Err(e)
            }
        }
    }

    /// Stop one server: bridge down, adapter down (the adapter SIGTERMs the
    /// process group), pid file removed, runtime fields reset.
    ///
    /// An explicit stop on an `error` entry returns it to `stopped`.
    pub async fn stop(&self, name: &str) -> Result<ServerEntry, FleetError> {
        let pair = {
            let mut guard = self.inner.write().await;
            let inner = &mut *guard;
            let entry = inner
                .entries
                .get_mut(name)
                .ok_or_else(|| FleetError::NotFound(name.to_string()))?;
            match entry.status {
                ServerStatus::Running => {}
                ServerStatus::Error => {
                    entry.set_status(ServerStatus::Stopped);
                    entry.clear_runtime();
                    return Ok(entry.clone());
                }
                other => {
                    return Err(FleetError::Precondition(format!(
                        "server '{name}' is {other}, cannot stop"
                    )))
                }
            }
            entry.set_status(ServerStatus::Stopping);
            inner.live.remove(name)
        };

        if let Some(pair) = pair {
            pair.bridge.stop().await;
            pair.adapter.stop().await;
        }
        self.remove_pid_file(name);

        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(name)
            .ok_or_else(|| FleetError::NotFound(name.to_string()))?;
        entry.set_status(ServerStatus::Stopped);
        entry.clear_runtime();
        info!(server = name, "server stopped");
        Ok(entry.clone())
    }

    /// Start every server that is not already running; failures are logged
    /// per-server and do not stop the sweep.
    pub async fn start_all(&self) {
        for name in self.server_order().await {
            let startable = self
                .get(&name)
                .await
                .map(|e| matches!(e.status, ServerStatus::Stopped | ServerStatus::Error))
                .unwrap_or(false);
            if startable {
                if let Err(e) = self.start(&name).await {
                    warn!(server = %name, error = %e, "failed to start server");
                }
            }
        }
    }

    pub async fn stop_all(&self) {
        for name in self.server_order().await {
            let running = self.get(&name).await.map(|e| e.is_running()).unwrap_or(false);
            if running {
                if let Err(e) = self.stop(&name).await {
                    warn!(server = %name, error = %e, "failed to stop server");
                }
            }
        }
    }

    /// Query `tools/list` on every running server and fold the results into
    /// the catalog entries. Queries run concurrently, one task per server.
    pub async fn refresh_tool_counts(&self) {
        let targets: Vec<(String, Arc<ChildAdapter>)> = {
            let inner = self.inner.read().await;
            inner
                .live
                .iter()
                .filter(|(name, _)| {
                    inner
                        .entries
                        .get(*name)
                        .map(|e| e.is_running())
                        .unwrap_or(false)
                })
                .map(|(name, pair)| (name.clone(), pair.adapter.clone()))
                .collect()
        };

        let mut tasks = Vec::new();
        for (name, adapter) in targets {
            tasks.push(tokio::spawn(async move {
                let tools = adapter.fetch_tools().await;
                (name, tools)
            }));
        }
        for task in tasks {
            if let Ok((name, Ok(tools))) = task.await {
                let mut inner = self.inner.write().await;
                if let Some(entry) = inner.entries.get_mut(&name) {
                    entry.set_tools(tools);
                }
            }
        }
    }

    /// Move servers whose adapter lost its session (failed in-place restart)
    /// to `error` and tear their runtime down. Returns the affected names.
    pub async fn sweep_failed(&self) -> Vec<String> {
        let unhealthy: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .live
                .iter()
                .filter(|(_, pair)| !pair.adapter.is_healthy())
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut failed = Vec::new();
        for name in unhealthy {
            let pair = {
                let mut guard = self.inner.write().await;
                let inner = &mut *guard;
                match inner.entries.get_mut(&name) {
                    Some(entry) if entry.is_running() => {
                        entry.set_status(ServerStatus::Error);
                        entry.clear_runtime();
                        inner.live.remove(&name)
                    }
                    _ => None,
                }
            };
            if let Some(pair) = pair {
                warn!(server = %name, "adapter lost its child, marking as error");
                pair.bridge.stop().await;
                pair.adapter.stop().await;
                self.remove_pid_file(&name);
                failed.push(name);
            }
        }
        failed
    }

    /// Apply a catalog change set.
    ///
    /// The new catalog is validated before anything mutates; a port conflict
    /// rejects the whole reload. Status events for removed servers are
    /// emitted before the final `config_change` event.
    pub async fn apply_reload(
        &self,
        new_catalog: Catalog,
        diff: ConfigDiff,
    ) -> Result<(), FleetError> {
        new_catalog.validate()?;
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "applying config reload"
        );

        for name in &diff.removed {
            let was_running = self.get(name).await.map(|e| e.is_running()).unwrap_or(false);
            if was_running {
                if let Err(e) = self.stop(name).await {
                    warn!(server = %name, error = %e, "failed to stop removed server");
                } else {
                    self.emit(FleetEvent::status_change(
                        name,
                        ServerStatus::Running,
                        ServerStatus::Stopped,
                    ));
                }
            }
            let mut inner = self.inner.write().await;
            inner.entries.remove(name);
        }

        for name in &diff.modified {
            let Some(cfg) = new_catalog.servers.get(name) else {
                continue;
            };
            let current = match self.get(name).await {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let new_port = cfg.port.unwrap_or(current.port);
            let unchanged = current.command == cfg.command
                && current.port == new_port
                && current.description == cfg.description.clone().unwrap_or_default();
            if unchanged {
                continue;
            }

            let was_running = current.is_running();
            if was_running {
                if let Err(e) = self.stop(name).await {
                    warn!(server = %name, error = %e, "failed to stop modified server");
                }
            }
            {
                let mut inner = self.inner.write().await;
                if let Some(entry) = inner.entries.get_mut(name) {
                    entry.command = cfg.command.clone();
                    entry.port = new_port;
                    entry.description = cfg.description.clone().unwrap_or_default();
                }
            }
            if was_running {
                tokio::time::sleep(RESTART_DELAY).await;
                if let Err(e) = self.start(name).await {
                    warn!(server = %name, error = %e, "failed to restart modified server");
                }
            }
        }

        {
            let mut inner = self.inner.write().await;
            for name in &diff.added {
                if inner.entries.contains_key(name) {
                    continue;
                }
                if let Some(cfg) = new_catalog.servers.get(name) {
                    inner
                        .entries
                        .insert(name.clone(), entry_from_config(name, cfg));
                }
            }
            inner.order = new_catalog.server_order.clone();
        }

        self.emit(FleetEvent::now(EventKind::ConfigChange {
            added: diff.added,
            removed: diff.removed,
            modified: diff.modified,
        }));
        Ok(())
    }

    /// Reload the catalog from disk and apply the difference.
    pub async fn reload_from_disk(&self) -> Result<(), FleetError> {
        let new_catalog = Catalog::load(&self.config_path())?;
        let current = self.current_catalog().await;
        let diff = current.diff(&new_catalog);
        self.apply_reload(new_catalog, diff).await
    }

    /// Add a server to the catalog and persist the ordered file.
    pub async fn add_server(
        &self,
        name: &str,
        command: &str,
        port: Option<u16>,
        description: &str,
    ) -> Result<ServerEntry, FleetError> {
        let mut catalog = self.current_catalog().await;
        if catalog.servers.contains_key(name) {
            return Err(FleetError::Precondition(format!(
                "server '{name}' already exists"
            )));
        }
        catalog.server_order.push(name.to_string());
        catalog.servers.insert(
            name.to_string(),
            ServerConfig {
                command: command.to_string(),
                port,
                description: if description.is_empty() {
                    None
                } else {
                    Some(description.to_string())
                },
            },
        );
        // Round-trip through the serializer to auto-assign the port and
        // validate uniqueness before anything is persisted.
        let catalog = Catalog::parse(&catalog.to_json()?)?;
        catalog.save(&self.config_path())?;

        let cfg = catalog.servers.get(name).expect("just inserted");
        let entry = entry_from_config(name, cfg);
        let mut inner = self.inner.write().await;
        inner.entries.insert(name.to_string(), entry.clone());
        inner.order.push(name.to_string());
        Ok(entry)
    }

    /// Remove a server (stopping it first if needed) and persist.
    pub async fn remove_server(&self, name: &str) -> Result<(), FleetError> {
        let entry = self.get(name).await?;
        if entry.is_running() {
            self.stop(name).await?;
        }

        let mut catalog = self.current_catalog().await;
        catalog.servers.remove(name);
        catalog.server_order.retain(|n| n != name);
        catalog.save(&self.config_path())?;

        let mut inner = self.inner.write().await;
        inner.entries.remove(name);
        inner.order.retain(|n| n != name);
        Ok(())
    }

    /// Stop every running server and cancel all background tasks.
    pub async fn shutdown(&self) {
        info!("supervisor shutting down");
        self.stop_all().await;
        self.token.cancel();
    }

    async fn current_catalog(&self) -> Catalog {
        let inner = self.inner.read().await;
        let mut catalog = Catalog::default();
        for name in &inner.order {
            if let Some(entry) = inner.entries.get(name) {
                catalog.server_order.push(name.clone());
                catalog.servers.insert(
                    name.clone(),
                    ServerConfig {
                        command: entry.command.clone(),
                        port: Some(entry.port),
                        description: if entry.description.is_empty() {
                            None
                        } else {
                            Some(entry.description.clone())
                        },
                    },
                );
            }
        }
        catalog
    }

    /// On construction, reconcile pid files with reality. A live pid from a
    /// previous daemon cannot be re-attached to a stdio session, so the
    /// stale group is terminated and the entry started fresh under
    /// management; a dead pid just clears the stale file.
    async fn recover_from_pid_files(&self) {
        for name in self.server_order().await {
            let path = self.settings.server_pid_path(&name);
            let Some(pid) = read_pid_file(&path) else {
                continue;
            };
            if pid_alive(pid) {
                info!(server = %name, pid, "found live server from a previous run, restarting under management");
                signal_group(pid, libc::SIGTERM);
                tokio::time::sleep(Duration::from_millis(200)).await;
                if pid_alive(pid) {
                    signal_group(pid, libc::SIGKILL);
                }
                if let Err(e) = self.start(&name).await {
                    warn!(server = %name, error = %e, "failed to re-start recovered server");
                }
            } else {
                debug!(server = %name, pid, "clearing stale pid file");
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    fn write_pid_file(&self, name: &str, pid: u32) -> Result<(), FleetError> {
        std::fs::create_dir_all(self.settings.pid_dir())?;
        std::fs::write(self.settings.server_pid_path(name), pid.to_string())?;
        Ok(())
    }

    fn remove_pid_file(&self, name: &str) {
        let _ = std::fs::remove_file(self.settings.server_pid_path(name));
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.events.send(event);
    }
}

fn entry_from_config(name: &str, cfg: &ServerConfig) -> ServerEntry {
    ServerEntry::new(
        name,
        &cfg.command,
        cfg.port.unwrap_or(0),
        cfg.description.as_deref().unwrap_or(""),
    )
}

fn read_pid_file(path: &std::path::Path) -> Option<u32> {
    let data = std::fs::read_to_string(path).ok()?;
    data.trim().parse().ok()
}
