//! The deployment-agnostic fleet API.
//!
//! Front-ends consume [`FleetApi`] only; [`DirectApi`] binds it to an
//! in-process supervisor and [`RemoteApi`] to a daemon over the control
//! plane. Both speak the same error taxonomy, so a consumer cannot tell the
//! deployments apart.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::control::client::ControlClient;
use crate::core::errors::FleetError;
use crate::core::events::FleetEvent;
use crate::core::models::{HealthStatus, ServerEntry, Tool};
use crate::settings::Settings;
use crate::supervisor::Supervisor;

#[async_trait]
pub trait FleetApi: Send + Sync {
    async fn list_servers(&self) -> Result<(Vec<ServerEntry>, Vec<String>), FleetError>;
    async fn get_server(&self, name: &str) -> Result<ServerEntry, FleetError>;
    async fn start_server(&self, name: &str) -> Result<ServerEntry, FleetError>;
    async fn stop_server(&self, name: &str) -> Result<ServerEntry, FleetError>;
    async fn get_tools(&self, name: &str) -> Result<Vec<Tool>, FleetError>;
    async fn config_path(&self) -> Result<String, FleetError>;
    async fn health(&self) -> Result<HealthStatus, FleetError>;
    /// Next fleet event, or `None` when the source is gone.
    async fn next_event(&self) -> Option<FleetEvent>;
    async fn close(&self);
}

/// In-process deployment: the API calls straight into a supervisor.
pub struct DirectApi {
    supervisor: Arc<Supervisor>,
    started_at: Instant,
    events: Mutex<broadcast::Receiver<FleetEvent>>,
}

impl DirectApi {
    pub async fn new(settings: Settings) -> Result<Self, FleetError> {
        let supervisor = Supervisor::new(settings).await?;
        Ok(Self::from_supervisor(supervisor))
    }

    pub fn from_supervisor(supervisor: Arc<Supervisor>) -> Self {
        let events = supervisor.events();
        Self {
            supervisor,
            started_at: Instant::now(),
            events: Mutex::new(events),
        }
    }
}

#[async_trait]
impl FleetApi for DirectApi {
    async fn list_servers(&self) -> Result<(Vec<ServerEntry>, Vec<String>), FleetError> {
        Ok(self.supervisor.list().await)
    }

    async fn get_server(&self, name: &str) -> Result<ServerEntry, FleetError> {
        self.supervisor.get(name).await
    }

    async fn start_server(&self, name: &str) -> Result<ServerEntry, FleetError> {
        self.supervisor.start(name).await
    }

    async fn stop_server(&self, name: &str) -> Result<ServerEntry, FleetError> {
        self.supervisor.stop(name).await
    }

    async fn get_tools(&self, name: &str) -> Result<Vec<Tool>, FleetError> {
        Ok(self.supervisor.get(name).await?.tools)
    }

    async fn config_path(&self) -> Result<String, FleetError> {
        Ok(self.supervisor.config_path().display().to_string())
    }

    async fn health(&self) -> Result<HealthStatus, FleetError> {
        let (entries, _) = self.supervisor.list().await;
        Ok(HealthStatus {
            healthy: true,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            running_count: entries.iter().filter(|e| e.is_running()).count(),
            total_count: entries.len(),
        })
    }

    async fn next_event(&self) -> Option<FleetEvent> {
        let mut rx = self.events.lock().await;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn close(&self) {
        self.supervisor.shutdown().await;
    }
}

/// Remote deployment: the API goes through the daemon's control plane.
pub struct RemoteApi {
    client: ControlClient,
}

impl RemoteApi {
    pub async fn connect(addr: &str) -> Result<Self, FleetError> {
        Ok(Self {
            client: ControlClient::connect(addr).await?,
        })
    }

    pub fn client(&self) -> &ControlClient {
        &self.client
    }
}

#[async_trait]
impl FleetApi for RemoteApi {
    async fn list_servers(&self) -> Result<(Vec<ServerEntry>, Vec<String>), FleetError> {
        self.client.list_servers().await
    }

    async fn get_server(&self, name: &str) -> Result<ServerEntry, FleetError> {
        self.client.get_server(name).await
    }

    async fn start_server(&self, name: &str) -> Result<ServerEntry, FleetError> {
        self.client.start_server(name).await
    }

    async fn stop_server(&self, name: &str) -> Result<ServerEntry, FleetError> {
        self.client.stop_server(name).await
    }

    async fn get_tools(&self, name: &str) -> Result<Vec<Tool>, FleetError> {
        self.client.get_tools(name).await
    }

    async fn config_path(&self) -> Result<String, FleetError> {
        self.client.get_config_path().await
    }

    async fn health(&self) -> Result<HealthStatus, FleetError> {
        self.client.health().await
    }

    async fn next_event(&self) -> Option<FleetEvent> {
        self.client.next_event().await
    }

    async fn close(&self) {
        self.client.close();
    }
}
