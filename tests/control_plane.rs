//! Control plane end-to-end: unary operations, error mapping, and the
//! event subscription stream.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fleet_with_catalog, free_port, single_mock_catalog};
use mcp_fleet::control::{self, ControlClient, DirectApi, FleetApi};
use mcp_fleet::core::errors::FleetError;
use mcp_fleet::core::events::EventKind;
use mcp_fleet::core::models::ServerStatus;
use mcp_fleet::supervisor::Supervisor;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct Harness {
    supervisor: Arc<Supervisor>,
    addr: String,
    token: CancellationToken,
    _fleet: common::TestFleet,
}

async fn control_plane() -> Harness {
    let fleet = fleet_with_catalog(&single_mock_catalog("mock", free_port()));
    let supervisor = Supervisor::new(fleet.settings.clone()).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();

    let serve_supervisor = supervisor.clone();
    let serve_token = token.clone();
    tokio::spawn(async move {
        let _ = control::serve(serve_supervisor, listener, serve_token).await;
    });

    Harness {
        supervisor,
        addr: addr.to_string(),
        token,
        _fleet: fleet,
    }
}

impl Harness {
    async fn teardown(self) {
        self.token.cancel();
        self.supervisor.shutdown().await;
    }
}

#[tokio::test]
async fn list_health_and_config_round_trip() {
    let harness = control_plane().await;
    let client = ControlClient::connect(&harness.addr).await.unwrap();

    let (servers, order) = client.list_servers().await.unwrap();
    assert_eq!(order, vec!["mock"]);
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].status, ServerStatus::Stopped);

    let health = client.health().await.unwrap();
    assert!(health.healthy);
    assert_eq!(health.total_count, 1);
    assert_eq!(health.running_count, 0);

    let config = client.get_config().await.unwrap();
    assert_eq!(config.server_order, vec!["mock"]);
    assert!(config.config_path.ends_with("mcp.json"));
    assert_eq!(client.get_config_path().await.unwrap(), config.config_path);

    client.close();
    harness.teardown().await;
}

#[tokio::test]
async fn start_stop_round_trip_with_tools() {
    let harness = control_plane().await;
    let client = ControlClient::connect(&harness.addr).await.unwrap();

    let entry = client.start_server("mock").await.unwrap();
    assert_eq!(entry.status, ServerStatus::Running);
    assert_ne!(entry.pid, 0);

    harness.supervisor.refresh_tool_counts().await;
    let tools = client.get_tools("mock").await.unwrap();
    assert_eq!(tools.len(), 2);

    let entry = client.stop_server("mock").await.unwrap();
    assert_eq!(entry.status, ServerStatus::Stopped);
    assert_eq!(entry.pid, 0);

    client.close();
    harness.teardown().await;
}

#[tokio::test]
async fn remote_errors_fold_back_into_the_local_taxonomy() {
    let harness = control_plane().await;
    let client = ControlClient::connect(&harness.addr).await.unwrap();

    assert!(matches!(
        client.get_server("ghost").await.unwrap_err(),
        FleetError::NotFound(_)
    ));
    assert!(matches!(
        client.stop_server("mock").await.unwrap_err(),
        FleetError::Precondition(_)
    ));

    client.close();
    harness.teardown().await;
}

#[tokio::test]
async fn subscribers_see_the_optimistic_transition_first() {
    let harness = control_plane().await;
    let client = ControlClient::connect(&harness.addr).await.unwrap();

    // Give the event stream a beat to finish its subscription.
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.start_server("mock").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), client.next_event())
        .await
        .expect("no event before the monitor tick")
        .expect("event stream closed");
    match event.kind {
        EventKind::ServerStatus { name, old, new } => {
            assert_eq!(name, "mock");
            assert_eq!(old, ServerStatus::Stopped);
            assert_eq!(new, ServerStatus::Starting);
        }
        other => panic!("expected the optimistic status event, got {other:?}"),
    }

    client.close();
    harness.teardown().await;
}

#[tokio::test]
async fn monitor_reports_the_terminal_state() {
    let harness = control_plane().await;
    let client = ControlClient::connect(&harness.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.start_server("mock").await.unwrap();

    // Drain events until the monitor observes running (worst case one
    // monitor period after the optimistic event).
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut saw_running = false;
    while tokio::time::Instant::now() < deadline {
        let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(3), client.next_event()).await
        else {
            break;
        };
        if let EventKind::ServerStatus { name, new, .. } = &event.kind {
            if name == "mock" && *new == ServerStatus::Running {
                saw_running = true;
                break;
            }
        }
    }
    assert!(saw_running, "monitor never reported running");

    client.close();
    harness.teardown().await;
}

#[tokio::test]
async fn direct_api_matches_the_remote_surface() {
    let fleet = fleet_with_catalog(&single_mock_catalog("mock", free_port()));
    let api = DirectApi::new(fleet.settings.clone()).await.unwrap();

    let (servers, order) = api.list_servers().await.unwrap();
    assert_eq!(order, vec!["mock"]);
    assert_eq!(servers[0].status, ServerStatus::Stopped);

    let entry = api.start_server("mock").await.unwrap();
    assert_eq!(entry.status, ServerStatus::Running);

    let health = api.health().await.unwrap();
    assert_eq!(health.running_count, 1);

    let entry = api.stop_server("mock").await.unwrap();
    assert_eq!(entry.status, ServerStatus::Stopped);

    assert!(matches!(
        api.get_server("ghost").await.unwrap_err(),
        FleetError::NotFound(_)
    ));

    api.close().await;
}
