//! Shared fixtures for integration tests.
#![allow(dead_code)]

use mcp_fleet::settings::Settings;

/// Mock MCP server: answers every JSON-RPC request with the request's own
/// id and a fixed two-tool `tools/list` result. Usable as a catalog
/// `command` because the supervisor shell-interprets commands.
pub const ECHO_MOCK: &str = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"t1"},{"name":"t2"}]}}\n' "$id"
done"#;

/// An OS-assigned port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind probe")
        .local_addr()
        .expect("local addr")
        .port()
}

/// A temp config/state pair with a pre-written catalog file.
pub struct TestFleet {
    pub settings: Settings,
    // Held for its Drop: removes the directories.
    _dir: tempfile::TempDir,
}

pub fn fleet_with_catalog(catalog_json: &str) -> TestFleet {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_dir = dir.path().join("cfg");
    let state_dir = dir.path().join("state");
    std::fs::create_dir_all(&config_dir).expect("config dir");
    std::fs::write(config_dir.join("mcp.json"), catalog_json).expect("catalog");
    TestFleet {
        settings: Settings::new(config_dir, state_dir),
        _dir: dir,
    }
}

/// Catalog JSON with a single mock server on `port`.
pub fn single_mock_catalog(name: &str, port: u16) -> String {
    format!(
        r#"{{"servers":{{"{name}":{{"command":{cmd},"port":{port},"description":"mock server"}}}}}}"#,
        cmd = serde_json::to_string(ECHO_MOCK).unwrap(),
    )
}
