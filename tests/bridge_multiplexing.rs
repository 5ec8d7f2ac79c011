//! Request multiplexing through the bridge: many concurrent HTTP clients,
//! one serial child pipe.

mod common;

use std::sync::Arc;

use common::ECHO_MOCK;
use mcp_fleet::bridge::Bridge;
use mcp_fleet::mcp::ChildAdapter;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn fifty_concurrent_posts_each_get_their_own_id_back() {
    let token = CancellationToken::new();
    let adapter = Arc::new(ChildAdapter::new("mock", ECHO_MOCK, &token));
    adapter.start().await.unwrap();
    let bridge = Bridge::start("mock", 0, adapter.clone(), &token)
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let url = format!("http://{}/", bridge.addr());

    let mut handles = Vec::new();
    for i in 1..=50_i64 {
        let client = client.clone();
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            let body = format!(
                r#"{{"jsonrpc":"2.0","id":{i},"method":"tools/list","params":{{}}}}"#
            );
            let resp: Value = client
                .post(&url)
                .body(body)
                .send()
                .await
                .expect("request failed")
                .json()
                .await
                .expect("malformed response");
            (i, resp)
        }));
    }

    for handle in handles {
        let (i, resp) = handle.await.unwrap();
        assert_eq!(resp["id"], i, "response id must equal the request id");
        assert!(
            resp.get("error").is_none() || resp["error"].is_null(),
            "unexpected error for id {i}: {resp}"
        );
        assert_eq!(resp["result"]["tools"].as_array().unwrap().len(), 2);
    }

    bridge.stop().await;
    adapter.stop().await;
}

#[tokio::test]
async fn mixed_methods_share_the_serial_pipe() {
    let token = CancellationToken::new();
    let adapter = Arc::new(ChildAdapter::new("mock", ECHO_MOCK, &token));
    adapter.start().await.unwrap();
    let bridge = Bridge::start("mock", 0, adapter.clone(), &token)
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let base = format!("http://{}", bridge.addr());

    // Interleave passthrough posts with live tool listings.
    let mut handles = Vec::new();
    for i in 1..=10_i64 {
        let client = client.clone();
        let base = base.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let resp: Value = client
                    .get(format!("{base}/tools/list"))
                    .send()
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();
                assert_eq!(resp["tools"].as_array().unwrap().len(), 2);
            } else {
                let body = format!(
                    r#"{{"jsonrpc":"2.0","id":{i},"method":"tools/list","params":{{}}}}"#
                );
                let resp: Value = client
                    .post(format!("{base}/"))
                    .body(body)
                    .send()
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();
                assert_eq!(resp["id"], i);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    bridge.stop().await;
    adapter.stop().await;
}
