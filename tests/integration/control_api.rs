use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use workspaced::config::model::WorkspacedConfig;
use workspaced::config::secrets::SecretRegistry;
use workspaced::hub::bridge::BusBridge;
use workspaced::hub::{EventFrame, Hub, HubHandle};
use workspaced::orchestrator::lifecycle::Collaborators;
use workspaced::orchestrator::Orchestrator;
use workspaced::server::{control_app, serve};

use crate::common::*;

struct Server {
    base: String,
    ws_url: String,
    hub: HubHandle,
    cancel: CancellationToken,
}

/// Control server with workers left stopped, so queued jobs stay queued.
async fn start_server() -> Server {
    let config = WorkspacedConfig::default();
    let cancel = CancellationToken::new();
    let collab = Collaborators::in_memory();

    let (hub, handle) = Hub::new(config.hub.send_buffer);
    tokio::spawn(hub.run(cancel.clone()));
    let bridge = BusBridge::new(
        collab.bus.as_ref(),
        collab.logs.clone(),
        handle.clone(),
        config.bus.clone(),
    );
    tokio::spawn(bridge.run(cancel.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        SecretRegistry::new(),
        collab,
        cancel.clone(),
    ));
    let app = control_app(orchestrator, handle.clone(), config.hub.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve(listener, app, cancel.clone()));

    Server {
        base: format!("http://127.0.0.1:{port}"),
        ws_url: format!("ws://127.0.0.1:{port}/ws"),
        hub: handle,
        cancel,
    }
}

fn new_workspace_body() -> Value {
    json!({
        "title": "api",
        "user_id": 7,
        "organization_id": 3,
        "repository_url": "https://github.com/acme/api.git",
        "machine_type": "t3.small"
    })
}

async fn wait_for_subscribers(hub: &HubHandle, channel: &str, count: usize) {
    let found = eventually(Duration::from_secs(5), move || async move {
        hub.stats()
            .await
            .and_then(|s| s.channels.get(channel).copied())
            == Some(count)
    })
    .await;
    assert!(found, "expected {count} subscriber(s) on {channel}");
}

async fn next_frame<S>(ws: &mut S) -> EventFrame
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("socket open")
            .expect("valid message");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn subscriber_sees_workspace_created_frame() {
    let server = start_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url.as_str()).await.unwrap();

    ws.send(Message::Text(
        json!({ "action": "subscribe", "channel": "workspace_1_status" })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    wait_for_subscribers(&server.hub, "workspace_1_status", 1).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/workspaces", server.base))
        .json(&new_workspace_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["workspace"]["id"], 1);
    assert_eq!(body["workspace"]["status"], "pending");
    assert!(body["workspace"].get("access_token").is_none());

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.event_type, "workspace_created");
    assert_eq!(frame.channel, "workspace_1_status");
    assert_eq!(frame.data["fingerprint"], body["workspace"]["fingerprint"]);

    server.cancel.cancel();
}

#[tokio::test]
async fn chat_is_relayed_to_channel() {
    let server = start_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url.as_str()).await.unwrap();

    ws.send(Message::Text(
        json!({ "action": "subscribe", "channel": "room" }).to_string().into(),
    ))
    .await
    .unwrap();
    wait_for_subscribers(&server.hub, "room", 1).await;

    ws.send(Message::Text(
        json!({ "action": "chat", "channel": "room", "data": { "text": "hi" } })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.event_type, "chat");
    assert_eq!(frame.data, json!({ "text": "hi" }));

    ws.send(Message::Text(
        json!({ "action": "unsubscribe", "channel": "room" }).to_string().into(),
    ))
    .await
    .unwrap();
    let hub = &server.hub;
    let gone = eventually(Duration::from_secs(5), move || async move {
        hub.stats()
            .await
            .is_some_and(|s| !s.channels.contains_key("room"))
    })
    .await;
    assert!(gone, "empty channel should be deleted");

    server.cancel.cancel();
}

#[tokio::test]
async fn duplicate_action_is_conflict() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/workspaces", server.base))
        .json(&new_workspace_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    // creation queued a start that is still holding the workspace lock
    let resp = client
        .post(format!("{}/api/workspaces/1/actions/stop", server.base))
        .json(&json!({ "user_id": 7 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = client
        .post(format!("{}/api/workspaces/1/actions/explode", server.base))
        .json(&json!({ "user_id": 7 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    server.cancel.cancel();
}

#[tokio::test]
async fn unknown_workspace_is_not_found() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/api/workspaces/99", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{}/api/workspaces/99/actions/start", server.base))
        .json(&json!({ "user_id": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.cancel.cancel();
}

#[tokio::test]
async fn events_and_logs_endpoints_list_history() {
    let server = start_server().await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/workspaces", server.base))
        .json(&new_workspace_body())
        .send()
        .await
        .unwrap();

    let events: Value = client
        .get(format!("{}/api/workspaces/1/events", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(events.as_array().unwrap().len(), 1);
    assert_eq!(events[0]["status"], "pending");

    let logs: Value = client
        .get(format!("{}/api/workspaces/1/logs", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logs, json!([]));

    server.cancel.cancel();
}
