//! End-to-end test over a real socket: HTTP upgrade, subscribe frames,
//! direct hub publish, bridged bus events and shutdown.

use beacon::api::{build_router, AppState};
use beacon::bridge::{BridgeAdapter, MemoryBus, MessageBus};
use beacon::websocket::{Hub, HubConfig};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type Client =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct Server {
    addr: std::net::SocketAddr,
    hub: Hub,
    bus: MemoryBus,
    cancel: CancellationToken,
}

async fn start_server() -> Server {
    let cancel = CancellationToken::new();
    let (hub, _coordinator) = Hub::spawn(HubConfig::default(), cancel.clone());
    let bus = MemoryBus::new();
    let bridge = BridgeAdapter::connect(&bus, hub.clone(), None).await.unwrap();

    let bus_handle: Arc<dyn MessageBus> = Arc::new(bus.clone());
    let state = AppState::new(hub.clone(), bus_handle).with_bridge(Arc::new(bridge));
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });

    Server {
        addr,
        hub,
        bus,
        cancel,
    }
}

async fn send_subscribe(client: &mut Client, channel: &str) {
    let frame = json!({"type": "subscribe", "channel": channel}).to_string();
    client.send(Message::Text(frame)).await.unwrap();
}

async fn wait_indexed(hub: &Hub, channel: &str) {
    for _ in 0..200 {
        if hub.subscriber_count(channel) == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("subscription to {channel} never reached the hub");
}

async fn subscribe(client: &mut Client, hub: &Hub, channel: &str) {
    send_subscribe(client, channel).await;
    wait_indexed(hub, channel).await;
}

/// Wildcard patterns are not indexed by the hub. Frames are read in order,
/// so an exact marker subscribed afterwards shows the pattern was applied.
async fn subscribe_pattern(client: &mut Client, hub: &Hub, pattern: &str, marker: &str) {
    send_subscribe(client, pattern).await;
    subscribe(client, hub, marker).await;
    assert_eq!(hub.subscriber_count(pattern), 0);
}

async fn next_text(client: &mut Client) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket ended")
            .unwrap();
        match msg {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_subscribe_publish_and_shutdown() {
    let server = start_server().await;
    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();

    subscribe(&mut client, &server.hub, "chat").await;
    assert_eq!(server.hub.connection_count(), 1);

    server
        .hub
        .publish("chat", "message", json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(
        next_text(&mut client).await,
        r#"{"channel":"chat","type":"message","data":{"text":"hi"}}"#
    );

    subscribe_pattern(&mut client, &server.hub, "user.*", "users-ready").await;
    server
        .bus
        .publish("user.created", json!({"id": 1}))
        .await
        .unwrap();
    assert_eq!(
        next_text(&mut client).await,
        r#"{"channel":"user.created","type":"created","data":{"id":1}}"#
    );

    // Malformed control frames are ignored and the socket stays up
    client.send(Message::Text("garbage".into())).await.unwrap();
    server
        .hub
        .publish("*", "announce", json!("still here"))
        .await
        .unwrap();
    assert_eq!(
        next_text(&mut client).await,
        r#"{"channel":"*","type":"announce","data":"still here"}"#
    );

    server.cancel.cancel();
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(msg) = client.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(_) => continue,
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);
}

#[tokio::test]
async fn test_client_disconnect_unregisters() {
    let server = start_server().await;
    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();

    subscribe(&mut client, &server.hub, "chat").await;
    client.close(None).await.unwrap();

    for _ in 0..200 {
        if server.hub.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server.hub.connection_count(), 0);
    assert_eq!(server.hub.subscriber_count("chat"), 0);

    server.cancel.cancel();
}
