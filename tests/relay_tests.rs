// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Relay server over real sockets

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use telemetry_pipeline::broker::{Broker, MemoryBroker, TopicProvisioner};
use telemetry_pipeline::config::{
    DemoSourceConfig, ProducerSettings, RelaySettings, TopicSettings,
};
use telemetry_pipeline::relay::{self, DemoRunner, RelayHub, RelayState};
use telemetry_pipeline::storage::MemoryStore;
use telemetry_pipeline::{Frame, RelayMessage, SessionManager, SessionSource};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    addr: SocketAddr,
    hub: Arc<RelayHub>,
    manager: Arc<SessionManager>,
    _stop: oneshot::Sender<()>,
}

async fn start_relay(liveness_timeout_ms: u64) -> Relay {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let provisioner = Arc::new(TopicProvisioner::new(broker.clone(), &TopicSettings::default()));
    let manager = Arc::new(SessionManager::new(Arc::new(MemoryStore::new())));
    let hub = Arc::new(RelayHub::new(64));
    manager.register_closer(hub.clone());

    let demos = Arc::new(DemoRunner::new(
        broker,
        provisioner,
        manager.clone(),
        hub.clone(),
        ProducerSettings::default(),
        DemoSourceConfig::default(),
    ));
    manager.register_closer(demos.clone());

    let settings = RelaySettings {
        liveness_timeout_ms,
        ..RelaySettings::default()
    };
    let state = Arc::new(RelayState::new(hub.clone(), demos, &settings));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(relay::serve_on(state, listener, async move {
        let _ = stop_rx.await;
    }));

    Relay {
        addr,
        hub,
        manager,
        _stop: stop_tx,
    }
}

async fn connect(addr: SocketAddr, user_id: &str, session_id: &str) -> Viewer {
    let url = format!("ws://{}/ws?user_id={}&session_id={}", addr, user_id, session_id);
    let (viewer, _) = connect_async(url.as_str()).await.unwrap();
    viewer
}

/// Next relay protocol message, skipping keepalive pings
async fn next_message(viewer: &mut Viewer) -> RelayMessage {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), viewer.next())
            .await
            .expect("timed out waiting for relay")
            .expect("socket closed")
            .unwrap();
        if let Message::Binary(data) = message {
            match RelayMessage::decode(&data).unwrap() {
                RelayMessage::Ping(_) => continue,
                decoded => return decoded,
            }
        }
    }
}

/// Read until the relay closes the socket; returns the close reason
async fn close_reason(viewer: &mut Viewer) -> String {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(3), viewer.next())
            .await
            .expect("timed out waiting for close");
        match message {
            Some(Ok(Message::Close(frame))) => {
                return frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default()
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return String::new(),
        }
    }
}

fn frame(lap_time: i64) -> Frame {
    Frame {
        timestamp: 1_000 + lap_time,
        lap_number: 1,
        lap_time,
        speed: 180.0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_viewer_receives_connected_then_own_session_frames() {
    let relay = start_relay(30_000).await;
    let mut viewer = connect(relay.addr, "u1", "s1").await;

    match next_message(&mut viewer).await {
        RelayMessage::Connected(info) => {
            assert_eq!(info.user_id, "u1");
            assert_eq!(info.session_id.as_deref(), Some("s1"));
            assert!(!info.viewer_id.is_empty());
        }
        other => panic!("expected CONNECTED, got {:?}", other),
    }
    assert_eq!(relay.hub.viewer_count("u1"), 1);

    // Another session of the same user is filtered out for this viewer
    relay.hub.dispatch("u1", "s2", frame(10));
    relay.hub.dispatch("u1", "s1", frame(20));

    match next_message(&mut viewer).await {
        RelayMessage::Telemetry { session_id, frame } => {
            assert_eq!(session_id, "s1");
            assert_eq!(frame.lap_time, 20);
        }
        other => panic!("expected TELEMETRY, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let relay = start_relay(30_000).await;
    let mut viewer = connect(relay.addr, "u1", "s1").await;
    next_message(&mut viewer).await;

    let ping = RelayMessage::Ping(42).encode().unwrap();
    viewer.send(Message::Binary(ping.into())).await.unwrap();
    assert_eq!(next_message(&mut viewer).await, RelayMessage::Pong(42));
}

#[tokio::test]
async fn test_archiving_session_closes_viewer() {
    let relay = start_relay(30_000).await;
    relay
        .manager
        .create(Some("s1".into()), "u1", SessionSource::Live, vec![])
        .await
        .unwrap();

    let mut viewer = connect(relay.addr, "u1", "s1").await;
    next_message(&mut viewer).await;

    relay.manager.archive("s1").await.unwrap();
    assert_eq!(close_reason(&mut viewer).await, "session closed");

    // Reconnecting to a closed session is refused right away
    let mut late = connect(relay.addr, "u1", "s1").await;
    assert_eq!(close_reason(&mut late).await, "session closed");
}

#[tokio::test]
async fn test_lagging_viewer_is_closed() {
    let relay = start_relay(30_000).await;
    let mut viewer = connect(relay.addr, "u1", "s1").await;
    next_message(&mut viewer).await;

    // More frames than the viewer channel holds, without yielding to the relay
    for i in 0..200 {
        relay.hub.dispatch("u1", "s1", frame(i));
    }
    assert_eq!(close_reason(&mut viewer).await, "viewer lagged");
}

#[tokio::test]
async fn test_silent_viewer_is_dropped() {
    let relay = start_relay(300).await;
    let mut viewer = connect(relay.addr, "u1", "s1").await;
    next_message(&mut viewer).await;

    assert_eq!(close_reason(&mut viewer).await, "liveness timeout");

    for _ in 0..50 {
        if relay.hub.viewer_count("u1") == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.hub.viewer_count("u1"), 0);
}

#[tokio::test]
async fn test_status_endpoint_counts_viewers() {
    let relay = start_relay(30_000).await;
    let mut viewer = connect(relay.addr, "u1", "s1").await;
    next_message(&mut viewer).await;

    let status: serde_json::Value = reqwest::Client::new()
        .get(format!("http://{}/api/status", relay.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["viewers"], 1);
}
