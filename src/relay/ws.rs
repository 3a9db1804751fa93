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

// Viewer WebSocket handler
//
// Binary protocol, one message per WebSocket frame (see `protocol.rs`):
//   relay → viewer: CONNECTED, TELEMETRY, DEMO_COMPLETE, PING, PONG
//   viewer → relay: START_DEMO, STOP_DEMO, PING, PONG
//
// Any inbound message resets the liveness timer. A viewer silent for longer
// than the liveness timeout is dropped, and so is one that lags behind the
// hub: it has missed frames of the lap in progress.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::hub::HubEvent;
use super::RelayState;
use crate::protocol::{
    ConnectedInfo, RelayMessage, CLOSE_REASON_LAGGED, CLOSE_REASON_LIVENESS,
    CLOSE_REASON_SESSION_CLOSED,
};

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_TRY_AGAIN: u16 = 1013;

/// Query string of `/ws`
#[derive(Debug, Clone, Deserialize)]
pub struct ViewerIdentity {
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ViewerIdentity {
    /// Whether an event for `session_id` is meant for this viewer
    fn wants(&self, session_id: &str) -> bool {
        self.session_id.as_deref().map_or(true, |id| id == session_id)
    }
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send(tx: &mut WsSink, message: &RelayMessage) -> bool {
    match message.encode() {
        Ok(bytes) => tx.send(Message::Binary(bytes.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode relay message: {}", e);
            true
        }
    }
}

async fn close(tx: &mut WsSink, code: u16, reason: &'static str) {
    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        })))
        .await;
}

/// Serve one viewer until it leaves, times out or its session closes
pub async fn handle_viewer(socket: WebSocket, state: Arc<RelayState>, identity: ViewerIdentity) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let viewer_id = uuid::Uuid::new_v4().to_string();

    if let Some(session_id) = &identity.session_id {
        if state.hub.is_closed(session_id) {
            close(&mut ws_tx, CLOSE_NORMAL, CLOSE_REASON_SESSION_CLOSED).await;
            return;
        }
    }

    let mut rx = state.hub.attach(&identity.user_id);
    let connected = RelayMessage::Connected(ConnectedInfo {
        user_id: identity.user_id.clone(),
        session_id: identity.session_id.clone(),
        viewer_id: viewer_id.clone(),
    });
    if !send(&mut ws_tx, &connected).await {
        drop(rx);
        state.hub.detach(&identity.user_id);
        return;
    }
    info!(
        "Viewer {} attached to user '{}' (session {:?})",
        viewer_id, identity.user_id, identity.session_id
    );

    let liveness = state.liveness_timeout;
    let mut deadline = Instant::now() + liveness;
    let mut ping_ticker = tokio::time::interval_at(
        Instant::now() + liveness / 3,
        (liveness / 3).max(Duration::from_millis(10)),
    );
    let mut ping_nonce: u64 = 0;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(HubEvent::Telemetry { session_id, frame }) => {
                    if identity.wants(&session_id)
                        && !send(&mut ws_tx, &RelayMessage::Telemetry { session_id, frame }).await
                    {
                        break;
                    }
                }
                Ok(HubEvent::DemoComplete(done)) => {
                    if identity.wants(&done.session_id)
                        && !send(&mut ws_tx, &RelayMessage::DemoComplete(done)).await
                    {
                        break;
                    }
                }
                Ok(HubEvent::SessionClosed { session_id }) => {
                    if identity.session_id.as_deref() == Some(session_id.as_str()) {
                        close(&mut ws_tx, CLOSE_NORMAL, CLOSE_REASON_SESSION_CLOSED).await;
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Viewer {} lagged, missed {} messages; closing", viewer_id, n);
                    close(&mut ws_tx, CLOSE_TRY_AGAIN, CLOSE_REASON_LAGGED).await;
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = ws_rx.next() => {
                deadline = Instant::now() + liveness;
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        if !handle_inbound(&state, &identity, &mut ws_tx, &data).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Viewer {} socket error: {}", viewer_id, e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = ping_ticker.tick() => {
                ping_nonce += 1;
                if !send(&mut ws_tx, &RelayMessage::Ping(ping_nonce)).await {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                info!("Viewer {} timed out", viewer_id);
                close(&mut ws_tx, CLOSE_GOING_AWAY, CLOSE_REASON_LIVENESS).await;
                break;
            }
        }
    }

    drop(rx);
    state.hub.detach(&identity.user_id);
    info!("Viewer {} disconnected", viewer_id);
}

/// Returns `false` when the connection should end
async fn handle_inbound(
    state: &RelayState,
    identity: &ViewerIdentity,
    ws_tx: &mut WsSink,
    data: &[u8],
) -> bool {
    let message = match RelayMessage::decode(data) {
        Ok(message) => message,
        Err(e) => {
            debug!("Ignoring viewer message: {}", e);
            return true;
        }
    };

    match message {
        RelayMessage::Ping(nonce) => send(ws_tx, &RelayMessage::Pong(nonce)).await,
        RelayMessage::Pong(_) => true,
        RelayMessage::StartDemo(request) => {
            if let Err(e) = state.demos.start_demo(&identity.user_id, request).await {
                warn!("Demo start for user '{}' refused: {}", identity.user_id, e);
            }
            true
        }
        RelayMessage::StopDemo(stop) => {
            let session_id = stop.session_id.or_else(|| identity.session_id.clone());
            let stopped = state
                .demos
                .stop_demo(&identity.user_id, session_id.as_deref())
                .await;
            debug!("Stopped {} demos for user '{}'", stopped, identity.user_id);
            true
        }
        other => {
            debug!("Unexpected viewer message tag 0x{:02x}", other.tag());
            true
        }
    }
}
