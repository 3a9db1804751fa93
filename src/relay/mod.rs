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

// Live relay: axum WebSocket server for viewers
//
// - `WS /ws?user_id=..&session_id=..`: live frames for one user
// - `GET /api/status`: relay status
//
// The relay persists nothing; its only state is the set of attached viewers.

pub mod demo;
pub mod feed;
pub mod hub;
pub mod ws;

pub use demo::{DemoController, DemoError, DemoRunner};
pub use feed::RelayFeed;
pub use hub::{HubEvent, HubStats, RelayHub};
pub use ws::ViewerIdentity;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tracing::info;

use crate::config::RelaySettings;

/// Shared state of the relay server
pub struct RelayState {
    pub hub: Arc<RelayHub>,
    pub demos: Arc<dyn DemoController>,
    pub liveness_timeout: Duration,
    started: Instant,
}

impl RelayState {
    pub fn new(
        hub: Arc<RelayHub>,
        demos: Arc<dyn DemoController>,
        settings: &RelaySettings,
    ) -> Self {
        Self {
            hub,
            demos,
            liveness_timeout: Duration::from_millis(settings.liveness_timeout_ms),
            started: Instant::now(),
        }
    }
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/status", get(api_status))
        .with_state(state)
}

/// Bind and serve until `shutdown` flips
pub async fn serve(
    state: Arc<RelayState>,
    bind: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind relay to {}", bind))?;
    serve_on(state, listener, async move {
        let _ = shutdown.changed().await;
    })
    .await
}

/// Serve on an already bound listener
pub async fn serve_on(
    state: Arc<RelayState>,
    listener: tokio::net::TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!("Relay listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Relay server error")?;
    Ok(())
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(identity): Query<ViewerIdentity>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_viewer(socket, state, identity))
}

/// GET /api/status
async fn api_status(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    let stats = state.hub.stats();
    Json(serde_json::json!({
        "users": stats.users,
        "viewers": stats.viewers,
        "frames_relayed": stats.frames_relayed,
        "frames_dropped": stats.frames_dropped,
        "demos_running": state.demos.running(),
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}
