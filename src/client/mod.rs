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

// Live viewer client
//
// Connects to the relay over WebSocket, assembles laps with the lap-time
// reset rule and hands completed laps to a `LapSink`. At most one viewer
// per session holds the `LockStore` lease; a second one ends up in
// `ConnectionState::AlreadyOpen` without ever connecting.

pub mod lock;
pub mod state;

pub use lock::{LockStore, MemoryLockStore};
pub use state::{ConnectionState, LapView, ViewerCore, ViewerEffect};

use crate::config::ClientSettings;
use crate::protocol::{CLOSE_REASON_LAGGED, CLOSE_REASON_SESSION_CLOSED};
use crate::frame::Frame;
use crate::protocol::{DemoRequest, DemoStop, RelayMessage};
use crate::retry::{Backoff, RetryPolicy};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Destination of completed laps
#[async_trait]
pub trait LapSink: Send + Sync {
    async fn save_lap(&self, session_id: &str, frames: Vec<Frame>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerCommand {
    Pause,
    Resume,
    End,
    StartDemo(DemoRequest),
    StopDemo,
}

/// Remote control of a running [`ViewerClient`]
#[derive(Clone)]
pub struct ViewerHandle {
    commands: mpsc::Sender<ViewerCommand>,
    state: watch::Receiver<ConnectionState>,
    view: watch::Receiver<Option<LapView>>,
}

impl ViewerHandle {
    pub async fn send(&self, command: ViewerCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub async fn pause(&self) -> bool {
        self.send(ViewerCommand::Pause).await
    }

    pub async fn resume(&self) -> bool {
        self.send(ViewerCommand::Resume).await
    }

    pub async fn end(&self) -> bool {
        self.send(ViewerCommand::End).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Latest render snapshot of the lap in progress
    pub fn view(&self) -> watch::Receiver<Option<LapView>> {
        self.view.clone()
    }

    /// Wait until the client reaches `target`
    pub async fn wait_for(&mut self, target: ConnectionState) -> bool {
        self.state.wait_for(|state| *state == target).await.is_ok()
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Why a connected stream or a disconnected wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Dropped,
    Elapsed,
    Resumed,
    Ended,
    LockLost,
}

pub struct ViewerClient {
    settings: ClientSettings,
    user_id: String,
    session_id: String,
    viewer_id: String,
    locks: Arc<dyn LockStore>,
    sink: Arc<dyn LapSink>,
    state_tx: watch::Sender<ConnectionState>,
    view_tx: watch::Sender<Option<LapView>>,
    commands_tx: Option<mpsc::Sender<ViewerCommand>>,
    commands: mpsc::Receiver<ViewerCommand>,
}

impl ViewerClient {
    pub fn new(
        settings: ClientSettings,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        locks: Arc<dyn LockStore>,
        sink: Arc<dyn LapSink>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (view_tx, _) = watch::channel(None);
        let (commands_tx, commands) = mpsc::channel(32);
        Self {
            settings,
            user_id: user_id.into(),
            session_id: session_id.into(),
            viewer_id: uuid::Uuid::new_v4().to_string(),
            locks,
            sink,
            state_tx,
            view_tx,
            commands_tx: Some(commands_tx),
            commands,
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// A handle for commands and state. Take it before [`ViewerClient::run`].
    pub fn handle(&self) -> Option<ViewerHandle> {
        let commands = self.commands_tx.clone()?;
        Some(ViewerHandle {
            commands,
            state: self.state_tx.subscribe(),
            view: self.view_tx.subscribe(),
        })
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Viewer {} {:?} -> {:?}", self.viewer_id, previous, state);
        }
    }

    fn relay_url(&self) -> Result<String> {
        let mut url = reqwest::Url::parse(&self.settings.relay_url)
            .with_context(|| format!("Invalid relay URL '{}'", self.settings.relay_url))?;
        url.query_pairs_mut()
            .append_pair("user_id", &self.user_id)
            .append_pair("session_id", &self.session_id);
        Ok(url.into())
    }

    fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.settings.lock_ttl_ms)
    }

    async fn refresh_lock(&self) -> bool {
        let held = self
            .locks
            .try_acquire(&self.session_id, &self.viewer_id, self.lock_ttl())
            .await;
        if !held {
            warn!(
                "Viewer {} lost the lock of session '{}'",
                self.viewer_id, self.session_id
            );
        }
        held
    }

    /// Run until ended, superseded or refused. Returns the terminal state.
    pub async fn run(mut self) -> Result<ConnectionState> {
        // Commands come only from handles from here on
        self.commands_tx = None;
        let url = self.relay_url()?;

        if !self
            .locks
            .try_acquire(&self.session_id, &self.viewer_id, self.lock_ttl())
            .await
        {
            info!(
                "Session '{}' is already open in another viewer",
                self.session_id
            );
            self.set_state(ConnectionState::AlreadyOpen);
            return Ok(ConnectionState::AlreadyOpen);
        }

        let mut core = ViewerCore::new(
            self.session_id.clone(),
            self.settings.lap_reset_threshold_ms,
            self.settings.render_max_hz,
        );
        let mut policy = RetryPolicy::new(Backoff::from_millis(
            self.settings.reconnect_base_ms,
            self.settings.reconnect_max_ms,
        ));
        let (saved_tx, mut saved_rx) = mpsc::channel::<()>(8);
        let refresh = Duration::from_millis(self.settings.lock_refresh_ms.max(1));
        let mut lock_tick = interval_at(Instant::now() + refresh, refresh);
        lock_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let terminal = loop {
            self.set_state(if policy.attempts() == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            let exit = match connect_async(url.as_str()).await {
                Ok((socket, _)) => {
                    policy.reset();
                    info!(
                        "Viewer {} connected to relay for session '{}'",
                        self.viewer_id, self.session_id
                    );
                    self.set_state(if core.is_paused() {
                        ConnectionState::Paused
                    } else {
                        ConnectionState::Connected
                    });
                    self.stream(socket, &mut core, &saved_tx, &mut saved_rx, &mut lock_tick)
                        .await
                }
                Err(e) => {
                    warn!("Viewer {} failed to connect: {}", self.viewer_id, e);
                    Exit::Dropped
                }
            };

            match exit {
                Exit::Ended => break ConnectionState::Ended,
                Exit::LockLost => break ConnectionState::AlreadyOpen,
                _ => {}
            }

            let wait = if core.is_paused() {
                // No reconnection while paused
                self.set_state(ConnectionState::Paused);
                None
            } else {
                self.set_state(ConnectionState::Reconnecting);
                Some(policy.next_delay())
            };
            if let Some(delay) = wait {
                debug!("Viewer {} reconnecting in {:?}", self.viewer_id, delay);
            }

            match self.idle(wait, &mut core, &mut saved_rx, &mut lock_tick).await {
                Exit::Ended => break ConnectionState::Ended,
                Exit::LockLost => break ConnectionState::AlreadyOpen,
                _ => {}
            }
        };

        if terminal == ConnectionState::Ended {
            self.save_remaining(&mut core, &mut saved_rx).await;
            self.locks.release(&self.session_id, &self.viewer_id).await;
        }
        self.set_state(terminal);
        info!("Viewer {} finished: {:?}", self.viewer_id, terminal);
        Ok(terminal)
    }

    /// Persist the lap in progress once any running save has finished
    async fn save_remaining(&self, core: &mut ViewerCore, saved_rx: &mut mpsc::Receiver<()>) {
        if core.save_in_flight() {
            let _ = saved_rx.recv().await;
            core.save_finished();
        }
        if let Some(ViewerEffect::SaveLap {
            session_id,
            lap,
            frames,
        }) = core.finish()
        {
            match self.sink.save_lap(&session_id, frames).await {
                Ok(()) => info!("Saved partial lap {} of session '{}'", lap, session_id),
                Err(e) => warn!("Failed to save partial lap {}: {:#}", lap, e),
            }
        }
    }

    fn apply(&self, effect: ViewerEffect, saved_tx: &mpsc::Sender<()>) {
        match effect {
            ViewerEffect::Render(view) => {
                self.view_tx.send_replace(Some(view));
            }
            ViewerEffect::SaveLap {
                session_id,
                lap,
                frames,
            } => {
                let sink = self.sink.clone();
                let done = saved_tx.clone();
                tokio::spawn(async move {
                    let count = frames.len();
                    match sink.save_lap(&session_id, frames).await {
                        Ok(()) => info!("Saved lap {} of session '{}' ({} frames)", lap, session_id, count),
                        Err(e) => warn!("Failed to save lap {} of session '{}': {:#}", lap, session_id, e),
                    }
                    let _ = done.send(()).await;
                });
            }
        }
    }

    async fn send(tx: &mut WsSink, message: &RelayMessage) -> bool {
        match message.encode() {
            Ok(bytes) => tx.send(Message::Binary(bytes.into())).await.is_ok(),
            Err(e) => {
                warn!("Failed to encode viewer message: {}", e);
                true
            }
        }
    }

    async fn stream(
        &mut self,
        socket: WsStream,
        core: &mut ViewerCore,
        saved_tx: &mpsc::Sender<()>,
        saved_rx: &mut mpsc::Receiver<()>,
        lock_tick: &mut Interval,
    ) -> Exit {
        let (mut tx, mut rx) = socket.split();
        let every = Duration::from_millis(self.settings.ping_interval_ms.max(1));
        let mut ping = interval_at(Instant::now() + every, every);
        let mut nonce: u64 = 0;

        loop {
            tokio::select! {
                inbound = rx.next() => match inbound {
                    Some(Ok(Message::Binary(data))) => match RelayMessage::decode(&data) {
                        Ok(RelayMessage::Telemetry { session_id, frame }) => {
                            if session_id == self.session_id {
                                for effect in core.on_frame(frame, Instant::now()) {
                                    self.apply(effect, saved_tx);
                                }
                            }
                        }
                        Ok(RelayMessage::Ping(n)) => {
                            if !Self::send(&mut tx, &RelayMessage::Pong(n)).await {
                                return Exit::Dropped;
                            }
                        }
                        Ok(RelayMessage::Connected(connected)) => {
                            debug!("Relay assigned viewer id {}", connected.viewer_id);
                        }
                        Ok(RelayMessage::DemoComplete(done)) => {
                            info!("Demo for session '{}' completed {} laps", done.session_id, done.laps);
                        }
                        Ok(_) => {}
                        Err(e) => debug!("Ignoring relay message: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.as_ref().map(|f| f.reason.as_str()).unwrap_or("");
                        info!("Relay closed the connection: '{}'", reason);
                        if reason == CLOSE_REASON_LAGGED {
                            core.mark_gap();
                        }
                        return if reason == CLOSE_REASON_SESSION_CLOSED {
                            Exit::Ended
                        } else {
                            Exit::Dropped
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Relay connection error: {}", e);
                        return Exit::Dropped;
                    }
                    None => return Exit::Dropped,
                },
                _ = ping.tick() => {
                    nonce += 1;
                    if !Self::send(&mut tx, &RelayMessage::Ping(nonce)).await {
                        return Exit::Dropped;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(ViewerCommand::Pause) => {
                        core.set_paused(true);
                        self.set_state(ConnectionState::Paused);
                    }
                    Some(ViewerCommand::Resume) => {
                        core.set_paused(false);
                        self.set_state(ConnectionState::Connected);
                    }
                    Some(ViewerCommand::StartDemo(request)) => {
                        if !Self::send(&mut tx, &RelayMessage::StartDemo(request)).await {
                            return Exit::Dropped;
                        }
                    }
                    Some(ViewerCommand::StopDemo) => {
                        let stop = RelayMessage::StopDemo(DemoStop {
                            session_id: Some(self.session_id.clone()),
                        });
                        if !Self::send(&mut tx, &stop).await {
                            return Exit::Dropped;
                        }
                    }
                    Some(ViewerCommand::End) | None => {
                        let _ = tx.send(Message::Close(None)).await;
                        return Exit::Ended;
                    }
                },
                Some(()) = saved_rx.recv() => core.save_finished(),
                _ = lock_tick.tick() => {
                    if !self.refresh_lock().await {
                        let _ = tx.send(Message::Close(None)).await;
                        return Exit::LockLost;
                    }
                }
            }
        }
    }

    /// Wait while disconnected: `delay` before the next attempt, or until
    /// resumed when `None`
    async fn idle(
        &mut self,
        delay: Option<Duration>,
        core: &mut ViewerCore,
        saved_rx: &mut mpsc::Receiver<()>,
        lock_tick: &mut Interval,
    ) -> Exit {
        let mut deadline = delay.map(|d| Instant::now() + d);
        loop {
            let at = deadline;
            let wake = async move {
                match at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = wake => return Exit::Elapsed,
                command = self.commands.recv() => match command {
                    Some(ViewerCommand::Pause) => {
                        core.set_paused(true);
                        deadline = None;
                        self.set_state(ConnectionState::Paused);
                    }
                    Some(ViewerCommand::Resume) => {
                        if core.is_paused() {
                            core.set_paused(false);
                            return Exit::Resumed;
                        }
                    }
                    Some(ViewerCommand::End) | None => return Exit::Ended,
                    Some(other) => debug!("Dropping {:?} while disconnected", other),
                },
                Some(()) = saved_rx.recv() => core.save_finished(),
                _ = lock_tick.tick() => {
                    if !self.refresh_lock().await {
                        return Exit::LockLost;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        laps: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl LapSink for RecordingSink {
        async fn save_lap(&self, _session_id: &str, frames: Vec<Frame>) -> anyhow::Result<()> {
            self.laps.lock().unwrap().push(frames.len());
            Ok(())
        }
    }

    fn settings(relay_url: &str) -> ClientSettings {
        ClientSettings {
            relay_url: relay_url.to_string(),
            reconnect_base_ms: 20,
            reconnect_max_ms: 40,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_second_viewer_is_already_open() {
        let locks: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        locks
            .try_acquire("s1", "other-tab", Duration::from_secs(30))
            .await;
        let sink = Arc::new(RecordingSink::default());
        let client = ViewerClient::new(settings("ws://127.0.0.1:9/ws"), "u1", "s1", locks, sink.clone());
        let handle = client.handle().unwrap();

        let terminal = client.run().await.unwrap();
        assert_eq!(terminal, ConnectionState::AlreadyOpen);
        assert_eq!(handle.state(), ConnectionState::AlreadyOpen);
        assert!(sink.laps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_while_reconnecting_releases_lock() {
        let locks = Arc::new(MemoryLockStore::new());
        // Nothing listens here: every attempt fails
        let client = ViewerClient::new(
            settings("ws://127.0.0.1:9/ws"),
            "u1",
            "s1",
            locks.clone(),
            Arc::new(RecordingSink::default()),
        );
        let mut handle = client.handle().unwrap();
        let task = tokio::spawn(client.run());

        assert!(handle.wait_for(ConnectionState::Reconnecting).await);
        assert!(locks.holder("s1").await.is_some());
        handle.end().await;
        assert_eq!(task.await.unwrap().unwrap(), ConnectionState::Ended);
        assert!(locks.holder("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_paused_client_does_not_reconnect() {
        let locks = Arc::new(MemoryLockStore::new());
        let client = ViewerClient::new(
            settings("ws://127.0.0.1:9/ws"),
            "u1",
            "s1",
            locks,
            Arc::new(RecordingSink::default()),
        );
        let mut handle = client.handle().unwrap();
        let task = tokio::spawn(client.run());

        assert!(handle.wait_for(ConnectionState::Reconnecting).await);
        handle.pause().await;
        assert!(handle.wait_for(ConnectionState::Paused).await);

        // Well past the backoff cap: still paused
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.state(), ConnectionState::Paused);

        handle.end().await;
        assert_eq!(task.await.unwrap().unwrap(), ConnectionState::Ended);
    }

    #[test]
    fn test_relay_url_carries_identity() {
        let client = ViewerClient::new(
            settings("ws://relay.local:8090/ws"),
            "user 1",
            "s1",
            Arc::new(MemoryLockStore::new()),
            Arc::new(RecordingSink::default()),
        );
        assert_eq!(
            client.relay_url().unwrap(),
            "ws://relay.local:8090/ws?user_id=user+1&session_id=s1"
        );
    }
}
