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

// Live collector: simulator broadcast feed merged with the physics feed

use super::broadcast::{EntityUpdate, InboundPacket, OutboundPacket, RealtimeUpdate};
use super::physics::{PhysicsFeed, PhysicsSnapshot};
use super::FrameSource;
use crate::config::LiveSourceConfig;
use crate::frame::Frame;
use crate::protocol::SessionSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const RECV_BUFFER: usize = 4096;

/// Merge one entity update with the latest physics snapshot.
///
/// Missing physics leaves throttle, brake, steering and rpm at zero.
pub fn merge_frame(
    session: Option<&RealtimeUpdate>,
    entity: &EntityUpdate,
    physics: Option<PhysicsSnapshot>,
    timestamp: i64,
) -> Frame {
    let physics = physics.unwrap_or_default();
    Frame {
        timestamp,
        speed: entity.speed_kmh(),
        throttle: physics.throttle,
        brake: physics.brake,
        steering: physics.steering,
        gear: entity.gear as i32,
        rpm: physics.rpm,
        normalized_position: entity.spline_position,
        lap_number: entity.current_lap as u32,
        lap_time: entity.current_lap_ms as i64,
        session_time: session.map(|s| s.session_time as f64),
        session_type: session.map(|s| s.session_type_name().to_string()),
        track_position: Some(entity.track_position as u32),
        delta: Some(entity.delta_ms as i64),
    }
    .clamp_inputs()
}

pub struct LiveCollector {
    config: LiveSourceConfig,
    physics: Arc<dyn PhysicsFeed>,
}

impl LiveCollector {
    pub fn new(config: LiveSourceConfig, physics: Arc<dyn PhysicsFeed>) -> Self {
        Self { config, physics }
    }

    async fn connect(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind_addr))?;
        socket
            .connect(&self.config.broadcast_addr)
            .await
            .with_context(|| format!("Failed to reach {}", self.config.broadcast_addr))?;
        Ok(socket)
    }

    /// Register until the simulator accepts. `None` means shutdown came first.
    async fn register(
        &self,
        socket: &UdpSocket,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<i32>> {
        let packet = OutboundPacket::Register {
            display_name: self.config.display_name.clone(),
            connection_password: self.config.connection_password.clone(),
            update_interval_ms: self.config.update_interval_ms,
            command_password: self.config.command_password.clone(),
        }
        .encode()?;
        let retry = Duration::from_millis(self.config.registration_retry_ms);
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!("Registering with {} (attempt {})", self.config.broadcast_addr, attempt);
            if let Err(e) = socket.send(&packet).await {
                warn!("Registration send failed: {}", e);
            }

            let deadline = Instant::now() + retry;
            loop {
                tokio::select! {
                    received = tokio::time::timeout_at(deadline, socket.recv(&mut buf)) => {
                        match received {
                            Err(_) => break,
                            Ok(Err(e)) => {
                                // Nobody listening yet; wait out the interval
                                debug!("Registration receive failed: {}", e);
                                tokio::select! {
                                    _ = tokio::time::sleep_until(deadline) => break,
                                    _ = shutdown.changed() => return Ok(None),
                                }
                            }
                            Ok(Ok(len)) => match InboundPacket::decode(&buf[..len]) {
                                Ok(Some(InboundPacket::RegistrationResult(result))) if result.success => {
                                    info!(
                                        "Registered with {} as connection {}{}",
                                        self.config.broadcast_addr,
                                        result.connection_id,
                                        if result.read_only { " (read-only)" } else { "" }
                                    );
                                    return Ok(Some(result.connection_id));
                                }
                                Ok(Some(InboundPacket::RegistrationResult(result))) => {
                                    warn!("Registration rejected: {}", result.error);
                                }
                                Ok(_) => {}
                                Err(e) => debug!("Ignoring undecodable packet: {}", e),
                            },
                        }
                    }
                    _ = shutdown.changed() => return Ok(None),
                }
            }
        }
    }

    async fn unregister(&self, socket: &UdpSocket, connection_id: i32) {
        match (OutboundPacket::Unregister { connection_id }).encode() {
            Ok(packet) => {
                if let Err(e) = socket.send(&packet).await {
                    debug!("Unregister failed: {}", e);
                }
            }
            Err(e) => debug!("Unregister encode failed: {}", e),
        }
    }

    async fn stream(
        &self,
        socket: &UdpSocket,
        tx: &mpsc::Sender<Frame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<u64> {
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut session: Option<RealtimeUpdate> = None;
        let mut emitted: u64 = 0;
        let mut ignored: u64 = 0;

        loop {
            let len = tokio::select! {
                received = socket.recv(&mut buf) => received.context("Broadcast socket failed")?,
                _ = shutdown.changed() => return Ok(emitted),
            };

            match InboundPacket::decode(&buf[..len]) {
                Ok(Some(InboundPacket::RealtimeUpdate(update))) => session = Some(update),
                Ok(Some(InboundPacket::EntityUpdate(entity))) => {
                    let Some(current) = session.as_ref() else {
                        continue;
                    };
                    if current.focused_entity_index != entity.entity_index as i32 {
                        continue;
                    }
                    let frame = merge_frame(
                        Some(current),
                        &entity,
                        self.physics.latest(),
                        chrono::Utc::now().timestamp_millis(),
                    );
                    if tx.send(frame).await.is_err() {
                        return Ok(emitted);
                    }
                    emitted += 1;
                }
                Ok(Some(InboundPacket::RegistrationResult(_))) | Ok(None) => {}
                Err(e) => {
                    ignored += 1;
                    debug!("Ignoring broadcast packet ({} so far): {}", ignored, e);
                }
            }
        }
    }
}

#[async_trait]
impl FrameSource for LiveCollector {
    fn kind(&self) -> SessionSource {
        SessionSource::Live
    }

    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<Frame>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let socket = self.connect().await?;
        let Some(connection_id) = self.register(&socket, &mut shutdown).await? else {
            return Ok(());
        };

        let result = self.stream(&socket, &tx, &mut shutdown).await;
        self.unregister(&socket, connection_id).await;
        match result {
            Ok(emitted) => {
                info!("Live collector stopped after {} frames", emitted);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
