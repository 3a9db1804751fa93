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

// High-rate physics input (throttle, brake, steering, rpm)
//
// The physics feed runs much faster than the broadcast feed, so only the
// latest value matters. Readers take whatever is in the slot and never wait.

use anyhow::{Context, Result};
use crossbeam::atomic::AtomicCell;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Snapshots older than this are treated as absent
pub const STALE_AFTER: Duration = Duration::from_secs(1);

const DATAGRAM_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhysicsSnapshot {
    pub throttle: f32,
    pub brake: f32,
    pub steering: f32,
    pub rpm: f32,
}

impl PhysicsSnapshot {
    /// Decode a `throttle, brake, steering, rpm` datagram (4 × f32 LE)
    pub fn from_datagram(data: &[u8]) -> Option<Self> {
        if data.len() != DATAGRAM_LEN {
            return None;
        }
        let field = |i: usize| {
            let start = i * 4;
            f32::from_le_bytes([data[start], data[start + 1], data[start + 2], data[start + 3]])
        };
        let snapshot = Self {
            throttle: field(0),
            brake: field(1),
            steering: field(2),
            rpm: field(3),
        };
        if [snapshot.throttle, snapshot.brake, snapshot.steering, snapshot.rpm]
            .iter()
            .all(|v| v.is_finite())
        {
            Some(snapshot)
        } else {
            None
        }
    }

    pub fn to_datagram(&self) -> [u8; DATAGRAM_LEN] {
        let mut out = [0u8; DATAGRAM_LEN];
        for (i, v) in [self.throttle, self.brake, self.steering, self.rpm]
            .iter()
            .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// Source of the most recent physics values
pub trait PhysicsFeed: Send + Sync {
    /// Latest fresh snapshot, or `None` when the feed is down
    fn latest(&self) -> Option<PhysicsSnapshot>;
}

/// A feed that never has data; every frame gets neutral physics
pub struct NoPhysics;

impl PhysicsFeed for NoPhysics {
    fn latest(&self) -> Option<PhysicsSnapshot> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct Stamped {
    snapshot: PhysicsSnapshot,
    at: Instant,
}

/// Lock-free latest-value slot
pub struct PhysicsSlot {
    cell: AtomicCell<Option<Stamped>>,
    stale_after: Duration,
}

impl Default for PhysicsSlot {
    fn default() -> Self {
        Self::new(STALE_AFTER)
    }
}

impl PhysicsSlot {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            cell: AtomicCell::new(None),
            stale_after,
        }
    }

    pub fn store(&self, snapshot: PhysicsSnapshot) {
        self.cell.store(Some(Stamped {
            snapshot,
            at: Instant::now(),
        }));
    }
}

impl PhysicsFeed for PhysicsSlot {
    fn latest(&self) -> Option<PhysicsSnapshot> {
        self.cell
            .load()
            .filter(|stamped| stamped.at.elapsed() <= self.stale_after)
            .map(|stamped| stamped.snapshot)
    }
}

/// Receives physics datagrams from a helper process and fills a slot
pub struct UdpPhysicsBridge {
    socket: UdpSocket,
    slot: Arc<PhysicsSlot>,
}

impl UdpPhysicsBridge {
    pub async fn bind(addr: &str, slot: Arc<PhysicsSlot>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind physics bridge on {}", addr))?;
        info!("Physics bridge listening on {}", socket.local_addr()?);
        Ok(Self { socket, slot })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = [0u8; 64];
        let mut rejected: u64 = 0;
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, _) = received.context("Physics bridge receive failed")?;
                    match PhysicsSnapshot::from_datagram(&buf[..len]) {
                        Some(snapshot) => self.slot.store(snapshot),
                        None => {
                            rejected += 1;
                            if rejected.is_power_of_two() {
                                warn!("Physics bridge rejected {} malformed datagrams", rejected);
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Physics bridge stopping");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_decoding() {
        let snapshot = PhysicsSnapshot {
            throttle: 0.75,
            brake: 0.0,
            steering: -0.2,
            rpm: 6500.0,
        };
        assert_eq!(
            PhysicsSnapshot::from_datagram(&snapshot.to_datagram()),
            Some(snapshot)
        );
        assert_eq!(PhysicsSnapshot::from_datagram(&[0u8; 12]), None);

        let mut nan = snapshot.to_datagram();
        nan[..4].copy_from_slice(&f32::NAN.to_le_bytes());
        assert_eq!(PhysicsSnapshot::from_datagram(&nan), None);
    }

    #[test]
    fn test_slot_freshness() {
        let slot = PhysicsSlot::new(Duration::from_millis(0));
        assert_eq!(slot.latest(), None);

        let fresh = PhysicsSlot::default();
        fresh.store(PhysicsSnapshot {
            throttle: 1.0,
            ..Default::default()
        });
        assert_eq!(fresh.latest().map(|s| s.throttle), Some(1.0));
    }

    #[tokio::test]
    async fn test_bridge_fills_slot() {
        let slot = Arc::new(PhysicsSlot::default());
        let bridge = UdpPhysicsBridge::bind("127.0.0.1:0", slot.clone())
            .await
            .unwrap();
        let addr = bridge.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(bridge.run(shutdown_rx));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let snapshot = PhysicsSnapshot {
            throttle: 0.5,
            brake: 0.1,
            steering: 0.0,
            rpm: 4000.0,
        };
        for _ in 0..50 {
            sender.send_to(&snapshot.to_datagram(), addr).await.unwrap();
            if slot.latest().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(slot.latest(), Some(snapshot));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
