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

// Frame sources
//
// Normalizes the live simulator feed or the demo generator into canonical
// frames and forwards them into a producer.

pub mod broadcast;
pub mod demo;
pub mod live;
pub mod physics;

pub use demo::DemoGenerator;
pub use live::LiveCollector;
pub use physics::{NoPhysics, PhysicsFeed, PhysicsSlot, UdpPhysicsBridge};

use crate::config::SourceConfig;
use crate::frame::Frame;
use crate::producer::{ProducerError, TelemetryProducer};
use crate::protocol::SessionSource;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const SOURCE_CHANNEL_CAPACITY: usize = 1024;

/// Something that emits frames until it runs dry or is shut down
#[async_trait]
pub trait FrameSource: Send {
    fn kind(&self) -> SessionSource;

    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<Frame>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}

/// Build the configured source. A live source with `physics_bind` set also
/// starts the physics bridge.
pub async fn source_from_config(
    config: &SourceConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<Box<dyn FrameSource>> {
    match config.mode.as_str() {
        "demo" => Ok(Box::new(DemoGenerator::new(
            &config.demo,
            chrono::Utc::now().timestamp_millis(),
        ))),
        "live" => {
            let physics: Arc<dyn PhysicsFeed> = match &config.live.physics_bind {
                Some(addr) => {
                    let slot = Arc::new(PhysicsSlot::default());
                    let bridge = UdpPhysicsBridge::bind(addr, slot.clone()).await?;
                    tokio::spawn(async move {
                        if let Err(e) = bridge.run(shutdown).await {
                            warn!("Physics bridge stopped: {:#}", e);
                        }
                    });
                    slot
                }
                None => Arc::new(NoPhysics),
            };
            Ok(Box::new(LiveCollector::new(config.live.clone(), physics)))
        }
        other => bail!("Unknown source mode '{}'", other),
    }
}

/// Publish every frame the source emits. Returns the number published.
///
/// A closed producer ends the run quietly; buffer overflow or any other
/// fatal producer condition is returned as an error.
pub async fn run_collector(
    source: Box<dyn FrameSource>,
    producer: Arc<TelemetryProducer>,
    shutdown: watch::Receiver<bool>,
) -> Result<u64> {
    let (tx, mut rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
    let kind = source.kind();
    let task = tokio::spawn(source.run(tx, shutdown));

    let mut published: u64 = 0;
    let mut failure = None;
    while let Some(frame) = rx.recv().await {
        match producer.publish(&frame).await {
            Ok(()) => published += 1,
            Err(ProducerError::Closed(_)) => break,
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    drop(rx);

    let source_result = task.await.context("Frame source task panicked")?;
    if let Some(e) = failure {
        return Err(e).context("Producer rejected frame");
    }
    source_result?;

    info!(
        "{:?} source for session '{}' finished, {} frames published",
        kind,
        producer.session_id(),
        published
    );
    Ok(published)
}
