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

// Vehicle telemetry pipeline
//
// Moves per-tick driving telemetry from a simulator (or a synthetic demo
// generator) through a partitioned broker into durable storage, while
// streaming the same frames live to viewers:
// - Collects frames from the simulator broadcast protocol or a demo generator
// - Publishes them through a batching producer with retry and backoff
// - Segments the stream into laps and persists laps and frames idempotently
// - Relays frames to WebSocket viewers, one live viewer per session

pub mod boundary;
pub mod broker;
pub mod buffer;
pub mod client;
pub mod config;
pub mod consumer;
pub mod frame;
pub mod producer;
pub mod protocol;
pub mod relay;
pub mod retry;
pub mod session;
pub mod source;
pub mod storage;

// Re-export main types
pub use boundary::{Boundary, LapBoundaryDetector, LapNumberDetector, LapTimeResetDetector};
pub use broker::{Broker, BrokerFactory, MemoryBroker, TopicNaming, TopicProvisioner, ZenohBroker};
pub use buffer::BatchBuffer;
pub use client::{ConnectionState, LapSink, LockStore, MemoryLockStore, ViewerClient};
pub use config::{load_config, load_config_with_env, PipelineConfig};
pub use consumer::PersistenceConsumer;
pub use frame::{decode_frame, encode_frame, Encoding, Frame};
pub use producer::{ProducerStatus, TelemetryProducer};
pub use protocol::{RelayMessage, SessionSource, SessionStatus};
pub use relay::{DemoRunner, RelayFeed, RelayHub, RelayState};
pub use retry::{Backoff, FlushOutcome, RetryDecision, RetryPolicy};
pub use session::{LapRecord, Session, SessionManager};
pub use source::{run_collector, source_from_config, DemoGenerator, FrameSource, LiveCollector};
pub use storage::{MemoryStore, TelemetryStore};
