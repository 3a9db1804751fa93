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

// Configuration types for the telemetry pipeline

use crate::frame::Encoding;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub producer: ProducerSettings,
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker configuration with backend selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Backend type: "memory" or "zenoh"
    #[serde(default = "default_broker_backend")]
    pub backend: String,

    #[serde(default)]
    pub zenoh: ZenohConfig,

    #[serde(default)]
    pub topics: TopicSettings,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: default_broker_backend(),
            zenoh: ZenohConfig::default(),
            topics: TopicSettings::default(),
        }
    }
}

/// Zenoh configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZenohConfig {
    #[serde(default = "default_mode")]
    pub mode: String, // "peer", "client", or "router"

    #[serde(default)]
    pub connect: Option<ConnectConfig>,

    #[serde(default)]
    pub listen: Option<ListenConfig>,

    /// Zenoh keeps no log: frames published while a consumer is down are
    /// lost. Running the roles as separate processes requires opting in.
    #[serde(default)]
    pub allow_split_roles: bool,
}

impl Default for ZenohConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            connect: Some(ConnectConfig {
                endpoints: vec!["tcp/localhost:7447".to_string()],
            }),
            listen: None,
            allow_split_roles: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectConfig {
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopicSettings {
    #[serde(default = "default_topic_prefix")]
    pub prefix: String,

    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Telemetry is a transient log, not an archive
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            prefix: default_topic_prefix(),
            partitions: default_partitions(),
            retention_seconds: default_retention_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerSettings {
    /// Flush when this many messages are buffered
    #[serde(default = "default_producer_batch_size")]
    pub batch_size: usize,

    /// Flush at least this often
    #[serde(default = "default_producer_flush_ms")]
    pub flush_interval_ms: u64,

    /// Hard bound on buffered messages while the broker is failing
    #[serde(default = "default_max_buffered")]
    pub max_buffered_messages: usize,

    #[serde(default)]
    pub encoding: Encoding,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            batch_size: default_producer_batch_size(),
            flush_interval_ms: default_producer_flush_ms(),
            max_buffered_messages: default_max_buffered(),
            encoding: Encoding::default(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl ProducerSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerSettings {
    #[serde(default = "default_consumer_group")]
    pub group_id: String,

    /// Maximum messages fetched per poll
    #[serde(default = "default_poll_batch")]
    pub poll_batch_size: usize,

    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,

    /// Frame rows buffered before a bulk insert
    #[serde(default = "default_frame_batch")]
    pub frame_batch_size: usize,

    #[serde(default = "default_frame_flush_ms")]
    pub frame_flush_interval_ms: u64,

    /// Unflushed frame rows tolerated while the store is failing
    #[serde(default = "default_max_pending_rows")]
    pub max_pending_rows: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group_id: default_consumer_group(),
            poll_batch_size: default_poll_batch(),
            poll_timeout_ms: default_poll_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_ms(),
            frame_batch_size: default_frame_batch(),
            frame_flush_interval_ms: default_frame_flush_ms(),
            max_pending_rows: default_max_pending_rows(),
        }
    }
}

/// Frame source settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// "live" or "demo"
    #[serde(default = "default_source_mode")]
    pub mode: String,

    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Fixed session id; a fresh one is generated when absent
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub live: LiveSourceConfig,

    #[serde(default)]
    pub demo: DemoSourceConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            mode: default_source_mode(),
            user_id: default_user_id(),
            session_id: None,
            live: LiveSourceConfig::default(),
            demo: DemoSourceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiveSourceConfig {
    /// Address of the simulator broadcast endpoint
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: String,

    #[serde(default = "default_local_bind")]
    pub bind_addr: String,

    #[serde(default = "default_display_name")]
    pub display_name: String,

    #[serde(default)]
    pub connection_password: String,

    #[serde(default)]
    pub command_password: String,

    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: i32,

    #[serde(default = "default_registration_retry_ms")]
    pub registration_retry_ms: u64,

    /// UDP address the physics bridge listens on, when enabled
    #[serde(default)]
    pub physics_bind: Option<String>,
}

impl Default for LiveSourceConfig {
    fn default() -> Self {
        Self {
            broadcast_addr: default_broadcast_addr(),
            bind_addr: default_local_bind(),
            display_name: default_display_name(),
            connection_password: String::new(),
            command_password: String::new(),
            update_interval_ms: default_update_interval_ms(),
            registration_retry_ms: default_registration_retry_ms(),
            physics_bind: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DemoSourceConfig {
    #[serde(default = "default_frame_rate")]
    pub frame_rate_hz: u32,

    #[serde(default = "default_demo_laps")]
    pub laps: u32,

    #[serde(default)]
    pub looping: bool,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for DemoSourceConfig {
    fn default() -> Self {
        Self {
            frame_rate_hz: default_frame_rate(),
            laps: default_demo_laps(),
            looping: false,
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelaySettings {
    #[serde(default = "default_relay_bind")]
    pub bind: String,

    #[serde(default = "default_relay_group")]
    pub group_id: String,

    /// Viewers silent for longer than this are dropped
    #[serde(default = "default_liveness_ms")]
    pub liveness_timeout_ms: u64,

    #[serde(default = "default_viewer_capacity")]
    pub viewer_channel_capacity: usize,

    /// How long a closed session keeps refusing viewers
    #[serde(default = "default_closed_ttl_secs")]
    pub closed_session_ttl_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind: default_relay_bind(),
            group_id: default_relay_group(),
            liveness_timeout_ms: default_liveness_ms(),
            viewer_channel_capacity: default_viewer_capacity(),
            closed_session_ttl_secs: default_closed_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientSettings {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    #[serde(default = "default_ping_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    #[serde(default = "default_render_hz")]
    pub render_max_hz: u32,

    #[serde(default = "default_reset_threshold_ms")]
    pub lap_reset_threshold_ms: i64,

    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    #[serde(default = "default_lock_refresh_ms")]
    pub lock_refresh_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            ping_interval_ms: default_ping_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            render_max_hz: default_render_hz(),
            lap_reset_threshold_ms: default_reset_threshold_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_refresh_ms: default_lock_refresh_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String, // "text", "compact"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_broker_backend() -> String { "memory".to_string() }
fn default_mode() -> String { "peer".to_string() }
fn default_topic_prefix() -> String { "telemetry-user-".to_string() }
fn default_partitions() -> u32 { 10 }
fn default_retention_seconds() -> u64 { 3600 }
fn default_producer_batch_size() -> usize { 100 }
fn default_producer_flush_ms() -> u64 { 100 }
fn default_max_buffered() -> usize { 100_000 }
fn default_retry_base_ms() -> u64 { 100 }
fn default_retry_max_ms() -> u64 { 30_000 }
fn default_consumer_group() -> String { "telemetry-persistence".to_string() }
fn default_poll_batch() -> usize { 500 }
fn default_poll_timeout_ms() -> u64 { 500 }
fn default_heartbeat_ms() -> u64 { 3000 }
fn default_frame_batch() -> usize { 1000 }
fn default_frame_flush_ms() -> u64 { 1000 }
fn default_max_pending_rows() -> usize { 50_000 }
fn default_source_mode() -> String { "demo".to_string() }
fn default_user_id() -> String { "local".to_string() }
fn default_broadcast_addr() -> String { "127.0.0.1:9000".to_string() }
fn default_local_bind() -> String { "0.0.0.0:0".to_string() }
fn default_display_name() -> String { "telemetry-pipeline".to_string() }
fn default_update_interval_ms() -> i32 { 100 }
fn default_registration_retry_ms() -> u64 { 5000 }
fn default_frame_rate() -> u32 { 30 }
fn default_demo_laps() -> u32 { 3 }
fn default_seed() -> u64 { 7 }
fn default_relay_bind() -> String { "0.0.0.0:8080".to_string() }
fn default_relay_group() -> String { "telemetry-live-relay".to_string() }
fn default_liveness_ms() -> u64 { 30_000 }
fn default_viewer_capacity() -> usize { 1024 }
fn default_closed_ttl_secs() -> u64 { 3600 }
fn default_relay_url() -> String { "ws://127.0.0.1:8080/ws".to_string() }
fn default_ping_ms() -> u64 { 10_000 }
fn default_reconnect_base_ms() -> u64 { 1000 }
fn default_reconnect_max_ms() -> u64 { 30_000 }
fn default_render_hz() -> u32 { 15 }
fn default_reset_threshold_ms() -> i64 { 1000 }
fn default_lock_ttl_ms() -> u64 { 15_000 }
fn default_lock_refresh_ms() -> u64 { 5000 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
