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

// Zenoh transport backend
//
// Topics map to key expressions; message headers travel as a JSON
// attachment. Zenoh has no partition logs, so offsets are synthesized per
// (topic, partition) on the subscriber side and commits are local only.
//
// This backend is not durable. Nothing is retained for a subscriber that is
// not running, and a restarted consumer group starts from live traffic.
// See `BrokerFactory::check_split_roles`.

use super::backend::{
    Broker, BrokerError, CommitPosition, Headers, OutboundMessage, ReceivedMessage, StartPosition,
    Subscription, TopicSpec,
};
use super::partition_for_key;
use crate::config::ZenohConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::Subscriber;
use zenoh::sample::Sample;
use zenoh::Session;

#[derive(Serialize, Deserialize)]
struct Envelope {
    key: String,
    timestamp_ms: i64,
    #[serde(default)]
    partitions: u32,
    headers: Headers,
}

pub struct ZenohBroker {
    session: Session,
    topics: DashMap<String, TopicSpec>,
}

impl ZenohBroker {
    /// Open a Zenoh session from configuration
    pub async fn connect(config: &ZenohConfig) -> Result<Self> {
        let mut zenoh_config = zenoh::Config::default();

        let mode = match config.mode.as_str() {
            "peer" | "client" | "router" => config.mode.as_str(),
            other => {
                warn!("Unknown zenoh mode '{}', falling back to peer", other);
                "peer"
            }
        };
        zenoh_config
            .insert_json5("mode", &format!("\"{}\"", mode))
            .map_err(|e| anyhow!("Invalid zenoh mode: {}", e))?;

        if let Some(connect) = &config.connect {
            zenoh_config
                .insert_json5("connect/endpoints", &serde_json::to_string(&connect.endpoints)?)
                .map_err(|e| anyhow!("Invalid connect endpoints: {}", e))?;
        }

        if let Some(listen) = &config.listen {
            zenoh_config
                .insert_json5("listen/endpoints", &serde_json::to_string(&listen.endpoints)?)
                .map_err(|e| anyhow!("Invalid listen endpoints: {}", e))?;
        }

        let session = zenoh::open(zenoh_config)
            .await
            .map_err(|e| anyhow!("Failed to open Zenoh session: {}", e))?;

        info!("Zenoh session opened in {} mode", mode);

        Ok(Self {
            session,
            topics: DashMap::new(),
        })
    }

    fn partitions_for(&self, topic: &str) -> u32 {
        self.topics.get(topic).map(|t| t.partitions).unwrap_or(1)
    }
}

/// `telemetry-user-*` → `telemetry-user-$*` (intra-chunk wildcard)
pub fn pattern_to_key_expr(pattern: &str) -> String {
    pattern.replace('*', "$*")
}

#[async_trait]
impl Broker for ZenohBroker {
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), BrokerError> {
        // Key expressions need no declaration; the topic is tracked for partitioning
        match self.topics.entry(spec.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BrokerError::TopicAlreadyExists(spec.name.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(
                    "Registered zenoh topic '{}' (retention {:?} is not enforced by zenoh)",
                    spec.name, spec.retention
                );
                slot.insert(spec.clone());
                Ok(())
            }
        }
    }

    async fn send(&self, topic: &str, messages: &[OutboundMessage]) -> Result<(), BrokerError> {
        let partitions = self.partitions_for(topic);
        for message in messages {
            let envelope = Envelope {
                key: message.key.clone(),
                timestamp_ms: message.timestamp_ms,
                partitions,
                headers: message.headers.clone(),
            };
            let attachment = serde_json::to_vec(&envelope)
                .map_err(|e| BrokerError::Backend(e.to_string()))?;

            self.session
                .put(topic.to_string(), message.payload.to_vec())
                .attachment(attachment)
                .await
                .map_err(|e| BrokerError::Unreachable(e.to_string()))?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        group: &str,
        _start: StartPosition,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let key_expr = pattern_to_key_expr(pattern);
        let subscriber = self
            .session
            .declare_subscriber(key_expr.clone())
            .await
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;

        info!("Group '{}' subscribed to zenoh key '{}'", group, key_expr);

        Ok(Box::new(ZenohSubscription {
            subscriber,
            sequences: Mutex::new(HashMap::new()),
        }))
    }

    fn broker_type(&self) -> &str {
        "zenoh"
    }
}

struct ZenohSubscription {
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
    sequences: Mutex<HashMap<(String, u32), u64>>,
}

impl ZenohSubscription {
    fn to_message(&self, sample: Sample) -> Option<ReceivedMessage> {
        let topic = sample.key_expr().as_str().to_string();
        let envelope: Envelope = match sample.attachment() {
            Some(attachment) => match serde_json::from_slice(&attachment.to_bytes()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Dropping sample on '{}' with bad attachment: {}", topic, e);
                    return None;
                }
            },
            None => {
                warn!("Dropping sample on '{}' without headers", topic);
                return None;
            }
        };

        let partition = partition_for_key(&envelope.key, envelope.partitions.max(1));
        let offset = {
            let mut sequences = self.sequences.lock().ok()?;
            let next = sequences.entry((topic.clone(), partition)).or_insert(0);
            let offset = *next;
            *next += 1;
            offset
        };

        Some(ReceivedMessage {
            topic,
            partition,
            offset,
            key: envelope.key,
            headers: envelope.headers,
            payload: Bytes::from(sample.payload().to_bytes().into_owned()),
            timestamp_ms: envelope.timestamp_ms,
        })
    }
}

#[async_trait]
impl Subscription for ZenohSubscription {
    async fn poll(&self, max: usize, timeout: Duration) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let mut out = Vec::new();

        let first = match tokio::time::timeout(timeout, self.subscriber.recv_async()).await {
            Err(_) => return Ok(out),
            Ok(Err(_)) => return Err(BrokerError::Closed),
            Ok(Ok(sample)) => sample,
        };
        out.extend(self.to_message(first));

        // Drain whatever is already queued without waiting
        while out.len() < max {
            match tokio::time::timeout(Duration::ZERO, self.subscriber.recv_async()).await {
                Ok(Ok(sample)) => out.extend(self.to_message(sample)),
                Ok(Err(_)) => return Err(BrokerError::Closed),
                Err(_) => break,
            }
        }
        Ok(out)
    }

    async fn commit(&self, positions: &[CommitPosition]) -> Result<(), BrokerError> {
        debug!("Zenoh subscription commit of {} positions is local", positions.len());
        Ok(())
    }

    // No group membership to keep alive
    async fn heartbeat(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_to_key_expr() {
        assert_eq!(pattern_to_key_expr("telemetry-user-*"), "telemetry-user-$*");
        assert_eq!(pattern_to_key_expr("plain"), "plain");
    }
}
