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

// Broker trait and message types

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;

pub type Headers = BTreeMap<String, String>;

/// Topic creation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: u32,
    pub retention: Duration,
}

/// A message handed to the broker by a producer
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Partition key (the session id)
    pub key: String,
    pub headers: Headers,
    pub payload: Bytes,
    pub timestamp_ms: i64,
}

/// A message delivered to a subscriber
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub headers: Headers,
    pub payload: Bytes,
    pub timestamp_ms: i64,
}

impl ReceivedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Offset to commit for a partition: the next offset the group should read
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitPosition {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// Where a group without committed offsets starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    #[default]
    Earliest,
    Latest,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("topic '{0}' already exists")]
    TopicAlreadyExists(String),
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),
    #[error("invalid topic pattern {0}")]
    InvalidPattern(String),
    #[error("subscription closed")]
    Closed,
    #[error("broker error: {0}")]
    Backend(String),
}

impl BrokerError {
    /// Transient failures are retried with the batch requeued; everything
    /// else is escalated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Unreachable(_) | BrokerError::Timeout(_))
    }
}

/// Partitioned message broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create a topic. Returns `TopicAlreadyExists` when it is already there.
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), BrokerError>;

    /// Append a batch to a topic. Messages with the same key keep their order.
    async fn send(&self, topic: &str, messages: &[OutboundMessage]) -> Result<(), BrokerError>;

    /// Join `group` and subscribe to every topic matching the `*` glob
    /// `pattern`, including topics created after the call.
    async fn subscribe(
        &self,
        pattern: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    fn broker_type(&self) -> &str;
}

/// A group member's view of its subscribed partitions
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Fetch up to `max` messages, waiting at most `timeout` for the first.
    /// Messages of one partition are returned in offset order.
    async fn poll(&self, max: usize, timeout: Duration) -> Result<Vec<ReceivedMessage>, BrokerError>;

    async fn commit(&self, positions: &[CommitPosition]) -> Result<(), BrokerError>;

    /// Liveness signal so long batches do not trigger a rebalance
    async fn heartbeat(&self) -> Result<(), BrokerError>;
}
