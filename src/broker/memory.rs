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

// In-process partitioned broker
//
// Each topic is a set of append-only partition logs with time-based
// retention. Consumer groups keep committed offsets; a subscription reads
// from its in-memory position and only moves the group forward on commit,
// so an uncommitted batch is redelivered to the next member of the group.

use super::backend::{
    Broker, BrokerError, CommitPosition, OutboundMessage, ReceivedMessage, StartPosition,
    Subscription, TopicSpec,
};
use super::{glob_to_regex, partition_for_key};
use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info};

struct StoredRecord {
    offset: u64,
    appended_at: Instant,
    message: OutboundMessage,
}

#[derive(Default)]
struct PartitionLog {
    next_offset: u64,
    records: VecDeque<StoredRecord>,
}

impl PartitionLog {
    fn append(&mut self, message: OutboundMessage, retention: Duration) {
        let now = Instant::now();
        while let Some(front) = self.records.front() {
            if now.duration_since(front.appended_at) > retention {
                self.records.pop_front();
            } else {
                break;
            }
        }
        self.records.push_back(StoredRecord {
            offset: self.next_offset,
            appended_at: now,
            message,
        });
        self.next_offset += 1;
    }

    fn read(&self, topic: &str, partition: u32, from: u64, max: usize) -> Vec<ReceivedMessage> {
        self.records
            .iter()
            .skip_while(|r| r.offset < from)
            .take(max)
            .map(|r| ReceivedMessage {
                topic: topic.to_string(),
                partition,
                offset: r.offset,
                key: r.message.key.clone(),
                headers: r.message.headers.clone(),
                payload: r.message.payload.clone(),
                timestamp_ms: r.message.timestamp_ms,
            })
            .collect()
    }
}

struct TopicLog {
    spec: TopicSpec,
    partitions: Vec<Mutex<PartitionLog>>,
}

struct Inner {
    topics: DashMap<String, Arc<TopicLog>>,
    // (group, topic, partition) -> next offset to read
    committed: DashMap<(String, String, u32), u64>,
    heartbeats: DashMap<String, Instant>,
    notify: Notify,
    failing_sends: AtomicU32,
}

/// Partitioned broker living in the current process
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: DashMap::new(),
                committed: DashMap::new(),
                heartbeats: DashMap::new(),
                notify: Notify::new(),
                failing_sends: AtomicU32::new(0),
            }),
        }
    }

    /// Make the next `count` sends fail as if the broker were unreachable
    pub fn fail_next_sends(&self, count: u32) {
        self.inner.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.inner.topics.iter().map(|t| t.key().clone()).collect()
    }

    pub fn topic_spec(&self, topic: &str) -> Option<TopicSpec> {
        self.inner.topics.get(topic).map(|t| t.spec.clone())
    }

    /// Number of retained records in a topic, across partitions
    pub fn record_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|t| {
                t.partitions
                    .iter()
                    .map(|p| p.lock().map(|log| log.records.len()).unwrap_or(0))
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.inner
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|o| *o)
    }

    pub fn last_heartbeat(&self, group: &str) -> Option<Instant> {
        self.inner.heartbeats.get(group).map(|t| *t)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), BrokerError> {
        if spec.partitions == 0 {
            return Err(BrokerError::Backend(format!(
                "topic '{}' needs at least one partition",
                spec.name
            )));
        }

        match self.inner.topics.entry(spec.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BrokerError::TopicAlreadyExists(spec.name.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let partitions = (0..spec.partitions)
                    .map(|_| Mutex::new(PartitionLog::default()))
                    .collect();
                slot.insert(Arc::new(TopicLog {
                    spec: spec.clone(),
                    partitions,
                }));
                info!(
                    "Created topic '{}' ({} partitions, retention {:?})",
                    spec.name, spec.partitions, spec.retention
                );
                Ok(())
            }
        }
    }

    async fn send(&self, topic: &str, messages: &[OutboundMessage]) -> Result<(), BrokerError> {
        let should_fail = self
            .inner
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BrokerError::Unreachable(
                "simulated broker outage".to_string(),
            ));
        }

        let log = self
            .inner
            .topics
            .get(topic)
            .map(|t| t.clone())
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;

        for message in messages {
            let partition = partition_for_key(&message.key, log.spec.partitions) as usize;
            let mut part = log.partitions[partition]
                .lock()
                .map_err(|_| BrokerError::Backend("partition lock poisoned".to_string()))?;
            part.append(message.clone(), log.spec.retention);
        }

        debug!("Appended {} messages to '{}'", messages.len(), topic);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let regex = glob_to_regex(pattern)?;
        info!("Group '{}' subscribed to '{}'", group, pattern);
        Ok(Box::new(MemorySubscription {
            inner: self.inner.clone(),
            pattern: regex,
            group: group.to_string(),
            start,
            created_at: Instant::now(),
            positions: Mutex::new(HashMap::new()),
        }))
    }

    fn broker_type(&self) -> &str {
        "memory"
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    pattern: Regex,
    group: String,
    start: StartPosition,
    created_at: Instant,
    positions: Mutex<HashMap<(String, u32), u64>>,
}

impl MemorySubscription {
    fn initial_position(&self, topic: &str, partition: u32, log: &PartitionLog, appended_after_join: bool) -> u64 {
        if let Some(committed) = self
            .inner
            .committed
            .get(&(self.group.clone(), topic.to_string(), partition))
        {
            return *committed;
        }
        match self.start {
            StartPosition::Earliest => 0,
            // Topics that appear after we joined are read from their start
            StartPosition::Latest if appended_after_join => 0,
            StartPosition::Latest => log.next_offset,
        }
    }

    fn collect(&self, max: usize) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let mut positions = self
            .positions
            .lock()
            .map_err(|_| BrokerError::Backend("subscription lock poisoned".to_string()))?;
        let mut out = Vec::new();

        let mut topics: Vec<Arc<TopicLog>> = self
            .inner
            .topics
            .iter()
            .filter(|t| self.pattern.is_match(t.key()))
            .map(|t| t.value().clone())
            .collect();
        topics.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));

        for topic in topics {
            for (index, partition) in topic.partitions.iter().enumerate() {
                if out.len() >= max {
                    return Ok(out);
                }
                let index = index as u32;
                let log = partition
                    .lock()
                    .map_err(|_| BrokerError::Backend("partition lock poisoned".to_string()))?;
                let key = (topic.spec.name.clone(), index);
                let from = match positions.get(&key) {
                    Some(pos) => *pos,
                    None => {
                        let fresh = log
                            .records
                            .front()
                            .map(|r| r.appended_at >= self.created_at)
                            .unwrap_or(true);
                        let pos = self.initial_position(&topic.spec.name, index, &log, fresh);
                        positions.insert(key.clone(), pos);
                        pos
                    }
                };
                let batch = log.read(&topic.spec.name, index, from, max - out.len());
                if let Some(last) = batch.last() {
                    positions.insert(key, last.offset + 1);
                }
                out.extend(batch);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn poll(&self, max: usize, timeout: Duration) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.notify.notified();
            let batch = self.collect(max)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&self, positions: &[CommitPosition]) -> Result<(), BrokerError> {
        for pos in positions {
            let key = (self.group.clone(), pos.topic.clone(), pos.partition);
            let mut entry = self.inner.committed.entry(key).or_insert(0);
            if pos.offset > *entry {
                *entry = pos.offset;
            }
        }
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), BrokerError> {
        self.inner
            .heartbeats
            .insert(self.group.clone(), Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn spec(name: &str) -> TopicSpec {
        TopicSpec {
            name: name.to_string(),
            partitions: 4,
            retention: Duration::from_secs(3600),
        }
    }

    fn message(key: &str, n: u8) -> OutboundMessage {
        OutboundMessage {
            key: key.to_string(),
            headers: Default::default(),
            payload: Bytes::from(vec![n]),
            timestamp_ms: n as i64,
        }
    }

    #[tokio::test]
    async fn test_create_topic_twice() {
        let broker = MemoryBroker::new();
        broker.create_topic(&spec("t")).await.unwrap();
        let err = broker.create_topic(&spec("t")).await.unwrap_err();
        assert!(matches!(err, BrokerError::TopicAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_send_to_unknown_topic() {
        let broker = MemoryBroker::new();
        let err = broker.send("missing", &[message("k", 1)]).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownTopic(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_uncommitted_batch_is_redelivered() {
        let broker = MemoryBroker::new();
        broker.create_topic(&spec("telemetry-user-1")).await.unwrap();
        let batch: Vec<_> = (0..5).map(|n| message("s1", n)).collect();
        broker.send("telemetry-user-1", &batch).await.unwrap();

        let sub = broker
            .subscribe("telemetry-user-*", "g", StartPosition::Earliest)
            .await
            .unwrap();
        let first = sub.poll(100, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 5);
        drop(sub);

        // Nothing committed, a new member starts over
        let sub = broker
            .subscribe("telemetry-user-*", "g", StartPosition::Earliest)
            .await
            .unwrap();
        let again = sub.poll(100, Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.len(), 5);

        let last = again.last().unwrap();
        sub.commit(&[CommitPosition {
            topic: last.topic.clone(),
            partition: last.partition,
            offset: last.offset + 1,
        }])
        .await
        .unwrap();
        drop(sub);

        let sub = broker
            .subscribe("telemetry-user-*", "g", StartPosition::Earliest)
            .await
            .unwrap();
        assert!(sub.poll(100, Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pattern_picks_up_new_topics() {
        let broker = MemoryBroker::new();
        let sub = broker
            .subscribe("telemetry-user-*", "g", StartPosition::Latest)
            .await
            .unwrap();
        assert!(sub.poll(10, Duration::from_millis(5)).await.unwrap().is_empty());

        broker.create_topic(&spec("telemetry-user-new")).await.unwrap();
        broker
            .send("telemetry-user-new", &[message("s", 7)])
            .await
            .unwrap();
        let got = sub.poll(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].topic, "telemetry-user-new");
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let broker = MemoryBroker::new();
        broker.create_topic(&spec("t")).await.unwrap();
        broker.fail_next_sends(1);
        let err = broker.send("t", &[message("k", 1)]).await.unwrap_err();
        assert!(err.is_retryable());
        broker.send("t", &[message("k", 1)]).await.unwrap();
        assert_eq!(broker.record_count("t"), 1);
    }
}
