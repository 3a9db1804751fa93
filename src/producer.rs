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

// Transport producer
//
// `publish` encodes a frame and appends it to the batch buffer; a single
// flush task moves batches to the broker when the buffer fills up or the
// flush interval elapses. Failed batches go back to the front of the
// buffer and are retried under the shared retry policy.

use crate::broker::{
    Broker, BrokerError, Headers, OutboundMessage, TopicProvisioner, HEADER_ENCODING,
    HEADER_REPLAY, HEADER_SESSION_ID, HEADER_SOURCE, HEADER_USER_ID,
};
use crate::buffer::{BatchBuffer, BufferError, BufferStats};
use crate::client::LapSink;
use crate::config::ProducerSettings;
use crate::frame::{encode_frame, CodecError, Encoding, Frame};
use crate::protocol::SessionSource;
use crate::retry::{Backoff, FlushOutcome, RetryDecision, RetryPolicy};
use crate::session::SessionCloser;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("producer for session '{0}' is closed")]
    Closed(String),
    #[error("producer failed: {0}")]
    Fatal(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Delivery status, observable through `TelemetryProducer::status`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ProducerStatus {
    Active,
    /// Broker failing; the buffered data is retried after `retry_in_ms`
    Backoff { attempt: u32, retry_in_ms: u64 },
    Fatal { reason: String },
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProducerStats {
    pub published: u64,
    pub delivered: u64,
    pub failed_flushes: u64,
    pub buffer: BufferStats,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed_flushes: AtomicU64,
}

/// Publishes one session's frames to its user's topic
pub struct TelemetryProducer {
    user_id: String,
    session_id: String,
    topic: String,
    source: SessionSource,
    encoding: Encoding,
    buffer: Arc<BatchBuffer>,
    counters: Arc<Counters>,
    flush_notify: Arc<Notify>,
    status_tx: Arc<watch::Sender<ProducerStatus>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryProducer {
    /// Provision the user's topic and start the flush task
    pub async fn start(
        broker: Arc<dyn Broker>,
        provisioner: &TopicProvisioner,
        user_id: &str,
        session_id: &str,
        source: SessionSource,
        settings: &ProducerSettings,
    ) -> Result<Arc<Self>, ProducerError> {
        let topic = provisioner.ensure_user_topic(user_id).await?;

        let buffer = Arc::new(BatchBuffer::new(
            format!("{}/{}", topic, session_id),
            settings.batch_size,
            settings.max_buffered_messages,
        ));
        let counters = Arc::new(Counters::default());
        let flush_notify = Arc::new(Notify::new());
        let (status_tx, _) = watch::channel(ProducerStatus::Active);
        let status_tx = Arc::new(status_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = FlushWorker {
            broker,
            topic: topic.clone(),
            buffer: buffer.clone(),
            counters: counters.clone(),
            status_tx: status_tx.clone(),
            policy: RetryPolicy::new(Backoff::from_millis(
                settings.retry_base_ms,
                settings.retry_max_ms,
            )),
        };
        let task = tokio::spawn(worker.run(
            settings.flush_interval(),
            flush_notify.clone(),
            shutdown_rx,
        ));

        info!(
            "Producer started for session '{}' on topic '{}'",
            session_id, topic
        );

        Ok(Arc::new(Self {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            topic,
            source,
            encoding: settings.encoding,
            buffer,
            counters,
            flush_notify,
            status_tx,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Encode and buffer a frame. Never waits on the network.
    pub async fn publish(&self, frame: &Frame) -> Result<(), ProducerError> {
        self.enqueue(frame, false).await
    }

    async fn enqueue(&self, frame: &Frame, replay: bool) -> Result<(), ProducerError> {
        match &*self.status_tx.borrow() {
            ProducerStatus::Closed => return Err(ProducerError::Closed(self.session_id.clone())),
            ProducerStatus::Fatal { reason } => return Err(ProducerError::Fatal(reason.clone())),
            _ => {}
        }

        let payload = encode_frame(frame, self.encoding)?;
        let mut headers = self.headers();
        if replay {
            headers.insert(HEADER_REPLAY.to_string(), "1".to_string());
        }
        let message = OutboundMessage {
            key: self.session_id.clone(),
            headers,
            payload: Bytes::from(payload),
            timestamp_ms: frame.timestamp,
        };

        let buffered = match self.buffer.push(message).await {
            Ok(buffered) => buffered,
            Err(e) => {
                error!("Producer for session '{}' overflowed: {}", self.session_id, e);
                self.status_tx.send_replace(ProducerStatus::Fatal {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        if buffered >= self.buffer.batch_size() {
            self.flush_notify.notify_one();
        }
        Ok(())
    }

    fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(HEADER_SESSION_ID.to_string(), self.session_id.clone());
        headers.insert(HEADER_USER_ID.to_string(), self.user_id.clone());
        headers.insert(HEADER_ENCODING.to_string(), self.encoding.as_str().to_string());
        headers.insert(
            HEADER_SOURCE.to_string(),
            match self.source {
                SessionSource::Live => "live",
                SessionSource::Demo => "demo",
            }
            .to_string(),
        );
        headers
    }

    pub fn status(&self) -> ProducerStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ProducerStatus> {
        self.status_tx.subscribe()
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed_flushes: self.counters.failed_flushes.load(Ordering::Relaxed),
            buffer: self.buffer.stats(),
        }
    }

    /// Stop the flush task after one last flush attempt
    pub async fn close(&self) {
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        let Some(task) = task else {
            return;
        };

        let _ = self.shutdown_tx.send(true);
        if let Err(e) = task.await {
            warn!("Flush task for session '{}' ended abnormally: {}", self.session_id, e);
        }

        let left = self.buffer.len();
        if left > 0 {
            warn!(
                "Producer for session '{}' closed with {} undelivered messages",
                self.session_id, left
            );
        }
        if !matches!(self.status(), ProducerStatus::Fatal { .. }) {
            self.status_tx.send_replace(ProducerStatus::Closed);
        }
        info!("Producer for session '{}' closed", self.session_id);
    }
}

#[async_trait]
impl SessionCloser for TelemetryProducer {
    async fn close_session(&self, session_id: &str) {
        if session_id == self.session_id {
            self.close().await;
        }
    }
}

/// Laps saved by a viewer go through the normal publish path, marked as
/// replay so the live relay does not stream them a second time.
#[async_trait]
impl LapSink for TelemetryProducer {
    async fn save_lap(&self, session_id: &str, frames: Vec<Frame>) -> anyhow::Result<()> {
        if session_id != self.session_id {
            anyhow::bail!(
                "producer for session '{}' cannot save laps of '{}'",
                self.session_id,
                session_id
            );
        }
        for frame in &frames {
            self.enqueue(frame, true).await?;
        }
        self.flush_notify.notify_one();
        Ok(())
    }
}

struct FlushWorker {
    broker: Arc<dyn Broker>,
    topic: String,
    buffer: Arc<BatchBuffer>,
    counters: Arc<Counters>,
    status_tx: Arc<watch::Sender<ProducerStatus>>,
    policy: RetryPolicy,
}

impl FlushWorker {
    async fn run(
        mut self,
        interval: Duration,
        notify: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = notify.notified() => {}
                _ = shutdown.changed() => break,
            }

            if !self.policy.ready(Instant::now()) {
                continue;
            }
            if !self.flush().await {
                return;
            }
        }

        // Final attempt on close; a failing broker is not retried any more
        if !self.buffer.is_empty() {
            debug!("Final flush of '{}'", self.topic);
            self.flush().await;
        }
    }

    /// Drain the buffer batch by batch. Returns `false` on a fatal failure.
    async fn flush(&mut self) -> bool {
        loop {
            let batch = self.buffer.take_batch().await;
            if batch.is_empty() {
                return true;
            }

            let result = self.broker.send(&self.topic, &batch).await;
            let outcome = FlushOutcome::from_broker(&result);
            match self.policy.record(&outcome) {
                RetryDecision::Continue => {
                    self.counters
                        .delivered
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    self.status_tx.send_if_modified(|status| {
                        if matches!(status, ProducerStatus::Backoff { .. }) {
                            info!("Broker reachable again for '{}'", self.topic);
                            *status = ProducerStatus::Active;
                            true
                        } else {
                            false
                        }
                    });
                }
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        "Flush of {} messages to '{}' failed, retrying in {:?}: {:?}",
                        batch.len(),
                        self.topic,
                        delay,
                        outcome
                    );
                    self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                    self.buffer.requeue_front(batch).await;
                    let backoff = ProducerStatus::Backoff {
                        attempt: self.policy.attempts(),
                        retry_in_ms: delay.as_millis() as u64,
                    };
                    // An overflow reported by publish stays visible
                    self.status_tx.send_if_modified(|status| {
                        if matches!(status, ProducerStatus::Fatal { .. }) {
                            false
                        } else {
                            *status = backoff;
                            true
                        }
                    });
                    return true;
                }
                RetryDecision::Escalate(reason) => {
                    error!("Flush to '{}' failed fatally: {}", self.topic, reason);
                    self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                    self.buffer.requeue_front(batch).await;
                    self.status_tx
                        .send_replace(ProducerStatus::Fatal { reason });
                    return false;
                }
            }
        }
    }
}
