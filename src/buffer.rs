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

use crate::broker::OutboundMessage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer '{label}' exceeded {limit} messages")]
    Overflow { label: String, limit: usize },
}

/// Counters exposed for status reporting
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct BufferStats {
    pub buffered: usize,
    pub total_pushed: u64,
    pub total_requeued: u64,
}

/// Ordered batch buffer shared by `publish` and the flush task
///
/// Both sides only touch the queue under its lock, and a failed batch is
/// put back at the front so ordering survives retries. Flush timing is
/// owned by the producer's flush task.
pub struct BatchBuffer {
    label: String,
    queue: Mutex<VecDeque<OutboundMessage>>,
    batch_size: usize,

    // Hard bound while the broker is failing
    max_buffered: usize,

    len: AtomicUsize,
    total_pushed: AtomicU64,
    total_requeued: AtomicU64,
}

impl BatchBuffer {
    pub fn new(label: impl Into<String>, batch_size: usize, max_buffered: usize) -> Self {
        Self {
            label: label.into(),
            queue: Mutex::new(VecDeque::new()),
            batch_size: batch_size.max(1),
            max_buffered,
            len: AtomicUsize::new(0),
            total_pushed: AtomicU64::new(0),
            total_requeued: AtomicU64::new(0),
        }
    }

    /// Append a message. Returns the new buffered count, or an overflow
    /// error once the hard bound is reached.
    pub async fn push(&self, message: OutboundMessage) -> Result<usize, BufferError> {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.max_buffered {
            warn!(
                "Buffer '{}' is full ({} messages), refusing new data",
                self.label,
                queue.len()
            );
            return Err(BufferError::Overflow {
                label: self.label.clone(),
                limit: self.max_buffered,
            });
        }

        queue.push_back(message);
        self.len.store(queue.len(), Ordering::Relaxed);
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        Ok(queue.len())
    }

    /// Remove up to one batch from the front
    pub async fn take_batch(&self) -> Vec<OutboundMessage> {
        let mut queue = self.queue.lock().await;
        let count = queue.len().min(self.batch_size);
        let batch: Vec<OutboundMessage> = queue.drain(..count).collect();
        self.len.store(queue.len(), Ordering::Relaxed);
        batch
    }

    /// Put a batch that failed to flush back at the front, keeping its order
    pub async fn requeue_front(&self, batch: Vec<OutboundMessage>) {
        if batch.is_empty() {
            return;
        }
        let mut queue = self.queue.lock().await;
        let count = batch.len();
        for message in batch.into_iter().rev() {
            queue.push_front(message);
        }

        self.len.store(queue.len(), Ordering::Relaxed);
        self.total_requeued.fetch_add(count as u64, Ordering::Relaxed);
        debug!("Requeued {} messages at the front of '{}'", count, self.label);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            buffered: self.len(),
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_requeued: self.total_requeued.load(Ordering::Relaxed),
        }
    }
}
