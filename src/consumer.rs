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

// Persistence consumer
//
// Reads every user topic, keeps one tracker per session (lap detection and
// the in-progress lap's frames), writes completed laps as they close and
// frame rows in bulk. Offsets are committed only once the frame rows they
// produced are stored.

use crate::boundary::{Boundary, LapBoundaryDetector, LapNumberDetector};
use crate::broker::{
    Broker, CommitPosition, ReceivedMessage, StartPosition, Subscription, TopicNaming,
    HEADER_ENCODING, HEADER_SESSION_ID, HEADER_SOURCE,
};
use crate::config::ConsumerSettings;
use crate::frame::{decode_frame, Encoding, Frame};
use crate::protocol::{SessionSource, SessionStatus};
use crate::session::{FrameRow, LapRecord, NewLap, Session, SessionCloser};
use crate::storage::TelemetryStore;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

// How long a tracker trusts its cached session status
const STATUS_REFRESH: Duration = Duration::from_secs(5);

/// Snapshot of consumer counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsumerStats {
    pub messages: u64,
    pub frames_persisted: u64,
    pub laps_created: u64,
    pub duplicate_laps: u64,
    pub decode_errors: u64,
    pub handling_errors: u64,
    pub stale_frames: u64,
    pub duplicate_frames: u64,
    pub lap_gaps: u64,
    pub skipped_closed: u64,
    pub commits: u64,
}

#[derive(Default)]
struct Counters {
    messages: AtomicU64,
    frames_persisted: AtomicU64,
    laps_created: AtomicU64,
    duplicate_laps: AtomicU64,
    decode_errors: AtomicU64,
    handling_errors: AtomicU64,
    stale_frames: AtomicU64,
    duplicate_frames: AtomicU64,
    lap_gaps: AtomicU64,
    skipped_closed: AtomicU64,
    commits: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Per-session state: created on first frame, dropped on close
struct SessionTracker {
    session_id: String,
    status: SessionStatus,
    status_checked: Instant,
    detector: LapNumberDetector,
    lap_number: u32,
    lap_frames: Vec<Frame>,
    // Completed laps whose write failed, retried before the next one
    unsaved_laps: Vec<NewLap>,
}

impl SessionTracker {
    fn new(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.status,
            status_checked: Instant::now(),
            detector: LapNumberDetector::new(),
            lap_number: 0,
            lap_frames: Vec::new(),
            unsaved_laps: Vec::new(),
        }
    }

    /// Close the lap being accumulated, if it has frames
    fn close_current_lap(&mut self) -> Option<NewLap> {
        let frames = std::mem::take(&mut self.lap_frames);
        NewLap::from_frames(&self.session_id, self.lap_number, frames)
    }
}

struct FrameBatch {
    rows: Vec<FrameRow>,
    last_flush: Instant,
}

/// Offsets handled but not yet committed, per (topic, partition)
pub type PendingCommits = BTreeMap<(String, u32), u64>;

pub struct PersistenceConsumer {
    broker: Arc<dyn Broker>,
    store: Arc<dyn TelemetryStore>,
    naming: TopicNaming,
    settings: ConsumerSettings,
    sessions: DashMap<String, Arc<Mutex<SessionTracker>>>,
    // Next offset to handle per (topic, partition); guards against redelivery
    handled: DashMap<(String, u32), u64>,
    frames: Mutex<FrameBatch>,
    counters: Counters,
}

impl PersistenceConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn TelemetryStore>,
        naming: TopicNaming,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            broker,
            store,
            naming,
            settings,
            sessions: DashMap::new(),
            handled: DashMap::new(),
            frames: Mutex::new(FrameBatch {
                rows: Vec::new(),
                last_flush: Instant::now(),
            }),
            counters: Counters::default(),
        }
    }

    /// Subscribe to every user topic and consume until `shutdown` flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let subscription = self
            .broker
            .subscribe(
                &self.naming.pattern(),
                &self.settings.group_id,
                StartPosition::Earliest,
            )
            .await
            .context("Failed to subscribe to user topics")?;

        info!(
            "Persistence consumer '{}' reading '{}'",
            self.settings.group_id,
            self.naming.pattern()
        );

        let mut pending = PendingCommits::new();
        let poll_timeout = Duration::from_millis(self.settings.poll_timeout_ms);
        let mut last_heartbeat = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let messages = tokio::select! {
                polled = subscription.poll(self.settings.poll_batch_size, poll_timeout) => polled,
                _ = shutdown.changed() => break,
            };

            match messages {
                Ok(messages) if !messages.is_empty() => {
                    let handled = self.handle_with_heartbeats(&*subscription, messages).await;
                    merge_commits(&mut pending, handled);
                    last_heartbeat = Instant::now();
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Poll failed: {}", e);
                    tokio::time::sleep(poll_timeout).await;
                }
            }

            if self.frames_due().await {
                self.flush_and_commit(&*subscription, &mut pending).await?;
            }

            if last_heartbeat.elapsed() >= Duration::from_millis(self.settings.heartbeat_interval_ms)
            {
                if let Err(e) = subscription.heartbeat().await {
                    warn!("Heartbeat failed: {}", e);
                }
                last_heartbeat = Instant::now();
            }
        }

        self.flush_and_commit(&*subscription, &mut pending).await?;
        info!("Persistence consumer stopped");
        Ok(())
    }

    async fn handle_with_heartbeats(
        &self,
        subscription: &dyn Subscription,
        messages: Vec<ReceivedMessage>,
    ) -> PendingCommits {
        let handling = self.handle_messages(messages);
        tokio::pin!(handling);

        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.settings.heartbeat_interval_ms));
        ticker.tick().await;

        loop {
            tokio::select! {
                handled = &mut handling => return handled,
                _ = ticker.tick() => {
                    if let Err(e) = subscription.heartbeat().await {
                        warn!("Heartbeat during batch failed: {}", e);
                    }
                }
            }
        }
    }

    async fn frames_due(&self) -> bool {
        let batch = self.frames.lock().await;
        batch.rows.len() >= self.settings.frame_batch_size
            || (!batch.rows.is_empty()
                && batch.last_flush.elapsed()
                    >= Duration::from_millis(self.settings.frame_flush_interval_ms))
    }

    /// Flush frame rows, then commit what they cover. Errors once the rows
    /// held back by failing flushes exceed `max_pending_rows`.
    async fn flush_and_commit(
        &self,
        subscription: &dyn Subscription,
        pending: &mut PendingCommits,
    ) -> Result<()> {
        self.retry_unsaved_laps().await;

        if let Err(e) = self.flush_frames().await {
            // Rows stay buffered and offsets uncommitted until a flush succeeds
            let buffered = self.frames.lock().await.rows.len();
            if buffered > self.settings.max_pending_rows {
                bail!(
                    "{} frame rows unflushed (limit {}): {:#}",
                    buffered,
                    self.settings.max_pending_rows,
                    e
                );
            }
            error!("Frame flush failed with {} rows buffered: {:#}", buffered, e);
            return Ok(());
        }
        if pending.is_empty() {
            return Ok(());
        }

        let positions: Vec<CommitPosition> = pending
            .iter()
            .map(|((topic, partition), offset)| CommitPosition {
                topic: topic.clone(),
                partition: *partition,
                offset: *offset,
            })
            .collect();
        match subscription.commit(&positions).await {
            Ok(()) => {
                bump(&self.counters.commits);
                pending.clear();
            }
            Err(e) => warn!("Commit failed, will retry: {}", e),
        }
        Ok(())
    }

    /// Handle a polled batch. Partitions are processed concurrently, each
    /// one strictly in offset order. Returns the next offset per partition.
    pub async fn handle_messages(&self, messages: Vec<ReceivedMessage>) -> PendingCommits {
        let mut groups: HashMap<(String, u32), Vec<ReceivedMessage>> = HashMap::new();
        for message in messages {
            groups
                .entry((message.topic.clone(), message.partition))
                .or_default()
                .push(message);
        }

        let results = join_all(
            groups
                .into_values()
                .map(|group| self.handle_partition(group)),
        )
        .await;

        results.into_iter().flatten().collect()
    }

    async fn handle_partition(
        &self,
        messages: Vec<ReceivedMessage>,
    ) -> Option<((String, u32), u64)> {
        let mut next = None;
        for message in messages {
            let key = (message.topic.clone(), message.partition);
            let already = self.handled.get(&key).map(|o| *o).unwrap_or(0);
            if message.offset < already {
                debug!("Skipping redelivered offset {} of {:?}", message.offset, key);
                continue;
            }

            bump(&self.counters.messages);
            if let Err(e) = self.handle_message(&message).await {
                // Best effort: one bad message never stalls the partition
                bump(&self.counters.handling_errors);
                warn!(
                    "Failed to handle {}[{}]@{}: {:#}",
                    message.topic, message.partition, message.offset, e
                );
            }

            self.handled.insert(key.clone(), message.offset + 1);
            next = Some((key, message.offset + 1));
        }
        next
    }

    async fn handle_message(&self, message: &ReceivedMessage) -> Result<()> {
        let encoding = match message.header(HEADER_ENCODING) {
            Some(value) => match value.parse::<Encoding>() {
                Ok(encoding) => encoding,
                Err(e) => {
                    bump(&self.counters.decode_errors);
                    debug!("Unknown encoding on {}: {}", message.topic, e);
                    return Ok(());
                }
            },
            None => Encoding::Protobuf,
        };

        let frame = match decode_frame(&message.payload, encoding) {
            Ok(frame) => frame,
            Err(e) => {
                bump(&self.counters.decode_errors);
                debug!("Undecodable frame on {}: {}", message.topic, e);
                return Ok(());
            }
        };

        let Some(user_id) = self.naming.user_from_topic(&message.topic) else {
            bump(&self.counters.decode_errors);
            return Ok(());
        };
        let session_id = message
            .header(HEADER_SESSION_ID)
            .filter(|id| !id.is_empty())
            .unwrap_or(message.key.as_str());
        if session_id.is_empty() {
            bump(&self.counters.decode_errors);
            return Ok(());
        }
        let source = match message.header(HEADER_SOURCE) {
            Some("demo") => SessionSource::Demo,
            _ => SessionSource::Live,
        };

        let tracker = self
            .tracker_for(session_id, user_id, source, frame.timestamp)
            .await?;
        let mut tracker = tracker.lock().await;

        if tracker.status_checked.elapsed() >= STATUS_REFRESH {
            if let Some(stored) = self.store.get_session(session_id).await? {
                tracker.status = stored.status;
            }
            tracker.status_checked = Instant::now();
        }
        if tracker.status.is_terminal() {
            bump(&self.counters.skipped_closed);
            return Ok(());
        }

        self.track_frame(&mut tracker, &frame).await;
        drop(tracker);

        self.frames
            .lock()
            .await
            .rows
            .push(FrameRow::new(session_id, frame));
        Ok(())
    }

    /// Lap assembly for one frame
    async fn track_frame(&self, tracker: &mut SessionTracker, frame: &Frame) {
        match tracker.detector.observe(frame) {
            Boundary::FirstFrame => {
                tracker.lap_number = frame.lap_number;
                tracker.lap_frames.push(frame.clone());
            }
            Boundary::SameLap => {
                let duplicate = tracker
                    .lap_frames
                    .last()
                    .map(|last| frame.timestamp <= last.timestamp)
                    .unwrap_or(false);
                if duplicate {
                    bump(&self.counters.duplicate_frames);
                } else {
                    tracker.lap_frames.push(frame.clone());
                }
            }
            Boundary::NewLap {
                completed_lap,
                skipped,
            } => {
                if skipped > 0 {
                    bump(&self.counters.lap_gaps);
                    warn!(
                        "Session '{}' jumped from lap {} to {}; {} lap number(s) missing",
                        tracker.session_id, completed_lap, frame.lap_number, skipped
                    );
                }
                if let Some(lap) = tracker.close_current_lap() {
                    tracker.unsaved_laps.push(lap);
                }
                self.save_laps(tracker).await;

                tracker.lap_number = frame.lap_number;
                tracker.lap_frames.push(frame.clone());
            }
            Boundary::Stale => {
                bump(&self.counters.stale_frames);
                debug!(
                    "Session '{}': frame for closed lap {} (current {})",
                    tracker.session_id, frame.lap_number, tracker.lap_number
                );
            }
        }
    }

    async fn tracker_for(
        &self,
        session_id: &str,
        user_id: &str,
        source: SessionSource,
        start_time: i64,
    ) -> Result<Arc<Mutex<SessionTracker>>> {
        if let Some(tracker) = self.sessions.get(session_id) {
            return Ok(tracker.clone());
        }

        // Existence check and insert happen atomically in the store
        let candidate = Session::new(session_id, user_id, source, start_time);
        let (session, created) = self.store.create_session_if_absent(&candidate).await?;
        if created {
            info!("Session '{}' created for user '{}'", session_id, user_id);
        }

        Ok(self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionTracker::new(&session))))
            .clone())
    }

    /// Write completed laps in order; stop at the first failure
    async fn save_laps(&self, tracker: &mut SessionTracker) {
        while let Some(lap) = tracker.unsaved_laps.first() {
            match self.save_lap(lap).await {
                Ok(()) => {
                    tracker.unsaved_laps.remove(0);
                }
                Err(e) => {
                    bump(&self.counters.handling_errors);
                    warn!(
                        "Lap {} of session '{}' not saved yet: {:#}",
                        lap.lap_number, lap.session_id, e
                    );
                    return;
                }
            }
        }
    }

    async fn save_lap(&self, lap: &NewLap) -> Result<()> {
        let record = LapRecord::from_lap(lap)?;
        if self.store.create_lap_if_absent(&record).await? {
            bump(&self.counters.laps_created);
            info!(
                "Lap {} of session '{}' saved: {} frames, {} ms",
                lap.lap_number,
                lap.session_id,
                lap.frames.len(),
                lap.lap_time
            );
        } else {
            bump(&self.counters.duplicate_laps);
            debug!(
                "Lap {} of session '{}' already stored",
                lap.lap_number, lap.session_id
            );
        }
        Ok(())
    }

    async fn retry_unsaved_laps(&self) {
        let trackers: Vec<Arc<Mutex<SessionTracker>>> =
            self.sessions.iter().map(|t| t.value().clone()).collect();
        for tracker in trackers {
            let mut tracker = tracker.lock().await;
            if !tracker.unsaved_laps.is_empty() {
                self.save_laps(&mut tracker).await;
            }
        }
    }

    /// Bulk insert buffered frame rows, skipping duplicates
    pub async fn flush_frames(&self) -> Result<usize> {
        let mut batch = self.frames.lock().await;
        if batch.rows.is_empty() {
            batch.last_flush = Instant::now();
            return Ok(0);
        }

        let inserted = self.store.bulk_insert_frames(&batch.rows, true).await?;
        debug!(
            "Flushed {} frame rows ({} new)",
            batch.rows.len(),
            inserted
        );
        self.counters
            .frames_persisted
            .fetch_add(inserted as u64, Ordering::Relaxed);
        batch.rows.clear();
        batch.last_flush = Instant::now();
        Ok(inserted)
    }

    /// Persist the in-progress lap of a session and stop tracking it
    pub async fn finalize_session(&self, session_id: &str) -> Result<()> {
        let Some((_, tracker)) = self.sessions.remove(session_id) else {
            return Ok(());
        };
        let mut tracker = tracker.lock().await;
        if let Some(lap) = tracker.close_current_lap() {
            tracker.unsaved_laps.push(lap);
        }
        let laps = std::mem::take(&mut tracker.unsaved_laps);
        for lap in &laps {
            self.save_lap(lap).await?;
        }
        self.flush_frames().await?;
        info!("Session '{}' finalized", session_id);
        Ok(())
    }

    /// Lap number and frame count of a session's in-progress lap
    pub async fn in_progress_lap(&self, session_id: &str) -> Option<(u32, usize)> {
        let tracker = self.sessions.get(session_id)?.clone();
        let tracker = tracker.lock().await;
        Some((tracker.lap_number, tracker.lap_frames.len()))
    }

    pub fn stats(&self) -> ConsumerStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ConsumerStats {
            messages: load(&c.messages),
            frames_persisted: load(&c.frames_persisted),
            laps_created: load(&c.laps_created),
            duplicate_laps: load(&c.duplicate_laps),
            decode_errors: load(&c.decode_errors),
            handling_errors: load(&c.handling_errors),
            stale_frames: load(&c.stale_frames),
            duplicate_frames: load(&c.duplicate_frames),
            lap_gaps: load(&c.lap_gaps),
            skipped_closed: load(&c.skipped_closed),
            commits: load(&c.commits),
        }
    }
}

fn merge_commits(pending: &mut PendingCommits, handled: PendingCommits) {
    for (key, offset) in handled {
        let entry = pending.entry(key).or_insert(offset);
        if offset > *entry {
            *entry = offset;
        }
    }
}

#[async_trait]
impl SessionCloser for PersistenceConsumer {
    async fn close_session(&self, session_id: &str) {
        if let Err(e) = self.finalize_session(session_id).await {
            error!("Failed to finalize session '{}': {:#}", session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, OutboundMessage, HEADER_USER_ID};
    use crate::frame::encode_frame;
    use crate::storage::MemoryStore;
    use bytes::Bytes;

    fn message(offset: u64, session: &str, frame: &Frame) -> ReceivedMessage {
        let mut headers = crate::broker::Headers::new();
        headers.insert(HEADER_SESSION_ID.into(), session.into());
        headers.insert(HEADER_USER_ID.into(), "u1".into());
        headers.insert(HEADER_ENCODING.into(), "protobuf".into());
        ReceivedMessage {
            topic: "telemetry-user-u1".into(),
            partition: 0,
            offset,
            key: session.into(),
            headers,
            payload: Bytes::from(encode_frame(frame, Encoding::Protobuf).unwrap()),
            timestamp_ms: frame.timestamp,
        }
    }

    fn frame(lap_number: u32, lap_time: i64, timestamp: i64) -> Frame {
        Frame {
            timestamp,
            lap_number,
            lap_time,
            ..Default::default()
        }
    }

    fn consumer(store: Arc<MemoryStore>) -> PersistenceConsumer {
        PersistenceConsumer::new(
            Arc::new(MemoryBroker::new()),
            store,
            TopicNaming::default(),
            ConsumerSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_undecodable_message_does_not_block_the_rest() {
        let store = Arc::new(MemoryStore::new());
        let consumer = consumer(store.clone());

        let mut bad = message(0, "s1", &frame(1, 0, 1));
        bad.payload = Bytes::from_static(&[0xff, 0xff, 0xff]);
        let good = message(1, "s1", &frame(1, 100, 2));

        let handled = consumer.handle_messages(vec![bad, good]).await;
        assert_eq!(handled.get(&("telemetry-user-u1".to_string(), 0)), Some(&2));
        assert_eq!(consumer.stats().decode_errors, 1);
        assert_eq!(consumer.flush_frames().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_offsets_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let consumer = consumer(store.clone());
        let batch: Vec<ReceivedMessage> = (0..3)
            .map(|i| message(i, "s1", &frame(1, i as i64 * 100, i as i64)))
            .collect();

        consumer.handle_messages(batch.clone()).await;
        consumer.handle_messages(batch).await;
        assert_eq!(consumer.stats().messages, 3);
        assert_eq!(consumer.in_progress_lap("s1").await, Some((1, 3)));
    }

    #[tokio::test]
    async fn test_finalize_saves_in_progress_lap() {
        let store = Arc::new(MemoryStore::new());
        let consumer = consumer(store.clone());
        let batch: Vec<ReceivedMessage> = (0..4)
            .map(|i| message(i, "s1", &frame(1, i as i64 * 100, i as i64)))
            .collect();
        consumer.handle_messages(batch).await;

        consumer.close_session("s1").await;
        assert_eq!(store.lap_count(), 1);
        assert_eq!(store.frame_count(), 4);
        assert!(consumer.in_progress_lap("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_closed_session_is_not_ingested() {
        let store = Arc::new(MemoryStore::new());
        let mut session = Session::new("s1", "u1", SessionSource::Live, 0);
        session.status = SessionStatus::Archived;
        store.create_session_if_absent(&session).await.unwrap();

        let consumer = consumer(store.clone());
        consumer
            .handle_messages(vec![message(0, "s1", &frame(1, 0, 1))])
            .await;
        assert_eq!(consumer.stats().skipped_closed, 1);
        assert_eq!(consumer.flush_frames().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_commits_after_flush() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        shared
            .create_topic(&crate::broker::TopicSpec {
                name: "telemetry-user-u1".into(),
                partitions: 1,
                retention: Duration::from_secs(60),
            })
            .await
            .unwrap();

        let consumer = Arc::new(PersistenceConsumer::new(
            shared.clone(),
            store.clone(),
            TopicNaming::default(),
            ConsumerSettings {
                poll_timeout_ms: 20,
                frame_flush_interval_ms: 10,
                ..ConsumerSettings::default()
            },
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(shutdown_rx).await })
        };

        let messages: Vec<OutboundMessage> = (0..5)
            .map(|i| {
                let m = message(i, "s1", &frame(1, i as i64 * 100, i as i64));
                OutboundMessage {
                    key: m.key,
                    headers: m.headers,
                    payload: m.payload,
                    timestamp_ms: m.timestamp_ms,
                }
            })
            .collect();
        shared.send("telemetry-user-u1", &messages).await.unwrap();

        for _ in 0..100 {
            if broker.committed_offset("telemetry-persistence", "telemetry-user-u1", 0) == Some(5) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.frame_count(), 5);
        assert_eq!(
            broker.committed_offset("telemetry-persistence", "telemetry-user-u1", 0),
            Some(5)
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_fails_when_unflushed_rows_exceed_limit() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        store.set_frames_unavailable(true);
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        shared
            .create_topic(&crate::broker::TopicSpec {
                name: "telemetry-user-u1".into(),
                partitions: 1,
                retention: Duration::from_secs(60),
            })
            .await
            .unwrap();

        let consumer = PersistenceConsumer::new(
            shared.clone(),
            store.clone(),
            TopicNaming::default(),
            ConsumerSettings {
                poll_timeout_ms: 20,
                frame_batch_size: 2,
                max_pending_rows: 4,
                ..ConsumerSettings::default()
            },
        );

        let messages: Vec<OutboundMessage> = (0..10)
            .map(|i| {
                let m = message(i, "s1", &frame(1, i as i64 * 100, i as i64));
                OutboundMessage {
                    key: m.key,
                    headers: m.headers,
                    payload: m.payload,
                    timestamp_ms: m.timestamp_ms,
                }
            })
            .collect();
        for chunk in messages.chunks(2) {
            shared.send("telemetry-user-u1", chunk).await.unwrap();
        }

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(5), consumer.run(shutdown_rx))
            .await
            .expect("consumer kept polling past the row limit");
        assert!(result.is_err());
        assert_eq!(store.frame_count(), 0);
        assert_eq!(
            broker.committed_offset("telemetry-persistence", "telemetry-user-u1", 0),
            None
        );
    }
}
