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

// Session and lap records plus the session lifecycle manager

use crate::frame::Frame;
use crate::protocol::{SessionSource, SessionStatus};
use crate::storage::TelemetryStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

const LAP_ZSTD_LEVEL: i32 = 3;

/// A recording unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub source: SessionSource,
    pub status: SessionStatus,
    /// Telemetry collection explicitly begun
    pub started: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Epoch ms of the first frame, or of creation when made explicitly
    pub start_time: i64,
    pub created_at: i64,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        source: SessionSource,
        start_time: i64,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            source,
            status: SessionStatus::Active,
            started: false,
            tags: Vec::new(),
            start_time,
            created_at: Utc::now().timestamp_millis(),
        }
    }
}

/// A completed lap as stored: metadata plus the serialized frame list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LapRecord {
    pub id: String,
    pub session_id: String,
    pub lap_number: u32,
    /// Lap duration in ms
    pub lap_time: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub frame_count: usize,
    /// zstd-compressed, length-delimited protobuf frames
    #[serde(skip)]
    pub frames: Vec<u8>,
}

impl LapRecord {
    /// Laps are unique per (session, lap number)
    pub fn lap_id(session_id: &str, lap_number: u32) -> String {
        format!("{}:{}", session_id, lap_number)
    }

    pub fn from_lap(lap: &NewLap) -> Result<Self> {
        let mut raw = Vec::new();
        for frame in &lap.frames {
            frame
                .encode_length_delimited(&mut raw)
                .context("Failed to encode lap frame")?;
        }
        let frames = zstd::encode_all(&raw[..], LAP_ZSTD_LEVEL).context("Failed to compress lap")?;

        Ok(Self {
            id: Self::lap_id(&lap.session_id, lap.lap_number),
            session_id: lap.session_id.clone(),
            lap_number: lap.lap_number,
            lap_time: lap.lap_time,
            start_time: lap.start_time,
            end_time: lap.end_time,
            frame_count: lap.frames.len(),
            frames,
        })
    }

    /// Decode the stored frame list
    pub fn decode_frames(&self) -> Result<Vec<Frame>> {
        let raw = zstd::decode_all(&self.frames[..]).context("Failed to decompress lap")?;
        let mut buf = &raw[..];
        let mut frames = Vec::with_capacity(self.frame_count);
        while !buf.is_empty() {
            frames.push(Frame::decode_length_delimited(&mut buf).context("Corrupt lap frame")?);
        }
        Ok(frames)
    }
}

/// A completed lap before serialization
#[derive(Debug, Clone, PartialEq)]
pub struct NewLap {
    pub session_id: String,
    pub lap_number: u32,
    pub lap_time: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub frames: Vec<Frame>,
}

impl NewLap {
    /// Build a lap from its buffered frames. Returns `None` for an empty
    /// buffer: a lap always has at least one frame.
    pub fn from_frames(session_id: &str, lap_number: u32, frames: Vec<Frame>) -> Option<Self> {
        let first = frames.first()?;
        let last = frames.last()?;
        let start_time = first.timestamp;
        let end_time = last.timestamp;
        let lap_time = if last.lap_time > 0 {
            last.lap_time
        } else {
            end_time - start_time
        };

        Some(Self {
            session_id: session_id.to_string(),
            lap_number,
            lap_time,
            start_time,
            end_time,
            frames,
        })
    }
}

/// One frame as a persisted row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRow {
    pub session_id: String,
    pub lap_number: u32,
    pub timestamp: i64,
    pub frame: Frame,
}

impl FrameRow {
    pub fn new(session_id: &str, frame: Frame) -> Self {
        Self {
            session_id: session_id.to_string(),
            lap_number: frame.lap_number,
            timestamp: frame.timestamp,
            frame,
        }
    }

    /// Primary key used to skip duplicates on redelivery
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.session_id, self.lap_number, self.timestamp)
    }
}

/// Notified when a session reaches a terminal status so that per-session
/// work (retry loops, fan-out, lap tracking) can be torn down.
#[async_trait]
pub trait SessionCloser: Send + Sync {
    async fn close_session(&self, session_id: &str);
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("session '{id}' cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Owns session lifecycle transitions against the store
pub struct SessionManager {
    store: Arc<dyn TelemetryStore>,
    closers: RwLock<Vec<Arc<dyn SessionCloser>>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self {
            store,
            closers: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TelemetryStore> {
        &self.store
    }

    pub fn register_closer(&self, closer: Arc<dyn SessionCloser>) {
        if let Ok(mut closers) = self.closers.write() {
            closers.push(closer);
        }
    }

    /// Idempotently create a session. An existing session is returned as is.
    pub async fn create(
        &self,
        session_id: Option<String>,
        user_id: &str,
        source: SessionSource,
        tags: Vec<String>,
    ) -> Result<Session, SessionError> {
        if user_id.is_empty() {
            return Err(SessionError::MissingField("userId"));
        }
        let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut session = Session::new(id, user_id, source, Utc::now().timestamp_millis());
        session.tags = tags;

        let (session, created) = self.store.create_session_if_absent(&session).await?;
        if created {
            info!("Created session '{}' for user '{}'", session.id, session.user_id);
        }
        Ok(session)
    }

    /// Mark collection as begun
    pub async fn start(&self, session_id: &str) -> Result<Session, SessionError> {
        let mut session = self.get(session_id).await?;
        if session.status.is_terminal() {
            return Err(SessionError::InvalidTransition {
                id: session.id,
                from: session.status,
                to: SessionStatus::Active,
            });
        }
        if !session.started {
            session.started = true;
            self.store.update_session(&session).await?;
            info!("Session '{}' started", session_id);
        }
        Ok(session)
    }

    pub async fn pause(&self, session_id: &str) -> Result<Session, SessionError> {
        self.transition(session_id, SessionStatus::Paused).await
    }

    pub async fn resume(&self, session_id: &str) -> Result<Session, SessionError> {
        self.transition(session_id, SessionStatus::Active).await
    }

    pub async fn archive(&self, session_id: &str) -> Result<Session, SessionError> {
        self.transition(session_id, SessionStatus::Archived).await
    }

    pub async fn complete(&self, session_id: &str) -> Result<Session, SessionError> {
        self.transition(session_id, SessionStatus::Completed).await
    }

    pub async fn get(&self, session_id: &str) -> Result<Session, SessionError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    async fn transition(
        &self,
        session_id: &str,
        to: SessionStatus,
    ) -> Result<Session, SessionError> {
        let mut session = self.get(session_id).await?;
        let from = session.status;

        if from == to {
            return Ok(session);
        }
        let allowed = match (from, to) {
            (SessionStatus::Active, SessionStatus::Paused) => true,
            (SessionStatus::Paused, SessionStatus::Active) => true,
            (SessionStatus::Active | SessionStatus::Paused, target) => target.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(SessionError::InvalidTransition {
                id: session.id,
                from,
                to,
            });
        }

        session.status = to;
        self.store.update_session(&session).await?;
        info!("Session '{}': {:?} -> {:?}", session_id, from, to);

        if to.is_terminal() {
            self.notify_closed(session_id).await;
        }
        Ok(session)
    }

    async fn notify_closed(&self, session_id: &str) {
        let closers: Vec<Arc<dyn SessionCloser>> = match self.closers.read() {
            Ok(closers) => closers.clone(),
            Err(_) => {
                warn!("Session closer list poisoned; skipping close hooks");
                return;
            }
        };
        for closer in closers {
            closer.close_session(session_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::Mutex;

    fn frame(timestamp: i64, lap_time: i64) -> Frame {
        Frame {
            timestamp,
            lap_number: 1,
            lap_time,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct RecordingCloser {
        closed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionCloser for RecordingCloser {
        async fn close_session(&self, session_id: &str) {
            self.closed.lock().unwrap().push(session_id.to_string());
        }
    }

    #[test]
    fn test_lap_from_frames() {
        let lap = NewLap::from_frames("s", 1, vec![frame(1000, 0), frame(1900, 900)]).unwrap();
        assert_eq!(lap.start_time, 1000);
        assert_eq!(lap.end_time, 1900);
        assert_eq!(lap.lap_time, 900);

        // Falls back to the timestamp span
        let lap = NewLap::from_frames("s", 1, vec![frame(1000, 0), frame(1500, 0)]).unwrap();
        assert_eq!(lap.lap_time, 500);

        assert!(NewLap::from_frames("s", 1, vec![]).is_none());
    }

    #[test]
    fn test_lap_record_keeps_frames() {
        let frames: Vec<Frame> = (0..40).map(|i| frame(1000 + i * 25, i * 25)).collect();
        let lap = NewLap::from_frames("s", 3, frames.clone()).unwrap();
        let record = LapRecord::from_lap(&lap).unwrap();

        assert_eq!(record.id, "s:3");
        assert_eq!(record.frame_count, 40);
        assert_eq!(record.lap_time, 975);
        assert_eq!(record.decode_frames().unwrap(), frames);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let manager = SessionManager::new(Arc::new(MemoryStore::new()));
        let closer = Arc::new(RecordingCloser::default());
        manager.register_closer(closer.clone());

        let session = manager
            .create(Some("s1".into()), "u1", SessionSource::Live, vec![])
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        assert!(manager.start("s1").await.unwrap().started);
        assert_eq!(manager.pause("s1").await.unwrap().status, SessionStatus::Paused);
        assert_eq!(manager.resume("s1").await.unwrap().status, SessionStatus::Active);
        assert_eq!(manager.pause("s1").await.unwrap().status, SessionStatus::Paused);
        assert_eq!(manager.archive("s1").await.unwrap().status, SessionStatus::Archived);

        assert!(matches!(
            manager.resume("s1").await,
            Err(SessionError::InvalidTransition { .. })
        ));
        assert_eq!(closer.closed.lock().unwrap().as_slice(), ["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let manager = SessionManager::new(Arc::new(MemoryStore::new()));
        let first = manager
            .create(Some("s1".into()), "u1", SessionSource::Demo, vec!["a".into()])
            .await
            .unwrap();
        let second = manager
            .create(Some("s1".into()), "u1", SessionSource::Live, vec![])
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.source, SessionSource::Demo);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let manager = SessionManager::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            manager.pause("missing").await,
            Err(SessionError::NotFound(_))
        ));
    }
}
