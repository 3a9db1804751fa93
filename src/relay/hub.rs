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

// Per-user fan-out of live frames to attached viewers

use crate::frame::Frame;
use crate::protocol::DemoComplete;
use crate::session::SessionCloser;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

/// Event delivered to every viewer of one user
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Telemetry { session_id: String, frame: Frame },
    DemoComplete(DemoComplete),
    SessionClosed { session_id: String },
}

impl HubEvent {
    pub fn session_id(&self) -> &str {
        match self {
            HubEvent::Telemetry { session_id, .. } => session_id,
            HubEvent::DemoComplete(done) => &done.session_id,
            HubEvent::SessionClosed { session_id } => session_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HubStats {
    pub users: usize,
    pub viewers: usize,
    pub frames_relayed: u64,
    pub frames_dropped: u64,
}

const DEFAULT_CLOSED_TTL: Duration = Duration::from_secs(3600);

/// The relay's only state: which viewers are attached to which user.
///
/// Each user has one bounded broadcast channel; a viewer is a receiver on it
/// and filters events by its own session id. Senders are created on first
/// attach and removed once the last viewer leaves. A viewer that falls more
/// than `capacity` events behind is closed by its socket task.
pub struct RelayHub {
    channels: DashMap<String, broadcast::Sender<HubEvent>>,
    // Closed session id -> when it was closed
    closed_sessions: DashMap<String, Instant>,
    closed_ttl: Duration,
    capacity: usize,
    frames_relayed: AtomicU64,
    frames_dropped: AtomicU64,
}

impl RelayHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            closed_sessions: DashMap::new(),
            closed_ttl: DEFAULT_CLOSED_TTL,
            capacity: capacity.max(1),
            frames_relayed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// How long a closed session keeps refusing viewers
    pub fn with_closed_ttl(mut self, ttl: Duration) -> Self {
        self.closed_ttl = ttl;
        self
    }

    /// Attach a viewer to `user_id`'s stream
    pub fn attach(&self, user_id: &str) -> broadcast::Receiver<HubEvent> {
        let receiver = self
            .channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!("Viewer attached to user '{}'", user_id);
        receiver
    }

    /// Drop the user's channel if no viewer is left on it
    pub fn detach(&self, user_id: &str) {
        let removed = self
            .channels
            .remove_if(user_id, |_, sender| sender.receiver_count() == 0);
        if removed.is_some() {
            debug!("Last viewer of user '{}' left", user_id);
        }
    }

    pub fn viewer_count(&self, user_id: &str) -> usize {
        self.channels
            .get(user_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn is_closed(&self, session_id: &str) -> bool {
        let expired = match self.closed_sessions.get(session_id) {
            Some(closed_at) => closed_at.elapsed() >= self.closed_ttl,
            None => return false,
        };
        if expired {
            self.closed_sessions.remove(session_id);
        }
        !expired
    }

    pub fn closed_count(&self) -> usize {
        self.closed_sessions.len()
    }

    /// Fan a frame out to the user's viewers. Returns how many received it.
    pub fn dispatch(&self, user_id: &str, session_id: &str, frame: Frame) -> usize {
        if self.is_closed(session_id) {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        let delivered = self.send(
            user_id,
            HubEvent::Telemetry {
                session_id: session_id.to_string(),
                frame,
            },
        );
        if delivered > 0 {
            self.frames_relayed.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    pub fn demo_complete(&self, user_id: &str, done: DemoComplete) -> usize {
        self.send(user_id, HubEvent::DemoComplete(done))
    }

    fn send(&self, user_id: &str, event: HubEvent) -> usize {
        match self.channels.get(user_id) {
            // No receivers is not an error: nobody is watching
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            users: self.channels.len(),
            viewers: self
                .channels
                .iter()
                .map(|entry| entry.value().receiver_count())
                .sum(),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl SessionCloser for RelayHub {
    /// Stop fan-out for the session and tell its viewers to go away
    async fn close_session(&self, session_id: &str) {
        let ttl = self.closed_ttl;
        self.closed_sessions
            .retain(|_, closed_at| closed_at.elapsed() < ttl);
        self.closed_sessions
            .insert(session_id.to_string(), Instant::now());

        let mut notified = 0;
        for entry in self.channels.iter() {
            notified += entry
                .value()
                .send(HubEvent::SessionClosed {
                    session_id: session_id.to_string(),
                })
                .unwrap_or(0);
        }
        info!(
            "Relay closed session '{}' ({} viewers notified)",
            session_id, notified
        );
    }
}
