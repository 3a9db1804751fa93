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

// Viewer-side lap assembly, independent of the transport

use crate::boundary::{Boundary, LapBoundaryDetector, LapTimeResetDetector};
use crate::frame::Frame;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Connection state exposed to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Paused,
    Reconnecting,
    /// Another viewer holds this session's lock
    AlreadyOpen,
    /// Explicitly ended; terminal
    Ended,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::AlreadyOpen | ConnectionState::Ended)
    }
}

/// What the render side sees: the lap being driven right now
#[derive(Debug, Clone, PartialEq)]
pub struct LapView {
    pub lap: u32,
    pub frames: Arc<Vec<Frame>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEffect {
    Render(LapView),
    SaveLap {
        session_id: String,
        lap: u32,
        frames: Vec<Frame>,
    },
}

/// Lap buffer, reset detection, render throttle and save guard for one
/// session. Pure: time comes in as an argument.
pub struct ViewerCore {
    session_id: String,
    detector: LapTimeResetDetector,
    buffer: Vec<Frame>,
    lap: u32,
    paused: bool,
    save_in_flight: bool,
    render_interval: Duration,
    last_render: Option<Instant>,
    dropped_saves: u32,
    // Frames of the current lap were lost upstream
    gap: bool,
}

impl ViewerCore {
    pub fn new(session_id: impl Into<String>, reset_threshold_ms: i64, render_max_hz: u32) -> Self {
        Self {
            session_id: session_id.into(),
            detector: LapTimeResetDetector::new(reset_threshold_ms),
            buffer: Vec::new(),
            lap: 0,
            paused: false,
            save_in_flight: false,
            render_interval: Duration::from_secs(1) / render_max_hz.max(1),
            last_render: None,
            dropped_saves: 0,
            gap: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn save_in_flight(&self) -> bool {
        self.save_in_flight
    }

    /// Laps that could not be saved because a save was still running
    pub fn dropped_saves(&self) -> u32 {
        self.dropped_saves
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The relay skipped frames of the lap in progress; that lap is not saved
    pub fn mark_gap(&mut self) {
        self.gap = true;
    }

    /// Clear the in-flight mark once a save finished, successfully or not
    pub fn save_finished(&mut self) {
        self.save_in_flight = false;
    }

    fn view(&mut self, now: Instant) -> ViewerEffect {
        self.last_render = Some(now);
        ViewerEffect::Render(LapView {
            lap: self.lap,
            frames: Arc::new(self.buffer.clone()),
        })
    }

    fn take_lap(&mut self) -> Option<ViewerEffect> {
        if self.buffer.is_empty() {
            return None;
        }
        let frames = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.gap) {
            warn!(
                "Lap {} of session '{}' not saved: frames missing",
                self.lap, self.session_id
            );
            return None;
        }
        if self.save_in_flight {
            self.dropped_saves += 1;
            warn!(
                "Lap {} of session '{}' not saved: previous save still running",
                self.lap, self.session_id
            );
            return None;
        }
        self.save_in_flight = true;
        Some(ViewerEffect::SaveLap {
            session_id: self.session_id.clone(),
            lap: self.lap,
            frames,
        })
    }

    pub fn on_frame(&mut self, frame: Frame, now: Instant) -> Vec<ViewerEffect> {
        if self.paused {
            return Vec::new();
        }

        let mut effects = Vec::new();
        match self.detector.observe(&frame) {
            Boundary::FirstFrame => {
                self.lap = 1;
                self.buffer.push(frame);
                effects.push(self.view(now));
            }
            Boundary::NewLap { .. } => {
                debug!("New lap detected in session '{}'", self.session_id);
                effects.extend(self.take_lap());
                self.lap += 1;
                self.buffer.push(frame);
                // First frame of a lap is never throttled
                effects.push(self.view(now));
            }
            Boundary::SameLap | Boundary::Stale => {
                self.buffer.push(frame);
                let due = self
                    .last_render
                    .map_or(true, |last| now.duration_since(last) >= self.render_interval);
                if due {
                    effects.push(self.view(now));
                }
            }
        }
        effects
    }

    /// Hand over the in-progress lap on session end
    pub fn finish(&mut self) -> Option<ViewerEffect> {
        self.take_lap()
    }
}
