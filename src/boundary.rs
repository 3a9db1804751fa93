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

// Lap boundary detection
//
// Two detectors with different trust in the input stream:
// - `LapNumberDetector` trusts the collector's lap number (persistence path)
// - `LapTimeResetDetector` only trusts lap time going backwards past a
//   threshold (live viewer path, where lap numbers restart on reconnects
//   and demo loops)

use crate::frame::Frame;

/// Classification of one frame relative to the lap being accumulated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Very first frame: opens the first lap, closes nothing
    FirstFrame,
    SameLap,
    /// The frame opens a new lap; `completed_lap` has just finished.
    /// `skipped` counts lap numbers jumped over (0 for a normal increment).
    NewLap { completed_lap: u32, skipped: u32 },
    /// The frame belongs to a lap that was already closed
    Stale,
}

impl Boundary {
    pub fn is_new_lap(&self) -> bool {
        matches!(self, Boundary::NewLap { .. })
    }
}

pub trait LapBoundaryDetector: Send {
    /// Classify `frame` and advance the detector state
    fn observe(&mut self, frame: &Frame) -> Boundary;

    /// Forget everything, as if no frame had been seen
    fn reset(&mut self);
}

/// Authoritative detector: a lap ends when `lapNumber` increases
#[derive(Debug, Default, Clone)]
pub struct LapNumberDetector {
    last_lap: u32,
}

impl LapNumberDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_lap(&self) -> u32 {
        self.last_lap
    }
}

impl LapBoundaryDetector for LapNumberDetector {
    fn observe(&mut self, frame: &Frame) -> Boundary {
        let lap = frame.lap_number;
        if self.last_lap == 0 {
            self.last_lap = lap;
            return Boundary::FirstFrame;
        }

        if lap > self.last_lap {
            let completed_lap = self.last_lap;
            self.last_lap = lap;
            Boundary::NewLap {
                completed_lap,
                skipped: lap - completed_lap - 1,
            }
        } else if lap == self.last_lap {
            Boundary::SameLap
        } else {
            Boundary::Stale
        }
    }

    fn reset(&mut self) {
        self.last_lap = 0;
    }
}

/// Heuristic detector: a lap ends when `lapTime` drops after having
/// passed `threshold_ms`. Dips near zero are treated as jitter.
#[derive(Debug, Clone)]
pub struct LapTimeResetDetector {
    threshold_ms: i64,
    last_lap_time: Option<i64>,
    laps_completed: u32,
}

impl LapTimeResetDetector {
    pub const DEFAULT_THRESHOLD_MS: i64 = 1000;

    pub fn new(threshold_ms: i64) -> Self {
        Self {
            threshold_ms,
            last_lap_time: None,
            laps_completed: 0,
        }
    }
}

impl Default for LapTimeResetDetector {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD_MS)
    }
}

impl LapBoundaryDetector for LapTimeResetDetector {
    fn observe(&mut self, frame: &Frame) -> Boundary {
        let previous = self.last_lap_time.replace(frame.lap_time);
        match previous {
            None => Boundary::FirstFrame,
            Some(last) if frame.lap_time < last && last > self.threshold_ms => {
                self.laps_completed += 1;
                Boundary::NewLap {
                    completed_lap: self.laps_completed,
                    skipped: 0,
                }
            }
            Some(_) => Boundary::SameLap,
        }
    }

    fn reset(&mut self) {
        self.last_lap_time = None;
        self.laps_completed = 0;
    }
}
