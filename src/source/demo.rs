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

// Deterministic synthetic laps.
//
// A point-mass car drives a fixed closed track. A speed controller chases a
// target speed derived from upcoming curvature (with a braking allowance),
// speed is integrated from drive force, brake force, drag and rolling
// resistance, steering follows curvature and gears shift on rpm thresholds
// with hysteresis. Per-lap grip and power factors come from a seeded hash of
// the lap index, so the same seed always yields the same frames.

use super::FrameSource;
use crate::config::{DemoSourceConfig, MAX_FRAME_RATE_HZ};
use crate::frame::Frame;
use crate::protocol::SessionSource;
use anyhow::Result;
use async_trait::async_trait;
use std::f64::consts::PI;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

const TRACK_LENGTH_M: f64 = 3200.0;
const TOP_SPEED_MPS: f64 = 83.0;
const LATERAL_GRIP_MPS2: f64 = 15.5;
const BRAKE_DECEL_MPS2: f64 = 12.0;
const DRIVE_ACCEL_MPS2: f64 = 6.5;
const DRAG_COEFF: f64 = 0.0008;
const ROLLING_MPS2: f64 = 0.15;
const LOOKAHEAD_STEP_M: f64 = 10.0;
const LOOKAHEAD_STEPS: usize = 20;
const STEER_GAIN: f64 = 20.0;
const START_SPEED_MPS: f64 = 40.0;

const GEAR_RATIOS: [f64; 6] = [3.2, 2.3, 1.8, 1.45, 1.2, 1.0];
const FINAL_DRIVE: f64 = 3.6;
const WHEEL_RADIUS_M: f64 = 0.33;
const IDLE_RPM: f64 = 1500.0;
const UPSHIFT_RPM: f64 = 7800.0;
const DOWNSHIFT_RPM: f64 = 4200.0;

/// Corner centred at `at` (lap fraction), fading in and out over `half_len` metres
struct Corner {
    at: f64,
    half_len: f64,
    /// Signed peak curvature in 1/m (positive turns right)
    curvature: f64,
}

const CORNERS: [Corner; 7] = [
    Corner { at: 0.10, half_len: 70.0, curvature: 1.0 / 35.0 },
    Corner { at: 0.22, half_len: 90.0, curvature: -1.0 / 120.0 },
    Corner { at: 0.35, half_len: 50.0, curvature: 1.0 / 25.0 },
    Corner { at: 0.48, half_len: 110.0, curvature: -1.0 / 200.0 },
    Corner { at: 0.62, half_len: 60.0, curvature: -1.0 / 40.0 },
    Corner { at: 0.77, half_len: 80.0, curvature: 1.0 / 70.0 },
    Corner { at: 0.90, half_len: 45.0, curvature: -1.0 / 30.0 },
];

/// Curvature at `distance` metres into the lap
fn curvature(distance: f64) -> f64 {
    let s = distance.rem_euclid(TRACK_LENGTH_M);
    CORNERS
        .iter()
        .map(|corner| {
            let centre = corner.at * TRACK_LENGTH_M;
            let mut d = (s - centre).abs();
            d = d.min(TRACK_LENGTH_M - d);
            if d >= corner.half_len {
                0.0
            } else {
                corner.curvature * 0.5 * (1.0 + (PI * d / corner.half_len).cos())
            }
        })
        .sum()
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Reproducible value in `[0, 1)` for (`seed`, `stream`, `index`)
fn unit(seed: u64, stream: u64, index: u64) -> f64 {
    let bits = splitmix64(seed ^ splitmix64((stream << 32) ^ index));
    (bits >> 11) as f64 / (1u64 << 53) as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LapProfile {
    grip: f64,
    power: f64,
}

impl LapProfile {
    fn for_lap(seed: u64, index: u64) -> Self {
        Self {
            grip: 0.96 + 0.08 * unit(seed, 1, index),
            power: 0.97 + 0.06 * unit(seed, 2, index),
        }
    }

    fn corner_speed(&self, distance: f64) -> f64 {
        let k = curvature(distance).abs();
        if k < 1e-6 {
            TOP_SPEED_MPS
        } else {
            (LATERAL_GRIP_MPS2 * self.grip / k).sqrt().min(TOP_SPEED_MPS)
        }
    }

    /// Fastest speed from which every corner in the lookahead window can
    /// still be made
    fn target_speed(&self, distance: f64) -> f64 {
        (0..=LOOKAHEAD_STEPS)
            .map(|step| {
                let ahead = step as f64 * LOOKAHEAD_STEP_M;
                let v = self.corner_speed(distance + ahead);
                (v * v + 2.0 * BRAKE_DECEL_MPS2 * 0.8 * ahead).sqrt()
            })
            .fold(TOP_SPEED_MPS, f64::min)
    }
}

fn rpm_for(speed: f64, gear: usize) -> f64 {
    let wheel_rps = speed / (2.0 * PI * WHEEL_RADIUS_M);
    (wheel_rps * 60.0 * GEAR_RATIOS[gear - 1] * FINAL_DRIVE).max(IDLE_RPM)
}

pub struct DemoGenerator {
    seed: u64,
    frame_rate_hz: u32,
    laps: u32,
    looping: bool,
    start_ms: i64,

    frame_index: u64,
    laps_completed: u64,
    lap_elapsed: f64,
    distance: f64,
    speed: f64,
    gear: usize,
    profile: LapProfile,
}

impl DemoGenerator {
    pub fn new(config: &DemoSourceConfig, start_ms: i64) -> Self {
        let laps = config.laps.max(1);
        Self {
            seed: config.seed,
            frame_rate_hz: config.frame_rate_hz.clamp(1, MAX_FRAME_RATE_HZ),
            laps,
            looping: config.looping,
            start_ms,
            frame_index: 0,
            laps_completed: 0,
            lap_elapsed: 0.0,
            distance: 0.0,
            speed: START_SPEED_MPS,
            gear: 3,
            profile: LapProfile::for_lap(config.seed, 0),
        }
    }

    pub fn laps_completed(&self) -> u64 {
        self.laps_completed
    }

    fn finished(&self) -> bool {
        !self.looping && self.laps_completed >= self.laps as u64
    }

    fn dt(&self) -> f64 {
        1.0 / self.frame_rate_hz as f64
    }

    /// Wall-clock time between emitted frames
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.dt())
    }

    fn controls(&self) -> (f64, f64) {
        let error = self.profile.target_speed(self.distance) - self.speed;
        let resistance = DRAG_COEFF * self.speed * self.speed + ROLLING_MPS2;
        let hold = (resistance / (DRIVE_ACCEL_MPS2 * self.profile.power)).clamp(0.0, 1.0);
        if error > 0.0 {
            ((error * 0.35).max(hold).min(1.0), 0.0)
        } else if error < -1.0 {
            (0.0, ((-error - 1.0) * 0.25).min(1.0))
        } else {
            (hold, 0.0)
        }
    }

    fn shift(&mut self) {
        let rpm = rpm_for(self.speed, self.gear);
        if rpm > UPSHIFT_RPM && self.gear < GEAR_RATIOS.len() {
            self.gear += 1;
        } else if rpm < DOWNSHIFT_RPM
            && self.gear > 1
            && rpm_for(self.speed, self.gear - 1) < UPSHIFT_RPM
        {
            self.gear -= 1;
        }
    }

    /// Produce the next frame, or `None` once a non-looping lap set is done
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.finished() {
            return None;
        }

        let (throttle, brake) = self.controls();
        let k = curvature(self.distance);
        let frame = Frame {
            timestamp: self.start_ms + (self.frame_index * 1000 / self.frame_rate_hz as u64) as i64,
            speed: (self.speed * 3.6) as f32,
            throttle: throttle as f32,
            brake: brake as f32,
            steering: (k * STEER_GAIN).clamp(-1.0, 1.0) as f32,
            gear: self.gear as i32,
            rpm: rpm_for(self.speed, self.gear) as f32,
            normalized_position: (self.distance / TRACK_LENGTH_M) as f32,
            lap_number: (self.laps_completed + 1) as u32,
            lap_time: (self.lap_elapsed * 1000.0) as i64,
            session_time: Some(self.frame_index as f64 * 1000.0 / self.frame_rate_hz as f64),
            session_type: Some("demo".to_string()),
            track_position: Some(1),
            delta: None,
        }
        .clamp_inputs();

        self.advance(throttle, brake);
        Some(frame)
    }

    fn advance(&mut self, throttle: f64, brake: f64) {
        let dt = self.dt();
        let accel = throttle * DRIVE_ACCEL_MPS2 * self.profile.power
            - brake * BRAKE_DECEL_MPS2
            - DRAG_COEFF * self.speed * self.speed
            - ROLLING_MPS2;
        self.speed = (self.speed + accel * dt).clamp(1.0, TOP_SPEED_MPS);
        self.distance += self.speed * dt;
        self.lap_elapsed += dt;
        self.frame_index += 1;
        self.shift();

        if self.distance >= TRACK_LENGTH_M {
            self.distance -= TRACK_LENGTH_M;
            self.lap_elapsed = self.distance / self.speed;
            self.laps_completed += 1;
            // Looping replays the canned lap set
            let index = self.laps_completed % self.laps as u64;
            self.profile = LapProfile::for_lap(self.seed, index);
            debug!(
                "Demo lap {} done, next profile grip {:.3} power {:.3}",
                self.laps_completed, self.profile.grip, self.profile.power
            );
        }
    }
}

impl Iterator for DemoGenerator {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.next_frame()
    }
}

#[async_trait]
impl FrameSource for DemoGenerator {
    fn kind(&self) -> SessionSource {
        SessionSource::Demo
    }

    /// Emit frames in real time at the configured rate
    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<Frame>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut generator = *self;
        let mut ticker = tokio::time::interval(generator.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(frame) = generator.next_frame() else {
                        info!("Demo finished after {} laps", generator.laps_completed);
                        return Ok(());
                    };
                    if tx.send(frame).await.is_err() {
                        return Ok(());
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Demo stopped after {} laps", generator.laps_completed);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(seed: u64, laps: u32, looping: bool) -> DemoSourceConfig {
        DemoSourceConfig {
            frame_rate_hz: 20,
            laps,
            looping,
            seed,
        }
    }

    fn lap_times(frames: &[Frame]) -> BTreeMap<u32, i64> {
        let mut laps = BTreeMap::new();
        for frame in frames {
            laps.insert(frame.lap_number, frame.lap_time);
        }
        laps
    }

    #[test]
    fn test_frame_rate_is_clamped() {
        let mut fast = config(1, 1, false);
        fast.frame_rate_hz = 2_000_000;
        let generator = DemoGenerator::new(&fast, 0);
        assert_eq!(generator.tick_interval(), Duration::from_millis(1));

        fast.frame_rate_hz = 0;
        let generator = DemoGenerator::new(&fast, 0);
        assert_eq!(generator.tick_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_same_seed_same_frames() {
        let a: Vec<Frame> = DemoGenerator::new(&config(11, 2, false), 0).collect();
        let b: Vec<Frame> = DemoGenerator::new(&config(11, 2, false), 0).collect();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn test_finite_lap_set() {
        let frames: Vec<Frame> = DemoGenerator::new(&config(3, 3, false), 1_000).collect();
        let laps = lap_times(&frames);
        assert_eq!(laps.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(frames[0].timestamp, 1_000);
        assert_eq!(frames[0].lap_time, 0);
        // Plausible lap length for a 3.2 km track
        for lap_time in laps.values() {
            assert!(*lap_time > 40_000 && *lap_time < 150_000, "{}", lap_time);
        }
    }

    #[test]
    fn test_lap_timing_varies() {
        let frames: Vec<Frame> = DemoGenerator::new(&config(5, 3, false), 0).collect();
        let laps = lap_times(&frames);
        let times: Vec<i64> = laps.values().copied().collect();
        assert!(times.windows(2).any(|w| w[0] != w[1]));

        let other: Vec<Frame> = DemoGenerator::new(&config(6, 3, false), 0).collect();
        assert_ne!(lap_times(&other), laps);
    }

    #[test]
    fn test_controls_are_consistent() {
        let frames: Vec<Frame> = DemoGenerator::new(&config(9, 1, false), 0).collect();
        let mut gears = std::collections::BTreeSet::new();
        for frame in &frames {
            assert!(!(frame.throttle > 0.0 && frame.brake > 0.0));
            assert!((1..=6).contains(&frame.gear));
            assert!(frame.speed > 0.0);
            assert!((-1.0..=1.0).contains(&frame.steering));
            gears.insert(frame.gear);
        }
        assert!(gears.len() >= 3);
        assert!(frames.iter().any(|f| f.brake > 0.5));
        assert!(frames.iter().any(|f| f.throttle == 1.0));
    }

    #[test]
    fn test_timestamps_and_lap_times_are_monotonic_within_a_lap() {
        let frames: Vec<Frame> = DemoGenerator::new(&config(2, 2, false), 0).collect();
        for pair in frames.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
            if pair[1].lap_number == pair[0].lap_number {
                assert!(pair[1].lap_time >= pair[0].lap_time);
            } else {
                assert_eq!(pair[1].lap_number, pair[0].lap_number + 1);
                assert!(pair[1].lap_time < 1000);
            }
        }
    }

    #[test]
    fn test_looping_keeps_counting_laps() {
        let mut generator = DemoGenerator::new(&config(4, 1, true), 0);
        let frames: Vec<Frame> = generator.by_ref().take(20 * 60 * 4).collect();
        assert_eq!(frames.len(), 20 * 60 * 4);
        assert!(generator.laps_completed() >= 1);
        assert!(frames.last().unwrap().lap_number >= 2);
    }

    #[tokio::test]
    async fn test_paced_run_stops_on_shutdown() {
        let generator = Box::new(DemoGenerator::new(&config(1, 1, true), 0));
        let (tx, mut rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(generator.run(tx, shutdown_rx));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.lap_number, 1);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
