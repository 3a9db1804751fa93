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

// In-memory store

use super::backend::TelemetryStore;
use crate::session::{FrameRow, LapRecord, Session};
use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct FrameTable {
    keys: HashSet<String>,
    rows: Vec<FrameRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<String, Session>,
    laps: DashMap<String, BTreeMap<u32, LapRecord>>,
    frames: Mutex<FrameTable>,
    frames_unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn lap_count(&self) -> usize {
        self.laps.iter().map(|laps| laps.len()).sum()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().map(|t| t.rows.len()).unwrap_or(0)
    }

    /// Make frame inserts fail until switched back, as an outage would
    pub fn set_frames_unavailable(&self, unavailable: bool) {
        self.frames_unavailable.store(unavailable, Ordering::Relaxed);
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn create_session_if_absent(&self, session: &Session) -> Result<(Session, bool)> {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(existing) => Ok((existing.get().clone(), false)),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok((session.clone(), true))
            }
        }
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        match self.sessions.get_mut(&session.id) {
            Some(mut stored) => {
                stored.status = session.status;
                stored.started = session.started;
                stored.tags = session.tags.clone();
                Ok(())
            }
            None => bail!("session '{}' not found", session.id),
        }
    }

    async fn create_lap_if_absent(&self, lap: &LapRecord) -> Result<bool> {
        let mut laps = self.laps.entry(lap.session_id.clone()).or_default();
        if laps.contains_key(&lap.lap_number) {
            return Ok(false);
        }
        laps.insert(lap.lap_number, lap.clone());
        Ok(true)
    }

    async fn list_laps(&self, session_id: &str) -> Result<Vec<LapRecord>> {
        Ok(self
            .laps
            .get(session_id)
            .map(|laps| laps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn bulk_insert_frames(&self, rows: &[FrameRow], skip_duplicates: bool) -> Result<usize> {
        if self.frames_unavailable.load(Ordering::Relaxed) {
            bail!("frame table unavailable");
        }
        let mut table = self
            .frames
            .lock()
            .map_err(|_| anyhow::anyhow!("frame table lock poisoned"))?;

        if !skip_duplicates {
            if let Some(row) = rows.iter().find(|r| table.keys.contains(&r.key())) {
                bail!("duplicate frame row '{}'", row.key());
            }
        }

        let mut inserted = 0;
        for row in rows {
            if table.keys.insert(row.key()) {
                table.rows.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn list_frames(&self, session_id: &str) -> Result<Vec<FrameRow>> {
        let table = self
            .frames
            .lock()
            .map_err(|_| anyhow::anyhow!("frame table lock poisoned"))?;
        Ok(table
            .rows
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn backend_type(&self) -> &str {
        "memory"
    }
}
