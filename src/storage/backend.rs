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

// Storage trait for sessions, laps and frame rows

use crate::session::{FrameRow, LapRecord, Session};
use anyhow::Result;
use async_trait::async_trait;

/// Persistence surface used by the consumer and the session manager
///
/// Every write is idempotent so that at-least-once delivery never produces
/// duplicate sessions, laps or frame rows.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Initialize the backend (create bucket/directories if needed)
    async fn initialize(&self) -> Result<()>;

    /// Insert the session unless one with the same id exists.
    ///
    /// Returns the stored session and whether this call created it.
    /// Concurrent calls for the same id create exactly one record.
    async fn create_session_if_absent(&self, session: &Session) -> Result<(Session, bool)>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Overwrite the mutable fields (status, started, tags)
    async fn update_session(&self, session: &Session) -> Result<()>;

    /// Insert a lap unless `(session_id, lap_number)` is already stored.
    /// Returns `true` when the lap was inserted.
    async fn create_lap_if_absent(&self, lap: &LapRecord) -> Result<bool>;

    /// Laps of a session ordered by lap number, blobs included
    async fn list_laps(&self, session_id: &str) -> Result<Vec<LapRecord>>;

    /// Insert frame rows. With `skip_duplicates`, rows whose key is already
    /// stored are skipped instead of failing. Returns the number inserted.
    async fn bulk_insert_frames(&self, rows: &[FrameRow], skip_duplicates: bool) -> Result<usize>;

    /// Frame rows of a session in insertion order
    async fn list_frames(&self, session_id: &str) -> Result<Vec<FrameRow>>;

    /// Health check
    async fn health_check(&self) -> Result<bool>;

    /// Get backend type identifier
    fn backend_type(&self) -> &str;
}
