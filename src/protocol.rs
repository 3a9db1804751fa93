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

use prost::Message;
use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// Where a session's telemetry comes from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    #[default]
    Live,
    Demo,
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Paused,
    Archived,
    Completed,
}

impl SessionStatus {
    /// Terminal sessions accept no more telemetry and no reconnects.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Archived | SessionStatus::Completed)
    }
}

// Live relay wire protocol.
//
//   0x01 + JSON                  → CONNECTED (relay → viewer)
//   0x02 + RelayTelemetry (pb)   → TELEMETRY (relay → viewer)
//   0x03 + JSON                  → START_DEMO (viewer → relay)
//   0x04 + JSON                  → STOP_DEMO (viewer → relay)
//   0x05 + JSON                  → DEMO_COMPLETE (relay → viewer)
//   0x06 + u64 LE                → PING (either direction)
//   0x07 + u64 LE                → PONG (either direction)

pub const MSG_CONNECTED: u8 = 0x01;
pub const MSG_TELEMETRY: u8 = 0x02;
pub const MSG_START_DEMO: u8 = 0x03;
pub const MSG_STOP_DEMO: u8 = 0x04;
pub const MSG_DEMO_COMPLETE: u8 = 0x05;
pub const MSG_PING: u8 = 0x06;
pub const MSG_PONG: u8 = 0x07;

/// Close reasons sent by the relay
pub const CLOSE_REASON_SESSION_CLOSED: &str = "session closed";
pub const CLOSE_REASON_LIVENESS: &str = "liveness timeout";
pub const CLOSE_REASON_LAGGED: &str = "viewer lagged";

/// Protobuf envelope of a `TELEMETRY` payload
#[derive(Clone, PartialEq, Message)]
pub struct RelayTelemetry {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(message, optional, tag = "2")]
    pub frame: Option<Frame>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedInfo {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub viewer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub laps: Option<u32>,
    #[serde(default)]
    pub looping: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoStop {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoComplete {
    pub session_id: String,
    pub laps: u32,
}

/// A decoded relay socket message
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Connected(ConnectedInfo),
    Telemetry { session_id: String, frame: Frame },
    StartDemo(DemoRequest),
    StopDemo(DemoStop),
    DemoComplete(DemoComplete),
    Ping(u64),
    Pong(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("empty relay message")]
    Empty,
    #[error("unknown relay message tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("telemetry message without frame")]
    MissingFrame,
    #[error("protobuf payload invalid: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("json payload invalid: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayMessage {
    pub fn tag(&self) -> u8 {
        match self {
            RelayMessage::Connected(_) => MSG_CONNECTED,
            RelayMessage::Telemetry { .. } => MSG_TELEMETRY,
            RelayMessage::StartDemo(_) => MSG_START_DEMO,
            RelayMessage::StopDemo(_) => MSG_STOP_DEMO,
            RelayMessage::DemoComplete(_) => MSG_DEMO_COMPLETE,
            RelayMessage::Ping(_) => MSG_PING,
            RelayMessage::Pong(_) => MSG_PONG,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = vec![self.tag()];
        match self {
            RelayMessage::Connected(info) => serde_json::to_writer(&mut buf, info)?,
            RelayMessage::Telemetry { session_id, frame } => {
                let envelope = RelayTelemetry {
                    session_id: session_id.clone(),
                    frame: Some(frame.clone()),
                };
                buf.extend_from_slice(&envelope.encode_to_vec());
            }
            RelayMessage::StartDemo(request) => serde_json::to_writer(&mut buf, request)?,
            RelayMessage::StopDemo(stop) => serde_json::to_writer(&mut buf, stop)?,
            RelayMessage::DemoComplete(done) => serde_json::to_writer(&mut buf, done)?,
            RelayMessage::Ping(nonce) | RelayMessage::Pong(nonce) => {
                buf.extend_from_slice(&nonce.to_le_bytes())
            }
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let (&tag, payload) = data.split_first().ok_or(WireError::Empty)?;
        match tag {
            MSG_CONNECTED => Ok(RelayMessage::Connected(serde_json::from_slice(payload)?)),
            MSG_TELEMETRY => {
                let envelope = RelayTelemetry::decode(payload)?;
                let frame = envelope.frame.ok_or(WireError::MissingFrame)?;
                Ok(RelayMessage::Telemetry {
                    session_id: envelope.session_id,
                    frame,
                })
            }
            MSG_START_DEMO => Ok(RelayMessage::StartDemo(serde_json::from_slice(payload)?)),
            MSG_STOP_DEMO => {
                // An empty payload stops whatever demo the viewer's user is running
                if payload.is_empty() {
                    Ok(RelayMessage::StopDemo(DemoStop { session_id: None }))
                } else {
                    Ok(RelayMessage::StopDemo(serde_json::from_slice(payload)?))
                }
            }
            MSG_DEMO_COMPLETE => Ok(RelayMessage::DemoComplete(serde_json::from_slice(payload)?)),
            MSG_PING => Ok(RelayMessage::Ping(read_nonce(payload))),
            MSG_PONG => Ok(RelayMessage::Pong(read_nonce(payload))),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

fn read_nonce(payload: &[u8]) -> u64 {
    payload
        .get(..8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}
