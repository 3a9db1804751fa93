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

// Canonical telemetry frame and its wire encodings.
//
// A [`Frame`] is both a prost message (the steady-state binary encoding used on
// broker topics and the relay socket) and a serde type (the JSON fallback and
// the row format used by the filesystem store).

use prost::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One telemetry sample.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Epoch milliseconds
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    /// km/h
    #[prost(float, tag = "2")]
    pub speed: f32,
    #[prost(float, tag = "3")]
    pub throttle: f32,
    #[prost(float, tag = "4")]
    pub brake: f32,
    #[prost(float, tag = "5")]
    pub steering: f32,
    #[prost(int32, tag = "6")]
    pub gear: i32,
    #[prost(float, tag = "7")]
    pub rpm: f32,
    /// Fraction of lap distance, 0..=1
    #[prost(float, tag = "8")]
    pub normalized_position: f32,
    #[prost(uint32, tag = "9")]
    pub lap_number: u32,
    /// Milliseconds elapsed in the current lap
    #[prost(int64, tag = "10")]
    pub lap_time: i64,
    #[prost(double, optional, tag = "11")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_time: Option<f64>,
    #[prost(string, optional, tag = "12")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<String>,
    #[prost(uint32, optional, tag = "13")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_position: Option<u32>,
    #[prost(int64, optional, tag = "14")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
}

impl Frame {
    /// Clamp the bounded inputs into their documented ranges.
    pub fn clamp_inputs(mut self) -> Self {
        self.throttle = self.throttle.clamp(0.0, 1.0);
        self.brake = self.brake.clamp(0.0, 1.0);
        self.steering = self.steering.clamp(-1.0, 1.0);
        self.normalized_position = self.normalized_position.clamp(0.0, 1.0);
        self.lap_number = self.lap_number.max(1);
        self
    }
}

/// Payload encoding declared in the `encoding` message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Protobuf,
    Json,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Protobuf => "protobuf",
            Encoding::Json => "json",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "protobuf" | "proto" => Ok(Encoding::Protobuf),
            "json" => Ok(Encoding::Json),
            other => Err(CodecError::UnknownEncoding(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown encoding '{0}'")]
    UnknownEncoding(String),
    #[error("protobuf decode failed: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("json codec failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode_frame(frame: &Frame, encoding: Encoding) -> Result<Vec<u8>, CodecError> {
    match encoding {
        Encoding::Protobuf => Ok(frame.encode_to_vec()),
        Encoding::Json => Ok(serde_json::to_vec(frame)?),
    }
}

pub fn decode_frame(payload: &[u8], encoding: Encoding) -> Result<Frame, CodecError> {
    match encoding {
        Encoding::Protobuf => Ok(Frame::decode(payload)?),
        Encoding::Json => Ok(serde_json::from_slice(payload)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame {
            timestamp: 1_700_000_000_000,
            speed: 212.5,
            throttle: 0.8,
            brake: 0.0,
            steering: -0.1,
            gear: 5,
            rpm: 7200.0,
            normalized_position: 0.42,
            lap_number: 3,
            lap_time: 41_250,
            session_time: Some(1_200_000.0),
            session_type: Some("race".to_string()),
            track_position: None,
            delta: Some(-120),
        }
    }

    #[test]
    fn test_json_uses_camel_case() {
        let json = String::from_utf8(encode_frame(&sample(), Encoding::Json).unwrap()).unwrap();
        assert!(json.contains("\"normalizedPosition\""));
        assert!(json.contains("\"lapNumber\":3"));
        assert!(!json.contains("trackPosition"));
    }

    #[test]
    fn test_protobuf_is_smaller_than_json() {
        let frame = sample();
        let proto = encode_frame(&frame, Encoding::Protobuf).unwrap();
        let json = encode_frame(&frame, Encoding::Json).unwrap();
        assert!(proto.len() < json.len());
        assert_eq!(decode_frame(&proto, Encoding::Protobuf).unwrap(), frame);
    }

    #[test]
    fn test_encoding_parse() {
        assert_eq!("PROTOBUF".parse::<Encoding>().unwrap(), Encoding::Protobuf);
        assert_eq!("json".parse::<Encoding>().unwrap(), Encoding::Json);
        assert!("avro".parse::<Encoding>().is_err());
    }

    #[test]
    fn test_clamp_inputs() {
        let mut frame = sample();
        frame.throttle = 1.4;
        frame.steering = -3.0;
        frame.lap_number = 0;
        let frame = frame.clamp_inputs();
        assert_eq!(frame.throttle, 1.0);
        assert_eq!(frame.steering, -1.0);
        assert_eq!(frame.lap_number, 1);
    }
}
