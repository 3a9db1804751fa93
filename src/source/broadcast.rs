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

// Simulator broadcast protocol.
//
// Every packet is `u16 LE length | u8 type | body`, where the length covers
// the type byte and the body. Strings are `u16 LE length | UTF-8`.
//
// Outbound (pipeline → simulator):
//   1 REGISTER    version u8, display name, password, interval i32, command password
//   9 UNREGISTER  connection id i32
//
// Inbound (simulator → pipeline):
//   1 REGISTRATION_RESULT      connection id i32, success u8, read-only u8, error
//   2 REALTIME_UPDATE          event u16, session u16, type u8, phase u8,
//                              session time f32, session end f32, focused i32
//   3 REALTIME_ENTITY_UPDATE   entity u16, gear i8, position 3×f32, velocity 3×f32,
//                              current lap u16, delta i32, best/last/current i32,
//                              lap count u16, track position u16, spline f32

use bytes::{Buf, BufMut, BytesMut};

pub const PROTOCOL_VERSION: u8 = 4;

pub const MSG_REGISTER: u8 = 1;
pub const MSG_UNREGISTER: u8 = 9;

pub const MSG_REGISTRATION_RESULT: u8 = 1;
pub const MSG_REALTIME_UPDATE: u8 = 2;
pub const MSG_REALTIME_ENTITY_UPDATE: u8 = 3;

/// m/s to km/h
const MPS_TO_KMH: f32 = 3.6;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProtocolError {
    #[error("packet truncated: needed {needed} bytes, {available} left")]
    Truncated { needed: usize, available: usize },
    #[error("declared length {declared} does not match {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("string is not UTF-8")]
    InvalidString,
    #[error("string of {0} bytes does not fit a u16 length")]
    StringTooLong(usize),
    #[error("packet of {0} bytes does not fit a u16 length")]
    PacketTooLong(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundPacket {
    Register {
        display_name: String,
        connection_password: String,
        update_interval_ms: i32,
        command_password: String,
    },
    Unregister {
        connection_id: i32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationResult {
    pub connection_id: i32,
    pub success: bool,
    pub read_only: bool,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RealtimeUpdate {
    pub event_index: u16,
    pub session_index: u16,
    pub session_type: u8,
    pub phase: u8,
    /// Milliseconds
    pub session_time: f32,
    pub session_end_time: f32,
    pub focused_entity_index: i32,
}

impl RealtimeUpdate {
    pub fn session_type_name(&self) -> &'static str {
        session_type_name(self.session_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityUpdate {
    pub entity_index: u16,
    pub gear: i8,
    pub position: [f32; 3],
    /// m/s
    pub velocity: [f32; 3],
    pub current_lap: u16,
    pub delta_ms: i32,
    pub best_lap_ms: i32,
    pub last_lap_ms: i32,
    pub current_lap_ms: i32,
    pub lap_count: u16,
    pub track_position: u16,
    pub spline_position: f32,
}

impl EntityUpdate {
    /// Speed in km/h derived from the velocity vector
    pub fn speed_kmh(&self) -> f32 {
        let [x, y, z] = self.velocity;
        (x * x + y * y + z * z).sqrt() * MPS_TO_KMH
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundPacket {
    RegistrationResult(RegistrationResult),
    RealtimeUpdate(RealtimeUpdate),
    EntityUpdate(EntityUpdate),
}

pub fn session_type_name(session_type: u8) -> &'static str {
    match session_type {
        0 => "practice",
        4 => "qualifying",
        9 => "superpole",
        10 => "race",
        11 => "hotlap",
        12 => "hotstint",
        13 => "hotlap_superpole",
        14 => "replay",
        _ => "unknown",
    }
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::StringTooLong(value.len()))?;
    buf.put_u16_le(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn ensure(buf: &impl Buf, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn get_string(buf: &mut impl Buf) -> Result<String, ProtocolError> {
    ensure(&*buf, 2)?;
    let len = buf.get_u16_le() as usize;
    ensure(&*buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString)
}

fn get_vec3(buf: &mut impl Buf) -> [f32; 3] {
    [buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le()]
}

/// Prepend the length prefix to a type byte + body
fn frame_packet(body: BytesMut) -> Result<Vec<u8>, ProtocolError> {
    let len = u16::try_from(body.len()).map_err(|_| ProtocolError::PacketTooLong(body.len()))?;
    let mut packet = BytesMut::with_capacity(body.len() + 2);
    packet.put_u16_le(len);
    packet.extend_from_slice(&body);
    Ok(packet.to_vec())
}

impl OutboundPacket {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut body = BytesMut::with_capacity(64);
        match self {
            OutboundPacket::Register {
                display_name,
                connection_password,
                update_interval_ms,
                command_password,
            } => {
                body.put_u8(MSG_REGISTER);
                body.put_u8(PROTOCOL_VERSION);
                put_string(&mut body, display_name)?;
                put_string(&mut body, connection_password)?;
                body.put_i32_le(*update_interval_ms);
                put_string(&mut body, command_password)?;
            }
            OutboundPacket::Unregister { connection_id } => {
                body.put_u8(MSG_UNREGISTER);
                body.put_i32_le(*connection_id);
            }
        }
        frame_packet(body)
    }
}

impl InboundPacket {
    /// Decode one inbound packet. Unknown message types yield `Ok(None)`.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let mut buf = data;
        ensure(&buf, 3)?;
        let declared = buf.get_u16_le() as usize;
        if declared != buf.remaining() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: buf.remaining(),
            });
        }

        let packet = match buf.get_u8() {
            MSG_REGISTRATION_RESULT => {
                ensure(&buf, 6)?;
                let connection_id = buf.get_i32_le();
                let success = buf.get_u8() != 0;
                let read_only = buf.get_u8() != 0;
                let error = get_string(&mut buf)?;
                InboundPacket::RegistrationResult(RegistrationResult {
                    connection_id,
                    success,
                    read_only,
                    error,
                })
            }
            MSG_REALTIME_UPDATE => {
                ensure(&buf, 18)?;
                InboundPacket::RealtimeUpdate(RealtimeUpdate {
                    event_index: buf.get_u16_le(),
                    session_index: buf.get_u16_le(),
                    session_type: buf.get_u8(),
                    phase: buf.get_u8(),
                    session_time: buf.get_f32_le(),
                    session_end_time: buf.get_f32_le(),
                    focused_entity_index: buf.get_i32_le(),
                })
            }
            MSG_REALTIME_ENTITY_UPDATE => {
                ensure(&buf, 53)?;
                InboundPacket::EntityUpdate(EntityUpdate {
                    entity_index: buf.get_u16_le(),
                    gear: buf.get_i8(),
                    position: get_vec3(&mut buf),
                    velocity: get_vec3(&mut buf),
                    current_lap: buf.get_u16_le(),
                    delta_ms: buf.get_i32_le(),
                    best_lap_ms: buf.get_i32_le(),
                    last_lap_ms: buf.get_i32_le(),
                    current_lap_ms: buf.get_i32_le(),
                    lap_count: buf.get_u16_le(),
                    track_position: buf.get_u16_le(),
                    spline_position: buf.get_f32_le(),
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(packet))
    }

    /// Simulator-side encoding, used by test doubles of the broadcast endpoint
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut body = BytesMut::with_capacity(64);
        match self {
            InboundPacket::RegistrationResult(result) => {
                body.put_u8(MSG_REGISTRATION_RESULT);
                body.put_i32_le(result.connection_id);
                body.put_u8(result.success as u8);
                body.put_u8(result.read_only as u8);
                put_string(&mut body, &result.error)?;
            }
            InboundPacket::RealtimeUpdate(update) => {
                body.put_u8(MSG_REALTIME_UPDATE);
                body.put_u16_le(update.event_index);
                body.put_u16_le(update.session_index);
                body.put_u8(update.session_type);
                body.put_u8(update.phase);
                body.put_f32_le(update.session_time);
                body.put_f32_le(update.session_end_time);
                body.put_i32_le(update.focused_entity_index);
            }
            InboundPacket::EntityUpdate(entity) => {
                body.put_u8(MSG_REALTIME_ENTITY_UPDATE);
                body.put_u16_le(entity.entity_index);
                body.put_i8(entity.gear);
                for v in entity.position.iter().chain(entity.velocity.iter()) {
                    body.put_f32_le(*v);
                }
                body.put_u16_le(entity.current_lap);
                body.put_i32_le(entity.delta_ms);
                body.put_i32_le(entity.best_lap_ms);
                body.put_i32_le(entity.last_lap_ms);
                body.put_i32_le(entity.current_lap_ms);
                body.put_u16_le(entity.lap_count);
                body.put_u16_le(entity.track_position);
                body.put_f32_le(entity.spline_position);
            }
        }
        frame_packet(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_layout() {
        let packet = OutboundPacket::Register {
            display_name: "ab".into(),
            connection_password: "".into(),
            update_interval_ms: 100,
            command_password: "c".into(),
        }
        .encode()
        .unwrap();

        // type + version + (2+2) + (2+0) + 4 + (2+1)
        assert_eq!(&packet[..2], &15u16.to_le_bytes());
        assert_eq!(packet[2], MSG_REGISTER);
        assert_eq!(packet[3], PROTOCOL_VERSION);
        assert_eq!(&packet[4..8], &[2, 0, b'a', b'b']);
        assert_eq!(&packet[10..14], &100i32.to_le_bytes());
        assert_eq!(packet.len(), 17);
    }

    #[test]
    fn test_unregister_layout() {
        let packet = OutboundPacket::Unregister { connection_id: 7 }.encode().unwrap();
        assert_eq!(packet, vec![5, 0, MSG_UNREGISTER, 7, 0, 0, 0]);
    }

    #[test]
    fn test_entity_update_speed() {
        let entity = EntityUpdate {
            velocity: [30.0, 40.0, 0.0],
            ..Default::default()
        };
        assert!((entity.speed_kmh() - 180.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_registration_result() {
        let encoded = InboundPacket::RegistrationResult(RegistrationResult {
            connection_id: 12,
            success: true,
            read_only: false,
            error: String::new(),
        })
        .encode()
        .unwrap();

        match InboundPacket::decode(&encoded).unwrap() {
            Some(InboundPacket::RegistrationResult(result)) => {
                assert_eq!(result.connection_id, 12);
                assert!(result.success);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let packet = vec![3, 0, 42, 1, 2];
        assert_eq!(InboundPacket::decode(&packet).unwrap(), None);
    }

    #[test]
    fn test_truncated_entity_update() {
        let mut packet = InboundPacket::EntityUpdate(EntityUpdate::default())
            .encode()
            .unwrap();
        packet.truncate(20);
        let declared = (packet.len() - 2) as u16;
        packet[..2].copy_from_slice(&declared.to_le_bytes());
        assert!(matches!(
            InboundPacket::decode(&packet),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_length_mismatch() {
        let mut packet = InboundPacket::RealtimeUpdate(RealtimeUpdate::default())
            .encode()
            .unwrap();
        packet.push(0);
        assert!(matches!(
            InboundPacket::decode(&packet),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_register_longer_than_a_packet_is_rejected() {
        let long = "x".repeat(30_000);
        let register = OutboundPacket::Register {
            display_name: long.clone(),
            connection_password: long.clone(),
            update_interval_ms: 100,
            command_password: long,
        };
        assert_eq!(register.encode(), Err(ProtocolError::PacketTooLong(90_012)));

        let oversized = OutboundPacket::Register {
            display_name: "y".repeat(70_000),
            connection_password: String::new(),
            update_interval_ms: 100,
            command_password: String::new(),
        };
        assert_eq!(oversized.encode(), Err(ProtocolError::StringTooLong(70_000)));
    }

    #[test]
    fn test_session_type_names() {
        assert_eq!(session_type_name(10), "race");
        assert_eq!(session_type_name(200), "unknown");
    }
}
