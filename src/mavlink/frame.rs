//! # MAVLink Framing
//!
//! Splits a serial byte run into MAVLink v1/v2 frames and decodes them with
//! the `common` dialect of the `mavlink` crate.
//!
//! Frame format:
//! ```text
//! v1: [0xFE] [LEN] [SEQ] [SYS] [COMP] [MSGID]             [PAYLOAD] [CRC_LO] [CRC_HI]
//! v2: [0xFD] [LEN] [INC] [CMP] [SEQ] [SYS] [COMP] [MSGID×3] [PAYLOAD] [CRC_LO] [CRC_HI]
//! ```
//!
//! Frames are taken back to back from the start of the run; there is no
//! resynchronization. A bad start byte, a short frame, nonzero incompat
//! flags or a checksum mismatch end the run. Well-framed messages the
//! dialect does not know are stepped over.

use ::mavlink::common::MavMessage;
use ::mavlink::{MavHeader, MavlinkVersion, Message, MAV_STX, MAV_STX_V2};
use tracing::{debug, trace};

use crate::codec::ByteReader;
use crate::error::{AirLinkError, Result};

/// Header bytes after the length byte (v1: seq, sys, comp, msgid)
const V1_HEADER_TAIL: usize = 4;

/// Header bytes after the length byte (v2: flags, seq, sys, comp, msgid×3)
const V2_HEADER_TAIL: usize = 8;

const CRC_LEN: usize = 2;

/// Byte runs shorter than a bare v1 header are ignored
pub const MAVLINK_MIN_RUN_LEN: usize = 6;

pub const MSG_ID_HEARTBEAT: u32 = 0;
pub const MSG_ID_SYS_STATUS: u32 = 1;
pub const MSG_ID_SYSTEM_TIME: u32 = 2;
pub const MSG_ID_GPS_RAW_INT: u32 = 24;
pub const MSG_ID_SCALED_PRESSURE: u32 = 29;
pub const MSG_ID_ATTITUDE: u32 = 30;
pub const MSG_ID_GLOBAL_POSITION_INT: u32 = 33;
pub const MSG_ID_RC_CHANNELS: u32 = 65;
pub const MSG_ID_VFR_HUD: u32 = 74;
pub const MSG_ID_BATTERY_STATUS: u32 = 147;
pub const MSG_ID_AUTOPILOT_VERSION: u32 = 148;
pub const MSG_ID_HOME_POSITION: u32 = 242;
pub const MSG_ID_STATUSTEXT: u32 = 253;

/// One decoded MAVLink frame
#[derive(Debug, Clone)]
pub struct MavlinkFrame {
    pub version: MavlinkVersion,
    pub header: MavHeader,
    pub message: MavMessage,
}

impl MavlinkFrame {
    /// Serialize to wire bytes
    ///
    /// v2 payloads drop trailing zero bytes as the protocol allows.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` when the dialect cannot serialize the message.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ::mavlink::write_versioned_msg(&mut bytes, self.version, self.header, &self.message).map_err(|e| {
            AirLinkError::Protocol(format!("{} not encoded: {}", self.message.message_name(), e))
        })?;
        Ok(bytes)
    }
}

/// Decode all frames in a byte run, stopping at the first bad frame
pub fn parse_frames(data: &[u8]) -> Vec<MavlinkFrame> {
    let mut reader = ByteReader::little_endian(data);
    let mut frames = Vec::new();

    while reader.remaining() > 0 {
        match parse_frame(&mut reader) {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => {}
            Err(e) => {
                debug!("MAVLink run aborted at byte {}: {}", reader.position(), e);
                break;
            }
        }
    }

    frames
}

/// Read one frame; `Ok(None)` for a well-framed message that is skipped
fn parse_frame(reader: &mut ByteReader<'_>) -> Result<Option<MavlinkFrame>> {
    let version = match reader.read_u8()? {
        MAV_STX => MavlinkVersion::V1,
        MAV_STX_V2 => MavlinkVersion::V2,
        other => return Err(AirLinkError::Protocol(format!("bad start byte 0x{:02X}", other))),
    };
    // Checksum input: length byte through the end of the payload
    let body = reader.peek_remaining();
    let len = usize::from(reader.read_u8()?);

    let tail = match version {
        MavlinkVersion::V1 => V1_HEADER_TAIL,
        MavlinkVersion::V2 => V2_HEADER_TAIL,
    };
    if reader.remaining() < tail + len + CRC_LEN {
        return Err(AirLinkError::BufferUnderrun {
            needed: tail + len + CRC_LEN,
            remaining: reader.remaining(),
        });
    }

    let (sequence, system_id, component_id, msg_id) = match version {
        MavlinkVersion::V1 => {
            let sequence = reader.read_u8()?;
            let system_id = reader.read_u8()?;
            let component_id = reader.read_u8()?;
            let msg_id = u32::from(reader.read_u8()?);
            (sequence, system_id, component_id, msg_id)
        }
        MavlinkVersion::V2 => {
            let incompat = reader.read_u8()?;
            if incompat != 0 {
                return Err(AirLinkError::Protocol(format!(
                    "unsupported incompat flags 0x{:02X}",
                    incompat
                )));
            }
            let _compat = reader.read_u8()?;
            let sequence = reader.read_u8()?;
            let system_id = reader.read_u8()?;
            let component_id = reader.read_u8()?;
            let msg_id = reader.read_u24()?;
            (sequence, system_id, component_id, msg_id)
        }
    };
    let payload = reader.read_bytes(len)?;
    let crc = reader.read_u16()?;

    // No CRC extra to check against
    if MavMessage::default_message_from_id(msg_id).is_err() {
        trace!("Skipping MAVLink message {} unknown to the dialect", msg_id);
        return Ok(None);
    }

    let expected = ::mavlink::calculate_crc(&body[..1 + tail + len], MavMessage::extra_crc(msg_id));
    if crc != expected {
        return Err(AirLinkError::Protocol(format!(
            "checksum mismatch for message {}: 0x{:04X} != 0x{:04X}",
            msg_id, crc, expected
        )));
    }

    // Short v2 payloads are zero-extended by the dialect
    match MavMessage::parse(version, msg_id, payload) {
        Ok(message) => Ok(Some(MavlinkFrame {
            version,
            header: MavHeader {
                system_id,
                component_id,
                sequence,
            },
            message,
        })),
        Err(e) => {
            debug!("MAVLink message {} not decoded: {}", msg_id, e);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::mavlink::common::{
        MavAutopilot, MavModeFlag, MavState, MavType, HEARTBEAT_DATA, MISSION_CURRENT_DATA,
    };

    fn header(sequence: u8) -> MavHeader {
        MavHeader {
            system_id: 1,
            component_id: 1,
            sequence,
        }
    }

    fn heartbeat(custom_mode: u32, base_mode: MavModeFlag) -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode,
            system_status: MavState::MAV_STATE_STANDBY,
            mavlink_version: 3,
        })
    }

    fn heartbeat_frame(version: MavlinkVersion) -> MavlinkFrame {
        MavlinkFrame {
            version,
            header: header(7),
            message: heartbeat(0, MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
        }
    }

    /// Hand-built v2 frame; the checksum uses a zero CRC extra
    fn raw_v2(msg_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![MAV_STX_V2, payload.len() as u8, 0, 0, 0, 1, 1];
        frame.extend_from_slice(&msg_id.to_le_bytes()[..3]);
        frame.extend_from_slice(payload);
        let crc = ::mavlink::calculate_crc(&frame[1..], 0);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    fn assert_heartbeat(frame: &MavlinkFrame) {
        match &frame.message {
            MavMessage::HEARTBEAT(hb) => {
                assert_eq!(hb.mavtype, MavType::MAV_TYPE_QUADROTOR);
                assert_eq!(hb.mavlink_version, 3);
            }
            other => panic!("expected heartbeat, got {:?}", other),
        }
    }

    #[test]
    fn test_v1_heartbeat_layout() {
        let bytes = heartbeat_frame(MavlinkVersion::V1).encode().unwrap();
        assert_eq!(bytes.len(), 6 + 9 + 2);
        assert_eq!(&bytes[..6], &[0xFE, 9, 7, 1, 1, 0]);

        let parsed = parse_frames(&bytes);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].version, MavlinkVersion::V1);
        assert_eq!(parsed[0].header, header(7));
        assert_heartbeat(&parsed[0]);
    }

    #[test]
    fn test_v2_frame_decodes() {
        let bytes = heartbeat_frame(MavlinkVersion::V2).encode().unwrap();
        assert_eq!(bytes[0], MAV_STX_V2);

        let parsed = parse_frames(&bytes);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].version, MavlinkVersion::V2);
        assert_heartbeat(&parsed[0]);
    }

    #[test]
    fn test_v2_truncated_payload_is_zero_extended() {
        // Trailing zero bytes (mavlink_version 0) are dropped on the wire
        let message = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 5,
            mavlink_version: 0,
            system_status: MavState::MAV_STATE_UNINIT,
            ..HEARTBEAT_DATA::default()
        });
        let frame = MavlinkFrame {
            version: MavlinkVersion::V2,
            header: header(0),
            message,
        };
        let bytes = frame.encode().unwrap();
        assert!(bytes[1] < 9);

        let parsed = parse_frames(&bytes);
        match &parsed[0].message {
            MavMessage::HEARTBEAT(hb) => {
                assert_eq!(hb.custom_mode, 5);
                assert_eq!(hb.mavlink_version, 0);
            }
            other => panic!("expected heartbeat, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_frames_in_run() {
        let mut run = heartbeat_frame(MavlinkVersion::V2).encode().unwrap();
        run.extend(heartbeat_frame(MavlinkVersion::V1).encode().unwrap());
        assert_eq!(parse_frames(&run).len(), 2);
    }

    #[test]
    fn test_unknown_message_is_skipped() {
        let mut run = raw_v2(0x00F0_00, &[1, 2, 3]);
        run.extend(heartbeat_frame(MavlinkVersion::V2).encode().unwrap());

        let parsed = parse_frames(&run);
        assert_eq!(parsed.len(), 1);
        assert_heartbeat(&parsed[0]);
    }

    #[test]
    fn test_unhandled_known_message_is_decoded() {
        let mission = MavlinkFrame {
            version: MavlinkVersion::V2,
            header: header(0),
            message: MavMessage::MISSION_CURRENT(MISSION_CURRENT_DATA {
                seq: 5,
                ..MISSION_CURRENT_DATA::default()
            }),
        };
        let mut run = mission.encode().unwrap();
        run.extend(heartbeat_frame(MavlinkVersion::V2).encode().unwrap());

        let parsed = parse_frames(&run);
        assert_eq!(parsed.len(), 2);
        assert!(matches!(parsed[0].message, MavMessage::MISSION_CURRENT(ref m) if m.seq == 5));
    }

    #[test]
    fn test_incompat_flags_abort_run() {
        let mut run = heartbeat_frame(MavlinkVersion::V2).encode().unwrap();
        run[2] = 0x01;
        run.extend(heartbeat_frame(MavlinkVersion::V2).encode().unwrap());
        assert!(parse_frames(&run).is_empty());
    }

    #[test]
    fn test_checksum_mismatch_aborts_run() {
        let first = heartbeat_frame(MavlinkVersion::V1).encode().unwrap();
        let mut run = first.clone();
        let last = run.len() - 1;
        run[last] ^= 0x55;
        run.extend(first);
        assert!(parse_frames(&run).is_empty());
    }

    #[test]
    fn test_bad_start_byte_aborts_run() {
        let mut run = vec![0x00];
        run.extend(heartbeat_frame(MavlinkVersion::V2).encode().unwrap());
        assert!(parse_frames(&run).is_empty());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let bytes = heartbeat_frame(MavlinkVersion::V2).encode().unwrap();
        assert!(parse_frames(&bytes[..bytes.len() - 1]).is_empty());
    }
}
