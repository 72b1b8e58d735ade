//! # MSP Framing
//!
//! Parses and builds MSP v1 and v2 frames.
//!
//! A byte run read from the serial port may hold several frames back to back.
//! Parsing stops at the first structural or checksum failure and the rest of
//! the run is discarded; there is no scan for the next start byte.
//!
//! Bounds policy, identical for v1 and v2: every header field and the
//! declared payload plus its checksum must fit in what is left of the run,
//! otherwise the run ends there.

use bytes::Bytes;
use tracing::debug;

use super::protocol::*;
use crate::codec::crc::{crc8_dvb_s2, crc8_dvb_s2_update};
use crate::codec::ByteReader;
use crate::error::{AirLinkError, Result};

/// MSP framing generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MspVersion {
    V1,
    V2,
}

/// Who a frame is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MspDirection {
    Request,
    Response,
    Error,
}

impl MspDirection {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            MSP_DIRECTION_REQUEST => Some(MspDirection::Request),
            MSP_DIRECTION_RESPONSE => Some(MspDirection::Response),
            MSP_DIRECTION_ERROR => Some(MspDirection::Error),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            MspDirection::Request => MSP_DIRECTION_REQUEST,
            MspDirection::Response => MSP_DIRECTION_RESPONSE,
            MspDirection::Error => MSP_DIRECTION_ERROR,
        }
    }
}

/// One decoded MSP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MspFrame {
    pub version: MspVersion,
    pub direction: MspDirection,
    /// v2 flag byte, always 0 for v1
    pub flag: u8,
    pub code: u16,
    pub payload: Bytes,
}

impl MspFrame {
    /// Build an outbound v2 request with a zero flag byte
    pub fn request(code: u16, payload: &[u8]) -> Self {
        Self {
            version: MspVersion::V2,
            direction: MspDirection::Request,
            flag: 0,
            code,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Declared payload length
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialize to wire bytes
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the code or payload do not fit the version's
    /// length fields (v1: 8-bit code and length, v2: 16-bit).
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self.version {
            MspVersion::V1 => self.encode_v1(),
            MspVersion::V2 => self.encode_v2(),
        }
    }

    fn encode_v1(&self) -> Result<Vec<u8>> {
        let code = u8::try_from(self.code)
            .map_err(|_| AirLinkError::Protocol(format!("MSP v1 code {} out of range", self.code)))?;
        let len = u8::try_from(self.payload.len()).map_err(|_| {
            AirLinkError::Protocol(format!("MSP v1 payload too large: {}", self.payload.len()))
        })?;

        let mut frame = Vec::with_capacity(MSP_V1_HEADER_LEN + self.payload.len() + 1);
        frame.extend_from_slice(&[MSP_START, MSP_V1_MAGIC, self.direction.as_byte(), len, code]);
        frame.extend_from_slice(&self.payload);
        frame.push(xor_checksum(len, code, &self.payload));
        Ok(frame)
    }

    fn encode_v2(&self) -> Result<Vec<u8>> {
        let len = u16::try_from(self.payload.len()).map_err(|_| {
            AirLinkError::Protocol(format!("MSP v2 payload too large: {}", self.payload.len()))
        })?;

        let mut frame = Vec::with_capacity(MSP_V2_HEADER_LEN + self.payload.len() + 1);
        frame.extend_from_slice(&[MSP_START, MSP_V2_MAGIC, self.direction.as_byte()]);
        frame.push(self.flag);
        frame.extend_from_slice(&self.code.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&self.payload);

        // Checksum covers flag, code, length and payload
        let crc = crc8_dvb_s2(&frame[3..]);
        frame.push(crc);
        Ok(frame)
    }
}

/// Encode a v2 request frame; infallible for payloads up to 64 KiB
pub fn encode_request(code: u16, payload: &[u8]) -> Option<Vec<u8>> {
    MspFrame::request(code, payload).encode().ok()
}

/// MSP v1 checksum: XOR of length, code and every payload byte
pub fn xor_checksum(len: u8, code: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(len ^ code, |crc, &b| crc ^ b)
}

/// Decode all frames in a byte run, stopping at the first bad frame
pub fn parse_frames(data: &[u8]) -> Vec<MspFrame> {
    let mut reader = ByteReader::little_endian(data);
    let mut frames = Vec::new();

    while reader.remaining() > 0 {
        match parse_frame(&mut reader) {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                debug!("MSP run aborted at byte {}: {}", reader.position(), e);
                break;
            }
        }
    }

    frames
}

fn parse_frame(reader: &mut ByteReader<'_>) -> Result<MspFrame> {
    let start = reader.read_u8()?;
    if start != MSP_START {
        return Err(AirLinkError::Protocol(format!("bad start byte 0x{:02X}", start)));
    }

    let version = match reader.read_u8()? {
        MSP_V1_MAGIC => MspVersion::V1,
        MSP_V2_MAGIC => MspVersion::V2,
        other => return Err(AirLinkError::Protocol(format!("bad magic 0x{:02X}", other))),
    };

    let direction_byte = reader.read_u8()?;
    let direction = MspDirection::from_byte(direction_byte).ok_or_else(|| {
        AirLinkError::Protocol(format!("bad direction 0x{:02X}", direction_byte))
    })?;

    match version {
        MspVersion::V1 => {
            let len = reader.read_u8()?;
            let code = reader.read_u8()?;
            let payload = reader.read_bytes(len as usize)?;
            let crc = reader.read_u8()?;

            let expected = xor_checksum(len, code, payload);
            if crc != expected {
                return Err(AirLinkError::Protocol(format!(
                    "v1 checksum mismatch for code {}: 0x{:02X} != 0x{:02X}",
                    code, crc, expected
                )));
            }

            Ok(MspFrame {
                version,
                direction,
                flag: 0,
                code: code as u16,
                payload: Bytes::copy_from_slice(payload),
            })
        }
        MspVersion::V2 => {
            let flag = reader.read_u8()?;
            let code = reader.read_u16()?;
            let len = reader.read_u16()?;
            let payload = reader.read_bytes(len as usize)?;
            let crc = reader.read_u8()?;

            let mut expected = crc8_dvb_s2_update(0, &[flag]);
            expected = crc8_dvb_s2_update(expected, &code.to_le_bytes());
            expected = crc8_dvb_s2_update(expected, &len.to_le_bytes());
            expected = crc8_dvb_s2_update(expected, payload);
            if crc != expected {
                return Err(AirLinkError::Protocol(format!(
                    "v2 checksum mismatch for code {}: 0x{:02X} != 0x{:02X}",
                    code, crc, expected
                )));
            }

            Ok(MspFrame {
                version,
                direction,
                flag,
                code,
                payload: Bytes::copy_from_slice(payload),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v1_response(code: u8, payload: &[u8]) -> Vec<u8> {
        MspFrame {
            version: MspVersion::V1,
            direction: MspDirection::Response,
            flag: 0,
            code: code as u16,
            payload: Bytes::copy_from_slice(payload),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_v1_known_frame() {
        let frame = v1_response(MSP_COMP_GPS as u8, &[0x02, 0x00]);
        assert_eq!(frame, vec![0x24, 0x4D, 0x3E, 0x02, 0x6B, 0x02, 0x00, 0x02 ^ 0x6B ^ 0x02]);

        let parsed = parse_frames(&frame);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].code, MSP_COMP_GPS);
        assert_eq!(parsed[0].direction, MspDirection::Response);
        assert_eq!(&parsed[0].payload[..], &[0x02, 0x00]);
    }

    #[test]
    fn test_v2_request_layout() {
        let frame = encode_request(MSP_API_VERSION, &[]).unwrap();
        assert_eq!(frame, vec![0x24, 0x58, 0x3C, 0x00, 0x01, 0x00, 0x00, 0x00, 0x45]);
    }

    #[test]
    fn test_concatenated_frames() {
        let mut run = v1_response(MSP_ATTITUDE as u8, &[1, 0, 2, 0, 3, 0]);
        run.extend(v1_response(MSP_ALTITUDE as u8, &[0; 6]));
        let parsed = parse_frames(&run);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].code, MSP_ALTITUDE);
    }

    #[test]
    fn test_corrupt_byte_rejects_frame_and_rest_of_run() {
        let good = v1_response(MSP_ATTITUDE as u8, &[1, 0, 2, 0, 3, 0]);
        for i in 0..good.len() {
            let mut run = good.clone();
            run[i] ^= 0x01;
            run.extend(v1_response(MSP_ALTITUDE as u8, &[0; 6]));
            let parsed = parse_frames(&run);
            assert!(
                parsed.iter().all(|f| f.code != MSP_ATTITUDE || &f.payload[..] != &good[5..11]),
                "corruption at byte {} accepted",
                i
            );
            assert!(
                !parsed.iter().any(|f| f.code == MSP_ALTITUDE),
                "parser resynchronized after corruption at byte {}",
                i
            );
        }
    }

    #[test]
    fn test_good_frames_before_bad_one_survive() {
        let mut run = v1_response(MSP_ATTITUDE as u8, &[0; 6]);
        let mut bad = v1_response(MSP_ALTITUDE as u8, &[0; 6]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        run.extend(bad);
        run.extend(v1_response(MSP_ANALOG as u8, &[0; 7]));

        let parsed = parse_frames(&run);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].code, MSP_ATTITUDE);
    }

    #[test]
    fn test_truncated_payload_aborts() {
        let frame = v1_response(MSP_ATTITUDE as u8, &[0; 6]);
        assert!(parse_frames(&frame[..frame.len() - 2]).is_empty());

        let v2 = encode_request(MSP2_INAV_STATUS, &[0; 20]).unwrap();
        assert!(parse_frames(&v2[..v2.len() - 1]).is_empty());
    }

    #[test]
    fn test_error_direction_parsed() {
        let frame = MspFrame {
            version: MspVersion::V2,
            direction: MspDirection::Error,
            flag: 0,
            code: MSP_OSD_CANVAS,
            payload: Bytes::new(),
        };
        let parsed = parse_frames(&frame.encode().unwrap());
        assert_eq!(parsed[0].direction, MspDirection::Error);
    }

    #[test]
    fn test_bad_direction_aborts() {
        let mut frame = v1_response(MSP_ATTITUDE as u8, &[0; 6]);
        frame[2] = b'?';
        assert!(parse_frames(&frame).is_empty());
    }

    #[test]
    fn test_v1_rejects_wide_code() {
        let frame = MspFrame {
            version: MspVersion::V1,
            direction: MspDirection::Request,
            flag: 0,
            code: MSP2_INAV_STATUS,
            payload: Bytes::new(),
        };
        assert!(frame.encode().is_err());
    }

    proptest! {
        #[test]
        fn prop_v2_roundtrip(
            flag in any::<u8>(),
            code in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..4096),
            response in any::<bool>(),
        ) {
            let frame = MspFrame {
                version: MspVersion::V2,
                direction: if response { MspDirection::Response } else { MspDirection::Request },
                flag,
                code,
                payload: Bytes::from(payload),
            };
            let wire = frame.encode().unwrap();
            prop_assert_eq!(wire.len(), MSP_V2_HEADER_LEN + frame.len() + 1);
            prop_assert_eq!(parse_frames(&wire), vec![frame]);
        }

        #[test]
        fn prop_v1_checksum_is_xor(
            code in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..255),
        ) {
            let wire = v1_response(code, &payload);
            let mut expected = payload.len() as u8 ^ code;
            for b in &payload {
                expected ^= b;
            }
            prop_assert_eq!(*wire.last().unwrap(), expected);
        }
    }
}
