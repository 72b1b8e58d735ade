//! Datagram packet kinds and big-endian packet framing
//!
//! Every packet starts with a kind byte. Numbered kinds follow it with an
//! `i16` sequence number that the sender fills in just before transmission.

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::codec::{ByteReader, ByteWriter};
use crate::error::{AirLinkError, Result};

/// Largest datagram exchanged with the ground station
pub const MAX_PACKET_SIZE: usize = 1100;

/// Sequence number carried by every `Connect`
pub const CONNECT_PACKET_NUMBER: i16 = -1;

/// Client type announced by this side in `Connect`
pub const CLIENT_TYPE_FLIGHT: u8 = 0;
pub const CLIENT_TYPE_CONTROL: u8 = 1;
pub const CLIENT_TYPE_VIEWER: u8 = 2;

/// Application packet kinds (leading byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    VideoInitialFrame = 0,
    VideoFrame = 1,
    KeyFrame = 2,
    StartVideo = 3,
    GetVideoConfig = 4,
    ChangeBitRate = 5,
    RequestPackets = 6,
    PacketReceived = 7,
    Connect = 8,
    Disconnect = 9,
    Ping = 10,
    Pong = 11,
    AudioInitialFrame = 12,
    AudioFrame = 13,
    FcInfo = 14,
    OsdConfig = 15,
    BatteryConfig = 16,
    BoxIds = 17,
    BoxNames = 18,
    TelemetryData = 19,
    StartStopRecording = 20,
    Config = 21,
    ConfigReceived = 22,
    VersionMismatch = 23,
    RcFrame = 24,
}

impl PacketKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        use PacketKind::*;
        Some(match value {
            0 => VideoInitialFrame,
            1 => VideoFrame,
            2 => KeyFrame,
            3 => StartVideo,
            4 => GetVideoConfig,
            5 => ChangeBitRate,
            6 => RequestPackets,
            7 => PacketReceived,
            8 => Connect,
            9 => Disconnect,
            10 => Ping,
            11 => Pong,
            12 => AudioInitialFrame,
            13 => AudioFrame,
            14 => FcInfo,
            15 => OsdConfig,
            16 => BatteryConfig,
            17 => BoxIds,
            18 => BoxNames,
            19 => TelemetryData,
            20 => StartStopRecording,
            21 => Config,
            22 => ConfigReceived,
            23 => VersionMismatch,
            24 => RcFrame,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Carries a sequence number and goes through the reorder window
    pub fn is_numbered(self) -> bool {
        use PacketKind::*;
        matches!(
            self,
            VideoInitialFrame
                | AudioInitialFrame
                | StartVideo
                | GetVideoConfig
                | ChangeBitRate
                | Connect
                | FcInfo
                | OsdConfig
                | BatteryConfig
                | BoxIds
                | BoxNames
                | StartStopRecording
                | Config
                | ConfigReceived
                | VersionMismatch
        )
    }

    /// Answered with `PacketReceived` and resent until then
    pub fn is_acknowledged(self) -> bool {
        self.is_numbered() && self != PacketKind::ChangeBitRate
    }

    /// How long a packet of this kind is worth keeping around
    pub fn lifetime(self) -> Duration {
        match self {
            PacketKind::VideoFrame | PacketKind::AudioFrame | PacketKind::RcFrame => Duration::ZERO,
            PacketKind::KeyFrame => Duration::from_millis(500),
            _ => Duration::from_millis(1000),
        }
    }

    fn header_len(self) -> usize {
        if self.is_numbered() {
            3
        } else {
            1
        }
    }
}

/// Outbound packet under construction
///
/// Dereferences to the underlying big-endian [`ByteWriter`].
#[derive(Debug)]
pub struct PacketBuilder {
    writer: ByteWriter,
}

impl PacketBuilder {
    /// Start a packet; numbered kinds get a zero placeholder number
    pub fn new(kind: PacketKind) -> Self {
        let mut writer = ByteWriter::big_endian();
        writer.write_u8(kind.as_u8());
        if kind.is_numbered() {
            writer.write_i16(0);
        }
        Self { writer }
    }

    /// Start a packet with an explicit number
    pub fn with_number(kind: PacketKind, number: i16) -> Self {
        let mut writer = ByteWriter::big_endian();
        writer.write_u8(kind.as_u8()).write_i16(number);
        Self { writer }
    }

    pub fn finish(self) -> Vec<u8> {
        self.writer.into_vec()
    }
}

impl Deref for PacketBuilder {
    type Target = ByteWriter;

    fn deref(&self) -> &ByteWriter {
        &self.writer
    }
}

impl DerefMut for PacketBuilder {
    fn deref_mut(&mut self) -> &mut ByteWriter {
        &mut self.writer
    }
}

/// A datagram received from the network
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub number: Option<i16>,
    pub data: Bytes,
    pub source: SocketAddr,
    pub received_at: Instant,
}

impl Packet {
    /// Split the header off a raw datagram
    ///
    /// # Errors
    ///
    /// `Protocol` for an unknown kind byte, `BufferUnderrun` when a
    /// numbered packet is shorter than its header.
    pub fn parse(data: &[u8], source: SocketAddr) -> Result<Self> {
        let mut reader = ByteReader::big_endian(data);
        let kind_byte = reader.read_u8()?;
        let kind = PacketKind::from_u8(kind_byte)
            .ok_or_else(|| AirLinkError::Protocol(format!("unknown packet kind {}", kind_byte)))?;
        let number = if kind.is_numbered() {
            Some(reader.read_i16()?)
        } else {
            None
        };
        Ok(Self {
            kind,
            number,
            data: Bytes::copy_from_slice(data),
            source,
            received_at: Instant::now(),
        })
    }

    /// Reader over the bytes after the header
    pub fn body(&self) -> ByteReader<'_> {
        let start = self.kind.header_len().min(self.data.len());
        ByteReader::big_endian(&self.data[start..])
    }
}

/// `Ping` / `Pong` body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingBody {
    /// Addressed to the far end rather than the relay
    pub to_end_point: bool,
    /// Sender clock in milliseconds, echoed back unchanged
    pub time: i64,
    /// Viewer slot, present only when the relay adds it
    pub target: Option<u8>,
}

impl PingBody {
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let to_end_point = reader.read_bool()?;
        let time = reader.read_i64()?;
        let target = if reader.remaining() > 0 {
            Some(reader.read_u8()?)
        } else {
            None
        };
        Ok(Self {
            to_end_point,
            time,
            target,
        })
    }

    pub fn write(&self, writer: &mut ByteWriter) {
        writer.write_bool(self.to_end_point).write_i64(self.time);
        if let Some(target) = self.target {
            writer.write_u8(target);
        }
    }
}

/// `Connect` body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectBody {
    pub client_type: u8,
    pub key: String,
    /// Absent in announcements from older peers
    pub version_code: Option<i16>,
}

impl ConnectBody {
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let client_type = reader.read_u8()?;
        let key = reader.read_utf()?;
        let version_code = if reader.remaining() >= 2 {
            Some(reader.read_i16()?)
        } else {
            None
        };
        Ok(Self {
            client_type,
            key,
            version_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6286".parse().unwrap()
    }

    #[test]
    fn test_kind_bytes() {
        for value in 0..=24u8 {
            assert_eq!(PacketKind::from_u8(value).unwrap().as_u8(), value);
        }
        assert!(PacketKind::from_u8(25).is_none());
        assert!(PacketKind::from_u8(0xFF).is_none());
    }

    #[test]
    fn test_numbered_and_acknowledged_kinds() {
        assert!(PacketKind::Connect.is_numbered());
        assert!(PacketKind::Connect.is_acknowledged());
        assert!(PacketKind::ChangeBitRate.is_numbered());
        assert!(!PacketKind::ChangeBitRate.is_acknowledged());
        assert!(!PacketKind::Ping.is_numbered());
        assert!(!PacketKind::TelemetryData.is_acknowledged());
        assert!(!PacketKind::RcFrame.is_numbered());
    }

    #[test]
    fn test_lifetimes() {
        assert_eq!(PacketKind::VideoFrame.lifetime(), Duration::ZERO);
        assert_eq!(PacketKind::KeyFrame.lifetime(), Duration::from_millis(500));
        assert_eq!(PacketKind::Config.lifetime(), Duration::from_millis(1000));
    }

    #[test]
    fn test_builder_placeholder() {
        let mut numbered = PacketBuilder::new(PacketKind::FcInfo);
        numbered.write_u8(9);
        assert_eq!(numbered.finish(), vec![14, 0, 0, 9]);

        let mut plain = PacketBuilder::new(PacketKind::Pong);
        plain.write_bool(true);
        assert_eq!(plain.finish(), vec![11, 1]);

        let connect = PacketBuilder::with_number(PacketKind::Connect, CONNECT_PACKET_NUMBER);
        assert_eq!(connect.finish(), vec![8, 0xFF, 0xFF]);
    }

    #[test]
    fn test_parse_numbered_packet() {
        let packet = Packet::parse(&[21, 0x01, 0x02, 0xAA], addr()).unwrap();
        assert_eq!(packet.kind, PacketKind::Config);
        assert_eq!(packet.number, Some(0x0102));
        assert_eq!(packet.body().read_remaining(), &[0xAA]);
    }

    #[test]
    fn test_parse_rejects_bad_packets() {
        assert!(Packet::parse(&[], addr()).is_err());
        assert!(Packet::parse(&[99], addr()).is_err());
        assert!(matches!(
            Packet::parse(&[21, 0x01], addr()),
            Err(AirLinkError::BufferUnderrun { .. })
        ));
    }

    #[test]
    fn test_ping_body_target_optional() {
        let mut writer = ByteWriter::big_endian();
        PingBody { to_end_point: true, time: 1234, target: None }.write(&mut writer);
        let bytes = writer.into_vec();
        assert_eq!(bytes.len(), 9);
        let body = PingBody::read(&mut ByteReader::big_endian(&bytes)).unwrap();
        assert_eq!(body.target, None);
        assert_eq!(body.time, 1234);

        let mut writer = ByteWriter::big_endian();
        PingBody { to_end_point: false, time: -1, target: Some(3) }.write(&mut writer);
        let bytes = writer.into_vec();
        assert_eq!(PingBody::read(&mut ByteReader::big_endian(&bytes)).unwrap().target, Some(3));
    }

    #[test]
    fn test_connect_body_version_optional() {
        let mut writer = ByteWriter::big_endian();
        writer.write_u8(CLIENT_TYPE_CONTROL);
        writer.write_utf("DD").unwrap();
        let bytes = writer.into_vec();
        let body = ConnectBody::read(&mut ByteReader::big_endian(&bytes)).unwrap();
        assert_eq!(body.client_type, CLIENT_TYPE_CONTROL);
        assert_eq!(body.key, "DD");
        assert_eq!(body.version_code, None);
    }
}
