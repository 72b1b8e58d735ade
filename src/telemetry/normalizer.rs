//! Re-encode raw FC and device records into the compact big-endian
//! telemetry schema sent to the ground station.
//!
//! Each record is `code i16` followed by the fields listed per code below.
//! FC payloads arrive little-endian exactly as the FC sent them; fields that
//! the ground station has no use for are dropped, and a few layouts differ
//! between iNav and Betaflight.

use tokio::sync::mpsc;
use tracing::debug;

use super::TelemetryData;
use crate::codec::{ByteReader, ByteWriter};
use crate::error::{AirLinkError, Result};
use crate::fc::{FcIdentity, FcVariant};
use crate::msp::engine::inav_mode_word_count;
use crate::msp::protocol::*;

/// Outcome of normalizing one raw record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    /// Encoded record, code included
    Record(Vec<u8>),
    /// Camera-switch edge from the FC: toggle the recorder, send nothing
    RecorderToggle,
    /// Unknown code, FC identity missing, or a truncated payload
    Skipped,
}

/// Records drained during one telemetry tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TelemetryBatch {
    /// Packet bodies, each holding whole records only
    pub bodies: Vec<Vec<u8>>,
    pub recorder_toggles: usize,
}

/// Telemetry record encoder
#[derive(Debug, Clone)]
pub struct Normalizer {
    /// Written ahead of OSD config records
    version_code: i16,
}

impl Normalizer {
    pub fn new(version_code: i16) -> Self {
        Self { version_code }
    }

    /// Normalize one record against the current FC identity
    pub fn normalize(&self, record: &TelemetryData, identity: Option<&FcIdentity>) -> Normalized {
        if record.code == DD_VIDEO_RECORDER_START_STOP {
            return Normalized::RecorderToggle;
        }
        if record.code < DD_TIMERS && identity.is_none() {
            return Normalized::Skipped;
        }

        let mut out = ByteWriter::big_endian();
        out.write_u16(record.code);
        let mut reader = ByteReader::little_endian(&record.data);
        match self.encode(record.code, identity, &mut reader, &mut out) {
            Ok(true) => Normalized::Record(out.into_vec()),
            Ok(false) => Normalized::Skipped,
            Err(e) => {
                debug!("Telemetry record 0x{:04X} dropped: {}", record.code, e);
                Normalized::Skipped
            }
        }
    }

    /// Drain both queues, alternating FC and device records
    ///
    /// Records are packed into bodies of at most `max_body` bytes; a batch
    /// with no records has no bodies.
    pub fn drain(
        &self,
        fc: &mut mpsc::Receiver<TelemetryData>,
        device: &mut mpsc::Receiver<TelemetryData>,
        identity: Option<&FcIdentity>,
        max_body: usize,
    ) -> TelemetryBatch {
        let mut batch = TelemetryBatch::default();
        let mut body = Vec::new();
        loop {
            let fc_record = fc.try_recv().ok();
            let device_record = device.try_recv().ok();
            if fc_record.is_none() && device_record.is_none() {
                break;
            }
            for record in fc_record.iter().chain(device_record.iter()) {
                match self.normalize(record, identity) {
                    Normalized::Record(bytes) => {
                        if !body.is_empty() && body.len() + bytes.len() > max_body {
                            batch.bodies.push(std::mem::take(&mut body));
                        }
                        body.extend_from_slice(&bytes);
                    }
                    Normalized::RecorderToggle => batch.recorder_toggles += 1,
                    Normalized::Skipped => {}
                }
            }
        }
        if !body.is_empty() {
            batch.bodies.push(body);
        }
        batch
    }

    /// Write the fields for `code`; `Ok(false)` for codes without a layout
    fn encode(
        &self,
        code: u16,
        identity: Option<&FcIdentity>,
        r: &mut ByteReader<'_>,
        w: &mut ByteWriter,
    ) -> Result<bool> {
        let variant = identity.map_or(FcVariant::Unknown, |id| id.variant);
        match code {
            MSP_ATTITUDE => {
                w.write_i16(r.read_i16()?); // roll
                w.write_i16(r.read_i16()?); // pitch
                w.write_i16(r.read_i16()?); // yaw
            }
            MSP_ALTITUDE => {
                w.write_i32(r.read_i32()?);
                w.write_i16(r.read_i16()?); // vario
                if variant == FcVariant::Inav {
                    w.write_i32(r.read_i32()?); // baro altitude
                }
            }
            MSP_ANALOG => {
                r.skip(1)?; // legacy voltage
                w.write_i16(r.read_i16()?); // mAh drawn
                w.write_i16(r.read_i16()?); // rssi
                w.write_i16(r.read_i16()?); // amperage
                if variant == FcVariant::Betaflight {
                    w.write_i16(r.read_i16()?); // voltage
                }
            }
            MSP_BOXIDS | MSP_BOXNAMES => {
                let data = r.read_remaining();
                let len = i16::try_from(data.len())
                    .map_err(|_| AirLinkError::Protocol(format!("box list too long: {}", data.len())))?;
                w.write_i16(len);
                w.write_bytes(data);
            }
            MSP_BATTERY_CONFIG => encode_battery_config(variant, r, w)?,
            MSP_OSD_CONFIG => {
                w.write_i16(self.version_code);
                encode_osd_config(variant, r, w)?;
            }
            MSP_VTX_CONFIG => {
                let device = r.read_u8()?;
                w.write_i16(i16::from(device));
                if device != VTXDEV_UNKNOWN {
                    w.write_u8(r.read_u8()?); // band
                    w.write_u8(r.read_u8()?); // channel
                    w.write_u8(r.read_u8()?); // power
                    w.write_u8(r.read_u8()?); // pit mode
                    if variant == FcVariant::Betaflight {
                        w.write_i16(r.read_i16()?); // frequency
                    }
                    w.write_u8(r.read_u8()?); // device ready
                    w.write_u8(r.read_u8()?); // low power disarm
                }
            }
            MSP_BATTERY_STATE => {
                w.write_u8(r.read_u8()?); // cell count
                w.write_i16(r.read_i16()?); // capacity
                r.skip(1)?;
                w.write_i16(r.read_i16()?); // mAh drawn
                w.write_i16(r.read_i16()?); // amperage
                w.write_u8(r.read_u8()?); // state
                w.write_i16(r.read_i16()?); // voltage
            }
            MSP_STATUS => encode_status(identity, r, w)?,
            MSP_RAW_GPS => {
                w.write_u8(r.read_u8()?); // fix type
                w.write_u8(r.read_u8()?); // satellites
                w.write_i32(r.read_i32()?); // lat
                w.write_i32(r.read_i32()?); // lon
                w.write_i16(r.read_i16()?); // altitude
                w.write_i16(r.read_i16()?); // ground speed
                w.write_i16(r.read_i16()?); // ground course
                w.write_i16(r.read_i16()?); // hdop
            }
            MSP_COMP_GPS => {
                w.write_i16(r.read_i16()?); // distance to home
                w.write_i16(r.read_i16()?); // direction to home
                w.write_u8(r.read_u8()?); // heartbeat
            }
            MSP_OSD_CANVAS => {
                w.write_u8(r.read_u8()?); // columns
                w.write_u8(r.read_u8()?); // rows
            }
            MSP2_INAV_STATUS => {
                w.write_i16(r.read_i16()?); // cycle time
                w.write_i16(r.read_i16()?); // i2c errors
                w.write_i16(r.read_i16()?); // sensor status
                w.write_i16(r.read_i16()?); // system load
                w.write_u8(r.read_u8()?); // profiles
                w.write_i32(r.read_i32()?); // arming flags
                let count = inav_mode_word_count(r.remaining());
                let count_byte = u8::try_from(count)
                    .map_err(|_| AirLinkError::Protocol(format!("{} mode words", count)))?;
                w.write_u8(count_byte);
                for _ in 0..count {
                    w.write_i32(r.read_i32()?);
                }
            }
            MSP2_INAV_ANALOG => {
                w.write_u8(r.read_u8()?); // battery info
                w.write_i16(r.read_i16()?); // voltage
                w.write_i16(r.read_i16()?); // amperage
                w.write_i32(r.read_i32()?); // power
                w.write_i32(r.read_i32()?); // mAh drawn
                w.write_i32(r.read_i32()?); // mWh drawn
                w.write_i32(r.read_i32()?); // remaining capacity
                w.write_u8(r.read_u8()?); // percentage
                w.write_i16(r.read_i16()?); // rssi
            }
            DD_TIMERS => {
                w.write_i32(r.read_i32()?); // on time
                w.write_i32(r.read_i32()?); // fly time
                w.write_i32(r.read_i32()?); // last arm time
            }
            DD_PHONE_BATTERY_STATE => {
                w.write_u8(r.read_u8()?);
                w.write_bool(r.read_bool()?);
            }
            DD_CAMERA_FPS => {
                w.write_i16(r.read_i16()?);
            }
            DD_VIDEO_BIT_RATE => {
                w.write_f32(r.read_f32()?);
            }
            DD_VIDEO_RECORDER_STATE => {
                w.write_bool(r.read_bool()?);
                w.write_i32(r.read_i32()?);
            }
            DD_AP_OSD_CONFIG => {
                w.write_i16(self.version_code);
                encode_ap_osd_config(r, w)?;
            }
            DD_AP_ATTITUDE => {
                w.write_i16(r.read_i16()?); // roll, decidegrees
                w.write_i16(r.read_i16()?); // pitch, decidegrees
                w.write_i16(r.read_i16()?); // yaw, degrees
            }
            DD_AP_MODE => {
                w.write_u8(r.read_u8()?); // custom mode
                w.write_bool(r.read_bool()?); // armed
            }
            DD_AP_BATTERY_STATUS => {
                w.write_i16(r.read_i16()?); // current, cA
                w.write_i32(r.read_i32()?); // consumed, mAh
                w.write_i8(r.read_i8()?); // remaining %
                w.write_i32(r.read_i32()?); // fault bits
            }
            DD_AP_SYS_STATUS => {
                w.write_u8(r.read_u8()?); // cell count
                w.write_u16(r.read_u16()?); // voltage, mV
                w.write_i8(r.read_i8()?); // remaining %
            }
            DD_AP_STATUS_TEXT => {
                w.write_u8(r.read_u8()?); // severity
                w.write_utf(&r.read_utf()?)?;
            }
            DD_AP_GPS_RAW_INT => {
                w.write_u8(r.read_u8()?); // fix type
                w.write_u16(r.read_u16()?); // ground speed, cm/s
                w.write_u8(r.read_u8()?); // satellites
            }
            DD_AP_GLOBAL_POSITION_INT => {
                w.write_i32(r.read_i32()?); // lat
                w.write_i32(r.read_i32()?); // lon
                w.write_i32(r.read_i32()?); // relative altitude, mm
                w.write_i16(r.read_i16()?); // vertical speed, cm/s
                w.write_i32(r.read_i32()?); // distance traveled, m
                w.write_i32(r.read_i32()?); // distance to home, m
                w.write_i16(r.read_i16()?); // direction to home
            }
            DD_AP_HOME_POSITION => {
                w.write_i32(r.read_i32()?); // lat
                w.write_i32(r.read_i32()?); // lon
            }
            DD_AP_SYSTEM_TIME => {
                w.write_i32(r.read_i32()?); // boot time
                w.write_i32(r.read_i32()?); // flight time
                w.write_i32(r.read_i32()?); // arming time
            }
            DD_AP_RC_CHANNELS => {
                w.write_u8(r.read_u8()?); // rssi
            }
            DD_AP_SCALED_PRESSURE => {
                w.write_i16(r.read_i16()?); // temperature, c°C
            }
            DD_AP_VTX_POWER => {
                w.write_i16(r.read_i16()?);
            }
            DD_AP_VFR_HUD => {
                w.write_u8(r.read_u8()?); // throttle %
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn encode_battery_config(variant: FcVariant, r: &mut ByteReader<'_>, w: &mut ByteWriter) -> Result<()> {
    match variant {
        FcVariant::Inav => {
            // voltage scale, source, cells, cell detect
            r.skip(2 + 1 + 1 + 2)?;
            w.write_i16(r.read_i16()?); // min cell
            w.write_i16(r.read_i16()?); // max cell
            w.write_i16(r.read_i16()?); // warning cell
        }
        FcVariant::Betaflight => {
            // legacy cell voltages, capacity, meter sources
            r.skip(1 + 1 + 1 + 2 + 1 + 1)?;
            w.write_i16(r.read_i16()?);
            w.write_i16(r.read_i16()?);
            w.write_i16(r.read_i16()?);
        }
        FcVariant::Ardupilot | FcVariant::Unknown => {}
    }
    Ok(())
}

fn encode_osd_config(variant: FcVariant, r: &mut ByteReader<'_>, w: &mut ByteWriter) -> Result<()> {
    match variant {
        FcVariant::Inav => {
            let driver = r.read_u8()?;
            w.write_u8(driver);
            if driver == 0 {
                return Ok(());
            }
            w.write_u8(r.read_u8()?); // video system
            w.write_u8(r.read_u8()?); // units
            w.write_u8(r.read_u8()?); // rssi alarm
            w.write_i16(r.read_i16()?); // capacity warning
            w.write_i16(r.read_i16()?); // time alarm
            w.write_i16(r.read_i16()?); // altitude alarm
            w.write_i16(r.read_i16()?); // distance alarm
            w.write_i16(r.read_i16()?); // negative altitude alarm
            let items = r.remaining() / 2;
            w.write_i16(osd_count(items)?);
            for _ in 0..items {
                w.write_i16(r.read_i16()?);
            }
        }
        FcVariant::Betaflight => {
            r.skip(1)?; // flags
            w.write_u8(r.read_u8()?); // video system
            w.write_u8(r.read_u8()?); // units
            w.write_u8(r.read_u8()?); // rssi alarm
            w.write_i16(r.read_i16()?); // capacity warning
            r.skip(1)?;
            let items = usize::from(r.read_u8()?);
            w.write_i16(r.read_i16()?); // altitude alarm
            w.write_i16(osd_count(items)?);
            if items == 0 {
                return Ok(());
            }
            for _ in 0..items {
                w.write_i16(r.read_i16()?);
            }
            let stats = r.read_u8()?;
            w.write_u8(stats);
            for _ in 0..stats {
                w.write_u8(r.read_u8()?);
            }
            let timers = r.read_u8()?;
            w.write_u8(timers);
            for _ in 0..timers {
                w.write_i16(r.read_i16()?);
            }
            r.skip(2)?; // legacy warnings
            w.write_u8(r.read_u8()?); // warning count
            w.write_i32(r.read_i32()?); // enabled warnings
            r.skip(1)?; // profile count
            w.write_u8(r.read_u8()?); // selected profile
            r.skip(1)?; // overlay radio mode
            w.write_u8(r.read_u8()?); // camera frame width
            w.write_u8(r.read_u8()?); // camera frame height
        }
        FcVariant::Ardupilot | FcVariant::Unknown => {}
    }
    Ok(())
}

/// ArduPilot OSD screen built from parameters
fn encode_ap_osd_config(r: &mut ByteReader<'_>, w: &mut ByteWriter) -> Result<()> {
    w.write_bool(r.read_bool()?); // enabled
    // text resolution, units, message time, rssi and satellite warnings
    w.write_bytes(r.read_bytes(5)?);
    w.write_f32(r.read_f32()?); // battery voltage warning
    w.write_f32(r.read_f32()?); // average cell warning
    w.write_u8(r.read_u8()?); // cell count
    let items = r.read_u8()?;
    w.write_u8(items);
    for _ in 0..items {
        w.write_bool(r.read_bool()?);
        w.write_u8(r.read_u8()?); // x
        w.write_u8(r.read_u8()?); // y
    }
    Ok(())
}

fn osd_count(items: usize) -> Result<i16> {
    i16::try_from(items).map_err(|_| AirLinkError::Protocol(format!("{} OSD items", items)))
}

fn encode_status(identity: Option<&FcIdentity>, r: &mut ByteReader<'_>, w: &mut ByteWriter) -> Result<()> {
    let Some(identity) = identity else {
        return Ok(());
    };
    w.write_i16(r.read_i16()?); // cycle time
    w.write_i16(r.read_i16()?); // i2c errors
    w.write_i16(r.read_i16()?); // sensor status
    match identity.variant {
        FcVariant::Inav => {
            r.skip(4)?; // legacy mode flags
            w.write_u8(r.read_u8()?); // config profile
        }
        FcVariant::Betaflight => {
            let first_flags = r.read_u32()?;
            w.write_u8(r.read_u8()?); // PID profile
            w.write_i16(r.read_i16()?); // system load
            r.skip(2)?;
            let extra = r.read_i8()?;
            let extra = usize::try_from(extra)
                .map_err(|_| AirLinkError::Protocol(format!("negative mode flag count {}", extra)))?;
            let size = u8::try_from(extra + 4)
                .map_err(|_| AirLinkError::Protocol(format!("{} mode flag bytes", extra + 4)))?;
            w.write_u8(size);
            w.write_bytes(&first_flags.to_le_bytes());
            w.write_bytes(r.read_bytes(extra)?);
            r.skip(1)?; // arming flag count
            w.write_i32(r.read_i32()?); // arming flags
            w.write_u8(r.read_u8()?); // config state
            let core_temp = if identity.api_newer_than(1, 45) {
                r.read_i16()?
            } else {
                0
            };
            w.write_i16(core_temp);
        }
        FcVariant::Ardupilot | FcVariant::Unknown => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Endian;
    use crate::fc::{ApiVersion, FirmwareVersion};
    use crate::telemetry::TelemetryQueue;

    fn identity(variant: FcVariant, major: u8, minor: u8) -> FcIdentity {
        FcIdentity {
            variant,
            firmware: FirmwareVersion { major: 4, minor: 5, patch: 0 },
            api: ApiVersion { protocol: 0, major, minor },
            platform: 3,
        }
    }

    fn inav() -> FcIdentity {
        identity(FcVariant::Inav, 2, 5)
    }

    fn betaflight() -> FcIdentity {
        identity(FcVariant::Betaflight, 1, 46)
    }

    fn record(normalized: Normalized) -> Vec<u8> {
        match normalized {
            Normalized::Record(bytes) => bytes,
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_attitude_reencoded_big_endian() {
        let n = Normalizer::new(1);
        let raw = TelemetryData::new(MSP_ATTITUDE, vec![0x10, 0x00, 0xF6, 0xFF, 0x68, 0x01]);
        let out = record(n.normalize(&raw, Some(&inav())));
        assert_eq!(out, vec![0x00, 0x6C, 0x00, 0x10, 0xFF, 0xF6, 0x01, 0x68]);
    }

    #[test]
    fn test_fc_record_skipped_without_identity() {
        let n = Normalizer::new(1);
        let raw = TelemetryData::new(MSP_ATTITUDE, vec![0; 6]);
        assert_eq!(n.normalize(&raw, None), Normalized::Skipped);
    }

    #[test]
    fn test_device_record_passes_without_identity() {
        let n = Normalizer::new(1);
        let raw = TelemetryData::new(DD_CAMERA_FPS, 30i16.to_le_bytes().to_vec());
        assert_eq!(record(n.normalize(&raw, None)), vec![0x40, 0x02, 0x00, 0x1E]);
    }

    #[test]
    fn test_recorder_toggle_not_forwarded() {
        let n = Normalizer::new(1);
        let raw = TelemetryData::new(DD_VIDEO_RECORDER_START_STOP, vec![0]);
        assert_eq!(n.normalize(&raw, None), Normalized::RecorderToggle);
    }

    #[test]
    fn test_truncated_payload_skipped() {
        let n = Normalizer::new(1);
        let raw = TelemetryData::new(MSP_RAW_GPS, vec![3, 12, 0, 0]);
        assert_eq!(n.normalize(&raw, Some(&inav())), Normalized::Skipped);
    }

    #[test]
    fn test_unknown_code_skipped() {
        let n = Normalizer::new(1);
        let raw = TelemetryData::new(MSP_RX_MAP, vec![0, 1, 2, 3]);
        assert_eq!(n.normalize(&raw, Some(&inav())), Normalized::Skipped);
    }

    #[test]
    fn test_altitude_baro_only_on_inav() {
        let n = Normalizer::new(1);
        let mut payload = ByteWriter::new(Endian::Little);
        payload.write_i32(1500).write_i16(-20).write_i32(1480);
        let raw = TelemetryData::new(MSP_ALTITUDE, payload.into_vec());

        assert_eq!(record(n.normalize(&raw, Some(&inav()))).len(), 2 + 4 + 2 + 4);
        assert_eq!(record(n.normalize(&raw, Some(&betaflight()))).len(), 2 + 4 + 2);
    }

    #[test]
    fn test_battery_config_layouts() {
        let n = Normalizer::new(1);

        let mut inav_raw = ByteWriter::new(Endian::Little);
        inav_raw.write_i16(1100).write_u8(0).write_u8(4).write_i16(425);
        inav_raw.write_i16(330).write_i16(421).write_i16(350);
        let out = record(n.normalize(&TelemetryData::new(MSP_BATTERY_CONFIG, inav_raw.into_vec()), Some(&inav())));
        assert_eq!(&out[2..], &[0x01, 0x4A, 0x01, 0xA5, 0x01, 0x5E]);

        let mut bf_raw = ByteWriter::new(Endian::Little);
        bf_raw.write_u8(33).write_u8(43).write_u8(35).write_i16(1300).write_u8(1).write_u8(1);
        bf_raw.write_i16(330).write_i16(430).write_i16(350);
        let out = record(n.normalize(&TelemetryData::new(MSP_BATTERY_CONFIG, bf_raw.into_vec()), Some(&betaflight())));
        assert_eq!(&out[2..], &[0x01, 0x4A, 0x01, 0xAE, 0x01, 0x5E]);
    }

    #[test]
    fn test_inav_osd_config_without_driver() {
        let n = Normalizer::new(7);
        let raw = TelemetryData::new(MSP_OSD_CONFIG, vec![0, 1, 2, 3]);
        let out = record(n.normalize(&raw, Some(&inav())));
        assert_eq!(out, vec![0x00, 0x54, 0x00, 0x07, 0x00]);
    }

    #[test]
    fn test_inav_osd_config_items() {
        let n = Normalizer::new(1);
        let mut raw = ByteWriter::new(Endian::Little);
        raw.write_u8(2).write_u8(1).write_u8(0).write_u8(20);
        for _ in 0..5 {
            raw.write_i16(100);
        }
        raw.write_i16(0x0801).write_i16(0x0802);
        let out = record(n.normalize(&TelemetryData::new(MSP_OSD_CONFIG, raw.into_vec()), Some(&inav())));
        // code, version, driver, 3 bytes, 5 alarms, item count, 2 items
        assert_eq!(out.len(), 2 + 2 + 1 + 3 + 10 + 2 + 4);
        assert_eq!(&out[18..20], &[0x00, 0x02]);
        assert_eq!(&out[20..], &[0x08, 0x01, 0x08, 0x02]);
    }

    #[test]
    fn test_betaflight_status_core_temperature_gated_by_api() {
        let n = Normalizer::new(1);
        let mut raw = ByteWriter::new(Endian::Little);
        raw.write_i16(125).write_i16(0).write_i16(0x23);
        raw.write_u32(0x0000_0001).write_u8(0).write_i16(15).write_i16(0);
        raw.write_i8(1).write_u8(0x80);
        raw.write_u8(3).write_i32(0).write_u8(0).write_i16(45);
        let data = raw.into_vec();

        let with_temp = record(n.normalize(&TelemetryData::new(MSP_STATUS, data.clone()), Some(&betaflight())));
        let without = record(n.normalize(
            &TelemetryData::new(MSP_STATUS, data),
            Some(&identity(FcVariant::Betaflight, 1, 45)),
        ));
        assert_eq!(&with_temp[with_temp.len() - 2..], &[0x00, 0x2D]);
        assert_eq!(&without[without.len() - 2..], &[0x00, 0x00]);
        // mode flag block: size 5, inline word little-endian, extension byte
        assert_eq!(&with_temp[11..17], &[5, 0x01, 0x00, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_inav_status_mode_words() {
        let n = Normalizer::new(1);
        let mut raw = ByteWriter::new(Endian::Little);
        raw.write_i16(1000).write_i16(0).write_i16(0).write_i16(12).write_u8(0).write_i32(0);
        raw.write_u32(0x1).write_u32(0x2).write_u8(0);
        let out = record(n.normalize(&TelemetryData::new(MSP2_INAV_STATUS, raw.into_vec()), Some(&inav())));
        assert_eq!(out[15], 2);
        assert_eq!(&out[16..], &[0, 0, 0, 1, 0, 0, 0, 2]);
    }

    #[test]
    fn test_vtx_unknown_device_stops_early() {
        let n = Normalizer::new(1);
        let raw = TelemetryData::new(MSP_VTX_CONFIG, vec![VTXDEV_UNKNOWN, 1, 2, 3]);
        assert_eq!(record(n.normalize(&raw, Some(&inav()))), vec![0x00, 0x58, 0x00, 0xFF]);
    }

    #[tokio::test]
    async fn test_drain_empty_queues_produces_nothing() {
        let n = Normalizer::new(1);
        let (_fc, mut fc_rx) = TelemetryQueue::bounded(4);
        let (_dev, mut dev_rx) = TelemetryQueue::bounded(4);
        assert_eq!(n.drain(&mut fc_rx, &mut dev_rx, None, 1000), TelemetryBatch::default());
    }

    #[tokio::test]
    async fn test_drain_merges_both_queues_fully() {
        let n = Normalizer::new(1);
        let (fc, mut fc_rx) = TelemetryQueue::bounded(8);
        let (dev, mut dev_rx) = TelemetryQueue::bounded(8);
        for _ in 0..3 {
            fc.offer(MSP_ATTITUDE, vec![0; 6]);
        }
        dev.offer(DD_CAMERA_FPS, vec![30, 0]);
        fc.offer(DD_VIDEO_RECORDER_START_STOP, vec![0]);

        let batch = n.drain(&mut fc_rx, &mut dev_rx, Some(&inav()), 1000);
        assert_eq!(batch.recorder_toggles, 1);
        assert_eq!(batch.bodies.len(), 1);
        assert_eq!(batch.bodies[0].len(), 3 * 8 + 4);
        // FC and device records alternate
        assert_eq!(&batch.bodies[0][8..10], &[0x40, 0x02]);
    }

    #[tokio::test]
    async fn test_drain_splits_at_body_limit() {
        let n = Normalizer::new(1);
        let (fc, mut fc_rx) = TelemetryQueue::bounded(8);
        let (_dev, mut dev_rx) = TelemetryQueue::bounded(8);
        for _ in 0..5 {
            fc.offer(MSP_ATTITUDE, vec![0; 6]);
        }

        let batch = n.drain(&mut fc_rx, &mut dev_rx, Some(&inav()), 20);
        assert_eq!(batch.bodies.len(), 3);
        assert!(batch.bodies.iter().all(|body| body.len() <= 20));
        assert_eq!(batch.bodies.iter().map(Vec::len).sum::<usize>(), 40);
    }

    fn ardupilot() -> FcIdentity {
        identity(FcVariant::Ardupilot, 2, 3)
    }

    #[test]
    fn test_ap_attitude_reencoded_big_endian() {
        let n = Normalizer::new(1);
        let mut raw = ByteWriter::little_endian();
        raw.write_i16(100).write_i16(-50).write_i16(90);
        let raw = TelemetryData::new(DD_AP_ATTITUDE, raw.into_vec());
        let out = record(n.normalize(&raw, Some(&ardupilot())));
        assert_eq!(out, vec![0x40, 0x08, 0x00, 0x64, 0xFF, 0xCE, 0x00, 0x5A]);
    }

    #[test]
    fn test_ap_status_text() {
        let n = Normalizer::new(1);
        let mut raw = ByteWriter::little_endian();
        raw.write_u8(4).write_utf("GPS").unwrap();
        let raw = TelemetryData::new(DD_AP_STATUS_TEXT, raw.into_vec());
        let out = record(n.normalize(&raw, Some(&ardupilot())));
        assert_eq!(out, vec![0x40, 0x0C, 4, 0x00, 0x03, b'G', b'P', b'S']);
    }

    #[test]
    fn test_ap_osd_config_from_params() {
        use crate::mavlink::params::{test_support, FcParams, OSD_ITEMS};

        let mut params = FcParams::new();
        for (name, value) in test_support::all_values() {
            params.set(&name, value);
        }
        let raw = TelemetryData::new(DD_AP_OSD_CONFIG, params.osd_config_record().unwrap());
        let out = record(Normalizer::new(7).normalize(&raw, Some(&ardupilot())));

        let mut r = ByteReader::big_endian(&out);
        assert_eq!(r.read_u16().unwrap(), DD_AP_OSD_CONFIG);
        assert_eq!(r.read_i16().unwrap(), 7);
        assert!(r.read_bool().unwrap());
        r.skip(5).unwrap();
        assert_eq!(r.read_f32().unwrap(), 10.5);
        r.skip(5).unwrap();
        assert_eq!(usize::from(r.read_u8().unwrap()), OSD_ITEMS.len());
        assert_eq!(r.remaining(), OSD_ITEMS.len() * 3);
    }

    #[test]
    fn test_ap_global_position_truncated_skipped() {
        let n = Normalizer::new(1);
        let raw = TelemetryData::new(DD_AP_GLOBAL_POSITION_INT, vec![0; 20]);
        assert_eq!(n.normalize(&raw, Some(&ardupilot())), Normalized::Skipped);
    }

    #[test]
    fn test_ap_records_pass_through_sizes() {
        let n = Normalizer::new(1);
        for (code, len) in [
            (DD_AP_MODE, 2),
            (DD_AP_BATTERY_STATUS, 11),
            (DD_AP_SYS_STATUS, 4),
            (DD_AP_GPS_RAW_INT, 4),
            (DD_AP_GLOBAL_POSITION_INT, 24),
            (DD_AP_HOME_POSITION, 8),
            (DD_AP_SYSTEM_TIME, 12),
            (DD_AP_RC_CHANNELS, 1),
            (DD_AP_SCALED_PRESSURE, 2),
            (DD_AP_VTX_POWER, 2),
            (DD_AP_VFR_HUD, 1),
        ] {
            let raw = TelemetryData::new(code, vec![0; len]);
            let out = record(n.normalize(&raw, Some(&ardupilot())));
            assert_eq!(out.len(), 2 + len, "code 0x{:04X}", code);
        }
    }
}
