//! ArduPilot telemetry records
//!
//! Streamed messages are reduced to the few fields the ground OSD draws and
//! offered as little-endian `DD_AP_*` records. Distance travelled, distance
//! and bearing to home, arming time and flight time are derived here since
//! the autopilot does not stream them.

use ::mavlink::common::{MavMessage, MavModeFlag};
use tokio::time::Instant;

use crate::codec::ByteWriter;
use crate::error::Result;
use crate::msp::protocol::*;

/// Status text ArduPilot sends for streams it cannot serve
const NO_AP_MESSAGE_TEXT: &str = "No ap_message for mavlink";

/// Millivolts per cell used to guess the cell count
const CELL_DETECT_MV: f32 = 4100.0;

/// `GPS_FIX_TYPE_3D_FIX`; anything below is not trusted for distances
const GPS_FIX_3D: u8 = 3;

/// Ground speed (km/h) below which position jitter is not counted
const MIN_TRAVEL_SPEED_KMH: f32 = 0.2;

/// VFR_HUD throttle percentage that starts the flight timer
const FLIGHT_THROTTLE: u16 = 2;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Degrees from a 1e7-scaled integer coordinate
fn degrees(e7: i32) -> f64 {
    f64::from(e7) / 1e7
}

/// Great-circle distance in meters
pub fn distance_m(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lon1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lon2) = (to.0.to_radians(), to.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Initial bearing in degrees, -180..=180 with 0 at north
pub fn bearing_deg(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lon1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lon2) = (to.0.to_radians(), to.1.to_radians());
    let dlon = lon2 - lon1;
    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    y.atan2(x).to_degrees()
}

fn millis_between(from: Instant, to: Instant) -> i32 {
    i32::try_from(to.saturating_duration_since(from).as_millis()).unwrap_or(i32::MAX)
}

/// Derived flight state and record encoder
#[derive(Debug, Clone, Default)]
pub struct ApRecords {
    armed_at: Option<Instant>,
    flight_mark: Option<Instant>,
    flight_ms: i32,
    throttle: u16,
    cell_count: u8,
    fix_type: u8,
    ground_speed_kmh: f32,
    position: Option<(f64, f64)>,
    home: Option<(f64, f64)>,
    traveled_m: f64,
    distance_to_home_m: i32,
    direction_to_home_deg: f64,
}

impl ApRecords {
    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    /// Apply the armed bit of a heartbeat
    pub fn set_armed(&mut self, armed: bool, now: Instant) {
        if armed {
            self.armed_at.get_or_insert(now);
        } else {
            self.armed_at = None;
            self.flight_mark = None;
        }
    }

    /// `DD_AP_MODE` payload: custom mode (low byte) and armed flag
    pub fn mode_record(&self, custom_mode: u32, base_mode: MavModeFlag) -> (u16, Vec<u8>) {
        let armed = base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
        let mut w = ByteWriter::little_endian();
        w.write_u8(custom_mode as u8).write_bool(armed);
        (DD_AP_MODE, w.into_vec())
    }

    /// `DD_AP_VTX_POWER` payload for a `VTX_POWER` parameter value
    pub fn vtx_power_record(value: f32) -> (u16, Vec<u8>) {
        (DD_AP_VTX_POWER, (value.round() as i16).to_le_bytes().to_vec())
    }

    /// Update derived state and build the record for a streamed message
    ///
    /// Returns `Ok(None)` for messages without a record.
    pub fn record(&mut self, message: &MavMessage, now: Instant) -> Result<Option<(u16, Vec<u8>)>> {
        let mut w = ByteWriter::little_endian();
        let code = match message {
            MavMessage::ATTITUDE(m) => {
                w.write_i16((m.roll.to_degrees() * 10.0) as i16)
                    .write_i16((m.pitch.to_degrees() * -10.0) as i16)
                    .write_i16(m.yaw.to_degrees() as i16);
                DD_AP_ATTITUDE
            }
            MavMessage::BATTERY_STATUS(m) => {
                w.write_i16(m.current_battery)
                    .write_i32(m.current_consumed)
                    .write_i8(m.battery_remaining)
                    .write_u32(m.fault_bitmask.bits());
                DD_AP_BATTERY_STATUS
            }
            MavMessage::SYS_STATUS(m) => {
                if m.voltage_battery != u16::MAX {
                    let cells = (f32::from(m.voltage_battery) / CELL_DETECT_MV).round() as u8;
                    self.cell_count = self.cell_count.max(cells);
                }
                w.write_u8(self.cell_count)
                    .write_u16(m.voltage_battery)
                    .write_i8(m.battery_remaining);
                DD_AP_SYS_STATUS
            }
            MavMessage::STATUSTEXT(m) => {
                let end = m.text.iter().position(|&b| b == 0).unwrap_or(m.text.len());
                let text = String::from_utf8_lossy(&m.text[..end]);
                if text.contains(NO_AP_MESSAGE_TEXT) {
                    return Ok(None);
                }
                w.write_u8(m.severity as u8).write_utf(&text)?;
                DD_AP_STATUS_TEXT
            }
            MavMessage::GPS_RAW_INT(m) => {
                self.fix_type = m.fix_type as u8;
                if m.vel != u16::MAX {
                    self.ground_speed_kmh = f32::from(m.vel) * 0.036;
                }
                w.write_u8(m.fix_type as u8)
                    .write_u16(m.vel)
                    .write_u8(m.satellites_visible);
                DD_AP_GPS_RAW_INT
            }
            MavMessage::GLOBAL_POSITION_INT(m) => {
                self.update_position((degrees(m.lat), degrees(m.lon)));
                self.update_home_vector();
                w.write_i32(m.lat)
                    .write_i32(m.lon)
                    .write_i32(m.relative_alt)
                    .write_i16(m.vz)
                    .write_i32(self.traveled_m.round() as i32)
                    .write_i32(self.distance_to_home_m)
                    .write_i16(self.direction_to_home_deg.round() as i16);
                DD_AP_GLOBAL_POSITION_INT
            }
            MavMessage::HOME_POSITION(m) => {
                self.home = Some((degrees(m.latitude), degrees(m.longitude)));
                self.update_home_vector();
                w.write_i32(m.latitude).write_i32(m.longitude);
                DD_AP_HOME_POSITION
            }
            MavMessage::SYSTEM_TIME(m) => {
                let arming_ms = self.armed_at.map_or(0, |at| millis_between(at, now));
                if self.is_armed() {
                    match self.flight_mark {
                        None if self.throttle >= FLIGHT_THROTTLE => self.flight_mark = Some(now),
                        None => {}
                        Some(mark) => {
                            self.flight_ms = self.flight_ms.saturating_add(millis_between(mark, now));
                            self.flight_mark = Some(now);
                        }
                    }
                }
                w.write_u32(m.time_boot_ms)
                    .write_i32(self.flight_ms)
                    .write_i32(arming_ms);
                DD_AP_SYSTEM_TIME
            }
            MavMessage::RC_CHANNELS(m) => {
                w.write_u8(m.rssi);
                DD_AP_RC_CHANNELS
            }
            MavMessage::SCALED_PRESSURE(m) => {
                w.write_i16(m.temperature);
                DD_AP_SCALED_PRESSURE
            }
            MavMessage::VFR_HUD(m) => {
                self.throttle = m.throttle;
                w.write_u8(m.throttle as u8);
                DD_AP_VFR_HUD
            }
            _ => return Ok(None),
        };
        Ok(Some((code, w.into_vec())))
    }

    fn has_3d_fix(&self) -> bool {
        self.fix_type >= GPS_FIX_3D
    }

    fn update_position(&mut self, next: (f64, f64)) {
        if !self.has_3d_fix() {
            return;
        }
        if let Some(previous) = self.position {
            if self.ground_speed_kmh > MIN_TRAVEL_SPEED_KMH && self.is_armed() {
                self.traveled_m += distance_m(previous, next);
            }
        }
        self.position = Some(next);
    }

    fn update_home_vector(&mut self) {
        if !self.has_3d_fix() || !self.is_armed() {
            return;
        }
        let (Some(position), Some(home)) = (self.position, self.home) else {
            return;
        };
        self.distance_to_home_m = distance_m(position, home).round() as i32;
        self.direction_to_home_deg = bearing_deg(position, home);
    }
}
