//! ArduPilot parameters read with `PARAM_REQUEST_READ`
//!
//! The link needs the stick channel map (`RCMAP_*`), the RC switch options
//! (`RCn_OPTION`) and the OSD layout. Values arrive one `PARAM_VALUE` at a
//! time, in any order, and requests are repeated until every name is known.

use std::collections::HashMap;

use crate::codec::ByteWriter;
use crate::error::{AirLinkError, Result};

/// Length of the fixed `param_id` field
pub const PARAM_ID_LEN: usize = 16;

pub const RCMAP_ROLL: &str = "RCMAP_ROLL";
pub const RCMAP_PITCH: &str = "RCMAP_PITCH";
pub const RCMAP_YAW: &str = "RCMAP_YAW";
pub const RCMAP_THROTTLE: &str = "RCMAP_THROTTLE";

/// Polled every handshake period, never stored
pub const VTX_POWER: &str = "VTX_POWER";

/// `RCn_OPTION` value of the "camera record video" switch
pub const RC_OPTION_CAMERA_RECORD_VIDEO: i16 = 166;

/// Number of `RCn_OPTION` parameters (RC1..RC16)
const RC_OPTION_COUNT: usize = 16;

/// OSD screen settings, in record order
const OSD_SETTINGS: [&str; 9] = [
    "OSD1_ENABLE",
    "OSD1_TXT_RES",
    "OSD_UNITS",
    "OSD_MSG_TIME",
    "OSD_W_RSSI",
    "OSD_W_NSAT",
    "OSD_W_BATVOLT",
    "OSD_W_AVGCELLV",
    "OSD_CELL_COUNT",
];

/// OSD1 items the ground station can draw, in record order
pub const OSD_ITEMS: [&str; 26] = [
    "ALTITUDE", "BAT_VOLT", "RSSI", "CURRENT", "BATUSED", "SATS", "FLTMODE", "MESSAGE",
    "GSPEED", "HORIZON", "HOME", "HEADING", "THROTTLE", "COMPASS", "DIST", "FLTIME",
    "EFF", "TEMP", "GPSLAT", "GPSLONG", "HOMEDIST", "HOMEDIR", "CELLVOLT", "SIDEBARS",
    "CRSSHAIR", "VTX_PWR",
];

/// Pack a parameter name into the NUL-padded `param_id` field
///
/// # Errors
///
/// Returns `Protocol` for an empty, non-ASCII or over-long name.
pub fn encode_param_id(name: &str) -> Result<[u8; PARAM_ID_LEN]> {
    if name.is_empty() || name.len() > PARAM_ID_LEN || !name.is_ascii() {
        return Err(AirLinkError::Protocol(format!("invalid parameter name {:?}", name)));
    }
    let mut id = [0u8; PARAM_ID_LEN];
    id[..name.len()].copy_from_slice(name.as_bytes());
    Ok(id)
}

/// Parameter name up to the first NUL; `None` if it is not UTF-8
pub fn decode_param_id(id: &[u8; PARAM_ID_LEN]) -> Option<&str> {
    let end = id.iter().position(|&b| b == 0).unwrap_or(PARAM_ID_LEN);
    std::str::from_utf8(&id[..end]).ok()
}

fn rc_option_name(channel: usize) -> String {
    format!("RC{}_OPTION", channel + 1)
}

/// Parameter values collected from the autopilot
#[derive(Debug, Clone)]
pub struct FcParams {
    wanted: Vec<String>,
    values: HashMap<String, f32>,
}

impl Default for FcParams {
    fn default() -> Self {
        Self::new()
    }
}

impl FcParams {
    pub fn new() -> Self {
        let mut wanted: Vec<String> = [RCMAP_ROLL, RCMAP_PITCH, RCMAP_YAW, RCMAP_THROTTLE]
            .iter()
            .map(|name| name.to_string())
            .collect();
        wanted.extend((0..RC_OPTION_COUNT).map(rc_option_name));
        wanted.extend(OSD_SETTINGS.iter().map(|name| name.to_string()));
        for item in OSD_ITEMS {
            for suffix in ["EN", "X", "Y"] {
                wanted.push(format!("OSD1_{}_{}", item, suffix));
            }
        }
        Self {
            wanted,
            values: HashMap::new(),
        }
    }

    /// Store a received value; `false` for names the link does not track
    pub fn set(&mut self, name: &str, value: f32) -> bool {
        if !self.wanted.iter().any(|wanted| wanted == name) {
            return false;
        }
        self.values.insert(name.to_string(), value);
        true
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.values.get(name).copied()
    }

    /// Names still waiting for a value, in request order
    pub fn missing(&self) -> impl Iterator<Item = &str> {
        self.wanted
            .iter()
            .filter(|name| !self.values.contains_key(name.as_str()))
            .map(String::as_str)
    }

    pub fn is_complete(&self) -> bool {
        self.missing().next().is_none()
    }

    /// Zero-based target channel of roll, pitch, yaw and throttle
    ///
    /// `None` until all four `RCMAP_*` values arrived, or when one of them
    /// is not a valid 1-based channel.
    pub fn rc_map(&self) -> Option<[u8; 4]> {
        let mut map = [0u8; 4];
        for (slot, name) in map.iter_mut().zip([RCMAP_ROLL, RCMAP_PITCH, RCMAP_YAW, RCMAP_THROTTLE]) {
            let channel = self.get(name)? as i32 - 1;
            *slot = u8::try_from(channel).ok()?;
        }
        Some(map)
    }

    /// True once every `RCn_OPTION` value is known
    pub fn rc_options_known(&self) -> bool {
        (0..RC_OPTION_COUNT).all(|channel| self.values.contains_key(&rc_option_name(channel)))
    }

    /// Zero-based channel of the first switch assigned `option`
    pub fn option_channel(&self, option: i16) -> Option<usize> {
        (0..RC_OPTION_COUNT).find(|&channel| {
            self.get(&rc_option_name(channel))
                .is_some_and(|value| value as i16 == option)
        })
    }

    /// Little-endian `DD_AP_OSD_CONFIG` payload; `None` until complete
    ///
    /// Layout: enabled bool, text resolution, units, message time, RSSI
    /// warning, satellite warning, battery volt warning f32, average cell
    /// warning f32, cell count, item count, then per item enabled bool, x, y.
    pub fn osd_config_record(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let byte = |name: &str| self.get(name).map_or(0, |value| value as i32 as u8);
        let mut w = ByteWriter::little_endian();
        w.write_bool(byte("OSD1_ENABLE") != 0)
            .write_u8(byte("OSD1_TXT_RES"))
            .write_u8(byte("OSD_UNITS"))
            .write_u8(byte("OSD_MSG_TIME"))
            .write_u8(byte("OSD_W_RSSI"))
            .write_u8(byte("OSD_W_NSAT"))
            .write_f32(self.get("OSD_W_BATVOLT").unwrap_or_default())
            .write_f32(self.get("OSD_W_AVGCELLV").unwrap_or_default())
            .write_u8(byte("OSD_CELL_COUNT"))
            .write_u8(OSD_ITEMS.len() as u8);
        for item in OSD_ITEMS {
            w.write_bool(byte(&format!("OSD1_{}_EN", item)) != 0)
                .write_u8(byte(&format!("OSD1_{}_X", item)))
                .write_u8(byte(&format!("OSD1_{}_Y", item)));
        }
        Some(w.into_vec())
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Every tracked name with a plausible value
    pub fn all_values() -> Vec<(String, f32)> {
        FcParams::new()
            .missing()
            .map(|name| {
                let value = match name {
                    RCMAP_ROLL => 1.0,
                    RCMAP_PITCH => 2.0,
                    RCMAP_THROTTLE => 3.0,
                    RCMAP_YAW => 4.0,
                    "OSD1_ENABLE" => 1.0,
                    "OSD_W_BATVOLT" => 10.5,
                    _ => 0.0,
                };
                (name.to_string(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteReader;

    #[test]
    fn test_param_id_round_trip() {
        let id = encode_param_id("RCMAP_ROLL").unwrap();
        assert_eq!(&id[..10], b"RCMAP_ROLL");
        assert!(id[10..].iter().all(|&b| b == 0));
        assert_eq!(decode_param_id(&id), Some("RCMAP_ROLL"));

        // Full-width names have no terminator
        let full = encode_param_id("OSD1_HOMEDIST_EN").unwrap();
        assert_eq!(decode_param_id(&full), Some("OSD1_HOMEDIST_EN"));
    }

    #[test]
    fn test_param_id_rejects_bad_names() {
        assert!(encode_param_id("").is_err());
        assert!(encode_param_id("OSD1_CRSSHAIR_EN_X").is_err());
    }

    #[test]
    fn test_untracked_names_ignored() {
        let mut params = FcParams::new();
        assert!(!params.set("BATT_MONITOR", 4.0));
        assert!(params.set(RCMAP_ROLL, 1.0));
        assert_eq!(params.get(RCMAP_ROLL), Some(1.0));
    }

    #[test]
    fn test_rc_map_needs_all_four() {
        let mut params = FcParams::new();
        params.set(RCMAP_ROLL, 1.0);
        params.set(RCMAP_PITCH, 2.0);
        params.set(RCMAP_THROTTLE, 3.0);
        assert_eq!(params.rc_map(), None);

        params.set(RCMAP_YAW, 4.0);
        assert_eq!(params.rc_map(), Some([0, 1, 3, 2]));

        params.set(RCMAP_YAW, 0.0);
        assert_eq!(params.rc_map(), None);
    }

    #[test]
    fn test_option_channel() {
        let mut params = FcParams::new();
        assert!(!params.rc_options_known());
        for channel in 0..RC_OPTION_COUNT {
            let value = if channel == 6 { 166.0 } else { 0.0 };
            params.set(&rc_option_name(channel), value);
        }
        assert!(params.rc_options_known());
        assert_eq!(params.option_channel(RC_OPTION_CAMERA_RECORD_VIDEO), Some(6));
        assert_eq!(params.option_channel(41), None);
    }

    #[test]
    fn test_osd_config_record() {
        let mut params = FcParams::new();
        assert!(params.osd_config_record().is_none());
        for (name, value) in test_support::all_values() {
            params.set(&name, value);
        }
        params.set("OSD1_ALTITUDE_EN", 1.0);
        params.set("OSD1_ALTITUDE_X", 23.0);
        params.set("OSD1_ALTITUDE_Y", 9.0);
        assert!(params.is_complete());

        let record = params.osd_config_record().unwrap();
        assert_eq!(record.len(), 6 + 8 + 2 + OSD_ITEMS.len() * 3);

        let mut r = ByteReader::little_endian(&record);
        assert!(r.read_bool().unwrap());
        r.skip(5).unwrap();
        assert_eq!(r.read_f32().unwrap(), 10.5);
        r.skip(5).unwrap();
        assert_eq!(r.read_u8().unwrap(), OSD_ITEMS.len() as u8);
        // ALTITUDE is the first item
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u8().unwrap(), 23);
        assert_eq!(r.read_u8().unwrap(), 9);
    }
}
