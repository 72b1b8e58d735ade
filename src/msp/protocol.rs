//! # MSP Protocol Constants
//!
//! Frame markers and message codes for MultiWii Serial Protocol v1/v2,
//! plus the device-origin codes that share the telemetry code space.

/// Frame start byte (`$`)
pub const MSP_START: u8 = b'$';

/// MSP v1 magic (`M`)
pub const MSP_V1_MAGIC: u8 = b'M';

/// MSP v2 magic (`X`)
pub const MSP_V2_MAGIC: u8 = b'X';

/// Direction byte of a request sent to the FC (`<`)
pub const MSP_DIRECTION_REQUEST: u8 = b'<';

/// Direction byte of an FC response (`>`)
pub const MSP_DIRECTION_RESPONSE: u8 = b'>';

/// Direction byte of an FC error reply (`!`)
pub const MSP_DIRECTION_ERROR: u8 = b'!';

/// `$ M dir len code`
pub const MSP_V1_HEADER_LEN: usize = 5;

/// `$ X dir flag code(2) len(2)`
pub const MSP_V2_HEADER_LEN: usize = 8;

/// Byte runs this short cannot hold a frame and are ignored
pub const MSP_MIN_RUN_LEN: usize = MSP_V1_HEADER_LEN + 1;

pub const MSP_API_VERSION: u16 = 1;
pub const MSP_FC_VARIANT: u16 = 2;
pub const MSP_FC_VERSION: u16 = 3;
pub const MSP_BATTERY_CONFIG: u16 = 32;
pub const MSP_MIXER_CONFIG: u16 = 42;
pub const MSP_RX_MAP: u16 = 64;
pub const MSP_OSD_CONFIG: u16 = 84;
pub const MSP_VTX_CONFIG: u16 = 88;
pub const MSP_STATUS: u16 = 101;
pub const MSP_RAW_GPS: u16 = 106;
pub const MSP_COMP_GPS: u16 = 107;
pub const MSP_ATTITUDE: u16 = 108;
pub const MSP_ALTITUDE: u16 = 109;
pub const MSP_ANALOG: u16 = 110;
pub const MSP_BOXNAMES: u16 = 116;
pub const MSP_BOXIDS: u16 = 119;
pub const MSP_BATTERY_STATE: u16 = 130;
pub const MSP_OSD_CANVAS: u16 = 189;
pub const MSP_SET_RAW_RC: u16 = 200;

pub const MSP2_INAV_STATUS: u16 = 0x2000;
pub const MSP2_INAV_ANALOG: u16 = 0x2002;
pub const MSP2_INAV_MIXER: u16 = 0x2010;

/// Start of the device-origin code range; lower codes need a known FC
pub const DD_TIMERS: u16 = 0x4000;
pub const DD_PHONE_BATTERY_STATE: u16 = 0x4001;
pub const DD_CAMERA_FPS: u16 = 0x4002;
pub const DD_VIDEO_BIT_RATE: u16 = 0x4003;
pub const DD_VIDEO_RECORDER_STATE: u16 = 0x4004;
/// Synthetic record raised by the camera-switch edge detector
pub const DD_VIDEO_RECORDER_START_STOP: u16 = 0x4005;

// ArduPilot records built by the MAVLink engine
pub const DD_AP_OSD_CONFIG: u16 = 0x4007;
pub const DD_AP_ATTITUDE: u16 = 0x4008;
pub const DD_AP_MODE: u16 = 0x4009;
pub const DD_AP_BATTERY_STATUS: u16 = 0x400A;
pub const DD_AP_SYS_STATUS: u16 = 0x400B;
pub const DD_AP_STATUS_TEXT: u16 = 0x400C;
pub const DD_AP_GPS_RAW_INT: u16 = 0x400D;
pub const DD_AP_GLOBAL_POSITION_INT: u16 = 0x400E;
pub const DD_AP_HOME_POSITION: u16 = 0x400F;
pub const DD_AP_SYSTEM_TIME: u16 = 0x4010;
pub const DD_AP_RC_CHANNELS: u16 = 0x4011;
pub const DD_AP_SCALED_PRESSURE: u16 = 0x4012;
pub const DD_AP_VTX_POWER: u16 = 0x4013;
pub const DD_AP_VFR_HUD: u16 = 0x4014;

/// Betaflight splits box names/ids over at most this many pages
pub const BF_BOXMODES_PAGE_COUNT: usize = 2;

/// VTX device id meaning "no VTX configured"
pub const VTXDEV_UNKNOWN: u8 = 0xFF;
