//! # Configuration Module
//!
//! Handles loading and validating the process configuration from TOML files,
//! and applying configuration blobs pushed by the ground station.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{info, warn};

use crate::codec::ByteReader;
use crate::error::{AirLinkError, Result};

/// Default datagram port
pub const DEFAULT_LINK_PORT: u16 = 6286;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub serial: SerialConfig,
    pub fc: FcConfig,
    pub link: LinkConfig,
    pub video: VideoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Flight controller protocol selection
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FcProtocol {
    /// MAVLink for ArduPilot USB devices, MSP otherwise
    #[default]
    Auto,
    Msp,
    Mavlink,
}

impl FcProtocol {
    /// Decode the protocol byte of a config blob
    pub fn from_code(code: i8) -> Self {
        match code {
            1 => FcProtocol::Msp,
            2 => FcProtocol::Mavlink,
            _ => FcProtocol::Auto,
        }
    }
}

/// Datagram topology
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Wait for the ground station to connect to us
    #[default]
    Direct,
    /// Announce ourselves to a relay until it pairs us with a ground station
    Relay,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Fixed device path; empty means auto-detect USB devices
    #[serde(default)]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,

    #[serde(default)]
    pub protocol: FcProtocol,
}

/// Flight controller polling configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FcConfig {
    #[serde(default = "default_telemetry_rate_hz")]
    pub telemetry_rate_hz: u8,

    #[serde(default = "default_rc_rate_hz")]
    pub rc_rate_hz: u8,

    #[serde(default = "default_mavlink_target_sys_id")]
    pub mavlink_target_sys_id: u8,

    #[serde(default = "default_mavlink_gcs_sys_id")]
    pub mavlink_gcs_sys_id: u8,
}

/// Datagram link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default)]
    pub mode: LinkMode,

    /// Relay `host:port`; unused in direct mode
    #[serde(default)]
    pub address: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    #[serde(default = "default_key")]
    pub key: String,

    #[serde(default = "default_version_code")]
    pub version_code: i16,
}

/// Video and audio configuration
#[derive(Debug, Deserialize, Clone)]
pub struct VideoConfig {
    /// Highest bitrate step in bit/s; 0 means unlimited
    #[serde(default = "default_bitrate_limit")]
    pub bitrate_limit: u32,

    #[serde(default)]
    pub send_audio: bool,

    #[serde(default = "default_record_audio")]
    pub record_audio: bool,

    #[serde(default = "default_camera_id")]
    pub camera_id: String,

    #[serde(default = "default_width")]
    pub width: u16,

    #[serde(default = "default_height")]
    pub height: u16,

    #[serde(default = "default_fps_min")]
    pub fps_min: u16,

    #[serde(default = "default_fps_max")]
    pub fps_max: u16,
}

/// Log output configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files; stdout only when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

// Default value functions
fn default_baud_rate() -> u32 { 115_200 }
fn default_read_timeout_ms() -> u64 { 100 }
fn default_rescan_interval_ms() -> u64 { 2000 }

fn default_telemetry_rate_hz() -> u8 { 10 }
fn default_rc_rate_hz() -> u8 { 25 }
fn default_mavlink_target_sys_id() -> u8 { 1 }
fn default_mavlink_gcs_sys_id() -> u8 { 255 }

fn default_bind_port() -> u16 { DEFAULT_LINK_PORT }
fn default_key() -> String { "DD".to_string() }
fn default_version_code() -> i16 { 1 }

fn default_bitrate_limit() -> u32 { 6_000_000 }
fn default_record_audio() -> bool { true }
fn default_camera_id() -> String { "0".to_string() }
fn default_width() -> u16 { 1920 }
fn default_height() -> u16 { 1080 }
fn default_fps_min() -> u16 { 30 }
fn default_fps_max() -> u16 { 60 }

/// Highest accepted telemetry poll rate
pub const MAX_TELEMETRY_RATE_HZ: u8 = 50;

/// Highest accepted RC forward rate
pub const MAX_RC_RATE_HZ: u8 = 100;

fn invalid(message: impl std::fmt::Display) -> AirLinkError {
    AirLinkError::Config(toml::de::Error::custom(message))
}

fn check_rates(telemetry_hz: u8, rc_hz: u8) -> std::result::Result<(), String> {
    if telemetry_hz == 0 || telemetry_hz > MAX_TELEMETRY_RATE_HZ {
        return Err(format!(
            "telemetry_rate_hz must be between 1 and {}",
            MAX_TELEMETRY_RATE_HZ
        ));
    }
    if rc_hz == 0 || rc_hz > MAX_RC_RATE_HZ {
        return Err(format!("rc_rate_hz must be between 1 and {}", MAX_RC_RATE_HZ));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fpv_air_link::config::Config;
    ///
    /// let config = Config::load("config/air-link.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.link.key.is_empty() {
            return Err(invalid("link key cannot be empty"));
        }

        if self.link.bind_port < 1024 {
            return Err(invalid("bind_port must be between 1024 and 65535"));
        }

        if self.link.mode == LinkMode::Relay && self.link.address.is_empty() {
            return Err(invalid("relay mode requires a link address"));
        }

        check_rates(self.fc.telemetry_rate_hz, self.fc.rc_rate_hz).map_err(invalid)?;

        if self.serial.baud_rate == 0 {
            return Err(invalid("baud_rate must be greater than 0"));
        }

        if self.serial.read_timeout_ms == 0 || self.serial.read_timeout_ms > 10000 {
            return Err(invalid("read_timeout_ms must be between 1 and 10000"));
        }

        if self.serial.rescan_interval_ms == 0 || self.serial.rescan_interval_ms > 60000 {
            return Err(invalid("rescan_interval_ms must be between 1 and 60000"));
        }

        if self.video.fps_min > self.video.fps_max {
            return Err(invalid("fps_min must not exceed fps_max"));
        }

        Ok(())
    }
}

/// Why a config blob was not applied
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigBlobError {
    #[error("version mismatch: expected {expected}, received {received}")]
    VersionMismatch { expected: i16, received: i16 },

    #[error("malformed config blob: {0}")]
    Malformed(String),
}

/// Configuration pushed by the ground station (packet kind `Config`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlob {
    pub camera_id: String,
    pub width: i16,
    pub height: i16,
    pub fps_min: i16,
    pub fps_max: i16,
    /// bit/s
    pub bitrate_limit: u32,
    pub use_extra_encoder: bool,
    pub recorder_codec: i8,
    /// bit/s
    pub recorded_bitrate: u32,
    pub send_audio: bool,
    /// bit/s
    pub audio_bitrate: i32,
    pub record_audio: bool,
    /// bit/s
    pub recorded_audio_bitrate: i32,
    pub telemetry_rate_hz: u8,
    pub rc_rate_hz: u8,
    pub baud_rate: i32,
    pub usb_port_index: i8,
    pub use_native_port: bool,
    pub native_port: String,
    pub fc_protocol: FcProtocol,
    pub use_usb_camera: bool,
    pub usb_frame_format: i8,
    pub usb_camera_reset: bool,
    pub mavlink_target_sys_id: u8,
    pub mavlink_gcs_sys_id: u8,
}

impl ConfigBlob {
    /// Decode a big-endian blob, checking its version first
    ///
    /// # Errors
    ///
    /// `VersionMismatch` when the leading version differs from
    /// `expected_version`, `Malformed` when a field is missing or a rate is
    /// out of range.
    pub fn decode(data: &[u8], expected_version: i16) -> std::result::Result<Self, ConfigBlobError> {
        let mut reader = ByteReader::big_endian(data);
        let received = reader
            .read_i16()
            .map_err(|e| ConfigBlobError::Malformed(e.to_string()))?;
        if received != expected_version {
            return Err(ConfigBlobError::VersionMismatch {
                expected: expected_version,
                received,
            });
        }
        let blob = Self::decode_fields(&mut reader).map_err(|e| ConfigBlobError::Malformed(e.to_string()))?;
        check_rates(blob.telemetry_rate_hz, blob.rc_rate_hz).map_err(ConfigBlobError::Malformed)?;
        Ok(blob)
    }

    fn decode_fields(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            camera_id: reader.read_utf()?,
            width: reader.read_i16()?,
            height: reader.read_i16()?,
            fps_min: reader.read_i16()?,
            fps_max: reader.read_i16()?,
            bitrate_limit: u32::from(reader.read_u8()?) * 1_000_000,
            use_extra_encoder: reader.read_bool()?,
            recorder_codec: reader.read_i8()?,
            recorded_bitrate: u32::from(reader.read_u8()?) * 1_000_000,
            send_audio: reader.read_bool()?,
            audio_bitrate: i32::from(reader.read_i16()?) * 1000,
            record_audio: reader.read_bool()?,
            recorded_audio_bitrate: i32::from(reader.read_i16()?) * 1000,
            telemetry_rate_hz: reader.read_u8()?,
            rc_rate_hz: reader.read_u8()?,
            baud_rate: reader.read_i32()?,
            usb_port_index: reader.read_i8()?,
            use_native_port: reader.read_bool()?,
            native_port: reader.read_utf()?,
            fc_protocol: FcProtocol::from_code(reader.read_i8()?),
            use_usb_camera: reader.read_bool()?,
            usb_frame_format: reader.read_i8()?,
            usb_camera_reset: reader.read_bool()?,
            mavlink_target_sys_id: reader.read_u8()?,
            mavlink_gcs_sys_id: reader.read_u8()?,
        })
    }
}

/// Result of applying a config blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOutcome {
    Applied,
    VersionMismatch,
    Malformed,
}

/// Camera parameters handed to the media pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    pub camera_id: String,
    pub width: u16,
    pub height: u16,
    pub fps_min: u16,
    pub fps_max: u16,
}

/// Settings that the ground station can change at runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsSnapshot {
    pub telemetry_rate_hz: u8,
    pub rc_rate_hz: u8,
    /// bit/s, 0 = unlimited
    pub bitrate_limit: u32,
    pub send_audio: bool,
    pub record_audio: bool,
    pub camera: CameraSettings,
}

/// Shared runtime settings, seeded from [`Config`]
#[derive(Debug)]
pub struct RuntimeSettings {
    version_code: i16,
    values: Mutex<SettingsSnapshot>,
}

impl RuntimeSettings {
    pub fn new(config: &Config) -> Self {
        Self {
            version_code: config.link.version_code,
            values: Mutex::new(SettingsSnapshot {
                telemetry_rate_hz: config.fc.telemetry_rate_hz,
                rc_rate_hz: config.fc.rc_rate_hz,
                bitrate_limit: config.video.bitrate_limit,
                send_audio: config.video.send_audio,
                record_audio: config.video.record_audio,
                camera: CameraSettings {
                    camera_id: config.video.camera_id.clone(),
                    width: config.video.width,
                    height: config.video.height,
                    fps_min: config.video.fps_min,
                    fps_max: config.video.fps_max,
                },
            }),
        }
    }

    pub fn version_code(&self) -> i16 {
        self.version_code
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Decode and apply a ground-pushed blob; nothing changes unless `Applied`
    pub fn apply_blob(&self, data: &[u8]) -> ConfigOutcome {
        let blob = match ConfigBlob::decode(data, self.version_code) {
            Ok(blob) => blob,
            Err(ConfigBlobError::VersionMismatch { expected, received }) => {
                warn!("Config blob version {} rejected, expected {}", received, expected);
                return ConfigOutcome::VersionMismatch;
            }
            Err(e) => {
                warn!("{}", AirLinkError::from(e));
                return ConfigOutcome::Malformed;
            }
        };

        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.telemetry_rate_hz = blob.telemetry_rate_hz;
        values.rc_rate_hz = blob.rc_rate_hz;
        values.bitrate_limit = blob.bitrate_limit;
        values.send_audio = blob.send_audio;
        values.record_audio = blob.record_audio;
        values.camera = CameraSettings {
            camera_id: blob.camera_id,
            width: u16::try_from(blob.width).unwrap_or(values.camera.width),
            height: u16::try_from(blob.height).unwrap_or(values.camera.height),
            fps_min: u16::try_from(blob.fps_min).unwrap_or(values.camera.fps_min),
            fps_max: u16::try_from(blob.fps_max).unwrap_or(values.camera.fps_max),
        };
        info!(
            "Config applied: telemetry {} Hz, RC {} Hz, bitrate limit {} bit/s",
            values.telemetry_rate_hz, values.rc_rate_hz, values.bitrate_limit
        );
        ConfigOutcome::Applied
    }
}
