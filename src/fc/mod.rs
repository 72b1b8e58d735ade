//! # Flight Controller Model
//!
//! Types shared by the MSP and MAVLink engines: the detected FC identity,
//! API compatibility, one-shot request kinds and the [`FlightController`]
//! seam the serial supervisor and command dispatcher talk to.

pub mod boxes;
pub mod timers;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Identifier string reported by iNav in `MSP_FC_VARIANT`
pub const INAV_ID: &str = "INAV";

/// Identifier string reported by Betaflight in `MSP_FC_VARIANT`
pub const BETAFLIGHT_ID: &str = "BTFL";

/// Maximum number of RC channels accepted from the ground station
pub const MAX_SUPPORTED_RC_CHANNEL_COUNT: usize = 18;

/// Poll loop base period for a telemetry refresh rate in Hz
pub fn poll_period(telemetry_hz: u8) -> Duration {
    Duration::from_millis(1000 / u64::from(telemetry_hz.max(1)))
}

/// Minimum spacing between two outbound RC frames (half the refresh period)
pub fn rc_min_period(rc_hz: u8) -> Duration {
    Duration::from_millis(1000 / u64::from(rc_hz.max(1)) / 2)
}

/// Permute ground RC channels through the FC-reported receiver map
///
/// Maps shorter than four entries are ignored. Any entry pointing outside
/// the channel list invalidates the whole map and the input is returned
/// unchanged.
pub fn remap_channels(channels: &[u16], rx_map: Option<&[u8]>) -> Vec<u16> {
    let Some(map) = rx_map.filter(|map| map.len() >= 4) else {
        return channels.to_vec();
    };
    if map.iter().any(|&target| usize::from(target) >= channels.len()) {
        return channels.to_vec();
    }

    let mut mapped = channels.to_vec();
    for (&target, &value) in map.iter().zip(channels) {
        mapped[usize::from(target)] = value;
    }
    mapped
}

/// Firmware family of the attached flight controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FcVariant {
    #[default]
    Unknown,
    /// iNav (MSP, bitmask-array mode flags)
    Inav,
    /// Betaflight (MSP, paged box lists, byte mode flags)
    Betaflight,
    /// ArduPilot (MAVLink)
    Ardupilot,
}

impl FcVariant {
    /// Map an `MSP_FC_VARIANT` identifier to a variant
    pub fn from_identifier(id: &str) -> Self {
        match id {
            INAV_ID => FcVariant::Inav,
            BETAFLIGHT_ID => FcVariant::Betaflight,
            _ => FcVariant::Unknown,
        }
    }

    /// Wire value used in `FcInfo` replies
    pub fn as_u8(self) -> u8 {
        match self {
            FcVariant::Unknown => 0,
            FcVariant::Inav => 1,
            FcVariant::Betaflight => 2,
            FcVariant::Ardupilot => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FcVariant::Unknown => "UNKNOWN",
            FcVariant::Inav => "INAV",
            FcVariant::Betaflight => "BETAFLIGHT",
            FcVariant::Ardupilot => "ARDUPILOT",
        }
    }
}

/// Firmware version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Protocol / API version reported by the FC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion {
    pub protocol: u8,
    pub major: u8,
    pub minor: u8,
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.protocol, self.major, self.minor)
    }
}

const SUPPORTED_API_INAV: &[ApiVersion] = &[ApiVersion { protocol: 0, major: 2, minor: 5 }];
const SUPPORTED_API_BETAFLIGHT: &[ApiVersion] = &[
    ApiVersion { protocol: 0, major: 1, minor: 45 },
    ApiVersion { protocol: 0, major: 1, minor: 46 },
];
const SUPPORTED_API_ARDUPILOT: &[ApiVersion] = &[ApiVersion { protocol: 0, major: 2, minor: 3 }];

/// How well the detected FC API matches the versions this link was built against
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApiCompatibility {
    Unknown,
    Error,
    Warning,
    Ok,
}

impl ApiCompatibility {
    /// Poll requests and RC frames are only written at `Ok` or `Warning`
    pub fn allows_requests(self) -> bool {
        matches!(self, ApiCompatibility::Ok | ApiCompatibility::Warning)
    }
}

/// Fully discovered flight controller identity
///
/// Only built once every discovery field is known, so holders never see a
/// half-populated identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcIdentity {
    pub variant: FcVariant,
    pub firmware: FirmwareVersion,
    pub api: ApiVersion,
    /// Mixer (Betaflight) or platform (iNav, MAVLink vehicle type)
    pub platform: u8,
}

impl FcIdentity {
    pub fn compatibility(&self) -> ApiCompatibility {
        let supported = match self.variant {
            FcVariant::Inav => SUPPORTED_API_INAV,
            FcVariant::Betaflight => SUPPORTED_API_BETAFLIGHT,
            FcVariant::Ardupilot => SUPPORTED_API_ARDUPILOT,
            FcVariant::Unknown => return ApiCompatibility::Unknown,
        };

        let mut level = ApiCompatibility::Unknown;
        for version in supported {
            if self.api.protocol == version.protocol && self.api.major == version.major {
                if self.api.minor == version.minor {
                    return ApiCompatibility::Ok;
                }
                level = ApiCompatibility::Warning;
            } else if level < ApiCompatibility::Error {
                level = ApiCompatibility::Error;
            }
        }
        level
    }

    /// True when the API version is strictly newer than `major.minor`
    pub fn api_newer_than(&self, major: u8, minor: u8) -> bool {
        (self.api.major, self.api.minor) > (major, minor)
    }

    /// `FcInfo` reply body: variant, firmware triple, protocol, API major/minor
    pub fn to_info_bytes(&self) -> [u8; 7] {
        [
            self.variant.as_u8(),
            self.firmware.major,
            self.firmware.minor,
            self.firmware.patch,
            self.api.protocol,
            self.api.major,
            self.api.minor,
        ]
    }
}

/// Identity fields as they trickle in during discovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialIdentity {
    pub variant: FcVariant,
    pub firmware: Option<FirmwareVersion>,
    pub api: Option<ApiVersion>,
    pub platform: Option<u8>,
}

impl PartialIdentity {
    pub fn complete(&self) -> Option<FcIdentity> {
        if self.variant == FcVariant::Unknown {
            return None;
        }
        Some(FcIdentity {
            variant: self.variant,
            firmware: self.firmware?,
            api: self.api?,
            platform: self.platform?,
        })
    }
}

/// Protocol engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// Poll loop never started
    Uninitialized,
    /// Collecting identity fields
    Discovering,
    /// Identity known, running the telemetry schedule
    Polling,
}

/// Ground-triggered requests that are re-issued until a full answer arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneShotRequest {
    OsdConfig,
    BatteryConfig,
    BoxIds,
    BoxNames,
}

/// Protocol engine driving one flight controller
///
/// Implemented by the MSP and MAVLink engines. The serial supervisor feeds
/// raw byte runs through [`FlightController::process_data`] and owns the
/// poll task started with [`FlightController::run`].
#[async_trait]
pub trait FlightController: Send + Sync {
    /// Parse one raw byte run read from the serial port
    fn process_data(&self, data: &[u8]);

    /// Snapshot of the identity, `None` until discovery completes
    fn identity(&self) -> Option<FcIdentity>;

    fn is_initialized(&self) -> bool {
        self.identity().is_some()
    }

    /// Arm a one-shot request; ignored until the FC is initialized
    fn request(&self, request: OneShotRequest);

    /// Forward ground RC channel values (microseconds)
    fn set_raw_rc(&self, channels: &[u16]);

    /// Apply new poll and RC refresh rates (Hz); the RC limiter restarts
    fn set_refresh_rates(&self, telemetry_hz: u8, rc_hz: u8);

    /// Discard identity and discovery state after a link error
    fn reset(&self);

    /// Stop FC-side streams before the port closes
    fn close(&self) {}

    /// Poll loop; returns when `cancel` fires
    async fn run(&self, cancel: CancellationToken);
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Flight controller stand-in that records what the link asks of it
    #[derive(Default)]
    pub struct FakeFc {
        pub identity: Option<FcIdentity>,
        pub requests: Mutex<Vec<OneShotRequest>>,
        pub rc: Mutex<Vec<Vec<u16>>>,
        pub rates: Mutex<Vec<(u8, u8)>>,
    }

    impl FakeFc {
        pub fn identified(identity: FcIdentity) -> Self {
            Self {
                identity: Some(identity),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl FlightController for FakeFc {
        fn process_data(&self, _data: &[u8]) {}

        fn identity(&self) -> Option<FcIdentity> {
            self.identity
        }

        fn request(&self, request: OneShotRequest) {
            self.requests.lock().unwrap().push(request);
        }

        fn set_raw_rc(&self, channels: &[u16]) {
            self.rc.lock().unwrap().push(channels.to_vec());
        }

        fn set_refresh_rates(&self, telemetry_hz: u8, rc_hz: u8) {
            self.rates.lock().unwrap().push((telemetry_hz, rc_hz));
        }

        fn reset(&self) {}

        async fn run(&self, cancel: CancellationToken) {
            cancel.cancelled().await;
        }
    }
}
