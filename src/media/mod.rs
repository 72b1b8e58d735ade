//! # Media Collaborators
//!
//! Seams to the camera/encoder pipeline, the on-board recorder and device
//! status. Capture and hardware encoding live outside this crate; the link
//! only consumes encoded frames and a few status values.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CameraSettings;
use crate::error::{AirLinkError, Result};

/// Encoder output queue depth; producers drop frames when it is full
pub const FRAME_QUEUE_CAPACITY: usize = 30;

/// Video bitrate presets in bit/s
pub const BITRATE_LADDER: [u32; 10] = [
    250_000, 500_000, 1_000_000, 2_000_000, 4_000_000, 6_000_000, 8_000_000, 10_000_000,
    15_000_000, 20_000_000,
];

const BITRATE_START_INDEX: usize = 3;

/// Minimum spacing between two bitrate decreases
const DECREASE_INTERVAL: Duration = Duration::from_secs(2);

/// Increases are ignored for this long after a decrease
const INCREASE_LOCK: Duration = Duration::from_secs(5);

/// What an encoder output buffer holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Codec configuration (SPS/PPS, AudioSpecificConfig)
    CodecConfig,
    KeyFrame,
    Delta,
}

/// One encoder output buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub kind: FrameKind,
    pub data: Bytes,
    /// Presentation timestamp in microseconds
    pub pts_us: i64,
}

impl EncodedFrame {
    pub fn new(kind: FrameKind, data: impl Into<Bytes>, pts_us: i64) -> Self {
        Self {
            kind,
            data: data.into(),
            pts_us,
        }
    }
}

/// Active video stream parameters, sent ahead of the codec config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u16,
    pub height: u16,
    pub hevc: bool,
    pub front_facing: bool,
}

/// Active audio stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: i32,
    pub channel_count: u8,
    pub encoding: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatus {
    /// Charge level in percent
    pub level: u8,
    pub charging: bool,
}

/// Camera and encoder pipeline
#[cfg_attr(test, mockall::automock)]
pub trait MediaPipeline: Send + Sync {
    /// Open the camera and start the stream encoder
    ///
    /// Returns the encoder output; the pipeline offers frames without
    /// blocking and drops them when the queue is full.
    fn start_video(
        &self,
        camera: &CameraSettings,
        hevc: bool,
        bitrate: u32,
    ) -> Result<mpsc::Receiver<EncodedFrame>>;

    /// Format of the running video stream
    fn video_format(&self) -> Option<VideoFormat>;

    fn set_target_bitrate(&self, bitrate: u32);

    /// Start the audio encoder; same delivery contract as video
    fn start_audio(&self) -> Result<mpsc::Receiver<EncodedFrame>>;

    fn audio_format(&self) -> Option<AudioFormat>;

    /// Stop capture and both encoders
    fn stop(&self);
}

/// On-board recorder
#[cfg_attr(test, mockall::automock)]
pub trait Recorder: Send + Sync {
    fn is_recording(&self) -> bool;

    /// Start of the current recording
    fn started_at(&self) -> Option<DateTime<Utc>>;

    fn start_recording(&self, with_audio: bool);

    fn stop_recording(&self);
}

/// Host device status sampled for telemetry
#[cfg_attr(test, mockall::automock)]
pub trait DeviceStatus: Send + Sync {
    /// `None` when the host has no battery gauge
    fn battery(&self) -> Option<BatteryStatus>;

    fn camera_fps(&self) -> u16;

    /// Measured stream bitrate in Mbit/s
    fn video_bitrate_mbps(&self) -> f32;
}

/// Collaborator set for a host without camera, recorder or battery gauge
///
/// Telemetry and RC still flow; video requests fail with a logged error.
#[derive(Debug, Default, Clone, Copy)]
pub struct Headless;

impl MediaPipeline for Headless {
    fn start_video(
        &self,
        _camera: &CameraSettings,
        _hevc: bool,
        _bitrate: u32,
    ) -> Result<mpsc::Receiver<EncodedFrame>> {
        Err(AirLinkError::Media("no camera pipeline on this host".to_string()))
    }

    fn video_format(&self) -> Option<VideoFormat> {
        None
    }

    fn set_target_bitrate(&self, _bitrate: u32) {}

    fn start_audio(&self) -> Result<mpsc::Receiver<EncodedFrame>> {
        Err(AirLinkError::Media("no audio source on this host".to_string()))
    }

    fn audio_format(&self) -> Option<AudioFormat> {
        None
    }

    fn stop(&self) {}
}

impl Recorder for Headless {
    fn is_recording(&self) -> bool {
        false
    }

    fn started_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn start_recording(&self, _with_audio: bool) {
        warn!("Recording requested but no recorder is available");
    }

    fn stop_recording(&self) {}
}

impl DeviceStatus for Headless {
    fn battery(&self) -> Option<BatteryStatus> {
        None
    }

    fn camera_fps(&self) -> u16 {
        0
    }

    fn video_bitrate_mbps(&self) -> f32 {
        0.0
    }
}

/// Position in [`BITRATE_LADDER`], bounded by a configurable ceiling
#[derive(Debug, Clone)]
pub struct BitrateLadder {
    index: usize,
    /// bit/s, 0 = unlimited
    ceiling: u32,
    last_decrease: Option<Instant>,
}

impl BitrateLadder {
    pub fn new(ceiling: u32) -> Self {
        let mut ladder = Self {
            index: BITRATE_START_INDEX,
            ceiling,
            last_decrease: None,
        };
        ladder.clamp();
        ladder
    }

    /// Current target in bit/s
    pub fn current(&self) -> u32 {
        BITRATE_LADDER[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_ceiling(&mut self, ceiling: u32) {
        self.ceiling = ceiling;
        self.clamp();
    }

    fn allows(&self, bitrate: u32) -> bool {
        self.ceiling == 0 || bitrate <= self.ceiling
    }

    fn clamp(&mut self) {
        while self.index > 0 && !self.allows(BITRATE_LADDER[self.index]) {
            self.index -= 1;
        }
    }

    /// Move one step; returns the new target when it changed
    pub fn step(&mut self, increase: bool, now: Instant) -> Option<u32> {
        if increase {
            let locked = self
                .last_decrease
                .is_some_and(|at| now.saturating_duration_since(at) < INCREASE_LOCK);
            let next = self.index + 1;
            if locked || next >= BITRATE_LADDER.len() || !self.allows(BITRATE_LADDER[next]) {
                return None;
            }
            self.index = next;
        } else {
            if let Some(at) = self.last_decrease {
                if now.saturating_duration_since(at) < DECREASE_INTERVAL {
                    return None;
                }
            }
            self.last_decrease = Some(now);
            if self.index == 0 {
                return None;
            }
            self.index -= 1;
        }
        info!("Video bitrate target {} bit/s", self.current());
        Some(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_starts_at_2_mbit() {
        let ladder = BitrateLadder::new(6_000_000);
        assert_eq!(ladder.index(), 3);
        assert_eq!(ladder.current(), 2_000_000);
    }

    #[test]
    fn test_ladder_start_clamped_to_ceiling() {
        assert_eq!(BitrateLadder::new(1_000_000).current(), 1_000_000);
        assert_eq!(BitrateLadder::new(100_000).current(), 250_000);
        assert_eq!(BitrateLadder::new(0).current(), 2_000_000);
    }

    #[test]
    fn test_increase_stops_at_ceiling() {
        let now = Instant::now();
        let mut ladder = BitrateLadder::new(6_000_000);
        assert_eq!(ladder.step(true, now), Some(4_000_000));
        assert_eq!(ladder.step(true, now), Some(6_000_000));
        assert_eq!(ladder.step(true, now), None);
        assert_eq!(ladder.current(), 6_000_000);
    }

    #[test]
    fn test_unlimited_ceiling_reaches_top() {
        let now = Instant::now();
        let mut ladder = BitrateLadder::new(0);
        while ladder.step(true, now).is_some() {}
        assert_eq!(ladder.current(), 20_000_000);
    }

    #[test]
    fn test_decrease_rate_limited_and_locks_increase() {
        let start = Instant::now();
        let mut ladder = BitrateLadder::new(0);
        assert_eq!(ladder.step(false, start), Some(1_000_000));
        assert_eq!(ladder.step(false, start + Duration::from_secs(1)), None);
        assert_eq!(ladder.step(true, start + Duration::from_secs(3)), None);
        assert_eq!(ladder.step(true, start + Duration::from_secs(5)), Some(2_000_000));
    }

    #[test]
    fn test_decrease_bottoms_out() {
        let start = Instant::now();
        let mut ladder = BitrateLadder::new(500_000);
        assert_eq!(ladder.step(false, start), Some(250_000));
        assert_eq!(ladder.step(false, start + Duration::from_secs(3)), None);
        assert_eq!(ladder.current(), 250_000);
    }

    #[test]
    fn test_lowering_ceiling_clamps_current() {
        let mut ladder = BitrateLadder::new(0);
        ladder.set_ceiling(500_000);
        assert_eq!(ladder.current(), 500_000);
    }

    #[test]
    fn test_headless_has_no_video() {
        let camera = CameraSettings {
            camera_id: "0".to_string(),
            width: 1920,
            height: 1080,
            fps_min: 30,
            fps_max: 60,
        };
        assert!(matches!(
            Headless.start_video(&camera, false, 2_000_000),
            Err(AirLinkError::Media(_))
        ));
        assert!(Headless.battery().is_none());
        assert!(!Headless.is_recording());
    }
}
