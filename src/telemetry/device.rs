//! Host-side telemetry sampled once per second

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::TelemetryQueue;
use crate::codec::ByteWriter;
use crate::media::{DeviceStatus, Recorder};
use crate::msp::protocol::{
    DD_CAMERA_FPS, DD_PHONE_BATTERY_STATE, DD_VIDEO_BIT_RATE, DD_VIDEO_RECORDER_STATE,
};

pub const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Periodic producer of device-origin records
pub struct DeviceSampler {
    status: Arc<dyn DeviceStatus>,
    recorder: Arc<dyn Recorder>,
    queue: TelemetryQueue,
}

impl DeviceSampler {
    pub fn new(status: Arc<dyn DeviceStatus>, recorder: Arc<dyn Recorder>, queue: TelemetryQueue) -> Self {
        Self {
            status,
            recorder,
            queue,
        }
    }

    /// Offer one round of samples: fps, bitrate, recorder, battery
    pub fn sample(&self) {
        let mut fps = ByteWriter::little_endian();
        fps.write_i16(i16::try_from(self.status.camera_fps()).unwrap_or(i16::MAX));
        self.queue.offer(DD_CAMERA_FPS, fps.freeze());

        let mut bitrate = ByteWriter::little_endian();
        bitrate.write_f32(self.status.video_bitrate_mbps());
        self.queue.offer(DD_VIDEO_BIT_RATE, bitrate.freeze());

        let recording = self.recorder.is_recording();
        let seconds = match self.recorder.started_at() {
            Some(start) if recording => (Utc::now() - start).num_seconds().clamp(0, i64::from(i32::MAX)),
            _ => 0,
        };
        let mut recorder = ByteWriter::little_endian();
        recorder.write_bool(recording).write_i32(seconds as i32);
        self.queue.offer(DD_VIDEO_RECORDER_STATE, recorder.freeze());

        if let Some(battery) = self.status.battery() {
            let mut state = ByteWriter::little_endian();
            state.write_u8(battery.level).write_bool(battery.charging);
            self.queue.offer(DD_PHONE_BATTERY_STATE, state.freeze());
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SAMPLE_PERIOD);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sample(),
            }
        }
        debug!("Device telemetry sampler stopped");
    }
}
