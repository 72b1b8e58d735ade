//! Video and audio senders feeding encoder output into the link

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fragment::FrameFragmenter;
use super::packet::{PacketBuilder, PacketKind};
use super::sender::DatagramSender;
use crate::config::RuntimeSettings;
use crate::media::{BitrateLadder, EncodedFrame, FrameKind, MediaPipeline, Recorder};

#[derive(Debug)]
struct StreamState {
    ladder: BitrateLadder,
    video_config: Option<Bytes>,
    audio_config: Option<Bytes>,
    video_task: Option<CancellationToken>,
    audio_task: Option<CancellationToken>,
}

/// Owner of the media stream tasks and the bitrate ladder
pub struct MediaStreamer {
    sender: Arc<DatagramSender>,
    media: Arc<dyn MediaPipeline>,
    recorder: Arc<dyn Recorder>,
    settings: Arc<RuntimeSettings>,
    state: Mutex<StreamState>,
}

impl MediaStreamer {
    pub fn new(
        sender: Arc<DatagramSender>,
        media: Arc<dyn MediaPipeline>,
        recorder: Arc<dyn Recorder>,
        settings: Arc<RuntimeSettings>,
    ) -> Self {
        let ladder = BitrateLadder::new(settings.snapshot().bitrate_limit);
        Self {
            sender,
            media,
            recorder,
            settings,
            state: Mutex::new(StreamState {
                ladder,
                video_config: None,
                audio_config: None,
                video_task: None,
                audio_task: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current bitrate target in bit/s
    pub fn bitrate(&self) -> u32 {
        self.lock().ladder.current()
    }

    /// (Re)start the camera and encoder and forward their frames
    pub fn start_video(self: &Arc<Self>, hevc: bool) {
        let settings = self.settings.snapshot();
        let bitrate = {
            let mut state = self.lock();
            if let Some(task) = state.video_task.take() {
                task.cancel();
            }
            state.video_config = None;
            state.ladder.current()
        };
        if self.recorder.is_recording() {
            self.recorder.stop_recording();
        }

        let frames = match self.media.start_video(&settings.camera, hevc, bitrate) {
            Ok(frames) => frames,
            Err(e) => {
                error!("Video start failed: {}", e);
                return;
            }
        };
        info!(
            "Video stream started: camera {} {}x{}, {}, {} bit/s",
            settings.camera.camera_id,
            settings.camera.width,
            settings.camera.height,
            if hevc { "HEVC" } else { "AVC" },
            bitrate
        );

        let token = CancellationToken::new();
        self.lock().video_task = Some(token.clone());
        let streamer = Arc::clone(self);
        tokio::spawn(async move { streamer.video_sender(frames, token).await });
    }

    /// Start the audio encoder, or resend its config when it already runs
    pub fn start_audio(self: &Arc<Self>) {
        let running = self
            .lock()
            .audio_task
            .as_ref()
            .is_some_and(|task| !task.is_cancelled());
        if running {
            self.send_audio_config(None);
            return;
        }

        self.lock().audio_config = None;
        let frames = match self.media.start_audio() {
            Ok(frames) => frames,
            Err(e) => {
                error!("Audio start failed: {}", e);
                return;
            }
        };
        info!("Audio stream started");

        let token = CancellationToken::new();
        self.lock().audio_task = Some(token.clone());
        let streamer = Arc::clone(self);
        tokio::spawn(async move { streamer.audio_sender(frames, token).await });
    }

    async fn video_sender(&self, mut frames: mpsc::Receiver<EncodedFrame>, cancel: CancellationToken) {
        let mut fragmenter = FrameFragmenter::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => self.send_video_frame(&mut fragmenter, frame),
                    None => break,
                },
            }
        }
        debug!("Video sender stopped after frame {}", fragmenter.frame_number());
    }

    async fn audio_sender(&self, mut frames: mpsc::Receiver<EncodedFrame>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    if !self.settings.snapshot().send_audio {
                        info!("Audio streaming disabled, stopping audio sender");
                        break;
                    }
                    match frame.kind {
                        FrameKind::CodecConfig => self.send_audio_config(Some(frame.data)),
                        _ => {
                            let mut packet = PacketBuilder::new(PacketKind::AudioFrame);
                            packet.write_bytes(&frame.data);
                            self.sender.send_packet(packet.finish());
                        }
                    }
                }
            }
        }
        cancel.cancel();
        debug!("Audio sender stopped");
    }

    fn send_video_frame(&self, fragmenter: &mut FrameFragmenter, frame: EncodedFrame) {
        let kind = match frame.kind {
            FrameKind::CodecConfig => {
                self.send_video_config(Some(frame.data));
                return;
            }
            FrameKind::KeyFrame => PacketKind::KeyFrame,
            FrameKind::Delta => PacketKind::VideoFrame,
        };
        for fragment in fragmenter.fragment(kind, &frame.data) {
            self.sender.send_packet(fragment);
        }
    }

    /// Send the video codec config, caching a fresh one or reusing the cache
    fn send_video_config(&self, fresh: Option<Bytes>) {
        let Some(config) = cache(&mut self.lock().video_config, fresh) else {
            return;
        };
        let Some(format) = self.media.video_format() else {
            warn!("Video config available but no stream format");
            return;
        };
        let mut packet = PacketBuilder::new(PacketKind::VideoInitialFrame);
        packet
            .write_u16(format.width)
            .write_u16(format.height)
            .write_bool(format.hevc)
            .write_bool(format.front_facing)
            .write_bytes(&config);
        self.sender.send_packet(packet.finish());
    }

    fn send_audio_config(&self, fresh: Option<Bytes>) {
        let Some(config) = cache(&mut self.lock().audio_config, fresh) else {
            return;
        };
        let Some(format) = self.media.audio_format() else {
            warn!("Audio config available but no stream format");
            return;
        };
        let mut packet = PacketBuilder::new(PacketKind::AudioInitialFrame);
        packet
            .write_i32(format.sample_rate)
            .write_u8(format.channel_count)
            .write_u8(format.encoding)
            .write_bytes(&config);
        self.sender.send_packet(packet.finish());
    }

    /// Answer `GetVideoConfig` with the cached codec configs
    pub fn resend_config(&self) {
        self.send_video_config(None);
        if self.settings.snapshot().send_audio {
            self.send_audio_config(None);
        }
    }

    /// Step the bitrate ladder and retarget the encoder
    pub fn change_bitrate(&self, increase: bool) {
        let changed = self.lock().ladder.step(increase, Instant::now());
        if let Some(bitrate) = changed {
            self.media.set_target_bitrate(bitrate);
        }
    }

    /// Pick up a new bitrate ceiling after a config blob was applied
    pub fn apply_settings(&self) {
        let ceiling = self.settings.snapshot().bitrate_limit;
        let (before, after) = {
            let mut state = self.lock();
            let before = state.ladder.current();
            state.ladder.set_ceiling(ceiling);
            (before, state.ladder.current())
        };
        if before != after {
            info!("Bitrate clamped to {} bit/s by new limit", after);
            self.media.set_target_bitrate(after);
        }
    }

    pub fn set_recording(&self, start: bool) {
        if start {
            let with_audio = self.settings.snapshot().record_audio;
            info!("Recording started (audio: {})", with_audio);
            self.recorder.start_recording(with_audio);
        } else {
            info!("Recording stopped");
            self.recorder.stop_recording();
        }
    }

    pub fn toggle_recording(&self) {
        self.set_recording(!self.recorder.is_recording());
    }

    /// Stop both senders and the pipeline
    pub fn stop(&self) {
        let (video, audio) = {
            let mut state = self.lock();
            (state.video_task.take(), state.audio_task.take())
        };
        if video.is_some() || audio.is_some() {
            for task in video.into_iter().chain(audio) {
                task.cancel();
            }
            self.media.stop();
        }
    }
}

/// Store a fresh codec config, or fall back to the cached one
fn cache(slot: &mut Option<Bytes>, fresh: Option<Bytes>) -> Option<Bytes> {
    match fresh {
        Some(config) if !config.is_empty() => {
            *slot = Some(config.clone());
            Some(config)
        }
        _ => slot.clone(),
    }
}
