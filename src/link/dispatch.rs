//! Application commands from the ground station

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::packet::{Packet, PacketBuilder, PacketKind, PingBody};
use super::sender::DatagramSender;
use super::stream::MediaStreamer;
use crate::codec::ByteReader;
use crate::config::{ConfigOutcome, RuntimeSettings};
use crate::error::Result;
use crate::fc::{FlightController, OneShotRequest, MAX_SUPPORTED_RC_CHANNEL_COUNT};

/// Maps one delivered packet to one action
pub struct CommandDispatcher {
    sender: Arc<DatagramSender>,
    fc: Arc<dyn FlightController>,
    settings: Arc<RuntimeSettings>,
    streamer: Arc<MediaStreamer>,
}

impl CommandDispatcher {
    pub fn new(
        sender: Arc<DatagramSender>,
        fc: Arc<dyn FlightController>,
        settings: Arc<RuntimeSettings>,
        streamer: Arc<MediaStreamer>,
    ) -> Self {
        Self {
            sender,
            fc,
            settings,
            streamer,
        }
    }

    /// Run the action for `packet`; malformed bodies are logged and dropped
    pub fn dispatch(&self, packet: &Packet) {
        let mut body = packet.body();
        if let Err(e) = self.handle(packet.kind, &mut body) {
            debug!("Malformed {:?} from {}: {}", packet.kind, packet.source, e);
        }
    }

    fn handle(&self, kind: PacketKind, body: &mut ByteReader<'_>) -> Result<()> {
        match kind {
            PacketKind::StartVideo => {
                let hevc = body.read_bool()?;
                self.streamer.start_video(hevc);
                if self.settings.snapshot().send_audio {
                    self.streamer.start_audio();
                }
            }
            PacketKind::GetVideoConfig => self.streamer.resend_config(),
            PacketKind::ChangeBitRate => self.streamer.change_bitrate(body.read_bool()?),
            PacketKind::Ping => {
                let ping = PingBody::read(body)?;
                self.sender.send_pong(&ping);
            }
            PacketKind::FcInfo => {
                if let Some(identity) = self.fc.identity() {
                    let mut reply = PacketBuilder::new(PacketKind::FcInfo);
                    reply.write_bytes(&identity.to_info_bytes());
                    self.sender.send_packet(reply.finish());
                }
            }
            PacketKind::OsdConfig => self.request(OneShotRequest::OsdConfig),
            PacketKind::BatteryConfig => self.request(OneShotRequest::BatteryConfig),
            PacketKind::BoxIds => self.request(OneShotRequest::BoxIds),
            PacketKind::BoxNames => self.request(OneShotRequest::BoxNames),
            PacketKind::StartStopRecording => self.streamer.set_recording(body.read_bool()?),
            PacketKind::Config => self.apply_config(body.read_remaining()),
            PacketKind::RcFrame => self.forward_rc(body)?,
            PacketKind::Disconnect => info!("Ground station sent disconnect"),
            other => trace!("No action for {:?}", other),
        }
        Ok(())
    }

    fn request(&self, request: OneShotRequest) {
        if self.fc.is_initialized() {
            self.fc.request(request);
        } else {
            debug!("{:?} requested before FC discovery finished", request);
        }
    }

    fn apply_config(&self, blob: &[u8]) {
        let reply = match self.settings.apply_blob(blob) {
            ConfigOutcome::Applied => {
                let settings = self.settings.snapshot();
                self.fc
                    .set_refresh_rates(settings.telemetry_rate_hz, settings.rc_rate_hz);
                self.streamer.apply_settings();
                PacketKind::ConfigReceived
            }
            ConfigOutcome::VersionMismatch => PacketKind::VersionMismatch,
            ConfigOutcome::Malformed => return,
        };
        self.sender.send_packet(PacketBuilder::new(reply).finish());
    }

    fn forward_rc(&self, body: &mut ByteReader<'_>) -> Result<()> {
        let count = usize::from(body.read_u8()?);
        if count == 0 || count > MAX_SUPPORTED_RC_CHANNEL_COUNT {
            warn!("RC frame with {} channels rejected", count);
            return Ok(());
        }
        if count * 2 != body.remaining() {
            warn!(
                "RC frame declares {} channels but carries {} bytes",
                count,
                body.remaining()
            );
            return Ok(());
        }
        let channels = (0..count)
            .map(|_| body.read_u16())
            .collect::<Result<Vec<u16>>>()?;
        self.fc.set_raw_rc(&channels);
        Ok(())
    }
}
