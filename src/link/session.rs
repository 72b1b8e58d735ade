//! Datagram session: socket tasks, reorder-buffer tick, telemetry uplink
//! and the relay announcement, all under one cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatch::CommandDispatcher;
use super::packet::{PacketBuilder, PacketKind, CLIENT_TYPE_FLIGHT, MAX_PACKET_SIZE};
use super::receiver::{ReceiverBuffer, RECEIVER_TIMER_PERIOD};
use super::sender::{Datagram, DatagramSender, OUTBOUND_QUEUE_CAPACITY, SENDER_TIMER_PERIOD};
use super::stream::MediaStreamer;
use super::transport::DatagramTransport;
use crate::config::{LinkConfig, LinkMode, RuntimeSettings};
use crate::error::{AirLinkError, Result};
use crate::fc::FlightController;
use crate::media::{MediaPipeline, Recorder};
use crate::telemetry::normalizer::Normalizer;
use crate::telemetry::TelemetryData;

/// Telemetry uplink period
pub const TELEMETRY_PERIOD: Duration = Duration::from_millis(10);

/// Relay announcement period while no session is established
pub const ANNOUNCE_PERIOD: Duration = Duration::from_secs(1);

const RECEIVE_BUFFER_LEN: usize = 2048;
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Resolved link parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub mode: LinkMode,
    /// Relay endpoint, relay mode only
    pub relay: Option<SocketAddr>,
    pub key: String,
    pub version_code: i16,
}

impl SessionOptions {
    /// Resolve the relay address (host or `host:port`) from `[link]`
    pub async fn resolve(config: &LinkConfig) -> Result<Self> {
        let relay = match config.mode {
            LinkMode::Direct => None,
            LinkMode::Relay => {
                let address = config.address.trim();
                let target = if address.contains(':') {
                    address.to_string()
                } else {
                    format!("{}:{}", address, config.bind_port)
                };
                let mut candidates = tokio::net::lookup_host(target)
                    .await
                    .map_err(|e| AirLinkError::Transport(format!("Cannot resolve relay {}: {}", address, e)))?;
                let relay = candidates
                    .next()
                    .ok_or_else(|| AirLinkError::Transport(format!("Relay {} has no address", address)))?;
                Some(relay)
            }
        };
        Ok(Self {
            mode: config.mode,
            relay,
            key: config.key.clone(),
            version_code: config.version_code,
        })
    }
}

/// Producer queues drained by the telemetry uplink
pub struct TelemetrySources {
    pub fc: mpsc::Receiver<TelemetryData>,
    pub device: mpsc::Receiver<TelemetryData>,
}

/// One datagram link to the ground station
pub struct LinkSession {
    transport: Arc<dyn DatagramTransport>,
    options: SessionOptions,
    sender: Arc<DatagramSender>,
    outbound: mpsc::Receiver<Datagram>,
    receiver: ReceiverBuffer,
    dispatcher: CommandDispatcher,
    streamer: Arc<MediaStreamer>,
    fc: Arc<dyn FlightController>,
    normalizer: Normalizer,
}

impl LinkSession {
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        options: SessionOptions,
        fc: Arc<dyn FlightController>,
        settings: Arc<RuntimeSettings>,
        media: Arc<dyn MediaPipeline>,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        let (sender, outbound) = DatagramSender::channel(OUTBOUND_QUEUE_CAPACITY);
        let sender = Arc::new(sender);
        if let Some(relay) = options.relay {
            sender.connect(relay);
        }

        let is_server = options.mode == LinkMode::Direct;
        let receiver = ReceiverBuffer::new(sender.clone(), is_server, options.key.clone(), None);
        let streamer = Arc::new(MediaStreamer::new(sender.clone(), media, recorder, settings.clone()));
        let dispatcher = CommandDispatcher::new(sender.clone(), fc.clone(), settings.clone(), streamer.clone());
        let normalizer = Normalizer::new(settings.version_code());

        Self {
            transport,
            options,
            sender,
            outbound,
            receiver,
            dispatcher,
            streamer,
            fc,
            normalizer,
        }
    }

    /// Run every link task until `cancel` fires, then say goodbye
    pub async fn run(mut self, mut telemetry: TelemetrySources, cancel: CancellationToken) {
        info!(
            "Link session starting in {:?} mode{}",
            self.options.mode,
            self.options
                .relay
                .map(|relay| format!(" via relay {}", relay))
                .unwrap_or_default()
        );

        let mut outbound = std::mem::replace(&mut self.outbound, mpsc::channel(1).1);
        tokio::join!(
            self.write_loop(&mut outbound, &cancel),
            self.receive_loop(&cancel),
            self.buffer_loop(&cancel),
            self.sender_timer_loop(&cancel),
            self.telemetry_loop(&mut telemetry, &cancel),
            self.announce_loop(&cancel),
        );

        self.shutdown().await;
    }

    async fn write_loop(&self, outbound: &mut mpsc::Receiver<Datagram>, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                datagram = outbound.recv() => {
                    let Some(datagram) = datagram else { break };
                    if let Err(e) = self.transport.send_to(&datagram.data, datagram.target).await {
                        debug!("{}", e);
                    }
                }
            }
        }
    }

    async fn receive_loop(&self, cancel: &CancellationToken) {
        let mut buf = vec![0u8; RECEIVE_BUFFER_LEN];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.transport.recv_from(&mut buf) => match received {
                    Ok((len, source)) => self.receiver.add_packet(&buf[..len], source),
                    Err(e) => {
                        warn!("{}", e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                        }
                    }
                },
            }
        }
    }

    /// Drain the reorder buffer into the dispatcher and run its maintenance
    async fn buffer_loop(&self, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(RECEIVER_TIMER_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut connected = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    while let Some(packet) = self.receiver.next_packet() {
                        self.dispatcher.dispatch(&packet);
                    }
                    self.receiver.process_timer();

                    let now_connected = self.receiver.is_connected();
                    if now_connected != connected {
                        connected = now_connected;
                        if connected {
                            info!("Ground station connected via {:?}", self.sender.peer());
                        } else {
                            warn!("Ground station link lost");
                        }
                    }
                }
            }
        }
    }

    async fn sender_timer_loop(&self, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(SENDER_TIMER_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sender.process_timer(),
            }
        }
    }

    /// Pack queued telemetry into `TelemetryData` packets every tick
    async fn telemetry_loop(&self, sources: &mut TelemetrySources, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(TELEMETRY_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let identity = self.fc.identity();
                    let batch = self.normalizer.drain(
                        &mut sources.fc,
                        &mut sources.device,
                        identity.as_ref(),
                        MAX_PACKET_SIZE - 1,
                    );
                    for _ in 0..batch.recorder_toggles {
                        self.streamer.toggle_recording();
                    }
                    for body in batch.bodies {
                        let mut packet = PacketBuilder::new(PacketKind::TelemetryData);
                        packet.write_bytes(&body);
                        self.sender.send_packet(packet.finish());
                    }
                }
            }
        }
    }

    /// Relay mode: announce ourselves until the ground station answers
    async fn announce_loop(&self, cancel: &CancellationToken) {
        if self.options.mode != LinkMode::Relay {
            return;
        }
        let mut ticker = tokio::time::interval(ANNOUNCE_PERIOD);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.receiver.is_connected() {
                        self.sender
                            .send_connect(CLIENT_TYPE_FLIGHT, &self.options.key, self.options.version_code);
                    }
                }
            }
        }
    }

    async fn shutdown(&self) {
        if let Some(peer) = self.sender.peer().filter(|_| self.sender.is_active()) {
            let disconnect = PacketBuilder::new(PacketKind::Disconnect).finish();
            if let Err(e) = self.transport.send_to(&disconnect, peer).await {
                debug!("Disconnect not delivered: {}", e);
            }
        }
        self.streamer.stop();
        self.receiver.close();
        self.sender.close();
        info!("Link session closed");
    }
}
