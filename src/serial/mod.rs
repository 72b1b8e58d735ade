//! # Serial Link Supervisor
//!
//! Owns the flight controller serial device lifecycle.
//!
//! This module handles:
//! - Device discovery, rescanned every couple of seconds until found
//! - One-time permission requests and the open step
//! - Picking MSP or MAVLink for the device and starting that engine's poll loop
//! - Feeding read runs to the engine and writing its outbound frames
//! - Restarting from scratch after repeated read errors

pub mod port_trait;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FcProtocol, SerialConfig};
use crate::error::{AirLinkError, Result};
use crate::fc::{FcIdentity, FlightController, OneShotRequest, BETAFLIGHT_ID, INAV_ID};
use port_trait::{DeviceInfo, Permission, PortReader, PortWriter, SerialBackend};

/// Bytes requested per read call
pub const READ_BUFFER_SIZE: usize = 2048;

/// Consecutive read errors tolerated before the port session ends
pub const MAX_CONSECUTIVE_READ_ERRORS: usize = 10;

/// Capacity of the outbound frame queue shared by both engines
pub const WRITE_QUEUE_CAPACITY: usize = 64;

/// USB manufacturer string of ArduPilot boards
pub const ARDUPILOT_MANUFACTURER: &str = "ArduPilot";

const KNOWN_MANUFACTURERS: &[&str] = &[INAV_ID, BETAFLIGHT_ID, "Betaflight", "BETAFLIGHT", ARDUPILOT_MANUFACTURER];

/// Supervisor state, polled by status consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialStatus {
    NotInitialized = 0,
    DeviceNotConnected = 1,
    DeviceFound = 2,
    PermissionRequested = 3,
    PermissionDenied = 4,
    PermissionGranted = 5,
    SerialPortError = 6,
    PortOpened = 7,
}

impl SerialStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Wire protocol spoken with the flight controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveProtocol {
    Msp,
    Mavlink,
}

/// Resolve the configured protocol for a device
pub fn select_protocol(configured: FcProtocol, manufacturer: Option<&str>) -> ActiveProtocol {
    match configured {
        FcProtocol::Msp => ActiveProtocol::Msp,
        FcProtocol::Mavlink => ActiveProtocol::Mavlink,
        FcProtocol::Auto if manufacturer == Some(ARDUPILOT_MANUFACTURER) => ActiveProtocol::Mavlink,
        FcProtocol::Auto => ActiveProtocol::Msp,
    }
}

/// Pick the flight controller among the present devices
///
/// A single device is always taken; otherwise the first one whose USB
/// manufacturer names a known firmware.
pub fn pick_device(devices: &[DeviceInfo]) -> Option<&DeviceInfo> {
    if devices.len() == 1 {
        return devices.first();
    }
    devices.iter().find(|device| {
        device
            .manufacturer
            .as_deref()
            .is_some_and(|name| KNOWN_MANUFACTURERS.contains(&name))
    })
}

/// Serial settings resolved from the `[serial]` section
#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// Fixed device path; `None` scans for USB devices
    pub port: Option<String>,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub rescan_interval: Duration,
    pub protocol: FcProtocol,
}

impl From<&SerialConfig> for SerialSettings {
    fn from(config: &SerialConfig) -> Self {
        Self {
            port: Some(config.port.clone()).filter(|port| !port.is_empty()),
            baud_rate: config.baud_rate,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            rescan_interval: Duration::from_millis(config.rescan_interval_ms),
            protocol: config.protocol,
        }
    }
}

/// Routes flight controller calls to whichever engine the port speaks
///
/// The command dispatcher holds this instead of a concrete engine, so RC
/// frames and one-shot requests follow protocol changes across reconnects.
pub struct EngineSelector {
    msp: Arc<dyn FlightController>,
    mavlink: Arc<dyn FlightController>,
    mavlink_active: AtomicBool,
}

impl std::fmt::Debug for EngineSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSelector")
            .field("active", &self.active_protocol())
            .finish_non_exhaustive()
    }
}

impl EngineSelector {
    pub fn new(msp: Arc<dyn FlightController>, mavlink: Arc<dyn FlightController>) -> Self {
        Self {
            msp,
            mavlink,
            mavlink_active: AtomicBool::new(false),
        }
    }

    pub fn select(&self, protocol: ActiveProtocol) {
        self.mavlink_active
            .store(protocol == ActiveProtocol::Mavlink, Ordering::Release);
    }

    pub fn active_protocol(&self) -> ActiveProtocol {
        if self.mavlink_active.load(Ordering::Acquire) {
            ActiveProtocol::Mavlink
        } else {
            ActiveProtocol::Msp
        }
    }

    fn active(&self) -> &dyn FlightController {
        match self.active_protocol() {
            ActiveProtocol::Msp => self.msp.as_ref(),
            ActiveProtocol::Mavlink => self.mavlink.as_ref(),
        }
    }
}

#[async_trait]
impl FlightController for EngineSelector {
    fn process_data(&self, data: &[u8]) {
        self.active().process_data(data);
    }

    fn identity(&self) -> Option<FcIdentity> {
        self.active().identity()
    }

    fn request(&self, request: OneShotRequest) {
        self.active().request(request);
    }

    fn set_raw_rc(&self, channels: &[u16]) {
        self.active().set_raw_rc(channels);
    }

    fn set_refresh_rates(&self, telemetry_hz: u8, rc_hz: u8) {
        self.msp.set_refresh_rates(telemetry_hz, rc_hz);
        self.mavlink.set_refresh_rates(telemetry_hz, rc_hz);
    }

    fn reset(&self) {
        self.msp.reset();
        self.mavlink.reset();
    }

    fn close(&self) {
        self.active().close();
    }

    async fn run(&self, cancel: CancellationToken) {
        self.active().run(cancel).await;
    }
}

fn update_status(status: &watch::Sender<SerialStatus>, next: SerialStatus) {
    status.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        info!("Serial status: {:?} -> {:?}", current, next);
        *current = next;
        true
    });
}

/// Why a port session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    ReadErrors,
}

/// Serial Link Supervisor
///
/// Consumed by [`SerialSupervisor::run`]; status is observed through the
/// receiver returned by [`SerialSupervisor::subscribe`].
pub struct SerialSupervisor<B: SerialBackend> {
    backend: B,
    settings: SerialSettings,
    engines: Arc<EngineSelector>,
    writes: mpsc::Receiver<Vec<u8>>,
    status: watch::Sender<SerialStatus>,
}

impl<B: SerialBackend> SerialSupervisor<B> {
    /// Create a supervisor
    ///
    /// # Arguments
    ///
    /// * `backend` - Device discovery and I/O
    /// * `settings` - Port, baud rate and timing
    /// * `engines` - Engine selector fed with read runs
    /// * `writes` - Outbound frames produced by the engines
    pub fn new(
        backend: B,
        settings: SerialSettings,
        engines: Arc<EngineSelector>,
        writes: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        let (status, _) = watch::channel(SerialStatus::NotInitialized);
        Self {
            backend,
            settings,
            engines,
            writes,
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SerialStatus> {
        self.status.subscribe()
    }

    /// Supervise the port until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Serial supervisor started");
        loop {
            let Some((device, reader, writer)) = self.connect(&cancel).await else {
                break;
            };

            let protocol = select_protocol(self.settings.protocol, device.manufacturer.as_deref());
            self.engines.select(protocol);
            while self.writes.try_recv().is_ok() {}
            update_status(&self.status, SerialStatus::PortOpened);
            info!("Serial port {} opened, protocol {:?}", device.path, protocol);

            let session = cancel.child_token();
            let poll = tokio::spawn({
                let engines = Arc::clone(&self.engines);
                let token = session.clone();
                async move { engines.run(token).await }
            });

            let end = pump_port(
                reader,
                writer,
                &mut self.writes,
                self.engines.as_ref(),
                &self.status,
                self.settings.read_timeout,
                &session,
            )
            .await;
            session.cancel();
            if let Err(e) = poll.await {
                warn!("Engine poll task ended abnormally: {}", e);
            }

            if end == SessionEnd::Cancelled {
                break;
            }
            update_status(&self.status, SerialStatus::SerialPortError);
            self.engines.reset();
            warn!("Serial port {} failed, restarting discovery", device.path);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.rescan_interval) => {}
            }
        }
        update_status(&self.status, SerialStatus::NotInitialized);
        info!("Serial supervisor stopped");
    }

    /// Scan until a device is opened; `None` when cancelled
    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Option<(DeviceInfo, PortReader, PortWriter)> {
        update_status(&self.status, SerialStatus::DeviceNotConnected);
        let mut device = None;
        loop {
            match self.try_connect(&mut device).await {
                Ok(Some(opened)) => return Some(opened),
                Ok(None) => {}
                Err(e) => warn!("Serial connect attempt failed: {}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.settings.rescan_interval) => {}
            }
        }
    }

    async fn try_connect(
        &self,
        device: &mut Option<DeviceInfo>,
    ) -> Result<Option<(DeviceInfo, PortReader, PortWriter)>> {
        if device.is_none() {
            *device = self.find_device().await?;
        }
        let Some(found) = device.clone() else {
            return Ok(None);
        };
        if !self.check_permission(&found) {
            return Ok(None);
        }

        match self.backend.open(&found, self.settings.baud_rate).await {
            Ok((reader, writer)) => Ok(Some((found, reader, writer))),
            Err(AirLinkError::PermissionDenied(path)) => {
                update_status(&self.status, SerialStatus::PermissionDenied);
                debug!("Open refused for {}", path);
                Ok(None)
            }
            Err(e) => {
                update_status(&self.status, SerialStatus::SerialPortError);
                *device = None;
                Err(e)
            }
        }
    }

    async fn find_device(&self) -> Result<Option<DeviceInfo>> {
        if let Some(path) = &self.settings.port {
            update_status(&self.status, SerialStatus::DeviceFound);
            return Ok(Some(DeviceInfo {
                path: path.clone(),
                manufacturer: None,
            }));
        }

        let devices = self.backend.scan().await?;
        match pick_device(&devices) {
            Some(device) => {
                info!(
                    "Serial device found: {} ({})",
                    device.path,
                    device.manufacturer.as_deref().unwrap_or("unknown manufacturer")
                );
                update_status(&self.status, SerialStatus::DeviceFound);
                Ok(Some(device.clone()))
            }
            None => {
                update_status(&self.status, SerialStatus::DeviceNotConnected);
                Ok(None)
            }
        }
    }

    /// Permission gate; requests access at most once while waiting
    fn check_permission(&self, device: &DeviceInfo) -> bool {
        match self.backend.permission(device) {
            Permission::Granted => {
                update_status(&self.status, SerialStatus::PermissionGranted);
                true
            }
            Permission::Pending => {
                if *self.status.borrow() != SerialStatus::PermissionRequested {
                    self.backend.request_permission(device);
                    update_status(&self.status, SerialStatus::PermissionRequested);
                }
                false
            }
        }
    }
}

/// Shuttle bytes between the port and the engine until cancelled or broken
async fn pump_port(
    mut reader: PortReader,
    mut writer: PortWriter,
    writes: &mut mpsc::Receiver<Vec<u8>>,
    engine: &dyn FlightController,
    status: &watch::Sender<SerialStatus>,
    read_timeout: Duration,
    cancel: &CancellationToken,
) -> SessionEnd {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut errors = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return close_port(&mut writer, writes, engine, read_timeout).await,
            Some(frame) = writes.recv() => {
                if let Err(e) = writer.write_all(&frame).await {
                    warn!("Serial write failed: {}", e);
                }
            }
            read = tokio::time::timeout(read_timeout, reader.read(&mut buf)) => {
                match read {
                    // Nothing arrived within the read timeout
                    Err(_) => {}
                    // End of stream is not a read error; wait and poll again
                    Ok(Ok(0)) => {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return close_port(&mut writer, writes, engine, read_timeout).await
                            }
                            _ = tokio::time::sleep(read_timeout) => {}
                        }
                    }
                    Ok(Ok(n)) => {
                        errors = 0;
                        update_status(status, SerialStatus::PortOpened);
                        engine.process_data(&buf[..n]);
                    }
                    Ok(Err(e)) => {
                        errors += 1;
                        warn!("Serial read error #{}: {}", errors, e);
                        if errors > MAX_CONSECUTIVE_READ_ERRORS {
                            return SessionEnd::ReadErrors;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return close_port(&mut writer, writes, engine, read_timeout).await
                            }
                            _ = tokio::time::sleep(read_timeout) => {}
                        }
                    }
                }
            }
        }
    }
}

/// Let the engine stop its FC-side streams, then flush the write queue
async fn close_port(
    writer: &mut PortWriter,
    writes: &mut mpsc::Receiver<Vec<u8>>,
    engine: &dyn FlightController,
    write_timeout: Duration,
) -> SessionEnd {
    engine.close();
    while let Ok(frame) = writes.try_recv() {
        match tokio::time::timeout(write_timeout, writer.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Serial write failed while closing: {}", e);
                break;
            }
            Err(_) => {
                warn!("Serial write timed out while closing");
                break;
            }
        }
    }
    debug!("Serial port closed");
    SessionEnd::Cancelled
}
