//! # MSP Engine
//!
//! Discovery and poll state machine for iNav and Betaflight flight
//! controllers.
//!
//! The engine is driven from two sides: the poll loop started with
//! [`FlightController::run`] issues requests on a fixed decimation schedule,
//! and the serial reader hands every received byte run to
//! [`FlightController::process_data`]. Both paths share one state block
//! behind a mutex that is never held across an await point.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{encode_request, parse_frames, MspDirection, MspFrame};
use super::paged::{PageOutcome, PagedAssembly};
use super::protocol::*;
use crate::codec::{ByteReader, ByteWriter, Endian};
use crate::error::Result;
use crate::fc::boxes::{active_boxes, BoxMode, ModeFlags};
use crate::fc::timers::TimerState;
use crate::fc::{
    poll_period, rc_min_period, remap_channels, ApiCompatibility, ApiVersion, EnginePhase,
    FcIdentity, FcVariant, FirmwareVersion, FlightController, OneShotRequest, PartialIdentity,
    MAX_SUPPORTED_RC_CHANNEL_COUNT,
};
use crate::telemetry::TelemetryQueue;

/// Medium-frequency batch (status, one-shots, mode flags, timers)
const MEDIUM_BATCH_TICKS: u32 = 5;

/// Low-frequency batch (battery, GPS, VTX, analog); resets the counter
const SLOW_BATCH_TICKS: u32 = 10;

/// One-shot requests re-issued on the medium batch until answered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PendingRequests {
    box_names: bool,
    box_ids: bool,
    osd_config: bool,
    battery_config: bool,
    rx_map: bool,
}

#[derive(Debug)]
struct MspState {
    phase: EnginePhase,
    partial: PartialIdentity,
    identity: Option<FcIdentity>,
    initialized_at: Option<DateTime<Utc>>,
    compatibility: ApiCompatibility,
    pending: PendingRequests,
    box_names_pages: PagedAssembly,
    box_ids_pages: PagedAssembly,
    box_ids: Vec<u8>,
    rx_map: Option<Vec<u8>>,
    osd_config: Option<Bytes>,
    mode_flags: Option<ModeFlags>,
    cam_switch: bool,
    timers: TimerState,
    tick: u32,
    poll_period: Duration,
    rc_min_period: Duration,
    rc_last_frame: Option<Instant>,
}

impl MspState {
    fn new(phase: EnginePhase, poll_period: Duration, rc_min_period: Duration) -> Self {
        Self {
            phase,
            partial: PartialIdentity::default(),
            identity: None,
            initialized_at: None,
            compatibility: ApiCompatibility::Unknown,
            pending: PendingRequests::default(),
            box_names_pages: PagedAssembly::new(BF_BOXMODES_PAGE_COUNT),
            box_ids_pages: PagedAssembly::new(BF_BOXMODES_PAGE_COUNT),
            box_ids: Vec::new(),
            rx_map: None,
            osd_config: None,
            mode_flags: None,
            cam_switch: false,
            timers: TimerState::default(),
            tick: 0,
            poll_period,
            rc_min_period,
            rc_last_frame: None,
        }
    }

    fn variant(&self) -> FcVariant {
        self.partial.variant
    }
}

/// Which paged list a box response belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoxList {
    Names,
    Ids,
}

/// MSP protocol engine for one flight controller
///
/// Outbound frames go to `serial` (drained by the supervisor's writer task),
/// decoded telemetry goes to `telemetry`.
pub struct MspEngine {
    state: Mutex<MspState>,
    serial: mpsc::Sender<Vec<u8>>,
    telemetry: TelemetryQueue,
}

impl std::fmt::Debug for MspEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MspEngine")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl MspEngine {
    /// Create an engine in the `Uninitialized` phase
    ///
    /// # Arguments
    ///
    /// * `serial` - Queue of encoded frames for the serial writer
    /// * `telemetry` - FC-origin telemetry queue
    /// * `telemetry_hz` - Poll base rate
    /// * `rc_hz` - RC refresh rate used by the frame limiter
    pub fn new(
        serial: mpsc::Sender<Vec<u8>>,
        telemetry: TelemetryQueue,
        telemetry_hz: u8,
        rc_hz: u8,
    ) -> Self {
        Self {
            state: Mutex::new(MspState::new(
                EnginePhase::Uninitialized,
                poll_period(telemetry_hz),
                rc_min_period(rc_hz),
            )),
            serial,
            telemetry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MspState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> EnginePhase {
        self.lock().phase
    }

    /// Wall-clock time at which discovery last completed
    pub fn initialized_at(&self) -> Option<DateTime<Utc>> {
        self.lock().initialized_at
    }

    /// Enter `Discovering` with a fresh session; no-op if already running
    pub fn start(&self) {
        let mut state = self.lock();
        if state.phase == EnginePhase::Uninitialized {
            state.phase = EnginePhase::Discovering;
            state.tick = 0;
        }
    }

    /// One base tick of the poll schedule
    pub fn poll_tick(&self, now: Instant) {
        let mut state = self.lock();
        match state.phase {
            EnginePhase::Uninitialized => return,
            EnginePhase::Discovering => match state.partial.complete() {
                Some(identity) => self.on_identified(&mut state, identity, now),
                None => {
                    self.request_discovery(&state);
                    return;
                }
            },
            EnginePhase::Polling => {}
        }
        self.poll(&mut state, now);
    }

    /// Forward RC channels at an explicit time (rate limited)
    pub fn set_raw_rc_at(&self, channels: &[u16], now: Instant) {
        if channels.is_empty() || channels.len() > MAX_SUPPORTED_RC_CHANNEL_COUNT {
            debug!("RC frame with {} channels rejected", channels.len());
            return;
        }

        let mut state = self.lock();
        if !state.compatibility.allows_requests() {
            return;
        }
        if let Some(last) = state.rc_last_frame {
            if now.saturating_duration_since(last) < state.rc_min_period {
                return;
            }
        }
        state.rc_last_frame = Some(now);

        let mapped = remap_channels(channels, state.rx_map.as_deref());
        let mut payload = ByteWriter::with_capacity(Endian::Little, mapped.len() * 2);
        for value in &mapped {
            payload.write_u16(*value);
        }
        self.send(MSP_SET_RAW_RC, payload.as_slice());
    }

    fn on_identified(&self, state: &mut MspState, identity: FcIdentity, now: Instant) {
        state.identity = Some(identity);
        state.initialized_at = Some(Utc::now());
        state.compatibility = identity.compatibility();
        state.phase = EnginePhase::Polling;
        state.tick = 0;
        state.timers.start(now);
        state.pending.rx_map = true;

        info!(
            "{} {} detected, MSP API {}, platform {}",
            identity.variant.name(),
            identity.firmware,
            identity.api,
            identity.platform
        );
        if state.compatibility != ApiCompatibility::Ok {
            warn!(
                "MSP API {} compatibility level {:?}",
                identity.api, state.compatibility
            );
        }
    }

    fn request_discovery(&self, state: &MspState) {
        let partial = &state.partial;
        if partial.variant == FcVariant::Unknown {
            self.send(MSP_FC_VARIANT, &[]);
        }
        if partial.api.is_none() {
            self.send(MSP_API_VERSION, &[]);
        }
        if partial.firmware.is_none() {
            self.send(MSP_FC_VERSION, &[]);
        }
        if partial.platform.is_none() {
            match partial.variant {
                FcVariant::Inav => self.send(MSP2_INAV_MIXER, &[]),
                FcVariant::Betaflight => self.send(MSP_MIXER_CONFIG, &[]),
                FcVariant::Ardupilot | FcVariant::Unknown => {}
            }
        }
    }

    fn poll(&self, state: &mut MspState, now: Instant) {
        state.tick += 1;
        let variant = state.variant();

        if state.tick % MEDIUM_BATCH_TICKS == 0 {
            match variant {
                FcVariant::Inav => {
                    if state.pending.box_ids {
                        self.send_polled(state, MSP_BOXIDS, &[]);
                    }
                    if state.pending.box_names {
                        self.send_polled(state, MSP_BOXNAMES, &[]);
                    }
                }
                FcVariant::Betaflight => {
                    if state.pending.box_ids {
                        self.send_polled(state, MSP_BOXIDS, &[state.box_ids_pages.next_page()]);
                    }
                    if state.pending.box_names {
                        self.send_polled(state, MSP_BOXNAMES, &[state.box_names_pages.next_page()]);
                    }
                }
                FcVariant::Ardupilot | FcVariant::Unknown => {}
            }
            if state.pending.osd_config {
                self.send_polled(state, MSP_OSD_CONFIG, &[]);
            }
            if state.pending.rx_map {
                self.send_polled(state, MSP_RX_MAP, &[]);
            }
            if state.pending.battery_config {
                // iNav has no usable MSP_BATTERY_CONFIG
                if variant == FcVariant::Inav {
                    state.pending.battery_config = false;
                } else {
                    self.send_polled(state, MSP_BATTERY_CONFIG, &[]);
                }
            }
            match variant {
                FcVariant::Inav => self.send_polled(state, MSP2_INAV_STATUS, &[]),
                FcVariant::Betaflight => self.send_polled(state, MSP_STATUS, &[]),
                FcVariant::Ardupilot | FcVariant::Unknown => {}
            }
            self.check_mode_flags(state, now);
            let timers = state.timers.snapshot(now);
            self.telemetry.offer(DD_TIMERS, timers.to_le_bytes().to_vec());
        }

        if state.tick % SLOW_BATCH_TICKS == 0 {
            state.tick = 0;
            self.send_polled(state, MSP_BATTERY_STATE, &[]);
            self.send_polled(state, MSP_RAW_GPS, &[]);
            self.send_polled(state, MSP_COMP_GPS, &[]);
            self.send_polled(state, MSP_VTX_CONFIG, &[]);
            match variant {
                FcVariant::Inav => self.send_polled(state, MSP2_INAV_ANALOG, &[]),
                FcVariant::Betaflight => self.send_polled(state, MSP_ANALOG, &[]),
                FcVariant::Ardupilot | FcVariant::Unknown => {}
            }
        }

        self.send_polled(state, MSP_ATTITUDE, &[]);
        self.send_polled(state, MSP_ALTITUDE, &[]);
    }

    /// Derive armed / camera-switch state from the latest mode flags
    fn check_mode_flags(&self, state: &mut MspState, now: Instant) {
        let active = match &state.mode_flags {
            Some(flags) => active_boxes(flags, &state.box_ids),
            None => Vec::new(),
        };

        state
            .timers
            .update_armed(active.contains(&BoxMode::Arm), now);

        let cam_switch = active.contains(&BoxMode::Camera2);
        if cam_switch && !state.cam_switch {
            debug!("Camera switch engaged, toggling recorder");
            self.telemetry.offer(DD_VIDEO_RECORDER_START_STOP, vec![0u8]);
        }
        state.cam_switch = cam_switch;
    }

    fn send(&self, code: u16, payload: &[u8]) {
        let Some(frame) = encode_request(code, payload) else {
            warn!("MSP request {} could not be encoded", code);
            return;
        };
        if let Err(e) = self.serial.try_send(frame) {
            debug!("MSP request {} dropped: {}", code, e);
        }
    }

    fn send_polled(&self, state: &MspState, code: u16, payload: &[u8]) {
        if state.compatibility.allows_requests() {
            self.send(code, payload);
        }
    }

    fn handle_response(&self, frame: &MspFrame) -> Result<()> {
        let mut state = self.lock();
        let payload = &frame.payload;
        let mut reader = ByteReader::little_endian(payload);

        match frame.code {
            MSP_API_VERSION if state.identity.is_none() => {
                let protocol = reader.read_u8()?;
                let major = reader.read_u8()?;
                let minor = reader.read_u8()?;
                state.partial.api = Some(ApiVersion { protocol, major, minor });
            }
            MSP_FC_VARIANT if state.identity.is_none() => {
                let id = String::from_utf8_lossy(payload);
                let variant = FcVariant::from_identifier(&id);
                if variant == FcVariant::Unknown {
                    debug!("Unsupported FC variant {:?}", id);
                } else {
                    state.partial.variant = variant;
                }
            }
            MSP_FC_VERSION if state.identity.is_none() => {
                let major = reader.read_u8()?;
                let minor = reader.read_u8()?;
                let patch = reader.read_u8()?;
                state.partial.firmware = Some(FirmwareVersion { major, minor, patch });
            }
            MSP_MIXER_CONFIG if state.identity.is_none() => {
                state.partial.platform = Some(reader.read_u8()?);
            }
            MSP2_INAV_MIXER if state.identity.is_none() => {
                reader.skip(3)?;
                state.partial.platform = Some(reader.read_u8()?);
            }
            MSP_BOXNAMES => self.on_box_list(&mut state, BoxList::Names, payload),
            MSP_BOXIDS => self.on_box_list(&mut state, BoxList::Ids, payload),
            MSP_BATTERY_CONFIG => {
                state.pending.battery_config = false;
                self.telemetry.offer(frame.code, payload.clone());
            }
            MSP_RX_MAP => {
                if !payload.is_empty() {
                    state.rx_map = Some(payload.to_vec());
                    state.pending.rx_map = false;
                }
            }
            MSP_OSD_CONFIG => {
                state.pending.osd_config = false;
                state.osd_config = Some(payload.clone());
                if state.variant() == FcVariant::Betaflight {
                    self.send_polled(&state, MSP_OSD_CANVAS, &[]);
                } else {
                    self.telemetry.offer(frame.code, payload.clone());
                }
            }
            MSP_OSD_CANVAS => {
                self.telemetry.offer(frame.code, payload.clone());
                if let Some(osd_config) = state.osd_config.clone() {
                    self.telemetry.offer(MSP_OSD_CONFIG, osd_config);
                }
            }
            MSP2_INAV_STATUS => {
                reader.skip(2 + 2 + 2 + 2 + 1 + 4)?;
                let count = inav_mode_word_count(reader.remaining());
                let mut words = Vec::with_capacity(count);
                for _ in 0..count {
                    words.push(reader.read_u32()?);
                }
                state.mode_flags = (!words.is_empty()).then_some(ModeFlags::Inav(words));
                self.telemetry.offer(frame.code, payload.clone());
            }
            MSP_STATUS => match state.variant() {
                FcVariant::Inav => {
                    self.telemetry.offer(frame.code, payload.clone());
                }
                FcVariant::Betaflight => {
                    reader.skip(2 + 2 + 2)?;
                    let first = reader.read_u32()?;
                    reader.skip(1 + 2 + 2)?;
                    let size = i32::from(reader.read_i8()?) + 4;
                    let mut flags = first.to_le_bytes().to_vec();
                    if size > 4 {
                        let extra = usize::try_from(size - 4).unwrap_or(0);
                        flags.extend_from_slice(reader.read_bytes(extra)?);
                    }
                    state.mode_flags = Some(ModeFlags::Betaflight(flags));
                    self.telemetry.offer(frame.code, payload.clone());
                }
                FcVariant::Ardupilot | FcVariant::Unknown => {}
            },
            MSP_ATTITUDE | MSP_ALTITUDE | MSP_ANALOG | MSP_VTX_CONFIG | MSP_BATTERY_STATE
            | MSP_RAW_GPS | MSP_COMP_GPS | MSP2_INAV_ANALOG => {
                self.telemetry.offer(frame.code, payload.clone());
            }
            _ => {}
        }
        Ok(())
    }

    fn on_box_list(&self, state: &mut MspState, list: BoxList, payload: &Bytes) {
        let code = match list {
            BoxList::Names => MSP_BOXNAMES,
            BoxList::Ids => MSP_BOXIDS,
        };

        let assembled = match state.variant() {
            FcVariant::Inav => payload.clone(),
            FcVariant::Betaflight => {
                let pages = match list {
                    BoxList::Names => &mut state.box_names_pages,
                    BoxList::Ids => &mut state.box_ids_pages,
                };
                match pages.push(payload) {
                    PageOutcome::Pending => return,
                    PageOutcome::Complete(all) => all,
                }
            }
            FcVariant::Ardupilot | FcVariant::Unknown => return,
        };

        match list {
            BoxList::Names => state.pending.box_names = false,
            BoxList::Ids => {
                state.pending.box_ids = false;
                state.box_ids = assembled.to_vec();
            }
        }
        if !assembled.is_empty() {
            self.telemetry.offer(code, assembled);
        }
    }
}

/// Mode flag words trailing an `MSP2_INAV_STATUS` payload (last byte excluded)
pub(crate) fn inav_mode_word_count(remaining: usize) -> usize {
    if remaining == 0 {
        0
    } else {
        (remaining + 2) / 4
    }
}

#[async_trait]
impl FlightController for MspEngine {
    fn process_data(&self, data: &[u8]) {
        if data.len() < MSP_MIN_RUN_LEN {
            return;
        }
        for frame in parse_frames(data) {
            match frame.direction {
                MspDirection::Response => {}
                MspDirection::Error => {
                    warn!("MSP error reply for code {}", frame.code);
                    continue;
                }
                MspDirection::Request => continue,
            }
            if let Err(e) = self.handle_response(&frame) {
                debug!("MSP code {} payload rejected: {}", frame.code, e);
            }
        }
    }

    fn identity(&self) -> Option<FcIdentity> {
        self.lock().identity
    }

    fn request(&self, request: OneShotRequest) {
        let mut state = self.lock();
        if state.identity.is_none() {
            return;
        }
        match request {
            OneShotRequest::OsdConfig => state.pending.osd_config = true,
            OneShotRequest::BatteryConfig => state.pending.battery_config = true,
            OneShotRequest::BoxIds => {
                if !state.pending.box_ids {
                    state.box_ids_pages.reset();
                }
                state.pending.box_ids = true;
            }
            OneShotRequest::BoxNames => {
                if !state.pending.box_names {
                    state.box_names_pages.reset();
                }
                state.pending.box_names = true;
            }
        }
    }

    fn set_raw_rc(&self, channels: &[u16]) {
        self.set_raw_rc_at(channels, Instant::now());
    }

    fn set_refresh_rates(&self, telemetry_hz: u8, rc_hz: u8) {
        let mut state = self.lock();
        state.poll_period = poll_period(telemetry_hz);
        state.rc_min_period = rc_min_period(rc_hz);
        state.rc_last_frame = None;
    }

    fn reset(&self) {
        let mut state = self.lock();
        let phase = match state.phase {
            EnginePhase::Uninitialized => EnginePhase::Uninitialized,
            EnginePhase::Discovering | EnginePhase::Polling => EnginePhase::Discovering,
        };
        let (poll, rc) = (state.poll_period, state.rc_min_period);
        *state = MspState::new(phase, poll, rc);
        info!("MSP engine reset, FC identity cleared");
    }

    async fn run(&self, cancel: CancellationToken) {
        self.start();
        info!("MSP poll loop started");
        loop {
            self.poll_tick(Instant::now());
            let period = self.lock().poll_period;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        debug!("MSP poll loop stopped");
    }
}
