//! # MAVLink Engine
//!
//! Drives one ArduPilot flight controller. Identification is a two-step
//! handshake: wait for a heartbeat, then request `AUTOPILOT_VERSION` once per
//! second until the firmware version arrives. Once identified, every
//! handshake period the engine reports the timers, asks for the telemetry
//! streams that went quiet and reads the parameters it still misses.
//! Streamed messages become `DD_AP_*` telemetry records.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ::mavlink::common::{
    MavCmd, MavMessage, MavModeFlag, COMMAND_LONG_DATA, PARAM_REQUEST_READ_DATA,
    PARAM_VALUE_DATA, RC_CHANNELS_OVERRIDE_DATA,
};
use ::mavlink::{MavHeader, MavlinkVersion, Message};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::frame::{parse_frames, MavlinkFrame, MAVLINK_MIN_RUN_LEN, MSG_ID_AUTOPILOT_VERSION};
use super::params::{
    decode_param_id, encode_param_id, FcParams, RC_OPTION_CAMERA_RECORD_VIDEO, VTX_POWER,
};
use super::records::ApRecords;
use super::streams::{base_interval_us, StreamSchedule, INTERVAL_DISABLED};
use crate::fc::timers::TimerState;
use crate::fc::{
    rc_min_period, remap_channels, ApiCompatibility, ApiVersion, EnginePhase, FcIdentity,
    FcVariant, FirmwareVersion, FlightController, OneShotRequest, MAX_SUPPORTED_RC_CHANNEL_COUNT,
};
use crate::msp::protocol::{DD_AP_OSD_CONFIG, DD_TIMERS, DD_VIDEO_RECORDER_START_STOP};
use crate::telemetry::TelemetryQueue;

/// Handshake retry period
pub const HANDSHAKE_PERIOD: Duration = Duration::from_secs(1);

/// Component id used for frames sent by the link
pub const LINK_COMPONENT_ID: u8 = 1;

/// Autopilot component targeted by commands
pub const TARGET_COMPONENT_ID: u8 = 1;

/// Parameter reads sent per handshake period
const PARAM_REQUESTS_PER_TICK: usize = 20;

/// Channel value (µs) above which a switch counts as on
const SWITCH_ON_US: u16 = 1600;

/// Link identity on the MAVLink bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MavlinkIds {
    /// System id of the autopilot
    pub target_sys_id: u8,
    /// System id the link sends as
    pub gcs_sys_id: u8,
}

impl Default for MavlinkIds {
    fn default() -> Self {
        Self {
            target_sys_id: 1,
            gcs_sys_id: 255,
        }
    }
}

/// Facts learned from the first heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeartbeatInfo {
    mavlink2: bool,
    mavlink_version: u8,
    platform: u8,
}

#[derive(Debug)]
struct MavlinkState {
    phase: EnginePhase,
    heartbeat: Option<HeartbeatInfo>,
    firmware: Option<FirmwareVersion>,
    identity: Option<FcIdentity>,
    compatibility: ApiCompatibility,
    use_v2: bool,
    sequence: u8,
    timers: TimerState,
    base_interval_us: u32,
    streams: StreamSchedule,
    params: FcParams,
    records: ApRecords,
    osd_config_pending: bool,
    camera_channel: Option<usize>,
    camera_switch: bool,
    rc_min_period: Duration,
    rc_last_frame: Option<Instant>,
}

impl MavlinkState {
    fn new(phase: EnginePhase, base_interval_us: u32, rc_min_period: Duration) -> Self {
        Self {
            phase,
            heartbeat: None,
            firmware: None,
            identity: None,
            compatibility: ApiCompatibility::Unknown,
            use_v2: true,
            sequence: 0,
            timers: TimerState::default(),
            base_interval_us,
            streams: StreamSchedule::default(),
            params: FcParams::new(),
            records: ApRecords::default(),
            osd_config_pending: false,
            camera_channel: None,
            camera_switch: false,
            rc_min_period,
            rc_last_frame: None,
        }
    }

    fn next_sequence(&mut self) -> u8 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }
}

/// `RC_CHANNELS_OVERRIDE` for up to 18 channels
///
/// Absent channels 1-8 are sent as `u16::MAX` (ignore), absent 9-18 as 0.
fn rc_override(channels: &[u16], target_system: u8, target_component: u8) -> MavMessage {
    let ch = |index: usize, absent: u16| channels.get(index).copied().unwrap_or(absent);
    MavMessage::RC_CHANNELS_OVERRIDE(RC_CHANNELS_OVERRIDE_DATA {
        chan1_raw: ch(0, u16::MAX),
        chan2_raw: ch(1, u16::MAX),
        chan3_raw: ch(2, u16::MAX),
        chan4_raw: ch(3, u16::MAX),
        chan5_raw: ch(4, u16::MAX),
        chan6_raw: ch(5, u16::MAX),
        chan7_raw: ch(6, u16::MAX),
        chan8_raw: ch(7, u16::MAX),
        target_system,
        target_component,
        chan9_raw: ch(8, 0),
        chan10_raw: ch(9, 0),
        chan11_raw: ch(10, 0),
        chan12_raw: ch(11, 0),
        chan13_raw: ch(12, 0),
        chan14_raw: ch(13, 0),
        chan15_raw: ch(14, 0),
        chan16_raw: ch(15, 0),
        chan17_raw: ch(16, 0),
        chan18_raw: ch(17, 0),
    })
}

/// MAVLink protocol engine for one ArduPilot flight controller
pub struct MavlinkEngine {
    state: Mutex<MavlinkState>,
    serial: mpsc::Sender<Vec<u8>>,
    telemetry: TelemetryQueue,
    ids: MavlinkIds,
}

impl std::fmt::Debug for MavlinkEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MavlinkEngine")
            .field("ids", &self.ids)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl MavlinkEngine {
    pub fn new(
        serial: mpsc::Sender<Vec<u8>>,
        telemetry: TelemetryQueue,
        ids: MavlinkIds,
        telemetry_hz: u8,
        rc_hz: u8,
    ) -> Self {
        let state = MavlinkState::new(
            EnginePhase::Uninitialized,
            base_interval_us(telemetry_hz),
            rc_min_period(rc_hz),
        );
        Self {
            state: Mutex::new(state),
            serial,
            telemetry,
            ids,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MavlinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> EnginePhase {
        self.lock().phase
    }

    pub fn start(&self) {
        let mut state = self.lock();
        if state.phase == EnginePhase::Uninitialized {
            state.phase = EnginePhase::Discovering;
        }
    }

    /// One handshake period
    pub fn tick(&self, now: Instant) {
        let mut state = self.lock();
        match state.phase {
            EnginePhase::Uninitialized => {}
            EnginePhase::Discovering => {
                if state.heartbeat.is_some() {
                    let command = self.command_long(
                        MavCmd::MAV_CMD_REQUEST_MESSAGE,
                        MSG_ID_AUTOPILOT_VERSION as f32,
                        0.0,
                    );
                    self.send(&mut state, command);
                }
            }
            EnginePhase::Polling => {
                let timers = state.timers.snapshot(now);
                self.telemetry.offer(DD_TIMERS, timers.to_le_bytes().to_vec());
                if state.compatibility.allows_requests() {
                    self.request_streams(&mut state, now);
                    self.request_params(&mut state);
                    self.request_param(&mut state, VTX_POWER);
                }
                if state.osd_config_pending {
                    if let Some(record) = state.params.osd_config_record() {
                        self.telemetry.offer(DD_AP_OSD_CONFIG, record);
                        state.osd_config_pending = false;
                    }
                }
            }
        }
    }

    /// Parse a byte run with an explicit receive time
    pub fn process_data_at(&self, data: &[u8], now: Instant) {
        if data.len() < MAVLINK_MIN_RUN_LEN {
            return;
        }
        for frame in parse_frames(data) {
            self.handle_frame(&frame, now);
        }
    }

    /// Forward RC channels at an explicit time (rate limited)
    ///
    /// Channels arrive in roll, pitch, yaw, throttle order and are moved to
    /// the autopilot's `RCMAP_*` slots; nothing is sent until that map is
    /// known.
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

        if let Some(channel) = state.camera_channel {
            let on = channels.get(channel).is_some_and(|&value| value >= SWITCH_ON_US);
            if on && !state.camera_switch {
                debug!("Camera switch on channel {} engaged, toggling recorder", channel + 1);
                self.telemetry.offer(DD_VIDEO_RECORDER_START_STOP, vec![0u8]);
            }
            state.camera_switch = on;
        }

        let Some(map) = state.params.rc_map() else {
            trace!("RC frame dropped, RCMAP not known yet");
            return;
        };
        if map.iter().any(|&target| usize::from(target) >= channels.len()) {
            debug!("RC frame with {} channels does not cover RCMAP {:?}", channels.len(), map);
            return;
        }
        let mapped = remap_channels(channels, Some(&map[..]));
        let message = rc_override(&mapped, self.ids.target_sys_id, TARGET_COMPONENT_ID);
        self.send(&mut state, message);
    }

    fn handle_frame(&self, frame: &MavlinkFrame, now: Instant) {
        let mut state = self.lock();
        match &frame.message {
            MavMessage::HEARTBEAT(heartbeat) => {
                let armed = heartbeat
                    .base_mode
                    .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                state.timers.update_armed(armed, now);
                state.records.set_armed(armed, now);
                if state.heartbeat.is_none() {
                    let mavlink2 = frame.version == MavlinkVersion::V2;
                    state.use_v2 = mavlink2;
                    state.heartbeat = Some(HeartbeatInfo {
                        mavlink2,
                        mavlink_version: heartbeat.mavlink_version,
                        platform: heartbeat.mavtype as u8,
                    });
                    debug!(
                        "MAVLink heartbeat from system {} ({:?}, v{})",
                        frame.header.system_id,
                        heartbeat.mavtype,
                        if mavlink2 { 2 } else { 1 }
                    );
                }
                if state.identity.is_some() {
                    let (code, data) = state
                        .records
                        .mode_record(heartbeat.custom_mode, heartbeat.base_mode);
                    self.telemetry.offer(code, data);
                }
            }
            MavMessage::AUTOPILOT_VERSION(version) if state.identity.is_none() => {
                let [major, minor, patch, _fw_type] = version.flight_sw_version.to_be_bytes();
                state.firmware = Some(FirmwareVersion { major, minor, patch });
            }
            MavMessage::PARAM_VALUE(value) => self.handle_param(&mut state, value),
            message => {
                state.streams.mark(message.message_id(), now);
                match state.records.record(message, now) {
                    Ok(Some((code, data))) if state.identity.is_some() => {
                        self.telemetry.offer(code, data);
                    }
                    Ok(_) => {}
                    Err(e) => debug!("{} not reported: {}", message.message_name(), e),
                }
            }
        }
        self.try_identify(&mut state, now);
    }

    fn handle_param(&self, state: &mut MavlinkState, value: &PARAM_VALUE_DATA) {
        let Some(name) = decode_param_id(&value.param_id) else {
            debug!("PARAM_VALUE with undecodable name ignored");
            return;
        };
        if name == VTX_POWER {
            if state.identity.is_some() {
                let (code, data) = ApRecords::vtx_power_record(value.param_value);
                self.telemetry.offer(code, data);
            }
            return;
        }
        if !state.params.set(name, value.param_value) {
            return;
        }
        trace!("Parameter {} = {}", name, value.param_value);
        if state.camera_channel.is_none() && state.params.rc_options_known() {
            state.camera_channel = state.params.option_channel(RC_OPTION_CAMERA_RECORD_VIDEO);
            if let Some(channel) = state.camera_channel {
                info!("Camera record switch on RC{}", channel + 1);
            }
        }
        if state.params.is_complete() {
            debug!("All flight controller parameters received");
        }
    }

    fn try_identify(&self, state: &mut MavlinkState, now: Instant) {
        if state.identity.is_some() {
            return;
        }
        let (Some(heartbeat), Some(firmware)) = (state.heartbeat, state.firmware) else {
            return;
        };

        let identity = FcIdentity {
            variant: FcVariant::Ardupilot,
            firmware,
            api: ApiVersion {
                protocol: 0,
                major: if heartbeat.mavlink2 { 2 } else { 1 },
                minor: heartbeat.mavlink_version,
            },
            platform: heartbeat.platform,
        };
        state.identity = Some(identity);
        state.compatibility = identity.compatibility();
        state.phase = EnginePhase::Polling;
        let armed = state.timers.is_armed();
        state.timers.start(now);
        state.timers.update_armed(armed, now);

        info!(
            "{} {} detected, MAVLink API {}",
            identity.variant.name(),
            identity.firmware,
            identity.api
        );
        if state.compatibility != ApiCompatibility::Ok {
            warn!(
                "MAVLink API {} compatibility level {:?}",
                identity.api, state.compatibility
            );
        }
    }

    fn request_streams(&self, state: &mut MavlinkState, now: Instant) {
        for (msg_id, interval_us) in state.streams.due(state.base_interval_us, now) {
            let command = self.command_long(
                MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL,
                msg_id as f32,
                interval_us,
            );
            self.send(state, command);
        }
    }

    fn request_params(&self, state: &mut MavlinkState) {
        let missing: Vec<String> = state
            .params
            .missing()
            .take(PARAM_REQUESTS_PER_TICK)
            .map(str::to_string)
            .collect();
        for name in &missing {
            self.request_param(state, name);
        }
    }

    fn request_param(&self, state: &mut MavlinkState, name: &str) {
        let param_id = match encode_param_id(name) {
            Ok(id) => id,
            Err(e) => {
                warn!("Parameter {} not requested: {}", name, e);
                return;
            }
        };
        let message = MavMessage::PARAM_REQUEST_READ(PARAM_REQUEST_READ_DATA {
            param_index: -1,
            target_system: self.ids.target_sys_id,
            target_component: TARGET_COMPONENT_ID,
            param_id,
        });
        self.send(state, message);
    }

    fn command_long(&self, command: MavCmd, param1: f32, param2: f32) -> MavMessage {
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            param1,
            param2,
            command,
            target_system: self.ids.target_sys_id,
            target_component: TARGET_COMPONENT_ID,
            ..COMMAND_LONG_DATA::default()
        })
    }

    fn send(&self, state: &mut MavlinkState, message: MavMessage) {
        let frame = MavlinkFrame {
            version: if state.use_v2 {
                MavlinkVersion::V2
            } else {
                MavlinkVersion::V1
            },
            header: MavHeader {
                system_id: self.ids.gcs_sys_id,
                component_id: LINK_COMPONENT_ID,
                sequence: state.next_sequence(),
            },
            message,
        };
        match frame.encode() {
            Ok(bytes) => {
                if let Err(e) = self.serial.try_send(bytes) {
                    debug!("{} dropped: {}", frame.message.message_name(), e);
                }
            }
            Err(e) => warn!("MAVLink message not sent: {}", e),
        }
    }
}

#[async_trait]
impl FlightController for MavlinkEngine {
    fn process_data(&self, data: &[u8]) {
        self.process_data_at(data, Instant::now());
    }

    fn identity(&self) -> Option<FcIdentity> {
        self.lock().identity
    }

    fn request(&self, request: OneShotRequest) {
        match request {
            OneShotRequest::OsdConfig => self.lock().osd_config_pending = true,
            other => debug!("{:?} is not available over MAVLink", other),
        }
    }

    fn set_raw_rc(&self, channels: &[u16]) {
        self.set_raw_rc_at(channels, Instant::now());
    }

    fn set_refresh_rates(&self, telemetry_hz: u8, rc_hz: u8) {
        let mut state = self.lock();
        state.base_interval_us = base_interval_us(telemetry_hz);
        // Ask again for every stream at the new rate
        state.streams = StreamSchedule::default();
        state.rc_min_period = rc_min_period(rc_hz);
        state.rc_last_frame = None;
    }

    fn reset(&self) {
        let mut state = self.lock();
        let phase = match state.phase {
            EnginePhase::Uninitialized => EnginePhase::Uninitialized,
            EnginePhase::Discovering | EnginePhase::Polling => EnginePhase::Discovering,
        };
        let (base, rc) = (state.base_interval_us, state.rc_min_period);
        *state = MavlinkState::new(phase, base, rc);
        info!("MAVLink engine reset, FC identity cleared");
    }

    fn close(&self) {
        let mut state = self.lock();
        if state.identity.is_none() {
            return;
        }
        for msg_id in StreamSchedule::all_ids() {
            let command = self.command_long(
                MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL,
                msg_id as f32,
                INTERVAL_DISABLED,
            );
            self.send(&mut state, command);
        }
        info!("MAVLink telemetry streams stopped");
    }

    async fn run(&self, cancel: CancellationToken) {
        self.start();
        info!("MAVLink handshake loop started");
        let mut interval = tokio::time::interval(HANDSHAKE_PERIOD);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.tick(Instant::now()),
            }
        }
        debug!("MAVLink handshake loop stopped");
    }
}
