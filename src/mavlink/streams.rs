//! Telemetry stream schedule
//!
//! ArduPilot only streams what it is asked for. Each stream is requested
//! with `MAV_CMD_SET_MESSAGE_INTERVAL` at a multiple of the base telemetry
//! period, and asked again when it goes quiet for five of its intervals.

use std::time::Duration;

use tokio::time::Instant;

use super::frame::{
    MSG_ID_ATTITUDE, MSG_ID_BATTERY_STATUS, MSG_ID_GLOBAL_POSITION_INT, MSG_ID_GPS_RAW_INT,
    MSG_ID_HOME_POSITION, MSG_ID_RC_CHANNELS, MSG_ID_SCALED_PRESSURE, MSG_ID_STATUSTEXT,
    MSG_ID_SYSTEM_TIME, MSG_ID_SYS_STATUS, MSG_ID_VFR_HUD,
};

/// Interval value that stops a stream
pub const INTERVAL_DISABLED: f32 = -1.0;

#[derive(Debug, Clone, Copy)]
struct Stream {
    msg_id: u32,
    /// Multiple of the base telemetry period
    multiplier: u32,
    /// Requested only until the first message arrives
    until_first: bool,
}

const fn stream(msg_id: u32, multiplier: u32, until_first: bool) -> Stream {
    Stream {
        msg_id,
        multiplier,
        until_first,
    }
}

const STREAMS: [Stream; 11] = [
    stream(MSG_ID_ATTITUDE, 1, false),
    stream(MSG_ID_BATTERY_STATUS, 10, false),
    stream(MSG_ID_SYS_STATUS, 10, false),
    stream(MSG_ID_STATUSTEXT, 20, true),
    stream(MSG_ID_GPS_RAW_INT, 10, false),
    stream(MSG_ID_GLOBAL_POSITION_INT, 10, false),
    stream(MSG_ID_HOME_POSITION, 50, true),
    stream(MSG_ID_SYSTEM_TIME, 10, false),
    stream(MSG_ID_RC_CHANNELS, 10, false),
    stream(MSG_ID_SCALED_PRESSURE, 10, false),
    stream(MSG_ID_VFR_HUD, 10, false),
];

/// Base telemetry period in microseconds for a refresh rate in Hz
pub fn base_interval_us(telemetry_hz: u8) -> u32 {
    1_000_000 / u32::from(telemetry_hz.max(1))
}

/// Last arrival of every scheduled stream
#[derive(Debug, Clone, Default)]
pub struct StreamSchedule {
    last_seen: [Option<Instant>; STREAMS.len()],
}

impl StreamSchedule {
    /// Record an arrival; ids outside the schedule are ignored
    pub fn mark(&mut self, msg_id: u32, now: Instant) {
        if let Some(index) = STREAMS.iter().position(|s| s.msg_id == msg_id) {
            self.last_seen[index] = Some(now);
        }
    }

    /// `(message id, interval µs)` for every stream that needs a request
    pub fn due(&self, base_interval_us: u32, now: Instant) -> Vec<(u32, f32)> {
        STREAMS
            .iter()
            .zip(&self.last_seen)
            .filter_map(|(stream, last)| {
                let interval_us = base_interval_us.saturating_mul(stream.multiplier);
                let due = match last {
                    None => true,
                    Some(_) if stream.until_first => false,
                    Some(seen) => {
                        let quiet = Duration::from_micros(u64::from(interval_us) * 5);
                        now.saturating_duration_since(*seen) >= quiet
                    }
                };
                due.then_some((stream.msg_id, interval_us as f32))
            })
            .collect()
    }

    /// Every scheduled message id
    pub fn all_ids() -> impl Iterator<Item = u32> {
        STREAMS.iter().map(|s| s.msg_id)
    }
}
