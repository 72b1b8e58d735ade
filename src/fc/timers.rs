//! On-time / fly-time bookkeeping
//!
//! Neither MSP nor the heartbeat reports these directly, so they are derived
//! from the armed flag once per poll cycle.

use tokio::time::Instant;

/// Seconds reported in a `DD_TIMERS` record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub on_time: i32,
    pub fly_time: i32,
    pub last_arm_time: i32,
}

impl TimerSnapshot {
    /// Little-endian payload in the order on, fly, last arm
    pub fn to_le_bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.on_time.to_le_bytes());
        out[4..8].copy_from_slice(&self.fly_time.to_le_bytes());
        out[8..12].copy_from_slice(&self.last_arm_time.to_le_bytes());
        out
    }
}

/// Armed-time accumulator for one FC session
#[derive(Debug, Clone, Default)]
pub struct TimerState {
    session_start: Option<Instant>,
    arm_start: Option<Instant>,
    saved_fly_secs: i32,
    last: TimerSnapshot,
}

fn secs_between(from: Instant, to: Instant) -> i32 {
    i32::try_from(to.saturating_duration_since(from).as_secs()).unwrap_or(i32::MAX)
}

impl TimerState {
    /// Start a new session; all accumulated time is discarded
    pub fn start(&mut self, now: Instant) {
        *self = Self {
            session_start: Some(now),
            ..Self::default()
        };
    }

    pub fn is_armed(&self) -> bool {
        self.arm_start.is_some()
    }

    /// Apply the armed flag decoded from the latest mode flags
    pub fn update_armed(&mut self, armed: bool, now: Instant) {
        match (armed, self.arm_start) {
            (true, None) => self.arm_start = Some(now),
            (false, Some(start)) => {
                self.saved_fly_secs = self.saved_fly_secs.saturating_add(secs_between(start, now));
                self.arm_start = None;
            }
            _ => {}
        }
    }

    /// Recompute durations; fly and last-arm time hold their value while disarmed
    pub fn snapshot(&mut self, now: Instant) -> TimerSnapshot {
        if let Some(start) = self.session_start {
            self.last.on_time = secs_between(start, now);
        }
        if let Some(start) = self.arm_start {
            self.last.last_arm_time = secs_between(start, now);
            self.last.fly_time = self.saved_fly_secs.saturating_add(self.last.last_arm_time);
        }
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fly_time_accumulates_across_arm_cycles() {
        let t0 = Instant::now();
        let mut timers = TimerState::default();
        timers.start(t0);

        timers.update_armed(true, t0 + Duration::from_secs(10));
        let snap = timers.snapshot(t0 + Duration::from_secs(40));
        assert_eq!(snap.on_time, 40);
        assert_eq!(snap.last_arm_time, 30);
        assert_eq!(snap.fly_time, 30);

        timers.update_armed(false, t0 + Duration::from_secs(50));
        let snap = timers.snapshot(t0 + Duration::from_secs(60));
        assert_eq!(snap.on_time, 60);
        assert_eq!(snap.fly_time, 30);
        assert!(!timers.is_armed());

        timers.update_armed(true, t0 + Duration::from_secs(70));
        let snap = timers.snapshot(t0 + Duration::from_secs(75));
        assert_eq!(snap.last_arm_time, 5);
        assert_eq!(snap.fly_time, 45);
    }

    #[test]
    fn test_repeated_armed_flag_keeps_first_timestamp() {
        let t0 = Instant::now();
        let mut timers = TimerState::default();
        timers.start(t0);
        timers.update_armed(true, t0);
        timers.update_armed(true, t0 + Duration::from_secs(5));
        assert_eq!(timers.snapshot(t0 + Duration::from_secs(8)).last_arm_time, 8);
    }

    #[test]
    fn test_start_resets_session() {
        let t0 = Instant::now();
        let mut timers = TimerState::default();
        timers.start(t0);
        timers.update_armed(true, t0);
        timers.snapshot(t0 + Duration::from_secs(3));

        timers.start(t0 + Duration::from_secs(4));
        assert_eq!(timers.snapshot(t0 + Duration::from_secs(4)), TimerSnapshot::default());
    }

    #[test]
    fn test_snapshot_byte_order() {
        let snap = TimerSnapshot { on_time: 1, fly_time: 2, last_arm_time: 3 };
        assert_eq!(snap.to_le_bytes(), [1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
    }
}
