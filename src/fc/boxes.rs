//! Flight mode ("box") decoding
//!
//! The FC reports its configured modes as a list of permanent box ids plus a
//! bit set of which of those are currently active. The layout of the bit set
//! differs per firmware family, see [`ModeFlags`].

use super::FcVariant;

/// Flight modes the link knows about, independent of firmware numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoxMode {
    Arm,
    Angle,
    Horizon,
    Mag,
    NavAltHold,
    HeadingHold,
    HeadFree,
    HeadAdj,
    CamStab,
    NavRth,
    NavPosHold,
    Manual,
    Passthru,
    Beeper,
    LedLow,
    Lights,
    Calib,
    OsdOff,
    Telemetry,
    AutoTune,
    Servo1,
    Servo2,
    Servo3,
    Blackbox,
    Failsafe,
    NavWp,
    AirMode,
    ThreeD,
    HomeReset,
    GcsNav,
    FpvAngleMix,
    BlackboxErase,
    Surface,
    Flaperon,
    TurnAssist,
    NavLaunch,
    ServoAutotrim,
    KillSwitch,
    Camera1,
    Camera2,
    Camera3,
    FlipOverAfterCrash,
    OsdAlt1,
    OsdAlt2,
    OsdAlt3,
    NavCourseHold,
    Braking,
    User1,
    User2,
    User3,
    User4,
    LoiterChange,
    MspRcOverride,
    PreArm,
    Turtle,
    NavCruise,
    AutoLevelTrim,
    WpPlanner,
    Soaring,
    MissionChange,
    BeeperMute,
    AntiGravity,
    BeepGpsCount,
    VtxPitMode,
    PidAudio,
    Paralyze,
    GpsRescue,
    AcroTrainer,
    VtxControlDisable,
    LaunchControl,
    StickCommandDisable,
    Ready,
    LapTimerReset,
}

/// (mode, permanent id) pairs as numbered by iNav
const INAV_BOXES: &[(BoxMode, u8)] = &[
    (BoxMode::Arm, 0),
    (BoxMode::Angle, 1),
    (BoxMode::Horizon, 2),
    (BoxMode::NavAltHold, 3),
    (BoxMode::HeadingHold, 5),
    (BoxMode::HeadFree, 6),
    (BoxMode::HeadAdj, 7),
    (BoxMode::CamStab, 8),
    (BoxMode::NavRth, 10),
    (BoxMode::NavPosHold, 11),
    (BoxMode::Manual, 12),
    (BoxMode::Beeper, 13),
    (BoxMode::LedLow, 15),
    (BoxMode::Lights, 16),
    (BoxMode::OsdOff, 19),
    (BoxMode::Telemetry, 20),
    (BoxMode::AutoTune, 21),
    (BoxMode::Blackbox, 26),
    (BoxMode::Failsafe, 27),
    (BoxMode::NavWp, 28),
    (BoxMode::AirMode, 29),
    (BoxMode::HomeReset, 30),
    (BoxMode::GcsNav, 31),
    (BoxMode::FpvAngleMix, 32),
    (BoxMode::Surface, 33),
    (BoxMode::Flaperon, 34),
    (BoxMode::TurnAssist, 35),
    (BoxMode::NavLaunch, 36),
    (BoxMode::ServoAutotrim, 37),
    (BoxMode::KillSwitch, 38),
    (BoxMode::Camera1, 39),
    (BoxMode::Camera2, 40),
    (BoxMode::Camera3, 41),
    (BoxMode::OsdAlt1, 42),
    (BoxMode::OsdAlt2, 43),
    (BoxMode::OsdAlt3, 44),
    (BoxMode::NavCourseHold, 45),
    (BoxMode::Braking, 46),
    (BoxMode::User1, 47),
    (BoxMode::User2, 48),
    (BoxMode::LoiterChange, 49),
    (BoxMode::MspRcOverride, 50),
    (BoxMode::PreArm, 51),
    (BoxMode::Turtle, 52),
    (BoxMode::NavCruise, 53),
    (BoxMode::AutoLevelTrim, 54),
    (BoxMode::WpPlanner, 55),
    (BoxMode::Soaring, 56),
    (BoxMode::User3, 57),
    (BoxMode::User4, 58),
    (BoxMode::MissionChange, 59),
    (BoxMode::BeeperMute, 60),
];

/// (mode, permanent id) pairs as numbered by Betaflight
const BETAFLIGHT_BOXES: &[(BoxMode, u8)] = &[
    (BoxMode::Arm, 0),
    (BoxMode::Angle, 1),
    (BoxMode::Horizon, 2),
    (BoxMode::AntiGravity, 4),
    (BoxMode::Mag, 5),
    (BoxMode::HeadFree, 6),
    (BoxMode::HeadAdj, 7),
    (BoxMode::CamStab, 8),
    (BoxMode::Passthru, 12),
    (BoxMode::Beeper, 13),
    (BoxMode::LedLow, 15),
    (BoxMode::Calib, 17),
    (BoxMode::OsdOff, 19),
    (BoxMode::Telemetry, 20),
    (BoxMode::Servo1, 23),
    (BoxMode::Servo2, 24),
    (BoxMode::Servo3, 25),
    (BoxMode::Blackbox, 26),
    (BoxMode::Failsafe, 27),
    (BoxMode::AirMode, 28),
    (BoxMode::ThreeD, 29),
    (BoxMode::FpvAngleMix, 30),
    (BoxMode::BlackboxErase, 31),
    (BoxMode::Camera1, 32),
    (BoxMode::Camera2, 33),
    (BoxMode::Camera3, 34),
    (BoxMode::FlipOverAfterCrash, 35),
    (BoxMode::PreArm, 36),
    (BoxMode::BeepGpsCount, 37),
    (BoxMode::VtxPitMode, 39),
    (BoxMode::User1, 40),
    (BoxMode::User2, 41),
    (BoxMode::User3, 42),
    (BoxMode::User4, 43),
    (BoxMode::PidAudio, 44),
    (BoxMode::Paralyze, 45),
    (BoxMode::GpsRescue, 46),
    (BoxMode::AcroTrainer, 47),
    (BoxMode::VtxControlDisable, 48),
    (BoxMode::LaunchControl, 49),
    (BoxMode::MspRcOverride, 50),
    (BoxMode::StickCommandDisable, 51),
    (BoxMode::BeeperMute, 52),
    (BoxMode::Ready, 53),
    (BoxMode::LapTimerReset, 54),
];

/// Look up the mode a firmware's permanent box id stands for
pub fn box_for_permanent_id(variant: FcVariant, permanent_id: u8) -> Option<BoxMode> {
    let table = match variant {
        FcVariant::Inav => INAV_BOXES,
        FcVariant::Betaflight => BETAFLIGHT_BOXES,
        FcVariant::Ardupilot | FcVariant::Unknown => return None,
    };
    table
        .iter()
        .find(|(_, id)| *id == permanent_id)
        .map(|(mode, _)| *mode)
}

/// Active-mode bit set as reported by the FC status message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeFlags {
    /// iNav: array of 32-bit words, bit `i % 32` of word `i / 32`
    Inav(Vec<u32>),
    /// Betaflight: byte array, bit `i % 8` of byte `i / 8`
    Betaflight(Vec<u8>),
}

impl ModeFlags {
    /// Whether the box at list index `index` is active; missing words read as clear
    pub fn is_set(&self, index: usize) -> bool {
        match self {
            ModeFlags::Inav(words) => words
                .get(index / 32)
                .is_some_and(|word| (word >> (index % 32)) & 1 == 1),
            ModeFlags::Betaflight(bytes) => bytes
                .get(index / 8)
                .is_some_and(|byte| (byte >> (index % 8)) & 1 == 1),
        }
    }

    fn variant(&self) -> FcVariant {
        match self {
            ModeFlags::Inav(_) => FcVariant::Inav,
            ModeFlags::Betaflight(_) => FcVariant::Betaflight,
        }
    }
}

/// Modes currently active given the FC's box id list
pub fn active_boxes(flags: &ModeFlags, box_ids: &[u8]) -> Vec<BoxMode> {
    let variant = flags.variant();
    box_ids
        .iter()
        .enumerate()
        .filter(|(index, _)| flags.is_set(*index))
        .filter_map(|(_, &permanent_id)| box_for_permanent_id(variant, permanent_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera2_permanent_ids_differ_per_variant() {
        assert_eq!(box_for_permanent_id(FcVariant::Inav, 40), Some(BoxMode::Camera2));
        assert_eq!(box_for_permanent_id(FcVariant::Betaflight, 33), Some(BoxMode::Camera2));
        assert_eq!(box_for_permanent_id(FcVariant::Inav, 0), Some(BoxMode::Arm));
        assert_eq!(box_for_permanent_id(FcVariant::Betaflight, 0), Some(BoxMode::Arm));
        assert_eq!(box_for_permanent_id(FcVariant::Ardupilot, 0), None);
    }

    #[test]
    fn test_inav_active_boxes_from_words() {
        // Box list: ARM, ANGLE, ..., CAMERA2 at index 33
        let mut box_ids = vec![0u8, 1];
        box_ids.resize(33, 2);
        box_ids.push(40);

        let flags = ModeFlags::Inav(vec![0b01, 0b10]);
        let active = active_boxes(&flags, &box_ids);
        assert_eq!(active, vec![BoxMode::Arm, BoxMode::Camera2]);
    }

    #[test]
    fn test_betaflight_active_boxes_from_bytes() {
        let box_ids = [0u8, 1, 2, 33];
        let flags = ModeFlags::Betaflight(vec![0b1001]);
        let active = active_boxes(&flags, &box_ids);
        assert_eq!(active, vec![BoxMode::Arm, BoxMode::Camera2]);
    }

    #[test]
    fn test_short_flag_array_reads_clear() {
        let box_ids = [0u8; 20];
        let flags = ModeFlags::Betaflight(vec![0x00]);
        assert!(active_boxes(&flags, &box_ids).is_empty());
        assert!(!flags.is_set(19));
    }

    #[test]
    fn test_unknown_permanent_id_ignored() {
        let flags = ModeFlags::Inav(vec![0b1]);
        assert!(active_boxes(&flags, &[200]).is_empty());
    }
}
