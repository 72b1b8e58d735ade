//! # MAVLink Support
//!
//! Framing over the `mavlink` crate's `common` dialect, the parameter and
//! stream bookkeeping ArduPilot needs, and the engine that drives it.

pub mod engine;
pub mod frame;
pub mod params;
pub mod records;
pub mod streams;

pub use engine::{MavlinkEngine, MavlinkIds};
pub use frame::MavlinkFrame;
