//! # FPV Air Link Library
//!
//! The airborne half of a drone link: talks MSP or MAVLink to the flight
//! controller over serial, and relays telemetry, RC and video to a ground
//! station over UDP.
//!
//! This library provides the protocol engines, the serial supervisor and the
//! datagram link; camera capture and encoding plug in through [`media`].

pub mod codec;
pub mod config;
pub mod error;
pub mod fc;
pub mod link;
pub mod mavlink;
pub mod media;
pub mod msp;
pub mod serial;
pub mod telemetry;
