//! # MSP Module
//!
//! MultiWii Serial Protocol support for iNav and Betaflight.
//!
//! This module handles:
//! - Frame encoding and run parsing for MSP v1 and v2 ([`frame`])
//! - Paged box list assembly ([`paged`])
//! - The discovery and poll engine ([`engine`])

pub mod engine;
pub mod frame;
pub mod paged;
pub mod protocol;

pub use engine::MspEngine;
pub use frame::{MspDirection, MspFrame, MspVersion};
