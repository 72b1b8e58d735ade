//! # Telemetry Module
//!
//! Raw telemetry records and the bounded queues that carry them from the
//! producers (FC engines, device sampler) to the datagram session.
//!
//! This module handles:
//! - The `TelemetryData` record (message code + raw payload)
//! - Non-blocking, drop-if-full producer queues
//! - Re-encoding records into the outbound wire schema ([`normalizer`])
//! - Periodic device-side samples ([`device`])

pub mod device;
pub mod normalizer;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

/// Capacity of the FC-origin telemetry queue
pub const FC_QUEUE_CAPACITY: usize = 30;

/// Capacity of the device-origin telemetry queue
pub const DEVICE_QUEUE_CAPACITY: usize = 10;

/// One raw telemetry record keyed by its message code
///
/// FC-origin records carry the little-endian payload exactly as the FC sent
/// it; device-origin records (codes from `0x4000`) use the same convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryData {
    pub code: u16,
    pub data: Bytes,
}

impl TelemetryData {
    pub fn new(code: u16, data: impl Into<Bytes>) -> Self {
        Self {
            code,
            data: data.into(),
        }
    }
}

/// Producer side of a bounded telemetry queue
///
/// Offering never blocks: when the consumer falls behind, the newest record
/// is dropped.
#[derive(Debug, Clone)]
pub struct TelemetryQueue {
    tx: mpsc::Sender<TelemetryData>,
}

impl TelemetryQueue {
    /// Create a queue and return its producer and consumer halves
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<TelemetryData>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a record; returns `false` when it was dropped
    pub fn offer(&self, code: u16, data: impl Into<Bytes>) -> bool {
        match self.tx.try_send(TelemetryData::new(code, data)) {
            Ok(()) => true,
            Err(e) => {
                trace!("Telemetry record 0x{:04X} dropped: {}", code, e);
                false
            }
        }
    }
}
