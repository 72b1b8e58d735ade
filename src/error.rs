//! # Error Types
//!
//! Custom error types for FPV Air Link using `thiserror`.

use thiserror::Error;

/// Main error type for FPV Air Link
#[derive(Debug, Error)]
pub enum AirLinkError {
    /// A read or skip ran past the end of a buffer
    #[error("Buffer underrun: needed {needed} bytes, {remaining} remaining")]
    BufferUnderrun { needed: usize, remaining: usize },

    /// MSP / MAVLink / datagram protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serial port errors
    #[error("Serial error: {0}")]
    Serial(String),

    /// No usable flight controller port was found
    #[error("Serial port not found: {0}")]
    SerialPortNotFound(String),

    /// The OS refused access to the serial device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Ground-pushed configuration blob could not be applied
    #[error("Config blob error: {0}")]
    ConfigBlob(#[from] crate::config::ConfigBlobError),

    /// Camera, encoder or recorder failures
    #[error("Media error: {0}")]
    Media(String),

    /// Datagram transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for FPV Air Link
pub type Result<T> = std::result::Result<T, AirLinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_underrun_message() {
        let err = AirLinkError::BufferUnderrun { needed: 4, remaining: 1 };
        assert_eq!(err.to_string(), "Buffer underrun: needed 4 bytes, 1 remaining");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let err: AirLinkError = io.into();
        assert!(matches!(err, AirLinkError::Io(_)));
    }
}
