//! # Error Types
//!
//! Custom error types for the Opto-FT driver using `thiserror`.
//!
//! Framing and checksum faults are normally absorbed by the decode pipeline
//! and show up as an invalid [`DecodedSample`](crate::sample::DecodedSample);
//! the variants below are what escapes to callers.

use thiserror::Error;

/// Main error type for the Opto-FT driver
#[derive(Debug, Error)]
pub enum OptoFtError {
    /// Link I/O failure that exhausted its retry budget
    #[error("Transport error: {0}")]
    Transport(String),

    /// None of the candidate serial devices could be opened
    #[error("Serial port not found (tried: {0})")]
    SerialPortNotFound(String),

    /// No valid frame header within the byte budget
    #[error("Frame sync timeout after {0} byte attempts")]
    FrameSyncTimeout(usize),

    /// Header or payload checksum did not match
    #[error("Checksum mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Command issued while the streaming controller owns the device
    #[error("Device busy: streaming is active")]
    DeviceBusy,

    /// OFC/FSC register query failed; prior calibration is kept
    #[error("Calibration read failed for channel {channel}: {reason}")]
    CalibrationRead { channel: usize, reason: String },

    /// Argument rejected at the API boundary (channel index, rate, mode name)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Telemetry serialization errors
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] serde_json::Error),
}

impl OptoFtError {
    /// Wrap a link-level I/O error as a transport failure
    pub fn transport(context: &str, err: std::io::Error) -> Self {
        Self::Transport(format!("{}: {}", context, err))
    }
}

/// Result type alias for the Opto-FT driver
pub type Result<T> = std::result::Result<T, OptoFtError>;
