//! # Serial Communication Module
//!
//! Handles the USB-FTDI serial link to the force/torque sensor.
//!
//! This module handles:
//! - Opening the serial port at 5,000,000 baud (8N1, no flow control)
//! - Auto-detecting the device among candidate paths
//! - The [`SensorLink`](port_trait::SensorLink) abstraction used by the
//!   synchronizer and the controllers
//! - A virtual sensor for running without hardware

pub mod port_trait;
pub mod virtual_sensor;

use crate::error::{OptoFtError, Result};
use port_trait::TokioSerialLink;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

/// Default link baud rate
pub const DEFAULT_BAUD_RATE: u32 = 5_000_000;

/// Default sensor device paths to try (in order of preference)
pub const DEFAULT_DEVICE_PATHS: &[&str] = &[
    "/dev/ttyUSB0", // FTDI bridge, first enumerated
    "/dev/ttyUSB1",
];

/// Sensor serial port handle
///
/// Owns the opened port until it is turned into a [`TokioSerialLink`].
pub struct SensorSerial {
    /// Serial port handle
    port: tokio_serial::SerialStream,
    /// Device path (e.g., /dev/ttyUSB0)
    device_path: String,
}

impl std::fmt::Debug for SensorSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorSerial")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl SensorSerial {
    /// Open the sensor, auto-detecting the device path
    ///
    /// # Errors
    ///
    /// Returns `SerialPortNotFound` if no candidate path could be opened
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use opto_ft::serial::SensorSerial;
    ///
    /// fn main() -> anyhow::Result<()> {
    ///     let serial = SensorSerial::open(5_000_000)?;
    ///     println!("Connected to {}", serial.device_path());
    ///     Ok(())
    /// }
    /// ```
    pub fn open(baud_rate: u32) -> Result<Self> {
        Self::open_with_paths(DEFAULT_DEVICE_PATHS, baud_rate)
    }

    /// Open the first path in `paths` that works
    ///
    /// # Arguments
    ///
    /// * `paths` - Device paths to try (e.g., &["/dev/ttyUSB0"])
    /// * `baud_rate` - Link speed
    ///
    /// # Returns
    ///
    /// * `Result<SensorSerial>` - Connected serial port or error
    pub fn open_with_paths(paths: &[&str], baud_rate: u32) -> Result<Self> {
        for path in paths {
            debug!("Trying to open serial port: {}", path);

            match Self::open_path(path, baud_rate) {
                Ok(serial) => {
                    info!("Opened sensor at {} ({} baud)", path, baud_rate);
                    return Ok(serial);
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        Err(OptoFtError::SerialPortNotFound(paths.join(", ")))
    }

    /// Open one specific device path
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the port cannot be opened or configured
    pub fn open_path(path: &str, baud_rate: u32) -> Result<Self> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| OptoFtError::Transport(format!("Failed to open {}: {}", path, e)))?;

        Ok(Self {
            port,
            device_path: path.to_string(),
        })
    }

    /// Path of the opened device
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Hand the port over as a [`SensorLink`](port_trait::SensorLink)
    pub fn into_link(self) -> TokioSerialLink {
        TokioSerialLink::new(self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_BAUD_RATE, 5_000_000);
        assert_eq!(DEFAULT_DEVICE_PATHS, &["/dev/ttyUSB0", "/dev/ttyUSB1"]);
    }

    #[test]
    fn test_open_with_invalid_paths_returns_error() {
        let invalid_paths = &["/dev/nonexistent0", "/dev/nonexistent1"];
        let result = SensorSerial::open_with_paths(invalid_paths, DEFAULT_BAUD_RATE);

        match result {
            Err(OptoFtError::SerialPortNotFound(msg)) => {
                assert!(msg.contains("/dev/nonexistent0"));
                assert!(msg.contains("/dev/nonexistent1"));
            }
            other => panic!("Expected SerialPortNotFound error, got: {:?}", other),
        }
    }

    #[test]
    fn test_open_with_empty_paths_returns_error() {
        let empty_paths: &[&str] = &[];
        let result = SensorSerial::open_with_paths(empty_paths, DEFAULT_BAUD_RATE);
        assert!(matches!(result, Err(OptoFtError::SerialPortNotFound(_))));
    }

    #[test]
    fn test_open_path_with_invalid_path_returns_error() {
        let result = SensorSerial::open_path("/dev/nonexistent_serial_device_12345", DEFAULT_BAUD_RATE);

        match result {
            Err(OptoFtError::Transport(msg)) => {
                assert!(msg.contains("/dev/nonexistent_serial_device_12345"));
                assert!(msg.contains("Failed to open"));
            }
            other => panic!("Expected Transport error, got: {:?}", other),
        }
    }

    // Integration test - only runs if the sensor is connected
    #[test]
    #[ignore] // Run with: cargo test -- --ignored
    fn test_open_with_real_hardware() {
        match SensorSerial::open(DEFAULT_BAUD_RATE) {
            Ok(serial) => {
                println!("Opened sensor at: {}", serial.device_path());
                assert!(DEFAULT_DEVICE_PATHS.contains(&serial.device_path()));
            }
            Err(_) => println!("No sensor hardware detected (this is OK for CI/CD)"),
        }
    }
}
