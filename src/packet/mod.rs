//! # Sensor Packet Protocol
//!
//! Framing and checksums of the sensor's binary stream.
//!
//! This module handles:
//! - CRC4/CRC8/CRC32 checksums (bitwise and table-driven)
//! - Frame synchronization on the init byte and header checksum
//! - Positional decoding of the 53-byte frame body
//! - Command encoding with CRC trailers
//! - Calibration-register reports and ASCII status lines

pub mod protocol;
pub mod fields;
pub mod crc;
pub mod encoder;
pub mod decoder;
pub mod sync;
