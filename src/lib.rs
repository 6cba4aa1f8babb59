//! # Opto-FT
//!
//! Host-side driver for an optical 6-axis force/torque sensor on a
//! USB-FTDI serial link.
//!
//! This library provides:
//! - CRC engines, frame synchronization and packet decoding ([`packet`])
//! - IMU fixed-point decoding ([`imu`])
//! - Converter calibration and unit conversion ([`calibration`])
//! - Command/response and streaming controllers ([`device`])
//! - Serial transport and a virtual sensor ([`serial`])
//! - JSONL sample recording ([`telemetry`])

pub mod calibration;
pub mod config;
pub mod device;
pub mod error;
pub mod imu;
pub mod packet;
pub mod sample;
pub mod serial;
pub mod telemetry;
