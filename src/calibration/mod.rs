//! # Calibration Module
//!
//! Converts raw converter counts into calibrated physical values.
//!
//! This module handles:
//! - ADC data-rate and PGA gain tables (α/β linearization constants)
//! - Per-channel calibration state (gain, rate, OFC/FSC registers)
//! - Differential and sum voltages
//! - Saturation detection
//! - Wrench computation through the 6×6 calibration matrix

pub mod adc;
pub mod state;
pub mod units;

pub use adc::{DataRate, PgaGain};
pub use state::{CalibrationMatrix, CalibrationState, ChannelCalibration, SharedCalibration};
