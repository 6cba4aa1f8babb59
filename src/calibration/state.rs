//! # Calibration State
//!
//! Per-channel converter settings and registers, the reference voltage and
//! the 6×6 calibration matrix. Shared between the command path (writer) and
//! the capture loop (reader) as a [`SharedCalibration`].

use std::sync::{Arc, RwLock};

use crate::packet::decoder::RegisterReport;
use crate::packet::protocol::{AdcSetting, Channel, NUM_CHANNELS};

use super::adc::{DataRate, PgaGain};

/// Default converter reference voltage
pub const DEFAULT_VREF: f64 = 2.5;

/// Row-major 6×6 matrix mapping channel ratios to a wrench
pub type CalibrationMatrix = [[f64; NUM_CHANNELS]; NUM_CHANNELS];

pub const IDENTITY_MATRIX: CalibrationMatrix = [
    [1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
    [0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
];

/// Settings and self-calibration registers of one converter channel
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelCalibration {
    pub gain: PgaGain,
    pub data_rate: DataRate,
    /// Offset calibration register; `None` until read from the device
    pub ofc: Option<i32>,
    /// Full-scale calibration register; `None` until read from the device
    pub fsc: Option<u32>,
    pub input_buffer: bool,
    pub auto_calibrate: bool,
}

impl ChannelCalibration {
    /// Both registers, once they have been read
    pub fn registers(&self) -> Option<(i32, u32)> {
        self.ofc.zip(self.fsc)
    }

    /// Record the effect of an ADC setting command
    pub fn apply(&mut self, setting: &AdcSetting) {
        match *setting {
            AdcSetting::Root {
                auto_calibrate,
                input_buffer,
            } => {
                self.auto_calibrate = auto_calibrate;
                self.input_buffer = input_buffer;
            }
            AdcSetting::DataRate(rate) => self.data_rate = rate,
            AdcSetting::Gain(gain) => self.gain = gain,
            // Mux changes and self-calibration do not touch stored state;
            // fresh registers arrive with the next register report.
            AdcSetting::PositiveInput(_)
            | AdcSetting::NegativeInput(_)
            | AdcSetting::SelfCalibrate
            | AdcSetting::ReportRegisters => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationState {
    channels: [ChannelCalibration; NUM_CHANNELS],
    pub vref: f64,
    pub matrix: CalibrationMatrix,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            channels: [ChannelCalibration::default(); NUM_CHANNELS],
            vref: DEFAULT_VREF,
            matrix: IDENTITY_MATRIX,
        }
    }
}

impl CalibrationState {
    pub fn new(vref: f64, matrix: CalibrationMatrix) -> Self {
        Self {
            vref,
            matrix,
            ..Self::default()
        }
    }

    pub fn channels(&self) -> &[ChannelCalibration; NUM_CHANNELS] {
        &self.channels
    }

    pub fn channel(&self, channel: Channel) -> &ChannelCalibration {
        &self.channels[channel.index()]
    }

    pub fn channel_mut(&mut self, channel: Channel) -> &mut ChannelCalibration {
        &mut self.channels[channel.index()]
    }

    pub fn apply_setting(&mut self, channel: Channel, setting: &AdcSetting) {
        self.channel_mut(channel).apply(setting);
    }

    pub fn set_registers(&mut self, report: &RegisterReport) {
        let ch = self.channel_mut(report.channel);
        ch.ofc = Some(report.ofc);
        ch.fsc = Some(report.fsc);
    }

    /// Forget register values (after a channel reset)
    pub fn clear_registers(&mut self, channel: Channel) {
        let ch = self.channel_mut(channel);
        ch.ofc = None;
        ch.fsc = None;
    }

    /// Back to power-on defaults, keeping Vref and the matrix
    pub fn reset_channels(&mut self) {
        self.channels = [ChannelCalibration::default(); NUM_CHANNELS];
    }
}

/// Calibration state shared between the command path and the capture loop
pub type SharedCalibration = Arc<RwLock<CalibrationState>>;
