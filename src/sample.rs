//! # Decoded Samples
//!
//! The decode pipeline shared by polling and streaming: a body that passed
//! the synchronizer goes through the packet decoder, then the units
//! converter and the IMU decoder.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::calibration::state::{CalibrationState, SharedCalibration};
use crate::calibration::units::{self, ChannelReadings};
use crate::imu::{decode_imu, ImuReading};
use crate::packet::decoder::{DecodedPacket, PacketDecoder, RawSample};
use crate::packet::protocol::NUM_CHANNELS;
use crate::packet::sync::FrameHeader;

/// Calibrated values of a sample that passed its checksum
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub report_id: u8,
    pub differential_volts: [f64; NUM_CHANNELS],
    pub sum_volts: [f64; NUM_CHANNELS],
    /// Fx, Fy, Fz, Tx, Ty, Tz (zero if any sum channel reads exactly zero)
    pub wrench: [f64; NUM_CHANNELS],
    pub saturated: [bool; NUM_CHANNELS],
    /// `None` for report ids without a known IMU layout
    pub imu: Option<ImuReading>,
    /// Present for quaternion reports
    pub rotation: Option<[[f64; 3]; 3]>,
    pub temperature_celsius: Option<f64>,
    pub raw: RawSample,
}

impl Measurement {
    /// Convert a checksum-valid raw sample
    pub fn from_raw(raw: RawSample, calibration: &CalibrationState) -> Self {
        let ChannelReadings {
            differential_volts,
            sum_volts,
            saturated,
            wrench,
        } = units::convert(&raw, calibration);
        let imu = decode_imu(raw.report_id, &raw.imu);

        Self {
            report_id: raw.report_id,
            differential_volts,
            sum_volts,
            wrench,
            saturated,
            rotation: imu.as_ref().and_then(ImuReading::rotation_matrix),
            imu,
            temperature_celsius: raw.temperature.map(units::temperature_celsius),
            raw,
        }
    }

    pub fn any_saturated(&self) -> bool {
        self.saturated.iter().any(|&s| s)
    }
}

/// One frame as seen by callers
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    /// Body bytes as received
    pub raw: Vec<u8>,
    pub checksum_ok: bool,
    pub counter: u8,
    pub received_at: DateTime<Utc>,
    /// Present iff `checksum_ok`
    pub measurement: Option<Measurement>,
}

impl DecodedSample {
    pub fn is_valid(&self) -> bool {
        self.checksum_ok
    }
}

/// Packet decoder plus the calibration it converts with
#[derive(Debug, Clone)]
pub struct SamplePipeline {
    decoder: PacketDecoder,
    calibration: SharedCalibration,
}

impl SamplePipeline {
    pub fn new(decoder: PacketDecoder, calibration: SharedCalibration) -> Self {
        Self {
            decoder,
            calibration,
        }
    }

    pub fn body_len(&self) -> usize {
        self.decoder.body_len()
    }

    /// Decode a body read after `header`
    ///
    /// The calibration state is read-locked only for the conversion.
    pub fn decode(&self, header: FrameHeader, body: &[u8]) -> DecodedSample {
        let DecodedPacket {
            raw_bytes,
            checksum_ok,
            sample,
        } = self.decoder.decode(body);

        let measurement = sample.map(|raw| {
            let calibration = self.calibration.read().unwrap_or_else(|e| e.into_inner());
            Measurement::from_raw(raw, &calibration)
        });

        DecodedSample {
            raw: raw_bytes,
            checksum_ok,
            counter: header.counter,
            received_at: Utc::now(),
            measurement,
        }
    }
}
