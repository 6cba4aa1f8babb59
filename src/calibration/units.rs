//! # Units Conversion
//!
//! Raw converter counts to volts, per-channel saturation, and the wrench.
//!
//! Differential channels go through the converter's calibration transfer:
//!
//! ```text
//! V = (raw / (β·FSC) + OFC / α) · 2·Vref / G
//! ```
//!
//! With unread registers the ideal transfer is used (OFC term 0, β·FSC = 2²³).

use serde::Serialize;

use crate::packet::decoder::RawSample;
use crate::packet::protocol::NUM_CHANNELS;

use super::state::{CalibrationMatrix, CalibrationState, ChannelCalibration};

/// β·FSC of an ideal converter
pub const IDEAL_FULL_SCALE: f64 = 8_388_608.0;

/// Sum channels are 12-bit readings of Vref
pub const SUM_FULL_SCALE: f64 = 4096.0;

/// LED bias voltage at the converter inputs
pub const BIAS_VOLTAGE: f64 = 4.775;

/// Largest valid sum voltage
pub const MAX_SUM_VOLTS: f64 = 2.5;

/// Absolute input range with the input buffer enabled
pub const BUFFERED_INPUT_RANGE: (f64, f64) = (0.0, 3.0);

/// Absolute input range with the input buffer bypassed
pub const UNBUFFERED_INPUT_RANGE: (f64, f64) = (-0.1, 5.1);

/// Degrees Celsius per LSB of the temperature field
pub const TEMPERATURE_SCALE: f64 = 0.0625;

/// Differential channel voltage
///
/// An FSC of zero is treated like an unread register.
pub fn differential_volts(raw: i32, channel: &ChannelCalibration, vref: f64) -> f64 {
    let gain = f64::from(channel.gain.factor());
    let raw = f64::from(raw);

    let normalized = match channel.registers() {
        Some((ofc, fsc)) if fsc != 0 => {
            let rate = channel.data_rate;
            raw / (rate.beta() * f64::from(fsc)) + f64::from(ofc) / rate.alpha()
        }
        _ => raw / IDEAL_FULL_SCALE,
    };

    normalized * 2.0 * vref / gain
}

/// Sum channel voltage
pub fn sum_volts(raw: u32, vref: f64) -> f64 {
    f64::from(raw) * vref / SUM_FULL_SCALE
}

/// Whether an absolute input voltage lies in the allowed range (inclusive)
pub fn within_input_range(volts: f64, input_buffer: bool) -> bool {
    let (low, high) = if input_buffer {
        BUFFERED_INPUT_RANGE
    } else {
        UNBUFFERED_INPUT_RANGE
    };
    (low..=high).contains(&volts)
}

/// Saturation test for one channel
///
/// # Arguments
///
/// * `v_diff` - Differential voltage
/// * `v_sum` - Sum voltage
/// * `channel` - Gain and input-buffer setting of the channel
///
/// # Returns
///
/// * `bool` - `true` if either converter input leaves its allowed range,
///   the differential exceeds 5/G, or the sum exceeds 2.5 V
pub fn is_saturated(v_diff: f64, v_sum: f64, channel: &ChannelCalibration) -> bool {
    let v_ainn = -v_sum + BIAS_VOLTAGE - 0.5 * v_diff;
    let v_ainp = -v_sum + BIAS_VOLTAGE + 0.5 * v_diff;
    let gain = f64::from(channel.gain.factor());

    !within_input_range(v_ainn, channel.input_buffer)
        || !within_input_range(v_ainp, channel.input_buffer)
        || v_diff.abs() > 5.0 / gain
        || v_sum.abs() > MAX_SUM_VOLTS
}

/// Wrench (Fx, Fy, Fz, Tx, Ty, Tz) from channel voltages
///
/// Each channel contributes `diff / sum`. If any sum is exactly zero the
/// ratio is undefined and the zero wrench is returned; a genuine zero load
/// and a dead channel look the same here.
pub fn wrench(
    diff: &[f64; NUM_CHANNELS],
    sum: &[f64; NUM_CHANNELS],
    matrix: &CalibrationMatrix,
) -> [f64; NUM_CHANNELS] {
    if sum.iter().any(|&s| s == 0.0) {
        return [0.0; NUM_CHANNELS];
    }

    let mut ratio = [0.0; NUM_CHANNELS];
    for (r, (d, s)) in ratio.iter_mut().zip(diff.iter().zip(sum.iter())) {
        *r = d / s;
    }

    let mut out = [0.0; NUM_CHANNELS];
    for (o, row) in out.iter_mut().zip(matrix.iter()) {
        *o = row.iter().zip(ratio.iter()).map(|(m, r)| m * r).sum();
    }
    out
}

pub fn temperature_celsius(raw: i16) -> f64 {
    f64::from(raw) * TEMPERATURE_SCALE
}

/// Calibrated channel values of one sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelReadings {
    pub differential_volts: [f64; NUM_CHANNELS],
    pub sum_volts: [f64; NUM_CHANNELS],
    pub saturated: [bool; NUM_CHANNELS],
    pub wrench: [f64; NUM_CHANNELS],
}

/// Convert the channel fields of a raw sample
pub fn convert(raw: &RawSample, state: &CalibrationState) -> ChannelReadings {
    let mut diff = [0.0; NUM_CHANNELS];
    let mut sum = [0.0; NUM_CHANNELS];
    let mut saturated = [false; NUM_CHANNELS];

    for (i, channel) in state.channels().iter().enumerate() {
        diff[i] = differential_volts(raw.differential[i], channel, state.vref);
        sum[i] = sum_volts(raw.sum[i], state.vref);
        saturated[i] = is_saturated(diff[i], sum[i], channel);
    }

    ChannelReadings {
        differential_volts: diff,
        sum_volts: sum,
        saturated,
        wrench: wrench(&diff, &sum, &state.matrix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::adc::{DataRate, PgaGain};
    use crate::calibration::state::IDENTITY_MATRIX;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_ideal_transfer_when_unread() {
        let ch = ChannelCalibration::default();
        assert!(close(differential_volts(1 << 22, &ch, 2.5), 2.5));
        assert!(close(differential_volts(-(1 << 23), &ch, 2.5), -5.0));
        assert_eq!(differential_volts(0, &ch, 2.5), 0.0);

        let gained = ChannelCalibration {
            gain: PgaGain::X4,
            ..ChannelCalibration::default()
        };
        assert!(close(differential_volts(1 << 22, &gained, 2.5), 0.625));
    }

    #[test]
    fn test_calibrated_transfer() {
        let ch = ChannelCalibration {
            gain: PgaGain::X2,
            data_rate: DataRate::Sps1000,
            ofc: Some(-3000),
            fsc: Some(0x45_0000),
            ..ChannelCalibration::default()
        };
        let raw = 1_000_000;
        let expected = (f64::from(raw) / (1.7474 * f64::from(0x45_0000u32))
            + -3000.0 / f64::from(0x3C_0000u32))
            * 2.0
            * 2.5
            / 2.0;
        assert!(close(differential_volts(raw, &ch, 2.5), expected));
    }

    #[test]
    fn test_zero_fsc_falls_back_to_ideal() {
        let ch = ChannelCalibration {
            ofc: Some(100),
            fsc: Some(0),
            ..ChannelCalibration::default()
        };
        assert!(close(differential_volts(1 << 22, &ch, 2.5), 2.5));
    }

    #[test]
    fn test_sum_volts() {
        assert_eq!(sum_volts(0, 2.5), 0.0);
        assert_eq!(sum_volts(2048, 2.5), 1.25);
        assert_eq!(sum_volts(4096, 2.0), 2.0);
    }

    #[test]
    fn test_input_range_is_inclusive() {
        assert!(within_input_range(0.0, true));
        assert!(within_input_range(3.0, true));
        assert!(!within_input_range(3.0001, true));
        assert!(within_input_range(-0.1, false));
        assert!(within_input_range(5.1, false));
        assert!(!within_input_range(-0.11, false));
    }

    #[test]
    fn test_saturation_input_buffer() {
        let unbuffered = ChannelCalibration::default();
        let buffered = ChannelCalibration {
            input_buffer: true,
            ..ChannelCalibration::default()
        };
        // Inputs sit at 4.775 V: fine without the buffer, too high with it
        assert!(!is_saturated(0.0, 0.0, &unbuffered));
        assert!(is_saturated(0.0, 0.0, &buffered));
        // Inputs at 2.775 V
        assert!(!is_saturated(0.0, 2.0, &buffered));
    }

    #[test]
    fn test_saturation_differential_limit() {
        let ch = ChannelCalibration::default();
        // Exactly 5/G is allowed
        assert!(!is_saturated(5.0, 2.25, &ch));
        assert!(is_saturated(5.001, 2.25, &ch));

        let gained = ChannelCalibration {
            gain: PgaGain::X8,
            ..ChannelCalibration::default()
        };
        assert!(!is_saturated(0.625, 2.25, &gained));
        assert!(is_saturated(0.63, 2.25, &gained));
    }

    #[test]
    fn test_saturation_sum_limit() {
        let ch = ChannelCalibration::default();
        assert!(!is_saturated(0.0, 2.5, &ch));
        assert!(is_saturated(0.0, 2.51, &ch));
    }

    #[test]
    fn test_wrench_identity() {
        let diff = [1.0, -1.0, 0.5, 0.0, 2.0, 1.0];
        let sum = [2.0; 6];
        let w = wrench(&diff, &sum, &IDENTITY_MATRIX);
        assert_eq!(w, [0.5, -0.5, 0.25, 0.0, 1.0, 0.5]);
    }

    #[test]
    fn test_wrench_matrix_product() {
        let mut matrix = [[0.0; 6]; 6];
        matrix[0] = [1.0; 6];
        matrix[5][0] = -2.0;
        let diff = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let sum = [1.0; 6];
        let w = wrench(&diff, &sum, &matrix);
        assert_eq!(w[0], 21.0);
        assert_eq!(w[5], -2.0);
        assert_eq!(w[1], 0.0);
    }

    #[test]
    fn test_wrench_zero_when_any_sum_is_zero() {
        let diff = [1.0; 6];
        let mut sum = [1.0; 6];
        sum[3] = 0.0;
        assert_eq!(wrench(&diff, &sum, &IDENTITY_MATRIX), [0.0; 6]);
    }

    #[test]
    fn test_temperature() {
        assert_eq!(temperature_celsius(400), 25.0);
        assert_eq!(temperature_celsius(-16), -1.0);
    }

    #[test]
    fn test_convert_sample() {
        let state = CalibrationState::default();
        let raw = RawSample {
            differential: [1 << 20; 6],
            sum: [2048; 6],
            ..RawSample::default()
        };
        let readings = convert(&raw, &state);

        assert!(close(readings.differential_volts[0], 0.625));
        assert_eq!(readings.sum_volts[5], 1.25);
        assert_eq!(readings.saturated, [false; 6]);
        assert!(close(readings.wrench[2], 0.5));
    }
}
