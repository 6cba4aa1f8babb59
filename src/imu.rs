//! # IMU Decoder
//!
//! The sensor carries a BNO08x-style IMU whose readings arrive as five
//! little-endian Q-point fields. The report id in the payload selects both
//! the layout and the Q-points:
//!
//! | Report               | Fields used          | Q-point            |
//! |----------------------|----------------------|--------------------|
//! | Accelerometer (m/s²) | x, y, z              | 8                  |
//! | Gyroscope (rad/s)    | x, y, z              | 9                  |
//! | Linear acceleration  | x, y, z              | 8                  |
//! | (Game) rotation      | i, j, k, real, acc.  | 14, 14, 14, 12, 12 |

use serde::Serialize;

use crate::packet::protocol::{ImuMode, IMU_FIELD_COUNT};

/// Q-point of the quaternion imaginary components
pub const QUATERNION_IJK_QPOINT: u8 = 14;

/// Q-point of the quaternion real component and of the accuracy estimate
pub const QUATERNION_REAL_QPOINT: u8 = 12;

/// Quaternions longer than this are renormalized
pub const RENORMALIZE_THRESHOLD: f64 = 1.1;

/// Fixed-point to float: `raw · 2^-qpoint`
///
/// # Examples
///
/// ```
/// use opto_ft::imu::q_to_float;
///
/// assert_eq!(q_to_float(256, 8), 1.0);
/// assert_eq!(q_to_float(-512, 9), -1.0);
/// ```
pub fn q_to_float(raw: i16, qpoint: u8) -> f64 {
    f64::from(raw) / f64::from(1u32 << qpoint)
}

/// Float to fixed-point, rounded to nearest and saturated to the i16 range
pub fn float_to_q(value: f64, qpoint: u8) -> i16 {
    let scaled = (value * f64::from(1u32 << qpoint)).round();
    scaled.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Q-points of the five IMU fields for a report mode
pub fn qpoints(mode: ImuMode) -> [u8; IMU_FIELD_COUNT] {
    match mode {
        ImuMode::Accelerometer | ImuMode::LinearAcceleration => [8; IMU_FIELD_COUNT],
        ImuMode::Gyroscope => [9; IMU_FIELD_COUNT],
        ImuMode::RotationVector | ImuMode::GameRotationVector => [
            QUATERNION_IJK_QPOINT,
            QUATERNION_IJK_QPOINT,
            QUATERNION_IJK_QPOINT,
            QUATERNION_REAL_QPOINT,
            QUATERNION_REAL_QPOINT,
        ],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quaternion {
    pub i: f64,
    pub j: f64,
    pub k: f64,
    pub real: f64,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        i: 0.0,
        j: 0.0,
        k: 0.0,
        real: 1.0,
    };

    pub fn magnitude(&self) -> f64 {
        (self.i * self.i + self.j * self.j + self.k * self.k + self.real * self.real).sqrt()
    }

    /// Unit quaternion in the same direction (zero stays zero)
    pub fn normalized(&self) -> Self {
        let m = self.magnitude();
        if m == 0.0 {
            return *self;
        }
        Self {
            i: self.i / m,
            j: self.j / m,
            k: self.k / m,
            real: self.real / m,
        }
    }

    /// Rotation matrix, row-major
    pub fn rotation_matrix(&self) -> [[f64; 3]; 3] {
        let Quaternion { i, j, k, real: r } = *self;
        [
            [
                1.0 - 2.0 * (j * j + k * k),
                2.0 * (i * j - r * k),
                2.0 * (i * k + r * j),
            ],
            [
                2.0 * (i * j + r * k),
                1.0 - 2.0 * (i * i + k * k),
                2.0 * (j * k - r * i),
            ],
            [
                2.0 * (i * k - r * j),
                2.0 * (j * k + r * i),
                1.0 - 2.0 * (i * i + j * j),
            ],
        ]
    }
}

/// Decoded IMU report
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImuReading {
    Vector {
        mode: ImuMode,
        values: [f64; 3],
    },
    Orientation {
        mode: ImuMode,
        quaternion: Quaternion,
        /// Heading accuracy estimate (radians)
        accuracy: f64,
    },
}

impl ImuReading {
    pub fn mode(&self) -> ImuMode {
        match self {
            Self::Vector { mode, .. } | Self::Orientation { mode, .. } => *mode,
        }
    }

    pub fn rotation_matrix(&self) -> Option<[[f64; 3]; 3]> {
        match self {
            Self::Orientation { quaternion, .. } => Some(quaternion.rotation_matrix()),
            Self::Vector { .. } => None,
        }
    }
}

/// Decode the IMU block of a payload
///
/// # Arguments
///
/// * `report_id` - Byte 36 of the payload
/// * `fields` - The five raw Q-point fields
///
/// # Returns
///
/// * `Option<ImuReading>` - `None` for report ids without a known layout
pub fn decode_imu(report_id: u8, fields: &[i16; IMU_FIELD_COUNT]) -> Option<ImuReading> {
    let mode = ImuMode::from_report_id(report_id)?;
    let q = qpoints(mode);
    let value = |n: usize| q_to_float(fields[n], q[n]);

    if !mode.is_quaternion() {
        return Some(ImuReading::Vector {
            mode,
            values: [value(0), value(1), value(2)],
        });
    }

    let mut quaternion = Quaternion {
        i: value(0),
        j: value(1),
        k: value(2),
        real: value(3),
    };
    if quaternion.magnitude() > RENORMALIZE_THRESHOLD {
        quaternion = quaternion.normalized();
    }

    Some(ImuReading::Orientation {
        mode,
        quaternion,
        accuracy: value(4),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_matrix_eq(actual: [[f64; 3]; 3], expected: [[f64; 3]; 3]) {
        for (row_a, row_e) in actual.iter().zip(expected.iter()) {
            for (a, e) in row_a.iter().zip(row_e.iter()) {
                assert!((a - e).abs() < 1e-9, "{:?} != {:?}", actual, expected);
            }
        }
    }

    #[test]
    fn test_q_conversion() {
        assert_eq!(q_to_float(1 << 14, 14), 1.0);
        assert_eq!(q_to_float(-(1 << 12), 12), -1.0);
        assert_eq!(float_to_q(0.5, 8), 128);
        assert_eq!(float_to_q(1000.0, 8), i16::MAX);
        assert_eq!(q_to_float(float_to_q(-0.25, 9), 9), -0.25);
    }

    #[test]
    fn test_q14_round_trip_within_resolution() {
        let step = 1.0 / f64::from(1u32 << 14);
        let mut value = -1.99;
        while value < 1.99 {
            let back = q_to_float(float_to_q(value, 14), 14);
            assert!((back - value).abs() <= step, "{} -> {}", value, back);
            value += 0.0137;
        }
    }

    #[test]
    fn test_qpoint_table() {
        assert_eq!(qpoints(ImuMode::Accelerometer)[0], 8);
        assert_eq!(qpoints(ImuMode::LinearAcceleration)[2], 8);
        assert_eq!(qpoints(ImuMode::Gyroscope)[1], 9);
        assert_eq!(qpoints(ImuMode::RotationVector), [14, 14, 14, 12, 12]);
    }

    #[test]
    fn test_decode_vector_report() {
        let reading = decode_imu(0x01, &[256, -512, 128, 999, 999]).unwrap();
        assert_eq!(
            reading,
            ImuReading::Vector {
                mode: ImuMode::Accelerometer,
                values: [1.0, -2.0, 0.5],
            }
        );
        assert!(reading.rotation_matrix().is_none());

        let gyro = decode_imu(0x02, &[512, 0, 0, 0, 0]).unwrap();
        assert_eq!(gyro.mode(), ImuMode::Gyroscope);
        match gyro {
            ImuReading::Vector { values, .. } => assert_eq!(values[0], 1.0),
            other => panic!("Expected vector, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_report_id() {
        assert!(decode_imu(0x00, &[0; 5]).is_none());
        assert!(decode_imu(0x03, &[0; 5]).is_none());
        assert!(decode_imu(0xFF, &[0; 5]).is_none());
    }

    #[test]
    fn test_identity_rotation() {
        let reading = decode_imu(0x05, &[0, 0, 0, 1 << 12, 0]).unwrap();
        let identity = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        assert_matrix_eq(reading.rotation_matrix().unwrap(), identity);
    }

    #[test]
    fn test_quarter_turn_about_z() {
        let h = std::f64::consts::FRAC_1_SQRT_2;
        let q = Quaternion {
            i: 0.0,
            j: 0.0,
            k: h,
            real: h,
        };
        assert_matrix_eq(
            q.rotation_matrix(),
            [[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
        );
    }

    #[test]
    fn test_renormalization_threshold() {
        // real = 2.0 at Q12: magnitude 2 gets renormalized
        let reading = decode_imu(0x08, &[0, 0, 0, 2 << 12, 0]).unwrap();
        match reading {
            ImuReading::Orientation { quaternion, .. } => {
                assert!((quaternion.magnitude() - 1.0).abs() < 1e-12);
                assert_eq!(quaternion.real, 1.0);
            }
            other => panic!("Expected orientation, got {:?}", other),
        }

        // 1.05 is left alone
        let raw_real = float_to_q(1.05, QUATERNION_REAL_QPOINT);
        let reading = decode_imu(0x05, &[0, 0, 0, raw_real, 0]).unwrap();
        match reading {
            ImuReading::Orientation { quaternion, .. } => {
                assert_eq!(quaternion.real, q_to_float(raw_real, 12));
            }
            other => panic!("Expected orientation, got {:?}", other),
        }
    }

    #[test]
    fn test_normalized_zero() {
        let zero = Quaternion {
            i: 0.0,
            j: 0.0,
            k: 0.0,
            real: 0.0,
        };
        assert_eq!(zero.normalized(), zero);
        assert_eq!(Quaternion::IDENTITY.magnitude(), 1.0);
    }
}
