//! # Sensor Protocol Constants and Types
//!
//! Wire layout of the streaming frame (current revision):
//!
//! ```text
//! ┌──────┬─────────┬──────────┬──────────────────────────────┬───────────┐
//! │ 0xAA │ counter │ CRC8     │ payload (49 bytes)           │ CRC32     │
//! │      │         │ (AA,cnt) │ diff 6×3 │ sum 6×3 │ id │ IMU 10 │ T 2 │ LSB first │
//! └──────┴─────────┴──────────┴──────────────────────────────┴───────────┘
//!  header (3 bytes)            body (53 bytes)
//! ```
//!
//! The legacy revision uses init byte 0xFF, a single header byte holding a
//! 4-bit counter and a CRC4, and a 51-byte body without the temperature.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::calibration::adc::{DataRate, PgaGain};
use crate::error::{OptoFtError, Result};

/// Frame init byte (current revision)
pub const INIT_BYTE: u8 = 0xAA;

/// Frame init byte (legacy revision)
pub const LEGACY_INIT_BYTE: u8 = 0xFF;

/// Number of transducer channels
pub const NUM_CHANNELS: usize = 6;

/// Payload field offsets (relative to the start of the body)
pub const DIFFERENTIAL_OFFSET: usize = 0;
pub const SUM_OFFSET: usize = 18;
pub const REPORT_ID_OFFSET: usize = 36;
pub const IMU_OFFSET: usize = 37;
pub const TEMPERATURE_OFFSET: usize = 47;

/// Number of 2-byte Q-point fields in the IMU block
pub const IMU_FIELD_COUNT: usize = 5;

/// Payload sizes
pub const PAYLOAD_LEN: usize = 49;
pub const LEGACY_PAYLOAD_LEN: usize = 47;

/// Trailing CRC32 size
pub const CHECKSUM_LEN: usize = 4;

/// Body sizes (payload + trailing CRC32)
pub const BODY_LEN: usize = PAYLOAD_LEN + CHECKSUM_LEN;
pub const LEGACY_BODY_LEN: usize = LEGACY_PAYLOAD_LEN + CHECKSUM_LEN;

/// Calibration register report body: channel, OFC(3), FSC(3), CRC8
pub const REGISTER_REPORT_LEN: usize = 8;

/// Status line terminator
pub const LINE_END: u8 = b'\n';

/// Command opcodes
pub const OP_START_STREAMING: u8 = 0x10;
pub const OP_STOP_STREAMING: u8 = 0x11;
pub const OP_POLL: u8 = 0x12;
pub const OP_CONFIGURE_IMU: u8 = 0x20;
pub const OP_CONFIGURE_ADC: u8 = 0x30;
pub const OP_CONFIGURE_DAC: u8 = 0x40;
pub const OP_DEACTIVATE_CHANNEL: u8 = 0xE0;
pub const OP_RESET: u8 = 0xF0;
pub const OP_RESET_IMU: u8 = 0xFA;
pub const OP_RESET_DAC: u8 = 0xFB;

/// Checksum appended to an outgoing command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTrailer {
    /// Bare command bytes
    None,
    /// One extra byte, CRC4 of the command in the low nibble
    Crc4,
    /// One extra byte, CRC8 of the command
    Crc8,
}

/// Protocol revision spoken by the sensor firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolRevision {
    /// 0xFF init byte, counter/CRC4 nibble header, no temperature
    Legacy,
    /// 0xAA init byte, counter + CRC8 header, temperature field
    #[default]
    Current,
}

impl ProtocolRevision {
    pub const fn init_byte(self) -> u8 {
        match self {
            Self::Legacy => LEGACY_INIT_BYTE,
            Self::Current => INIT_BYTE,
        }
    }

    /// Header bytes following the init byte
    pub const fn header_len(self) -> usize {
        match self {
            Self::Legacy => 1,
            Self::Current => 2,
        }
    }

    pub const fn payload_len(self) -> usize {
        match self {
            Self::Legacy => LEGACY_PAYLOAD_LEN,
            Self::Current => PAYLOAD_LEN,
        }
    }

    /// Bytes the packet decoder consumes after a valid header
    pub const fn body_len(self) -> usize {
        self.payload_len() + CHECKSUM_LEN
    }

    pub const fn has_temperature(self) -> bool {
        matches!(self, Self::Current)
    }

    /// Whether commands carry two parameter bytes
    pub const fn has_command_params(self) -> bool {
        matches!(self, Self::Current)
    }

    pub const fn command_trailer(self) -> CommandTrailer {
        match self {
            Self::Legacy => CommandTrailer::None,
            Self::Current => CommandTrailer::Crc8,
        }
    }
}

/// IMU report modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImuMode {
    Accelerometer,
    Gyroscope,
    LinearAcceleration,
    RotationVector,
    GameRotationVector,
}

/// (mode, report id, display name)
const IMU_MODE_TABLE: [(ImuMode, u8, &str); 5] = [
    (ImuMode::Accelerometer, 0x01, "Accelerometer"),
    (ImuMode::Gyroscope, 0x02, "Gyroscope"),
    (ImuMode::LinearAcceleration, 0x04, "Linear Acceleration"),
    (ImuMode::RotationVector, 0x05, "Rotation Vector"),
    (ImuMode::GameRotationVector, 0x08, "Game Rotation Vector"),
];

impl ImuMode {
    pub const ALL: [ImuMode; 5] = [
        ImuMode::Accelerometer,
        ImuMode::Gyroscope,
        ImuMode::LinearAcceleration,
        ImuMode::RotationVector,
        ImuMode::GameRotationVector,
    ];

    fn entry(self) -> (ImuMode, u8, &'static str) {
        IMU_MODE_TABLE[self as usize]
    }

    /// Report id carried in byte 36 of the payload
    pub fn report_id(self) -> u8 {
        self.entry().1
    }

    pub fn from_report_id(report_id: u8) -> Option<Self> {
        IMU_MODE_TABLE
            .iter()
            .find(|(_, id, _)| *id == report_id)
            .map(|(mode, _, _)| *mode)
    }

    pub fn name(self) -> &'static str {
        self.entry().2
    }

    /// Quaternion reports carry i, j, k, real and an accuracy estimate
    pub fn is_quaternion(self) -> bool {
        matches!(self, Self::RotationVector | Self::GameRotationVector)
    }

    /// Opcode that enables this report (0x20 | report id)
    pub fn config_opcode(self) -> u8 {
        OP_CONFIGURE_IMU | self.report_id()
    }
}

impl fmt::Display for ImuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ImuMode {
    type Err = OptoFtError;

    /// Accepts the display name or a snake/kebab-case variant, case-insensitively
    fn from_str(s: &str) -> Result<Self> {
        let wanted: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        IMU_MODE_TABLE
            .iter()
            .find(|(_, _, name)| {
                let normalized: String = name
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .map(|c| c.to_ascii_lowercase())
                    .collect();
                normalized == wanted
            })
            .map(|(mode, _, _)| *mode)
            .ok_or_else(|| OptoFtError::InvalidArgument(format!("Unknown IMU mode '{}'", s)))
    }
}

/// Transducer channel (0-based index, wire number 1..=6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(u8);

impl Channel {
    pub const ALL: [Channel; NUM_CHANNELS] = [
        Channel(0),
        Channel(1),
        Channel(2),
        Channel(3),
        Channel(4),
        Channel(5),
    ];

    /// # Errors
    ///
    /// Returns `InvalidArgument` if `index` is not below 6
    pub fn new(index: usize) -> Result<Self> {
        if index >= NUM_CHANNELS {
            return Err(OptoFtError::InvalidArgument(format!(
                "Channel index {} out of range 0..{}",
                index, NUM_CHANNELS
            )));
        }
        Ok(Self(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// 1-based number added to per-channel opcodes
    pub fn number(self) -> u8 {
        self.0 + 1
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// ADC channel setting carried by a 0x31..0x36 command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdcSetting {
    /// Root register: auto-calibration and input buffer switches
    Root {
        auto_calibrate: bool,
        input_buffer: bool,
    },
    DataRate(DataRate),
    Gain(PgaGain),
    /// Positive input multiplexer (0..=8)
    PositiveInput(u8),
    /// Negative input multiplexer (0..=8)
    NegativeInput(u8),
    SelfCalibrate,
    /// Ask for the OFC/FSC calibration registers
    ReportRegisters,
}

impl AdcSetting {
    pub fn subcode(&self) -> u8 {
        match self {
            Self::Root { .. } => 0,
            Self::DataRate(_) => 1,
            Self::Gain(_) => 2,
            Self::PositiveInput(_) => 3,
            Self::NegativeInput(_) => 4,
            Self::SelfCalibrate => 5,
            Self::ReportRegisters => 6,
        }
    }

    pub fn value(&self) -> u8 {
        match *self {
            Self::Root {
                auto_calibrate,
                input_buffer,
            } => u8::from(auto_calibrate) | (u8::from(input_buffer) << 1),
            Self::DataRate(rate) => rate.index(),
            Self::Gain(gain) => gain.code(),
            Self::PositiveInput(mux) | Self::NegativeInput(mux) => mux,
            Self::SelfCalibrate | Self::ReportRegisters => 0,
        }
    }
}

/// What the device sends back after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Nothing to wait for
    None,
    /// One sample frame
    Frame,
    /// OFC/FSC register report frame
    RegisterReport,
    /// ASCII status lines
    StatusLine,
}

/// Host to device command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    StartStreaming { rate_hz: u16 },
    StopStreaming,
    Poll,
    Reset,
    ResetChannel(Channel),
    DeactivateChannel(Channel),
    ResetImu,
    ResetDac,
    /// Enable an IMU report at the given interval (0 disables it)
    ConfigureImu { mode: ImuMode, interval_ms: u16 },
    ConfigureAdc { channel: Channel, setting: AdcSetting },
    /// LED drive current in units of 0.01 mA
    ConfigureDac { channel: Channel, current_centi_ma: u16 },
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::StartStreaming { .. } => OP_START_STREAMING,
            Self::StopStreaming => OP_STOP_STREAMING,
            Self::Poll => OP_POLL,
            Self::Reset => OP_RESET,
            Self::ResetChannel(ch) => OP_RESET + ch.number(),
            Self::DeactivateChannel(ch) => OP_DEACTIVATE_CHANNEL + ch.number(),
            Self::ResetImu => OP_RESET_IMU,
            Self::ResetDac => OP_RESET_DAC,
            Self::ConfigureImu { mode, .. } => mode.config_opcode(),
            Self::ConfigureAdc { channel, .. } => OP_CONFIGURE_ADC + channel.number(),
            Self::ConfigureDac { channel, .. } => OP_CONFIGURE_DAC + channel.number(),
        }
    }

    /// Two parameter bytes (zero when unused)
    pub fn params(&self) -> [u8; 2] {
        match *self {
            Self::StartStreaming { rate_hz } => rate_hz.to_be_bytes(),
            Self::ConfigureImu { interval_ms, .. } => interval_ms.to_be_bytes(),
            Self::ConfigureAdc { setting, .. } => [setting.subcode(), setting.value()],
            Self::ConfigureDac {
                current_centi_ma, ..
            } => current_centi_ma.to_be_bytes(),
            _ => [0, 0],
        }
    }

    pub fn response(&self) -> ResponseKind {
        match self {
            Self::StartStreaming { .. } | Self::StopStreaming => ResponseKind::None,
            Self::Poll => ResponseKind::Frame,
            Self::ConfigureAdc {
                setting: AdcSetting::ReportRegisters,
                ..
            } => ResponseKind::RegisterReport,
            _ => ResponseKind::StatusLine,
        }
    }
}
