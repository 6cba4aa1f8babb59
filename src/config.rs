//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::calibration::adc::{DataRate, PgaGain};
use crate::calibration::state::{CalibrationMatrix, CalibrationState, IDENTITY_MATRIX};
use crate::device::command::{CommandSettings, MAX_DAC_CURRENT_MA};
use crate::device::stream::{StreamConfig, DEFAULT_MAX_RATE_HZ};
use crate::device::SensorSettings;
use crate::error::{OptoFtError, Result};
use crate::packet::protocol::{Channel, CommandTrailer, ImuMode, ProtocolRevision, NUM_CHANNELS};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub serial: SerialConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Device path; empty means auto-detect
    #[serde(default)]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Single read timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Overall wait for a command's status lines
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Run against the in-process virtual sensor instead of a port
    #[serde(default)]
    pub virtual_sensor: bool,
}

/// Wire protocol configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub revision: ProtocolRevision,

    /// Overrides the revision's command trailer
    #[serde(default)]
    pub command_trailer: Option<CommandTrailer>,
}

/// Streaming configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StreamSection {
    #[serde(default = "default_rate_hz")]
    pub rate_hz: u16,

    #[serde(default = "default_byte_budget")]
    pub byte_budget: usize,

    #[serde(default = "default_stop_retries")]
    pub stop_retries: u32,

    #[serde(default = "default_stop_settle_ms")]
    pub stop_settle_ms: u64,

    #[serde(default = "default_max_io_errors")]
    pub max_io_errors: u32,

    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Samples between status log lines
    #[serde(default = "default_status_interval")]
    pub status_interval: u64,

    /// IMU report to enable before streaming
    #[serde(default)]
    pub imu_mode: Option<ImuMode>,

    #[serde(default = "default_imu_interval_ms")]
    pub imu_interval_ms: u16,
}

/// Per-channel converter settings applied at startup
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelSettings {
    /// Zero-based channel index
    pub channel: usize,

    #[serde(default = "default_gain")]
    pub gain: u32,

    #[serde(default = "default_data_rate_sps")]
    pub data_rate_sps: f64,

    #[serde(default)]
    pub input_buffer: bool,

    #[serde(default)]
    pub auto_calibrate: bool,
}

/// Calibration configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    #[serde(default = "default_vref")]
    pub vref: f64,

    /// Row-major 6×6 matrix; identity when absent
    #[serde(default)]
    pub matrix: Option<Vec<Vec<f64>>>,

    /// Read OFC/FSC registers before streaming
    #[serde(default = "default_refresh_on_start")]
    pub refresh_on_start: bool,

    /// LED drive current used when switching a channel on
    #[serde(default = "default_led_current_ma")]
    pub led_current_ma: f64,

    #[serde(default)]
    pub channels: Vec<ChannelSettings>,
}

/// Telemetry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,

    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily log files; empty logs to stdout only
    #[serde(default)]
    pub file_dir: String,
}

// Default value functions
fn default_baud_rate() -> u32 { 5_000_000 }
fn default_timeout_ms() -> u64 { 10 }
fn default_response_timeout_ms() -> u64 { 500 }

fn default_rate_hz() -> u16 { 1000 }
fn default_byte_budget() -> usize { 256 }
fn default_stop_retries() -> u32 { 5 }
fn default_stop_settle_ms() -> u64 { 20 }
fn default_max_io_errors() -> u32 { 10 }
fn default_broadcast_capacity() -> usize { 1024 }
fn default_status_interval() -> u64 { 1000 }
fn default_imu_interval_ms() -> u16 { 10 }

fn default_gain() -> u32 { 1 }
fn default_data_rate_sps() -> f64 { 2000.0 }
fn default_vref() -> f64 { 2.5 }
fn default_refresh_on_start() -> bool { true }
fn default_led_current_ma() -> f64 { 20.0 }

fn default_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }
fn default_log_format() -> String { "jsonl".to_string() }

fn default_log_level() -> String { "info".to_string() }

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            rate_hz: default_rate_hz(),
            byte_budget: default_byte_budget(),
            stop_retries: default_stop_retries(),
            stop_settle_ms: default_stop_settle_ms(),
            max_io_errors: default_max_io_errors(),
            broadcast_capacity: default_broadcast_capacity(),
            status_interval: default_status_interval(),
            imu_mode: None,
            imu_interval_ms: default_imu_interval_ms(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            vref: default_vref(),
            matrix: None,
            refresh_on_start: default_refresh_on_start(),
            led_current_ma: default_led_current_ma(),
            channels: Vec::new(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
            format: default_log_format(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_dir: String::new(),
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> OptoFtError {
    OptoFtError::Config(toml::de::Error::custom(message))
}

impl ChannelSettings {
    pub fn channel(&self) -> Result<Channel> {
        Channel::new(self.channel).map_err(invalid)
    }

    pub fn gain(&self) -> Result<PgaGain> {
        PgaGain::from_factor(self.gain).map_err(invalid)
    }

    pub fn data_rate(&self) -> Result<DataRate> {
        DataRate::from_sps(self.data_rate_sps).map_err(invalid)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use opto_ft::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        // Serial
        if self.serial.baud_rate == 0 {
            return Err(invalid("baud_rate must be greater than 0"));
        }

        if self.serial.timeout_ms == 0 || self.serial.timeout_ms > 1000 {
            return Err(invalid("timeout_ms must be between 1 and 1000"));
        }

        if self.serial.response_timeout_ms == 0 || self.serial.response_timeout_ms > 10000 {
            return Err(invalid("response_timeout_ms must be between 1 and 10000"));
        }

        // Stream
        if self.stream.rate_hz == 0 || self.stream.rate_hz > DEFAULT_MAX_RATE_HZ {
            return Err(invalid(format!(
                "rate_hz must be between 1 and {}",
                DEFAULT_MAX_RATE_HZ
            )));
        }

        if self.stream.byte_budget < 8 || self.stream.byte_budget > 65536 {
            return Err(invalid("byte_budget must be between 8 and 65536"));
        }

        if self.stream.stop_retries == 0 || self.stream.stop_retries > 100 {
            return Err(invalid("stop_retries must be between 1 and 100"));
        }

        if self.stream.stop_settle_ms > 1000 {
            return Err(invalid("stop_settle_ms must be at most 1000"));
        }

        if self.stream.max_io_errors == 0 {
            return Err(invalid("max_io_errors must be greater than 0"));
        }

        if self.stream.broadcast_capacity == 0 {
            return Err(invalid("broadcast_capacity must be greater than 0"));
        }

        if self.stream.status_interval == 0 {
            return Err(invalid("status_interval must be greater than 0"));
        }

        if self.stream.imu_mode.is_some() && !self.protocol.revision.has_command_params() {
            return Err(invalid("imu_mode requires the current protocol revision"));
        }

        // Calibration
        if !(self.calibration.vref > 0.0 && self.calibration.vref <= 5.0) {
            return Err(invalid("vref must be greater than 0.0 and at most 5.0"));
        }

        if let Some(rows) = &self.calibration.matrix {
            if rows.len() != NUM_CHANNELS || rows.iter().any(|row| row.len() != NUM_CHANNELS) {
                return Err(invalid("calibration matrix must be 6x6"));
            }
            if rows.iter().flatten().any(|v| !v.is_finite()) {
                return Err(invalid("calibration matrix entries must be finite"));
            }
        }

        if !(0.0..=MAX_DAC_CURRENT_MA).contains(&self.calibration.led_current_ma) {
            return Err(invalid(format!(
                "led_current_ma must be between 0.0 and {}",
                MAX_DAC_CURRENT_MA
            )));
        }

        if !self.calibration.channels.is_empty() && !self.protocol.revision.has_command_params() {
            return Err(invalid("channel settings require the current protocol revision"));
        }

        let mut seen = [false; NUM_CHANNELS];
        for settings in &self.calibration.channels {
            let channel = settings.channel()?;
            if std::mem::replace(&mut seen[channel.index()], true) {
                return Err(invalid(format!("channel {} configured twice", settings.channel)));
            }
            settings.gain()?;
            settings.data_rate()?;
        }

        // Telemetry
        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(invalid("telemetry log_dir cannot be empty when enabled"));
        }

        if self.telemetry.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }

        if self.telemetry.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        if self.telemetry.format != "jsonl" {
            return Err(invalid("log format must be 'jsonl' (only supported format)"));
        }

        // Logging
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("logging level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }

    /// Calibration matrix, identity when none is configured
    pub fn matrix(&self) -> CalibrationMatrix {
        let mut matrix = IDENTITY_MATRIX;
        if let Some(rows) = &self.calibration.matrix {
            for (dst, src) in matrix.iter_mut().zip(rows) {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = *s;
                }
            }
        }
        matrix
    }

    /// Starting calibration state (registers unread)
    pub fn calibration_state(&self) -> CalibrationState {
        CalibrationState::new(self.calibration.vref, self.matrix())
    }

    /// Controller settings derived from the `[serial]`, `[protocol]` and
    /// `[stream]` sections
    pub fn sensor_settings(&self) -> SensorSettings {
        let io_timeout = Duration::from_millis(self.serial.timeout_ms);

        SensorSettings {
            revision: self.protocol.revision,
            command_trailer: self.protocol.command_trailer,
            command: CommandSettings {
                io_timeout,
                response_timeout: Duration::from_millis(self.serial.response_timeout_ms),
                sync_budget: self.stream.byte_budget,
                led_on_current_ma: self.calibration.led_current_ma,
            },
            stream: StreamConfig {
                io_timeout,
                byte_budget: self.stream.byte_budget,
                stop_retries: self.stream.stop_retries,
                stop_settle: Duration::from_millis(self.stream.stop_settle_ms),
                max_io_errors: self.stream.max_io_errors,
                broadcast_capacity: self.stream.broadcast_capacity,
                ..StreamConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_valid_config() -> Config {
        Config {
            serial: SerialConfig {
                port: String::new(),
                baud_rate: default_baud_rate(),
                timeout_ms: default_timeout_ms(),
                response_timeout_ms: default_response_timeout_ms(),
                virtual_sensor: false,
            },
            protocol: ProtocolConfig::default(),
            stream: StreamSection::default(),
            calibration: CalibrationConfig::default(),
            telemetry: TelemetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    fn load_str(content: &str) -> Result<Config> {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        Config::load(temp_file.path())
    }

    #[test]
    fn test_default_config() {
        assert!(create_valid_config().validate().is_ok());
    }

    #[test]
    fn test_load_minimal_config() {
        let config = load_str("[serial]\n").unwrap();
        assert_eq!(config.serial.baud_rate, 5_000_000);
        assert_eq!(config.protocol.revision, ProtocolRevision::Current);
        assert_eq!(config.stream.rate_hz, 1000);
        assert!(!config.telemetry.enabled);
        assert_eq!(config.matrix(), IDENTITY_MATRIX);
    }

    #[test]
    fn test_load_full_config() {
        let config = load_str(
            r#"
[serial]
port = "/dev/ttyUSB1"
virtual_sensor = true

[protocol]
revision = "legacy"
command_trailer = "crc4"

[stream]
rate_hz = 500

[calibration]
vref = 2.048
matrix = [
    [1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [0.0, 2.0, 0.0, 0.0, 0.0, 0.0],
    [0.0, 0.0, 3.0, 0.0, 0.0, 0.0],
    [0.0, 0.0, 0.0, 4.0, 0.0, 0.0],
    [0.0, 0.0, 0.0, 0.0, 5.0, 0.0],
    [0.0, 0.0, 0.0, 0.0, 0.0, 6.0],
]

[telemetry]
enabled = true

[logging]
level = "debug"
file_dir = "/tmp/opto-ft"
"#,
        )
        .unwrap();

        assert!(config.serial.virtual_sensor);
        assert_eq!(config.protocol.revision, ProtocolRevision::Legacy);
        assert_eq!(config.protocol.command_trailer, Some(CommandTrailer::Crc4));
        assert_eq!(config.matrix()[5][5], 6.0);

        let state = config.calibration_state();
        assert_eq!(state.vref, 2.048);

        let settings = config.sensor_settings();
        assert_eq!(settings.revision, ProtocolRevision::Legacy);
        assert_eq!(settings.stream.io_timeout, Duration::from_millis(10));
    }

    #[test]
    fn test_channel_settings() {
        let config = load_str(
            r#"
[serial]

[stream]
imu_mode = "game_rotation_vector"

[[calibration.channels]]
channel = 0
gain = 8
data_rate_sps = 500

[[calibration.channels]]
channel = 5
input_buffer = true
"#,
        )
        .unwrap();

        assert_eq!(config.stream.imu_mode, Some(ImuMode::GameRotationVector));
        let first = &config.calibration.channels[0];
        assert_eq!(first.gain().unwrap(), PgaGain::X8);
        assert_eq!(first.data_rate().unwrap(), DataRate::Sps500);
        let second = &config.calibration.channels[1];
        assert_eq!(second.channel().unwrap().index(), 5);
        assert_eq!(second.data_rate().unwrap(), DataRate::Sps2000);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/opto-ft.toml"),
            Err(OptoFtError::Io(_))
        ));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(load_str("[serial"), Err(OptoFtError::Config(_))));
    }

    #[test]
    fn test_unknown_revision() {
        assert!(load_str("[serial]\n[protocol]\nrevision = \"v3\"\n").is_err());
    }

    #[test]
    fn test_timeout_ms_zero() {
        let mut config = create_valid_config();
        config.serial.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rate_out_of_range() {
        let mut config = create_valid_config();
        config.stream.rate_hz = 0;
        assert!(config.validate().is_err());
        config.stream.rate_hz = 1501;
        assert!(config.validate().is_err());
        config.stream.rate_hz = 1500;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stop_retries_zero() {
        let mut config = create_valid_config();
        config.stream.stop_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_io_errors_zero() {
        let mut config = create_valid_config();
        config.stream.max_io_errors = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_vref() {
        let mut config = create_valid_config();
        config.calibration.vref = 0.0;
        assert!(config.validate().is_err());
        config.calibration.vref = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_matrix_wrong_shape() {
        let mut config = create_valid_config();
        config.calibration.matrix = Some(vec![vec![1.0; 6]; 5]);
        assert!(config.validate().is_err());
        config.calibration.matrix = Some(vec![vec![1.0; 5]; 6]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_matrix_non_finite() {
        let mut config = create_valid_config();
        let mut rows = vec![vec![0.0; 6]; 6];
        rows[2][3] = f64::INFINITY;
        config.calibration.matrix = Some(rows);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_led_current_out_of_range() {
        let mut config = create_valid_config();
        config.calibration.led_current_ma = 700.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_channel_settings() {
        let base = ChannelSettings {
            channel: 0,
            gain: default_gain(),
            data_rate_sps: default_data_rate_sps(),
            input_buffer: false,
            auto_calibrate: false,
        };

        let mut config = create_valid_config();
        config.calibration.channels = vec![ChannelSettings { gain: 3, ..base.clone() }];
        assert!(config.validate().is_err());

        config.calibration.channels = vec![ChannelSettings { data_rate_sps: 1234.0, ..base.clone() }];
        assert!(config.validate().is_err());

        config.calibration.channels = vec![ChannelSettings { channel: 6, ..base.clone() }];
        assert!(config.validate().is_err());

        config.calibration.channels = vec![base.clone(), base.clone()];
        assert!(config.validate().is_err());

        config.calibration.channels = vec![base];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_legacy_rejects_device_configuration() {
        let mut config = create_valid_config();
        config.protocol.revision = ProtocolRevision::Legacy;
        config.stream.imu_mode = Some(ImuMode::Accelerometer);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_log_dir_when_enabled() {
        let mut config = create_valid_config();
        config.telemetry.enabled = true;
        config.telemetry.log_dir = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_log_dir_when_disabled() {
        let mut config = create_valid_config();
        config.telemetry.enabled = false;
        config.telemetry.log_dir = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_records_per_file_zero() {
        let mut config = create_valid_config();
        config.telemetry.max_records_per_file = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_files_to_keep_zero() {
        let mut config = create_valid_config();
        config.telemetry.max_files_to_keep = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = create_valid_config();
        config.telemetry.format = "csv".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = create_valid_config();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_toml_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.serial.baud_rate, 5_000_000);
    }
}
