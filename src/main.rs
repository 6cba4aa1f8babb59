//! # Opto-FT
//!
//! Stream calibrated force/torque samples from an optical 6-axis sensor.
//!
//! Usage: `opto-ft [config.toml]` (default `config/default.toml`)

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use opto_ft::config::{Config, LoggingConfig};
use opto_ft::device::Sensor;
use opto_ft::sample::Measurement;
use opto_ft::serial::port_trait::SensorLink;
use opto_ft::serial::virtual_sensor::VirtualSensor;
use opto_ft::serial::SensorSerial;
use opto_ft::telemetry::SampleRecorder;

/// Configuration used when no path is given
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// How often the capture task's health is checked
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Main entry point
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration, set up logging
///    - Open the serial link (or the virtual sensor)
///    - Read calibration registers, apply configured channel and IMU settings
///
/// 2. **Main Loop**
///    - Stream at the configured rate
///    - Record valid samples to JSONL if telemetry is enabled
///    - Log a status line every `status_interval` samples
///
/// 3. **Graceful Shutdown**
///    - Ctrl+C, or the capture task ending on link errors
///    - Stop handshake with the device, flush telemetry
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let _log_guard = init_logging(&config.logging);
    info!("Opto-FT v{} starting...", env!("CARGO_PKG_VERSION"));

    let settings = config.sensor_settings();
    let calibration = config.calibration_state();

    if config.serial.virtual_sensor {
        info!("Using the virtual sensor");
        let link = VirtualSensor::new(config.protocol.revision);
        return run(Sensor::new(link, calibration, settings), &config).await;
    }

    let serial = if config.serial.port.is_empty() {
        SensorSerial::open(config.serial.baud_rate)?
    } else {
        SensorSerial::open_path(&config.serial.port, config.serial.baud_rate)?
    };
    info!("Sensor serial port opened at: {}", serial.device_path());

    run(Sensor::new(serial.into_link(), calibration, settings), &config).await
}

/// Stdout logging, plus a daily file when `file_dir` is set
///
/// `RUST_LOG` overrides the configured level.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let stdout = tracing_subscriber::fmt::layer();

    if config.file_dir.is_empty() {
        tracing_subscriber::registry().with(filter).with(stdout).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(&config.file_dir, "opto-ft.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Some(guard)
}

/// Apply startup settings that need the command path
async fn configure<L: SensorLink + 'static>(sensor: &Sensor<L>, config: &Config) -> Result<()> {
    let commands = sensor.commands();
    let revision = config.protocol.revision;

    if config.calibration.refresh_on_start && revision.has_command_params() {
        commands
            .refresh_calibration()
            .await
            .context("Failed to read calibration registers")?;
    }

    for channel_settings in &config.calibration.channels {
        let channel = channel_settings.channel()?;
        let replies = [
            commands
                .set_adc_root(channel, channel_settings.auto_calibrate, channel_settings.input_buffer)
                .await?,
            commands.set_gain(channel, channel_settings.gain()?).await?,
            commands
                .set_data_rate(channel, channel_settings.data_rate()?)
                .await?,
        ];
        for reply in replies.iter().filter(|r| r.is_error()) {
            warn!("Channel {} rejected a setting: {}", channel, reply.summary());
        }
        info!(
            "Channel {} configured (gain x{}, {} SPS)",
            channel, channel_settings.gain, channel_settings.data_rate_sps
        );
    }

    if let Some(mode) = config.stream.imu_mode {
        let reply = commands
            .configure_imu(mode, config.stream.imu_interval_ms)
            .await?;
        info!("IMU set to {}: {}", mode, reply.summary());
    }

    Ok(())
}

async fn run<L: SensorLink + 'static>(sensor: Sensor<L>, config: &Config) -> Result<()> {
    configure(&sensor, config).await?;

    let mut recorder = if config.telemetry.enabled {
        Some(SampleRecorder::from_config(&config.telemetry)?)
    } else {
        None
    };

    let stream = sensor.stream();
    let mut samples = stream.subscribe();
    stream.start(config.stream.rate_hz).await?;
    info!(
        "Streaming at {} Hz (worst-case shutdown latency {:?})",
        config.stream.rate_hz,
        stream.worst_case_shutdown_latency()
    );
    info!("Press Ctrl+C to exit");

    let mut health = interval(HEALTH_CHECK_INTERVAL);
    let mut sample_count: u64 = 0;

    loop {
        tokio::select! {
            received = samples.recv() => match received {
                Ok(sample) => {
                    sample_count += 1;

                    let failed = match recorder.as_mut() {
                        Some(recorder) => recorder.record(&sample).err(),
                        None => None,
                    };
                    if let Some(e) = failed {
                        warn!("Telemetry recording stopped: {}", e);
                        recorder = None;
                    }

                    if sample_count % config.stream.status_interval == 0 {
                        if let Some(measurement) = &sample.measurement {
                            let stats = stream.stats();
                            info!(
                                "{} samples ({} checksum failures, {} sync timeouts) | {}",
                                sample_count,
                                stats.checksum_failures,
                                stats.sync_timeouts,
                                format_wrench(measurement)
                            );
                        }
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Sample reader fell behind, {} samples dropped", missed),
                Err(RecvError::Closed) => break,
            },

            _ = health.tick() => {
                if !stream.is_running() {
                    warn!("Capture task ended");
                    break;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    let report = stream.stop().await?;
    if let Some(recorder) = recorder.as_mut() {
        recorder.flush()?;
        info!("Recorded {} samples", recorder.total_records());
    }

    if !report.device_stopped {
        warn!(
            "Device kept sending after {} stop commands",
            report.stop_attempts
        );
    }
    info!("Total samples received: {}", sample_count);
    Ok(())
}

/// One-line wrench summary, with saturated channels flagged
fn format_wrench(measurement: &Measurement) -> String {
    let [fx, fy, fz, tx, ty, tz] = measurement.wrench;
    let mut line = format!(
        "F [{:.3}, {:.3}, {:.3}] T [{:.3}, {:.3}, {:.3}]",
        fx, fy, fz, tx, ty, tz
    );
    if measurement.any_saturated() {
        line.push_str(" SATURATED");
    }
    if let Some(celsius) = measurement.temperature_celsius {
        line.push_str(&format!(" {:.1} °C", celsius));
    }
    line
}
