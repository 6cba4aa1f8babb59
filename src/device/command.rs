//! # Command/Response Controller
//!
//! Synchronous command exchanges with the sensor while it is not streaming.
//!
//! Each exchange runs Idle → Sent → WaitingResponse → Done → Idle under the
//! link mutex. Depending on the command the response is a sample frame
//! (poll), a calibration-register report, or ASCII status lines. Any
//! command issued while a streaming session is active fails immediately
//! with `DeviceBusy`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{SessionState, SessionStatus};
use crate::calibration::adc::{DataRate, PgaGain};
use crate::calibration::state::{CalibrationState, ChannelCalibration, SharedCalibration};
use crate::error::{OptoFtError, Result};
use crate::packet::crc::CrcSet;
use crate::packet::decoder::{decode_register_report, RegisterReport, StatusKind, StatusLine, StatusLineReader};
use crate::packet::encoder::CommandEncoder;
use crate::packet::protocol::*;
use crate::packet::sync::{FrameSynchronizer, SyncOutcome};
use crate::sample::{DecodedSample, SamplePipeline};
use crate::serial::port_trait::SensorLink;

/// Largest LED drive current the 0.01 mA command field can carry
pub const MAX_DAC_CURRENT_MA: f64 = 655.35;

/// Highest input multiplexer selection
pub const MAX_INPUT_MUX: u8 = 8;

/// Exchange phase, exposed for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandPhase {
    Idle = 0,
    Sent = 1,
    WaitingResponse = 2,
    Done = 3,
}

impl CommandPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Sent,
            2 => Self::WaitingResponse,
            3 => Self::Done,
            _ => Self::Idle,
        }
    }
}

/// Returns the phase to Idle however the exchange ends
struct PhaseGuard<'a>(&'a AtomicU8);

impl<'a> PhaseGuard<'a> {
    fn new(phase: &'a AtomicU8) -> Self {
        Self(phase)
    }

    fn set(&self, phase: CommandPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.0.store(CommandPhase::Idle as u8, Ordering::Release);
    }
}

/// Timing of command exchanges
#[derive(Debug, Clone)]
pub struct CommandSettings {
    /// Single read timeout
    pub io_timeout: Duration,
    /// Overall wait for status lines
    pub response_timeout: Duration,
    /// Byte budget when waiting for a response frame
    pub sync_budget: usize,
    /// Drive current used by [`CommandController::set_led`]
    pub led_on_current_ma: f64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_millis(10),
            response_timeout: Duration::from_millis(500),
            sync_budget: 512,
            led_on_current_ma: 20.0,
        }
    }
}

/// Status lines returned by a command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReply {
    pub lines: Vec<StatusLine>,
}

impl StatusReply {
    /// No line arrived before the response timeout
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn is_ok(&self) -> bool {
        self.lines.last().is_some_and(|l| l.kind == StatusKind::Ok)
    }

    pub fn is_error(&self) -> bool {
        self.lines.iter().any(|l| l.kind == StatusKind::Error)
    }

    /// Text of the final line, for display
    pub fn summary(&self) -> String {
        match self.lines.last() {
            Some(line) => line.text.clone(),
            None => "No response received".to_string(),
        }
    }
}

/// Command/response controller
pub struct CommandController<L> {
    link: Arc<Mutex<L>>,
    session: Arc<SessionStatus>,
    calibration: SharedCalibration,
    pipeline: SamplePipeline,
    encoder: CommandEncoder,
    crcs: CrcSet,
    revision: ProtocolRevision,
    settings: CommandSettings,
    phase: AtomicU8,
}

impl<L> std::fmt::Debug for CommandController<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandController")
            .field("revision", &self.revision)
            .field("phase", &self.phase())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<L> CommandController<L> {
    pub fn phase(&self) -> CommandPhase {
        CommandPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn settings(&self) -> &CommandSettings {
        &self.settings
    }
}

impl<L: SensorLink> CommandController<L> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        link: Arc<Mutex<L>>,
        session: Arc<SessionStatus>,
        calibration: SharedCalibration,
        pipeline: SamplePipeline,
        encoder: CommandEncoder,
        crcs: CrcSet,
        revision: ProtocolRevision,
        settings: CommandSettings,
    ) -> Self {
        Self {
            link,
            session,
            calibration,
            pipeline,
            encoder,
            crcs,
            revision,
            settings,
            phase: AtomicU8::new(CommandPhase::Idle as u8),
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.session.get() {
            SessionState::Idle => Ok(()),
            _ => Err(OptoFtError::DeviceBusy),
        }
    }

    /// Lock the link for an exchange
    ///
    /// Re-checks the session after the lock is granted, since streaming may
    /// have started while this caller was queued.
    async fn acquire(&self) -> Result<MutexGuard<'_, L>> {
        self.ensure_idle()?;
        let link = self.link.lock().await;
        self.ensure_idle()?;
        Ok(link)
    }

    async fn send_locked(&self, link: &mut L, command: &Command, phase: &PhaseGuard<'_>) -> Result<()> {
        let bytes = self.encoder.encode(command);

        link.purge_rx()
            .await
            .map_err(|e| OptoFtError::transport("Failed to purge receive buffer", e))?;
        link.write_all(&bytes)
            .await
            .map_err(|e| OptoFtError::transport("Failed to write command", e))?;
        link.flush()
            .await
            .map_err(|e| OptoFtError::transport("Failed to flush command", e))?;

        phase.set(CommandPhase::Sent);
        debug!("Sent {:?} as {:02X?}", command, bytes);
        Ok(())
    }

    fn synchronizer(&self) -> FrameSynchronizer {
        FrameSynchronizer::new(self.revision, self.crcs.clone(), self.settings.io_timeout)
    }

    /// Reject commands the legacy firmware cannot parse
    fn check_supported(&self, command: &Command) -> Result<()> {
        let parameterized = matches!(
            command,
            Command::ConfigureImu { .. } | Command::ConfigureAdc { .. } | Command::ConfigureDac { .. }
        );
        if parameterized && !self.revision.has_command_params() {
            return Err(OptoFtError::InvalidArgument(format!(
                "{:?} needs a firmware revision with command parameters",
                command
            )));
        }
        Ok(())
    }

    /// Send a command and collect its status lines
    async fn status_exchange(&self, command: Command) -> Result<StatusReply> {
        self.status_exchange_then(command, |_, _| {}).await
    }

    /// Like [`status_exchange`](Self::status_exchange), running `update` on
    /// the calibration state before the link is released
    async fn status_exchange_then<F>(&self, command: Command, update: F) -> Result<StatusReply>
    where
        F: FnOnce(&StatusReply, &mut CalibrationState) + Send,
    {
        self.check_supported(&command)?;
        let mut link = self.acquire().await?;
        let phase = PhaseGuard::new(&self.phase);

        self.send_locked(&mut link, &command, &phase).await?;
        phase.set(CommandPhase::WaitingResponse);

        let reply = self.read_status(&mut link).await?;
        phase.set(CommandPhase::Done);

        if reply.is_empty() {
            warn!("No response to {:?}", command);
        } else {
            debug!("{:?}: {}", command, reply.summary());
        }

        let mut state = self.calibration.write().unwrap_or_else(|e| e.into_inner());
        update(&reply, &mut *state);
        drop(state);
        drop(link);
        Ok(reply)
    }

    async fn read_status(&self, link: &mut L) -> Result<StatusReply> {
        let deadline = Instant::now() + self.settings.response_timeout;
        let mut reader = StatusLineReader::new();
        let mut reply = StatusReply::default();
        let mut buf = [0u8; 64];

        while Instant::now() < deadline {
            let n = link
                .read(&mut buf, self.settings.io_timeout)
                .await
                .map_err(|e| OptoFtError::transport("Failed to read status", e))?;

            for &byte in &buf[..n] {
                if let Some(line) = reader.push(byte) {
                    let terminal = line.kind.is_terminal();
                    reply.lines.push(line);
                    if terminal {
                        return Ok(reply);
                    }
                }
            }
        }

        Ok(reply)
    }

    /// Request a single sample
    ///
    /// # Returns
    ///
    /// * `Ok(Some(sample))` - A frame arrived (check `checksum_ok`)
    /// * `Ok(None)` - No frame within the sync budget
    ///
    /// # Errors
    ///
    /// * `DeviceBusy` - Streaming is active
    /// * `Transport` - Link failure
    pub async fn poll(&self) -> Result<Option<DecodedSample>> {
        let mut link = self.acquire().await?;
        let phase = PhaseGuard::new(&self.phase);

        self.send_locked(&mut link, &Command::Poll, &phase).await?;
        phase.set(CommandPhase::WaitingResponse);

        let mut sync = self.synchronizer();
        let header = match sync
            .synchronize(&mut *link, self.settings.sync_budget)
            .await
            .map_err(|e| OptoFtError::transport("Failed to read poll response", e))?
        {
            SyncOutcome::Found(header) => header,
            SyncOutcome::NotFound { scanned } => {
                debug!("Poll: no frame after {} read attempts", scanned);
                return Ok(None);
            }
        };

        let body = sync
            .read_body(&mut *link, self.pipeline.body_len())
            .await
            .map_err(|e| OptoFtError::transport("Failed to read poll response", e))?;
        phase.set(CommandPhase::Done);

        Ok(body.map(|body| self.pipeline.decode(header, &body)))
    }

    /// Query the OFC/FSC registers of one channel and store them
    ///
    /// # Errors
    ///
    /// * `FrameSyncTimeout` - No report header arrived
    /// * `ChecksumMismatch` - Report CRC8 failed
    /// * `CalibrationRead` - Truncated report or wrong channel
    /// * `DeviceBusy`, `Transport`
    pub async fn read_registers(&self, channel: Channel) -> Result<RegisterReport> {
        let command = Command::ConfigureAdc {
            channel,
            setting: AdcSetting::ReportRegisters,
        };
        self.check_supported(&command)?;

        let mut link = self.acquire().await?;
        let phase = PhaseGuard::new(&self.phase);

        self.send_locked(&mut link, &command, &phase).await?;
        phase.set(CommandPhase::WaitingResponse);

        let mut sync = self.synchronizer();
        let header = match sync
            .synchronize(&mut *link, self.settings.sync_budget)
            .await
            .map_err(|e| OptoFtError::transport("Failed to read register report", e))?
        {
            SyncOutcome::Found(header) => header,
            SyncOutcome::NotFound { scanned } => return Err(OptoFtError::FrameSyncTimeout(scanned)),
        };

        let body = sync
            .read_body(&mut *link, REGISTER_REPORT_LEN)
            .await
            .map_err(|e| OptoFtError::transport("Failed to read register report", e))?
            .ok_or_else(|| OptoFtError::CalibrationRead {
                channel: channel.index(),
                reason: "truncated register report".to_string(),
            })?;
        phase.set(CommandPhase::Done);

        let report = decode_register_report(&header, &body, &self.crcs.crc8)?;
        if report.channel != channel {
            return Err(OptoFtError::CalibrationRead {
                channel: channel.index(),
                reason: format!("report was for channel {}", report.channel.index()),
            });
        }

        self.calibration
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set_registers(&report);
        debug!(
            "Channel {} registers: OFC {} FSC 0x{:06X}",
            channel, report.ofc, report.fsc
        );
        Ok(report)
    }

    /// Read the registers of every channel
    ///
    /// A channel whose read fails keeps its previous values.
    ///
    /// # Returns
    ///
    /// * `Result<usize>` - Number of channels refreshed
    ///
    /// # Errors
    ///
    /// `DeviceBusy` and `Transport` abort the refresh
    pub async fn refresh_calibration(&self) -> Result<usize> {
        let mut refreshed = 0;

        for channel in Channel::ALL {
            match self.read_registers(channel).await {
                Ok(_) => refreshed += 1,
                Err(e @ (OptoFtError::DeviceBusy | OptoFtError::Transport(_))) => return Err(e),
                Err(e) => warn!("Keeping previous calibration for channel {}: {}", channel, e),
            }
        }

        info!("Refreshed calibration registers for {}/{} channels", refreshed, NUM_CHANNELS);
        Ok(refreshed)
    }

    /// Apply an ADC setting and record it in the calibration state
    ///
    /// The state is updated unless the device answers with an error line
    /// (firmware that does not answer at all counts as accepted).
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for `ReportRegisters` (use
    /// [`read_registers`](Self::read_registers)) or a mux input above 8
    pub async fn configure_adc(&self, channel: Channel, setting: AdcSetting) -> Result<StatusReply> {
        match setting {
            AdcSetting::ReportRegisters => {
                return Err(OptoFtError::InvalidArgument(
                    "register reports are read with read_registers".to_string(),
                ))
            }
            AdcSetting::PositiveInput(mux) | AdcSetting::NegativeInput(mux) if mux > MAX_INPUT_MUX => {
                return Err(OptoFtError::InvalidArgument(format!(
                    "Input mux {} out of range 0..={}",
                    mux, MAX_INPUT_MUX
                )))
            }
            _ => {}
        }

        self.status_exchange_then(Command::ConfigureAdc { channel, setting }, |reply, state| {
            if !reply.is_error() {
                state.apply_setting(channel, &setting);
            }
        })
        .await
    }

    pub async fn set_gain(&self, channel: Channel, gain: PgaGain) -> Result<StatusReply> {
        self.configure_adc(channel, AdcSetting::Gain(gain)).await
    }

    pub async fn set_data_rate(&self, channel: Channel, rate: DataRate) -> Result<StatusReply> {
        self.configure_adc(channel, AdcSetting::DataRate(rate)).await
    }

    /// Auto-calibration and input buffer switches
    pub async fn set_adc_root(
        &self,
        channel: Channel,
        auto_calibrate: bool,
        input_buffer: bool,
    ) -> Result<StatusReply> {
        self.configure_adc(
            channel,
            AdcSetting::Root {
                auto_calibrate,
                input_buffer,
            },
        )
        .await
    }

    /// Select both input multiplexers; stops at the first rejected one
    pub async fn set_input_mux(&self, channel: Channel, positive: u8, negative: u8) -> Result<StatusReply> {
        let reply = self
            .configure_adc(channel, AdcSetting::PositiveInput(positive))
            .await?;
        if reply.is_error() {
            return Ok(reply);
        }
        self.configure_adc(channel, AdcSetting::NegativeInput(negative))
            .await
    }

    /// Run the converter self-calibration, then re-read its registers
    pub async fn self_calibrate(&self, channel: Channel) -> Result<StatusReply> {
        let reply = self
            .configure_adc(channel, AdcSetting::SelfCalibrate)
            .await?;

        if !reply.is_error() {
            if let Err(e) = self.read_registers(channel).await {
                warn!("Registers of channel {} not refreshed after self-calibration: {}", channel, e);
            }
        }
        Ok(reply)
    }

    /// Set the LED drive current of a channel
    ///
    /// # Errors
    ///
    /// `InvalidArgument` unless `current_ma` is within 0..=655.35
    pub async fn configure_dac(&self, channel: Channel, current_ma: f64) -> Result<StatusReply> {
        if !(0.0..=MAX_DAC_CURRENT_MA).contains(&current_ma) {
            return Err(OptoFtError::InvalidArgument(format!(
                "LED current {} mA out of range 0..={}",
                current_ma, MAX_DAC_CURRENT_MA
            )));
        }

        let current_centi_ma = (current_ma * 100.0).round() as u16;
        self.status_exchange(Command::ConfigureDac {
            channel,
            current_centi_ma,
        })
        .await
    }

    /// Switch a channel's LED between the configured on-current and off
    pub async fn set_led(&self, channel: Channel, on: bool) -> Result<StatusReply> {
        let current = if on { self.settings.led_on_current_ma } else { 0.0 };
        self.configure_dac(channel, current).await
    }

    pub async fn configure_imu(&self, mode: ImuMode, interval_ms: u16) -> Result<StatusReply> {
        self.status_exchange(Command::ConfigureImu { mode, interval_ms })
            .await
    }

    /// Like [`configure_imu`](Self::configure_imu), with the mode given by name
    pub async fn configure_imu_named(&self, mode: &str, interval_ms: u16) -> Result<StatusReply> {
        self.configure_imu(mode.parse()?, interval_ms).await
    }

    /// Full device reset; channel settings return to defaults
    pub async fn reset(&self) -> Result<StatusReply> {
        self.status_exchange_then(Command::Reset, |_, state| state.reset_channels())
            .await
    }

    /// Reset one converter; its settings and registers return to defaults
    pub async fn reset_channel(&self, channel: Channel) -> Result<StatusReply> {
        self.status_exchange_then(Command::ResetChannel(channel), |_, state| {
            *state.channel_mut(channel) = ChannelCalibration::default();
        })
        .await
    }

    pub async fn deactivate_channel(&self, channel: Channel) -> Result<StatusReply> {
        self.status_exchange(Command::DeactivateChannel(channel))
            .await
    }

    pub async fn reset_imu(&self) -> Result<StatusReply> {
        self.status_exchange(Command::ResetImu).await
    }

    pub async fn reset_dac(&self) -> Result<StatusReply> {
        self.status_exchange(Command::ResetDac).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::state::CalibrationState;
    use crate::packet::crc::{Crc, CrcSpec};
    use crate::packet::decoder::PacketDecoder;
    use crate::serial::port_trait::mocks::ScriptedLink;
    use crate::serial::port_trait::MockSensorLink;
    use crate::serial::virtual_sensor::VirtualSensor;
    use std::io;
    use std::sync::RwLock;

    fn settings() -> CommandSettings {
        CommandSettings {
            io_timeout: Duration::from_millis(1),
            response_timeout: Duration::from_millis(50),
            sync_budget: 256,
            led_on_current_ma: 20.0,
        }
    }

    fn controller<L: SensorLink>(link: L, revision: ProtocolRevision) -> CommandController<L> {
        let calibration = Arc::new(RwLock::new(CalibrationState::default()));
        let crcs = CrcSet::default();
        CommandController::new(
            Arc::new(Mutex::new(link)),
            Arc::new(SessionStatus::default()),
            calibration.clone(),
            SamplePipeline::new(PacketDecoder::new(revision, Crc::new(CrcSpec::CRC32)), calibration),
            CommandEncoder::new(revision, crcs.clone()),
            crcs,
            revision,
            settings(),
        )
    }

    fn ch(index: usize) -> Channel {
        Channel::new(index).unwrap()
    }

    #[tokio::test]
    async fn test_poll_returns_valid_sample() {
        let sensor = VirtualSensor::new(ProtocolRevision::Current);
        let controller = controller(sensor.clone(), ProtocolRevision::Current);

        let sample = controller.poll().await.unwrap().unwrap();
        assert!(sample.checksum_ok);
        assert!(sample.measurement.is_some());
        assert_eq!(controller.phase(), CommandPhase::Idle);
        assert_eq!(sensor.commands(), vec![vec![0x12, 0x00, 0x00, 0x74]]);
    }

    #[tokio::test]
    async fn test_poll_without_response_is_none() {
        let link = ScriptedLink::new(Vec::new());
        let controller = controller(link, ProtocolRevision::Current);
        assert!(controller.poll().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_corrupted_frame_is_invalid_sample() {
        let sensor = VirtualSensor::new(ProtocolRevision::Current);
        sensor.corrupt_every(1);
        let controller = controller(sensor, ProtocolRevision::Current);

        let sample = controller.poll().await.unwrap().unwrap();
        assert!(!sample.checksum_ok);
        assert!(sample.measurement.is_none());
    }

    #[tokio::test]
    async fn test_legacy_poll() {
        let sensor = VirtualSensor::new(ProtocolRevision::Legacy);
        let controller = controller(sensor.clone(), ProtocolRevision::Legacy);

        let sample = controller.poll().await.unwrap().unwrap();
        assert!(sample.checksum_ok);
        assert_eq!(sensor.commands(), vec![vec![0x12]]);
    }

    #[tokio::test]
    async fn test_busy_while_streaming() {
        let sensor = VirtualSensor::new(ProtocolRevision::Current);
        let controller = controller(sensor.clone(), ProtocolRevision::Current);
        controller.session.set(SessionState::Streaming);

        assert!(matches!(controller.poll().await, Err(OptoFtError::DeviceBusy)));
        assert!(matches!(
            controller.set_gain(ch(0), PgaGain::X2).await,
            Err(OptoFtError::DeviceBusy)
        ));
        // Nothing reached the device and nothing changed
        assert!(sensor.commands().is_empty());
        assert_eq!(
            controller.calibration.read().unwrap().channel(ch(0)).gain,
            PgaGain::X1
        );
    }

    #[tokio::test]
    async fn test_status_reply_and_state_update() {
        let sensor = VirtualSensor::new(ProtocolRevision::Current);
        let controller = controller(sensor, ProtocolRevision::Current);

        let reply = controller.set_gain(ch(2), PgaGain::X16).await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.summary(), "ADC 3 gain 16");

        controller.set_data_rate(ch(2), DataRate::Sps500).await.unwrap();
        controller.set_adc_root(ch(2), true, true).await.unwrap();

        let cal = *controller.calibration.read().unwrap().channel(ch(2));
        assert_eq!(cal.gain, PgaGain::X16);
        assert_eq!(cal.data_rate, DataRate::Sps500);
        assert!(cal.input_buffer && cal.auto_calibrate);
    }

    #[tokio::test]
    async fn test_error_reply_leaves_state() {
        // The controller purges RX before sending, so feed the reply after the write
        let link = ScriptedLink::new(Vec::new());
        let handle = link.clone();
        let controller = controller(link, ProtocolRevision::Current);

        let reply_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            handle.push_rx(b"!gain rejected\n");
        });
        let reply = controller.set_gain(ch(0), PgaGain::X64).await.unwrap();
        reply_task.await.unwrap();

        assert!(reply.is_error());
        assert_eq!(
            controller.calibration.read().unwrap().channel(ch(0)).gain,
            PgaGain::X1
        );
    }

    #[tokio::test]
    async fn test_no_response_summary() {
        let controller = controller(ScriptedLink::new(Vec::new()), ProtocolRevision::Current);
        let reply = controller.reset_imu().await.unwrap();
        assert!(reply.is_empty());
        assert_eq!(reply.summary(), "No response received");
    }

    #[tokio::test]
    async fn test_self_calibrate_collects_info_lines_and_registers() {
        let sensor = VirtualSensor::new(ProtocolRevision::Current);
        sensor.set_registers(ch(1), -42, 0x41_0000);
        let controller = controller(sensor, ProtocolRevision::Current);

        let reply = controller.self_calibrate(ch(1)).await.unwrap();
        assert_eq!(reply.lines.len(), 2);
        assert_eq!(reply.lines[0].kind, StatusKind::Info);
        assert!(reply.is_ok());

        let cal = *controller.calibration.read().unwrap().channel(ch(1));
        assert_eq!(cal.registers(), Some((-42, 0x41_0000)));
    }

    #[tokio::test]
    async fn test_read_registers() {
        let sensor = VirtualSensor::new(ProtocolRevision::Current);
        sensor.set_registers(ch(5), 1234, 0x3F_FFFF);
        let controller = controller(sensor, ProtocolRevision::Current);

        let report = controller.read_registers(ch(5)).await.unwrap();
        assert_eq!(report.ofc, 1234);
        assert_eq!(report.fsc, 0x3F_FFFF);
        assert_eq!(
            controller.calibration.read().unwrap().channel(ch(5)).registers(),
            Some((1234, 0x3F_FFFF))
        );
    }

    #[tokio::test]
    async fn test_read_registers_timeout() {
        let controller = controller(ScriptedLink::new(Vec::new()), ProtocolRevision::Current);
        assert!(matches!(
            controller.read_registers(ch(0)).await,
            Err(OptoFtError::FrameSyncTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_keeps_prior_values_on_failure() {
        let controller = controller(ScriptedLink::new(Vec::new()), ProtocolRevision::Current);
        controller.calibration.write().unwrap().set_registers(&RegisterReport {
            channel: ch(3),
            ofc: 7,
            fsc: 9,
        });

        let refreshed = controller.refresh_calibration().await.unwrap();
        assert_eq!(refreshed, 0);
        assert_eq!(
            controller.calibration.read().unwrap().channel(ch(3)).registers(),
            Some((7, 9))
        );
    }

    #[tokio::test]
    async fn test_refresh_all_channels() {
        let sensor = VirtualSensor::new(ProtocolRevision::Current);
        let controller = controller(sensor, ProtocolRevision::Current);
        assert_eq!(controller.refresh_calibration().await.unwrap(), NUM_CHANNELS);
    }

    #[tokio::test]
    async fn test_argument_validation() {
        let sensor = VirtualSensor::new(ProtocolRevision::Current);
        let controller = controller(sensor.clone(), ProtocolRevision::Current);

        assert!(controller.configure_dac(ch(0), -1.0).await.is_err());
        assert!(controller.configure_dac(ch(0), 700.0).await.is_err());
        assert!(controller.configure_dac(ch(0), f64::NAN).await.is_err());
        assert!(controller.set_input_mux(ch(0), 9, 0).await.is_err());
        assert!(controller.configure_imu_named("compass", 10).await.is_err());
        assert!(sensor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_dac_and_imu_commands() {
        let sensor = VirtualSensor::new(ProtocolRevision::Current);
        let controller = controller(sensor.clone(), ProtocolRevision::Current);

        controller.set_led(ch(0), true).await.unwrap();
        let reply = controller
            .configure_imu_named("Game Rotation Vector", 10)
            .await
            .unwrap();
        assert!(reply.is_ok());

        let commands = sensor.commands();
        // 20 mA = 2000 (0x07D0) centi-mA
        assert_eq!(&commands[0][..3], &[0x41, 0x07, 0xD0]);
        assert_eq!(&commands[1][..3], &[0x28, 0x00, 0x0A]);
    }

    #[tokio::test]
    async fn test_legacy_rejects_parameterized_commands() {
        let sensor = VirtualSensor::new(ProtocolRevision::Legacy);
        let controller = controller(sensor, ProtocolRevision::Legacy);
        assert!(matches!(
            controller.set_gain(ch(0), PgaGain::X2).await,
            Err(OptoFtError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_state_update_runs_while_link_held() {
        let sensor = VirtualSensor::new(ProtocolRevision::Current);
        let controller = controller(sensor, ProtocolRevision::Current);
        let link = Arc::clone(&controller.link);
        let mut link_held = false;

        let command = Command::ConfigureAdc {
            channel: ch(1),
            setting: AdcSetting::Gain(PgaGain::X32),
        };
        let reply = controller
            .status_exchange_then(command, |reply, state| {
                link_held = link.try_lock().is_err();
                state.apply_setting(ch(1), &AdcSetting::Gain(PgaGain::X32));
                assert!(reply.is_ok());
            })
            .await
            .unwrap();

        assert!(reply.is_ok());
        assert!(link_held);
        assert!(link.try_lock().is_ok());
        assert_eq!(
            controller.calibration.read().unwrap().channel(ch(1)).gain,
            PgaGain::X32
        );
    }

    #[tokio::test]
    async fn test_reset_channel_restores_defaults() {
        let sensor = VirtualSensor::new(ProtocolRevision::Current);
        let controller = controller(sensor, ProtocolRevision::Current);

        controller.set_gain(ch(4), PgaGain::X8).await.unwrap();
        controller.read_registers(ch(4)).await.unwrap();
        controller.reset_channel(ch(4)).await.unwrap();

        let cal = *controller.calibration.read().unwrap().channel(ch(4));
        assert_eq!(cal, ChannelCalibration::default());
    }

    #[tokio::test]
    async fn test_write_failure_is_transport_error() {
        let mut link = MockSensorLink::new();
        link.expect_purge_rx().returning(|| Ok(()));
        link.expect_write_all()
            .returning(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")));

        let controller = controller(link, ProtocolRevision::Current);
        let err = controller.poll().await.unwrap_err();
        assert!(matches!(err, OptoFtError::Transport(_)));
        assert_eq!(controller.phase(), CommandPhase::Idle);
    }
}
