//! # Device Module
//!
//! Controllers that drive the sensor over a [`SensorLink`].
//!
//! This module handles:
//! - Synchronous command/response exchanges ([`command`])
//! - The continuous streaming session and its capture task ([`stream`])
//! - Handing samples from the capture task to readers ([`mailbox`])
//!
//! Both controllers share one link mutex and one session state, so a
//! command can never interleave with a streaming frame.

pub mod command;
pub mod mailbox;
pub mod stream;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::calibration::state::{CalibrationState, SharedCalibration};
use crate::packet::crc::CrcSet;
use crate::packet::decoder::PacketDecoder;
use crate::packet::encoder::CommandEncoder;
use crate::packet::protocol::{CommandTrailer, ProtocolRevision};
use crate::sample::SamplePipeline;
use crate::serial::port_trait::SensorLink;
use command::{CommandController, CommandSettings};
use stream::{StreamConfig, StreamingController};

/// Streaming session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Starting = 1,
    Streaming = 2,
    Stopping = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Streaming,
            3 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

/// Session state shared by both controllers
#[derive(Debug, Default)]
pub struct SessionStatus(AtomicU8);

impl SessionStatus {
    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from` → `to`; false if the state was not `from`
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Everything needed to build a [`Sensor`]
#[derive(Debug, Clone, Default)]
pub struct SensorSettings {
    pub revision: ProtocolRevision,
    /// Overrides the revision's command trailer
    pub command_trailer: Option<CommandTrailer>,
    pub command: CommandSettings,
    pub stream: StreamConfig,
}

/// A connected sensor: one link, one calibration state, both controllers
pub struct Sensor<L: SensorLink + 'static> {
    calibration: SharedCalibration,
    session: Arc<SessionStatus>,
    commands: CommandController<L>,
    stream: StreamingController<L>,
}

impl<L: SensorLink + 'static> Sensor<L> {
    /// # Arguments
    ///
    /// * `link` - Opened transport (serial port or virtual sensor)
    /// * `calibration` - Starting calibration (vref, matrix, channel settings)
    /// * `settings` - Protocol revision and controller timing
    ///
    /// # Examples
    ///
    /// ```
    /// use opto_ft::calibration::CalibrationState;
    /// use opto_ft::device::{Sensor, SensorSettings};
    /// use opto_ft::packet::protocol::ProtocolRevision;
    /// use opto_ft::serial::virtual_sensor::VirtualSensor;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> opto_ft::error::Result<()> {
    /// let link = VirtualSensor::new(ProtocolRevision::Current);
    /// let sensor = Sensor::new(link, CalibrationState::default(), SensorSettings::default());
    ///
    /// let sample = sensor.commands().poll().await?;
    /// assert!(sample.is_some());
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(link: L, calibration: CalibrationState, settings: SensorSettings) -> Self {
        let SensorSettings {
            revision,
            command_trailer,
            command,
            stream,
        } = settings;

        let link = Arc::new(Mutex::new(link));
        let session = Arc::new(SessionStatus::default());
        let calibration: SharedCalibration = Arc::new(RwLock::new(calibration));
        let crcs = CrcSet::default();

        let mut encoder = CommandEncoder::new(revision, crcs.clone());
        if let Some(trailer) = command_trailer {
            encoder = encoder.with_trailer(trailer);
        }
        let pipeline = SamplePipeline::new(
            PacketDecoder::new(revision, crcs.crc32.clone()),
            Arc::clone(&calibration),
        );

        let commands = CommandController::new(
            Arc::clone(&link),
            Arc::clone(&session),
            Arc::clone(&calibration),
            pipeline.clone(),
            encoder.clone(),
            crcs.clone(),
            revision,
            command,
        );
        let stream = StreamingController::new(
            link,
            Arc::clone(&session),
            pipeline,
            encoder,
            crcs,
            revision,
            stream,
        );

        Self {
            calibration,
            session,
            commands,
            stream,
        }
    }

    pub fn commands(&self) -> &CommandController<L> {
        &self.commands
    }

    pub fn stream(&self) -> &StreamingController<L> {
        &self.stream
    }

    /// Shared handle to the calibration state
    pub fn calibration(&self) -> SharedCalibration {
        Arc::clone(&self.calibration)
    }

    pub fn session_state(&self) -> SessionState {
        self.session.get()
    }
}
