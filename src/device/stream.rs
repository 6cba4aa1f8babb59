//! # Streaming Controller
//!
//! Continuous capture at up to 1.5 kHz.
//!
//! `start` claims the session, sends the start command and spawns the
//! capture task. The task repeats synchronize → decode → convert, holding
//! the link mutex for one frame attempt at a time, and publishes valid
//! samples into the [`Mailbox`]. `stop` raises the exit flag, tells the
//! device to stop until its queue drains, then joins the task with a
//! bounded wait.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::mailbox::Mailbox;
use super::{SessionState, SessionStatus};
use crate::error::{OptoFtError, Result};
use crate::packet::crc::CrcSet;
use crate::packet::encoder::CommandEncoder;
use crate::packet::protocol::{Command, ProtocolRevision};
use crate::packet::sync::{FrameSynchronizer, SyncOutcome};
use crate::sample::{DecodedSample, SamplePipeline};
use crate::serial::port_trait::SensorLink;

/// Fastest rate the firmware accepts
pub const DEFAULT_MAX_RATE_HZ: u16 = 1500;

/// Streaming timing and limits
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub max_rate_hz: u16,
    /// Single read timeout inside the capture loop
    pub io_timeout: Duration,
    /// Read attempts per frame before counting a sync timeout
    pub byte_budget: usize,
    /// Stop commands sent before giving up on a quiet device
    pub stop_retries: u32,
    /// Wait after each stop command before checking the device queue
    pub stop_settle: Duration,
    /// Consecutive link errors that end the session
    pub max_io_errors: u32,
    /// Extra wait on top of the worst-case latency when joining the task
    pub join_margin: Duration,
    /// Samples buffered per broadcast subscriber
    pub broadcast_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_rate_hz: DEFAULT_MAX_RATE_HZ,
            io_timeout: Duration::from_millis(10),
            byte_budget: 256,
            stop_retries: 5,
            stop_settle: Duration::from_millis(20),
            max_io_errors: 10,
            join_margin: Duration::from_millis(250),
            broadcast_capacity: 1024,
        }
    }
}

impl StreamConfig {
    /// Longest time one frame attempt can hold the link
    ///
    /// The synchronizer may overshoot its budget by one header while
    /// checking a candidate, and the body read can time out once.
    pub fn worst_case_shutdown_latency(&self, revision: ProtocolRevision) -> Duration {
        let reads = self.byte_budget + revision.header_len() + 1;
        self.io_timeout * reads as u32
    }
}

/// Capture counters, updated by the capture task
#[derive(Debug, Default)]
pub struct StreamStats {
    frames: AtomicU64,
    checksum_failures: AtomicU64,
    sync_timeouts: AtomicU64,
    truncated: AtomicU64,
    io_errors: AtomicU64,
    skipped_bytes: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Frames that passed their checksum
    pub frames: u64,
    pub checksum_failures: u64,
    pub sync_timeouts: u64,
    /// Bodies cut short by a read timeout
    pub truncated: u64,
    pub io_errors: u64,
    /// Bytes discarded while hunting for a header
    pub skipped_bytes: u64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            sync_timeouts: self.sync_timeouts.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            skipped_bytes: self.skipped_bytes.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.frames,
            &self.checksum_failures,
            &self.sync_timeouts,
            &self.truncated,
            &self.io_errors,
            &self.skipped_bytes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Outcome of [`StreamingController::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Stop commands sent (0 when the session was already idle)
    pub stop_attempts: u32,
    /// The device queue read empty after a stop command
    pub device_stopped: bool,
    /// The capture task exited on its own within the bounded wait
    pub task_joined: bool,
    pub stats: StatsSnapshot,
}

/// Result of one frame attempt
enum Attempt {
    Frame(DecodedSample),
    SyncTimeout,
    Truncated,
}

/// State moved into the capture task
struct CaptureTask<L> {
    link: Arc<Mutex<L>>,
    pipeline: SamplePipeline,
    sync: FrameSynchronizer,
    mailbox: Arc<Mailbox<DecodedSample>>,
    stats: Arc<StreamStats>,
    exit: Arc<AtomicBool>,
    byte_budget: usize,
    io_timeout: Duration,
    max_io_errors: u32,
}

impl<L: SensorLink> CaptureTask<L> {
    async fn run(mut self) -> Result<()> {
        let mut consecutive_errors = 0u32;
        let shared_link = Arc::clone(&self.link);
        info!("Capture task started");

        loop {
            let mut link = shared_link.lock().await;
            if self.exit.load(Ordering::Acquire) {
                break;
            }

            let attempt = self.attempt(&mut *link).await;
            drop(link);
            self.stats
                .skipped_bytes
                .store(self.sync.skipped_total(), Ordering::Relaxed);

            match attempt {
                Ok(Attempt::Frame(sample)) => {
                    consecutive_errors = 0;
                    if sample.checksum_ok {
                        self.stats.frames.fetch_add(1, Ordering::Relaxed);
                        self.mailbox.publish(sample);
                    } else {
                        self.stats.checksum_failures.fetch_add(1, Ordering::Relaxed);
                        debug!("Frame {} failed its checksum", sample.counter);
                    }
                }
                Ok(Attempt::SyncTimeout) => {
                    consecutive_errors = 0;
                    self.stats.sync_timeouts.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Attempt::Truncated) => {
                    consecutive_errors = 0;
                    self.stats.truncated.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Link error during capture ({}/{}): {}",
                        consecutive_errors, self.max_io_errors, e
                    );

                    if consecutive_errors >= self.max_io_errors {
                        error!(
                            "Capture aborted after {} consecutive link errors; stop() must be called to release the session",
                            consecutive_errors
                        );
                        return Err(OptoFtError::transport("Capture aborted", e));
                    }
                    self.sync.reset();
                    tokio::time::sleep(self.io_timeout).await;
                }
            }
        }

        info!("Capture task exiting");
        Ok(())
    }

    async fn attempt(&mut self, link: &mut L) -> std::io::Result<Attempt> {
        let header = match self.sync.synchronize(link, self.byte_budget).await? {
            SyncOutcome::Found(header) => header,
            SyncOutcome::NotFound { .. } => return Ok(Attempt::SyncTimeout),
        };

        match self.sync.read_body(link, self.pipeline.body_len()).await? {
            Some(body) => Ok(Attempt::Frame(self.pipeline.decode(header, &body))),
            None => Ok(Attempt::Truncated),
        }
    }
}

/// Streaming controller
pub struct StreamingController<L: SensorLink + 'static> {
    link: Arc<Mutex<L>>,
    session: Arc<SessionStatus>,
    pipeline: SamplePipeline,
    encoder: CommandEncoder,
    crcs: CrcSet,
    revision: ProtocolRevision,
    config: StreamConfig,
    mailbox: Arc<Mailbox<DecodedSample>>,
    stats: Arc<StreamStats>,
    exit: Arc<AtomicBool>,
    task: std::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl<L: SensorLink + 'static> StreamingController<L> {
    pub fn new(
        link: Arc<Mutex<L>>,
        session: Arc<SessionStatus>,
        pipeline: SamplePipeline,
        encoder: CommandEncoder,
        crcs: CrcSet,
        revision: ProtocolRevision,
        config: StreamConfig,
    ) -> Self {
        let mailbox = Arc::new(Mailbox::new(config.broadcast_capacity));
        Self {
            link,
            session,
            pipeline,
            encoder,
            crcs,
            revision,
            config,
            mailbox,
            stats: Arc::new(StreamStats::default()),
            exit: Arc::new(AtomicBool::new(false)),
            task: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// See [`StreamConfig::worst_case_shutdown_latency`]
    pub fn worst_case_shutdown_latency(&self) -> Duration {
        self.config.worst_case_shutdown_latency(self.revision)
    }

    /// Start continuous streaming
    ///
    /// # Arguments
    ///
    /// * `rate_hz` - Sample rate, 1..=`max_rate_hz`
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` - Rate out of range
    /// * `DeviceBusy` - A session is already active (nothing is sent)
    /// * `Transport` - The start command could not be written
    pub async fn start(&self, rate_hz: u16) -> Result<()> {
        if rate_hz == 0 || rate_hz > self.config.max_rate_hz {
            return Err(OptoFtError::InvalidArgument(format!(
                "Rate {} Hz out of range 1..={}",
                rate_hz, self.config.max_rate_hz
            )));
        }
        if !self.session.transition(SessionState::Idle, SessionState::Starting) {
            return Err(OptoFtError::DeviceBusy);
        }

        self.exit.store(false, Ordering::Release);
        self.stats.reset();
        self.mailbox.clear();

        // The handle is stored before the link is released, so a stop that
        // arrives meanwhile always finds it once it gets the link
        let mut link = self.link.lock().await;
        if let Err(e) = self.send_start(&mut *link, rate_hz).await {
            drop(link);
            if !self.session.transition(SessionState::Starting, SessionState::Idle) {
                debug!("Start failed while a stop was in progress");
            }
            return Err(e);
        }

        let task = CaptureTask {
            link: Arc::clone(&self.link),
            pipeline: self.pipeline.clone(),
            sync: FrameSynchronizer::new(self.revision, self.crcs.clone(), self.config.io_timeout),
            mailbox: Arc::clone(&self.mailbox),
            stats: Arc::clone(&self.stats),
            exit: Arc::clone(&self.exit),
            byte_budget: self.config.byte_budget,
            io_timeout: self.config.io_timeout,
            max_io_errors: self.config.max_io_errors.max(1),
        };
        let handle = tokio::spawn(task.run());
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        drop(link);

        if !self.session.transition(SessionState::Starting, SessionState::Streaming) {
            // stop() claimed the session while the start command was in flight
            self.exit.store(true, Ordering::Release);
            info!("Streaming stopped before it began");
            return Ok(());
        }
        info!("Streaming started at {} Hz", rate_hz);
        Ok(())
    }

    async fn send_start(&self, link: &mut L, rate_hz: u16) -> Result<()> {
        let command = self.encoder.encode(&Command::StartStreaming { rate_hz });

        link.purge_rx()
            .await
            .map_err(|e| OptoFtError::transport("Failed to purge receive buffer", e))?;
        link.purge_tx()
            .await
            .map_err(|e| OptoFtError::transport("Failed to purge transmit buffer", e))?;
        link.write_all(&command)
            .await
            .map_err(|e| OptoFtError::transport("Failed to send start command", e))?;
        link.flush()
            .await
            .map_err(|e| OptoFtError::transport("Failed to send start command", e))
    }

    /// Stop streaming and end the capture task
    ///
    /// Returns immediately when no session is active.
    ///
    /// # Errors
    ///
    /// * `Transport` - The capture task ended on link errors, or the stop
    ///   handshake could not reach the device
    /// * `DeviceBusy` - Another stop is in progress
    pub async fn stop(&self) -> Result<StopReport> {
        if self.session.get() == SessionState::Idle {
            return Ok(StopReport {
                stop_attempts: 0,
                device_stopped: true,
                task_joined: true,
                stats: self.stats.snapshot(),
            });
        }
        if !self.session.transition(SessionState::Streaming, SessionState::Stopping)
            && !self.session.transition(SessionState::Starting, SessionState::Stopping)
        {
            return Err(OptoFtError::DeviceBusy);
        }

        self.exit.store(true, Ordering::Release);
        let handshake = self.stop_handshake().await;

        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let (task_joined, task_result) = match handle {
            Some(handle) => self.join(handle).await,
            None => (true, Ok(())),
        };

        self.session.set(SessionState::Idle);
        let stats = self.stats.snapshot();
        info!(
            "Streaming stopped: {} frames, {} checksum failures, {} sync timeouts",
            stats.frames, stats.checksum_failures, stats.sync_timeouts
        );

        task_result?;
        let (stop_attempts, device_stopped) = handshake?;
        Ok(StopReport {
            stop_attempts,
            device_stopped,
            task_joined,
            stats,
        })
    }

    /// Send stop until the device queue stays empty
    async fn stop_handshake(&self) -> Result<(u32, bool)> {
        let command = self.encoder.encode(&Command::StopStreaming);
        let retries = self.config.stop_retries.max(1);
        let mut link = self.link.lock().await;

        for attempt in 1..=retries {
            link.write_all(&command)
                .await
                .map_err(|e| OptoFtError::transport("Failed to send stop command", e))?;
            link.flush()
                .await
                .map_err(|e| OptoFtError::transport("Failed to send stop command", e))?;
            tokio::time::sleep(self.config.stop_settle).await;

            let queued = link
                .queued_bytes()
                .await
                .map_err(|e| OptoFtError::transport("Failed to query receive queue", e))?;
            if queued == 0 {
                debug!("Device quiet after {} stop command(s)", attempt);
                return Ok((attempt, true));
            }

            debug!("{} bytes still queued after stop attempt {}", queued, attempt);
            link.purge_rx()
                .await
                .map_err(|e| OptoFtError::transport("Failed to purge receive buffer", e))?;
            link.purge_tx()
                .await
                .map_err(|e| OptoFtError::transport("Failed to purge transmit buffer", e))?;
            link.reset_device()
                .await
                .map_err(|e| OptoFtError::transport("Failed to reset device", e))?;
        }

        warn!("Device still sending after {} stop commands", retries);
        Ok((retries, false))
    }

    async fn join(&self, mut handle: JoinHandle<Result<()>>) -> (bool, Result<()>) {
        let limit = self.worst_case_shutdown_latency() + self.config.join_margin;

        match tokio::time::timeout(limit, &mut handle).await {
            Ok(Ok(result)) => (true, result),
            Ok(Err(e)) => (
                true,
                Err(OptoFtError::Transport(format!("Capture task failed: {}", e))),
            ),
            Err(_) => {
                error!("Capture task still running after {:?}; aborting it", limit);
                handle.abort();
                (false, Ok(()))
            }
        }
    }

    /// Latest valid sample, left in place
    pub fn latest(&self) -> Option<DecodedSample> {
        self.mailbox.latest()
    }

    /// Wait for the next valid sample, taking it from the mailbox
    pub async fn next_sample(&self) -> DecodedSample {
        self.mailbox.next().await
    }

    /// Receive every valid sample
    pub fn subscribe(&self) -> broadcast::Receiver<DecodedSample> {
        self.mailbox.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// True while the capture task is alive
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}
