//! # Virtual Sensor
//!
//! In-process stand-in for the sensor firmware behind a [`SensorLink`].
//! It parses the commands the host writes, answers with frames, register
//! reports and status lines, and streams frames while started.
//!
//! Fault injection hooks (stop lag, corrupted frames, line noise, read
//! errors) let the controllers be exercised without hardware.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::port_trait::SensorLink;
use crate::packet::crc::CrcSet;
use crate::packet::decoder::RawSample;
use crate::packet::encoder::FrameEncoder;
use crate::packet::protocol::*;

/// Shared simulator state
#[derive(Debug)]
struct DeviceState {
    encoder: FrameEncoder,
    crcs: CrcSet,
    revision: ProtocolRevision,
    rx: VecDeque<u8>,
    sample: RawSample,
    registers: [(i32, u32); NUM_CHANNELS],
    streaming: bool,
    counter: u8,
    stop_lag: u32,
    corrupt_every: Option<u64>,
    noise_every: Option<u64>,
    frames_sent: u64,
    read_errors: usize,
    fail_reads_forever: bool,
    commands: Vec<Vec<u8>>,
    resets: usize,
}

impl DeviceState {
    fn queue_frame(&mut self) {
        self.frames_sent += 1;

        if let Some(n) = self.noise_every {
            if n > 0 && self.frames_sent % n == 0 {
                // A coincidental init byte followed by junk
                self.rx.extend([self.revision.init_byte(), 0x00, 0x00, 0x00]);
            }
        }

        let mut frame = self.encoder.encode_frame(self.counter, &self.sample);
        self.counter = self.counter.wrapping_add(1);

        if let Some(n) = self.corrupt_every {
            if n > 0 && self.frames_sent % n == 0 {
                let last = frame.len() - 1;
                frame[last] ^= 0xFF;
            }
        }
        self.rx.extend(frame);
    }

    fn queue_line(&mut self, marker: u8, text: &str) {
        self.rx.push_back(marker);
        self.rx.extend(text.bytes());
        self.rx.extend(b"\r\n");
    }

    fn handle_bytes(&mut self, data: &[u8]) {
        let command_len = if self.revision.has_command_params() { 4 } else { 1 };

        for command in data.chunks(command_len) {
            self.commands.push(command.to_vec());

            if command.len() != command_len {
                self.queue_line(b'!', "short command");
                continue;
            }
            if self.revision.has_command_params() {
                let crc = self.crcs.crc8.compute(&command[..3]) as u8;
                if crc != command[3] {
                    self.queue_line(b'!', "command checksum");
                    continue;
                }
            }

            let params = if command_len == 4 {
                [command[1], command[2]]
            } else {
                [0, 0]
            };
            self.execute(command[0], params);
        }
    }

    fn execute(&mut self, opcode: u8, params: [u8; 2]) {
        debug!("Virtual sensor command 0x{:02X} {:02X?}", opcode, params);
        match opcode {
            OP_START_STREAMING => self.streaming = true,
            OP_STOP_STREAMING => {
                if self.stop_lag > 0 {
                    self.stop_lag -= 1;
                } else {
                    self.streaming = false;
                }
            }
            OP_POLL => self.queue_frame(),
            OP_RESET => {
                self.streaming = false;
                self.queue_line(b'+', "reset");
            }
            OP_RESET_IMU => self.queue_line(b'+', "IMU reset"),
            OP_RESET_DAC => self.queue_line(b'+', "DAC reset"),
            0xF1..=0xF6 => {
                let n = opcode - OP_RESET;
                self.queue_line(b'+', &format!("ADC {} reset", n));
            }
            0xE1..=0xE6 => {
                let n = opcode - OP_DEACTIVATE_CHANNEL;
                self.queue_line(b'+', &format!("ADC {} deactivated", n));
            }
            0x21..=0x2F => match ImuMode::from_report_id(opcode & 0x0F) {
                Some(mode) => {
                    self.sample.report_id = mode.report_id();
                    let interval = u16::from_be_bytes(params);
                    self.queue_line(b'+', &format!("IMU {} every {} ms", mode, interval));
                }
                None => self.queue_line(b'!', "unknown IMU report"),
            },
            0x31..=0x36 => self.configure_adc(opcode - OP_CONFIGURE_ADC, params),
            0x41..=0x46 => {
                let n = opcode - OP_CONFIGURE_DAC;
                let current = u16::from_be_bytes(params);
                self.queue_line(b'+', &format!("DAC {} {} cA", n, current));
            }
            _ => self.queue_line(b'!', &format!("unknown opcode 0x{:02X}", opcode)),
        }
    }

    fn configure_adc(&mut self, number: u8, [subcode, value]: [u8; 2]) {
        let index = usize::from(number - 1);
        match subcode {
            0 => self.queue_line(b'+', &format!("ADC {} root 0x{:02X}", number, value)),
            1 => self.queue_line(b'+', &format!("ADC {} rate index {}", number, value)),
            2 => self.queue_line(b'+', &format!("ADC {} gain {}", number, 1u32 << value.min(6))),
            3 | 4 => self.queue_line(b'+', &format!("ADC {} mux {} {}", number, subcode, value)),
            5 => {
                self.queue_line(b'#', &format!("ADC {} self-calibration running", number));
                self.queue_line(b'+', &format!("ADC {} self-calibration done", number));
            }
            6 => {
                let (ofc, fsc) = self.registers[index];
                let channel = Channel::ALL[index];
                let counter = self.counter;
                self.counter = self.counter.wrapping_add(1);
                let frame = self.encoder.encode_register_report(counter, channel, ofc, fsc);
                self.rx.extend(frame);
            }
            _ => self.queue_line(b'!', &format!("ADC {} bad subcode {}", number, subcode)),
        }
    }
}

/// Simulated sensor
///
/// Cloning yields another handle to the same device, so a test can keep
/// one handle for inspection after moving the other into a controller.
#[derive(Debug, Clone)]
pub struct VirtualSensor {
    state: Arc<Mutex<DeviceState>>,
}

impl VirtualSensor {
    pub fn new(revision: ProtocolRevision) -> Self {
        let crcs = CrcSet::default();
        let sample = RawSample {
            differential: [200_000, -150_000, 50_000, 0, 10_000, -10_000],
            sum: [2048; NUM_CHANNELS],
            report_id: ImuMode::GameRotationVector.report_id(),
            imu: [0, 0, 0, 1 << 12, 0],
            temperature: revision.has_temperature().then_some(400),
        };

        Self {
            state: Arc::new(Mutex::new(DeviceState {
                encoder: FrameEncoder::new(revision, crcs.clone()),
                crcs,
                revision,
                rx: VecDeque::new(),
                sample,
                registers: [(0, 0x40_0000); NUM_CHANNELS],
                streaming: false,
                counter: 0,
                stop_lag: 0,
                corrupt_every: None,
                noise_every: None,
                frames_sent: 0,
                read_errors: 0,
                fail_reads_forever: false,
                commands: Vec::new(),
                resets: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sample template streamed in every frame
    pub fn set_sample(&self, sample: RawSample) {
        self.lock().sample = sample;
    }

    /// Registers reported for a channel
    pub fn set_registers(&self, channel: Channel, ofc: i32, fsc: u32) {
        self.lock().registers[channel.index()] = (ofc, fsc);
    }

    /// Ignore the next `count` stop commands
    pub fn set_stop_lag(&self, count: u32) {
        self.lock().stop_lag = count;
    }

    /// Break the CRC32 of every `n`th frame
    pub fn corrupt_every(&self, n: u64) {
        self.lock().corrupt_every = Some(n);
    }

    /// Prefix every `n`th frame with a false header
    pub fn noise_every(&self, n: u64) {
        self.lock().noise_every = Some(n);
    }

    /// Fail the next `count` reads
    pub fn fail_reads(&self, count: usize) {
        self.lock().read_errors = count;
    }

    /// Fail every read from now on (cable pulled)
    pub fn disconnect(&self) {
        self.lock().fail_reads_forever = true;
    }

    /// Raw bytes appended to the host's receive queue
    pub fn push_rx(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes.iter().copied());
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    pub fn frames_sent(&self) -> u64 {
        self.lock().frames_sent
    }

    /// Command byte groups received so far
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.lock().commands.clone()
    }

    pub fn resets(&self) -> usize {
        self.lock().resets
    }
}

/// Simulated time for a read that finds nothing
const IDLE_READ_DELAY: Duration = Duration::from_micros(200);

#[async_trait]
impl SensorLink for VirtualSensor {
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let n = {
            let mut state = self.lock();
            if state.fail_reads_forever {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "virtual sensor unplugged"));
            }
            if state.read_errors > 0 {
                state.read_errors -= 1;
                return Err(io::Error::new(io::ErrorKind::Other, "virtual sensor read error"));
            }
            if state.rx.is_empty() && state.streaming {
                state.queue_frame();
            }

            let n = buf.len().min(state.rx.len());
            for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                *slot = byte;
            }
            n
        };

        if n == 0 {
            tokio::time::sleep(timeout.min(IDLE_READ_DELAY)).await;
        } else {
            tokio::task::yield_now().await;
        }
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.lock().handle_bytes(data);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn purge_rx(&mut self) -> io::Result<()> {
        self.lock().rx.clear();
        Ok(())
    }

    async fn purge_tx(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn reset_device(&mut self) -> io::Result<()> {
        let mut state = self.lock();
        state.rx.clear();
        state.resets += 1;
        Ok(())
    }

    /// A streaming device always has another frame on the way
    async fn queued_bytes(&mut self) -> io::Result<usize> {
        let state = self.lock();
        if state.streaming {
            Ok(state.rx.len().max(1 + state.revision.header_len() + state.revision.body_len()))
        } else {
            Ok(state.rx.len())
        }
    }
}
