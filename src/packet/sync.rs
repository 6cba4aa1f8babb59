//! # Frame Synchronizer
//!
//! Scans the incoming byte stream for a valid frame header.
//!
//! ```text
//!   Scanning ──init byte──▶ HeaderFound ──checksum ok──▶ PayloadPending
//!      ▲                        │                              │
//!      └────checksum bad────────┘                              │
//!      └──────────────────────body consumed────────────────────┘
//! ```
//!
//! A header that fails its checksum means the init byte was coincidental
//! (payload bytes can take any value). The header bytes already read are
//! pushed back and rescanned, so scanning resumes at the byte right after
//! that init byte and a real frame starting inside the bad header is not
//! lost.
//!
//! Every single-byte read attempt consumes one unit of the byte budget,
//! including a read that timed out with no data.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use tracing::debug;

use super::crc::CrcSet;
use super::protocol::ProtocolRevision;
use crate::serial::port_trait::SensorLink;

/// Skipped bytes kept for diagnostics
const MAX_SKIPPED_CAPTURE: usize = 1024;

/// Header fields of a frame that passed its header checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub init: u8,
    /// Frame counter (4 bits on the legacy revision)
    pub counter: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Scanning,
    HeaderFound,
    PayloadPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Valid header; the body is next in the stream
    Found(FrameHeader),
    /// Byte budget exhausted
    NotFound { scanned: usize },
}

/// Byte-stream frame synchronizer
///
/// Owns a small look-ahead buffer, so the body must be read through
/// [`read_body`](Self::read_body) rather than directly from the link.
#[derive(Debug)]
pub struct FrameSynchronizer {
    revision: ProtocolRevision,
    crcs: CrcSet,
    read_timeout: Duration,
    state: SyncState,
    pending: VecDeque<u8>,
    capture_skipped: bool,
    skipped: Vec<u8>,
    skipped_total: u64,
}

impl FrameSynchronizer {
    pub fn new(revision: ProtocolRevision, crcs: CrcSet, read_timeout: Duration) -> Self {
        Self {
            revision,
            crcs,
            read_timeout,
            state: SyncState::Scanning,
            pending: VecDeque::with_capacity(4),
            capture_skipped: false,
            skipped: Vec::new(),
            skipped_total: 0,
        }
    }

    /// Keep (up to 1 KiB of) the bytes skipped while scanning
    pub fn with_skipped_capture(mut self, enabled: bool) -> Self {
        self.capture_skipped = enabled;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn revision(&self) -> ProtocolRevision {
        self.revision
    }

    /// Total bytes discarded while scanning
    pub fn skipped_total(&self) -> u64 {
        self.skipped_total
    }

    /// Drain the captured skipped bytes
    pub fn take_skipped(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.skipped)
    }

    /// Forget look-ahead bytes (after the host RX buffer was purged)
    pub fn reset(&mut self) {
        self.pending.clear();
        self.state = SyncState::Scanning;
    }

    /// Validate header bytes following `init`
    ///
    /// The header checksum always covers the init byte and the counter.
    pub fn check_header(&self, init: u8, header: &[u8]) -> Option<FrameHeader> {
        if init != self.revision.init_byte() || header.len() != self.revision.header_len() {
            return None;
        }

        match self.revision {
            ProtocolRevision::Current => {
                let (counter, crc) = (header[0], header[1]);
                (self.crcs.crc8.compute(&[init, counter]) == u32::from(crc))
                    .then_some(FrameHeader { init, counter })
            }
            ProtocolRevision::Legacy => {
                let counter = header[0] >> 4;
                let crc = header[0] & 0x0F;
                let message = (u64::from(init) << 4) | u64::from(counter);
                (self.crcs.crc4.compute_bits(message, 12) == u32::from(crc))
                    .then_some(FrameHeader { init, counter })
            }
        }
    }

    /// Scan for the next valid header
    ///
    /// # Arguments
    ///
    /// * `link` - Byte source
    /// * `byte_budget` - Maximum single-byte read attempts while scanning
    ///
    /// # Returns
    ///
    /// * `SyncOutcome::Found` - The body follows in the stream
    /// * `SyncOutcome::NotFound` - No valid header within the budget
    ///
    /// # Errors
    ///
    /// Propagates link I/O errors
    pub async fn synchronize<L: SensorLink + ?Sized>(
        &mut self,
        link: &mut L,
        byte_budget: usize,
    ) -> io::Result<SyncOutcome> {
        let init = self.revision.init_byte();
        let header_len = self.revision.header_len();
        let mut header = [0u8; 2];
        let mut attempts = 0usize;
        let mut skipped_here = 0usize;

        self.state = SyncState::Scanning;

        while attempts < byte_budget {
            attempts += 1;

            let Some(byte) = self.next_byte(link).await? else {
                continue;
            };
            if byte != init {
                self.note_skipped(byte);
                skipped_here += 1;
                continue;
            }

            self.state = SyncState::HeaderFound;
            let mut got = 0;
            while got < header_len {
                attempts += 1;
                match self.next_byte(link).await? {
                    Some(b) => {
                        header[got] = b;
                        got += 1;
                    }
                    None => break,
                }
            }

            if got == header_len {
                if let Some(found) = self.check_header(init, &header[..header_len]) {
                    if skipped_here > 0 {
                        debug!("Frame sync recovered after skipping {} bytes", skipped_here);
                    }
                    self.state = SyncState::PayloadPending;
                    return Ok(SyncOutcome::Found(found));
                }
            }

            // Coincidental init byte: rescan from the byte after it
            self.note_skipped(init);
            skipped_here += 1;
            for &b in header[..got].iter().rev() {
                self.pending.push_front(b);
            }
            self.state = SyncState::Scanning;
        }

        debug!("No frame header within {} read attempts", attempts);
        Ok(SyncOutcome::NotFound { scanned: attempts })
    }

    /// Read the body that follows a found header
    ///
    /// # Returns
    ///
    /// * `Some(body)` - Exactly `len` bytes
    /// * `None` - The link timed out before the body was complete
    ///
    /// # Errors
    ///
    /// Propagates link I/O errors
    pub async fn read_body<L: SensorLink + ?Sized>(
        &mut self,
        link: &mut L,
        len: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        let mut body = vec![0u8; len];
        let mut filled = 0;

        while filled < len {
            match self.pending.pop_front() {
                Some(b) => {
                    body[filled] = b;
                    filled += 1;
                }
                None => break,
            }
        }

        while filled < len {
            let n = link.read(&mut body[filled..], self.read_timeout).await?;
            if n == 0 {
                debug!("Body read timed out after {} of {} bytes", filled, len);
                self.state = SyncState::Scanning;
                return Ok(None);
            }
            filled += n;
        }

        self.state = SyncState::Scanning;
        Ok(Some(body))
    }

    async fn next_byte<L: SensorLink + ?Sized>(&mut self, link: &mut L) -> io::Result<Option<u8>> {
        if let Some(b) = self.pending.pop_front() {
            return Ok(Some(b));
        }

        let mut byte = [0u8; 1];
        let n = link.read(&mut byte, self.read_timeout).await?;
        Ok((n > 0).then_some(byte[0]))
    }

    fn note_skipped(&mut self, byte: u8) {
        self.skipped_total += 1;
        if self.capture_skipped && self.skipped.len() < MAX_SKIPPED_CAPTURE {
            self.skipped.push(byte);
        }
    }
}
