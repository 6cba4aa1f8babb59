//! # Packet Decoder
//!
//! Turns a fixed-length frame body into raw fields after validating the
//! trailing CRC32, and decodes the two other things the device sends back:
//! calibration-register reports and ASCII status lines.
//!
//! Checksum and length faults are not errors here. A bad body yields a
//! [`DecodedPacket`] with `checksum_ok == false` and only the raw bytes, so
//! the capture loop can count it and move on.

use bytes::Buf;
use serde::Serialize;
use tracing::debug;

use super::crc::Crc;
use super::fields::{checksum_le, get_i12_be, get_i24_be, get_i24_le, get_u24_be, get_u24_le};
use super::protocol::*;
use super::sync::FrameHeader;
use crate::error::{OptoFtError, Result};

/// Positionally decoded payload fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RawSample {
    /// 24-bit signed differential readings
    pub differential: [i32; NUM_CHANNELS],
    /// 24-bit unsigned sum readings
    pub sum: [u32; NUM_CHANNELS],
    pub report_id: u8,
    /// Five little-endian Q-point fields
    pub imu: [i16; IMU_FIELD_COUNT],
    /// 12-bit signed temperature (current revision only)
    pub temperature: Option<i16>,
}

/// Result of decoding one body
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub raw_bytes: Vec<u8>,
    pub checksum_ok: bool,
    /// Present iff `checksum_ok`
    pub sample: Option<RawSample>,
}

impl DecodedPacket {
    fn invalid(body: &[u8]) -> Self {
        Self {
            raw_bytes: body.to_vec(),
            checksum_ok: false,
            sample: None,
        }
    }
}

/// Validates and decodes frame bodies for one protocol revision
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    revision: ProtocolRevision,
    crc32: Crc,
}

impl PacketDecoder {
    pub fn new(revision: ProtocolRevision, crc32: Crc) -> Self {
        Self { revision, crc32 }
    }

    pub fn revision(&self) -> ProtocolRevision {
        self.revision
    }

    /// Bytes to read after a valid header
    pub fn body_len(&self) -> usize {
        self.revision.body_len()
    }

    /// Decode one body
    ///
    /// # Arguments
    ///
    /// * `body` - Exactly [`body_len`](Self::body_len) bytes following the header
    ///
    /// # Returns
    ///
    /// * `DecodedPacket` - Raw fields if the length and CRC32 check out,
    ///   otherwise only the raw bytes
    pub fn decode(&self, body: &[u8]) -> DecodedPacket {
        if body.len() != self.body_len() {
            debug!(
                "Body length {} does not match expected {}",
                body.len(),
                self.body_len()
            );
            return DecodedPacket::invalid(body);
        }

        let (payload, trailer) = body.split_at(body.len() - CHECKSUM_LEN);
        let received = checksum_le(trailer);
        let calculated = self.crc32.compute(payload);

        if received != calculated {
            debug!(
                "Payload CRC mismatch: expected 0x{:08X}, got 0x{:08X}",
                calculated, received
            );
            return DecodedPacket::invalid(body);
        }

        DecodedPacket {
            raw_bytes: body.to_vec(),
            checksum_ok: true,
            sample: Some(decode_payload(payload, self.revision)),
        }
    }
}

/// Decode payload fields by position
///
/// The caller guarantees `payload.len() == revision.payload_len()`.
fn decode_payload(payload: &[u8], revision: ProtocolRevision) -> RawSample {
    let mut buf = payload;
    let mut sample = RawSample::default();

    for value in sample.differential.iter_mut() {
        *value = get_i24_be(&mut buf);
    }
    for value in sample.sum.iter_mut() {
        *value = get_u24_be(&mut buf);
    }

    sample.report_id = buf.get_u8();

    for value in sample.imu.iter_mut() {
        *value = buf.get_i16_le();
    }

    if revision.has_temperature() {
        sample.temperature = Some(get_i12_be(&mut buf));
    }

    sample
}

/// OFC/FSC calibration registers of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterReport {
    pub channel: Channel,
    /// Offset calibration (24-bit signed)
    pub ofc: i32,
    /// Full-scale calibration (24-bit unsigned)
    pub fsc: u32,
}

/// Decode a calibration-register report body
///
/// Body layout: channel number (1..=6), OFC (3 bytes LE signed), FSC
/// (3 bytes LE unsigned), CRC8 over the init byte, the counter and the
/// seven preceding body bytes.
///
/// # Errors
///
/// * `ChecksumMismatch` - CRC8 does not match
/// * `InvalidArgument` - Wrong length or channel number out of range
pub fn decode_register_report(
    header: &FrameHeader,
    body: &[u8],
    crc8: &Crc,
) -> Result<RegisterReport> {
    if body.len() != REGISTER_REPORT_LEN {
        return Err(OptoFtError::InvalidArgument(format!(
            "Register report must be {} bytes, got {}",
            REGISTER_REPORT_LEN,
            body.len()
        )));
    }

    let (fields, trailer) = body.split_at(REGISTER_REPORT_LEN - 1);
    let mut covered = Vec::with_capacity(2 + fields.len());
    covered.push(header.init);
    covered.push(header.counter);
    covered.extend_from_slice(fields);

    let expected = crc8.compute(&covered);
    let actual = u32::from(trailer[0]);
    if expected != actual {
        return Err(OptoFtError::ChecksumMismatch { expected, actual });
    }

    let mut buf = fields;
    let number = buf.get_u8();
    let channel = match number {
        1..=6 => Channel::new(usize::from(number - 1))?,
        _ => {
            return Err(OptoFtError::InvalidArgument(format!(
                "Register report for unknown channel {}",
                number
            )))
        }
    };

    Ok(RegisterReport {
        channel,
        ofc: get_i24_le(&mut buf),
        fsc: get_u24_le(&mut buf),
    })
}

/// Kind of status line, from its leading marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusKind {
    /// `+`
    Ok,
    /// `!`
    Error,
    /// `#` (calibration progress and register dumps)
    Info,
}

impl StatusKind {
    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            b'+' => Some(Self::Ok),
            b'!' => Some(Self::Error),
            b'#' => Some(Self::Info),
            _ => None,
        }
    }

    /// Ok and Error lines end a command exchange; Info lines may be followed
    /// by more output
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Info)
    }
}

/// One ASCII line from the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusLine {
    pub kind: StatusKind,
    /// Text after the marker, without the line ending
    pub text: String,
}

/// Parse a complete line (marker first, line ending optional)
///
/// # Examples
///
/// ```
/// use opto_ft::packet::decoder::{parse_status_line, StatusKind};
///
/// let line = parse_status_line(b"+ADC 3 gain 16\r\n").unwrap();
/// assert_eq!(line.kind, StatusKind::Ok);
/// assert_eq!(line.text, "ADC 3 gain 16");
/// ```
pub fn parse_status_line(line: &[u8]) -> Option<StatusLine> {
    let (&marker, rest) = line.split_first()?;
    let kind = StatusKind::from_marker(marker)?;

    let rest = rest.strip_suffix(b"\n").unwrap_or(rest);
    let rest = rest.strip_suffix(b"\r").unwrap_or(rest);

    Some(StatusLine {
        kind,
        text: String::from_utf8_lossy(rest).trim().to_string(),
    })
}

/// Longest line kept before the reader gives up on it
const MAX_LINE_LEN: usize = 256;

/// Incremental status-line assembler
///
/// Bytes before a marker are skipped (stale frame bytes, noise).
#[derive(Debug, Default)]
pub struct StatusLineReader {
    line: Vec<u8>,
    skipped: usize,
}

impl StatusLineReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns a line once its terminator arrives
    pub fn push(&mut self, byte: u8) -> Option<StatusLine> {
        if self.line.is_empty() {
            if StatusKind::from_marker(byte).is_some() {
                self.line.push(byte);
            } else {
                self.skipped += 1;
            }
            return None;
        }

        if byte == LINE_END {
            let line = parse_status_line(&self.line);
            self.line.clear();
            return line;
        }

        self.line.push(byte);
        if self.line.len() > MAX_LINE_LEN {
            self.skipped += self.line.len();
            self.line.clear();
        }
        None
    }

    /// Bytes discarded outside of any line
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}
