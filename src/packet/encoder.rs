//! # Command and Frame Encoder
//!
//! Serializes host commands with the trailer the protocol revision expects,
//! and builds device-side frames. The frame builders are what the virtual
//! sensor streams, and they keep the decoder tests honest about byte layout.

use bytes::BufMut;

use super::crc::CrcSet;
use super::decoder::RawSample;
use super::fields::{put_checksum_le, put_i12_be, put_i24_be, put_i24_le, put_u24_be, put_u24_le};
use super::protocol::*;

/// Encodes host to device commands
#[derive(Debug, Clone)]
pub struct CommandEncoder {
    revision: ProtocolRevision,
    trailer: CommandTrailer,
    crcs: CrcSet,
}

impl CommandEncoder {
    /// Encoder using the revision's default trailer
    pub fn new(revision: ProtocolRevision, crcs: CrcSet) -> Self {
        Self {
            revision,
            trailer: revision.command_trailer(),
            crcs,
        }
    }

    /// Override the trailer (some firmware builds accept CRC4)
    pub fn with_trailer(mut self, trailer: CommandTrailer) -> Self {
        self.trailer = trailer;
        self
    }

    pub fn trailer(&self) -> CommandTrailer {
        self.trailer
    }

    /// Encode a command
    ///
    /// # Arguments
    ///
    /// * `command` - Command to serialize
    ///
    /// # Returns
    ///
    /// * `Vec<u8>` - `opcode, p1, p2` (current revision) or `opcode`
    ///   (legacy), followed by the trailer byte if any
    ///
    /// # Examples
    ///
    /// ```
    /// use opto_ft::packet::crc::CrcSet;
    /// use opto_ft::packet::encoder::CommandEncoder;
    /// use opto_ft::packet::protocol::{Command, ProtocolRevision};
    ///
    /// let encoder = CommandEncoder::new(ProtocolRevision::Current, CrcSet::default());
    /// assert_eq!(encoder.encode(&Command::Poll), vec![0x12, 0x00, 0x00, 0x74]);
    /// ```
    pub fn encode(&self, command: &Command) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4);
        bytes.push(command.opcode());
        if self.revision.has_command_params() {
            bytes.extend_from_slice(&command.params());
        }

        match self.trailer {
            CommandTrailer::None => {}
            CommandTrailer::Crc4 => bytes.push(self.crcs.crc4.compute(&bytes) as u8 & 0x0F),
            CommandTrailer::Crc8 => bytes.push(self.crcs.crc8.compute(&bytes) as u8),
        }

        bytes
    }
}

/// Builds frames the way the sensor firmware does
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    revision: ProtocolRevision,
    crcs: CrcSet,
}

impl FrameEncoder {
    pub fn new(revision: ProtocolRevision, crcs: CrcSet) -> Self {
        Self { revision, crcs }
    }

    pub fn revision(&self) -> ProtocolRevision {
        self.revision
    }

    /// Init byte plus header bytes for `counter`
    ///
    /// Legacy headers keep only the low 4 bits of the counter.
    pub fn encode_header(&self, counter: u8) -> Vec<u8> {
        let init = self.revision.init_byte();
        match self.revision {
            ProtocolRevision::Current => {
                let crc = self.crcs.crc8.compute(&[init, counter]) as u8;
                vec![init, counter, crc]
            }
            ProtocolRevision::Legacy => {
                let counter = counter & 0x0F;
                let message = (u64::from(init) << 4) | u64::from(counter);
                let crc = self.crcs.crc4.compute_bits(message, 12) as u8;
                vec![init, (counter << 4) | crc]
            }
        }
    }

    /// Payload without the trailing checksum
    pub fn encode_payload(&self, sample: &RawSample) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.revision.payload_len());

        for &value in &sample.differential {
            put_i24_be(&mut payload, value);
        }
        for &value in &sample.sum {
            put_u24_be(&mut payload, value);
        }
        payload.put_u8(sample.report_id);
        for &value in &sample.imu {
            payload.put_i16_le(value);
        }
        if self.revision.has_temperature() {
            put_i12_be(&mut payload, sample.temperature.unwrap_or(0));
        }

        payload
    }

    /// Payload followed by its CRC32, least-significant byte first
    pub fn encode_body(&self, sample: &RawSample) -> Vec<u8> {
        let mut body = self.encode_payload(sample);
        let crc = self.crcs.crc32.compute(&body);
        put_checksum_le(&mut body, crc);
        body
    }

    /// Complete frame: init byte, header, body
    pub fn encode_frame(&self, counter: u8, sample: &RawSample) -> Vec<u8> {
        let mut frame = self.encode_header(counter);
        frame.extend_from_slice(&self.encode_body(sample));
        frame
    }

    /// Calibration-register report frame
    pub fn encode_register_report(&self, counter: u8, channel: Channel, ofc: i32, fsc: u32) -> Vec<u8> {
        let mut frame = self.encode_header(counter);
        let mut covered = vec![self.revision.init_byte(), frame[1]];

        let mut body = Vec::with_capacity(REGISTER_REPORT_LEN);
        body.put_u8(channel.number());
        put_i24_le(&mut body, ofc);
        put_u24_le(&mut body, fsc);

        covered.extend_from_slice(&body);
        body.put_u8(self.crcs.crc8.compute(&covered) as u8);

        frame.extend_from_slice(&body);
        frame
    }
}
