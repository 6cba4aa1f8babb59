//! # Generic n-bit CRC Engine
//!
//! One engine serves every checksum the sensor protocol uses:
//!
//! | Name    | Width | Polynomial   | Init       | Reflected | XorOut     |
//! |---------|-------|--------------|------------|-----------|------------|
//! | `CRC4`  | 4     | 0x2          | 0x0        | no        | 0x0        |
//! | `CRC8`  | 8     | 0x07         | 0x00       | no        | 0x00       |
//! | `CRC32` | 32    | 0x04C11DB7   | 0xFFFFFFFF | yes       | 0xFFFFFFFF |
//!
//! Polynomials are written without the implicit top bit. The register is
//! always shifted MSB-first; reflected variants bit-reverse every input byte
//! and the final register instead of using a mirrored table, so the bitwise
//! and table-driven paths share one definition.
//!
//! Sub-byte widths run the table path in an 8-bit register with the
//! polynomial left-aligned, and [`compute_bits`] divides messages that are
//! not a whole number of bytes (the legacy header checksums 12 bits).
//!
//! The legacy firmware describes its CRC4 generator as the bit string
//! `1001` aligned to the most significant bit of the message, with four
//! zero bits appended and the division stopped once the value fits in four
//! bits. That is x⁴+x in conventional form, hence `0x2` above.

use std::fmt;
use std::sync::Arc;

use crate::error::{OptoFtError, Result};

/// Byte-wise remainder table used by the fast path
pub type CrcTable = [u32; 256];

/// Parameters of one CRC algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcSpec {
    /// Checksum width in bits (1..=32)
    pub width: u32,
    /// Generator polynomial without the top bit
    pub poly: u32,
    /// Initial register value
    pub init: u32,
    /// Bit-reverse input bytes and the final register
    pub reflect: bool,
    /// Value XOR-ed into the final register
    pub xor_out: u32,
}

impl CrcSpec {
    /// 4-bit checksum packed into the low nibble of the legacy header byte
    pub const CRC4: CrcSpec = CrcSpec::plain(4, 0x2);

    /// 8-bit checksum for frame headers and command trailers
    pub const CRC8: CrcSpec = CrcSpec::plain(8, 0x07);

    /// 32-bit payload checksum (the common CRC-32, check value 0xCBF43926)
    pub const CRC32: CrcSpec = CrcSpec {
        width: 32,
        poly: 0x04C1_1DB7,
        init: 0xFFFF_FFFF,
        reflect: true,
        xor_out: 0xFFFF_FFFF,
    };

    const fn plain(width: u32, poly: u32) -> Self {
        Self {
            width,
            poly,
            init: 0,
            reflect: false,
            xor_out: 0,
        }
    }

    /// Create a non-reflected spec with zero init and zero xor-out
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `width` is not in 1..=32
    pub fn custom(width: u32, poly: u32) -> Result<Self> {
        if width == 0 || width > 32 {
            return Err(OptoFtError::InvalidArgument(format!(
                "CRC width {} out of range 1..=32",
                width
            )));
        }
        Ok(Self::plain(width, poly & width_mask(width)))
    }

    /// Same spec with a different initial register value
    #[must_use]
    pub const fn with_init(mut self, init: u32) -> Self {
        self.init = init;
        self
    }

    /// Same spec with input/output reflection switched on or off
    #[must_use]
    pub const fn with_reflect(mut self, reflect: bool) -> Self {
        self.reflect = reflect;
        self
    }

    /// Same spec with a different final XOR value
    #[must_use]
    pub const fn with_xor_out(mut self, xor_out: u32) -> Self {
        self.xor_out = xor_out;
        self
    }

    /// Mask covering `width` bits
    pub const fn mask(&self) -> u32 {
        width_mask(self.width)
    }

    /// Width of the register the table path runs in (at least one byte)
    const fn register_width(&self) -> u32 {
        if self.width < 8 {
            8
        } else {
            self.width
        }
    }

    fn finalize(&self, register: u32) -> u32 {
        let crc = if self.reflect {
            register.reverse_bits() >> (32 - self.width)
        } else {
            register
        };
        (crc ^ self.xor_out) & self.mask()
    }
}

const fn width_mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    }
}

/// Build the byte-wise remainder table for `spec`
///
/// Each candidate byte is placed at the top of the register and shifted
/// eight times, XOR-ing in the polynomial whenever the top bit falls out.
pub const fn build_table(spec: &CrcSpec) -> CrcTable {
    let reg_width = spec.register_width();
    let pad = reg_width - spec.width;
    let mask = width_mask(reg_width);
    let poly = (spec.poly << pad) & mask;
    let top = 1u32 << (reg_width - 1);

    let mut table = [0u32; 256];
    let mut i = 0;

    while i < 256 {
        let mut reg = ((i as u32) << (reg_width - 8)) & mask;
        let mut j = 0;

        while j < 8 {
            if (reg & top) != 0 {
                reg = ((reg << 1) ^ poly) & mask;
            } else {
                reg = (reg << 1) & mask;
            }
            j += 1;
        }

        table[i] = reg;
        i += 1;
    }

    table
}

/// Calculate a checksum, through the table when one is given
///
/// # Arguments
///
/// * `data` - Bytes to checksum
/// * `spec` - Algorithm parameters
/// * `table` - Table built by [`build_table`] for the same `spec`, or `None`
///   for bitwise polynomial division
///
/// # Examples
///
/// ```
/// use opto_ft::packet::crc::{compute, CrcSpec};
///
/// assert_eq!(compute(b"123456789", &CrcSpec::CRC32, None), 0xCBF4_3926);
/// ```
pub fn compute(data: &[u8], spec: &CrcSpec, table: Option<&CrcTable>) -> u32 {
    match table {
        Some(table) => compute_table(data, spec, table),
        None => compute_bitwise(data, spec),
    }
}

/// Check `data` against a received checksum
pub fn verify(data: &[u8], checksum: u32, spec: &CrcSpec) -> bool {
    compute_bitwise(data, spec) == (checksum & spec.mask())
}

/// Checksum of a message that is `bit_len` bits long (MSB first)
///
/// The message is the low `bit_len` bits of `value`. Reflection does not
/// apply to bit-level messages.
pub fn compute_bits(value: u64, bit_len: u32, spec: &CrcSpec) -> u32 {
    let mask = spec.mask();
    let top = 1u32 << (spec.width - 1);
    let mut crc = spec.init & mask;

    for shift in (0..bit_len.min(64)).rev() {
        let bit_in = (value >> shift) & 1 == 1;
        crc = shift_in(crc, bit_in, top, mask, spec.poly);
    }

    (crc ^ spec.xor_out) & mask
}

#[inline]
fn shift_in(crc: u32, bit_in: bool, top: u32, mask: u32, poly: u32) -> u32 {
    let msb = (crc & top) != 0;
    let shifted = (crc << 1) & mask;
    if msb != bit_in {
        shifted ^ poly
    } else {
        shifted
    }
}

fn compute_bitwise(data: &[u8], spec: &CrcSpec) -> u32 {
    let mask = spec.mask();
    let top = 1u32 << (spec.width - 1);
    let poly = spec.poly & mask;
    let mut crc = spec.init & mask;

    for &byte in data {
        let byte = if spec.reflect { byte.reverse_bits() } else { byte };

        for shift in (0..8).rev() {
            crc = shift_in(crc, (byte >> shift) & 1 == 1, top, mask, poly);
        }
    }

    spec.finalize(crc)
}

fn compute_table(data: &[u8], spec: &CrcSpec, table: &CrcTable) -> u32 {
    let reg_width = spec.register_width();
    let pad = reg_width - spec.width;
    let mask = width_mask(reg_width);
    let mut reg = (spec.init << pad) & mask;

    for &byte in data {
        let byte = if spec.reflect { byte.reverse_bits() } else { byte };
        let index = ((reg >> (reg_width - 8)) ^ byte as u32) & 0xFF;
        reg = ((reg << 8) & mask) ^ table[index as usize];
    }

    spec.finalize(reg >> pad)
}

/// A CRC algorithm bound to an optional lookup table
///
/// Cloning shares the table.
#[derive(Clone)]
pub struct Crc {
    spec: CrcSpec,
    table: Option<Arc<CrcTable>>,
}

impl fmt::Debug for Crc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crc")
            .field("spec", &self.spec)
            .field("table", &self.table.is_some())
            .finish()
    }
}

impl Crc {
    /// Table-driven engine
    pub fn new(spec: CrcSpec) -> Self {
        Self {
            spec,
            table: Some(Arc::new(build_table(&spec))),
        }
    }

    /// Bitwise engine (no table)
    pub fn bitwise(spec: CrcSpec) -> Self {
        Self { spec, table: None }
    }

    pub fn spec(&self) -> &CrcSpec {
        &self.spec
    }

    pub fn compute(&self, data: &[u8]) -> u32 {
        compute(data, &self.spec, self.table.as_deref())
    }

    pub fn compute_bits(&self, value: u64, bit_len: u32) -> u32 {
        compute_bits(value, bit_len, &self.spec)
    }

    pub fn verify(&self, data: &[u8], checksum: u32) -> bool {
        self.compute(data) == (checksum & self.spec.mask())
    }
}

/// The three engines the protocol needs, shared by the command path and the
/// capture loop
#[derive(Debug, Clone)]
pub struct CrcSet {
    pub crc4: Crc,
    pub crc8: Crc,
    pub crc32: Crc,
}

impl Default for CrcSet {
    fn default() -> Self {
        Self {
            crc4: Crc::new(CrcSpec::CRC4),
            crc8: Crc::new(CrcSpec::CRC8),
            crc32: Crc::new(CrcSpec::CRC32),
        }
    }
}
