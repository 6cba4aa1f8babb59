//! # Byte Field Helpers
//!
//! The byte-order conversions used by both the decoder and the encoder.
//! ADC fields are big-endian, IMU fields and checksums little-endian.
//!
//! Readers take a [`bytes::Buf`] and advance it; callers check the length
//! first (the `Buf` getters panic on short input).

use bytes::{Buf, BufMut};

/// Mask for a 24-bit field
const U24_MASK: u32 = 0x00FF_FFFF;

/// Sign-extend the low `bits` bits of `value`
///
/// # Examples
///
/// ```
/// use opto_ft::packet::fields::sign_extend;
///
/// assert_eq!(sign_extend(0xFFF, 12), -1);
/// assert_eq!(sign_extend(0x7FF, 12), 2047);
/// assert_eq!(sign_extend(0x80_0000, 24), -8_388_608);
/// ```
pub fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits.clamp(1, 32);
    ((value << shift) as i32) >> shift
}

/// Read a 3-byte big-endian two's-complement integer
pub fn get_i24_be<B: Buf>(buf: &mut B) -> i32 {
    sign_extend(buf.get_uint(3) as u32, 24)
}

/// Read a 3-byte big-endian unsigned integer
pub fn get_u24_be<B: Buf>(buf: &mut B) -> u32 {
    buf.get_uint(3) as u32
}

/// Read a 3-byte little-endian two's-complement integer
pub fn get_i24_le<B: Buf>(buf: &mut B) -> i32 {
    sign_extend(buf.get_uint_le(3) as u32, 24)
}

/// Read a 3-byte little-endian unsigned integer
pub fn get_u24_le<B: Buf>(buf: &mut B) -> u32 {
    buf.get_uint_le(3) as u32
}

/// Read a 2-byte big-endian field holding a 12-bit two's-complement value
pub fn get_i12_be<B: Buf>(buf: &mut B) -> i16 {
    sign_extend(u32::from(buf.get_u16()) & 0x0FFF, 12) as i16
}

/// Assemble a checksum transmitted least-significant byte first
///
/// The CRC engine produces its result in natural (MSB-first) order; the
/// device sends it reversed, so the wire bytes are read back here with the
/// first byte as the lowest.
pub fn checksum_le(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc | (u32::from(b) << (8 * i)))
}

pub fn put_i24_be<B: BufMut>(buf: &mut B, value: i32) {
    buf.put_uint(u64::from(value as u32 & U24_MASK), 3);
}

pub fn put_u24_be<B: BufMut>(buf: &mut B, value: u32) {
    buf.put_uint(u64::from(value & U24_MASK), 3);
}

pub fn put_i24_le<B: BufMut>(buf: &mut B, value: i32) {
    buf.put_uint_le(u64::from(value as u32 & U24_MASK), 3);
}

pub fn put_u24_le<B: BufMut>(buf: &mut B, value: u32) {
    buf.put_uint_le(u64::from(value & U24_MASK), 3);
}

/// Write a 12-bit two's-complement value into a 2-byte big-endian field
pub fn put_i12_be<B: BufMut>(buf: &mut B, value: i16) {
    buf.put_u16(value as u16 & 0x0FFF);
}

/// Write a checksum least-significant byte first
pub fn put_checksum_le<B: BufMut>(buf: &mut B, checksum: u32) {
    buf.put_u32_le(checksum);
}
