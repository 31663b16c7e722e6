//! Unsigned LEB128 varints and big-endian fixed-width integers
//!
//! Varints carry 7 bits per byte, least significant group first, with the
//! high bit set on every byte except the last. A u64 takes at most 10 bytes.

use std::io::Read;

use crate::storage::error::{StoreError, StoreResult};

/// Longest varint encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Number of bytes needed to encode `value` as a varint
pub const fn varint_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Append `value` as a varint
pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Read a varint from a byte slice, returning `(value, bytes_consumed)`
pub fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        let group = u64::from(byte & 0x7F);
        let shift = 7 * i as u32;
        if shift == 63 && group > 1 {
            return None;
        }
        value |= group << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Read a varint from a stream, returning `(value, bytes_consumed)`
pub fn read_varint_from<R: Read>(src: &mut R) -> StoreResult<(u64, usize)> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    for i in 0..MAX_VARINT_LEN {
        src.read_exact(&mut buf[i..=i])?;
        if buf[i] & 0x80 == 0 {
            return read_varint(&buf[..=i])
                .ok_or_else(|| StoreError::corrupt("varint overflows u64"));
        }
    }
    Err(StoreError::corrupt("varint longer than 10 bytes"))
}

/// Minimum number of bytes (1..=8) able to hold `value` big-endian
pub const fn min_width(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    if bits == 0 {
        1
    } else {
        (bits + 7) / 8
    }
}

/// Append the low `width` bytes of `value`, big-endian
pub fn write_be(out: &mut Vec<u8>, value: u64, width: usize) {
    debug_assert!((1..=8).contains(&width));
    debug_assert!(min_width(value) <= width);
    out.extend_from_slice(&value.to_be_bytes()[8 - width..]);
}

/// Decode a big-endian unsigned integer of `buf.len()` (1..=8) bytes
pub fn read_be(buf: &[u8]) -> u64 {
    buf.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}
