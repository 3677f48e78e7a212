// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Zig-zag varint encoding shared by the log watermark tables and the wire
//! protocol.
//!
//! Values are zig-zag mapped (0 → 0, -1 → 1, 1 → 2, ...) and then written
//! seven bits at a time, low bits first, with the high bit of each byte set
//! when more bytes follow. Every frame length on the wire uses the 32-bit
//! form, so the encoding has to stay bit-compatible with the other client
//! implementations.

use bytes::{Buf, BufMut};

use crate::error::{PersistenceError, Result};

/// Longest encoding of a 32-bit value.
pub const MAX_I32_LEN: usize = 5;
/// Longest encoding of a 64-bit value.
pub const MAX_I64_LEN: usize = 10;

#[inline]
fn zigzag32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

#[inline]
fn unzigzag32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

#[inline]
fn zigzag64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
fn unzigzag64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

fn put_raw(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            break;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Decode raw 7-bit groups from a slice without consuming it.
/// Returns `None` when the slice ends before the terminating byte. A value
/// wider than `bits` is malformed.
fn peek_raw(bytes: &[u8], max_len: usize, bits: u32) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i >= max_len {
            return Err(PersistenceError::InvalidFormat("varint too long".into()));
        }
        let group = (byte & 0x7F) as u64;
        let shift = 7 * i as u32;
        if bits - shift < 7 && group >> (bits - shift) != 0 {
            return Err(PersistenceError::InvalidFormat(format!("varint overflows {} bits", bits)));
        }
        value |= group << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if bytes.len() >= max_len {
        return Err(PersistenceError::InvalidFormat("varint too long".into()));
    }
    Ok(None)
}

pub fn write_zigzag_i32(buf: &mut impl BufMut, value: i32) {
    put_raw(buf, zigzag32(value) as u64);
}

pub fn write_zigzag_i64(buf: &mut impl BufMut, value: i64) {
    put_raw(buf, zigzag64(value));
}

/// Number of bytes `write_zigzag_i32` produces for `value`.
pub fn zigzag_i32_len(value: i32) -> usize {
    let mut raw = zigzag32(value);
    let mut len = 1;
    while raw >= 0x80 {
        raw >>= 7;
        len += 1;
    }
    len
}

/// Peek a 32-bit value at the front of `bytes`. `Ok(None)` means more input
/// is needed.
pub fn peek_zigzag_i32(bytes: &[u8]) -> Result<Option<(i32, usize)>> {
    Ok(peek_raw(bytes, MAX_I32_LEN, 32)?.map(|(raw, used)| (unzigzag32(raw as u32), used)))
}

pub fn peek_zigzag_i64(bytes: &[u8]) -> Result<Option<(i64, usize)>> {
    Ok(peek_raw(bytes, MAX_I64_LEN, 64)?.map(|(raw, used)| (unzigzag64(raw), used)))
}

pub fn read_zigzag_i32(buf: &mut impl Buf) -> Result<i32> {
    match peek_zigzag_i32(buf.chunk())? {
        Some((value, used)) => {
            buf.advance(used);
            Ok(value)
        }
        None => Err(PersistenceError::InvalidFormat("truncated varint".into())),
    }
}

pub fn read_zigzag_i64(buf: &mut impl Buf) -> Result<i64> {
    match peek_zigzag_i64(buf.chunk())? {
        Some((value, used)) => {
            buf.advance(used);
            Ok(value)
        }
        None => Err(PersistenceError::InvalidFormat("truncated varint".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_zigzag_mapping() {
        assert_eq!(zigzag32(0), 0);
        assert_eq!(zigzag32(-1), 1);
        assert_eq!(zigzag32(1), 2);
        assert_eq!(zigzag32(-2), 3);
        assert_eq!(zigzag32(i32::MAX), u32::MAX - 1);
        assert_eq!(zigzag32(i32::MIN), u32::MAX);
    }

    #[test]
    fn test_known_encodings() {
        // 64 zig-zags to 128, the first value needing two bytes.
        let mut buf = BytesMut::new();
        write_zigzag_i32(&mut buf, 64);
        assert_eq!(&buf[..], &[0x80, 0x01]);

        let mut buf = BytesMut::new();
        write_zigzag_i32(&mut buf, -1);
        assert_eq!(&buf[..], &[0x01]);
        assert_eq!(zigzag_i32_len(64), 2);
        assert_eq!(zigzag_i32_len(63), 1);
    }

    #[test]
    fn test_extremes_read_back() {
        let mut buf = BytesMut::new();
        for v in [0, 1, -1, 300, -300, i32::MAX, i32::MIN] {
            write_zigzag_i32(&mut buf, v);
        }
        write_zigzag_i64(&mut buf, i64::MIN);
        let mut cursor = buf.freeze();
        for v in [0, 1, -1, 300, -300, i32::MAX, i32::MIN] {
            assert_eq!(read_zigzag_i32(&mut cursor).unwrap(), v);
        }
        assert_eq!(read_zigzag_i64(&mut cursor).unwrap(), i64::MIN);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_peek_needs_more_input() {
        assert!(peek_zigzag_i32(&[0x80]).unwrap().is_none());
        assert!(peek_zigzag_i32(&[]).unwrap().is_none());
        assert!(peek_zigzag_i32(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }

    #[test]
    fn test_wide_varint_is_rejected() {
        // u32::MAX fits in five bytes; one more bit in the last group does not.
        assert_eq!(peek_zigzag_i32(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]).unwrap(), Some((i32::MIN, 5)));
        assert!(peek_zigzag_i32(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]).is_err());
        assert!(peek_zigzag_i32(&[0x80, 0x80, 0x80, 0x80, 0x70]).is_err());

        let mut max = vec![0xFF; 9];
        max.push(0x01);
        assert_eq!(peek_zigzag_i64(&max).unwrap(), Some((i64::MIN, 10)));
        *max.last_mut().unwrap() = 0x02;
        assert!(peek_zigzag_i64(&max).is_err());
    }
}
