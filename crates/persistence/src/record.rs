// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Log record framing.
//!
//! # File Format
//! ```text
//! [RecordHeader: 24 bytes][body: total_size - 24 bytes] ...
//! body = [payload][input table][trim table][tables_len: u32]
//! ```
//!
//! Header (little-endian):
//! - committer_id: u32
//! - total_size: u32 (header + body)
//! - check_bytes: u64 (XOR of the body's 8-byte words)
//! - write_seq_id: u64
//!
//! Each watermark table is `count: u32`, then per entry
//! `{key_len: zigzag varint, key: utf8, a: u64, b: u64}`. The trailing
//! `tables_len` is the byte length of both tables and locates where the
//! payload ends.

use crate::error::{PersistenceError, Result};
use crate::varint;
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;
use std::io::Read;

pub const HEADER_SIZE: usize = 24;
const TABLES_LEN_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub committer_id: u32,
    pub total_size: u32,
    pub check_bytes: u64,
    pub write_seq_id: u64,
}

impl RecordHeader {
    pub const SIZE: usize = HEADER_SIZE;

    /// Header for an encoded body (see [`encode_body`]).
    pub fn new(committer_id: u32, body: &[u8], write_seq_id: u64) -> Self {
        Self {
            committer_id,
            total_size: (HEADER_SIZE + body.len()) as u32,
            check_bytes: check_bytes(body),
            write_seq_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.committer_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.total_size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.check_bytes.to_le_bytes());
        buf[16..24].copy_from_slice(&self.write_seq_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let mut cursor = &buf[..];
        Self {
            committer_id: cursor.get_u32_le(),
            total_size: cursor.get_u32_le(),
            check_bytes: cursor.get_u64_le(),
            write_seq_id: cursor.get_u64_le(),
        }
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        reader.read_exact(&mut buf)?;
        Ok(Self::from_bytes(&buf))
    }

    pub fn body_len(&self) -> Result<usize> {
        let size = self.total_size as usize;
        if size < HEADER_SIZE + TABLES_LEN_SIZE {
            return Err(PersistenceError::InvalidFormat(format!("record size {} below header size", size)));
        }
        Ok(size - HEADER_SIZE)
    }
}

/// Running XOR over the body's 8-byte little-endian words. A trailing
/// partial word is zero-padded.
///
/// This is a throughput checksum. It catches truncation and most single
/// corruptions but not an even number of flips in the same bit lane.
pub fn check_bytes(payload: &[u8]) -> u64 {
    let mut chunks = payload.chunks_exact(8);
    let mut acc = 0u64;
    for word in &mut chunks {
        acc ^= u64::from_le_bytes([word[0], word[1], word[2], word[3], word[4], word[5], word[6], word[7]]);
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        let mut last = [0u8; 8];
        last[..rest.len()].copy_from_slice(rest);
        acc ^= u64::from_le_bytes(last);
    }
    acc
}

/// A (sequence, replayable sequence) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    pub seq: i64,
    pub replayable_seq: i64,
}

impl Watermark {
    pub const fn new(seq: i64, replayable_seq: i64) -> Self {
        Self { seq, replayable_seq }
    }

    /// Component-wise maximum. Watermarks only move forward.
    pub fn merge(self, other: Watermark) -> Watermark {
        Watermark {
            seq: self.seq.max(other.seq),
            replayable_seq: self.replayable_seq.max(other.replayable_seq),
        }
    }
}

/// Per-record watermarks: the last input processed from each source and the
/// trim point acknowledged for each destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatermarkTables {
    pub inputs: BTreeMap<String, Watermark>,
    pub trims: BTreeMap<String, Watermark>,
}

impl WatermarkTables {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.trims.is_empty()
    }

    pub fn clear(&mut self) {
        self.inputs.clear();
        self.trims.clear();
    }

    pub fn encoded_len(&self) -> usize {
        table_len(&self.inputs) + table_len(&self.trims)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        encode_table(&self.inputs, buf);
        encode_table(&self.trims, buf);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out
    }

    /// Decode both tables, which must fill `bytes` exactly.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let inputs = read_table(&mut bytes)?;
        let trims = read_table(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(PersistenceError::InvalidFormat(format!(
                "{} stray bytes after watermark tables",
                bytes.len()
            )));
        }
        Ok(Self { inputs, trims })
    }
}

fn table_len(table: &BTreeMap<String, Watermark>) -> usize {
    4 + table
        .keys()
        .map(|k| varint::zigzag_i32_len(k.len() as i32) + k.len() + 16)
        .sum::<usize>()
}

fn encode_table(table: &BTreeMap<String, Watermark>, buf: &mut impl BufMut) {
    buf.put_u32_le(table.len() as u32);
    for (key, mark) in table {
        varint::write_zigzag_i32(buf, key.len() as i32);
        buf.put_slice(key.as_bytes());
        buf.put_u64_le(mark.seq as u64);
        buf.put_u64_le(mark.replayable_seq as u64);
    }
}

fn short(what: &str, need: usize, have: usize) -> PersistenceError {
    PersistenceError::InvalidFormat(format!("{} needs {} bytes, {} left", what, need, have))
}

fn read_table(buf: &mut &[u8]) -> Result<BTreeMap<String, Watermark>> {
    if buf.remaining() < 4 {
        return Err(short("table count", 4, buf.remaining()));
    }
    let count = buf.get_u32_le() as usize;
    // Every entry takes at least a one-byte key length and two words.
    if count > buf.remaining() / 17 {
        return Err(short("watermark table", count.saturating_mul(17), buf.remaining()));
    }
    let mut table = BTreeMap::new();
    for _ in 0..count {
        let key_len = varint::read_zigzag_i32(buf)?;
        let key_len = usize::try_from(key_len)
            .map_err(|_| PersistenceError::InvalidFormat(format!("negative key length {}", key_len)))?;
        if buf.remaining() < key_len + 16 {
            return Err(short("watermark entry", key_len + 16, buf.remaining()));
        }
        let key = std::str::from_utf8(&buf[..key_len])
            .map_err(|e| PersistenceError::InvalidFormat(format!("watermark key: {}", e)))?
            .to_string();
        buf.advance(key_len);
        let seq = buf.get_u64_le() as i64;
        let replayable_seq = buf.get_u64_le() as i64;
        table.insert(key, Watermark { seq, replayable_seq });
    }
    Ok(table)
}

/// Record body: the payload with both watermark tables and their length
/// appended. The header's size and check bytes cover all of it.
pub fn encode_body(payload: &[u8], tables: &WatermarkTables) -> Vec<u8> {
    let tables_len = tables.encoded_len();
    let mut body = Vec::with_capacity(payload.len() + tables_len + TABLES_LEN_SIZE);
    body.extend_from_slice(payload);
    tables.encode(&mut body);
    body.put_u32_le(tables_len as u32);
    body
}

/// Split a body back into payload and tables.
pub fn split_body(body: &[u8]) -> Result<(&[u8], WatermarkTables)> {
    let Some(rest) = body.len().checked_sub(TABLES_LEN_SIZE) else {
        return Err(short("tables length", TABLES_LEN_SIZE, body.len()));
    };
    let mut tail = &body[rest..];
    let tables_len = tail.get_u32_le() as usize;
    if tables_len > rest {
        return Err(short("watermark tables", tables_len, rest));
    }
    let (payload, tables) = body[..rest].split_at(rest - tables_len);
    Ok((payload, WatermarkTables::decode(tables)?))
}

/// Encode a complete record (header and body) into one buffer.
pub fn encode_record(committer_id: u32, write_seq_id: u64, payload: &[u8], tables: &WatermarkTables) -> Vec<u8> {
    let body = encode_body(payload, tables);
    let header = RecordHeader::new(committer_id, &body, write_seq_id);
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_bytes_pads_partial_word() {
        assert_eq!(check_bytes(&[]), 0);
        assert_eq!(check_bytes(&[1]), 1);
        let mut words = Vec::new();
        words.extend_from_slice(&7u64.to_le_bytes());
        words.extend_from_slice(&5u64.to_le_bytes());
        assert_eq!(check_bytes(&words), 7 ^ 5);
        words.push(0xFF);
        assert_eq!(check_bytes(&words), 7 ^ 5 ^ 0xFF);
    }

    #[test]
    fn test_check_bytes_detects_single_byte_flip() {
        let payload: Vec<u8> = (0..100u8).collect();
        let good = check_bytes(&payload);
        for i in 0..payload.len() {
            let mut bad = payload.clone();
            bad[i] ^= 0x10;
            assert_ne!(check_bytes(&bad), good, "flip at {} went unnoticed", i);
        }
    }

    #[test]
    fn test_header_covers_payload_and_tables() {
        let mut tables = WatermarkTables::default();
        tables.inputs.insert("client".into(), Watermark::new(2, 2));
        let body = encode_body(&[0u8; 100], &tables);
        assert_eq!(body.len(), 100 + tables.encoded_len() + 4);

        let header = RecordHeader::new(9, &body, 42);
        assert_eq!(header.total_size as usize, 24 + 100 + tables.encoded_len() + 4);
        assert_eq!(header.check_bytes, check_bytes(&body));
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &9u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &header.total_size.to_le_bytes());
        assert_eq!(&bytes[16..24], &42u64.to_le_bytes());
        assert_eq!(RecordHeader::read_from(&bytes[..]).unwrap(), header);
        assert_eq!(header.body_len().unwrap(), body.len());

        let (payload, decoded) = split_body(&body).unwrap();
        assert_eq!(payload, &[0u8; 100][..]);
        assert_eq!(decoded, tables);
    }

    #[test]
    fn test_merge_is_componentwise() {
        let mut entry = Watermark::new(5, 2);
        let slot = &mut entry;
        *slot = slot.merge(Watermark::new(3, 4));
        assert_eq!(entry, Watermark::new(5, 4));
    }

    #[test]
    fn test_tables_read_back() {
        let mut tables = WatermarkTables::default();
        tables.inputs.insert("client".into(), Watermark::new(12, 10));
        tables.trims.insert("server".into(), Watermark::new(3, 3));
        tables.trims.insert("other".into(), Watermark::new(-1, 0));

        let bytes = tables.to_vec();
        assert_eq!(bytes.len(), tables.encoded_len());
        assert_eq!(WatermarkTables::decode(&bytes).unwrap(), tables);
        assert!(WatermarkTables::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_huge_lengths_are_rejected_without_allocating() {
        // A count of u32::MAX with almost nothing behind it.
        let mut bytes = u32::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 20]);
        assert!(matches!(WatermarkTables::decode(&bytes), Err(PersistenceError::InvalidFormat(_))));

        // One entry whose key claims i32::MAX bytes.
        let mut bytes = 1u32.to_le_bytes().to_vec();
        varint::write_zigzag_i32(&mut bytes, i32::MAX);
        bytes.extend_from_slice(&[0u8; 16]);
        assert!(matches!(WatermarkTables::decode(&bytes), Err(PersistenceError::InvalidFormat(_))));

        // A tables length larger than the body.
        let mut body = encode_body(b"abc", &WatermarkTables::default());
        let n = body.len();
        body[n - 4..].copy_from_slice(&1000u32.to_le_bytes());
        assert!(split_body(&body).is_err());
        assert!(split_body(&[1, 2]).is_err());
    }
}
