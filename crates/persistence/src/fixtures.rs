// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::error::Result;
use crate::log_writer::LogWriter;
use crate::naming::LogLayout;
use crate::record::{RecordHeader, Watermark, WatermarkTables};

use std::fs;
use std::path::{Path, PathBuf};

pub const FIXTURE_SERVICE: &str = "fixture";
pub const FIXTURE_COMMITTER: u32 = 0x00C0_FFEE;
pub const FIXTURE_SOURCE: &str = "client";

/// Where the generator left damage, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Damage {
    None,
    /// Flip a payload byte of the given (1-based) record.
    CorruptRecord(u64),
    /// Cut the file in the middle of the last record.
    TruncateTail,
}

pub struct LogFixture {
    pub layout: LogLayout,
    pub log: PathBuf,
    /// Byte offset of every record written, in order.
    pub offsets: Vec<u64>,
}

/// Payload of the n-th fixture record.
pub fn fixture_payload(n: u64) -> Vec<u8> {
    format!("rpc-call-{:04}", n).into_bytes()
}

/// Write `count` records into `<dir>/fixture_0/fixture_log1`. Record `n`
/// carries write sequence id `n` and an input watermark of `(n, n)` for
/// [`FIXTURE_SOURCE`].
pub fn generate_log(dir: &Path, count: u64, damage: Damage) -> Result<LogFixture> {
    let layout = LogLayout::new(dir, FIXTURE_SERVICE, 0);
    layout.ensure_dir()?;
    let log = layout.log(1);

    let mut writer = LogWriter::create(&log)?;
    let mut offsets = Vec::with_capacity(count as usize);
    for n in 1..=count {
        offsets.push(writer.position());
        let payload = fixture_payload(n);
        let mut tables = WatermarkTables::default();
        tables
            .inputs
            .insert(FIXTURE_SOURCE.to_string(), Watermark::new(n as i64, n as i64));
        writer.append_record(FIXTURE_COMMITTER, n, &payload, &tables)?;
    }
    writer.flush()?;
    drop(writer);

    match damage {
        Damage::None => {}
        Damage::CorruptRecord(n) => {
            let mut bytes = fs::read(&log)?;
            let at = offsets[(n - 1) as usize] as usize + RecordHeader::SIZE;
            bytes[at] ^= 0x5A;
            fs::write(&log, bytes)?;
        }
        Damage::TruncateTail => {
            if let Some(&last) = offsets.last() {
                let file = fs::OpenOptions::new().write(true).open(&log)?;
                file.set_len(last + RecordHeader::SIZE as u64 / 2)?;
            }
        }
    }

    Ok(LogFixture { layout, log, offsets })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_reader::{LogReader, ReadOutcome};
    use tempfile::tempdir;

    #[test]
    fn test_fixture_generator() {
        let dir = tempdir().unwrap();
        let fixture = generate_log(dir.path(), 5, Damage::None).unwrap();
        assert!(fixture.log.exists());

        let reader = LogReader::open(&fixture.log).unwrap().expect_committer(FIXTURE_COMMITTER);
        let mut count = 0;
        for record in reader {
            let record = record.unwrap();
            count += 1;
            assert_eq!(record.header.write_seq_id, count);
            assert_eq!(record.payload, fixture_payload(count));
        }
        assert_eq!(count, 5);
    }

    #[test]
    fn test_corruption_stops_reader() {
        let dir = tempdir().unwrap();
        let fixture = generate_log(dir.path(), 5, Damage::CorruptRecord(5)).unwrap();
        let mut reader = LogReader::open(&fixture.log).unwrap();
        for _ in 0..4 {
            assert!(matches!(reader.next_record().unwrap(), ReadOutcome::Record(_)));
        }
        match reader.next_record().unwrap() {
            ReadOutcome::Torn { offset, .. } => assert_eq!(offset, fixture.offsets[4]),
            other => panic!("expected torn record, got {:?}", other),
        }

        let fixture = generate_log(dir.path(), 3, Damage::TruncateTail).unwrap();
        let reader = LogReader::open(&fixture.log).unwrap();
        let results: Vec<_> = reader.collect();
        assert_eq!(results.len(), 3);
        assert!(results[2].is_err());
    }
}
