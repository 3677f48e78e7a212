// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Read-only log scanning shared by the commands.
//!
//! A scan trusts the first record's committer id and then holds every
//! later record to it, the same way recovery does.

use ambrosia::wire;
use ambrosia_persistence::{LogReader, ReadOutcome, WatermarkTables};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub offset: u64,
    pub write_seq_id: u64,
    pub committer_id: u32,
    pub total_size: u32,
    /// Calls in the payload, if it parses as frames.
    pub calls: Option<i64>,
    /// Source or destination to `(seq, replayable seq)`.
    pub inputs: BTreeMap<String, (i64, i64)>,
    pub trims: BTreeMap<String, (i64, i64)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanEnd {
    Clean,
    Torn { offset: u64, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct LogScan {
    pub path: PathBuf,
    pub size: u64,
    pub committer_id: Option<u32>,
    pub records: Vec<RecordSummary>,
    pub end: ScanEnd,
}

impl LogScan {
    pub fn is_clean(&self) -> bool {
        self.end == ScanEnd::Clean
    }

    pub fn write_seq_range(&self) -> Option<(u64, u64)> {
        Some((self.records.first()?.write_seq_id, self.records.last()?.write_seq_id))
    }
}

fn table(map: &WatermarkTables, trims: bool) -> BTreeMap<String, (i64, i64)> {
    let source = if trims { &map.trims } else { &map.inputs };
    source
        .iter()
        .map(|(name, wm)| (name.clone(), (wm.seq, wm.replayable_seq)))
        .collect()
}

fn calls_in(payload: &[u8]) -> Option<i64> {
    let payload = Bytes::copy_from_slice(payload);
    let mut total = 0;
    for frame in wire::split_frames(&payload).ok()? {
        total += wire::count_calls(&frame).ok()?.0;
    }
    Some(total)
}

pub fn scan_log(path: &Path) -> anyhow::Result<LogScan> {
    let size = std::fs::metadata(path)?.len();
    let mut reader = LogReader::open(path)?;
    let mut records = Vec::new();
    let mut committer_id = None;

    let end = loop {
        match reader.next_record()? {
            ReadOutcome::Record(record) => {
                let expected = *committer_id.get_or_insert(record.header.committer_id);
                if record.header.committer_id != expected {
                    break ScanEnd::Torn {
                        offset: record.offset,
                        reason: format!(
                            "committer id {} does not match {}",
                            record.header.committer_id, expected
                        ),
                    };
                }
                records.push(RecordSummary {
                    offset: record.offset,
                    write_seq_id: record.header.write_seq_id,
                    committer_id: record.header.committer_id,
                    total_size: record.header.total_size,
                    calls: calls_in(&record.payload),
                    inputs: table(&record.tables, false),
                    trims: table(&record.tables, true),
                });
            }
            ReadOutcome::EndOfLog => break ScanEnd::Clean,
            ReadOutcome::Torn { offset, reason } => break ScanEnd::Torn { offset, reason },
        }
    };

    Ok(LogScan {
        path: path.to_path_buf(),
        size,
        committer_id,
        records,
        end,
    })
}
