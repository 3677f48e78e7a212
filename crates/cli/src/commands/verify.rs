// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::scan::{scan_log, LogScan, ScanEnd};
use std::path::Path;

/// Scan one log file. A torn record is reported as an error, together with
/// how much of the file is still good.
pub fn verify(log: &Path) -> anyhow::Result<LogScan> {
    let scan = scan_log(log)?;
    match &scan.end {
        ScanEnd::Clean => Ok(scan),
        ScanEnd::Torn { offset, reason } => anyhow::bail!(
            "{}: torn record at offset {} after {} good records ({})",
            log.display(),
            offset,
            scan.records.len(),
            reason
        ),
    }
}

pub fn run(log: &Path) -> anyhow::Result<()> {
    let scan = match verify(log) {
        Ok(scan) => scan,
        Err(e) => {
            println!("\n❌ TORN\n");
            return Err(e);
        }
    };
    println!("\n✅ VERIFIED\n");
    println!("Records:   {}", scan.records.len());
    if let Some(id) = scan.committer_id {
        println!("Committer: {:#010x}", id);
    }
    if let Some((lo, hi)) = scan.write_seq_range() {
        println!("Write seq: {}..={}", lo, hi);
    }
    println!("Bytes:     {}\n", scan.size);
    Ok(())
}
