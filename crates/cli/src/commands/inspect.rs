// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::scan::{scan_log, LogScan, ScanEnd};
use ambrosia::checkpoint::read_checkpoint;
use ambrosia_persistence::LogLayout;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub number: u64,
    pub size: u64,
    pub modified: Option<String>,
    pub committer_id: Option<u32>,
    pub next_write_seq: Option<u64>,
    pub inputs: usize,
    pub outputs: usize,
    pub service_bytes: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirReport {
    pub service: String,
    pub checkpoints: Vec<CheckpointSummary>,
    pub logs: Vec<(u64, LogScan)>,
}

/// `<service>_<version>` -> `service`.
pub fn service_from_dir(dir: &Path) -> Option<String> {
    let name = dir.file_name()?.to_str()?;
    let (service, version) = name.rsplit_once('_')?;
    version.parse::<i64>().ok()?;
    Some(service.to_string())
}

fn modified(path: &Path) -> Option<String> {
    let time = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(chrono::DateTime::<chrono::Local>::from(time).to_rfc3339())
}

fn summarize_checkpoint(layout: &LogLayout, number: u64) -> CheckpointSummary {
    let path = layout.checkpoint(number);
    let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let mut summary = CheckpointSummary {
        number,
        size,
        modified: modified(&path),
        committer_id: None,
        next_write_seq: None,
        inputs: 0,
        outputs: 0,
        service_bytes: 0,
        error: None,
    };
    match read_checkpoint(&path) {
        Ok(checkpoint) => {
            summary.committer_id = Some(checkpoint.image.committer.committer_id);
            summary.next_write_seq = Some(checkpoint.image.committer.next_write_seq);
            summary.inputs = checkpoint.image.inputs.len();
            summary.outputs = checkpoint.image.outputs.len();
            summary.service_bytes = checkpoint.service_state.len();
        }
        // An empty file is a checkpoint that was locked but never written.
        Err(e) => summary.error = Some(if size == 0 { "empty".to_string() } else { e.to_string() }),
    }
    summary
}

pub fn inspect(dir: &Path, service: Option<String>) -> anyhow::Result<DirReport> {
    let service = match service {
        Some(service) => service,
        None => service_from_dir(dir).ok_or_else(|| {
            anyhow::anyhow!("cannot tell the service from {:?}, pass --service", dir)
        })?,
    };
    if !dir.is_dir() {
        anyhow::bail!("{:?} is not a directory", dir);
    }
    let layout = LogLayout::at(dir, &service);

    let checkpoints = layout
        .checkpoint_numbers()?
        .into_iter()
        .map(|n| summarize_checkpoint(&layout, n))
        .collect();
    let mut logs = Vec::new();
    for n in layout.log_numbers()? {
        logs.push((n, scan_log(&layout.log(n))?));
    }
    Ok(DirReport {
        service,
        checkpoints,
        logs,
    })
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn watermarks(map: &std::collections::BTreeMap<String, (i64, i64)>) -> String {
    map.iter()
        .map(|(name, (seq, repl))| format!("{}:{}/{}", name, seq, repl))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn run(dir: &Path, service: Option<String>, records: bool, json: bool) -> anyhow::Result<()> {
    let report = inspect(dir, service)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("\nAmbrosia log directory: {} ({})", dir.display(), report.service);
    println!("------------------------");

    let mut table = new_table(vec!["Checkpoint", "Bytes", "Committer", "Next Seq", "Inputs", "Outputs", "Service Bytes", "Modified"]);
    for c in &report.checkpoints {
        match &c.error {
            Some(err) => {
                table.add_row(vec![c.number.to_string(), c.size.to_string(), format!("UNREADABLE: {}", err)]);
            }
            None => {
                table.add_row(vec![
                    c.number.to_string(),
                    c.size.to_string(),
                    c.committer_id.map(|id| format!("{:#010x}", id)).unwrap_or_default(),
                    or_dash(c.next_write_seq),
                    c.inputs.to_string(),
                    c.outputs.to_string(),
                    c.service_bytes.to_string(),
                    or_dash(c.modified.clone()),
                ]);
            }
        }
    }
    println!("{table}\n");

    let mut table = new_table(vec!["Log", "Bytes", "Records", "Write Seqs", "Status"]);
    for (n, scan) in &report.logs {
        let seqs = scan
            .write_seq_range()
            .map(|(lo, hi)| format!("{}..={}", lo, hi))
            .unwrap_or_else(|| "-".to_string());
        let status = match &scan.end {
            ScanEnd::Clean => "OK".to_string(),
            ScanEnd::Torn { offset, reason } => format!("TORN at {}: {}", offset, reason),
        };
        table.add_row(vec![n.to_string(), scan.size.to_string(), scan.records.len().to_string(), seqs, status]);
    }
    println!("{table}\n");

    if records {
        for (n, scan) in &report.logs {
            let mut table = new_table(vec!["Offset", "Write Seq", "Committer", "Size", "Calls", "Inputs", "Trims"]);
            for r in &scan.records {
                table.add_row(vec![
                    r.offset.to_string(),
                    r.write_seq_id.to_string(),
                    format!("{:#010x}", r.committer_id),
                    r.total_size.to_string(),
                    or_dash(r.calls),
                    watermarks(&r.inputs),
                    watermarks(&r.trims),
                ]);
            }
            println!("Log {}", n);
            println!("{table}\n");
        }
    }
    Ok(())
}
